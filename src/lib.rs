pub mod config;
pub mod context;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod linking;
pub mod llm;
pub mod masking;
pub mod pipeline;
pub mod prompt;
pub mod schema;
pub mod selector;
pub mod skeleton;

pub use config::Nl2SqlConfig;
pub use error::{Nl2SqlError, Result};
pub use pipeline::{Nl2SqlPipeline, Nl2SqlResponse, PipelineStage};
