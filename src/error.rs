use thiserror::Error;

#[derive(Error, Debug)]
pub enum Nl2SqlError {
    #[error("Corpus error: {0}")]
    Corpus(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Probe connection error: {0}")]
    ProbeConnection(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Embedding cache error: {0}")]
    Cache(String),

    #[error("LLM transport error: {0}")]
    LlmTransport(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Could not generate SQL: {0}")]
    Generation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Nl2SqlError>;
