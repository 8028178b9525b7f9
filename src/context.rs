//! Per-user context appended to the refinement prompt.
//!
//! Document storage and search live outside this crate; the pipeline only
//! asks a [`ContextRetriever`] for text to add.

use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn get_context_for_query(&self, question: &str, user_id: &str) -> Result<Option<String>>;
}

/// Never returns context.
pub struct NoContext;

#[async_trait]
impl ContextRetriever for NoContext {
    async fn get_context_for_query(&self, _question: &str, _user_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_context() {
        assert!(NoContext
            .get_context_for_query("anything", "u1")
            .await
            .unwrap()
            .is_none());
    }
}
