use crate::config::{LlmConfig, DUMMY_API_KEY};
use crate::error::{Nl2SqlError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String>;
}

/// OpenAI-compatible chat completions client.
pub struct LlmClient {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_tokens: 1000,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        let mut client = Self::new(
            config.api_key.clone(),
            config.model.clone(),
            config.base_url.clone(),
        );
        client.max_tokens = config.max_tokens;
        client
    }

    async fn call_llm(&self, prompt: &str, temperature: f32) -> Result<String> {
        // Offline mode answers with a fixed query so the pipeline can be exercised without a key
        if self.api_key == DUMMY_API_KEY {
            return Ok("```sql\nSELECT 1\n```".to_string());
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You are a SQLite expert. Answer with a single SQL query."},
                {"role": "user", "content": prompt}
            ],
            "temperature": temperature,
            "max_tokens": self.max_tokens,
            "stream": false
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Nl2SqlError::LlmTransport(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response.json().await.map_err(|e| {
            Nl2SqlError::LlmTransport(format!("Failed to parse LLM response ({}): {}", status, e))
        })?;

        if let Some(error) = response_json.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(Nl2SqlError::LlmTransport(format!(
                    "LLM API error ({}): {}",
                    status, message
                )));
            }
            return Err(Nl2SqlError::Llm(format!("LLM API error ({}): {}", status, message)));
        }
        if !status.is_success() {
            return Err(Nl2SqlError::LlmTransport(format!("LLM API returned {}", status)));
        }

        let choice = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| Nl2SqlError::LlmTransport("No choices in LLM response".to_string()))?;

        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            if reason == "length" {
                warn!("LLM response truncated at {} tokens", self.max_tokens);
            }
        }

        let content = choice["message"]["content"]
            .as_str()
            .ok_or_else(|| Nl2SqlError::LlmTransport("No content in LLM response".to_string()))?;
        if content.trim().is_empty() {
            return Err(Nl2SqlError::Llm("LLM returned empty content".to_string()));
        }

        debug!("LLM answered with {} characters", content.len());
        Ok(content.to_string())
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String> {
        self.call_llm(prompt, temperature).await
    }
}

/// Attempts, fixed backoff and which errors are worth another attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
    pub retryable: fn(&Nl2SqlError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            retryable: is_transient,
        }
    }
}

/// Transport failures and malformed responses.
pub fn is_transient(error: &Nl2SqlError) -> bool {
    matches!(error, Nl2SqlError::LlmTransport(_) | Nl2SqlError::Json(_))
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: is_transient,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.max_attempts, config.backoff())
    }
}

/// Applies a [`RetryPolicy`] around another model.
pub struct RetryingModel<M> {
    inner: M,
    policy: RetryPolicy,
}

impl<M: LanguageModel> RetryingModel<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

#[async_trait]
impl<M: LanguageModel> LanguageModel for RetryingModel<M> {
    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String> {
        let mut attempt = 1;
        loop {
            match self.inner.generate(prompt, temperature).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.policy.max_attempts && (self.policy.retryable)(&e) => {
                    warn!(
                        "LLM attempt {} of {} failed: {}",
                        attempt, self.policy.max_attempts, e
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        error: fn() -> Nl2SqlError,
    }

    #[async_trait]
    impl LanguageModel for Flaky {
        async fn generate(&self, _prompt: &str, _temperature: f32) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err((self.error)())
            } else {
                Ok("SELECT 1".to_string())
            }
        }
    }

    fn transport() -> Nl2SqlError {
        Nl2SqlError::LlmTransport("connection reset".to_string())
    }

    fn fatal() -> Nl2SqlError {
        Nl2SqlError::Llm("invalid api key".to_string())
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let model = RetryingModel::new(
            Flaky {
                failures: 2,
                calls: AtomicUsize::new(0),
                error: transport,
            },
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        assert_eq!(model.generate("q", 0.0).await.unwrap(), "SELECT 1");
        assert_eq!(model.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let model = RetryingModel::new(
            Flaky {
                failures: 5,
                calls: AtomicUsize::new(0),
                error: transport,
            },
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        assert!(matches!(
            model.generate("q", 0.0).await,
            Err(Nl2SqlError::LlmTransport(_))
        ));
        assert_eq!(model.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_fatal_errors() {
        let model = RetryingModel::new(
            Flaky {
                failures: 1,
                calls: AtomicUsize::new(0),
                error: fatal,
            },
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        assert!(model.generate("q", 0.0).await.is_err());
        assert_eq!(model.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dummy_client() {
        let client = LlmClient::new(
            DUMMY_API_KEY.to_string(),
            "deepseek-chat".to_string(),
            "https://api.deepseek.com".to_string(),
        );
        assert!(client.generate("anything", 0.0).await.unwrap().contains("SELECT 1"));
    }
}
