//! Sentence embedders.

use super::Embedding;
use crate::error::{Nl2SqlError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

const DUMMY_API_KEY: &str = "dummy-api-key";
const BATCH_SIZE: usize = 64;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifies the model; part of every cache key.
    fn model_id(&self) -> &str;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

/// Deterministic feature-hashing embedder over word unigrams and bigrams.
///
/// Used offline and in dummy mode; vectors are L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_id: format!("hashing-{}", dimension),
        }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut index = [0u8; 8];
        index.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(index) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }

    pub fn embed_one(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        let words: Vec<String> = text.split_whitespace().map(|w| w.to_lowercase()).collect();
        for word in &words {
            let (bucket, sign) = self.bucket(word);
            vector[bucket] += sign;
        }
        for pair in words.windows(2) {
            let (bucket, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[bucket] += 0.5 * sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// OpenAI-compatible `/embeddings` client.
pub struct OpenAiEmbedder {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
    fallback: HashingEmbedder,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
            fallback: HashingEmbedder::default(),
        }
    }

    fn is_dummy(&self) -> bool {
        self.api_key == DUMMY_API_KEY
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Embedding>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": batch,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Nl2SqlError::Embedding(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Nl2SqlError::Embedding(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response.json().await.map_err(|e| {
            Nl2SqlError::Embedding(format!("Failed to parse embedding response: {}", e))
        })?;

        let data = response_json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Nl2SqlError::Embedding("No embedding data in response".to_string()))?;

        let mut rows: Vec<(usize, Embedding)> = Vec::with_capacity(data.len());
        for (position, item) in data.iter().enumerate() {
            let index = item
                .get("index")
                .and_then(|i| i.as_u64())
                .map_or(position, |i| i as usize);
            let embedding: Embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    Nl2SqlError::Embedding("No embedding vector in response".to_string())
                })?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            rows.push((index, embedding));
        }
        rows.sort_by_key(|(index, _)| *index);

        if rows.len() != batch.len() {
            return Err(Nl2SqlError::Embedding(format!(
                "Expected {} embeddings, got {}",
                batch.len(),
                rows.len()
            )));
        }
        Ok(rows.into_iter().map(|(_, e)| e).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        if self.is_dummy() {
            self.fallback.model_id()
        } else {
            &self.model
        }
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if self.is_dummy() {
            return self.fallback.embed(texts).await;
        }

        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(BATCH_SIZE) {
            debug!("Embedding batch of {} texts with {}", batch.len(), self.model);
            embeddings.extend(self.embed_batch(batch).await?);
        }
        Ok(embeddings)
    }
}
