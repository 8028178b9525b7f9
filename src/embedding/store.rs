//! Process-wide embedding store.
//!
//! Corpus matrices are cached on disk under a name derived from a SHA-256 of
//! the embedder model and every embedded text, so a changed corpus never
//! reuses stale rows. Target (live question) embeddings are keyed by their
//! own hash and memoized in memory; persisting them is optional.

use super::cache_file::{read_matrix, write_matrix};
use super::{Embedder, Embedding};
use crate::corpus::TrainingCorpus;
use crate::error::{Nl2SqlError, Result};
use crate::masking::QuestionMasker;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TARGET_MEMO_LIMIT: usize = 4096;

/// Which question text a corpus matrix embeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusKey {
    Raw,
    Masked,
}

impl CorpusKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorpusKey::Raw => "raw",
            CorpusKey::Masked => "masked",
        }
    }
}

pub struct EmbeddingStore {
    embedder: Arc<dyn Embedder>,
    cache_dir: PathBuf,
    persist_targets: bool,
    corpus_memo: DashMap<String, Arc<Vec<Embedding>>>,
    target_memo: DashMap<String, Embedding>,
    write_lock: Mutex<()>,
}

impl EmbeddingStore {
    pub fn new(embedder: Arc<dyn Embedder>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            embedder,
            cache_dir: cache_dir.into(),
            persist_targets: false,
            corpus_memo: DashMap::new(),
            target_memo: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Also write target embeddings to `target-<hash>.emb`.
    pub fn with_persisted_targets(mut self, persist: bool) -> Self {
        self.persist_targets = persist;
        self
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn corpus_hash(&self, key: CorpusKey, texts: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.embedder.model_id().as_bytes());
        hasher.update([0u8]);
        hasher.update(key.as_str().as_bytes());
        for text in texts {
            hasher.update([0u8]);
            hasher.update(text.as_bytes());
        }
        hex::encode(hasher.finalize())[..16].to_string()
    }

    fn target_hash(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.embedder.model_id().as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    pub fn corpus_cache_path(&self, key: CorpusKey, texts: &[String]) -> PathBuf {
        self.cache_dir
            .join(format!("corpus-{}-{}.emb", key.as_str(), self.corpus_hash(key, texts)))
    }

    pub fn target_cache_path(&self, text: &str) -> PathBuf {
        self.cache_dir
            .join(format!("target-{}.emb", self.target_hash(text)))
    }

    /// Embeddings row-aligned with `texts`, from memory, disk or the embedder.
    ///
    /// A cache file that is unreadable or has the wrong row count is
    /// discarded and overwritten.
    pub async fn corpus_embeddings(
        &self,
        key: CorpusKey,
        texts: &[String],
    ) -> Result<Arc<Vec<Embedding>>> {
        if texts.is_empty() {
            return Ok(Arc::new(Vec::new()));
        }
        let hash = self.corpus_hash(key, texts);
        if let Some(hit) = self.corpus_memo.get(&hash) {
            return Ok(Arc::clone(hit.value()));
        }

        let _guard = self.write_lock.lock().await;
        if let Some(hit) = self.corpus_memo.get(&hash) {
            return Ok(Arc::clone(hit.value()));
        }

        let path = self.corpus_cache_path(key, texts);
        if path.exists() {
            match read_matrix(&path) {
                Ok(rows) if rows.len() == texts.len() => {
                    debug!("Loaded {} corpus embeddings from {}", rows.len(), path.display());
                    let rows = Arc::new(rows);
                    self.corpus_memo.insert(hash, Arc::clone(&rows));
                    return Ok(rows);
                }
                Ok(rows) => warn!(
                    "Embedding cache {} has {} rows for {} examples, recomputing",
                    path.display(),
                    rows.len(),
                    texts.len()
                ),
                Err(e) => warn!("Discarding unreadable embedding cache: {}", e),
            }
        }

        info!(
            "Computing {} {} corpus embeddings with {}",
            texts.len(),
            key.as_str(),
            self.embedder.model_id()
        );
        let rows = self.embedder.embed(texts).await?;
        if rows.len() != texts.len() {
            return Err(Nl2SqlError::Embedding(format!(
                "Embedder returned {} vectors for {} texts",
                rows.len(),
                texts.len()
            )));
        }
        if let Err(e) = write_matrix(&path, &rows) {
            warn!("Could not persist embedding cache {}: {}", path.display(), e);
        }

        let rows = Arc::new(rows);
        self.corpus_memo.insert(hash, Arc::clone(&rows));
        Ok(rows)
    }

    pub async fn target_embedding(&self, text: &str) -> Result<Embedding> {
        let hash = self.target_hash(text);
        if let Some(hit) = self.target_memo.get(&hash) {
            return Ok(hit.value().clone());
        }

        let path = self.target_cache_path(text);
        if self.persist_targets && path.exists() {
            match read_matrix(&path) {
                Ok(mut rows) if rows.len() == 1 => {
                    let embedding = rows.remove(0);
                    self.remember_target(hash, embedding.clone());
                    return Ok(embedding);
                }
                Ok(_) => warn!("Target cache {} has wrong shape, recomputing", path.display()),
                Err(e) => warn!("Discarding unreadable target cache: {}", e),
            }
        }

        let embedding = self
            .embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Nl2SqlError::Embedding("Embedder returned no vector".to_string()))?;

        if self.persist_targets {
            if let Err(e) = write_matrix(&path, std::slice::from_ref(&embedding)) {
                warn!("Could not persist target embedding {}: {}", path.display(), e);
            }
        }
        self.remember_target(hash, embedding.clone());
        Ok(embedding)
    }

    fn remember_target(&self, hash: String, embedding: Embedding) {
        if self.target_memo.len() >= TARGET_MEMO_LIMIT {
            self.target_memo.clear();
        }
        self.target_memo.insert(hash, embedding);
    }

    /// Precompute both corpus matrices so no request pays for the first write.
    pub async fn warm_up(&self, corpus: &TrainingCorpus, masker: &QuestionMasker) -> Result<()> {
        self.corpus_embeddings(CorpusKey::Raw, &corpus.raw_questions())
            .await?;
        self.corpus_embeddings(CorpusKey::Masked, &corpus.masked_questions(masker))
            .await?;
        info!("Embedding store warmed for {} examples", corpus.len());
        Ok(())
    }

    /// Remove persisted target embeddings older than `max_age`.
    pub fn cleanup_stale_targets(&self, max_age: Duration) -> Result<usize> {
        if !self.cache_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.starts_with("target-") && name.ends_with(".emb")) {
                continue;
            }
            let age = entry
                .metadata()?
                .modified()?
                .elapsed()
                .unwrap_or(Duration::ZERO);
            if age > max_age {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} stale target embeddings", removed);
        }
        Ok(removed)
    }
}
