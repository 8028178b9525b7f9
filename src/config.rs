//! Runtime configuration from `.env`/environment variables or a JSON file.

use crate::error::{Nl2SqlError, Result};
use crate::masking::{DEFAULT_MASK_TAG, DEFAULT_VALUE_TAG};
use crate::selector::SelectorKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DUMMY_API_KEY: &str = "dummy-api-key";

/// How schemas are described to the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaRenderMode {
    /// `CREATE TABLE` statements inside SQL comments.
    #[default]
    Ddl,
    /// `# table(col, col)` lines.
    TableList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub schema_render_mode: SchemaRenderMode,
    /// Examples stop being added once the estimate would exceed this.
    pub max_prompt_tokens: usize,
    /// End prompts with a bare `SELECT ` for completion-style models.
    pub completion_cue: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            schema_render_mode: SchemaRenderMode::Ddl,
            max_prompt_tokens: 65_000,
            completion_cue: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_attempts: usize,
    pub backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: DUMMY_API_KEY.to_string(),
            model: "deepseek-chat".to_string(),
            base_url: "https://api.deepseek.com".to_string(),
            max_tokens: 1000,
            temperature: 0.0,
            max_attempts: 3,
            backoff_ms: 1000,
        }
    }
}

impl LlmConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    /// `hashing` selects the offline embedder.
    pub model: String,
    pub base_url: String,
    pub persist_target_embeddings: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: DUMMY_API_KEY.to_string(),
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            persist_target_embeddings: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Nl2SqlConfig {
    pub corpus_path: PathBuf,
    pub tables_path: Option<PathBuf>,
    pub db_dir: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub num_example: usize,
    pub cross_domain: bool,
    pub stage_a_selector: SelectorKind,
    pub stage_b_selector: SelectorKind,
    pub mask_tag: String,
    pub value_tag: String,
    pub max_invalid_retries: usize,
    pub prompt: PromptConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
}

impl Default for Nl2SqlConfig {
    fn default() -> Self {
        Self {
            corpus_path: PathBuf::from("data/train.json"),
            tables_path: None,
            db_dir: None,
            cache_dir: PathBuf::from(".nl2sql_cache"),
            num_example: 9,
            cross_domain: false,
            stage_a_selector: SelectorKind::default_stage_a(),
            stage_b_selector: SelectorKind::default_stage_b(),
            mask_tag: DEFAULT_MASK_TAG.to_string(),
            value_tag: DEFAULT_VALUE_TAG.to_string(),
            max_invalid_retries: 3,
            prompt: PromptConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Nl2SqlError::Config(format!("Invalid {}='{}': {}", name, raw, e))),
        None => Ok(None),
    }
}

fn env_selector(name: &str) -> Result<Option<SelectorKind>> {
    match env_var(name) {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Nl2SqlError::Config(format!("Invalid {}: {}", name, e))),
        None => Ok(None),
    }
}

impl Nl2SqlConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Nl2SqlError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: Self = serde_json::from_str(&content).map_err(|e| {
            Nl2SqlError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.apply_secrets_from_env();
        Ok(config)
    }

    /// Defaults overridden by environment variables (call `dotenv` first).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_var("NL2SQL_CORPUS_PATH") {
            config.corpus_path = PathBuf::from(v);
        }
        config.tables_path = env_var("NL2SQL_TABLES_PATH").map(PathBuf::from);
        config.db_dir = env_var("NL2SQL_DB_DIR").map(PathBuf::from);
        if let Some(v) = env_var("NL2SQL_CACHE_DIR") {
            config.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse("NL2SQL_NUM_EXAMPLE")? {
            config.num_example = v;
        }
        if let Some(v) = env_parse("NL2SQL_CROSS_DOMAIN")? {
            config.cross_domain = v;
        }
        if let Some(v) = env_parse("NL2SQL_MAX_PROMPT_TOKENS")? {
            config.prompt.max_prompt_tokens = v;
        }
        if let Some(v) = env_var("NL2SQL_SCHEMA_RENDER_MODE") {
            config.prompt.schema_render_mode = match v.to_lowercase().as_str() {
                "ddl" => SchemaRenderMode::Ddl,
                "table_list" | "tablelist" => SchemaRenderMode::TableList,
                other => {
                    return Err(Nl2SqlError::Config(format!(
                        "Unknown NL2SQL_SCHEMA_RENDER_MODE '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(v) = env_selector("NL2SQL_STAGE_A_SELECTOR")? {
            config.stage_a_selector = v;
        }
        if let Some(v) = env_selector("NL2SQL_STAGE_B_SELECTOR")? {
            config.stage_b_selector = v;
        }

        if let Some(v) = env_var("OPENAI_MODEL") {
            config.llm.model = v;
        }
        if let Some(v) = env_var("OPENAI_BASE_URL") {
            config.llm.base_url = v.clone();
            config.embedding.base_url = v;
        }
        if let Some(v) = env_parse("NL2SQL_TEMPERATURE")? {
            config.llm.temperature = v;
        }
        if let Some(v) = env_var("NL2SQL_EMBEDDING_MODEL") {
            config.embedding.model = v;
        }
        if let Some(v) = env_var("NL2SQL_EMBEDDING_BASE_URL") {
            config.embedding.base_url = v;
        }
        if let Some(v) = env_parse("NL2SQL_PERSIST_TARGET_EMBEDDINGS")? {
            config.embedding.persist_target_embeddings = v;
        }

        config.apply_secrets_from_env();
        Ok(config)
    }

    fn apply_secrets_from_env(&mut self) {
        if let Some(key) = env_var("OPENAI_API_KEY") {
            self.llm.api_key = key.clone();
            self.embedding.api_key = key;
        }
        if let Some(key) = env_var("NL2SQL_EMBEDDING_API_KEY") {
            self.embedding.api_key = key;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::CorpusKey;

    #[test]
    fn test_defaults() {
        let config = Nl2SqlConfig::default();
        assert_eq!(config.num_example, 9);
        assert_eq!(config.llm.max_attempts, 3);
        assert_eq!(config.llm.backoff(), Duration::from_secs(1));
        assert_eq!(config.prompt.schema_render_mode, SchemaRenderMode::Ddl);
        assert_eq!(config.stage_a_selector, SelectorKind::EuclideanDistanceQuestionMask);
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "num_example": 4,
                "prompt": {"schema_render_mode": "table_list"},
                "stage_b_selector": {"type": "skeleton_similarity_plus", "question": "raw", "skeleton": "pre_skeleton"}
            }"#,
        )
        .unwrap();

        let config = Nl2SqlConfig::load(&path).unwrap();
        assert_eq!(config.num_example, 4);
        assert_eq!(config.prompt.schema_render_mode, SchemaRenderMode::TableList);
        assert_eq!(config.prompt.max_prompt_tokens, 65_000);
        assert!(matches!(
            config.stage_b_selector,
            SelectorKind::SkeletonSimilarityPlus {
                question: CorpusKey::Raw,
                ..
            }
        ));
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let mut config = Nl2SqlConfig::default();
        config.llm.api_key = "sk-secret".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
    }
}
