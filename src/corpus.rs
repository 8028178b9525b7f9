//! Training corpus of (question, SQL) pairs with their links and skeletons.
//!
//! Examples are identified by their position; cached embedding matrices are
//! row-aligned with `TrainingCorpus::examples`, so ordering is never changed
//! after load.

use crate::error::{Nl2SqlError, Result};
use crate::linking::tokenize::tokenize_question;
use crate::linking::{self, CellValueLinkResult, SchemaLinkResult, ValueProbe, ValueProbeProvider};
use crate::masking::QuestionMasker;
use crate::schema::SchemaCatalog;
use crate::skeleton::{to_skeleton, SkeletonExtractor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub db_id: String,
    pub question: String,
    #[serde(default, alias = "question_toks")]
    pub question_tokens: Vec<String>,
    /// Stored without its leading `SELECT`.
    #[serde(alias = "query")]
    pub sql_query: String,
    #[serde(default)]
    pub query_skeleton: String,
    #[serde(default)]
    pub pre_skeleton: String,
    #[serde(default)]
    pub sc_link: SchemaLinkResult,
    #[serde(default)]
    pub cv_link: CellValueLinkResult,
}

impl TrainingExample {
    pub fn new(db_id: &str, question: &str, sql: &str) -> Self {
        let mut example = Self {
            db_id: db_id.to_string(),
            question: question.to_string(),
            question_tokens: Vec::new(),
            sql_query: sql.to_string(),
            query_skeleton: String::new(),
            pre_skeleton: String::new(),
            sc_link: SchemaLinkResult::default(),
            cv_link: CellValueLinkResult::default(),
        };
        example.normalize();
        example
    }

    /// The SQL as it should be executed, with `SELECT` restored.
    pub fn full_sql(&self) -> String {
        format!("SELECT {}", self.sql_query)
    }

    fn normalize(&mut self) {
        self.sql_query = strip_leading_select(&self.sql_query).to_string();
        if self.question_tokens.is_empty() {
            self.question_tokens = tokenize_question(&self.question);
        } else {
            // stored links index these positions, so only the case changes
            for token in &mut self.question_tokens {
                *token = token.to_lowercase();
            }
        }
        if self.query_skeleton.is_empty() {
            self.query_skeleton = to_skeleton(&self.full_sql(), None);
        }
        if self.pre_skeleton.is_empty() {
            self.pre_skeleton = self.query_skeleton.clone();
        }
    }
}

/// Remove one leading `SELECT` keyword (any case).
pub fn strip_leading_select(sql: &str) -> &str {
    let trimmed = sql.trim();
    match trimmed.get(..6) {
        Some(head) if head.eq_ignore_ascii_case("select") => {
            let rest = &trimmed[6..];
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                rest.trim_start()
            } else {
                trimmed
            }
        }
        _ => trimmed,
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainingCorpus {
    examples: Vec<TrainingExample>,
}

impl TrainingCorpus {
    pub fn from_examples(examples: Vec<TrainingExample>) -> Self {
        let examples = examples
            .into_iter()
            .map(|mut e| {
                e.normalize();
                e
            })
            .collect();
        Self { examples }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Nl2SqlError::Corpus(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let examples: Vec<TrainingExample> = serde_json::from_str(&content).map_err(|e| {
            Nl2SqlError::Corpus(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        let corpus = Self::from_examples(examples);
        info!("Loaded {} training examples from {}", corpus.len(), path.display());
        Ok(corpus)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.examples)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Recompute tokens, links and schema-aware skeletons for every example.
    ///
    /// Examples whose database is missing from the catalog keep their stored links.
    pub fn preprocess(
        &mut self,
        catalog: &SchemaCatalog,
        probes: Option<&dyn ValueProbeProvider>,
    ) -> usize {
        let mut connections: HashMap<String, Option<Box<dyn ValueProbe>>> = HashMap::new();
        let mut updated = 0;

        for example in &mut self.examples {
            let Some(schema) = catalog.get(&example.db_id) else {
                warn!("No schema for {}, keeping stored links", example.db_id);
                continue;
            };
            let probe = connections
                .entry(example.db_id.clone())
                .or_insert_with(|| match probes.map(|p| p.connect(&example.db_id)) {
                    Some(Ok(probe)) => Some(probe),
                    Some(Err(e)) => {
                        warn!("Value probe unavailable for {}: {}", example.db_id, e);
                        None
                    }
                    None => None,
                });

            let linked = linking::link_question(
                tokenize_question(&example.question),
                &schema,
                probe.as_deref(),
            );
            example.question_tokens = linked.tokens;
            example.sc_link = linked.sc_link;
            example.cv_link = linked.cv_link;
            example.query_skeleton = SkeletonExtractor::for_schema(&schema).to_skeleton(&example.full_sql());
            example.pre_skeleton = example.query_skeleton.clone();
            updated += 1;
        }

        info!("Preprocessed {} of {} examples", updated, self.examples.len());
        updated
    }

    /// Rebuild gold skeletons with each example's schema, the way draft skeletons are built.
    ///
    /// Schema columns named like keywords (`count`, `date`) otherwise survive
    /// as keywords on one side only. A `pre_skeleton` still equal to the old
    /// `query_skeleton` follows it. Returns the number of examples changed.
    pub fn apply_schema_skeletons(&mut self, catalog: &SchemaCatalog) -> usize {
        let mut extractors: HashMap<String, Option<SkeletonExtractor>> = HashMap::new();
        let mut changed = 0;

        for example in &mut self.examples {
            let extractor = extractors
                .entry(example.db_id.clone())
                .or_insert_with(|| catalog.get(&example.db_id).map(|s| SkeletonExtractor::for_schema(&s)));
            let Some(extractor) = extractor else {
                continue;
            };
            let skeleton = extractor.to_skeleton(&example.full_sql());
            if skeleton == example.query_skeleton {
                continue;
            }
            if example.pre_skeleton == example.query_skeleton {
                example.pre_skeleton = skeleton.clone();
            }
            example.query_skeleton = skeleton;
            changed += 1;
        }

        if changed > 0 {
            debug!("Rebuilt {} skeletons against their schemas", changed);
        }
        changed
    }

    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }

    pub fn get(&self, index: usize) -> Option<&TrainingExample> {
        self.examples.get(index)
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn raw_questions(&self) -> Vec<String> {
        self.examples.iter().map(|e| e.question.clone()).collect()
    }

    pub fn masked_questions(&self, masker: &QuestionMasker) -> Vec<String> {
        self.examples
            .iter()
            .map(|e| masker.mask_question(&e.question_tokens, &e.sc_link, &e.cv_link))
            .collect()
    }
}
