//! Two-stage NL2SQL orchestration.
//!
//! Stage A links and masks the question, retrieves question-mask neighbours
//! and asks the model for a draft. Stage B reduces the draft to a skeleton,
//! retrieves skeleton-similar examples and asks again for the final query.

use crate::config::Nl2SqlConfig;
use crate::context::{ContextRetriever, NoContext};
use crate::corpus::TrainingCorpus;
use crate::embedding::{Embedder, EmbeddingStore, HashingEmbedder, OpenAiEmbedder};
use crate::error::{Nl2SqlError, Result};
use crate::linking::tokenize::tokenize_question;
use crate::linking::{link_with_provider, LinkedQuestion, SqliteProbeProvider, ValueProbeProvider};
use crate::llm::{LanguageModel, LlmClient, RetryPolicy, RetryingModel};
use crate::masking::QuestionMasker;
use crate::prompt::PromptBuilder;
use crate::schema::SchemaCatalog;
use crate::selector::{ExampleSelector, SelectedExample, SelectionTarget, SelectorFactory};
use crate::skeleton::to_skeleton;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Location, Token, Tokenizer, Whitespace};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

lazy_static! {
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```[A-Za-z]*[ \t]*\n?(.*?)```").unwrap();
    static ref BLOCK_COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/").unwrap();
    static ref LINE_COMMENT: Regex = Regex::new(r"--[^\n]*").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref DOUBLE_SELECT: Regex = Regex::new(r"(?i)^select\s+select\b").unwrap();
    static ref STARTS_WITH_SELECT: Regex = Regex::new(r"(?i)^select\b").unwrap();
    static ref STARTS_WITH_QUERY: Regex = Regex::new(r"(?i)^(select|with)\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Start,
    MaskedLinked,
    DraftGenerated,
    SkeletonExtracted,
    Refined,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Start => "START",
            PipelineStage::MaskedLinked => "MASKED_LINKED",
            PipelineStage::DraftGenerated => "DRAFT_GENERATED",
            PipelineStage::SkeletonExtracted => "SKELETON_EXTRACTED",
            PipelineStage::Refined => "REFINED",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of one request. `sql` is `None` when generation failed, in
/// which case `explanation` says why.
#[derive(Debug, Clone, Serialize)]
pub struct Nl2SqlResponse {
    pub request_id: String,
    pub db_id: String,
    pub question: String,
    pub stage: PipelineStage,
    pub sql: Option<String>,
    pub explanation: Option<String>,
    pub masked_question: Option<String>,
    pub draft_sql: Option<String>,
    pub pre_skeleton: Option<String>,
    /// Corpus positions of the few-shot examples, in prompt order.
    pub example_indexes: Vec<usize>,
    pub generated_at: DateTime<Utc>,
}

impl Nl2SqlResponse {
    fn new(request_id: String, question: &str, db_id: &str) -> Self {
        Self {
            request_id,
            db_id: db_id.to_string(),
            question: question.to_string(),
            stage: PipelineStage::Start,
            sql: None,
            explanation: None,
            masked_question: None,
            draft_sql: None,
            pre_skeleton: None,
            example_indexes: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    fn advance(&mut self, stage: PipelineStage) {
        info!("{} -> {}", self.stage, stage);
        self.stage = stage;
    }

    fn failed(mut self, reason: impl Into<String>) -> Self {
        let explanation = Nl2SqlError::Generation(reason.into()).to_string();
        warn!("Stopping at {}: {}", self.stage, explanation);
        self.explanation = Some(explanation);
        self.generated_at = Utc::now();
        self
    }
}

/// Catalog from `tables_path` when set, otherwise by introspecting `db_dir`.
pub fn load_catalog(config: &Nl2SqlConfig) -> Result<SchemaCatalog> {
    if let Some(path) = &config.tables_path {
        return SchemaCatalog::load_tables_json(path);
    }
    if let Some(dir) = &config.db_dir {
        return SchemaCatalog::introspect_dir(dir);
    }
    warn!("Neither a tables file nor a database directory is configured; prompts will carry no schema");
    Ok(SchemaCatalog::new())
}

pub struct Nl2SqlPipeline {
    config: Nl2SqlConfig,
    catalog: Arc<SchemaCatalog>,
    corpus: Arc<TrainingCorpus>,
    store: Arc<EmbeddingStore>,
    masker: QuestionMasker,
    stage_a: Arc<dyn ExampleSelector>,
    stage_b: Arc<dyn ExampleSelector>,
    prompts: PromptBuilder,
    llm: Arc<dyn LanguageModel>,
    probes: Option<Arc<dyn ValueProbeProvider>>,
    context: Arc<dyn ContextRetriever>,
}

impl Nl2SqlPipeline {
    pub fn new(
        config: Nl2SqlConfig,
        catalog: Arc<SchemaCatalog>,
        mut corpus: Arc<TrainingCorpus>,
        store: Arc<EmbeddingStore>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        // gold skeletons must be built like draft skeletons for the skeleton gate
        Arc::make_mut(&mut corpus).apply_schema_skeletons(&catalog);
        let masker = QuestionMasker::new(config.mask_tag.clone(), config.value_tag.clone());
        let factory = SelectorFactory::new(Arc::clone(&corpus), Arc::clone(&store), masker.clone());
        let stage_a = factory.build_selector(&config.stage_a_selector);
        let stage_b = factory.build_selector(&config.stage_b_selector);
        let prompts = PromptBuilder::new(config.prompt.clone(), Arc::clone(&catalog));
        info!(
            "Pipeline ready: {} examples, {} schemas, stage A {}, stage B {}",
            corpus.len(),
            catalog.len(),
            stage_a.name(),
            stage_b.name()
        );

        Self {
            config,
            catalog,
            corpus,
            store,
            masker,
            stage_a,
            stage_b,
            prompts,
            llm,
            probes: None,
            context: Arc::new(NoContext),
        }
    }

    /// Build every collaborator from configuration.
    pub fn from_config(config: Nl2SqlConfig) -> Result<Self> {
        let corpus = Arc::new(TrainingCorpus::load(&config.corpus_path)?);
        let catalog = Arc::new(load_catalog(&config)?);

        let embedder: Arc<dyn Embedder> = if config.embedding.model == "hashing" {
            Arc::new(HashingEmbedder::default())
        } else {
            Arc::new(OpenAiEmbedder::new(
                config.embedding.api_key.clone(),
                config.embedding.base_url.clone(),
                config.embedding.model.clone(),
            ))
        };
        let store = Arc::new(
            EmbeddingStore::new(embedder, config.cache_dir.clone())
                .with_persisted_targets(config.embedding.persist_target_embeddings),
        );
        let llm: Arc<dyn LanguageModel> = Arc::new(RetryingModel::new(
            LlmClient::from_config(&config.llm),
            RetryPolicy::from_config(&config.llm),
        ));
        let probes = config
            .db_dir
            .clone()
            .map(|dir| Arc::new(SqliteProbeProvider::new(dir)) as Arc<dyn ValueProbeProvider>);

        let mut pipeline = Self::new(config, catalog, corpus, store, llm);
        pipeline.probes = probes;
        Ok(pipeline)
    }

    pub fn with_probes(mut self, probes: Arc<dyn ValueProbeProvider>) -> Self {
        self.probes = Some(probes);
        self
    }

    pub fn with_context_retriever(mut self, context: Arc<dyn ContextRetriever>) -> Self {
        self.context = context;
        self
    }

    pub fn config(&self) -> &Nl2SqlConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn corpus(&self) -> &Arc<TrainingCorpus> {
        &self.corpus
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn masker(&self) -> &QuestionMasker {
        &self.masker
    }

    /// Final SQL for `question`, or `None` when no SQL could be generated.
    pub async fn nl2sql(
        &self,
        question: &str,
        context: Option<&str>,
        db_id: &str,
    ) -> Result<Option<String>> {
        Ok(self.run(question, context, db_id).await?.sql)
    }

    /// Like [`nl2sql`](Self::nl2sql), with document context looked up for `user_id`.
    pub async fn nl2sql_for_user(
        &self,
        question: &str,
        user_id: &str,
        db_id: &str,
    ) -> Result<Option<String>> {
        let context = match self.context.get_context_for_query(question, user_id).await {
            Ok(context) => context,
            Err(e) => {
                warn!("Document context unavailable for {}: {}", user_id, e);
                None
            }
        };
        self.nl2sql(question, context.as_deref(), db_id).await
    }

    /// Tokenize and link `question` off the async runtime.
    pub async fn link(&self, question: &str, db_id: &str) -> Result<LinkedQuestion> {
        let tokens = tokenize_question(question);
        let Some(schema) = self.catalog.get(db_id) else {
            warn!("No schema for {}, continuing without links", db_id);
            return Ok(LinkedQuestion {
                tokens,
                ..Default::default()
            });
        };
        let probes = self.probes.clone();
        tokio::task::spawn_blocking(move || link_with_provider(tokens, &schema, probes.as_deref()))
            .await
            .map_err(|e| Nl2SqlError::Schema(format!("Linking task failed: {}", e)))
    }

    /// Full two-stage run with every intermediate result.
    pub async fn run(
        &self,
        question: &str,
        context: Option<&str>,
        db_id: &str,
    ) -> Result<Nl2SqlResponse> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("nl2sql", request_id = %request_id, db_id = %db_id);
        self.run_stages(request_id, question, context, db_id)
            .instrument(span)
            .await
    }

    async fn run_stages(
        &self,
        request_id: String,
        question: &str,
        context: Option<&str>,
        db_id: &str,
    ) -> Result<Nl2SqlResponse> {
        let mut response = Nl2SqlResponse::new(request_id, question, db_id);
        let num_example = self.config.num_example;
        let cross_domain = self.config.cross_domain;
        let temperature = self.config.llm.temperature;

        // Step 1: link and mask
        let linked = self.link(question, db_id).await?;
        response.masked_question = Some(self.masker.mask_question(
            &linked.tokens,
            &linked.sc_link,
            &linked.cv_link,
        ));
        response.advance(PipelineStage::MaskedLinked);
        let target = SelectionTarget::new(db_id, question, linked);

        // Step 2: draft from question-mask neighbours
        let qms = self
            .stage_a
            .get_examples(&target, num_example, cross_domain)
            .await?;
        let prompt = self.prompts.build_generation_prompt(question, db_id, &qms);
        let answer = match self.llm.generate(&prompt, temperature).await {
            Ok(answer) => answer,
            Err(e) => return Ok(response.failed(format!("draft generation failed: {}", e))),
        };
        let Some(draft) = extract_draft_sql(&answer, self.config.prompt.completion_cue) else {
            return Ok(response.failed("the draft response contained no SELECT statement"));
        };
        let draft = clean_sql(&draft);
        response.draft_sql = Some(draft.clone());
        response.advance(PipelineStage::DraftGenerated);

        // Step 3: skeleton of the draft
        let schema = self.catalog.get(db_id);
        let pre_skeleton = to_skeleton(&draft, schema.as_deref());
        response.pre_skeleton = Some(pre_skeleton.clone());
        response.advance(PipelineStage::SkeletonExtracted);
        let target = target.with_pre_skeleton(pre_skeleton);

        // Step 4: refine with question-skeleton neighbours
        let qss = self
            .stage_b
            .get_examples(&target, num_example, cross_domain)
            .await?;
        let examples: Vec<SelectedExample> = qms
            .into_iter()
            .chain(qss)
            .unique_by(|e| e.index)
            .collect();
        response.example_indexes = examples.iter().map(|e| e.index).collect();

        let prompt = self
            .prompts
            .build_refinement_prompt(question, db_id, &examples, &draft, context);
        let answer = self.llm.generate(&prompt, temperature).await?;
        let Some(sql) = extract_draft_sql(&answer, self.config.prompt.completion_cue) else {
            return Ok(response.failed("the refined response contained no SELECT statement"));
        };
        response.sql = Some(clean_sql(&sql));
        response.advance(PipelineStage::Refined);
        response.generated_at = Utc::now();

        info!("✅ SQL generated with {} examples", response.example_indexes.len());
        Ok(response)
    }

    /// Stage A only, regenerating while the SQL does not parse.
    pub async fn single_stage(&self, question: &str, db_id: &str) -> Result<Option<String>> {
        let linked = self.link(question, db_id).await?;
        let target = SelectionTarget::new(db_id, question, linked);
        let examples = self
            .stage_a
            .get_examples(&target, self.config.num_example, self.config.cross_domain)
            .await?;
        let prompt = self.prompts.build_generation_prompt(question, db_id, &examples);

        let max_attempts = self.config.max_invalid_retries.max(1);
        for attempt in 1..=max_attempts {
            info!("Single-stage attempt {} of {}", attempt, max_attempts);
            let answer = self.llm.generate(&prompt, self.config.llm.temperature).await?;
            let Some(sql) = extract_draft_sql(&answer, self.config.prompt.completion_cue) else {
                warn!("Attempt {} returned no SELECT statement", attempt);
                continue;
            };
            let sql = clean_sql(&sql);
            match validate_sql(&sql) {
                Ok(()) => return Ok(Some(sql)),
                Err(e) => warn!("Attempt {} produced invalid SQL: {}", attempt, e),
            }
        }
        Ok(None)
    }
}

fn strip_fences(text: &str) -> String {
    if let Some(block) = FENCED_BLOCK.captures(text).and_then(|c| c.get(1)) {
        return block.as_str().to_string();
    }
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Comment spans and the first `;` of a SQL text, as byte offsets.
#[derive(Debug, Default)]
struct StatementLayout {
    comments: Vec<Range<usize>>,
    end: Option<usize>,
}

impl StatementLayout {
    /// Read with the SQL tokenizer, so `;` and `--` inside literals are left alone.
    /// `None` when the text does not tokenize.
    fn scan(sql: &str) -> Option<Self> {
        let dialect = GenericDialect {};
        let tokens = Tokenizer::new(&dialect, sql).tokenize_with_location().ok()?;
        let line_starts: Vec<usize> = std::iter::once(0)
            .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        let offset = |location: &Location| -> Option<usize> {
            let line_start = *line_starts.get((location.line as usize).checked_sub(1)?)?;
            let column = (location.column as usize).checked_sub(1)?;
            let rest = &sql[line_start..];
            rest.char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(rest.len()))
                .nth(column)
                .map(|i| line_start + i)
        };

        let mut layout = Self::default();
        for (i, token) in tokens.iter().enumerate() {
            match &token.token {
                Token::SemiColon => {
                    layout.end = Some(offset(&token.location)?);
                    break;
                }
                Token::Whitespace(
                    Whitespace::SingleLineComment { .. } | Whitespace::MultiLineComment(_),
                ) => {
                    let start = offset(&token.location)?;
                    let end = match tokens.get(i + 1) {
                        Some(next) => offset(&next.location)?,
                        None => sql.len(),
                    };
                    layout.comments.push(start..end);
                }
                _ => {}
            }
        }
        Some(layout)
    }

    /// Text before the first `;`, comments replaced by a space.
    fn first_statement(&self, sql: &str) -> String {
        let end = self.end.unwrap_or(sql.len());
        let mut statement = String::with_capacity(end);
        let mut at = 0;
        for comment in &self.comments {
            statement.push_str(&sql[at..comment.start.min(end)]);
            statement.push(' ');
            at = comment.end.min(end);
        }
        statement.push_str(&sql[at..end]);
        statement
    }
}

fn cut_at_semicolon(sql: &str) -> &str {
    match StatementLayout::scan(sql) {
        Some(StatementLayout { end: Some(end), .. }) => &sql[..end],
        Some(_) => sql,
        None => sql.split(';').next().unwrap_or_default(),
    }
}

/// The SQL statement in a model response.
///
/// Takes the first line that starts with `SELECT` and the lines after it
/// up to a blank line, then cuts at the first `;` outside a literal. With
/// `continuation`, a response without such a line is read as the rest of a
/// prompt ending in `SELECT `.
pub fn extract_draft_sql(response: &str, continuation: bool) -> Option<String> {
    let text = strip_fences(response);
    let lines: Vec<&str> = text.lines().collect();

    match lines
        .iter()
        .position(|line| STARTS_WITH_SELECT.is_match(line.trim_start()))
    {
        Some(start) => {
            let block = lines[start..]
                .iter()
                .take_while(|line| !line.trim().is_empty())
                .join("\n");
            Some(cut_at_semicolon(&block).trim().to_string())
        }
        None if continuation => {
            let body = cut_at_semicolon(&text).trim().to_string();
            if body.is_empty() {
                None
            } else {
                Some(format!("SELECT {}", body))
            }
        }
        None => None,
    }
}

/// Normalize model output to one single-line statement.
pub fn clean_sql(raw: &str) -> String {
    let text = strip_fences(raw);
    let statement = match StatementLayout::scan(&text) {
        Some(layout) => layout.first_statement(&text),
        None => {
            let text = BLOCK_COMMENT.replace_all(&text, " ");
            let text = LINE_COMMENT.replace_all(&text, " ");
            text.split(';').next().unwrap_or_default().to_string()
        }
    };
    let collapsed = WHITESPACE.replace_all(statement.trim(), " ").to_string();
    let collapsed = DOUBLE_SELECT.replace(&collapsed, "SELECT").to_string();

    if collapsed.is_empty() || STARTS_WITH_QUERY.is_match(&collapsed) {
        collapsed
    } else {
        format!("SELECT {}", collapsed)
    }
}

pub fn validate_sql(sql: &str) -> Result<()> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| Nl2SqlError::Generation(format!("SQL does not parse: {}", e)))?;
    if statements.is_empty() {
        return Err(Nl2SqlError::Generation("empty SQL".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_draft_from_chatty_response() {
        let response = "Here is the query:\n```sql\nselect name\nFROM customers\nWHERE id = 1;\n```\nHope it helps.";
        assert_eq!(
            extract_draft_sql(response, false).unwrap(),
            "select name\nFROM customers\nWHERE id = 1"
        );
    }

    #[test]
    fn test_extract_stops_at_blank_line() {
        let response = "SELECT count(*) FROM orders\n\nThis counts every order.";
        assert_eq!(extract_draft_sql(response, false).unwrap(), "SELECT count(*) FROM orders");
    }

    #[test]
    fn test_extract_requires_select() {
        assert!(extract_draft_sql("I cannot answer that.", false).is_none());
        assert!(extract_draft_sql("selection is hard", false).is_none());
        assert_eq!(
            extract_draft_sql("name FROM customers", true).unwrap(),
            "SELECT name FROM customers"
        );
        assert!(extract_draft_sql("   ", true).is_none());
    }

    #[test]
    fn test_clean_sql() {
        assert_eq!(
            clean_sql("```sql\nSELECT *\n  FROM customers -- all of them\n;\nSELECT 2;\n```"),
            "SELECT * FROM customers"
        );
        assert_eq!(clean_sql("SELECT select id FROM t"), "SELECT id FROM t");
        assert_eq!(clean_sql("id FROM t /* note */"), "SELECT id FROM t");
        assert_eq!(
            clean_sql("WITH x AS (SELECT 1) SELECT * FROM x"),
            "WITH x AS (SELECT 1) SELECT * FROM x"
        );
        assert_eq!(clean_sql("```\n```"), "");
    }

    #[test]
    fn test_literals_keep_semicolons_and_dashes() {
        assert_eq!(
            clean_sql("SELECT name FROM t WHERE note = 'a;b' -- trailing\n; SELECT 2"),
            "SELECT name FROM t WHERE note = 'a;b'"
        );
        assert_eq!(
            clean_sql("SELECT '--x' AS d FROM t /* why */ WHERE id = 1"),
            "SELECT '--x' AS d FROM t WHERE id = 1"
        );
        assert_eq!(
            extract_draft_sql("SELECT id FROM t\nWHERE s = 'x;y';\nSELECT 2", false).unwrap(),
            "SELECT id FROM t\nWHERE s = 'x;y'"
        );
    }

    #[test]
    fn test_untokenizable_text_falls_back_to_plain_cut() {
        assert_eq!(clean_sql("SELECT 'abc FROM t; junk"), "SELECT 'abc FROM t");
        assert_eq!(
            extract_draft_sql("SELECT 'abc FROM t; junk", false).unwrap(),
            "SELECT 'abc FROM t"
        );
    }

    #[test]
    fn test_validate_sql() {
        assert!(validate_sql("SELECT name FROM customers WHERE id = 1").is_ok());
        assert!(matches!(
            validate_sql("SELECT * FROM customers WHERE"),
            Err(Nl2SqlError::Generation(_))
        ));
        assert!(validate_sql("").is_err());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(PipelineStage::SkeletonExtracted.to_string(), "SKELETON_EXTRACTED");
        assert_eq!(
            serde_json::to_string(&PipelineStage::MaskedLinked).unwrap(),
            "\"MASKED_LINKED\""
        );
    }
}
