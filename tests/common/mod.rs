#![allow(dead_code)]

use async_trait::async_trait;
use nl2sql_retrieval::context::ContextRetriever;
use nl2sql_retrieval::corpus::{TrainingCorpus, TrainingExample};
use nl2sql_retrieval::embedding::{Embedder, Embedding, HashingEmbedder};
use nl2sql_retrieval::error::{Nl2SqlError, Result};
use nl2sql_retrieval::llm::LanguageModel;
use nl2sql_retrieval::schema::{DatabaseSchema, SchemaCatalog};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Replays canned answers in order and records every prompt.
pub struct ScriptedModel {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, prompt: &str, _temperature: f32) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Nl2SqlError::Llm("script exhausted".to_string()))
    }
}

/// Fixed notes for one user, nothing for anyone else.
pub struct UserNotes {
    user_id: String,
    notes: String,
}

impl UserNotes {
    pub fn new(user_id: &str, notes: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            notes: notes.to_string(),
        }
    }
}

#[async_trait]
impl ContextRetriever for UserNotes {
    async fn get_context_for_query(&self, _question: &str, user_id: &str) -> Result<Option<String>> {
        Ok((user_id == self.user_id).then(|| self.notes.clone()))
    }
}

/// Context lookup that always fails.
pub struct BrokenContext;

#[async_trait]
impl ContextRetriever for BrokenContext {
    async fn get_context_for_query(&self, _question: &str, _user_id: &str) -> Result<Option<String>> {
        Err(Nl2SqlError::Config("context store offline".to_string()))
    }
}

/// Hashing embedder that remembers the size of every batch it was given.
#[derive(Default)]
pub struct CountingEmbedder {
    inner: HashingEmbedder,
    batches: Mutex<Vec<usize>>,
}

impl CountingEmbedder {
    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        self.batches.lock().unwrap().push(texts.len());
        self.inner.embed(texts).await
    }
}

pub fn vpbank_schema() -> DatabaseSchema {
    let mut schema = DatabaseSchema::new("vpbank");
    schema.add_table(
        "customers",
        &[("id", "INTEGER"), ("name", "TEXT"), ("email", "TEXT")],
    );
    schema.set_primary_key("customers", "id").unwrap();
    schema
}

pub fn catalog() -> SchemaCatalog {
    let mut catalog = SchemaCatalog::new();
    catalog.insert(vpbank_schema());
    catalog
}

pub fn mixed_corpus() -> TrainingCorpus {
    TrainingCorpus::from_examples(vec![
        TrainingExample::new("vpbank", "List all customers", "SELECT * FROM customers"),
        TrainingExample::new("vpbank", "How many customers are there", "SELECT count(*) FROM customers"),
        TrainingExample::new("shop", "Show all orders", "SELECT * FROM orders"),
        TrainingExample::new("shop", "Which orders cost more than 100", "SELECT id FROM orders WHERE cost > 100"),
        TrainingExample::new("music", "Name the singers older than 30", "SELECT name FROM singer WHERE age > 30"),
        TrainingExample::new("music", "How many concerts were held", "SELECT count(*) FROM concert"),
    ])
}
