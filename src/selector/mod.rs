//! Few-shot example selection.
//!
//! Every strategy implements [`ExampleSelector`]; which one runs is decided
//! by a [`SelectorKind`] value handed to [`SelectorFactory::build_selector`].
//! All strategies share one corpus, one embedding store and one masker.

pub mod random;
pub mod similarity;
pub mod skeleton;

use crate::corpus::{TrainingCorpus, TrainingExample};
use crate::embedding::{cosine_similarity, euclidean_distance, CorpusKey, EmbeddingStore};
use crate::error::{Nl2SqlError, Result};
use crate::linking::{CellValueLinkResult, LinkedQuestion, SchemaLinkResult};
use crate::masking::QuestionMasker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use random::RandomSelector;
pub use similarity::{EmbeddingSelector, Metric};
pub use skeleton::{SkeletonMode, SkeletonSelector};

pub const DEFAULT_SKELETON_THRESHOLD: f32 = 0.85;
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.85;

/// What the selectors compare the corpus against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionTarget {
    pub db_id: String,
    pub question: String,
    pub question_tokens: Vec<String>,
    pub sc_link: SchemaLinkResult,
    pub cv_link: CellValueLinkResult,
    pub query_skeleton: Option<String>,
    pub pre_skeleton: Option<String>,
}

impl SelectionTarget {
    pub fn new(db_id: &str, question: &str, linked: LinkedQuestion) -> Self {
        Self {
            db_id: db_id.to_string(),
            question: question.to_string(),
            question_tokens: linked.tokens,
            sc_link: linked.sc_link,
            cv_link: linked.cv_link,
            query_skeleton: None,
            pre_skeleton: None,
        }
    }

    pub fn with_pre_skeleton(mut self, skeleton: impl Into<String>) -> Self {
        self.pre_skeleton = Some(skeleton.into());
        self
    }

    pub fn with_query_skeleton(mut self, skeleton: impl Into<String>) -> Self {
        self.query_skeleton = Some(skeleton.into());
        self
    }

    pub fn skeleton(&self, field: SkeletonField) -> Option<&str> {
        match field {
            SkeletonField::QuerySkeleton => self.query_skeleton.as_deref(),
            SkeletonField::PreSkeleton => self.pre_skeleton.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectedExample {
    /// Position in the corpus.
    pub index: usize,
    /// Strategy-specific score (distance, similarity or sample rank).
    pub score: f32,
    pub example: TrainingExample,
}

#[async_trait]
pub trait ExampleSelector: Send + Sync {
    fn name(&self) -> &'static str;

    /// At most `num_example` distinct corpus entries, best first.
    async fn get_examples(
        &self,
        target: &SelectionTarget,
        num_example: usize,
        cross_domain: bool,
    ) -> Result<Vec<SelectedExample>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkeletonField {
    QuerySkeleton,
    PreSkeleton,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectorKind {
    Random {
        #[serde(default)]
        seed: u64,
    },
    CosineSimilarity,
    EuclideanDistance,
    EuclideanDistanceThreshold {
        #[serde(default = "default_distance_threshold")]
        threshold: f32,
    },
    EuclideanDistanceQuestionMask,
    /// Skeleton gate with a relaxed second pass.
    SkeletonSimilarityThreshold {
        question: CorpusKey,
        skeleton: SkeletonField,
        #[serde(default = "default_skeleton_threshold")]
        threshold: f32,
    },
    /// Distance minus skeleton similarity, no gate.
    SkeletonSimilarityPlus {
        question: CorpusKey,
        skeleton: SkeletonField,
    },
    /// Masked question, `pre_skeleton` gate, strict pass only.
    SkeletonSimilarityShift {
        #[serde(default = "default_skeleton_threshold")]
        threshold: f32,
    },
}

fn default_distance_threshold() -> f32 {
    DEFAULT_DISTANCE_THRESHOLD
}

fn default_skeleton_threshold() -> f32 {
    DEFAULT_SKELETON_THRESHOLD
}

impl SelectorKind {
    /// Question-mask similarity, used for the draft.
    pub fn default_stage_a() -> Self {
        SelectorKind::EuclideanDistanceQuestionMask
    }

    /// Question-skeleton similarity, used for refinement.
    pub fn default_stage_b() -> Self {
        SelectorKind::SkeletonSimilarityThreshold {
            question: CorpusKey::Masked,
            skeleton: SkeletonField::PreSkeleton,
            threshold: DEFAULT_SKELETON_THRESHOLD,
        }
    }
}

/// Shared state handed to every selector.
#[derive(Clone)]
pub struct SelectionContext {
    corpus: Arc<TrainingCorpus>,
    store: Arc<EmbeddingStore>,
    masker: QuestionMasker,
    raw_questions: Arc<Vec<String>>,
    masked_questions: Arc<Vec<String>>,
}

impl SelectionContext {
    pub fn new(corpus: Arc<TrainingCorpus>, store: Arc<EmbeddingStore>, masker: QuestionMasker) -> Self {
        let raw_questions = Arc::new(corpus.raw_questions());
        let masked_questions = Arc::new(corpus.masked_questions(&masker));
        Self {
            corpus,
            store,
            masker,
            raw_questions,
            masked_questions,
        }
    }

    pub fn corpus(&self) -> &TrainingCorpus {
        &self.corpus
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    /// Corpus indexes left after cross-domain and self-match filtering, in corpus order.
    pub(crate) fn eligible(
        &self,
        target: &SelectionTarget,
        cross_domain: bool,
        self_match_guard: bool,
    ) -> Vec<usize> {
        self.corpus
            .examples()
            .iter()
            .enumerate()
            .filter(|(_, e)| !(cross_domain && e.db_id == target.db_id))
            .filter(|(_, e)| !(self_match_guard && e.question == target.question))
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn target_text(&self, key: CorpusKey, target: &SelectionTarget) -> String {
        match key {
            CorpusKey::Raw => target.question.clone(),
            CorpusKey::Masked => {
                self.masker
                    .mask_question(&target.question_tokens, &target.sc_link, &target.cv_link)
            }
        }
    }

    /// `(index, distance)` for each candidate, unsorted. Cosine is reported as `1 - similarity`.
    pub(crate) async fn distances(
        &self,
        key: CorpusKey,
        metric: Metric,
        target: &SelectionTarget,
        candidates: &[usize],
    ) -> Result<Vec<(usize, f32)>> {
        let texts = match key {
            CorpusKey::Raw => &self.raw_questions,
            CorpusKey::Masked => &self.masked_questions,
        };
        let matrix = self.store.corpus_embeddings(key, texts).await?;
        let target_vector = self
            .store
            .target_embedding(&self.target_text(key, target))
            .await?;

        candidates
            .iter()
            .map(|&i| -> Result<(usize, f32)> {
                let row = matrix.get(i).ok_or_else(|| {
                    Nl2SqlError::Embedding(format!("No embedding row for example {}", i))
                })?;
                let distance = match metric {
                    Metric::Cosine => 1.0 - cosine_similarity(&target_vector, row),
                    Metric::Euclidean => euclidean_distance(&target_vector, row),
                };
                Ok((i, distance))
            })
            .collect()
    }

    pub(crate) fn selected(&self, index: usize, score: f32) -> Option<SelectedExample> {
        self.corpus.get(index).map(|example| SelectedExample {
            index,
            score,
            example: example.clone(),
        })
    }
}

/// Sort ascending by score, ties broken by corpus order.
pub(crate) fn rank_ascending(scored: &mut [(usize, f32)]) {
    scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
}

pub struct SelectorFactory {
    context: SelectionContext,
}

impl SelectorFactory {
    pub fn new(corpus: Arc<TrainingCorpus>, store: Arc<EmbeddingStore>, masker: QuestionMasker) -> Self {
        Self {
            context: SelectionContext::new(corpus, store, masker),
        }
    }

    pub fn context(&self) -> &SelectionContext {
        &self.context
    }

    pub fn build_selector(&self, kind: &SelectorKind) -> Arc<dyn ExampleSelector> {
        let ctx = self.context.clone();
        match kind.clone() {
            SelectorKind::Random { seed } => Arc::new(RandomSelector::new(ctx, seed)),
            SelectorKind::CosineSimilarity => Arc::new(
                EmbeddingSelector::new(ctx, CorpusKey::Raw, Metric::Cosine).with_self_match_guard(),
            ),
            SelectorKind::EuclideanDistance => Arc::new(
                EmbeddingSelector::new(ctx, CorpusKey::Raw, Metric::Euclidean)
                    .with_self_match_guard(),
            ),
            SelectorKind::EuclideanDistanceThreshold { threshold } => Arc::new(
                EmbeddingSelector::new(ctx, CorpusKey::Raw, Metric::Euclidean)
                    .with_threshold(threshold),
            ),
            SelectorKind::EuclideanDistanceQuestionMask => Arc::new(EmbeddingSelector::new(
                ctx,
                CorpusKey::Masked,
                Metric::Euclidean,
            )),
            SelectorKind::SkeletonSimilarityThreshold {
                question,
                skeleton,
                threshold,
            } => Arc::new(SkeletonSelector::new(
                ctx,
                question,
                skeleton,
                SkeletonMode::Gate {
                    threshold,
                    relaxed_pass: true,
                },
            )),
            SelectorKind::SkeletonSimilarityPlus { question, skeleton } => Arc::new(
                SkeletonSelector::new(ctx, question, skeleton, SkeletonMode::Penalty),
            ),
            SelectorKind::SkeletonSimilarityShift { threshold } => Arc::new(SkeletonSelector::new(
                ctx,
                CorpusKey::Masked,
                SkeletonField::PreSkeleton,
                SkeletonMode::Gate {
                    threshold,
                    relaxed_pass: false,
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_kind_config_shape() {
        let kind: SelectorKind = serde_json::from_str(
            r#"{"type": "skeleton_similarity_threshold", "question": "masked", "skeleton": "pre_skeleton"}"#,
        )
        .unwrap();
        assert_eq!(kind, SelectorKind::default_stage_b());

        let kind: SelectorKind = serde_json::from_str(r#"{"type": "random"}"#).unwrap();
        assert_eq!(kind, SelectorKind::Random { seed: 0 });
    }

    #[test]
    fn test_rank_ascending_breaks_ties_by_corpus_order() {
        let mut scored = vec![(3, 0.5), (1, 0.5), (2, 0.1), (0, f32::NAN)];
        rank_ascending(&mut scored);
        let order: Vec<usize> = scored.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![2, 1, 3, 0]);
    }
}
