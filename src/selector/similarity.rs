use super::{
    rank_ascending, ExampleSelector, SelectedExample, SelectionContext, SelectionTarget,
};
use crate::embedding::CorpusKey;
use crate::error::Result;
use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cosine,
    Euclidean,
}

/// Nearest neighbours of the target question in embedding space.
///
/// Covers the cosine, Euclidean, Euclidean-threshold and question-mask
/// strategies; they differ only in which text is embedded, the metric,
/// an optional distance cutoff and the self-match guard.
pub struct EmbeddingSelector {
    context: SelectionContext,
    question: CorpusKey,
    metric: Metric,
    threshold: Option<f32>,
    self_match_guard: bool,
}

impl EmbeddingSelector {
    pub fn new(context: SelectionContext, question: CorpusKey, metric: Metric) -> Self {
        Self {
            context,
            question,
            metric,
            threshold: None,
            self_match_guard: false,
        }
    }

    /// Drop candidates further away than `threshold`. Short results are not backfilled.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Skip examples whose question is identical to the target's.
    pub fn with_self_match_guard(mut self) -> Self {
        self.self_match_guard = true;
        self
    }
}

#[async_trait]
impl ExampleSelector for EmbeddingSelector {
    fn name(&self) -> &'static str {
        match (self.question, self.metric, self.threshold) {
            (CorpusKey::Masked, _, _) => "euclidean_distance_question_mask",
            (CorpusKey::Raw, Metric::Cosine, _) => "cosine_similarity",
            (CorpusKey::Raw, Metric::Euclidean, Some(_)) => "euclidean_distance_threshold",
            (CorpusKey::Raw, Metric::Euclidean, None) => "euclidean_distance",
        }
    }

    async fn get_examples(
        &self,
        target: &SelectionTarget,
        num_example: usize,
        cross_domain: bool,
    ) -> Result<Vec<SelectedExample>> {
        let candidates = self
            .context
            .eligible(target, cross_domain, self.self_match_guard);
        if candidates.is_empty() || num_example == 0 {
            return Ok(Vec::new());
        }

        let mut scored = self
            .context
            .distances(self.question, self.metric, target, &candidates)
            .await?;
        if let Some(threshold) = self.threshold {
            scored.retain(|(_, d)| *d <= threshold);
        }
        rank_ascending(&mut scored);

        let selected: Vec<SelectedExample> = scored
            .into_iter()
            .take(num_example)
            .filter_map(|(index, distance)| {
                let score = match self.metric {
                    Metric::Cosine => 1.0 - distance,
                    Metric::Euclidean => distance,
                };
                self.context.selected(index, score)
            })
            .collect();

        if selected.len() < num_example {
            debug!(
                "{} returned {} of {} requested examples",
                self.name(),
                selected.len(),
                num_example
            );
        }
        Ok(selected)
    }
}
