use super::{
    rank_ascending, ExampleSelector, Metric, SelectedExample, SelectionContext, SelectionTarget,
    SkeletonField,
};
use crate::embedding::CorpusKey;
use crate::error::{Nl2SqlError, Result};
use crate::skeleton::jaccard_similarity;
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkeletonMode {
    /// Keep candidates whose skeleton similarity reaches `threshold`. With
    /// `relaxed_pass`, a short strict result is topped up from the rejected
    /// candidates in distance order.
    Gate { threshold: f32, relaxed_pass: bool },
    /// Rank by `distance - similarity`.
    Penalty,
}

/// Euclidean neighbours filtered or re-ranked by SQL skeleton similarity.
///
/// The same skeleton field is read on both sides: `query_skeleton` against
/// `query_skeleton`, `pre_skeleton` against `pre_skeleton`.
pub struct SkeletonSelector {
    context: SelectionContext,
    question: CorpusKey,
    skeleton: SkeletonField,
    mode: SkeletonMode,
}

impl SkeletonSelector {
    pub fn new(
        context: SelectionContext,
        question: CorpusKey,
        skeleton: SkeletonField,
        mode: SkeletonMode,
    ) -> Self {
        Self {
            context,
            question,
            skeleton,
            mode,
        }
    }

    fn similarity(&self, index: usize, target_skeleton: &str) -> f64 {
        self.context.corpus().get(index).map_or(0.0, |e| {
            let example_skeleton = match self.skeleton {
                SkeletonField::QuerySkeleton => &e.query_skeleton,
                SkeletonField::PreSkeleton => &e.pre_skeleton,
            };
            jaccard_similarity(example_skeleton, target_skeleton)
        })
    }
}

#[async_trait]
impl ExampleSelector for SkeletonSelector {
    fn name(&self) -> &'static str {
        match self.mode {
            SkeletonMode::Penalty => "skeleton_similarity_plus",
            SkeletonMode::Gate {
                relaxed_pass: false,
                ..
            } => "skeleton_similarity_shift",
            SkeletonMode::Gate { .. } => "skeleton_similarity_threshold",
        }
    }

    async fn get_examples(
        &self,
        target: &SelectionTarget,
        num_example: usize,
        cross_domain: bool,
    ) -> Result<Vec<SelectedExample>> {
        let candidates = self.context.eligible(target, cross_domain, false);
        if candidates.is_empty() || num_example == 0 {
            return Ok(Vec::new());
        }
        let target_skeleton = target.skeleton(self.skeleton).ok_or_else(|| {
            Nl2SqlError::Config(format!(
                "{} needs a {:?} on the target",
                self.name(),
                self.skeleton
            ))
        })?;

        let mut scored = self
            .context
            .distances(self.question, Metric::Euclidean, target, &candidates)
            .await?;

        let picked: Vec<(usize, f32)> = match self.mode {
            SkeletonMode::Penalty => {
                for (index, distance) in scored.iter_mut() {
                    *distance -= self.similarity(*index, target_skeleton) as f32;
                }
                rank_ascending(&mut scored);
                scored.into_iter().take(num_example).collect()
            }
            SkeletonMode::Gate {
                threshold,
                relaxed_pass,
            } => {
                rank_ascending(&mut scored);
                let mut picked: Vec<(usize, f32)> = scored
                    .iter()
                    .filter(|(index, _)| {
                        self.similarity(*index, target_skeleton) >= f64::from(threshold)
                    })
                    .take(num_example)
                    .copied()
                    .collect();

                if relaxed_pass && picked.len() < num_example {
                    let strict = picked.len();
                    let taken: HashSet<usize> = picked.iter().map(|(i, _)| *i).collect();
                    picked.extend(
                        scored
                            .iter()
                            .filter(|(index, _)| !taken.contains(index))
                            .take(num_example - strict)
                            .copied(),
                    );
                    if picked.len() > strict {
                        warn!(
                            "{}: strict skeleton pass found {} of {}, relaxed pass added {}",
                            self.name(),
                            strict,
                            num_example,
                            picked.len() - strict
                        );
                    }
                } else if picked.len() < num_example {
                    debug!(
                        "{}: strict skeleton pass found {} of {}",
                        self.name(),
                        picked.len(),
                        num_example
                    );
                }
                picked
            }
        };

        Ok(picked
            .into_iter()
            .filter_map(|(index, score)| self.context.selected(index, score))
            .collect())
    }
}
