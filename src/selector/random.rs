use super::{ExampleSelector, SelectedExample, SelectionContext, SelectionTarget};
use crate::error::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Uniform sample, reseeded on every call so equal inputs give equal picks.
pub struct RandomSelector {
    context: SelectionContext,
    seed: u64,
}

impl RandomSelector {
    pub fn new(context: SelectionContext, seed: u64) -> Self {
        Self { context, seed }
    }
}

#[async_trait]
impl ExampleSelector for RandomSelector {
    fn name(&self) -> &'static str {
        "random"
    }

    async fn get_examples(
        &self,
        target: &SelectionTarget,
        num_example: usize,
        cross_domain: bool,
    ) -> Result<Vec<SelectedExample>> {
        let candidates = self.context.eligible(target, cross_domain, false);
        let mut rng = StdRng::seed_from_u64(self.seed);
        Ok(candidates
            .choose_multiple(&mut rng, num_example)
            .enumerate()
            .filter_map(|(rank, &index)| self.context.selected(index, rank as f32))
            .collect())
    }
}
