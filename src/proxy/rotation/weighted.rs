//! Score-proportional sampling

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;

use super::{Candidate, CandidateRanker};

/// Picks each candidate with probability proportional to its score
///
/// Keeps weaker but acceptable proxies in rotation so their scores stay
/// current. Falls back to a uniform draw when every score is zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRanker;

impl CandidateRanker for WeightedRanker {
    fn pick(&self, candidates: &[Candidate], rng: &mut StdRng) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match WeightedIndex::new(candidates.iter().map(|c| c.score.max(0.0))) {
            Ok(dist) => Some(dist.sample(rng)),
            Err(_) => Some(rng.gen_range(0..candidates.len())),
        }
    }

    fn strategy_name(&self) -> &'static str {
        "weighted"
    }
}
