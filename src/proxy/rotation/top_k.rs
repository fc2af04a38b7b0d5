//! Top-1 with epsilon exploration

use rand::prelude::*;
use rand::rngs::StdRng;

use super::{Candidate, CandidateRanker};

/// Takes the best candidate, except that with probability `explore_rate`
/// it draws uniformly from the best `pool_size` instead.
///
/// Exploration only kicks in when there are more than `pool_size`
/// candidates; smaller pools are served greedily.
#[derive(Debug, Clone, Copy)]
pub struct TopKRanker {
    explore_rate: f64,
    pool_size: usize,
}

impl TopKRanker {
    pub const DEFAULT_EXPLORE_RATE: f64 = 0.2;
    pub const DEFAULT_POOL_SIZE: usize = 5;

    pub fn new(explore_rate: f64, pool_size: usize) -> Self {
        Self {
            explore_rate: explore_rate.clamp(0.0, 1.0),
            pool_size: pool_size.max(1),
        }
    }
}

impl Default for TopKRanker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_EXPLORE_RATE, Self::DEFAULT_POOL_SIZE)
    }
}

impl CandidateRanker for TopKRanker {
    fn pick(&self, candidates: &[Candidate], rng: &mut StdRng) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        if candidates.len() > self.pool_size && rng.gen_bool(self.explore_rate) {
            return Some(rng.gen_range(0..self.pool_size));
        }
        Some(0)
    }

    fn strategy_name(&self) -> &'static str {
        "top_k"
    }
}
