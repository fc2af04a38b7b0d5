//! Deterministic best-first selection

use rand::rngs::StdRng;

use super::{Candidate, CandidateRanker};

/// Always picks the highest-ranked candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyRanker;

impl CandidateRanker for GreedyRanker {
    fn pick(&self, candidates: &[Candidate], _rng: &mut StdRng) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(0)
        }
    }

    fn strategy_name(&self) -> &'static str {
        "greedy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::rotation::candidates;
    use rand::SeedableRng;

    #[test]
    fn test_greedy_pick() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(GreedyRanker.pick(&candidates(&[0.9, 0.5]), &mut rng), Some(0));
        assert_eq!(GreedyRanker.pick(&[], &mut rng), None);
    }
}
