//! Proxy selection
//!
//! The [`SelectionScheduler`] filters a [`PoolSnapshot`] down to eligible
//! candidates; a [`CandidateRanker`] then picks one of them.

mod greedy;
mod scheduler;
mod snapshot;
mod top_k;
mod weighted;

pub use greedy::GreedyRanker;
pub use scheduler::{Assignment, SelectionConstraints, SelectionScheduler};
pub use snapshot::{PoolSnapshot, SnapshotEntry};
pub use top_k::TopKRanker;
pub use weighted::WeightedRanker;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{RecordId, SubnetKey};

/// How the scheduler picks among eligible candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingStrategy {
    /// Sample proportionally to score
    #[default]
    Weighted,
    /// Best candidate, with occasional exploration of the runners-up
    TopK,
    /// Always the best candidate
    Greedy,
}

impl RankingStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "top_k" | "topk" | "top-k" => Self::TopK,
            "greedy" | "best" => Self::Greedy,
            _ => Self::Weighted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weighted => "weighted",
            Self::TopK => "top_k",
            Self::Greedy => "greedy",
        }
    }
}

/// An eligible proxy with the score it is ranked by
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: RecordId,
    pub score: f64,
    pub subnet: SubnetKey,
}

/// Picks one candidate out of a ranked list
///
/// `candidates` is sorted by score descending (ties by id) and never empty
/// when the scheduler calls `pick`.
pub trait CandidateRanker: Send + Sync {
    /// Index of the chosen candidate
    fn pick(&self, candidates: &[Candidate], rng: &mut StdRng) -> Option<usize>;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}

/// Create a ranker for the strategy type
pub fn create_ranker(strategy: RankingStrategy) -> Box<dyn CandidateRanker> {
    match strategy {
        RankingStrategy::Weighted => Box::new(WeightedRanker),
        RankingStrategy::TopK => Box::new(TopKRanker::default()),
        RankingStrategy::Greedy => Box::new(GreedyRanker),
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    proxy_id: RecordId,
    issued_at: DateTime<Utc>,
}

/// Tracks requests that hold a proxy between `select` and `report`
///
/// Leases are keyed by request id so releasing twice is harmless. Leases
/// whose worker never reports are reclaimed by [`release_stale`].
///
/// [`release_stale`]: InFlightTracker::release_stale
#[derive(Debug, Default)]
pub struct InFlightTracker {
    leases: DashMap<Uuid, Lease>,
    per_proxy: DashMap<RecordId, usize>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, request_id: Uuid, proxy_id: RecordId, issued_at: DateTime<Utc>) {
        let lease = Lease {
            proxy_id,
            issued_at,
        };
        if self.leases.insert(request_id, lease).is_none() {
            self.per_proxy
                .entry(proxy_id)
                .and_modify(|c| *c += 1)
                .or_insert(1);
        }
    }

    /// Drop the lease for a request; returns the proxy it held
    pub fn release(&self, request_id: &Uuid) -> Option<RecordId> {
        let (_, lease) = self.leases.remove(request_id)?;
        if let Some(mut count) = self.per_proxy.get_mut(&lease.proxy_id) {
            *count = count.saturating_sub(1);
        }
        self.per_proxy.remove_if(&lease.proxy_id, |_, c| *c == 0);
        Some(lease.proxy_id)
    }

    /// Drop every lease on a proxy
    pub fn release_proxy(&self, proxy_id: RecordId) {
        self.leases.retain(|_, lease| lease.proxy_id != proxy_id);
        self.per_proxy.remove(&proxy_id);
    }

    /// Drop leases issued at or before `cutoff`; returns their request ids
    pub fn release_stale(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .leases
            .iter()
            .filter(|lease| lease.issued_at <= cutoff)
            .map(|lease| *lease.key())
            .collect();

        stale
            .into_iter()
            .filter(|request_id| self.release(request_id).is_some())
            .collect()
    }

    pub fn get(&self, proxy_id: RecordId) -> usize {
        self.per_proxy.get(&proxy_id).map(|v| *v).unwrap_or(0)
    }

    pub fn is_busy(&self, proxy_id: RecordId) -> bool {
        self.get(proxy_id) > 0
    }

    pub fn total(&self) -> usize {
        self.leases.len()
    }

    pub fn clear(&self) {
        self.leases.clear();
        self.per_proxy.clear();
    }
}

#[cfg(test)]
pub(crate) fn candidates(scores: &[f64]) -> Vec<Candidate> {
    scores
        .iter()
        .enumerate()
        .map(|(i, score)| Candidate {
            id: RecordId(i as u64 + 1),
            score: *score,
            subnet: SubnetKey::for_host(&format!("10.0.{}.1", i)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranking_strategy_from_str() {
        assert_eq!(RankingStrategy::from_str("weighted"), RankingStrategy::Weighted);
        assert_eq!(RankingStrategy::from_str("Top-K"), RankingStrategy::TopK);
        assert_eq!(RankingStrategy::from_str("topk"), RankingStrategy::TopK);
        assert_eq!(RankingStrategy::from_str("greedy"), RankingStrategy::Greedy);
        assert_eq!(RankingStrategy::from_str("unknown"), RankingStrategy::Weighted);
    }

    #[test]
    fn test_ranking_strategy_as_str() {
        assert_eq!(RankingStrategy::Weighted.as_str(), "weighted");
        assert_eq!(RankingStrategy::TopK.as_str(), "top_k");
        assert_eq!(RankingStrategy::Greedy.as_str(), "greedy");
    }

    #[test]
    fn test_create_ranker_strategy_name() {
        for strategy in [
            RankingStrategy::Weighted,
            RankingStrategy::TopK,
            RankingStrategy::Greedy,
        ] {
            assert_eq!(create_ranker(strategy).strategy_name(), strategy.as_str());
        }
    }

    #[test]
    fn test_in_flight_tracker_counts() {
        let tracker = InFlightTracker::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let now = Utc::now();

        assert_eq!(tracker.get(RecordId(1)), 0);
        tracker.acquire(a, RecordId(1), now);
        tracker.acquire(b, RecordId(1), now);
        tracker.acquire(b, RecordId(1), now);
        tracker.acquire(c, RecordId(2), now);
        assert_eq!(tracker.get(RecordId(1)), 2);
        assert_eq!(tracker.total(), 3);

        assert_eq!(tracker.release(&a), Some(RecordId(1)));
        assert_eq!(tracker.release(&a), None);
        assert_eq!(tracker.get(RecordId(1)), 1);

        tracker.release(&b);
        assert!(!tracker.is_busy(RecordId(1)));

        tracker.release_proxy(RecordId(2));
        assert_eq!(tracker.total(), 0);
        assert_eq!(tracker.release(&c), None);

        tracker.acquire(a, RecordId(3), now);
        tracker.clear();
        assert_eq!(tracker.get(RecordId(3)), 0);
    }

    #[test]
    fn test_release_stale_leases() {
        let tracker = InFlightTracker::new();
        let start = Utc::now();
        let (old, young) = (Uuid::new_v4(), Uuid::new_v4());

        tracker.acquire(old, RecordId(1), start);
        tracker.acquire(young, RecordId(1), start + chrono::Duration::seconds(200));

        let released = tracker.release_stale(start + chrono::Duration::seconds(100));
        assert_eq!(released, vec![old]);
        assert_eq!(tracker.get(RecordId(1)), 1);
        assert_eq!(tracker.total(), 1);

        // A late report for the reclaimed lease is a no-op
        assert_eq!(tracker.release(&old), None);
        assert!(tracker.release_stale(start).is_empty());

        tracker.release_stale(start + chrono::Duration::seconds(200));
        assert!(!tracker.is_busy(RecordId(1)));
    }
}
