use chrono::{DateTime, Utc};

use crate::models::{RecordId, SubnetKey};
use crate::proxy::policy::PolicyEngine;
use crate::repository::proxy::{log_transition, ProxyRepository};

/// What a selection decision needs to know about one `Active` record
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub id: RecordId,
    pub subnet: SubnetKey,
    pub geo: Option<String>,
    /// Stored score, checked against the floor
    pub score: f64,
    /// Score used for ranking, including any per-request geo preference
    pub rank_score: f64,
    pub last_assigned: Option<DateTime<Utc>>,
    /// More failures than successes so far
    pub struggling: bool,
}

/// Immutable view of the `Active` part of the pool at one instant
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub taken_at: DateTime<Utc>,
    entries: Vec<SnapshotEntry>,
}

impl PoolSnapshot {
    /// Walk the store, returning due `Cooling` records to `Active` first
    pub fn capture(
        repo: &ProxyRepository,
        engine: &PolicyEngine,
        geo: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut entries = Vec::with_capacity(repo.len());

        for id in repo.ids() {
            let visited = repo.with_record(id, |record| {
                let resumed = engine
                    .cooldown
                    .try_resume(record, now)
                    .map(|change| (record.endpoint.address(), change));

                let entry = record.is_active().then(|| SnapshotEntry {
                    id: record.id,
                    subnet: record.subnet.clone(),
                    geo: record.endpoint.geo.clone(),
                    score: record.score,
                    rank_score: match geo {
                        Some(_) => engine.scorer.score_for(record, geo),
                        None => record.score,
                    },
                    last_assigned: record.last_assigned,
                    struggling: record.stats.total_failures() > record.stats.successes,
                });
                (resumed, entry)
            });

            // Removed between listing and visiting
            let Ok((resumed, entry)) = visited else {
                continue;
            };
            if let Some((address, change)) = resumed {
                log_transition(id, &address, &change);
            }
            entries.extend(entry);
        }

        Self {
            taken_at: now,
            entries,
        }
    }

    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::models::{Outcome, ProxyEndpoint, ProxyProtocol, ProxyState};

    #[test]
    fn test_capture_skips_inactive_and_resumes_due() {
        let repo = ProxyRepository::new();
        let engine = PolicyEngine::new(PolicyConfig::default()).unwrap();
        let now = Utc::now();

        let active = repo.upsert(ProxyEndpoint::new("10.0.0.1", 80, ProxyProtocol::Http));
        let cooling = repo.upsert(ProxyEndpoint::new("10.0.1.1", 80, ProxyProtocol::Http));
        let banned = repo.upsert(ProxyEndpoint::new("10.0.2.1", 80, ProxyProtocol::Http));

        repo.with_record(cooling, |r| {
            engine.cooldown.on_outcome(r, Outcome::HardBlock, now);
        })
        .unwrap();
        repo.mark_state(banned, ProxyState::Banned, now).unwrap();

        let early = PoolSnapshot::capture(&repo, &engine, None, now + chrono::Duration::seconds(30));
        let ids: Vec<RecordId> = early.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![active]);

        let late = PoolSnapshot::capture(&repo, &engine, None, now + chrono::Duration::seconds(61));
        let ids: Vec<RecordId> = late.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![active, cooling]);
        assert!(repo.get(cooling).unwrap().is_active());
    }

    #[test]
    fn test_capture_applies_geo_to_rank_score_only() {
        let repo = ProxyRepository::new();
        let engine = PolicyEngine::new(PolicyConfig::default()).unwrap();
        let us = repo.upsert(ProxyEndpoint::new("10.0.0.1", 80, ProxyProtocol::Http).with_geo("US"));
        repo.upsert(ProxyEndpoint::new("10.0.1.1", 80, ProxyProtocol::Http).with_geo("DE"));

        let snapshot = PoolSnapshot::capture(&repo, &engine, Some("US"), Utc::now());
        let entries = snapshot.entries();
        assert_eq!(entries[0].id, us);
        assert!(entries[0].rank_score > entries[1].rank_score);
        assert_eq!(entries[0].score, entries[1].score);
    }
}
