//! Selection scheduler
//!
//! `select` runs snapshot, filter, rank and commit under one lock so that
//! concurrent callers always see each other's picks in the diversity window
//! and in the in-flight tracker. Feedback never takes this lock.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::snapshot::{PoolSnapshot, SnapshotEntry};
use super::{Candidate, InFlightTracker};
use crate::error::{Result, RotaError};
use crate::models::{FingerprintProfile, ProxyEndpoint, RecordId, Session, SubnetKey};
use crate::proxy::cooldown::chrono_duration;
use crate::proxy::policy::SharedPolicy;
use crate::proxy::session::SessionBinder;
use crate::repository::ProxyRepository;

/// Per-request restrictions on which proxy may be chosen
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionConstraints {
    /// Skip subnets used by the last K assignments
    pub diversify: bool,
    /// Overrides the policy's score floor
    pub min_score: Option<f64>,
    /// Country code to prefer when ranking
    pub geo: Option<String>,
    /// Proxies not to use, e.g. the one a retried request just failed on
    pub avoid: Vec<RecordId>,
}

impl Default for SelectionConstraints {
    fn default() -> Self {
        Self {
            diversify: true,
            min_score: None,
            geo: None,
            avoid: Vec::new(),
        }
    }
}

impl SelectionConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_diversity(mut self) -> Self {
        self.diversify = false;
        self
    }

    pub fn with_min_score(mut self, floor: f64) -> Self {
        self.min_score = Some(floor.clamp(0.0, 1.0));
        self
    }

    pub fn with_geo(mut self, geo: impl Into<String>) -> Self {
        self.geo = Some(geo.into().trim().to_uppercase());
        self
    }

    pub fn avoiding(mut self, id: RecordId) -> Self {
        self.avoid.push(id);
        self
    }
}

/// Everything a dispatcher needs to send one request
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Identifies this request when reporting its outcome
    pub request_id: Uuid,
    pub proxy_id: RecordId,
    pub endpoint: ProxyEndpoint,
    pub subnet: SubnetKey,
    pub session: Arc<Session>,
    pub fingerprint: Arc<FingerprintProfile>,
    pub issued_at: DateTime<Utc>,
}

impl Assignment {
    pub fn proxy_url(&self) -> String {
        self.endpoint.url()
    }
}

struct SchedulerState {
    recent_subnets: VecDeque<SubnetKey>,
    rng: StdRng,
}

pub struct SelectionScheduler {
    repo: Arc<ProxyRepository>,
    sessions: Arc<SessionBinder>,
    tracker: Arc<InFlightTracker>,
    policy: SharedPolicy,
    state: Mutex<SchedulerState>,
}

impl SelectionScheduler {
    pub fn new(
        repo: Arc<ProxyRepository>,
        sessions: Arc<SessionBinder>,
        tracker: Arc<InFlightTracker>,
        policy: SharedPolicy,
    ) -> Self {
        let rng = match policy.load().config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            repo,
            sessions,
            tracker,
            policy,
            state: Mutex::new(SchedulerState {
                recent_subnets: VecDeque::new(),
                rng,
            }),
        }
    }

    pub fn select(&self, constraints: &SelectionConstraints) -> Result<Assignment> {
        self.select_at(constraints, Utc::now())
    }

    /// Choose a proxy and session for one outgoing request
    ///
    /// Fails fast with `PoolExhausted` when nothing survives filtering.
    pub fn select_at(
        &self,
        constraints: &SelectionConstraints,
        now: DateTime<Utc>,
    ) -> Result<Assignment> {
        let engine = self.policy.load();
        let mut state = self.state.lock();

        let snapshot = PoolSnapshot::capture(&self.repo, &engine, constraints.geo.as_deref(), now);
        let window: HashSet<&SubnetKey> = if constraints.diversify {
            state.recent_subnets.iter().collect()
        } else {
            HashSet::new()
        };

        let floor = constraints.min_score.unwrap_or(engine.config.score_floor);
        let reuse = chrono_duration(engine.config.min_reuse_interval());

        let mut candidates: Vec<Candidate> = snapshot
            .entries()
            .iter()
            .filter(|e| e.score >= floor)
            .filter(|e| !constraints.avoid.contains(&e.id))
            .filter(|e| !(engine.config.exclusive && self.tracker.is_busy(e.id)))
            .filter(|e| reuse_elapsed(e, reuse, now))
            .filter(|e| !window.contains(&e.subnet))
            .map(|e| Candidate {
                id: e.id,
                score: e.rank_score,
                subnet: e.subnet.clone(),
            })
            .collect();
        drop(window);

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));

        while !candidates.is_empty() {
            let idx = engine
                .ranker
                .pick(&candidates, &mut state.rng)
                .unwrap_or(0)
                .min(candidates.len() - 1);
            let chosen = candidates.swap_remove(idx);

            // Feedback may have moved the record since the snapshot was taken.
            // Session and lease are taken under the record lock so a report
            // that deactivates the proxy always sees and retires them.
            let committed = self
                .repo
                .with_record(chosen.id, |record| {
                    if !record.is_active() {
                        return None;
                    }
                    record.last_assigned = Some(now);
                    record.stats.assignments += 1;
                    record.updated_at = now;

                    let session = self.sessions.bind_at(chosen.id, record.geo(), now);
                    let request_id = Uuid::new_v4();
                    self.tracker.acquire(request_id, chosen.id, now);
                    Some((record.endpoint.clone(), session, request_id))
                })
                .ok()
                .flatten();
            let Some((endpoint, session, request_id)) = committed else {
                candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
                continue;
            };

            let window_size = engine.config.diversity_window;
            if window_size > 0 {
                state.recent_subnets.push_back(chosen.subnet.clone());
                while state.recent_subnets.len() > window_size {
                    state.recent_subnets.pop_front();
                }
            }

            debug!(
                proxy_id = %chosen.id,
                address = %endpoint.address(),
                subnet = %chosen.subnet,
                score = chosen.score,
                ranking = engine.ranker.strategy_name(),
                request_id = %request_id,
                "Proxy selected"
            );

            return Ok(Assignment {
                request_id,
                proxy_id: chosen.id,
                endpoint,
                subnet: chosen.subnet,
                fingerprint: Arc::clone(&session.fingerprint),
                session,
                issued_at: now,
            });
        }

        warn!(
            active = snapshot.len(),
            total = self.repo.len(),
            floor = floor,
            diversify = constraints.diversify,
            "No eligible proxy available"
        );
        Err(RotaError::PoolExhausted {
            active: snapshot.len(),
        })
    }

    /// Subnets currently blocked by the diversity window, oldest first
    pub fn recent_subnets(&self) -> Vec<SubnetKey> {
        self.state.lock().recent_subnets.iter().cloned().collect()
    }

    pub fn clear_window(&self) {
        self.state.lock().recent_subnets.clear();
    }
}

/// Reuse interval multiplier for proxies with more failures than successes
const STRUGGLING_REUSE_FACTOR: i32 = 5;

/// Whether the minimum reuse interval has passed
fn reuse_elapsed(entry: &SnapshotEntry, interval: chrono::Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = entry.last_assigned else {
        return true;
    };
    let interval = if entry.struggling {
        interval * STRUGGLING_REUSE_FACTOR
    } else {
        interval
    };
    now - last >= interval
}
