//! Outcome feedback
//!
//! Reports for different proxies proceed in parallel; reports for the same
//! proxy serialize on that record's lock. Each request id is applied at most
//! once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Outcome, OutcomeReport, ProxyState};
use crate::proxy::policy::SharedPolicy;
use crate::proxy::rotation::InFlightTracker;
use crate::proxy::session::SessionBinder;
use crate::repository::proxy::{log_transition, ProxyRepository};

/// How many request ids are remembered for duplicate detection
pub const DEDUP_CAPACITY: usize = 65_536;

/// Result of submitting a report
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReportAck {
    /// The outcome was folded into the proxy's state
    Applied { state: ProxyState, score: f64 },
    /// A report with this request id was already applied
    Duplicate,
}

/// Bounded FIFO set of request ids
#[derive(Debug)]
struct SeenRequests {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl SeenRequests {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// False when the id was already present
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    fn forget(&mut self, id: &Uuid) {
        if self.ids.remove(id) {
            self.order.retain(|seen| seen != id);
        }
    }
}

pub struct FeedbackIngestor {
    repo: Arc<ProxyRepository>,
    sessions: Arc<SessionBinder>,
    tracker: Arc<InFlightTracker>,
    policy: SharedPolicy,
    seen: Mutex<SeenRequests>,
}

impl FeedbackIngestor {
    pub fn new(
        repo: Arc<ProxyRepository>,
        sessions: Arc<SessionBinder>,
        tracker: Arc<InFlightTracker>,
        policy: SharedPolicy,
    ) -> Self {
        Self::with_capacity(repo, sessions, tracker, policy, DEDUP_CAPACITY)
    }

    pub fn with_capacity(
        repo: Arc<ProxyRepository>,
        sessions: Arc<SessionBinder>,
        tracker: Arc<InFlightTracker>,
        policy: SharedPolicy,
        capacity: usize,
    ) -> Self {
        Self {
            repo,
            sessions,
            tracker,
            policy,
            seen: Mutex::new(SeenRequests::new(capacity)),
        }
    }

    pub fn submit(&self, report: &OutcomeReport) -> Result<ReportAck> {
        self.submit_at(report, Utc::now())
    }

    /// Apply one outcome: stats, score, then the cooldown state machine
    pub fn submit_at(&self, report: &OutcomeReport, now: DateTime<Utc>) -> Result<ReportAck> {
        if !self.seen.lock().insert(report.request_id) {
            debug!(
                proxy_id = %report.proxy_id,
                request_id = %report.request_id,
                "Duplicate report ignored"
            );
            return Ok(ReportAck::Duplicate);
        }

        let engine = self.policy.load();
        let applied = self.repo.with_record(report.proxy_id, |record| {
            record.stats.record_outcome(report.outcome, now);
            if let Some(latency) = report.latency {
                record.stats.record_latency(latency);
            }
            let score = engine.scorer.apply(record, report.outcome, report.latency);
            let change = engine.cooldown.on_outcome(record, report.outcome, now);
            record.updated_at = now;
            (score, change, record.state, record.endpoint.address())
        });

        let (score, change, state, address) = match applied {
            Ok(applied) => applied,
            Err(err) => {
                self.seen.lock().forget(&report.request_id);
                return Err(err);
            }
        };

        self.tracker.release(&report.request_id);
        if let Some(change) = change {
            log_transition(report.proxy_id, &address, &change);
        }

        if !state.is_active() || report.outcome.is_hard_block() {
            self.sessions.invalidate(report.proxy_id);
        } else if report.outcome == Outcome::SoftBlock {
            self.sessions.clear_cookies(report.proxy_id);
        }

        debug!(
            proxy_id = %report.proxy_id,
            request_id = %report.request_id,
            outcome = %report.outcome,
            score = score,
            state = %state,
            "Outcome applied"
        );
        Ok(ReportAck::Applied { state, score })
    }
}
