//! Adaptive proxy pool
//!
//! Wires the record store, scheduler, session binder and feedback path
//! around one shared, hot-swappable policy. Every method is synchronous and
//! either completes or leaves no trace, so callers in async code can use it
//! directly from any task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, PolicyConfig, SessionConfig};
use crate::error::Result;
use crate::models::{
    Outcome, OutcomeReport, PoolStats, ProxyEndpoint, ProxyRecord, ProxyState, RecordId,
};
use crate::proxy::feedback::{FeedbackIngestor, ReportAck};
use crate::proxy::policy::{shared, PolicyEngine, SharedPolicy};
use crate::proxy::rotation::{Assignment, InFlightTracker, SelectionConstraints, SelectionScheduler};
use crate::proxy::session::SessionBinder;
use crate::repository::proxy::log_transition;
use crate::repository::{ActiveRecords, ProxyRepository, RepositoryState};

/// Learned pool state as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolState {
    pub saved_at: DateTime<Utc>,
    #[serde(flatten)]
    pub store: RepositoryState,
}

pub struct AdaptivePool {
    repo: Arc<ProxyRepository>,
    sessions: Arc<SessionBinder>,
    tracker: Arc<InFlightTracker>,
    policy: SharedPolicy,
    scheduler: SelectionScheduler,
    feedback: FeedbackIngestor,
}

impl AdaptivePool {
    /// Build an empty pool; fails when the policy is inconsistent
    pub fn new(policy: PolicyConfig, session: SessionConfig) -> Result<Self> {
        let seed = policy.seed;
        let policy = shared(PolicyEngine::new(policy)?);
        let repo = Arc::new(ProxyRepository::new());
        let sessions = Arc::new(SessionBinder::new(session, seed));
        let tracker = Arc::new(InFlightTracker::new());

        let scheduler = SelectionScheduler::new(
            Arc::clone(&repo),
            Arc::clone(&sessions),
            Arc::clone(&tracker),
            Arc::clone(&policy),
        );
        let feedback = FeedbackIngestor::new(
            Arc::clone(&repo),
            Arc::clone(&sessions),
            Arc::clone(&tracker),
            Arc::clone(&policy),
        );

        Ok(Self {
            repo,
            sessions,
            tracker,
            policy,
            scheduler,
            feedback,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.policy.clone(), config.session.clone())
    }

    // Ingestion

    pub fn ingest(&self, endpoint: ProxyEndpoint) -> RecordId {
        self.ingest_at(endpoint, Utc::now())
    }

    pub fn ingest_at(&self, endpoint: ProxyEndpoint, now: DateTime<Utc>) -> RecordId {
        let id = self.repo.upsert_at(endpoint, now);
        let engine = self.policy.load();
        // Geo may have changed on re-ingest
        let _ = self.repo.with_record(id, |record| engine.scorer.rescore(record));
        id
    }

    pub fn ingest_all(&self, endpoints: impl IntoIterator<Item = ProxyEndpoint>) -> Vec<RecordId> {
        let now = Utc::now();
        endpoints
            .into_iter()
            .map(|endpoint| self.ingest_at(endpoint, now))
            .collect()
    }

    // Queries

    pub fn get(&self, id: RecordId) -> Result<ProxyRecord> {
        self.repo.get(id)
    }

    pub fn list_active(&self) -> ActiveRecords<'_> {
        self.repo.list_active()
    }

    pub fn len(&self) -> usize {
        self.repo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repo.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats_at(Utc::now())
    }

    /// Point-in-time summary for dashboards
    pub fn stats_at(&self, now: DateTime<Utc>) -> PoolStats {
        let mut stats = PoolStats::from_summaries(self.repo.summaries(), now);
        stats.in_flight = self.tracker.total();
        stats.live_sessions = self.sessions.len();
        stats
    }

    /// Current policy
    pub fn policy(&self) -> PolicyConfig {
        self.policy.load().config.clone()
    }

    // Selection and feedback

    pub fn select(&self, constraints: &SelectionConstraints) -> Result<Assignment> {
        self.scheduler.select(constraints)
    }

    pub fn select_at(&self, constraints: &SelectionConstraints, now: DateTime<Utc>) -> Result<Assignment> {
        self.scheduler.select_at(constraints, now)
    }

    /// Report the outcome of an assignment; latency is measured from issue time
    pub fn report(&self, assignment: &Assignment, outcome: Outcome) -> Result<ReportAck> {
        self.report_at(assignment, outcome, Utc::now())
    }

    pub fn report_at(
        &self,
        assignment: &Assignment,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<ReportAck> {
        let mut report = OutcomeReport::new(assignment.request_id, assignment.proxy_id, outcome);
        if let Ok(latency) = (now - assignment.issued_at).to_std() {
            report = report.with_latency(latency);
        }
        self.feedback.submit_at(&report, now)
    }

    /// Report with an explicit request id and latency
    pub fn submit(&self, report: &OutcomeReport) -> Result<ReportAck> {
        self.feedback.submit(report)
    }

    pub fn submit_at(&self, report: &OutcomeReport, now: DateTime<Utc>) -> Result<ReportAck> {
        self.feedback.submit_at(report, now)
    }

    /// Give back an assignment whose request was never sent
    pub fn release(&self, assignment: &Assignment) -> bool {
        self.tracker.release(&assignment.request_id).is_some()
    }

    // Operator controls

    /// Return a proxy to `Active` from any state, clearing its failure streaks.
    /// Outcome history is kept; the success average is lifted back to the
    /// proxy's prior if it had fallen below it.
    pub fn reset(&self, id: RecordId) -> Result<()> {
        self.reset_at(id, Utc::now())
    }

    pub fn reset_at(&self, id: RecordId, now: DateTime<Utc>) -> Result<()> {
        let engine = self.policy.load();
        let (address, url, change) = self.repo.with_record(id, |record| {
            let change = engine.cooldown.reset(record, now);
            let prior = record
                .endpoint
                .base_score
                .unwrap_or(ProxyRecord::DEFAULT_PRIOR);
            record.ewma_success = record.ewma_success.max(prior);
            engine.scorer.rescore(record);
            (record.endpoint.address(), record.endpoint.url(), change)
        })?;

        self.repo.pardon(&url);
        if let Some(change) = change {
            log_transition(id, &address, &change);
        }
        info!(proxy_id = %id, address = %address, "Proxy reset by operator");
        Ok(())
    }

    pub fn ban(&self, id: RecordId) -> Result<()> {
        self.ban_at(id, Utc::now())
    }

    pub fn ban_at(&self, id: RecordId, now: DateTime<Utc>) -> Result<()> {
        let engine = self.policy.load();
        let (address, change) = self.repo.with_record(id, |record| {
            (record.endpoint.address(), engine.cooldown.ban(record, now))
        })?;

        if let Some(change) = change {
            log_transition(id, &address, &change);
        }
        self.retire(id);
        Ok(())
    }

    /// Validated direct state change
    pub fn mark_state(&self, id: RecordId, state: ProxyState, now: DateTime<Utc>) -> Result<ProxyState> {
        let previous = self.repo.mark_state(id, state, now)?;
        if !state.is_active() {
            self.sessions.invalidate(id);
        }
        Ok(previous)
    }

    pub fn remove(&self, id: RecordId) -> Result<ProxyRecord> {
        let record = self.repo.remove(id)?;
        self.retire(id);
        Ok(record)
    }

    /// Drop proxies that have been unusable for the policy's prune period
    pub fn prune_unreachable(&self, now: DateTime<Utc>) -> Vec<RecordId> {
        let period = self.policy.load().config.prune_after();
        let pruned = self.repo.prune(now, period);
        for id in &pruned {
            self.retire(*id);
        }
        if !pruned.is_empty() {
            info!(count = pruned.len(), "Pruned unreachable proxies");
        }
        pruned
    }

    pub fn sweep_sessions(&self, now: DateTime<Utc>) -> usize {
        self.sessions.sweep_expired(now)
    }

    /// Free proxies held by assignments that were never reported or released
    pub fn release_stale_leases(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.policy.load().config.lease_timeout();
        let released = self.tracker.release_stale(cutoff).len();
        if released > 0 {
            warn!(count = released, "Released assignments that were never reported");
        }
        released
    }

    // Persistence

    /// Copy of every record's learned state and every remembered ban
    pub fn export_state(&self) -> PoolState {
        PoolState {
            saved_at: Utc::now(),
            store: self.repo.export(),
        }
    }

    /// Merge saved state into the pool and rescore it under the current policy
    pub fn import_state(&self, state: PoolState) -> usize {
        let restored = self.repo.import(state.store);
        let engine = self.policy.load();
        for id in self.repo.ids() {
            let _ = self.repo.with_record(id, |record| engine.scorer.rescore(record));
        }
        info!(restored, saved_at = %state.saved_at, "Pool state restored");
        restored
    }

    /// Write the pool state as JSON, replacing `path` atomically
    pub async fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let state = self.export_state();
        let json = serde_json::to_vec_pretty(&state)?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!(path = %path.display(), records = state.store.records.len(), "Pool state saved");
        Ok(())
    }

    /// Load state written by [`save_state`](AdaptivePool::save_state); a
    /// missing file restores nothing
    pub async fn load_state(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No saved pool state");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let state: PoolState = serde_json::from_slice(&raw)?;
        Ok(self.import_state(state))
    }

    /// Swap in a new policy and rescore every record under it
    pub fn update_policy(&self, policy: PolicyConfig) -> Result<()> {
        let engine = PolicyEngine::new(policy)?;
        for id in self.repo.ids() {
            let _ = self.repo.with_record(id, |record| engine.scorer.rescore(record));
        }
        info!(
            ranking = engine.ranker.strategy_name(),
            score_floor = engine.config.score_floor,
            diversity_window = engine.config.diversity_window,
            "Policy updated"
        );
        self.policy.store(Arc::new(engine));
        Ok(())
    }

    fn retire(&self, id: RecordId) {
        self.sessions.invalidate(id);
        self.tracker.release_proxy(id);
    }
}
