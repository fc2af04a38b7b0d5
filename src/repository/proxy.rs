use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Result, RotaError};
use crate::models::{ProxyEndpoint, ProxyRecord, ProxyState, ProxySummary, RecordId};
use crate::proxy::cooldown::{validate_transition, StateChange};

/// Serialisable copy of the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryState {
    pub records: Vec<ProxyRecord>,
    /// Banned proxy URLs whose records have since been removed
    #[serde(default)]
    pub banned: Vec<String>,
}

/// In-memory store of every known proxy
///
/// Each record sits behind its own lock, so updates to one proxy never wait
/// on updates to another. A banned proxy that leaves the store is remembered
/// by URL and comes back `Banned` if it is ingested again, until [`pardon`].
///
/// [`pardon`]: ProxyRepository::pardon
#[derive(Debug, Default)]
pub struct ProxyRepository {
    records: DashMap<RecordId, Arc<Mutex<ProxyRecord>>>,
    by_url: DashMap<String, RecordId>,
    banned: DashSet<String>,
    next_id: AtomicU64,
}

impl ProxyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a proxy, or refresh the declared attributes of a known one
    pub fn upsert(&self, endpoint: ProxyEndpoint) -> RecordId {
        self.upsert_at(endpoint, Utc::now())
    }

    pub fn upsert_at(&self, endpoint: ProxyEndpoint, now: DateTime<Utc>) -> RecordId {
        match self.by_url.entry(endpoint.url()) {
            Entry::Occupied(entry) => {
                let id = *entry.get();
                if let Some(record) = self.records.get(&id) {
                    let mut record = record.lock();
                    if endpoint.geo.is_some() {
                        record.endpoint.geo = endpoint.geo;
                    }
                    if endpoint.base_score.is_some() {
                        record.endpoint.base_score = endpoint.base_score;
                    }
                    record.updated_at = now;
                }
                id
            }
            Entry::Vacant(entry) => {
                let id = self.allocate_id();
                let mut record = ProxyRecord::new(id, endpoint, now);
                if self.banned.contains(entry.key()) {
                    record.set_state(ProxyState::Banned, now);
                    warn!(proxy_id = %id, address = %record.endpoint.address(), "Banned proxy ingested again; keeping it banned");
                } else {
                    info!(proxy_id = %id, address = %record.endpoint.address(), protocol = %record.endpoint.protocol, "Proxy added");
                }
                self.records.insert(id, Arc::new(Mutex::new(record)));
                entry.insert(id);
                id
            }
        }
    }

    fn allocate_id(&self) -> RecordId {
        RecordId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Copy of the current record
    pub fn get(&self, id: RecordId) -> Result<ProxyRecord> {
        self.with_record(id, |record| record.clone())
    }

    /// Run `f` with exclusive access to one record
    pub fn with_record<T>(&self, id: RecordId, f: impl FnOnce(&mut ProxyRecord) -> T) -> Result<T> {
        let record = self
            .records
            .get(&id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(RotaError::NotFound { id })?;
        let mut guard = record.lock();
        Ok(f(&mut guard))
    }

    /// Lazily walk the records that are `Active` at the time each one is reached
    pub fn list_active(&self) -> ActiveRecords<'_> {
        ActiveRecords {
            repo: self,
            ids: self.ids(),
            pos: 0,
        }
    }

    /// Apply a state change requested from outside the feedback loop
    pub fn mark_state(&self, id: RecordId, state: ProxyState, now: DateTime<Utc>) -> Result<ProxyState> {
        let change = self.with_record(id, |record| {
            validate_transition(id, record.state, state, now)?;
            let from = record.set_state(state, now);
            Ok::<_, RotaError>((record.endpoint.address(), StateChange { from, to: state }))
        })?;

        match change {
            Ok((address, change)) => {
                log_transition(id, &address, &change);
                Ok(change.from)
            }
            Err(err) => {
                warn!(proxy_id = %id, error = %err, "Rejected state change");
                Err(err)
            }
        }
    }

    /// All ids, ascending
    pub fn ids(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn remove(&self, id: RecordId) -> Result<ProxyRecord> {
        let (_, record) = self.records.remove(&id).ok_or(RotaError::NotFound { id })?;
        let record = record.lock().clone();
        let url = record.endpoint.url();
        self.by_url.remove(&url);
        if record.state == ProxyState::Banned {
            self.banned.insert(url);
        }
        info!(proxy_id = %id, address = %record.endpoint.address(), "Proxy removed");
        Ok(record)
    }

    /// Remove records that have been unusable for at least `older_than`
    ///
    /// A record qualifies when it has been `Banned` that long, or when it has
    /// failed, has not succeeded within the period and is older than it.
    pub fn prune(&self, now: DateTime<Utc>, older_than: chrono::Duration) -> Vec<RecordId> {
        let stale: Vec<RecordId> = self
            .ids()
            .into_iter()
            .filter(|id| {
                self.with_record(*id, |r| is_unreachable(r, now, older_than))
                    .unwrap_or(false)
            })
            .collect();

        stale
            .into_iter()
            .filter(|id| self.remove(*id).is_ok())
            .collect()
    }

    /// Forget a remembered ban so the URL is ingested as a fresh proxy
    pub fn pardon(&self, url: &str) -> bool {
        self.banned.remove(url).is_some()
    }

    pub fn is_banned_url(&self, url: &str) -> bool {
        self.banned.contains(url)
    }

    /// Copy every record and remembered ban
    pub fn export(&self) -> RepositoryState {
        let records = self
            .ids()
            .into_iter()
            .filter_map(|id| self.get(id).ok())
            .collect();
        let mut banned: Vec<String> = self.banned.iter().map(|url| url.key().clone()).collect();
        banned.sort();
        RepositoryState { records, banned }
    }

    /// Restore records saved by [`export`](ProxyRepository::export)
    ///
    /// A saved record replaces the learned state of a proxy already known by
    /// URL and keeps that proxy's id; unknown proxies get fresh ids.
    pub fn import(&self, state: RepositoryState) -> usize {
        for url in state.banned {
            self.banned.insert(url);
        }

        let mut restored = 0;
        for mut record in state.records {
            record.subnet = record.endpoint.subnet_key();
            match self.by_url.entry(record.endpoint.url()) {
                Entry::Occupied(entry) => {
                    let id = *entry.get();
                    if let Some(slot) = self.records.get(&id) {
                        record.id = id;
                        *slot.lock() = record;
                        restored += 1;
                    }
                }
                Entry::Vacant(entry) => {
                    let id = self.allocate_id();
                    record.id = id;
                    self.records.insert(id, Arc::new(Mutex::new(record)));
                    entry.insert(id);
                    restored += 1;
                }
            }
        }
        restored
    }

    pub fn summaries(&self) -> Vec<ProxySummary> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.with_record(id, |r| ProxySummary::from(&*r)).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Restartable iterator over `Active` records
///
/// Record states are read as iteration reaches them, not when the iterator
/// is created.
pub struct ActiveRecords<'a> {
    repo: &'a ProxyRepository,
    ids: Vec<RecordId>,
    pos: usize,
}

impl ActiveRecords<'_> {
    /// Start over from the first record; ids added since creation are picked up
    pub fn restart(&mut self) {
        self.ids = self.repo.ids();
        self.pos = 0;
    }
}

impl Iterator for ActiveRecords<'_> {
    type Item = ProxyRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.ids.get(self.pos).copied() {
            self.pos += 1;
            let record = self
                .repo
                .with_record(id, |r| r.is_active().then(|| r.clone()))
                .ok()
                .flatten();
            if record.is_some() {
                return record;
            }
        }
        None
    }
}

fn is_unreachable(record: &ProxyRecord, now: DateTime<Utc>, older_than: chrono::Duration) -> bool {
    match record.state {
        ProxyState::Banned => now - record.state_changed_at >= older_than,
        _ => {
            record.stats.total_failures() > 0
                && now - record.created_at >= older_than
                && record
                    .stats
                    .last_success
                    .map_or(true, |t| now - t >= older_than)
        }
    }
}

/// Log a record state change at a level matching its severity
pub(crate) fn log_transition(id: RecordId, address: &str, change: &StateChange) {
    if change.from == change.to {
        return;
    }
    match change.to {
        ProxyState::Active => {
            info!(proxy_id = %id, address = %address, from = %change.from, to = %change.to, "Proxy state changed")
        }
        ProxyState::Cooling { resume_at } => {
            warn!(proxy_id = %id, address = %address, from = %change.from, to = %change.to, resume_at = %resume_at, "Proxy cooling down")
        }
        ProxyState::Banned => {
            warn!(proxy_id = %id, address = %address, from = %change.from, to = %change.to, "Proxy banned")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Outcome, ProxyProtocol};

    fn endpoint(host: &str) -> ProxyEndpoint {
        ProxyEndpoint::new(host, 8080, ProxyProtocol::Http)
    }

    #[test]
    fn test_upsert_is_idempotent_per_address() {
        let repo = ProxyRepository::new();
        let a = repo.upsert(endpoint("10.0.0.1"));
        let b = repo.upsert(endpoint("10.0.0.2"));
        let again = repo.upsert(endpoint("10.0.0.1").with_geo("de"));

        assert_ne!(a, b);
        assert_eq!(a, again);
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.get(a).unwrap().geo(), Some("DE"));
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let repo = ProxyRepository::new();
        assert!(matches!(
            repo.get(RecordId(42)),
            Err(RotaError::NotFound { id: RecordId(42) })
        ));
        assert!(repo
            .mark_state(RecordId(42), ProxyState::Banned, Utc::now())
            .is_err());
    }

    #[test]
    fn test_list_active_is_lazy_and_restartable() {
        let repo = ProxyRepository::new();
        let now = Utc::now();
        let a = repo.upsert(endpoint("10.0.0.1"));
        let b = repo.upsert(endpoint("10.0.1.1"));

        let mut active = repo.list_active();
        assert_eq!(active.next().map(|r| r.id), Some(a));

        // State is read when the iterator reaches the record
        repo.mark_state(b, ProxyState::Banned, now).unwrap();
        assert!(active.next().is_none());

        let c = repo.upsert(endpoint("10.0.2.1"));
        active.restart();
        let ids: Vec<RecordId> = active.map(|r| r.id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn test_mark_state_validates() {
        let repo = ProxyRepository::new();
        let now = Utc::now();
        let id = repo.upsert(endpoint("10.0.0.1"));

        let past = ProxyState::Cooling {
            resume_at: now - chrono::Duration::seconds(1),
        };
        assert!(matches!(
            repo.mark_state(id, past, now),
            Err(RotaError::InvalidTransition { .. })
        ));

        let future = ProxyState::Cooling {
            resume_at: now + chrono::Duration::seconds(60),
        };
        assert_eq!(repo.mark_state(id, future, now).unwrap(), ProxyState::Active);
        assert_eq!(repo.get(id).unwrap().state, future);

        repo.mark_state(id, ProxyState::Banned, now).unwrap();
        assert!(repo.mark_state(id, ProxyState::Active, now).is_err());
    }

    #[test]
    fn test_pruned_ban_survives_reingest() {
        let repo = ProxyRepository::new();
        let start = Utc::now();
        let later = start + chrono::Duration::days(4);

        let id = repo.upsert_at(endpoint("10.9.0.1"), start);
        repo.mark_state(id, ProxyState::Banned, start).unwrap();
        assert_eq!(repo.prune(later, chrono::Duration::days(3)), vec![id]);
        assert!(repo.is_banned_url("http://10.9.0.1:8080"));

        let again = repo.upsert_at(endpoint("10.9.0.1"), later);
        assert_ne!(again, id);
        assert_eq!(repo.get(again).unwrap().state, ProxyState::Banned);
        assert_eq!(repo.list_active().count(), 0);

        repo.remove(again).unwrap();
        assert!(repo.pardon("http://10.9.0.1:8080"));
        let fresh = repo.upsert_at(endpoint("10.9.0.1"), later);
        assert!(repo.get(fresh).unwrap().is_active());
    }

    #[test]
    fn test_export_import_keeps_learned_state() {
        let source = ProxyRepository::new();
        let now = Utc::now();
        let a = source.upsert_at(endpoint("10.0.0.1"), now);
        let b = source.upsert_at(endpoint("10.0.1.1"), now);
        source
            .with_record(a, |r| {
                r.stats.record_outcome(Outcome::Success, now);
                r.ewma_success = 0.83;
                r.score = 0.83;
            })
            .unwrap();
        source.mark_state(b, ProxyState::Banned, now).unwrap();
        let gone = source.upsert_at(endpoint("10.0.2.1"), now);
        source.mark_state(gone, ProxyState::Banned, now).unwrap();
        source.remove(gone).unwrap();

        let json = serde_json::to_string(&source.export()).unwrap();
        let state: RepositoryState = serde_json::from_str(&json).unwrap();

        let target = ProxyRepository::new();
        let known = target.upsert_at(endpoint("10.0.1.1"), now);
        assert_eq!(target.import(state), 2);
        assert_eq!(target.len(), 2);

        // Known URL keeps its id and takes the saved state
        assert_eq!(target.get(known).unwrap().state, ProxyState::Banned);
        let restored = target
            .ids()
            .into_iter()
            .find(|id| *id != known)
            .unwrap();
        let record = target.get(restored).unwrap();
        assert_eq!(record.id, restored);
        assert_eq!(record.stats.successes, 1);
        assert!((record.ewma_success - 0.83).abs() < 1e-12);

        let back = target.upsert_at(endpoint("10.0.2.1"), now);
        assert_eq!(target.get(back).unwrap().state, ProxyState::Banned);

        // New ids never collide with restored ones
        let next = target.upsert_at(endpoint("10.0.3.1"), now);
        assert!(target.ids().iter().filter(|id| **id == next).count() == 1);
    }

    #[test]
    fn test_prune_unreachable() {
        let repo = ProxyRepository::new();
        let start = Utc::now();
        let later = start + chrono::Duration::days(4);
        let period = chrono::Duration::days(3);

        let dead = repo.upsert_at(endpoint("10.0.0.1"), start);
        let healthy = repo.upsert_at(endpoint("10.0.1.1"), start);
        let fresh = repo.upsert_at(endpoint("10.0.2.1"), later);
        let banned = repo.upsert_at(endpoint("10.0.3.1"), start);

        repo.with_record(dead, |r| r.stats.record_outcome(Outcome::Timeout, start))
            .unwrap();
        repo.with_record(healthy, |r| {
            r.stats.record_outcome(Outcome::Timeout, start);
            r.stats.record_outcome(Outcome::Success, later);
        })
        .unwrap();
        repo.with_record(fresh, |r| r.stats.record_outcome(Outcome::Timeout, later))
            .unwrap();
        repo.mark_state(banned, ProxyState::Banned, start).unwrap();

        let mut pruned = repo.prune(later, period);
        pruned.sort();
        assert_eq!(pruned, vec![dead, banned]);
        assert_eq!(repo.ids(), vec![healthy, fresh]);

        // Removed addresses can be ingested again under a new id
        let back = repo.upsert(endpoint("10.0.0.1"));
        assert_ne!(back, dead);
    }
}
