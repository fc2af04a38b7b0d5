use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::fingerprint::FingerprintProfile;
use super::proxy::RecordId;
use crate::config::SessionConfig;

const REFERRER_CHAIN_LIMIT: usize = 16;

/// Mutable part of a session: cookies and navigation history
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub cookies: BTreeMap<String, String>,
    pub referrer_chain: VecDeque<String>,
    pub last_used: DateTime<Utc>,
    pub request_count: u64,
}

/// Persistent browsing identity bound to one proxy
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub proxy_id: RecordId,
    pub fingerprint: Arc<FingerprintProfile>,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    invalidated: AtomicBool,
}

impl Session {
    pub fn new(
        proxy_id: RecordId,
        fingerprint: Arc<FingerprintProfile>,
        entry_referrer: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut referrer_chain = VecDeque::new();
        if let Some(referrer) = entry_referrer {
            referrer_chain.push_back(referrer);
        }

        Self {
            id: Uuid::new_v4(),
            proxy_id,
            fingerprint,
            created_at: now,
            state: Mutex::new(SessionState {
                cookies: BTreeMap::new(),
                referrer_chain,
                last_used: now,
                request_count: 0,
            }),
            invalidated: AtomicBool::new(false),
        }
    }

    /// Count one more request against the session
    pub(crate) fn touch(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.request_count += 1;
        state.last_used = now;
    }

    pub fn request_count(&self) -> u64 {
        self.state.lock().request_count
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.state.lock().last_used
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.lock().cookies.insert(name.into(), value.into());
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.state.lock().cookies.get(name).cloned()
    }

    pub fn clear_cookies(&self) {
        self.state.lock().cookies.clear();
    }

    /// Record a visited URL; it becomes the referrer of the next request
    pub fn push_referrer(&self, url: impl Into<String>) {
        let mut state = self.state.lock();
        state.referrer_chain.push_back(url.into());
        while state.referrer_chain.len() > REFERRER_CHAIN_LIMIT {
            state.referrer_chain.pop_front();
        }
    }

    pub fn current_referrer(&self) -> Option<String> {
        self.state.lock().referrer_chain.back().cloned()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    /// Too old or too heavily used to keep presenting the same identity
    pub fn is_expired(&self, config: &SessionConfig, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_seconds() >= config.max_age_secs as i64
            || self.request_count() >= config.max_requests
    }

    pub fn is_reusable(&self, config: &SessionConfig, now: DateTime<Utc>) -> bool {
        !self.is_invalidated() && !self.is_expired(config, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::fingerprint::FingerprintGenerator;

    fn session(now: DateTime<Utc>) -> Session {
        let fp = FingerprintGenerator::generate_with_seed(7, None);
        Session::new(
            RecordId(1),
            Arc::new(fp),
            Some("https://www.google.com/".to_string()),
            now,
        )
    }

    #[test]
    fn test_session_cookies_and_referrers() {
        let s = session(Utc::now());
        assert_eq!(s.current_referrer().as_deref(), Some("https://www.google.com/"));

        s.set_cookie("sid", "abc");
        assert_eq!(s.cookie("sid").as_deref(), Some("abc"));
        s.clear_cookies();
        assert_eq!(s.cookie("sid"), None);

        for i in 0..20 {
            s.push_referrer(format!("https://shop.example/p/{}", i));
        }
        let state = s.snapshot();
        assert_eq!(state.referrer_chain.len(), REFERRER_CHAIN_LIMIT);
        assert_eq!(
            s.current_referrer().as_deref(),
            Some("https://shop.example/p/19")
        );
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let s = session(now);
        let config = SessionConfig {
            max_age_secs: 60,
            max_requests: 2,
            ..SessionConfig::default()
        };

        assert!(s.is_reusable(&config, now));
        assert!(s.is_expired(&config, now + chrono::Duration::seconds(60)));

        s.touch(now);
        s.touch(now);
        assert!(s.is_expired(&config, now));

        let fresh = session(now);
        fresh.invalidate();
        assert!(!fresh.is_reusable(&config, now));
    }
}
