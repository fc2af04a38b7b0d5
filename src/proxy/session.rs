//! Session binding
//!
//! One live session per proxy. A session is reused until it expires or its
//! proxy leaves `Active`; the replacement gets a new fingerprint and a new
//! entry referrer.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::sync::Arc;
use tracing::debug;

use crate::config::SessionConfig;
use crate::models::{RecordId, Session};
use crate::proxy::fingerprint::FingerprintGenerator;

const SEARCH_REFERRER: &str = "https://www.google.com/";
const SOCIAL_REFERRERS: &[&str] = &[
    "https://www.facebook.com/",
    "https://twitter.com/",
    "https://www.pinterest.com/",
];

/// How a simulated visitor arrives at the first page of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationPattern {
    Direct,
    Search,
    Internal,
    Social,
}

impl NavigationPattern {
    const ALL: [NavigationPattern; 4] = [
        NavigationPattern::Direct,
        NavigationPattern::Search,
        NavigationPattern::Internal,
        NavigationPattern::Social,
    ];

    pub fn weight(&self) -> f64 {
        match self {
            NavigationPattern::Direct => 0.3,
            NavigationPattern::Search => 0.4,
            NavigationPattern::Internal => 0.2,
            NavigationPattern::Social => 0.1,
        }
    }

    fn draw(rng: &mut StdRng) -> Self {
        match WeightedIndex::new(Self::ALL.iter().map(|p| p.weight())) {
            Ok(dist) => Self::ALL[dist.sample(rng)],
            Err(_) => NavigationPattern::Direct,
        }
    }

    /// Referrer of the first request; `None` for a direct visit
    fn referrer(&self, entry_site: Option<&str>, rng: &mut StdRng) -> Option<String> {
        match self {
            NavigationPattern::Direct => None,
            NavigationPattern::Search => Some(SEARCH_REFERRER.to_string()),
            NavigationPattern::Internal => entry_site.map(str::to_string),
            NavigationPattern::Social => SOCIAL_REFERRERS.choose(rng).map(|s| s.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct SessionBinder {
    sessions: DashMap<RecordId, Arc<Session>>,
    generator: FingerprintGenerator,
    navigation: Mutex<StdRng>,
    config: SessionConfig,
}

impl SessionBinder {
    pub fn new(config: SessionConfig, seed: Option<u64>) -> Self {
        let navigation = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self {
            sessions: DashMap::new(),
            generator: FingerprintGenerator::new(seed),
            navigation: Mutex::new(navigation),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Live session for `proxy_id`, created when there is none to reuse.
    /// Counts one request against the returned session.
    pub fn bind(&self, proxy_id: RecordId, geo: Option<&str>) -> Arc<Session> {
        self.bind_at(proxy_id, geo, Utc::now())
    }

    pub fn bind_at(&self, proxy_id: RecordId, geo: Option<&str>, now: DateTime<Utc>) -> Arc<Session> {
        let existing = self.sessions.get(&proxy_id).map(|s| Arc::clone(s.value()));
        if let Some(session) = existing {
            if session.is_reusable(&self.config, now) {
                session.touch(now);
                return session;
            }
            debug!(proxy_id = %proxy_id, session_id = %session.id, "Retiring session");
        }

        let fingerprint = Arc::new(self.generator.generate(geo));
        let referrer = {
            let mut rng = self.navigation.lock();
            NavigationPattern::draw(&mut rng).referrer(self.config.entry_site.as_deref(), &mut rng)
        };

        let session = Arc::new(Session::new(proxy_id, fingerprint, referrer, now));
        session.touch(now);
        debug!(
            proxy_id = %proxy_id,
            session_id = %session.id,
            template = %session.fingerprint.template,
            timezone = %session.fingerprint.timezone,
            "Session created"
        );
        self.sessions.insert(proxy_id, Arc::clone(&session));
        session
    }

    pub fn get(&self, proxy_id: RecordId) -> Option<Arc<Session>> {
        self.sessions.get(&proxy_id).map(|s| Arc::clone(s.value()))
    }

    /// Drop the proxy's session; holders of the old `Arc` see it invalidated
    pub fn invalidate(&self, proxy_id: RecordId) -> bool {
        match self.sessions.remove(&proxy_id) {
            Some((_, session)) => {
                session.invalidate();
                debug!(proxy_id = %proxy_id, session_id = %session.id, "Session invalidated");
                true
            }
            None => false,
        }
    }

    pub fn clear_cookies(&self, proxy_id: RecordId) {
        if let Some(session) = self.get(proxy_id) {
            session.clear_cookies();
        }
    }

    /// Remove expired sessions; returns how many were dropped
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            let keep = session.is_reusable(&self.config, now);
            if !keep {
                session.invalidate();
            }
            keep
        });
        before.saturating_sub(self.sessions.len())
    }

    pub fn reset_all(&self) {
        for session in self.sessions.iter() {
            session.invalidate();
        }
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
