use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

use super::outcome::{FailureCounts, Outcome};
use crate::error::{Result, RotaError};

/// Number of latency samples kept per proxy for the median
pub const LATENCY_SAMPLE_LIMIT: usize = 64;

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks4a => "socks4a",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks4" => Some(ProxyProtocol::Socks4),
            "socks4a" => Some(ProxyProtocol::Socks4a),
            "socks5" | "socks5h" | "socks" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProxyProtocol::Http => 80,
            ProxyProtocol::Https => 443,
            ProxyProtocol::Socks4 | ProxyProtocol::Socks4a | ProxyProtocol::Socks5 => 1080,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(
            self,
            ProxyProtocol::Socks4 | ProxyProtocol::Socks4a | ProxyProtocol::Socks5
        )
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier handed out by the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Network prefix used to group proxies for diversity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubnetKey(String);

impl SubnetKey {
    /// Derive the grouping key for a host.
    ///
    /// IPv4 groups by /24, IPv6 by /64 and hostnames by their last two labels.
    pub fn for_host(host: &str) -> Self {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                let o = ip.octets();
                SubnetKey(format!("{}.{}.{}", o[0], o[1], o[2]))
            }
            Ok(IpAddr::V6(ip)) => {
                let s = ip.segments();
                SubnetKey(format!("{:x}:{:x}:{:x}:{:x}::/64", s[0], s[1], s[2], s[3]))
            }
            Err(_) => {
                let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
                let tail = if labels.len() > 2 {
                    labels[labels.len() - 2..].join(".")
                } else {
                    labels.join(".")
                };
                SubnetKey(tail.to_lowercase())
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubnetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A candidate proxy as pushed by the ingestion feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    /// Declared or inferred country code (upper-case ISO 3166 alpha-2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<String>,
    /// Prior quality in [0,1] from an external validation pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_score: Option<f64>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: ProxyProtocol) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port,
            protocol,
            geo: None,
            base_score: None,
        }
    }

    /// Parse `scheme://host:port` or a bare `host:port` (defaults to http)
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RotaError::InvalidProxyAddress("empty address".into()));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };
        let url = Url::parse(&with_scheme)?;

        let protocol = ProxyProtocol::from_str(url.scheme())
            .ok_or_else(|| RotaError::UnsupportedProtocol(url.scheme().to_string()))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RotaError::InvalidProxyAddress(format!("{}: missing host", raw)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = url
            .port_or_known_default()
            .unwrap_or_else(|| protocol.default_port());

        Ok(Self::new(host, port, protocol))
    }

    pub fn with_geo(mut self, geo: impl Into<String>) -> Self {
        let geo = geo.into().trim().to_uppercase();
        self.geo = if geo.is_empty() { None } else { Some(geo) };
        self
    }

    pub fn with_base_score(mut self, score: f64) -> Self {
        self.base_score = Some(score.clamp(0.0, 1.0));
        self
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Proxy URL suitable for an HTTP client
    pub fn url(&self) -> String {
        format!("{}://{}", self.protocol, self.address())
    }

    pub fn subnet_key(&self) -> SubnetKey {
        SubnetKey::for_host(&self.host)
    }
}

/// Lifecycle state of a proxy record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProxyState {
    Active,
    Cooling { resume_at: DateTime<Utc> },
    Banned,
}

impl ProxyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyState::Active => "active",
            ProxyState::Cooling { .. } => "cooling",
            ProxyState::Banned => "banned",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ProxyState::Active)
    }

    pub fn resume_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ProxyState::Cooling { resume_at } => Some(*resume_at),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome counters and latency history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollingStats {
    /// Times the scheduler handed this proxy out
    pub assignments: u64,
    pub successes: u64,
    pub failures: FailureCounts,
    /// Running mean over every latency sample reported
    pub mean_latency_ms: Option<f64>,
    pub latency_count: u64,
    #[serde(skip)]
    latency_samples: VecDeque<u32>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl RollingStats {
    pub fn record_outcome(&mut self, outcome: Outcome, now: DateTime<Utc>) {
        if outcome.is_success() {
            self.successes += 1;
            self.last_success = Some(now);
        } else {
            self.failures.increment(outcome);
            self.last_failure = Some(now);
        }
    }

    pub fn record_latency(&mut self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        self.latency_count += 1;
        self.mean_latency_ms = Some(match self.mean_latency_ms {
            None => ms,
            Some(mean) => mean + (ms - mean) / self.latency_count as f64,
        });

        self.latency_samples
            .push_back(ms.round().min(u32::MAX as f64) as u32);
        if self.latency_samples.len() > LATENCY_SAMPLE_LIMIT {
            self.latency_samples.pop_front();
        }
    }

    /// Median over the most recent samples
    pub fn median_latency_ms(&self) -> Option<u32> {
        if self.latency_samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u32> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }

    pub fn total_failures(&self) -> u64 {
        self.failures.total()
    }

    pub fn total_reports(&self) -> u64 {
        self.successes + self.failures.total()
    }

    /// Success rate in [0,1], 0 when nothing was reported yet
    pub fn success_rate(&self) -> f64 {
        match self.total_reports() {
            0 => 0.0,
            n => self.successes as f64 / n as f64,
        }
    }
}

/// Failure bookkeeping consumed by the cooldown controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureStreak {
    pub consecutive_failures: u32,
    pub consecutive_hard_failures: u32,
    /// Trailing outcomes, `true` marks a failure
    pub recent: VecDeque<bool>,
    /// Cooldowns entered since the last success
    pub cooldowns: u32,
    pub last_cooldown: Option<Duration>,
}

impl FailureStreak {
    pub fn push(&mut self, failed: bool, window: usize) {
        self.recent.push_back(failed);
        while self.recent.len() > window.max(1) {
            self.recent.pop_front();
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent.iter().filter(|&&f| f).count() as f64 / self.recent.len() as f64
    }

    pub fn clear(&mut self) {
        *self = FailureStreak::default();
    }
}

/// Authoritative state for one known proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: RecordId,
    pub endpoint: ProxyEndpoint,
    pub subnet: SubnetKey,
    pub stats: RollingStats,
    /// EWMA of success (1.0) vs failure (0.0)
    pub ewma_success: f64,
    /// EWMA of latency over successful responses, feeds the latency bonus
    pub success_latency_ms: Option<f64>,
    /// Blended quality score in [0,1]
    pub score: f64,
    pub state: ProxyState,
    pub streak: FailureStreak,
    pub last_assigned: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProxyRecord {
    /// Neutral prior for proxies ingested without a validation score
    pub const DEFAULT_PRIOR: f64 = 0.5;

    pub fn new(id: RecordId, endpoint: ProxyEndpoint, now: DateTime<Utc>) -> Self {
        let prior = endpoint.base_score.unwrap_or(Self::DEFAULT_PRIOR);
        Self {
            id,
            subnet: endpoint.subnet_key(),
            endpoint,
            stats: RollingStats::default(),
            ewma_success: prior,
            success_latency_ms: None,
            score: prior,
            state: ProxyState::Active,
            streak: FailureStreak::default(),
            last_assigned: None,
            state_changed_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn geo(&self) -> Option<&str> {
        self.endpoint.geo.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub(crate) fn set_state(&mut self, state: ProxyState, now: DateTime<Utc>) -> ProxyState {
        let previous = std::mem::replace(&mut self.state, state);
        self.state_changed_at = now;
        self.updated_at = now;
        previous
    }
}
