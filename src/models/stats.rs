use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::outcome::FailureCounts;
use super::proxy::{ProxyRecord, ProxyState, RecordId};

/// Point-in-time view of one proxy, for dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySummary {
    pub id: RecordId,
    pub address: String,
    pub protocol: String,
    pub subnet: String,
    pub geo: Option<String>,
    pub state: ProxyState,
    pub score: f64,
    pub assignments: u64,
    pub successes: u64,
    pub failures: FailureCounts,
    pub success_rate: f64,
    pub mean_latency_ms: Option<f64>,
    pub median_latency_ms: Option<u32>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl From<&ProxyRecord> for ProxySummary {
    fn from(record: &ProxyRecord) -> Self {
        ProxySummary {
            id: record.id,
            address: record.endpoint.address(),
            protocol: record.endpoint.protocol.to_string(),
            subnet: record.subnet.to_string(),
            geo: record.endpoint.geo.clone(),
            state: record.state,
            score: record.score,
            assignments: record.stats.assignments,
            successes: record.stats.successes,
            failures: record.stats.failures,
            success_rate: record.stats.success_rate(),
            mean_latency_ms: record.stats.mean_latency_ms,
            median_latency_ms: record.stats.median_latency_ms(),
            last_success: record.stats.last_success,
            last_failure: record.stats.last_failure,
        }
    }
}

/// Pool-wide statistics summary
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolStats {
    pub generated_at: Option<DateTime<Utc>>,
    pub total_proxies: usize,
    pub active_proxies: usize,
    pub cooling_proxies: usize,
    pub banned_proxies: usize,
    pub in_flight: usize,
    pub live_sessions: usize,
    pub total_assignments: u64,
    pub total_successes: u64,
    pub failures: FailureCounts,
    /// Successes over reported outcomes (0-1)
    pub success_rate: f64,
    /// Hard blocks over reported outcomes (0-1)
    pub detection_rate: f64,
    pub top_proxies: Vec<ProxySummary>,
    pub proxies: Vec<ProxySummary>,
}

impl PoolStats {
    /// How many proxies the top list carries
    pub const TOP_N: usize = 5;

    /// Aggregate per-proxy rows into a summary
    pub fn from_summaries(mut proxies: Vec<ProxySummary>, generated_at: DateTime<Utc>) -> Self {
        proxies.sort_by_key(|p| p.id);

        let mut stats = PoolStats {
            generated_at: Some(generated_at),
            total_proxies: proxies.len(),
            ..PoolStats::default()
        };

        for p in &proxies {
            match p.state {
                ProxyState::Active => stats.active_proxies += 1,
                ProxyState::Cooling { .. } => stats.cooling_proxies += 1,
                ProxyState::Banned => stats.banned_proxies += 1,
            }
            stats.total_assignments += p.assignments;
            stats.total_successes += p.successes;
            stats.failures.merge(&p.failures);
        }

        let reports = stats.total_successes + stats.failures.total();
        if reports > 0 {
            stats.success_rate = stats.total_successes as f64 / reports as f64;
            stats.detection_rate = stats.failures.hard_block as f64 / reports as f64;
        }

        let mut ranked: Vec<ProxySummary> = proxies
            .iter()
            .filter(|p| p.successes + p.failures.total() > 0)
            .cloned()
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        ranked.truncate(Self::TOP_N);

        stats.top_proxies = ranked;
        stats.proxies = proxies;
        stats
    }
}
