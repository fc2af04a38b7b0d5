use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::proxy::RecordId;

/// Classification of a finished request, supplied by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Denied, but likely recoverable (rate limit, soft captcha)
    SoftBlock,
    /// Explicit bot-detection page: the proxy/fingerprint pair is burned
    HardBlock,
    Timeout,
    NetworkError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::SoftBlock => "soft_block",
            Outcome::HardBlock => "hard_block",
            Outcome::Timeout => "timeout",
            Outcome::NetworkError => "network_error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "success" | "ok" => Some(Outcome::Success),
            "soft_block" | "softblock" => Some(Outcome::SoftBlock),
            "hard_block" | "hardblock" | "bot_detected" => Some(Outcome::HardBlock),
            "timeout" => Some(Outcome::Timeout),
            "network_error" | "networkerror" => Some(Outcome::NetworkError),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_hard_block(&self) -> bool {
        matches!(self, Outcome::HardBlock)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure counters by category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounts {
    pub soft_block: u64,
    pub hard_block: u64,
    pub timeout: u64,
    pub network_error: u64,
}

impl FailureCounts {
    pub fn increment(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => {}
            Outcome::SoftBlock => self.soft_block += 1,
            Outcome::HardBlock => self.hard_block += 1,
            Outcome::Timeout => self.timeout += 1,
            Outcome::NetworkError => self.network_error += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.soft_block + self.hard_block + self.timeout + self.network_error
    }

    pub fn merge(&mut self, other: &FailureCounts) {
        self.soft_block += other.soft_block;
        self.hard_block += other.hard_block;
        self.timeout += other.timeout;
        self.network_error += other.network_error;
    }
}

/// One outcome report, tagged with the logical request it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub request_id: Uuid,
    pub proxy_id: RecordId,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
}

impl OutcomeReport {
    pub fn new(request_id: Uuid, proxy_id: RecordId, outcome: Outcome) -> Self {
        Self {
            request_id,
            proxy_id,
            outcome,
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}
