//! Proxy quality scoring
//!
//! Each proxy keeps an exponentially-weighted moving average of its outcomes
//! (success = 1.0, failure = 0.0). The published score blends that average
//! with a latency bonus and an optional geographic bonus:
//!
//! `score = (w1 * ewma + w2 * latency_bonus + w3 * geo_bonus) / (sum of weights used)`
//!
//! Terms without data (no latency sample yet, no geographic preference) drop
//! out of both numerator and denominator, so every score stays in `[0, 1]`.
//! Updates are O(1) per outcome.

use std::time::Duration;

use crate::config::{PolicyConfig, ScoreWeights};
use crate::models::{Outcome, ProxyRecord};

#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScoreWeights,
    decay: f64,
    latency_target_ms: f64,
    latency_ceiling_ms: f64,
    preferred_geo: Option<String>,
}

impl Scorer {
    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self {
            weights: policy.weights,
            decay: policy.ewma_decay,
            latency_target_ms: policy.latency_target_ms as f64,
            latency_ceiling_ms: policy.latency_ceiling_ms as f64,
            preferred_geo: policy.preferred_geo.clone(),
        }
    }

    /// Multiplier on the EWMA step for each outcome.
    ///
    /// A hard block moves the average three times as far as a plain network
    /// error; a timeout only half as far.
    pub fn severity(outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Success => 1.0,
            Outcome::HardBlock => 3.0,
            Outcome::SoftBlock => 1.5,
            Outcome::NetworkError => 1.0,
            Outcome::Timeout => 0.5,
        }
    }

    /// Largest fraction of the gap to the target one outcome can close
    ///
    /// Kept below 1 so a run of failures keeps lowering the average instead
    /// of pinning it at zero after the first hard block.
    pub const MAX_STEP: f64 = 0.9;

    pub fn update_ewma(&self, current: f64, outcome: Outcome) -> f64 {
        let alpha = (self.decay * Self::severity(outcome)).min(Self::MAX_STEP);
        let target = if outcome.is_success() { 1.0 } else { 0.0 };
        ((1.0 - alpha) * current + alpha * target).clamp(0.0, 1.0)
    }

    pub fn update_latency(&self, current: Option<f64>, sample_ms: f64) -> f64 {
        match current {
            None => sample_ms,
            Some(avg) => (1.0 - self.decay) * avg + self.decay * sample_ms,
        }
    }

    /// 1.0 at or under the target, 0.0 at or over the ceiling, linear between
    pub fn latency_bonus(&self, latency_ms: f64) -> f64 {
        if latency_ms <= self.latency_target_ms {
            1.0
        } else if latency_ms >= self.latency_ceiling_ms {
            0.0
        } else {
            (self.latency_ceiling_ms - latency_ms) / (self.latency_ceiling_ms - self.latency_target_ms)
        }
    }

    /// Whether `geo` satisfies `preferred`; `None` when there is no preference
    pub fn geo_match(geo: Option<&str>, preferred: Option<&str>) -> Option<bool> {
        preferred.map(|want| geo.is_some_and(|have| have.eq_ignore_ascii_case(want)))
    }

    pub fn blend(&self, ewma: f64, latency_ms: Option<f64>, geo_match: Option<bool>) -> f64 {
        let mut total = self.weights.success * ewma;
        let mut weight = self.weights.success;

        if let Some(ms) = latency_ms {
            total += self.weights.latency * self.latency_bonus(ms);
            weight += self.weights.latency;
        }
        if let Some(matched) = geo_match {
            if matched {
                total += self.weights.geo;
            }
            weight += self.weights.geo;
        }

        if weight <= 0.0 {
            return ewma.clamp(0.0, 1.0);
        }
        (total / weight).clamp(0.0, 1.0)
    }

    /// Score of a record against an explicit geographic preference
    pub fn score_for(&self, record: &ProxyRecord, preferred_geo: Option<&str>) -> f64 {
        self.blend(
            record.ewma_success,
            record.success_latency_ms,
            Self::geo_match(record.geo(), preferred_geo),
        )
    }

    /// Fold one outcome into the record and recompute its stored score.
    ///
    /// Only successful responses feed the latency term; a fast block page
    /// says nothing about the proxy's usable throughput.
    pub fn apply(&self, record: &mut ProxyRecord, outcome: Outcome, latency: Option<Duration>) -> f64 {
        record.ewma_success = self.update_ewma(record.ewma_success, outcome);
        if outcome.is_success() {
            if let Some(latency) = latency {
                let ms = latency.as_secs_f64() * 1000.0;
                record.success_latency_ms =
                    Some(self.update_latency(record.success_latency_ms, ms));
            }
        }
        self.rescore(record)
    }

    /// Recompute the stored score from the record's current terms
    pub fn rescore(&self, record: &mut ProxyRecord) -> f64 {
        record.score = self.score_for(record, self.preferred_geo.as_deref());
        record.score
    }
}
