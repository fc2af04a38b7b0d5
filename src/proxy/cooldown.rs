//! Cooldown and ban state machine
//!
//! ```text
//!   Active --(failure rate over threshold | hard block)--> Cooling(resume_at)
//!   Cooling --(resume_at elapsed, on the next scheduling pass)--> Active
//!   Active | Cooling --(consecutive hard blocks >= threshold | operator)--> Banned
//!   Banned --(explicit reset only)--> Active
//! ```
//!
//! Cooldown length grows geometrically with the number of cooldowns entered
//! since the last success and is capped at `cooldown_max`.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::PolicyConfig;
use crate::error::{Result, RotaError};
use crate::models::{Outcome, ProxyRecord, ProxyState, RecordId};

/// A state transition applied to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ProxyState,
    pub to: ProxyState,
}

#[derive(Debug, Clone)]
pub struct CooldownController {
    base: Duration,
    multiplier: f64,
    max: Duration,
    ban_threshold: u32,
    window: usize,
    rate_threshold: f64,
    min_samples: usize,
}

impl CooldownController {
    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self {
            base: policy.cooldown_base(),
            multiplier: policy.backoff_multiplier,
            max: policy.cooldown_max(),
            ban_threshold: policy.ban_threshold,
            window: policy.failure_window,
            rate_threshold: policy.failure_rate_threshold,
            min_samples: policy.min_window_samples,
        }
    }

    /// Cooldown length after `previous` cooldowns without an intervening success
    pub fn backoff(&self, previous: u32) -> Duration {
        let factor = self.multiplier.powi(previous.min(64) as i32);
        let secs = self.base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).max(self.base)
    }

    /// Feed one outcome into the state machine
    pub fn on_outcome(
        &self,
        record: &mut ProxyRecord,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Option<StateChange> {
        let streak = &mut record.streak;

        if outcome.is_success() {
            streak.push(false, self.window);
            streak.consecutive_failures = 0;
            streak.consecutive_hard_failures = 0;
            streak.cooldowns = 0;
            return None;
        }

        streak.push(true, self.window);
        streak.consecutive_failures += 1;
        if outcome.is_hard_block() {
            streak.consecutive_hard_failures += 1;
        }

        if matches!(record.state, ProxyState::Banned) {
            return None;
        }

        if record.streak.consecutive_hard_failures >= self.ban_threshold {
            return Some(transition(record, ProxyState::Banned, now));
        }

        let rate_tripped = record.streak.recent.len() >= self.min_samples
            && record.streak.failure_rate() >= self.rate_threshold;
        if !(outcome.is_hard_block() || rate_tripped) {
            return None;
        }

        let duration = self.backoff(record.streak.cooldowns);
        record.streak.cooldowns += 1;
        record.streak.last_cooldown = Some(duration);

        let mut resume_at = now + chrono_duration(duration);
        if let ProxyState::Cooling { resume_at: current } = record.state {
            resume_at = resume_at.max(current);
        }
        Some(transition(record, ProxyState::Cooling { resume_at }, now))
    }

    /// Return a cooled-down record to `Active` once its resume time has passed
    pub fn try_resume(&self, record: &mut ProxyRecord, now: DateTime<Utc>) -> Option<StateChange> {
        match record.state {
            ProxyState::Cooling { resume_at } if now >= resume_at => {
                // Judge the proxy on fresh outcomes; the backoff level is kept
                record.streak.recent.clear();
                Some(transition(record, ProxyState::Active, now))
            }
            _ => None,
        }
    }

    /// Operator ban
    pub fn ban(&self, record: &mut ProxyRecord, now: DateTime<Utc>) -> Option<StateChange> {
        if matches!(record.state, ProxyState::Banned) {
            return None;
        }
        Some(transition(record, ProxyState::Banned, now))
    }

    /// Operator reset: back to `Active` with a clean failure history
    pub fn reset(&self, record: &mut ProxyRecord, now: DateTime<Utc>) -> Option<StateChange> {
        record.streak.clear();
        if record.state.is_active() {
            return None;
        }
        Some(transition(record, ProxyState::Active, now))
    }
}

/// Rules for transitions requested directly through the record store
pub fn validate_transition(
    id: RecordId,
    from: ProxyState,
    to: ProxyState,
    now: DateTime<Utc>,
) -> Result<()> {
    let legal = match (from, to) {
        (ProxyState::Banned, ProxyState::Banned) => true,
        (ProxyState::Banned, _) => false,
        (_, ProxyState::Cooling { resume_at }) => resume_at > now,
        (ProxyState::Cooling { resume_at }, ProxyState::Active) => now >= resume_at,
        _ => true,
    };

    if legal {
        Ok(())
    } else {
        Err(RotaError::InvalidTransition { id, from, to })
    }
}

fn transition(record: &mut ProxyRecord, to: ProxyState, now: DateTime<Utc>) -> StateChange {
    let from = record.set_state(to, now);
    StateChange { from, to }
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProxyEndpoint, ProxyProtocol};

    fn record() -> ProxyRecord {
        ProxyRecord::new(
            RecordId(1),
            ProxyEndpoint::new("10.0.0.1", 8080, ProxyProtocol::Http),
            Utc::now(),
        )
    }

    fn controller() -> CooldownController {
        CooldownController::from_policy(&PolicyConfig::default())
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let c = controller();
        assert_eq!(c.backoff(0), Duration::from_secs(60));
        assert_eq!(c.backoff(1), Duration::from_secs(120));
        assert_eq!(c.backoff(2), Duration::from_secs(240));
        assert_eq!(c.backoff(10), Duration::from_secs(3600));
        assert_eq!(c.backoff(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_hard_block_cools_immediately() {
        let c = controller();
        let mut r = record();
        let now = Utc::now();

        let change = c.on_outcome(&mut r, Outcome::HardBlock, now).unwrap();
        assert_eq!(change.from, ProxyState::Active);
        assert_eq!(
            r.state,
            ProxyState::Cooling {
                resume_at: now + chrono::Duration::seconds(60)
            }
        );
    }

    #[test]
    fn test_soft_failures_need_rate_over_window() {
        let c = controller();
        let mut r = record();
        let now = Utc::now();

        assert!(c.on_outcome(&mut r, Outcome::Success, now).is_none());
        assert!(c.on_outcome(&mut r, Outcome::Timeout, now).is_none());
        // 2 failures out of 3 samples crosses the 0.5 threshold
        let change = c.on_outcome(&mut r, Outcome::SoftBlock, now);
        assert!(matches!(
            change.map(|c| c.to),
            Some(ProxyState::Cooling { .. })
        ));
    }

    #[test]
    fn test_backoff_never_shrinks_across_failures() {
        let c = controller();
        let mut r = record();
        let mut now = Utc::now();
        let mut previous = Duration::ZERO;

        for _ in 0..4 {
            c.on_outcome(&mut r, Outcome::HardBlock, now);
            let current = r.streak.last_cooldown.unwrap();
            assert!(current >= previous);
            previous = current;
            now += chrono::Duration::seconds(10);
        }
    }

    #[test]
    fn test_ban_after_consecutive_hard_blocks() {
        let c = controller();
        let mut r = record();
        let now = Utc::now();

        for _ in 0..4 {
            c.on_outcome(&mut r, Outcome::HardBlock, now);
        }
        assert!(matches!(r.state, ProxyState::Cooling { .. }));

        let change = c.on_outcome(&mut r, Outcome::HardBlock, now).unwrap();
        assert_eq!(change.to, ProxyState::Banned);

        // Banned is terminal for outcomes and resume passes
        assert!(c.on_outcome(&mut r, Outcome::HardBlock, now).is_none());
        assert!(c
            .try_resume(&mut r, now + chrono::Duration::days(30))
            .is_none());
        assert_eq!(r.state, ProxyState::Banned);
    }

    #[test]
    fn test_success_resets_streaks() {
        let c = controller();
        let mut r = record();
        let now = Utc::now();

        c.on_outcome(&mut r, Outcome::HardBlock, now);
        c.on_outcome(&mut r, Outcome::HardBlock, now);
        c.on_outcome(&mut r, Outcome::Success, now);

        assert_eq!(r.streak.consecutive_hard_failures, 0);
        assert_eq!(r.streak.cooldowns, 0);
        assert_eq!(c.backoff(r.streak.cooldowns), Duration::from_secs(60));
    }

    #[test]
    fn test_resume_only_after_deadline() {
        let c = controller();
        let mut r = record();
        let now = Utc::now();
        c.on_outcome(&mut r, Outcome::HardBlock, now);

        assert!(c.try_resume(&mut r, now + chrono::Duration::seconds(30)).is_none());
        let change = c
            .try_resume(&mut r, now + chrono::Duration::seconds(61))
            .unwrap();
        assert_eq!(change.to, ProxyState::Active);
        assert!(r.streak.recent.is_empty());
        assert_eq!(r.streak.cooldowns, 1);
    }

    #[test]
    fn test_reset_and_operator_ban() {
        let c = controller();
        let mut r = record();
        let now = Utc::now();

        assert_eq!(c.ban(&mut r, now).unwrap().to, ProxyState::Banned);
        assert!(c.ban(&mut r, now).is_none());

        let change = c.reset(&mut r, now).unwrap();
        assert_eq!(change.from, ProxyState::Banned);
        assert!(r.is_active());
        assert!(c.reset(&mut r, now).is_none());
    }

    #[test]
    fn test_validate_transition_rules() {
        let id = RecordId(1);
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);
        let earlier = now - chrono::Duration::seconds(60);

        assert!(validate_transition(id, ProxyState::Active, ProxyState::Banned, now).is_ok());
        assert!(validate_transition(
            id,
            ProxyState::Active,
            ProxyState::Cooling { resume_at: later },
            now
        )
        .is_ok());
        assert!(matches!(
            validate_transition(
                id,
                ProxyState::Active,
                ProxyState::Cooling { resume_at: earlier },
                now
            ),
            Err(RotaError::InvalidTransition { .. })
        ));
        assert!(matches!(
            validate_transition(id, ProxyState::Banned, ProxyState::Active, now),
            Err(RotaError::InvalidTransition { .. })
        ));
        assert!(validate_transition(
            id,
            ProxyState::Cooling { resume_at: later },
            ProxyState::Active,
            now
        )
        .is_err());
        assert!(validate_transition(
            id,
            ProxyState::Cooling { resume_at: earlier },
            ProxyState::Active,
            now
        )
        .is_ok());
    }
}
