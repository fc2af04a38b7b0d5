use crate::error::{Result, RotaError};
use crate::proxy::rotation::RankingStrategy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Scoring, cooldown and selection policy
    pub policy: PolicyConfig,
    /// Session continuity limits
    pub session: SessionConfig,
    /// Ingestion and background maintenance
    pub service: ServiceConfig,
    /// Logging configuration
    pub log: LogConfig,
}

/// Relative weights of the score terms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Weight of the success EWMA (w1)
    pub success: f64,
    /// Weight of the latency bonus (w2)
    pub latency: f64,
    /// Weight of the geographic match bonus (w3)
    pub geo: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success: 0.7,
            latency: 0.2,
            geo: 0.1,
        }
    }
}

impl FromStr for ScoreWeights {
    type Err = RotaError;

    /// Parse a `w1,w2,w3` triple
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| RotaError::InvalidConfig(format!("invalid score weights: {}", s)))?;

        match parts.as_slice() {
            [success, latency, geo] => Ok(Self {
                success: *success,
                latency: *latency,
                geo: *geo,
            }),
            _ => Err(RotaError::InvalidConfig(format!(
                "score weights need exactly three values, got {}",
                parts.len()
            ))),
        }
    }
}

/// Numeric policy knobs of the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Minimum score a proxy needs to be selectable
    pub score_floor: f64,
    /// Number of recent assignments whose subnets are excluded (K)
    pub diversity_window: usize,
    /// First cooldown duration in seconds
    pub cooldown_base_secs: u64,
    /// Growth factor applied per successive cooldown
    pub backoff_multiplier: f64,
    /// Upper bound on a single cooldown in seconds
    pub cooldown_max_secs: u64,
    /// Consecutive hard failures that ban a proxy
    pub ban_threshold: u32,
    /// Trailing outcomes considered for the failure rate
    pub failure_window: usize,
    /// Failure rate within the window that triggers a cooldown
    pub failure_rate_threshold: f64,
    /// Outcomes required in the window before the rate is trusted
    pub min_window_samples: usize,
    /// EWMA smoothing factor; higher weights recent outcomes more
    pub ewma_decay: f64,
    pub weights: ScoreWeights,
    /// Latency at or below which the full latency bonus applies
    pub latency_target_ms: u64,
    /// Latency at or above which the latency bonus is zero
    pub latency_ceiling_ms: u64,
    /// Country code that earns the geographic bonus
    pub preferred_geo: Option<String>,
    /// At most one in-flight assignment per proxy
    pub exclusive: bool,
    pub ranking: RankingStrategy,
    /// Minimum gap between two assignments of the same proxy
    pub min_reuse_interval_secs: u64,
    /// Days an unreachable or banned proxy is kept before pruning
    pub prune_after_days: u64,
    /// Seconds after which an unreported assignment stops holding its proxy
    pub lease_timeout_secs: u64,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            score_floor: 0.2,
            diversity_window: 3,
            cooldown_base_secs: 60,
            backoff_multiplier: 2.0,
            cooldown_max_secs: 3600,
            ban_threshold: 5,
            failure_window: 10,
            failure_rate_threshold: 0.5,
            min_window_samples: 3,
            ewma_decay: 0.3,
            weights: ScoreWeights::default(),
            latency_target_ms: 500,
            latency_ceiling_ms: 5000,
            preferred_geo: None,
            exclusive: false,
            ranking: RankingStrategy::Weighted,
            min_reuse_interval_secs: 0,
            prune_after_days: 3,
            lease_timeout_secs: 300,
            seed: None,
        }
    }
}

impl PolicyConfig {
    pub fn cooldown_base(&self) -> Duration {
        Duration::from_secs(self.cooldown_base_secs)
    }

    pub fn cooldown_max(&self) -> Duration {
        Duration::from_secs(self.cooldown_max_secs)
    }

    pub fn min_reuse_interval(&self) -> Duration {
        Duration::from_secs(self.min_reuse_interval_secs)
    }

    pub fn prune_after(&self) -> chrono::Duration {
        chrono::Duration::days(self.prune_after_days.min(i32::MAX as u64) as i64)
    }

    pub fn lease_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_timeout_secs.min(i64::MAX as u64 / 1000) as i64)
    }

    /// Reject knob combinations the controllers cannot honour
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.score_floor) {
            return Err(invalid("score_floor must be within [0, 1]"));
        }
        if !(self.ewma_decay > 0.0 && self.ewma_decay <= 1.0) {
            return Err(invalid("ewma_decay must be within (0, 1]"));
        }
        let w = &self.weights;
        if !(w.success.is_finite() && w.latency.is_finite() && w.geo.is_finite()) {
            return Err(invalid("score weights must be finite"));
        }
        if w.success <= 0.0 || w.latency < 0.0 || w.geo < 0.0 {
            return Err(invalid(
                "score weights must be non-negative with a positive success weight",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(invalid("backoff_multiplier must be >= 1"));
        }
        if self.cooldown_base_secs == 0 {
            return Err(invalid("cooldown_base_secs must be at least 1"));
        }
        if self.cooldown_base_secs > self.cooldown_max_secs {
            return Err(invalid("cooldown_base_secs must not exceed cooldown_max_secs"));
        }
        if self.ban_threshold == 0 {
            return Err(invalid("ban_threshold must be at least 1"));
        }
        if self.failure_window == 0 {
            return Err(invalid("failure_window must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(invalid("failure_rate_threshold must be within [0, 1]"));
        }
        if self.latency_target_ms >= self.latency_ceiling_ms {
            return Err(invalid("latency_target_ms must be below latency_ceiling_ms"));
        }
        if self.lease_timeout_secs == 0 {
            return Err(invalid("lease_timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

/// When a bound session is retired and rebuilt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum session age in seconds
    pub max_age_secs: u64,
    /// Maximum requests served by one session
    pub max_requests: u64,
    /// Origin used as referrer when a new session starts on an internal page
    pub entry_site: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 1800,
            max_requests: 100,
            entry_site: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// JSON proxy list loaded at startup and on every maintenance tick
    pub proxy_file: Option<PathBuf>,
    /// Seconds between maintenance passes
    pub maintenance_interval_secs: u64,
    /// Where learned proxy state is saved and restored across restarts
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = PolicyConfig::default();

        let policy = PolicyConfig {
            score_floor: parse_env("POOL_SCORE_FLOOR", "0.2")?,
            diversity_window: parse_env("POOL_DIVERSITY_WINDOW", "3")?,
            cooldown_base_secs: parse_env("POOL_COOLDOWN_BASE_SECS", "60")?,
            backoff_multiplier: parse_env("POOL_COOLDOWN_MULTIPLIER", "2.0")?,
            cooldown_max_secs: parse_env("POOL_COOLDOWN_MAX_SECS", "3600")?,
            ban_threshold: parse_env("POOL_BAN_THRESHOLD", "5")?,
            failure_window: parse_env("POOL_FAILURE_WINDOW", "10")?,
            failure_rate_threshold: parse_env("POOL_FAILURE_RATE_THRESHOLD", "0.5")?,
            min_window_samples: parse_env("POOL_MIN_WINDOW_SAMPLES", "3")?,
            ewma_decay: parse_env("POOL_EWMA_DECAY", "0.3")?,
            weights: get_env_or("POOL_SCORE_WEIGHTS", "0.7,0.2,0.1").parse()?,
            latency_target_ms: parse_env("POOL_LATENCY_TARGET_MS", "500")?,
            latency_ceiling_ms: parse_env("POOL_LATENCY_CEILING_MS", "5000")?,
            preferred_geo: optional_env("POOL_PREFERRED_GEO").map(|g| g.to_uppercase()),
            exclusive: parse_env("POOL_EXCLUSIVE", "false")?,
            ranking: RankingStrategy::from_str(&get_env_or("POOL_RANKING", "weighted")),
            min_reuse_interval_secs: parse_env("POOL_MIN_REUSE_SECS", "0")?,
            prune_after_days: parse_env("POOL_PRUNE_AFTER_DAYS", "3")?,
            lease_timeout_secs: parse_env("POOL_LEASE_TIMEOUT_SECS", "300")?,
            seed: match optional_env("POOL_SEED") {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    RotaError::InvalidConfig("POOL_SEED must be an unsigned integer".into())
                })?),
                None => defaults.seed,
            },
        };
        policy.validate()?;

        Ok(Config {
            policy,
            session: SessionConfig {
                max_age_secs: parse_env("SESSION_MAX_AGE_SECS", "1800")?,
                max_requests: parse_env("SESSION_MAX_REQUESTS", "100")?,
                entry_site: optional_env("SESSION_ENTRY_SITE"),
            },
            service: ServiceConfig {
                proxy_file: optional_env("PROXY_FILE").map(PathBuf::from),
                maintenance_interval_secs: parse_env("MAINTENANCE_INTERVAL_SECS", "60")?,
                state_file: optional_env("STATE_FILE").map(PathBuf::from),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

fn invalid(msg: &str) -> RotaError {
    RotaError::InvalidConfig(msg.to_string())
}

/// Parse an environment variable, falling back to `default` when unset
fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| RotaError::InvalidConfig(format!("{} has an invalid value", key)))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "POOL_SCORE_FLOOR",
        "POOL_DIVERSITY_WINDOW",
        "POOL_COOLDOWN_BASE_SECS",
        "POOL_COOLDOWN_MULTIPLIER",
        "POOL_COOLDOWN_MAX_SECS",
        "POOL_BAN_THRESHOLD",
        "POOL_FAILURE_WINDOW",
        "POOL_FAILURE_RATE_THRESHOLD",
        "POOL_MIN_WINDOW_SAMPLES",
        "POOL_EWMA_DECAY",
        "POOL_SCORE_WEIGHTS",
        "POOL_LATENCY_TARGET_MS",
        "POOL_LATENCY_CEILING_MS",
        "POOL_PREFERRED_GEO",
        "POOL_EXCLUSIVE",
        "POOL_RANKING",
        "POOL_MIN_REUSE_SECS",
        "POOL_PRUNE_AFTER_DAYS",
        "POOL_LEASE_TIMEOUT_SECS",
        "POOL_SEED",
        "SESSION_MAX_AGE_SECS",
        "SESSION_MAX_REQUESTS",
        "SESSION_ENTRY_SITE",
        "PROXY_FILE",
        "MAINTENANCE_INTERVAL_SECS",
        "STATE_FILE",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.policy, PolicyConfig::default());
        assert_eq!(config.session, SessionConfig::default());
        assert!(config.service.proxy_file.is_none());
        assert!(config.service.state_file.is_none());
        assert_eq!(config.service.maintenance_interval_secs, 60);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "pretty");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("POOL_SCORE_FLOOR", "0.35");
        env::set_var("POOL_DIVERSITY_WINDOW", "5");
        env::set_var("POOL_SCORE_WEIGHTS", "0.5, 0.3, 0.2");
        env::set_var("POOL_PREFERRED_GEO", "us");
        env::set_var("POOL_EXCLUSIVE", "true");
        env::set_var("POOL_RANKING", "top-k");
        env::set_var("POOL_SEED", "42");
        env::set_var("SESSION_MAX_REQUESTS", "25");
        env::set_var("PROXY_FILE", "/tmp/proxies.json");
        env::set_var("STATE_FILE", "/tmp/pool-state.json");
        env::set_var("POOL_LEASE_TIMEOUT_SECS", "90");

        let config = Config::from_env().unwrap();

        assert!((config.policy.score_floor - 0.35).abs() < 1e-9);
        assert_eq!(config.policy.diversity_window, 5);
        assert_eq!(
            config.policy.weights,
            ScoreWeights {
                success: 0.5,
                latency: 0.3,
                geo: 0.2
            }
        );
        assert_eq!(config.policy.preferred_geo.as_deref(), Some("US"));
        assert!(config.policy.exclusive);
        assert_eq!(config.policy.ranking, RankingStrategy::TopK);
        assert_eq!(config.policy.seed, Some(42));
        assert_eq!(config.session.max_requests, 25);
        assert_eq!(
            config.service.proxy_file,
            Some(PathBuf::from("/tmp/proxies.json"))
        );
        assert_eq!(
            config.service.state_file,
            Some(PathBuf::from("/tmp/pool-state.json"))
        );
        assert_eq!(config.policy.lease_timeout_secs, 90);
    }

    #[test]
    fn test_config_from_env_invalid_number() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("POOL_BAN_THRESHOLD", "many");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotaError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_rejects_inconsistent_policy() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("POOL_COOLDOWN_BASE_SECS", "7200");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotaError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_rejects_nan_weights() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("POOL_SCORE_WEIGHTS", "NaN,0.2,0.1");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotaError::InvalidConfig(_)));
    }

    #[test]
    fn test_score_weights_parsing() {
        assert!("1,0,0".parse::<ScoreWeights>().is_ok());
        assert!("1,0".parse::<ScoreWeights>().is_err());
        assert!("a,b,c".parse::<ScoreWeights>().is_err());
    }

    #[test]
    fn test_policy_validation() {
        assert!(PolicyConfig::default().validate().is_ok());

        let bad = [
            PolicyConfig {
                score_floor: 1.5,
                ..PolicyConfig::default()
            },
            PolicyConfig {
                ewma_decay: 0.0,
                ..PolicyConfig::default()
            },
            PolicyConfig {
                backoff_multiplier: 0.5,
                ..PolicyConfig::default()
            },
            PolicyConfig {
                ban_threshold: 0,
                ..PolicyConfig::default()
            },
            PolicyConfig {
                weights: ScoreWeights {
                    success: 0.0,
                    latency: 1.0,
                    geo: 0.0,
                },
                ..PolicyConfig::default()
            },
            PolicyConfig {
                weights: ScoreWeights {
                    success: f64::NAN,
                    ..ScoreWeights::default()
                },
                ..PolicyConfig::default()
            },
            PolicyConfig {
                weights: ScoreWeights {
                    latency: f64::INFINITY,
                    ..ScoreWeights::default()
                },
                ..PolicyConfig::default()
            },
            PolicyConfig {
                weights: ScoreWeights {
                    geo: f64::NAN,
                    ..ScoreWeights::default()
                },
                ..PolicyConfig::default()
            },
            PolicyConfig {
                backoff_multiplier: f64::NAN,
                ..PolicyConfig::default()
            },
            PolicyConfig {
                backoff_multiplier: f64::INFINITY,
                ..PolicyConfig::default()
            },
            PolicyConfig {
                ewma_decay: f64::NAN,
                ..PolicyConfig::default()
            },
            PolicyConfig {
                lease_timeout_secs: 0,
                ..PolicyConfig::default()
            },
        ];
        for policy in bad {
            assert!(matches!(policy.validate(), Err(RotaError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_policy_deserialises_with_defaults() {
        let policy: PolicyConfig =
            serde_json::from_str(r#"{"score_floor":0.4,"ranking":"greedy"}"#).unwrap();
        assert!((policy.score_floor - 0.4).abs() < 1e-9);
        assert_eq!(policy.ranking, RankingStrategy::Greedy);
        assert_eq!(policy.ban_threshold, 5);
    }
}
