//! Rota Adaptive - Adaptive Proxy Pool
//!
//! Selects, scores, rotates and retires outbound proxies for high-volume
//! scraping workloads, learning from per-request outcome feedback.
//!
//! ## Features
//!
//! - EWMA proxy scoring blended with latency and geographic terms
//! - Cooldown/ban state machine with capped exponential backoff
//! - Score-weighted selection with subnet diversity and exclusive mode
//! - Per-proxy sessions with consistent, seeded browser fingerprints
//! - Idempotent outcome reporting keyed by request id
//! - HTTP, HTTPS, SOCKS4, SOCKS4a, and SOCKS5 proxy support
//!
//! ```no_run
//! use rota_adaptive::{AdaptivePool, Outcome, PolicyConfig, SelectionConstraints, SessionConfig};
//! use rota_adaptive::models::ProxyEndpoint;
//!
//! # fn main() -> rota_adaptive::Result<()> {
//! let pool = AdaptivePool::new(PolicyConfig::default(), SessionConfig::default())?;
//! pool.ingest(ProxyEndpoint::parse("socks5://10.0.0.1:1080")?);
//!
//! let assignment = pool.select(&SelectionConstraints::new())?;
//! // ... send the request through assignment.proxy_url() ...
//! pool.report(&assignment, Outcome::Success)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod proxy;
pub mod repository;
pub mod services;

pub use config::{Config, PolicyConfig, SessionConfig};
pub use error::{Result, RotaError};
pub use models::{Outcome, OutcomeReport, PoolStats, ProxyState, RecordId};
pub use proxy::{AdaptivePool, Assignment, ReportAck, SelectionConstraints};
