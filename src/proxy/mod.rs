//! Adaptive proxy management
//!
//! This module provides the pool and its components:
//! - EWMA quality scoring with latency and geo terms
//! - Cooldown and ban state machine with capped exponential backoff
//! - Score-ranked selection with subnet diversity
//! - Session binding with consistent browser fingerprints
//! - Idempotent outcome feedback

pub mod cooldown;
pub mod feedback;
pub mod fingerprint;
pub mod policy;
pub mod pool;
pub mod rotation;
pub mod scoring;
pub mod session;

pub use cooldown::{CooldownController, StateChange};
pub use feedback::{FeedbackIngestor, ReportAck};
pub use fingerprint::FingerprintGenerator;
pub use policy::PolicyEngine;
pub use pool::{AdaptivePool, PoolState};
pub use rotation::{create_ranker, Assignment, RankingStrategy, SelectionConstraints};
pub use scoring::Scorer;
pub use session::{NavigationPattern, SessionBinder};
