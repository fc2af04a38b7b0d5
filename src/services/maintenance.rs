//! Pool maintenance service
//!
//! Periodically refreshes the pool from its proxy source, prunes proxies that
//! have been unreachable for the policy's prune period, drops expired
//! sessions, reclaims abandoned assignments, saves learned state and logs a
//! stats line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, instrument, warn};

use crate::error::Result;
use crate::ingest::ProxySource;
use crate::proxy::AdaptivePool;

/// Maintenance service configuration
#[derive(Clone)]
pub struct MaintenanceConfig {
    /// How often to run a maintenance pass
    pub interval: Duration,
    /// Where to save learned pool state after each pass
    pub state_file: Option<PathBuf>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            state_file: None,
        }
    }
}

/// What one maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub ingested: usize,
    pub pruned: usize,
    pub sessions_swept: usize,
    pub leases_released: usize,
    pub state_saved: bool,
}

pub struct PoolMaintenanceService {
    pool: Arc<AdaptivePool>,
    source: Option<Arc<dyn ProxySource>>,
    config: MaintenanceConfig,
}

impl PoolMaintenanceService {
    pub fn new(
        pool: Arc<AdaptivePool>,
        source: Option<Arc<dyn ProxySource>>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            pool,
            source,
            config,
        }
    }

    /// Run the maintenance loop until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting pool maintenance service (interval: {}s)",
            self.config.interval.as_secs()
        );

        let mut ticker = interval(self.config.interval);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!("Pool maintenance pass failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pool maintenance service shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One maintenance pass
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        if let Some(source) = &self.source {
            let endpoints = source.fetch().await?;
            report.ingested = endpoints.len();
            for endpoint in endpoints {
                self.pool.ingest_at(endpoint, now);
            }
        }

        report.pruned = self.pool.prune_unreachable(now).len();
        report.sessions_swept = self.pool.sweep_sessions(now);
        report.leases_released = self.pool.release_stale_leases(now);

        if let Some(path) = &self.config.state_file {
            match self.pool.save_state(path).await {
                Ok(()) => report.state_saved = true,
                Err(e) => warn!(path = %path.display(), "Failed to save pool state: {}", e),
            }
        }

        let stats = self.pool.stats_at(now);
        info!(
            total = stats.total_proxies,
            active = stats.active_proxies,
            cooling = stats.cooling_proxies,
            banned = stats.banned_proxies,
            in_flight = stats.in_flight,
            sessions = stats.live_sessions,
            success_rate = stats.success_rate,
            detection_rate = stats.detection_rate,
            pruned = report.pruned,
            "Pool status"
        );

        Ok(report)
    }
}

/// Handle for managing the maintenance service
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl MaintenanceHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for MaintenanceHandle {
    fn default() -> Self {
        Self::new().0
    }
}
