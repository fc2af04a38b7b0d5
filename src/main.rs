//! Rota Adaptive - Entry Point
//!
//! Loads the proxy list, keeps the pool maintained in the background and
//! shuts down gracefully on Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rota_adaptive::config::{Config, LogConfig};
use rota_adaptive::ingest::{FileProxySource, ProxySource};
use rota_adaptive::services::{MaintenanceConfig, MaintenanceHandle, PoolMaintenanceService};
use rota_adaptive::AdaptivePool;

#[tokio::main]
async fn main() -> rota_adaptive::Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Rota Adaptive");
    info!(
        ranking = config.policy.ranking.as_str(),
        score_floor = config.policy.score_floor,
        diversity_window = config.policy.diversity_window,
        exclusive = config.policy.exclusive,
        "Configuration loaded"
    );

    let pool = Arc::new(AdaptivePool::from_config(&config)?);

    // Restore learned state before the proxy list refreshes declared attributes
    if let Some(path) = &config.service.state_file {
        match pool.load_state(path).await {
            Ok(restored) => info!("Restored {} proxies from {}", restored, path.display()),
            Err(e) => error!("Failed to load pool state from {}: {}", path.display(), e),
        }
    }

    // Load initial proxies
    let source: Option<Arc<dyn ProxySource>> = config
        .service
        .proxy_file
        .as_ref()
        .map(|path| Arc::new(FileProxySource::new(path)) as Arc<dyn ProxySource>);

    match &source {
        Some(source) => match source.fetch().await {
            Ok(endpoints) => {
                let ids = pool.ingest_all(endpoints);
                info!("Loaded {} proxies from {}", ids.len(), source.name());
            }
            Err(e) => error!("Failed to load proxy list: {}", e),
        },
        None => warn!("PROXY_FILE not set; pool starts empty"),
    }

    // Start maintenance service
    let (maintenance_handle, maintenance_shutdown) = MaintenanceHandle::new();
    let maintenance = PoolMaintenanceService::new(
        Arc::clone(&pool),
        source,
        MaintenanceConfig {
            interval: Duration::from_secs(config.service.maintenance_interval_secs.max(1)),
            state_file: config.service.state_file.clone(),
        },
    );
    let maintenance_task = tokio::spawn(async move {
        maintenance.run(maintenance_shutdown).await;
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    maintenance_handle.shutdown();
    let _ = maintenance_task.await;

    if let Some(path) = &config.service.state_file {
        match pool.save_state(path).await {
            Ok(()) => info!("Pool state saved to {}", path.display()),
            Err(e) => error!("Failed to save pool state: {}", e),
        }
    }

    let stats = pool.stats();
    info!(
        total = stats.total_proxies,
        assignments = stats.total_assignments,
        success_rate = stats.success_rate,
        "Rota Adaptive stopped"
    );
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_adaptive={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
