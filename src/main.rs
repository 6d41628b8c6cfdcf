//! SMT Pulse - analysis pipeline entry point

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use smtpulse::cache::{MemoryStore, ResultCache};
use smtpulse::config::{AppConfig, LoggingConfig, SharedSettings};
use smtpulse::feed::YahooFeed;
use smtpulse::killzone::KillzoneScheduler;
use smtpulse::orchestrator::{AnalysisContext, AnalysisOrchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(&config.logging);

    info!("📈 SMT Pulse starting");
    info!(config = %config.digest(), "Configuration loaded");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e).context("Configuration validation failed");
    }

    let feed = YahooFeed::new(&config.feed)?;
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(ResultCache::new(store.clone()));
    let settings = Arc::new(SharedSettings::new(config.analysis.clone())?);
    let killzones = KillzoneScheduler::from_config(&config.killzones)?;

    let ctx = AnalysisContext {
        feed: Arc::new(feed),
        cache,
        settings,
        killzones,
        config: OrchestratorConfig::from_app(&config)?,
    };
    let orchestrator = Arc::new(AnalysisOrchestrator::new(ctx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Expired entries are only dropped lazily on read otherwise
    let purge_store = store.clone();
    let mut purge_shutdown = shutdown_rx.clone();
    let purge_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let purged = purge_store.purge_expired().await;
                    if purged > 0 {
                        tracing::debug!(purged, "Purged expired cache entries");
                    }
                }
                changed = purge_shutdown.changed() => {
                    if changed.is_err() || *purge_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let run_handle = tokio::spawn(orchestrator.clone().run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("🛑 Shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Err(e) = run_handle.await {
        error!(error = %e, "Orchestrator task ended abnormally");
    }
    let _ = purge_handle.await;

    if let Some(stats) = orchestrator.last_cycle() {
        info!(
            fetched = stats.symbols_fetched,
            failed = stats.symbols_failed,
            cache_degraded = stats.cache_degraded,
            "Last cycle before shutdown"
        );
    }
    info!("👋 SMT Pulse stopped");
    Ok(())
}

/// Initialize logging; RUST_LOG wins over the configured level
fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
