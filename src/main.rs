use std::sync::Arc;

use tracing::info;

use staybook::compactor;
use staybook::config::Config;
use staybook::engine::Engine;
use staybook::notify::NotifyHub;

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM ({e}), waiting for ctrl-c only");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    staybook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::new(config.wal_path(), Arc::new(NotifyHub::new()))?);

    info!("staybook engine ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  properties: {}", engine.state.len());
    info!("  compact: every {:?} past {} appends", config.compact_interval, config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let compactor = tokio::spawn(compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    shutdown_signal().await;
    info!("shutdown signal received");
    compactor.abort();

    // Leave a minimal WAL behind so the next start replays quickly.
    if let Err(e) = engine.compact_wal().await {
        tracing::error!("final compaction failed: {e}");
    }
    info!("staybook stopped");
    Ok(())
}
