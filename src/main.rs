use std::sync::Arc;

use tracing::info;

use bookd::config::Config;
use bookd::engine::Engine;
use bookd::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    bookd::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::open(&config.wal_path())?);

    info!("bookd running");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  sweep: every {:?} (timeout {:?})",
        config.sweep_interval, config.sweep_timeout
    );
    info!(
        "  compaction: every {:?} after {} appends",
        config.compact_interval, config.compact_threshold
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweeper = tokio::spawn(sweeper::run_sweeper(
        engine.clone(),
        config.sweep_interval,
        config.sweep_timeout,
    ));
    let compactor = tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    let shutdown = async {
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
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received, stopping background tasks");
    sweeper.abort();
    compactor.abort();
    // Every acknowledged commit is already fsynced; nothing left to flush.
    info!("bookd stopped");
    Ok(())
}
