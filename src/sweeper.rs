use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};
use crate::observability;

#[derive(Debug, PartialEq, Eq)]
pub enum SweepOutcome {
    Expired(usize),
    Failed,
    TimedOut,
}

/// One expiry pass bounded by `timeout`. Failures are logged, never propagated.
pub async fn sweep_once(engine: &Engine, now: i64, timeout: Duration) -> SweepOutcome {
    let started = std::time::Instant::now();
    let outcome = match tokio::time::timeout(timeout, engine.expire_overdue(now)).await {
        Ok(Ok(count)) => {
            if count > 0 {
                info!(count, "expired overdue handovers");
            }
            SweepOutcome::Expired(count)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "expiry sweep failed; retrying next tick");
            SweepOutcome::Failed
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "expiry sweep timed out; retrying next tick");
            SweepOutcome::TimedOut
        }
    };
    metrics::histogram!(observability::SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    outcome
}

/// Background task: sweep once at start, then every `every`.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, timeout: Duration) {
    // The first tick of `interval` completes immediately.
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine, now_ms(), timeout).await;
    }
}

/// Background task: compact the WAL once enough appends have piled up since the last time.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let appends = match engine.appends_since_compact().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "compactor could not read WAL stats");
                continue;
            }
        };
        if appends < threshold {
            continue;
        }
        match engine.compact().await {
            Ok(true) => info!(appends, "WAL compacted"),
            Ok(false) => debug!(appends, "WAL compaction skipped; items busy"),
            Err(e) => warn!(error = %e, "WAL compaction failed"),
        }
    }
}
