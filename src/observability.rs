use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: op, outcome (`ok` or an error kind).
pub const OPERATIONS_TOTAL: &str = "bookd_operations_total";

// ── Background work ─────────────────────────────────────────────

/// Counter: bookings moved to `expired` by the sweeper.
pub const BOOKINGS_EXPIRED_TOTAL: &str = "bookd_bookings_expired_total";

/// Histogram: expiry sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "bookd_sweep_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: items known to the engine.
pub const ITEMS_REGISTERED: &str = "bookd_items_registered";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
