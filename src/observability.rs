use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations executed. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "staybook_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "staybook_operation_duration_seconds";

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "staybook_reservations_created_total";

/// Counter: reservation attempts refused. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "staybook_reservations_rejected_total";

/// Counter: reservations cancelled by their guest.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "staybook_reservations_cancelled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: properties currently held by the engine.
pub const PROPERTIES_ACTIVE: &str = "staybook_properties_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "staybook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "staybook_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "staybook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map an error to a short label for metrics.
pub fn error_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::NotFound(_) => "not_found",
        EngineError::InvalidDateRange(_) => "invalid_date_range",
        EngineError::Unavailable { .. } => "unavailable",
        EngineError::Forbidden(_) => "forbidden",
        EngineError::TooLate { .. } => "too_late",
        EngineError::Inactive(_) => "inactive",
        EngineError::TooManyGuests { .. } => "too_many_guests",
        EngineError::HasReservations(_) => "has_reservations",
        EngineError::InvalidInput(_) => "invalid_input",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::WalError(_) => "wal_error",
    }
}

/// Record outcome and latency of one engine operation.
pub fn record<T>(op: &'static str, started: std::time::Instant, result: &Result<T, EngineError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => error_label(e),
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
