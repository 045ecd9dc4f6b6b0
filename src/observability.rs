use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotd_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: reservations committed to the WAL.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "slotd_reservations_committed_total";

/// Counter: reservations rejected because the span was taken.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "slotd_reservation_conflicts_total";

/// Counter: appointments cancelled.
pub const CANCELLATIONS_TOTAL: &str = "slotd_cancellations_total";

/// Counter: commit attempts retried after a storage failure.
pub const STORAGE_RETRIES_TOTAL: &str = "slotd_storage_retries_total";

/// Counter: commits abandoned after exceeding the commit timeout.
pub const COMMIT_TIMEOUTS_TOTAL: &str = "slotd_commit_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const COMPACTIONS_TOTAL: &str = "slotd_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEstablishment { .. } => "insert_establishment",
        Command::InsertStaff { .. } => "insert_staff",
        Command::InsertServiceAssignment { .. } => "insert_service_assignment",
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertWindow { .. } => "insert_window",
        Command::DeleteWindow { .. } => "delete_window",
        Command::InsertAppointment { .. } => "reserve",
        Command::CancelAppointment { .. } => "cancel",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectAppointments(_) => "select_appointments",
        Command::SelectEstablishments => "select_establishments",
        Command::SelectWindows { .. } => "select_windows",
        Command::SelectServices { .. } => "select_services",
        Command::SelectStaff { .. } => "select_staff",
    }
}
