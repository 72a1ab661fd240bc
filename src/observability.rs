use std::net::SocketAddr;

use crate::engine::ScanOutcome;

// ── Kiosk ───────────────────────────────────────────────────────

/// Counter: tag scans handled. Labels: outcome.
pub const SCANS_TOTAL: &str = "kitroom_scans_total";

/// Counter: loan sessions dropped by the inactivity timeout.
pub const SESSIONS_EXPIRED_TOTAL: &str = "kitroom_sessions_expired_total";

// ── Reservations ────────────────────────────────────────────────

/// Counter: reservations created (one per unit).
pub const RESERVATIONS_CREATED_TOTAL: &str = "kitroom_reservations_created_total";

/// Counter: overlap violations reported to callers.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "kitroom_reservation_conflicts_total";

/// Counter: display-status writes made by the synchronizer.
pub const STATUS_WRITES_TOTAL: &str = "kitroom_status_writes_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "kitroom_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "kitroom_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a scan outcome to a short label for metrics.
pub fn outcome_label(outcome: &ScanOutcome) -> &'static str {
    match outcome {
        ScanOutcome::SessionOpened { .. } => "session_opened",
        ScanOutcome::SessionClosed { .. } => "session_closed",
        ScanOutcome::LogCreated { .. } => "log_created",
        ScanOutcome::SessionBusy { .. } => "session_busy",
        ScanOutcome::NoSession { .. } => "no_session",
        ScanOutcome::EquipmentAdded { .. } => "equipment_added",
        ScanOutcome::EquipmentRemoved { .. } => "equipment_removed",
        ScanOutcome::Pending { .. } => "pending",
    }
}
