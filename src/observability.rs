use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: request, status.
pub const REQUESTS_TOTAL: &str = "slotkeeper_requests_total";

/// Histogram: request latency in seconds. Labels: request.
pub const REQUEST_DURATION_SECONDS: &str = "slotkeeper_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections refused at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

// ── Scheduling core ─────────────────────────────────────────────

/// Gauge: live slot locks.
pub const LOCKS_ACTIVE: &str = "slotkeeper_locks_active";

/// Counter: granted lock requests (including refreshes).
pub const LOCKS_ACQUIRED_TOTAL: &str = "slotkeeper_locks_acquired_total";

/// Counter: rejected lock requests. Labels: reason.
pub const LOCKS_REJECTED_TOTAL: &str = "slotkeeper_locks_rejected_total";

/// Counter: locks force-released by the expiry sweep.
pub const LOCKS_EXPIRED_TOTAL: &str = "slotkeeper_locks_expired_total";

/// Counter: capacity reservations. Labels: outcome (reserved, slot_full).
pub const RESERVATIONS_TOTAL: &str = "slotkeeper_reservations_total";

/// Counter: reservations undone after a failed appointment write.
pub const COMPENSATIONS_TOTAL: &str = "slotkeeper_compensations_total";

/// Counter: compensations that themselves failed. Needs an operator.
pub const COMPENSATION_FAILURES_TOTAL: &str = "slotkeeper_compensation_failures_total";

/// Counter: schedule writes rejected for conflicts. Labels: kind.
pub const SCHEDULE_CONFLICTS_TOTAL: &str = "slotkeeper_schedule_conflicts_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short label for a request variant.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::Identify { .. } => "identify",
        Request::JoinChannel { .. } => "join_channel",
        Request::LeaveChannel { .. } => "leave_channel",
        Request::AcquireLock { .. } => "acquire_lock",
        Request::ReleaseLock { .. } => "release_lock",
        Request::SubmitBooking { .. } => "submit_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::RescheduleBooking { .. } => "reschedule_booking",
        Request::ValidateSchedule { .. } => "validate_schedule",
        Request::CreateSchedule { .. } => "create_schedule",
        Request::UpdateSchedule { .. } => "update_schedule",
        Request::SetScheduleActive { .. } => "set_schedule_active",
        Request::GetSchedules { .. } => "get_schedules",
    }
}
