use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "orcdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "orcdesk_query_duration_seconds";

// ── Numbering ───────────────────────────────────────────────────

/// Histogram: attempts taken by a successful number allocation.
pub const ALLOCATION_ATTEMPTS: &str = "orcdesk_allocation_attempts";

/// Counter: candidate numbers found already taken.
pub const ALLOCATION_COLLISIONS_TOTAL: &str = "orcdesk_allocation_collisions_total";

/// Counter: allocations that ran out of attempts.
pub const ALLOCATION_EXHAUSTED_TOTAL: &str = "orcdesk_allocation_exhausted_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "orcdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "orcdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "orcdesk_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "orcdesk_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "orcdesk_auth_failures_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "orcdesk_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "orcdesk_journal_flush_batch_size";

/// Counter: calendar events dropped by the retention reaper.
pub const CALENDAR_PRUNED_TOTAL: &str = "orcdesk_calendar_pruned_total";

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

/// Short label for a command, used on query metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertCalendarEvents { .. } => "upsert_calendar_events",
        Command::DeleteCalendarEvent { .. } => "delete_calendar_event",
        Command::SelectCalendarEvents => "select_calendar_events",
        Command::SelectBusySlots { .. } => "select_busy_slots",
        Command::SelectOpenSlots { .. } => "select_open_slots",
        Command::IssueDocument { .. } => "issue_document",
        Command::DeleteDocument { .. } => "delete_document",
        Command::SelectDocuments { .. } => "select_documents",
        Command::SelectNextNumber { .. } => "select_next_number",
    }
}
