use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "lineup_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "lineup_query_duration_seconds";

/// Counter: creates/updates refused by date validation or overlap. Labels: reason.
pub const SCHEDULE_REJECTIONS_TOTAL: &str = "lineup_schedule_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "lineup_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "lineup_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lineup_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "lineup_tenants_active";

/// Counter: WAL compactions run. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "lineup_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lineup_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (mutations per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lineup_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None;
/// a failed install is logged and the server keeps running without metrics.
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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEvent(_) => "insert_event",
        Command::UpdateEvent { .. } => "update_event",
        Command::DeleteEvent { .. } => "delete_event",
        Command::SelectEvents(_) => "select_events",
        Command::SelectTags => "select_tags",
        Command::SelectStages => "select_stages",
        Command::SelectTalents => "select_talents",
        Command::SelectEventExists { .. } => "select_event_exists",
        Command::InsertStage { .. } => "insert_stage",
        Command::InsertTalent { .. } => "insert_talent",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
