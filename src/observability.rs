use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tally_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tally_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tally_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tally_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tally_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "tally_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "tally_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tally_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tally_wal_flush_batch_size";

// ── Consistency metrics ─────────────────────────────────────────

/// Counter: conditional writes that lost their version race and retried.
pub const WRITE_CONFLICTS_TOTAL: &str = "tally_write_conflicts_total";

/// Counter: commits abandoned after exhausting their retry budget.
pub const COMMIT_RETRIES_EXHAUSTED_TOTAL: &str = "tally_commit_retries_exhausted_total";

/// Counter: ledger chains whose replay disagreed with the live balance.
pub const INTEGRITY_ALERTS_TOTAL: &str = "tally_integrity_alerts_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertAccount { .. } => "insert_account",
        Command::InsertPayment { .. } => "insert_payment",
        Command::InsertAdjustment { .. } => "insert_adjustment",
        Command::InsertSubscription { .. } => "insert_subscription",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertReferralBonus { .. } => "insert_referral_bonus",
        Command::UpdateSessionStatus { .. } => "update_session_status",
        Command::UpdateSubscriptionStatus { .. } => "update_subscription_status",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBalance { .. } => "select_balance",
        Command::SelectLedger { .. } => "select_ledger",
        Command::SelectPayments { .. } => "select_payments",
        Command::SelectSubscriptions { .. } => "select_subscriptions",
        Command::SelectSessions { .. } => "select_sessions",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectAudit { .. } => "select_audit",
        Command::SelectAccounts => "select_accounts",
        Command::SelectStatus => "select_status",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
