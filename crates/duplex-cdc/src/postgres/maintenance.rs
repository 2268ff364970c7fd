//! Janitor routines
//!
//! Retention cleanup for the outbox and the processed-event ledger,
//! invoked externally (cron, scheduler, or `duplexd cleanup`). The
//! ledger retention must exceed the bus message retention so a late
//! redelivery cannot slip past the dedup check.

use deadpool_postgres::Pool;
use duplex_core::Result;
use tracing::info;

const CLEANUP_OUTBOX_SQL: &str = "DELETE FROM replication_queue \
     WHERE published AND created_at < now() - make_interval(days => $1)";

const CLEANUP_LEDGER_SQL: &str =
    "DELETE FROM processed_events WHERE processed_at < now() - make_interval(days => $1)";

/// Delete published outbox rows older than the retention window.
pub async fn cleanup_outbox(pool: &Pool, retention_days: i32) -> Result<u64> {
    let client = super::client(pool).await?;
    let deleted = client
        .execute(CLEANUP_OUTBOX_SQL, &[&retention_days])
        .await?;
    info!(deleted, retention_days, "outbox cleanup finished");
    Ok(deleted)
}

/// Delete processed-event rows older than the retention window.
pub async fn cleanup_ledger(pool: &Pool, retention_days: i32) -> Result<u64> {
    let client = super::client(pool).await?;
    let deleted = client
        .execute(CLEANUP_LEDGER_SQL, &[&retention_days])
        .await?;
    info!(deleted, retention_days, "ledger cleanup finished");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_cleanup_only_touches_published() {
        assert!(CLEANUP_OUTBOX_SQL.contains("WHERE published"));
        assert!(CLEANUP_OUTBOX_SQL.contains("make_interval"));
    }

    #[test]
    fn test_ledger_cleanup_is_age_based() {
        assert!(CLEANUP_LEDGER_SQL.contains("processed_at <"));
    }
}
