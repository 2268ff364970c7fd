//! Embedded capture schema
//!
//! The SQL shipped under `migrations/` compiled into the binary, so
//! `duplexd migrate` can install the service tables and trigger
//! functions without carrying files around. Replicated tables opt in
//! afterwards with `SELECT duplex_enable_replication('my_table')`.

use deadpool_postgres::Pool;
use duplex_core::Result;
use tracing::info;

/// Service tables: `replication_queue`, `processed_events`.
pub const REPLICATION_SCHEMA_SQL: &str =
    include_str!("../../migrations/0001_replication_schema.sql");

/// Trigger functions, installer and janitor functions.
pub const CAPTURE_TRIGGERS_SQL: &str = include_str!("../../migrations/0002_capture_triggers.sql");

/// Migrations in apply order.
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_replication_schema", REPLICATION_SCHEMA_SQL),
    ("0002_capture_triggers", CAPTURE_TRIGGERS_SQL),
];

/// Apply every migration. Each file is idempotent, so re-running on an
/// installed database is a no-op.
pub async fn install(pool: &Pool) -> Result<()> {
    let client = super::client(pool).await?;
    for (name, sql) in MIGRATIONS {
        client.batch_execute(sql).await?;
        info!(migration = name, "migration applied");
    }
    Ok(())
}
