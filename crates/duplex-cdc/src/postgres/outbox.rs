//! PostgreSQL outbox backend
//!
//! The lease is a `FOR UPDATE SKIP LOCKED` selection inside an open
//! transaction held by the batch object. Concurrent Publisher instances
//! skip each other's leased rows, a crashed holder's transaction aborts
//! and the database releases the lease on its own.

use crate::outbox::{OutboxBatch, OutboxEntry, OutboxStore};
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use duplex_core::{Operation, Result};
use tracing::debug;

const LEASE_SQL: &str = "SELECT id, table_name, operation, record_data, primary_key_value, \
     created_at \
     FROM replication_queue \
     WHERE NOT published \
     ORDER BY id ASC \
     LIMIT $1 \
     FOR UPDATE SKIP LOCKED";

const MARK_PUBLISHED_SQL: &str =
    "UPDATE replication_queue SET published = TRUE, published_at = now() WHERE id = ANY($1)";

/// Outbox store over `replication_queue`.
pub struct PgOutboxStore {
    pool: Pool,
}

impl PgOutboxStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn begin_drain(&self, limit: usize) -> Result<Box<dyn OutboxBatch>> {
        let client = super::client(&self.pool).await?;
        client.batch_execute("BEGIN").await?;

        let rows = match client.query(LEASE_SQL, &[&(limit as i64)]).await {
            Ok(rows) => rows,
            Err(e) => {
                client.batch_execute("ROLLBACK").await.ok();
                return Err(e.into());
            }
        };

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let operation: String = row.get("operation");
            let entry = OutboxEntry {
                id: row.get("id"),
                table: row.get("table_name"),
                operation: match operation.parse::<Operation>() {
                    Ok(op) => op,
                    Err(e) => {
                        client.batch_execute("ROLLBACK").await.ok();
                        return Err(e);
                    }
                },
                payload: row.get("record_data"),
                primary_key_value: row.get("primary_key_value"),
                created_at: row.get("created_at"),
            };
            entries.push(entry);
        }

        debug!(leased = entries.len(), "outbox rows leased");
        Ok(Box::new(PgOutboxBatch { client, entries }))
    }
}

struct PgOutboxBatch {
    client: Object,
    entries: Vec<OutboxEntry>,
}

#[async_trait]
impl OutboxBatch for PgOutboxBatch {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let ids: Vec<i64> = self.entries.iter().map(|e| e.id).collect();
        if let Err(e) = self.client.execute(MARK_PUBLISHED_SQL, &[&ids]).await {
            self.client.batch_execute("ROLLBACK").await.ok();
            return Err(e.into());
        }
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_sql_shape() {
        assert!(LEASE_SQL.contains("WHERE NOT published"));
        assert!(LEASE_SQL.contains("ORDER BY id ASC"));
        assert!(LEASE_SQL.contains("FOR UPDATE SKIP LOCKED"));
    }

    #[test]
    fn test_mark_published_sql_shape() {
        assert!(MARK_PUBLISHED_SQL.contains("published = TRUE"));
        assert!(MARK_PUBLISHED_SQL.contains("published_at = now()"));
    }
}
