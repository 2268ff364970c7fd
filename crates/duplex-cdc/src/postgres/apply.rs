//! PostgreSQL applier backend
//!
//! One transaction per event: ledger probe, `SET CONSTRAINTS ALL
//! DEFERRED` (foreign keys between replicated tables arrive in
//! unconstrained order and are checked at commit), generic DML from the
//! JSON image, ledger insert, commit. The consuming sessions carry the
//! suppression identity, so none of this re-enters capture.

use crate::apply::{after_image, conflict_decision, event_pk, ApplyOutcome, ChangeApplier};
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use duplex_core::{
    ChangeEvent, ConflictDecision, ConflictPolicy, Operation, ReplicationError, Result,
};
use tracing::{debug, warn};

use super::sql;

const LEDGER_PROBE_SQL: &str = "SELECT 1 FROM processed_events WHERE event_id = $1";
const LEDGER_INSERT_SQL: &str =
    "INSERT INTO processed_events (event_id, processed_at) VALUES ($1, now())";

/// Change applier over a consumer-identity connection pool.
pub struct PgChangeApplier {
    pool: Pool,
}

impl PgChangeApplier {
    /// The pool MUST have been built with the consumer session identity
    /// as its `application_name`, otherwise every applied event re-enters
    /// the outbox and the contours feed each other forever.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn apply_in_txn(
        &self,
        client: &Object,
        event: &ChangeEvent,
        policy: ConflictPolicy,
        key: &str,
    ) -> Result<ApplyOutcome> {
        let event_id = event.event_id.to_string();
        if client
            .query_opt(LEDGER_PROBE_SQL, &[&event_id])
            .await?
            .is_some()
        {
            return Ok(ApplyOutcome::Duplicate);
        }

        client.batch_execute("SET CONSTRAINTS ALL DEFERRED").await?;

        let outcome = match event.operation {
            Operation::Insert | Operation::Update => {
                let image = after_image(event)?;
                let incoming = event.version();
                let probe = sql::probe_version_sql(&event.table)?;
                let existing = client
                    .query_opt(probe.as_str(), &[image])
                    .await?
                    .map(|row| row.get::<_, i64>(0));

                match existing {
                    None => {
                        let insert = sql::insert_sql(&event.table)?;
                        client.execute(insert.as_str(), &[image]).await?;
                        ApplyOutcome::Applied
                    }
                    Some(existing) => {
                        match conflict_decision(event.operation, policy, existing, incoming) {
                            ConflictDecision::Apply => {
                                let update = sql::update_sql(&event.table, image)?;
                                client.execute(update.as_str(), &[image]).await?;
                                ApplyOutcome::Applied
                            }
                            ConflictDecision::Skip => {
                                debug!(
                                    table = %event.table,
                                    key,
                                    existing,
                                    incoming,
                                    "conflict resolved: keeping existing row"
                                );
                                ApplyOutcome::Skipped
                            }
                            ConflictDecision::Fail => {
                                warn!(
                                    table = %event.table,
                                    key,
                                    existing,
                                    incoming,
                                    "conflict surfaced by error policy"
                                );
                                return Err(ReplicationError::Conflict {
                                    table: event.table.clone(),
                                    key: key.to_string(),
                                    existing,
                                    incoming,
                                });
                            }
                        }
                    }
                }
            }
            Operation::Delete => {
                let image = event.before.as_ref().ok_or_else(|| {
                    ReplicationError::invalid_event("DELETE event without a before image")
                })?;
                // Zero rows affected is fine: already deleted.
                let delete = sql::delete_sql(&event.table)?;
                client.execute(delete.as_str(), &[image]).await?;
                ApplyOutcome::Applied
            }
        };

        client.execute(LEDGER_INSERT_SQL, &[&event_id]).await?;
        Ok(outcome)
    }
}

#[async_trait]
impl ChangeApplier for PgChangeApplier {
    async fn apply(&self, event: &ChangeEvent, policy: ConflictPolicy) -> Result<ApplyOutcome> {
        event.check_shape()?;
        let key = event_pk(event)?;

        let client = super::client(&self.pool).await?;
        client.batch_execute("BEGIN").await?;

        match self.apply_in_txn(&client, event, policy, &key).await {
            Ok(ApplyOutcome::Duplicate) => {
                client.batch_execute("ROLLBACK").await?;
                Ok(ApplyOutcome::Duplicate)
            }
            Ok(outcome) => {
                // Deferred constraints are checked here; a violation
                // rolls the whole event back.
                if let Err(e) = client.batch_execute("COMMIT").await {
                    client.batch_execute("ROLLBACK").await.ok();
                    return Err(e.into());
                }
                Ok(outcome)
            }
            Err(e) => {
                client.batch_execute("ROLLBACK").await.ok();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_sql_shape() {
        assert!(LEDGER_PROBE_SQL.contains("processed_events"));
        assert!(LEDGER_INSERT_SQL.contains("processed_events"));
        assert!(LEDGER_INSERT_SQL.contains("now()"));
    }
}
