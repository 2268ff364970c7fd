//! Change-applier seam
//!
//! The Consumer hands every remote event to a [`ChangeApplier`], which
//! performs the whole exactly-once-effect transaction: processed-event
//! ledger probe, DML with version-based conflict resolution, ledger
//! insert, commit. The applier never re-enters capture - the PostgreSQL
//! backend relies on the session identity predicate, the in-memory
//! backend writes no outbox by construction.

use async_trait::async_trait;
use duplex_core::{
    value_to_key, ChangeEvent, ConflictDecision, ConflictPolicy, Operation, ReplicationError,
    Result,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// What applying one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// DML executed and committed
    Applied,
    /// Event id already in the ledger; no DML
    Duplicate,
    /// Conflict resolved in favor of the existing row; no DML, event
    /// recorded so replays stay idempotent
    Skipped,
}

/// Applies remote change events to the local database, exactly once in
/// effect.
#[async_trait]
pub trait ChangeApplier: Send + Sync {
    /// Apply one event inside a single local transaction.
    ///
    /// Errors roll the transaction back: retriable errors leave the event
    /// unacknowledged for redelivery, poison errors are acknowledged by
    /// the caller, and [`ReplicationError::Conflict`] surfaces the
    /// `error` policy.
    async fn apply(&self, event: &ChangeEvent, policy: ConflictPolicy) -> Result<ApplyOutcome>;
}

/// Extract the canonical primary key of an event, as a map key string.
pub(crate) fn event_pk(event: &ChangeEvent) -> Result<String> {
    event
        .primary_key_value()
        .map(value_to_key)
        .ok_or_else(|| ReplicationError::invalid_event("event carries no id primary key"))
}

/// Post-image of an event, required for INSERT/UPDATE application.
pub(crate) fn after_image(event: &ChangeEvent) -> Result<&Value> {
    event.after.as_ref().ok_or_else(|| {
        ReplicationError::invalid_event(format!(
            "{} event without an after image",
            event.operation
        ))
    })
}

/// Decision for a row that already exists locally. A strictly newer
/// UPDATE is the normal overwrite path, not a conflict; everything else
/// goes through the policy.
pub(crate) fn conflict_decision(
    operation: Operation,
    policy: ConflictPolicy,
    existing: i64,
    incoming: i64,
) -> ConflictDecision {
    if operation == Operation::Update && incoming > existing {
        ConflictDecision::Apply
    } else {
        policy.decide(existing, incoming)
    }
}

#[derive(Default)]
struct MemoryDatabase {
    /// table -> pk string -> row image
    tables: HashMap<String, BTreeMap<String, Value>>,
    /// processed-event ledger
    ledger: HashSet<Uuid>,
}

/// In-memory applier mirroring the transactional semantics of the
/// PostgreSQL backend, for tests and loopback runs.
#[derive(Clone, Default)]
pub struct MemoryChangeApplier {
    state: Arc<Mutex<MemoryDatabase>>,
}

impl MemoryChangeApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a row directly, bypassing conflict resolution.
    /// Test hook standing in for a local business write.
    pub async fn set_row(&self, table: &str, key: &str, row: Value) {
        let mut state = self.state.lock().await;
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), row);
    }

    /// Remove a row directly. Test hook standing in for a local delete.
    pub async fn remove_row(&self, table: &str, key: &str) {
        let mut state = self.state.lock().await;
        if let Some(rows) = state.tables.get_mut(table) {
            rows.remove(key);
        }
    }

    /// Current row image, if present.
    pub async fn row(&self, table: &str, key: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state.tables.get(table).and_then(|t| t.get(key)).cloned()
    }

    /// Number of rows in a table.
    pub async fn table_len(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state.tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }

    /// Whether an event id has been recorded.
    pub async fn ledger_contains(&self, event_id: Uuid) -> bool {
        let state = self.state.lock().await;
        state.ledger.contains(&event_id)
    }

    /// Ledger size.
    pub async fn ledger_len(&self) -> usize {
        let state = self.state.lock().await;
        state.ledger.len()
    }

    fn version_of(row: &Value) -> i64 {
        row.get("version").and_then(Value::as_i64).unwrap_or(0)
    }
}

#[async_trait]
impl ChangeApplier for MemoryChangeApplier {
    async fn apply(&self, event: &ChangeEvent, policy: ConflictPolicy) -> Result<ApplyOutcome> {
        event.check_shape()?;
        let key = event_pk(event)?;

        let mut state = self.state.lock().await;
        if state.ledger.contains(&event.event_id) {
            return Ok(ApplyOutcome::Duplicate);
        }

        let existing = state
            .tables
            .get(&event.table)
            .and_then(|t| t.get(&key))
            .cloned();

        let outcome = match event.operation {
            Operation::Insert | Operation::Update => {
                let after = after_image(event)?.clone();
                let incoming = event.version();
                match existing {
                    None => {
                        state
                            .tables
                            .entry(event.table.clone())
                            .or_default()
                            .insert(key, after);
                        ApplyOutcome::Applied
                    }
                    Some(row) => {
                        let existing_version = Self::version_of(&row);
                        match conflict_decision(event.operation, policy, existing_version, incoming)
                        {
                            ConflictDecision::Apply => {
                                state
                                    .tables
                                    .entry(event.table.clone())
                                    .or_default()
                                    .insert(key, after);
                                ApplyOutcome::Applied
                            }
                            ConflictDecision::Skip => {
                                debug!(
                                    table = %event.table,
                                    existing = existing_version,
                                    incoming,
                                    "conflict resolved: keeping existing row"
                                );
                                ApplyOutcome::Skipped
                            }
                            ConflictDecision::Fail => {
                                warn!(
                                    table = %event.table,
                                    existing = existing_version,
                                    incoming,
                                    "conflict surfaced by error policy"
                                );
                                return Err(ReplicationError::Conflict {
                                    table: event.table.clone(),
                                    key,
                                    existing: existing_version,
                                    incoming,
                                });
                            }
                        }
                    }
                }
            }
            Operation::Delete => {
                if let Some(table) = state.tables.get_mut(&event.table) {
                    table.remove(&key);
                }
                // Absent row: already deleted, idempotent success
                ApplyOutcome::Applied
            }
        };

        state.ledger.insert(event.event_id);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(contour: &str) -> duplex_core::SourceInfo {
        duplex_core::SourceInfo {
            contour: contour.to_string(),
            database: "appdb".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_into_empty_table() {
        let applier = MemoryChangeApplier::new();
        let event = ChangeEvent::insert(
            source("alpha"),
            "users",
            json!({"id": 1, "name": "John", "version": 1}),
        );

        let outcome = applier
            .apply(&event, ConflictPolicy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        let row = applier.row("users", "1").await.unwrap();
        assert_eq!(row["name"], "John");
        assert!(applier.ledger_contains(event.event_id).await);
    }

    #[tokio::test]
    async fn test_second_delivery_is_duplicate_without_dml() {
        let applier = MemoryChangeApplier::new();
        let event = ChangeEvent::insert(
            source("alpha"),
            "users",
            json!({"id": 1, "name": "John", "version": 1}),
        );

        applier
            .apply(&event, ConflictPolicy::LastWriteWins)
            .await
            .unwrap();
        applier
            .set_row("users", "1", json!({"id": 1, "name": "local", "version": 9}))
            .await;

        let outcome = applier
            .apply(&event, ConflictPolicy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Duplicate);
        // Redelivery produced no DML
        assert_eq!(applier.row("users", "1").await.unwrap()["name"], "local");
        assert_eq!(applier.ledger_len().await, 1);
    }

    #[tokio::test]
    async fn test_insert_conflict_lww_higher_version_overwrites() {
        let applier = MemoryChangeApplier::new();
        applier
            .set_row("users", "1", json!({"id": 1, "name": "old", "version": 1}))
            .await;

        let event = ChangeEvent::insert(
            source("beta"),
            "users",
            json!({"id": 1, "name": "newer", "version": 3}),
        );
        let outcome = applier
            .apply(&event, ConflictPolicy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(applier.row("users", "1").await.unwrap()["name"], "newer");
    }

    #[tokio::test]
    async fn test_insert_conflict_tie_keeps_existing() {
        let applier = MemoryChangeApplier::new();
        applier
            .set_row("users", "1", json!({"id": 1, "name": "mine", "version": 2}))
            .await;

        let event = ChangeEvent::insert(
            source("beta"),
            "users",
            json!({"id": 1, "name": "theirs", "version": 2}),
        );
        let outcome = applier
            .apply(&event, ConflictPolicy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped);
        assert_eq!(applier.row("users", "1").await.unwrap()["name"], "mine");
        // Skipped events are still recorded for idempotence
        assert!(applier.ledger_contains(event.event_id).await);
    }

    #[tokio::test]
    async fn test_update_on_absent_row_promotes_to_insert() {
        let applier = MemoryChangeApplier::new();
        let event = ChangeEvent::update(
            source("alpha"),
            "users",
            None,
            json!({"id": 7, "name": "X", "version": 5}),
        );

        let outcome = applier
            .apply(&event, ConflictPolicy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(applier.row("users", "7").await.unwrap()["version"], 5);
    }

    #[tokio::test]
    async fn test_update_with_stale_version_skips() {
        let applier = MemoryChangeApplier::new();
        applier
            .set_row("users", "7", json!({"id": 7, "name": "X", "version": 5}))
            .await;

        let event = ChangeEvent::update(
            source("alpha"),
            "users",
            None,
            json!({"id": 7, "name": "stale", "version": 3}),
        );
        let outcome = applier
            .apply(&event, ConflictPolicy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped);
        assert_eq!(applier.row("users", "7").await.unwrap()["name"], "X");
    }

    #[tokio::test]
    async fn test_update_newer_version_overwrites_under_skip_policy() {
        // A strictly newer UPDATE is not a conflict, so even the `skip`
        // policy applies it.
        let applier = MemoryChangeApplier::new();
        applier
            .set_row("users", "7", json!({"id": 7, "name": "X", "version": 1}))
            .await;

        let event = ChangeEvent::update(
            source("alpha"),
            "users",
            None,
            json!({"id": 7, "name": "Y", "version": 2}),
        );
        let outcome = applier.apply(&event, ConflictPolicy::Skip).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(applier.row("users", "7").await.unwrap()["name"], "Y");
    }

    #[tokio::test]
    async fn test_error_policy_surfaces_conflict() {
        let applier = MemoryChangeApplier::new();
        applier
            .set_row("users", "1", json!({"id": 1, "version": 4}))
            .await;

        let event = ChangeEvent::update(
            source("beta"),
            "users",
            None,
            json!({"id": 1, "version": 2}),
        );
        let err = applier
            .apply(&event, ConflictPolicy::Error)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::Conflict {
                existing: 4,
                incoming: 2,
                ..
            }
        ));
        // Failed events are not recorded; redelivery retries the conflict
        assert!(!applier.ledger_contains(event.event_id).await);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let applier = MemoryChangeApplier::new();
        applier
            .set_row("users", "9", json!({"id": 9, "version": 3}))
            .await;

        let event = ChangeEvent::delete(source("alpha"), "users", json!({"id": 9, "version": 3}));
        assert_eq!(
            applier
                .apply(&event, ConflictPolicy::LastWriteWins)
                .await
                .unwrap(),
            ApplyOutcome::Applied
        );
        assert!(applier.row("users", "9").await.is_none());

        // Same key, different event: row already gone, still success
        let again = ChangeEvent::delete(source("alpha"), "users", json!({"id": 9, "version": 3}));
        assert_eq!(
            applier
                .apply(&again, ConflictPolicy::LastWriteWins)
                .await
                .unwrap(),
            ApplyOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_delete_then_higher_versioned_insert_resurrects() {
        let applier = MemoryChangeApplier::new();
        applier
            .set_row("users", "3", json!({"id": 3, "version": 2}))
            .await;

        let delete = ChangeEvent::delete(source("beta"), "users", json!({"id": 3, "version": 2}));
        applier
            .apply(&delete, ConflictPolicy::LastWriteWins)
            .await
            .unwrap();

        let insert = ChangeEvent::insert(
            source("beta"),
            "users",
            json!({"id": 3, "name": "back", "version": 3}),
        );
        assert_eq!(
            applier
                .apply(&insert, ConflictPolicy::LastWriteWins)
                .await
                .unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(applier.row("users", "3").await.unwrap()["name"], "back");
    }

    #[tokio::test]
    async fn test_event_without_pk_is_poison() {
        let applier = MemoryChangeApplier::new();
        let event = ChangeEvent::insert(source("alpha"), "audit", json!({"payload": "x"}));
        let err = applier
            .apply(&event, ConflictPolicy::LastWriteWins)
            .await
            .unwrap_err();
        assert!(err.is_poison());
    }
}
