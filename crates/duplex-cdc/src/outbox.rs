//! Outbox seam
//!
//! The capture triggers append one row per local DML to the outbox; the
//! Publisher drains it in id order under a row lease. The lease lives in
//! a database transaction, so the trait hands out an [`OutboxBatch`]
//! whose `commit`/`abort` decide the fate of the whole batch: commit
//! marks every leased row published, abort releases the lease untouched
//! and the next drain picks the same rows up again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duplex_core::{Operation, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One captured change awaiting publication.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Monotonic outbox id; drain order
    pub id: i64,
    /// Replicated table name
    pub table: String,
    /// Captured operation
    pub operation: Operation,
    /// Row payload: post-image (INSERT), pre-image (DELETE) or
    /// `{"before", "after"}` (UPDATE)
    pub payload: Value,
    /// Text form of the primary key, captured at trigger time
    pub primary_key_value: Option<String>,
    /// Capture time
    pub created_at: DateTime<Utc>,
}

/// Durable queue of captured changes.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Lease up to `limit` unpublished rows in ascending id order.
    ///
    /// Rows leased by a concurrent drain are skipped, which is what lets
    /// multiple Publisher instances share one outbox without
    /// coordination.
    async fn begin_drain(&self, limit: usize) -> Result<Box<dyn OutboxBatch>>;
}

/// A leased batch of outbox rows.
#[async_trait]
pub trait OutboxBatch: Send {
    /// Leased rows, ascending id.
    fn entries(&self) -> &[OutboxEntry];

    /// Mark every leased row published and release the lease.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Release the lease without marking anything published.
    async fn abort(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone)]
struct MemoryOutboxRow {
    entry: OutboxEntry,
    published: bool,
    leased: bool,
}

#[derive(Default)]
struct MemoryOutboxState {
    next_id: i64,
    rows: BTreeMap<i64, MemoryOutboxRow>,
}

/// In-memory outbox with lease semantics, for tests and loopback runs.
#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    state: Arc<Mutex<MemoryOutboxState>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one captured change, as the after-trigger would.
    pub async fn enqueue(
        &self,
        table: impl Into<String>,
        operation: Operation,
        payload: Value,
        primary_key_value: Option<String>,
    ) -> i64 {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.rows.insert(
            id,
            MemoryOutboxRow {
                entry: OutboxEntry {
                    id,
                    table: table.into(),
                    operation,
                    payload,
                    primary_key_value,
                    created_at: Utc::now(),
                },
                published: false,
                leased: false,
            },
        );
        id
    }

    /// Count of rows not yet published.
    pub async fn unpublished_count(&self) -> usize {
        let state = self.state.lock().await;
        state.rows.values().filter(|r| !r.published).count()
    }

    /// Count of published rows still awaiting the janitor.
    pub async fn published_count(&self) -> usize {
        let state = self.state.lock().await;
        state.rows.values().filter(|r| r.published).count()
    }

    /// Whether any row references the given primary key, published or not.
    pub async fn contains_pk(&self, table: &str, key: &str) -> bool {
        let state = self.state.lock().await;
        state.rows.values().any(|r| {
            r.entry.table == table
                && (r.entry.primary_key_value.as_deref() == Some(key)
                    || image_id(&r.entry.payload).as_deref() == Some(key))
        })
    }

    /// Janitor: drop published rows older than the retention window.
    pub async fn cleanup(&self, retention: Duration) -> usize {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let before = state.rows.len();
        state
            .rows
            .retain(|_, r| !(r.published && r.entry.created_at < cutoff));
        before - state.rows.len()
    }
}

fn image_id(payload: &Value) -> Option<String> {
    payload
        .get("id")
        .or_else(|| payload.get("after").and_then(|a| a.get("id")))
        .or_else(|| payload.get("before").and_then(|b| b.get("id")))
        .map(duplex_core::value_to_key)
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn begin_drain(&self, limit: usize) -> Result<Box<dyn OutboxBatch>> {
        let mut state = self.state.lock().await;
        let mut entries = Vec::new();
        let mut leased_ids = Vec::new();
        for row in state.rows.values_mut() {
            if entries.len() >= limit {
                break;
            }
            if row.published || row.leased {
                continue;
            }
            row.leased = true;
            leased_ids.push(row.entry.id);
            entries.push(row.entry.clone());
        }
        Ok(Box::new(MemoryOutboxBatch {
            state: Arc::clone(&self.state),
            ids: leased_ids,
            entries,
        }))
    }
}

struct MemoryOutboxBatch {
    state: Arc<Mutex<MemoryOutboxState>>,
    ids: Vec<i64>,
    entries: Vec<OutboxEntry>,
}

#[async_trait]
impl OutboxBatch for MemoryOutboxBatch {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        for id in &self.ids {
            if let Some(row) = state.rows.get_mut(id) {
                row.published = true;
                row.leased = false;
            }
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        for id in &self.ids {
            if let Some(row) = state.rows.get_mut(id) {
                row.leased = false;
            }
        }
        Ok(())
    }
}
