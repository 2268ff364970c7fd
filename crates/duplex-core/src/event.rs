//! Change-event document
//!
//! The self-describing record published on the bus for every captured row
//! mutation. The wire encoding is JSON with a fixed key set:
//! `event_id`, `timestamp`, `source{contour,database}`, `table`,
//! `operation`, `primary_key`, and per-operation `before`/`after` images
//! (INSERT carries `after`, DELETE carries `before`, UPDATE carries both).

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Row mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(ReplicationError::UnknownOperation(other.to_string())),
        }
    }
}

/// Origin descriptor carried on every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Contour (deployment) that produced the change
    pub contour: String,
    /// Database name on that contour
    pub database: String,
}

/// One published change-data record describing a single row mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Universally unique event id, the idempotence key on the consuming side
    pub event_id: Uuid,
    /// Producer wall-clock; informational, never used for conflict resolution
    pub timestamp: DateTime<Utc>,
    /// Origin contour and database
    pub source: SourceInfo,
    /// Replicated table name
    pub table: String,
    /// Mutation kind
    pub operation: Operation,
    /// Primary key as a named column map
    pub primary_key: Map<String, Value>,
    /// Pre-image (UPDATE, DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    /// Post-image (INSERT, UPDATE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl ChangeEvent {
    fn envelope(
        source: SourceInfo,
        table: impl Into<String>,
        operation: Operation,
        primary_key: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            table: table.into(),
            operation,
            primary_key,
            before: None,
            after: None,
        }
    }

    /// Create a new INSERT event.
    pub fn insert(source: SourceInfo, table: impl Into<String>, after: Value) -> Self {
        let mut event = Self::envelope(source, table, Operation::Insert, pk_map(&after));
        event.after = Some(after);
        event
    }

    /// Create a new UPDATE event.
    pub fn update(
        source: SourceInfo,
        table: impl Into<String>,
        before: Option<Value>,
        after: Value,
    ) -> Self {
        let mut event = Self::envelope(source, table, Operation::Update, pk_map(&after));
        event.before = before;
        event.after = Some(after);
        event
    }

    /// Create a new DELETE event.
    pub fn delete(source: SourceInfo, table: impl Into<String>, before: Value) -> Self {
        let mut event = Self::envelope(source, table, Operation::Delete, pk_map(&before));
        event.before = Some(before);
        event
    }

    /// Parse an event from its wire encoding.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        let event: ChangeEvent = serde_json::from_slice(payload)?;
        event.check_shape()?;
        Ok(event)
    }

    /// Serialize to the wire encoding.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Enforce the per-operation image contract.
    pub fn check_shape(&self) -> Result<()> {
        match self.operation {
            Operation::Insert if self.after.is_none() => Err(ReplicationError::invalid_event(
                "INSERT event without an after image",
            )),
            Operation::Update if self.after.is_none() => Err(ReplicationError::invalid_event(
                "UPDATE event without an after image",
            )),
            Operation::Delete if self.before.is_none() => Err(ReplicationError::invalid_event(
                "DELETE event without a before image",
            )),
            _ => Ok(()),
        }
    }

    /// The row image the applier works from: post-image when present,
    /// pre-image for DELETE.
    pub fn image(&self) -> Option<&Value> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Primary-key value, from the key map or the row image.
    pub fn primary_key_value(&self) -> Option<&Value> {
        self.primary_key
            .get("id")
            .or_else(|| self.image().and_then(|img| img.get("id")))
    }

    /// Partition key: the string form of the primary key, falling back to
    /// the event id so keyless rows still land deterministically.
    pub fn partition_key(&self) -> String {
        self.primary_key_value()
            .map(value_to_key)
            .unwrap_or_else(|| self.event_id.to_string())
    }

    /// Row version from the image, `0` when absent.
    pub fn version(&self) -> i64 {
        self.image()
            .and_then(|img| img.get("version"))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// Topic this event is published on.
    pub fn topic(&self) -> String {
        format!("{}_changes", self.table)
    }
}

/// Project the `id` column out of a row image into a primary-key map.
fn pk_map(image: &Value) -> Map<String, Value> {
    let mut map = Map::new();
    if let Some(id) = image.get("id") {
        map.insert("id".to_string(), id.clone());
    }
    map
}

/// Canonical string form of a key value (no surrounding quotes for strings).
pub fn value_to_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
