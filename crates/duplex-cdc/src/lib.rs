//! # duplex-cdc - Change-data pipeline for duplex replication
//!
//! The three pieces that jointly give at-least-once delivery with
//! exactly-once effect and per-key ordering between two contours:
//!
//! - **Capture** lives in the database: trigger-driven outbox, version
//!   stamping, loop suppression via the consumer session identity. The
//!   SQL ships embedded in [`postgres::schema`].
//! - **[`Publisher`]** drains the outbox in id order under a skip-locked
//!   lease and publishes one keyed event per row, transactionally with
//!   the outbox.
//! - **[`Consumer`]** applies remote-origin events idempotently: ledger
//!   dedup, version-based conflict resolution, deferred foreign keys,
//!   acknowledge only after commit.
//!
//! ```text
//! local writer → triggers → replication_queue → Publisher → <table>_changes
//!                                                              ↓ (other contour)
//!                                       Consumer → dedup → version check → apply
//!                                       (session identity suppresses re-capture)
//! ```
//!
//! The database seams ([`OutboxStore`], [`ChangeApplier`]) have
//! PostgreSQL backends under [`postgres`] and in-memory twins used by the
//! integration tests to run both contours inside one process.

pub mod apply;
pub mod consumer;
pub mod outbox;
pub mod postgres;
pub mod publisher;

pub use apply::{ApplyOutcome, ChangeApplier, MemoryChangeApplier};
pub use consumer::{Consumer, ConsumerSettings, ConsumerStatsSnapshot};
pub use outbox::{MemoryOutboxStore, OutboxBatch, OutboxEntry, OutboxStore};
pub use postgres::{PgChangeApplier, PgOutboxStore};
pub use publisher::{Publisher, PublisherSettings, PublisherStatsSnapshot};
