//! Bus producer/consumer seams
//!
//! The bus itself is an external system; these traits are the exact
//! surface the pipeline consumes from it. Production deployments bind
//! them to the gateway client, tests and loopback deployments to
//! [`MemoryBus`](crate::memory::MemoryBus).

use crate::message::BusRecord;
use async_trait::async_trait;
use duplex_core::Result;
use std::time::Duration;

/// Publishes records onto topic-partitioned queues.
#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Publish one record, keyed so all records for a row land in the
    /// same partition. Returns only once the bus has durably accepted
    /// the record; an error means the record may or may not have been
    /// accepted and the caller must treat the batch as failed.
    async fn produce(&self, topic: &str, key: &str, payload: &str) -> Result<()>;

    /// Drain any buffered records. Called during graceful shutdown.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Consumes records from subscribed topics, at-least-once.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Fetch the next record, waiting up to `timeout`. `None` means the
    /// wait elapsed with nothing to deliver.
    async fn poll(&self, timeout: Duration) -> Result<Option<BusRecord>>;

    /// Acknowledge a record. Unacknowledged records are redelivered to
    /// the group after a restart.
    async fn commit(&self, record: &BusRecord) -> Result<()>;
}
