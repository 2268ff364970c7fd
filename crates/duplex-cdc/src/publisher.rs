//! Outbox drainer
//!
//! Periodically leases a batch of unpublished outbox rows, turns each
//! into a change event keyed by the row's primary key, publishes them
//! synchronously and marks the batch published in the same database
//! transaction that held the lease. Any failure aborts the whole batch;
//! the rows stay unpublished and the next tick retries them, which is
//! where the wire's at-least-once guarantee comes from.

use crate::outbox::{OutboxEntry, OutboxStore};
use duplex_bus::BusProducer;
use duplex_core::{ChangeEvent, Operation, PublisherConfig, Result, SourceInfo};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Publisher pacing and identity.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// This contour's identity, stamped as the event source
    pub contour: String,
    /// Database name, stamped as the event source
    pub database: String,
    /// Tick interval between drains
    pub poll_interval: Duration,
    /// Maximum rows per drain; bounds worst-case replay after a crash
    pub batch_size: usize,
}

impl PublisherSettings {
    pub fn from_config(cfg: &PublisherConfig) -> Self {
        Self {
            contour: cfg.service.contour.clone(),
            database: cfg.database.database.clone(),
            poll_interval: cfg.service.poll_interval(),
            batch_size: cfg.service.batch_size,
        }
    }
}

/// Publisher counters.
#[derive(Debug, Default)]
pub struct PublisherStats {
    processed: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the publisher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherStatsSnapshot {
    /// Outbox rows published and marked
    pub processed: u64,
    /// Failed drain iterations
    pub failed: u64,
    /// Committed batches
    pub batches: u64,
}

/// Drains the outbox onto the bus.
pub struct Publisher {
    store: Arc<dyn OutboxStore>,
    producer: Arc<dyn BusProducer>,
    settings: PublisherSettings,
    stats: PublisherStats,
    running: AtomicBool,
    shutdown: Notify,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        producer: Arc<dyn BusProducer>,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            store,
            producer,
            settings,
            stats: PublisherStats::default(),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Run the drain loop until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            contour = %self.settings.contour,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            "publisher started"
        );

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {
                    match self.drain_once().await {
                        Ok(0) => {}
                        Ok(published) => {
                            debug!(published, "batch published");
                        }
                        Err(e) => {
                            error!(error = %e, "drain failed; batch released for retry");
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        // Push out anything the transport buffered before reporting done.
        self.producer.flush().await.ok();
        self.running.store(false, Ordering::SeqCst);
        info!("publisher stopped");
        Ok(())
    }

    /// Signal the drain loop to exit after the current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// One drain iteration. Returns the number of rows published.
    pub async fn drain_once(&self) -> Result<usize> {
        let started = Instant::now();
        let batch = self.store.begin_drain(self.settings.batch_size).await?;
        let entries = batch.entries().to_vec();
        if entries.is_empty() {
            batch.abort().await?;
            return Ok(0);
        }

        match self.publish_entries(&entries).await {
            Ok(()) => {
                batch.commit().await?;
                let count = entries.len();
                self.stats
                    .processed
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.stats.batches.fetch_add(1, Ordering::Relaxed);
                debug!(
                    count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "outbox batch committed"
                );
                Ok(count)
            }
            Err(e) => {
                if let Err(abort_err) = batch.abort().await {
                    error!(error = %abort_err, "failed to release outbox lease");
                }
                Err(e)
            }
        }
    }

    async fn publish_entries(&self, entries: &[OutboxEntry]) -> Result<()> {
        for entry in entries {
            let event = self.build_event(entry);
            let key = entry
                .primary_key_value
                .clone()
                .unwrap_or_else(|| event.partition_key());
            let payload = serde_json::to_string(&event)?;
            self.producer
                .produce(&event.topic(), &key, &payload)
                .await?;
            debug!(
                event_id = %event.event_id,
                outbox_id = entry.id,
                table = %entry.table,
                operation = %entry.operation,
                "event published"
            );
        }
        Ok(())
    }

    /// Turn one outbox row into a wire event with a fresh event id.
    fn build_event(&self, entry: &OutboxEntry) -> ChangeEvent {
        let source = SourceInfo {
            contour: self.settings.contour.clone(),
            database: self.settings.database.clone(),
        };
        match entry.operation {
            Operation::Insert => {
                ChangeEvent::insert(source, entry.table.clone(), entry.payload.clone())
            }
            Operation::Delete => {
                ChangeEvent::delete(source, entry.table.clone(), entry.payload.clone())
            }
            Operation::Update => {
                let (before, after) = split_update_images(&entry.payload);
                ChangeEvent::update(source, entry.table.clone(), before, after)
            }
        }
    }

    /// Publisher counters.
    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Split an UPDATE outbox payload into its row images. Payloads captured
/// before both images were recorded are treated as a bare post-image.
fn split_update_images(payload: &Value) -> (Option<Value>, Value) {
    match payload.get("after") {
        Some(after) => {
            let before = payload
                .get("before")
                .filter(|b| !b.is_null())
                .cloned();
            (before, after.clone())
        }
        None => (None, payload.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::MemoryOutboxStore;
    use async_trait::async_trait;
    use duplex_bus::MemoryBus;
    use duplex_core::ReplicationError;
    use serde_json::json;

    fn settings() -> PublisherSettings {
        PublisherSettings {
            contour: "alpha".to_string(),
            database: "appdb".to_string(),
            poll_interval: Duration::from_millis(10),
            batch_size: 100,
        }
    }

    struct FailingProducer;

    #[async_trait]
    impl BusProducer for FailingProducer {
        async fn produce(&self, _topic: &str, _key: &str, _payload: &str) -> Result<()> {
            Err(ReplicationError::bus("gateway down"))
        }
    }

    #[tokio::test]
    async fn test_drain_publishes_keyed_events() {
        let store = MemoryOutboxStore::new();
        let bus = MemoryBus::new(4);
        store
            .enqueue(
                "users",
                Operation::Insert,
                json!({"id": 1, "name": "John", "version": 1}),
                Some("1".to_string()),
            )
            .await;

        let publisher = Publisher::new(Arc::new(store.clone()), bus.clone(), settings());
        assert_eq!(publisher.drain_once().await.unwrap(), 1);
        assert_eq!(store.unpublished_count().await, 0);

        let consumer = bus.consumer("g", vec!["users_changes".to_string()]);
        let record = duplex_bus::BusConsumer::poll(&consumer, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.key.as_deref(), Some("1"));

        let event = ChangeEvent::from_json(record.payload_bytes()).unwrap();
        assert_eq!(event.source.contour, "alpha");
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.after.as_ref().unwrap()["name"], "John");
        assert!(event.before.is_none());
    }

    #[tokio::test]
    async fn test_update_payload_splits_into_images() {
        let store = MemoryOutboxStore::new();
        let bus = MemoryBus::new(1);
        store
            .enqueue(
                "users",
                Operation::Update,
                json!({
                    "before": {"id": 1, "name": "John", "version": 1},
                    "after": {"id": 1, "name": "Alice", "version": 2}
                }),
                Some("1".to_string()),
            )
            .await;

        let publisher = Publisher::new(Arc::new(store), bus.clone(), settings());
        publisher.drain_once().await.unwrap();

        let consumer = bus.consumer("g", vec!["users_changes".to_string()]);
        let record = duplex_bus::BusConsumer::poll(&consumer, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let event = ChangeEvent::from_json(record.payload_bytes()).unwrap();
        assert_eq!(event.before.as_ref().unwrap()["name"], "John");
        assert_eq!(event.after.as_ref().unwrap()["name"], "Alice");
        assert_eq!(event.version(), 2);
    }

    #[tokio::test]
    async fn test_empty_outbox_drains_nothing() {
        let store = MemoryOutboxStore::new();
        let bus = MemoryBus::new(1);
        let publisher = Publisher::new(Arc::new(store), bus, settings());
        assert_eq!(publisher.drain_once().await.unwrap(), 0);
        assert_eq!(publisher.stats().batches, 0);
    }

    #[tokio::test]
    async fn test_produce_failure_releases_the_batch() {
        let store = MemoryOutboxStore::new();
        store
            .enqueue(
                "users",
                Operation::Insert,
                json!({"id": 1, "version": 1}),
                Some("1".to_string()),
            )
            .await;

        let publisher = Publisher::new(
            Arc::new(store.clone()),
            Arc::new(FailingProducer),
            settings(),
        );
        assert!(publisher.drain_once().await.is_err());

        // Lease released, row still unpublished: the next drain retries it
        assert_eq!(store.unpublished_count().await, 1);
        let batch = store.begin_drain(10).await.unwrap();
        assert_eq!(batch.entries().len(), 1);
        batch.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_size_bounds_drain() {
        let store = MemoryOutboxStore::new();
        let bus = MemoryBus::new(1);
        for i in 0..5 {
            store
                .enqueue(
                    "users",
                    Operation::Insert,
                    json!({"id": i, "version": 1}),
                    Some(i.to_string()),
                )
                .await;
        }

        let mut cfg = settings();
        cfg.batch_size = 2;
        let publisher = Publisher::new(Arc::new(store.clone()), bus, cfg);
        assert_eq!(publisher.drain_once().await.unwrap(), 2);
        assert_eq!(store.unpublished_count().await, 3);
        assert_eq!(publisher.stats().processed, 2);
    }

    #[tokio::test]
    async fn test_start_stop_loop() {
        let store = MemoryOutboxStore::new();
        let bus = MemoryBus::new(1);
        store
            .enqueue(
                "users",
                Operation::Insert,
                json!({"id": 1, "version": 1}),
                Some("1".to_string()),
            )
            .await;

        let publisher = Arc::new(Publisher::new(
            Arc::new(store.clone()),
            bus.clone(),
            settings(),
        ));
        let handle = {
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move { publisher.start().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        publisher.stop();
        handle.await.unwrap().unwrap();

        assert_eq!(store.unpublished_count().await, 0);
        assert_eq!(bus.topic_len("users_changes").await, 1);
        assert_eq!(publisher.stats().processed, 1);
    }
}
