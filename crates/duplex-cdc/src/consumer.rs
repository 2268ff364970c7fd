//! Remote-event consumer
//!
//! Polls the bus, drops own-origin events, and hands the rest to the
//! change applier. A record is acknowledged only after the local
//! transaction committed (or the event was deliberately dropped:
//! own-origin, duplicate, policy-skip, poison). Transient failures and
//! `error`-policy conflicts leave the record unacknowledged so the bus
//! redelivers it.

use crate::apply::{ApplyOutcome, ChangeApplier};
use duplex_bus::BusConsumer;
use duplex_core::{ChangeEvent, ConflictPolicy, ConsumerConfig, ReplicationError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause after a failed iteration so a dead dependency is not hammered.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Consumer identity and processing knobs.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// This contour; events originating here are dropped
    pub contour: String,
    /// Bus poll wait; short so shutdown stays responsive
    pub poll_timeout: Duration,
    /// Conflict-resolution policy
    pub policy: ConflictPolicy,
}

impl ConsumerSettings {
    pub fn from_config(cfg: &ConsumerConfig) -> Self {
        Self {
            contour: cfg.service.contour.clone(),
            poll_timeout: cfg.bus.poll_timeout(),
            policy: cfg.processing.conflict_resolution,
        }
    }
}

/// Consumer counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the consumer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    /// Events applied
    pub processed: u64,
    /// Events dropped on purpose: own-origin, duplicate, policy-skip
    pub skipped: u64,
    /// Poison payloads and failed iterations
    pub failed: u64,
}

/// Applies remote-origin events to the local database.
pub struct Consumer {
    bus: Arc<dyn BusConsumer>,
    applier: Arc<dyn ChangeApplier>,
    settings: ConsumerSettings,
    stats: ConsumerStats,
    running: AtomicBool,
}

impl Consumer {
    pub fn new(
        bus: Arc<dyn BusConsumer>,
        applier: Arc<dyn ChangeApplier>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            bus,
            applier,
            settings,
            stats: ConsumerStats::default(),
            running: AtomicBool::new(false),
        }
    }

    /// Run the consume loop until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            contour = %self.settings.contour,
            policy = %self.settings.policy,
            "consumer started"
        );

        // The poll timeout is short, so the flag is observed promptly and
        // the in-flight message always finishes before the loop exits.
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.process_one().await {
                error!(error = %e, "failed to process message");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }

        info!("consumer stopped");
        Ok(())
    }

    /// Signal the consume loop to exit after the in-flight message.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Poll one record, apply it, acknowledge it.
    ///
    /// Returns `Err` only when the record must stay unacknowledged:
    /// transient infrastructure failures and `error`-policy conflicts.
    async fn process_one(&self) -> Result<()> {
        let Some(record) = self.bus.poll(self.settings.poll_timeout).await? else {
            return Ok(());
        };

        let event = match ChangeEvent::from_json(record.payload_bytes()) {
            Ok(event) => event,
            Err(e) => {
                // Acknowledge the poison pill so it cannot stall the
                // partition; the raw payload goes to the log for triage.
                error!(error = %e, raw = %record.payload, "unparseable event acknowledged");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.bus.commit(&record).await?;
                return Ok(());
            }
        };

        if event.source.contour == self.settings.contour {
            // Defense in depth next to the in-database predicate.
            debug!(
                event_id = %event.event_id,
                source = %event.source.contour,
                "own-origin event dropped"
            );
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            self.bus.commit(&record).await?;
            return Ok(());
        }

        match self.applier.apply(&event, self.settings.policy).await {
            Ok(ApplyOutcome::Applied) => {
                self.bus.commit(&record).await?;
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                info!(
                    event_id = %event.event_id,
                    table = %event.table,
                    operation = %event.operation,
                    "event applied"
                );
                Ok(())
            }
            Ok(ApplyOutcome::Duplicate) => {
                debug!(event_id = %event.event_id, "event already processed");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                self.bus.commit(&record).await?;
                Ok(())
            }
            Ok(ApplyOutcome::Skipped) => {
                debug!(event_id = %event.event_id, "event skipped by conflict policy");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                self.bus.commit(&record).await?;
                Ok(())
            }
            Err(e) if e.is_retriable() => Err(e),
            Err(e @ ReplicationError::Conflict { .. }) => Err(e),
            Err(e) => {
                // Unresolvable without operator action (bad image,
                // integrity violation): acknowledge and count it.
                warn!(
                    error = %e,
                    event_id = %event.event_id,
                    table = %event.table,
                    "event failed and was acknowledged"
                );
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.bus.commit(&record).await?;
                Ok(())
            }
        }
    }

    /// Consumer counters.
    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::MemoryChangeApplier;
    use duplex_bus::{BusProducer, MemoryBus};
    use duplex_core::SourceInfo;
    use serde_json::json;

    fn settings(contour: &str, policy: ConflictPolicy) -> ConsumerSettings {
        ConsumerSettings {
            contour: contour.to_string(),
            poll_timeout: Duration::from_millis(20),
            policy,
        }
    }

    fn remote_event(op: &str) -> ChangeEvent {
        let source = SourceInfo {
            contour: "alpha".to_string(),
            database: "appdb".to_string(),
        };
        match op {
            "insert" => ChangeEvent::insert(
                source,
                "users",
                json!({"id": 1, "name": "John", "version": 1}),
            ),
            "delete" => ChangeEvent::delete(source, "users", json!({"id": 1, "version": 1})),
            _ => unreachable!(),
        }
    }

    async fn produce(bus: &MemoryBus, event: &ChangeEvent) {
        bus.produce(
            &event.topic(),
            &event.partition_key(),
            &serde_json::to_string(event).unwrap(),
        )
        .await
        .unwrap();
    }

    fn consumer_over(
        bus: &Arc<MemoryBus>,
        applier: &MemoryChangeApplier,
        policy: ConflictPolicy,
    ) -> Consumer {
        Consumer::new(
            Arc::new(bus.consumer("beta-group", vec!["users_changes".to_string()])),
            Arc::new(applier.clone()),
            settings("beta", policy),
        )
    }

    #[tokio::test]
    async fn test_remote_insert_is_applied_and_acked() {
        let bus = MemoryBus::new(1);
        let applier = MemoryChangeApplier::new();
        let event = remote_event("insert");
        produce(&bus, &event).await;

        let consumer = consumer_over(&bus, &applier, ConflictPolicy::LastWriteWins);
        consumer.process_one().await.unwrap();

        assert_eq!(applier.row("users", "1").await.unwrap()["name"], "John");
        assert!(applier.ledger_contains(event.event_id).await);
        let stats = consumer.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.skipped, 0);

        // Acked: a restarted handle of the same group sees nothing
        let restarted = consumer_over(&bus, &applier, ConflictPolicy::LastWriteWins);
        restarted.process_one().await.unwrap();
        assert_eq!(restarted.stats().processed, 0);
    }

    #[tokio::test]
    async fn test_own_origin_event_is_dropped() {
        let bus = MemoryBus::new(1);
        let applier = MemoryChangeApplier::new();
        let event = remote_event("insert");
        produce(&bus, &event).await;

        // Consumer on the event's own contour
        let consumer = Consumer::new(
            Arc::new(bus.consumer("alpha-group", vec!["users_changes".to_string()])),
            Arc::new(applier.clone()),
            settings("alpha", ConflictPolicy::LastWriteWins),
        );
        consumer.process_one().await.unwrap();

        assert!(applier.row("users", "1").await.is_none());
        assert_eq!(applier.ledger_len().await, 0);
        assert_eq!(consumer.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_redelivery_hits_the_ledger() {
        let bus = MemoryBus::new(1);
        let applier = MemoryChangeApplier::new();
        let event = remote_event("insert");
        // Same event delivered twice (publisher replay after a crash)
        produce(&bus, &event).await;
        produce(&bus, &event).await;

        let consumer = consumer_over(&bus, &applier, ConflictPolicy::LastWriteWins);
        consumer.process_one().await.unwrap();
        consumer.process_one().await.unwrap();

        let stats = consumer.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(applier.ledger_len().await, 1);
    }

    #[tokio::test]
    async fn test_poison_payload_is_acked_and_counted() {
        let bus = MemoryBus::new(1);
        let applier = MemoryChangeApplier::new();
        bus.produce("users_changes", "1", "{not json")
            .await
            .unwrap();

        let consumer = consumer_over(&bus, &applier, ConflictPolicy::LastWriteWins);
        consumer.process_one().await.unwrap();
        assert_eq!(consumer.stats().failed, 1);

        // The pill was acknowledged; the partition is not stalled
        let restarted = consumer_over(&bus, &applier, ConflictPolicy::LastWriteWins);
        restarted.process_one().await.unwrap();
        assert_eq!(restarted.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_poison() {
        let bus = MemoryBus::new(1);
        let applier = MemoryChangeApplier::new();
        let raw = r#"{
            "event_id": "8f5e0a9e-2f2b-4d88-9f2f-2c9f29a7a001",
            "timestamp": "2025-06-01T00:00:00Z",
            "source": {"contour": "alpha", "database": "appdb"},
            "table": "users",
            "operation": "TRUNCATE",
            "primary_key": {"id": 1},
            "after": {"id": 1}
        }"#;
        bus.produce("users_changes", "1", raw).await.unwrap();

        let consumer = consumer_over(&bus, &applier, ConflictPolicy::LastWriteWins);
        consumer.process_one().await.unwrap();
        assert_eq!(consumer.stats().failed, 1);
        assert_eq!(applier.ledger_len().await, 0);
    }

    #[tokio::test]
    async fn test_error_policy_conflict_stays_unacked() {
        let bus = MemoryBus::new(1);
        let applier = MemoryChangeApplier::new();
        applier
            .set_row("users", "1", json!({"id": 1, "name": "mine", "version": 5}))
            .await;
        let event = remote_event("insert");
        produce(&bus, &event).await;

        let consumer = consumer_over(&bus, &applier, ConflictPolicy::Error);
        let err = consumer.process_one().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Conflict { .. }));

        // No ack: a restarted handle gets the record again
        let restarted = consumer_over(&bus, &applier, ConflictPolicy::Error);
        let err = restarted.process_one().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_delete_for_absent_row_is_processed() {
        let bus = MemoryBus::new(1);
        let applier = MemoryChangeApplier::new();
        let event = remote_event("delete");
        produce(&bus, &event).await;

        let consumer = consumer_over(&bus, &applier, ConflictPolicy::LastWriteWins);
        consumer.process_one().await.unwrap();
        assert_eq!(consumer.stats().processed, 1);
    }

    #[tokio::test]
    async fn test_start_stop_loop() {
        let bus = MemoryBus::new(1);
        let applier = MemoryChangeApplier::new();
        let event = remote_event("insert");
        produce(&bus, &event).await;

        let consumer = Arc::new(consumer_over(&bus, &applier, ConflictPolicy::LastWriteWins));
        let handle = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.start().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        consumer.stop();
        handle.await.unwrap().unwrap();

        assert_eq!(consumer.stats().processed, 1);
        assert!(applier.row("users", "1").await.is_some());
    }
}
