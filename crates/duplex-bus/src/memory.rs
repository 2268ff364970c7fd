//! In-process bus
//!
//! A topic-partitioned broker living inside the process: key-hashed
//! partitions, per-group committed offsets, offset-ordered delivery.
//! Backs the integration tests and single-process loopback deployments.
//! Uncommitted records are redelivered to any fresh consumer handle of
//! the same group, which is how tests model redelivery after a crash.

use crate::message::BusRecord;
use crate::traits::{BusConsumer, BusProducer};
use async_trait::async_trait;
use duplex_core::Result;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: String,
}

#[derive(Default)]
struct BusState {
    /// topic -> partitions -> records
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// group -> (topic, partition) -> next offset to deliver after restart
    committed: HashMap<String, HashMap<(String, u32), u64>>,
}

/// In-process topic-partitioned bus.
pub struct MemoryBus {
    partitions_per_topic: u32,
    state: Mutex<BusState>,
    delivered: Notify,
}

impl MemoryBus {
    /// Create a bus with the given partition count per topic.
    pub fn new(partitions_per_topic: u32) -> Arc<Self> {
        Arc::new(Self {
            partitions_per_topic: partitions_per_topic.max(1),
            state: Mutex::new(BusState::default()),
            delivered: Notify::new(),
        })
    }

    /// Attach a consumer handle for `group` subscribed to `topics`.
    ///
    /// Delivery resumes from the group's committed offsets, so a new
    /// handle sees every record the previous one polled but never
    /// committed.
    pub fn consumer(
        self: &Arc<Self>,
        group: impl Into<String>,
        topics: Vec<String>,
    ) -> MemoryBusConsumer {
        MemoryBusConsumer {
            bus: Arc::clone(self),
            group: group.into(),
            topics,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partitions_per_topic)) as u32
    }

    /// Total record count in a topic, for test assertions.
    pub async fn topic_len(&self, topic: &str) -> usize {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|parts| parts.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BusProducer for MemoryBus {
    async fn produce(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        let partition = self.partition_for(key);
        let mut state = self.state.lock().await;
        let partitions = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions_per_topic as usize]);
        partitions[partition as usize].push(StoredRecord {
            key: Some(key.to_string()),
            payload: payload.to_string(),
        });
        drop(state);
        self.delivered.notify_waiters();
        Ok(())
    }
}

/// Consumer handle onto a [`MemoryBus`].
pub struct MemoryBusConsumer {
    bus: Arc<MemoryBus>,
    group: String,
    topics: Vec<String>,
    /// (topic, partition) -> next offset this handle will deliver
    cursors: Mutex<HashMap<(String, u32), u64>>,
}

impl MemoryBusConsumer {
    async fn try_fetch(&self) -> Option<BusRecord> {
        let state = self.bus.state.lock().await;
        let mut cursors = self.cursors.lock().await;

        for topic in &self.topics {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (partition, records) in partitions.iter().enumerate() {
                let partition = partition as u32;
                let slot = (topic.clone(), partition);
                let cursor = cursors.entry(slot.clone()).or_insert_with(|| {
                    state
                        .committed
                        .get(&self.group)
                        .and_then(|offsets| offsets.get(&slot))
                        .copied()
                        .unwrap_or(0)
                });
                if let Some(record) = records.get(*cursor as usize) {
                    let fetched = BusRecord {
                        topic: topic.clone(),
                        partition,
                        offset: *cursor,
                        key: record.key.clone(),
                        payload: record.payload.clone(),
                    };
                    *cursor += 1;
                    return Some(fetched);
                }
            }
        }
        None
    }
}

#[async_trait]
impl BusConsumer for MemoryBusConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<BusRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(record) = self.try_fetch().await {
                return Ok(Some(record));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => return Ok(None),
                _ = self.bus.delivered.notified() => {}
            }
        }
    }

    async fn commit(&self, record: &BusRecord) -> Result<()> {
        let mut state = self.bus.state.lock().await;
        let offsets = state.committed.entry(self.group.clone()).or_default();
        let slot = (record.topic.clone(), record.partition);
        let next = record.offset + 1;
        let entry = offsets.entry(slot).or_insert(0);
        if next > *entry {
            *entry = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_produce_and_poll() {
        let bus = MemoryBus::new(4);
        bus.produce("users_changes", "1", "{\"a\":1}").await.unwrap();

        let consumer = bus.consumer("g", vec!["users_changes".to_string()]);
        let record = consumer
            .poll(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.topic, "users_changes");
        assert_eq!(record.key.as_deref(), Some("1"));
        assert_eq!(record.payload, "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_poll_timeout_on_empty_topic() {
        let bus = MemoryBus::new(1);
        let consumer = bus.consumer("g", vec!["empty_changes".to_string()]);
        let polled = consumer.poll(Duration::from_millis(20)).await.unwrap();
        assert!(polled.is_none());
    }

    #[tokio::test]
    async fn test_same_key_lands_in_one_partition_in_order() {
        let bus = MemoryBus::new(8);
        for i in 0..5 {
            bus.produce("t_changes", "9", &format!("{{\"v\":{i}}}"))
                .await
                .unwrap();
        }

        let consumer = bus.consumer("g", vec!["t_changes".to_string()]);
        let mut partitions = Vec::new();
        for i in 0..5 {
            let record = consumer
                .poll(Duration::from_millis(50))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.payload, format!("{{\"v\":{i}}}"));
            partitions.push(record.partition);
        }
        assert!(partitions.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_uncommitted_records_redeliver_to_fresh_handle() {
        let bus = MemoryBus::new(1);
        bus.produce("t_changes", "1", "first").await.unwrap();
        bus.produce("t_changes", "1", "second").await.unwrap();

        let consumer = bus.consumer("g", vec!["t_changes".to_string()]);
        let first = consumer
            .poll(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        consumer.commit(&first).await.unwrap();
        // Second record polled but never committed
        let second = consumer
            .poll(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.payload, "second");

        // A fresh handle (restart) resumes from the committed offset
        let restarted = bus.consumer("g", vec!["t_changes".to_string()]);
        let redelivered = restarted
            .poll(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.payload, "second");
        assert_eq!(redelivered.offset, second.offset);
    }

    #[tokio::test]
    async fn test_groups_track_offsets_independently() {
        let bus = MemoryBus::new(1);
        bus.produce("t_changes", "1", "only").await.unwrap();

        let alpha = bus.consumer("alpha", vec!["t_changes".to_string()]);
        let record = alpha.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        alpha.commit(&record).await.unwrap();

        let beta = bus.consumer("beta", vec!["t_changes".to_string()]);
        let seen = beta.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(seen.payload, "only");
    }

    #[tokio::test]
    async fn test_topic_len() {
        let bus = MemoryBus::new(2);
        assert_eq!(bus.topic_len("t_changes").await, 0);
        bus.produce("t_changes", "a", "x").await.unwrap();
        bus.produce("t_changes", "b", "y").await.unwrap();
        assert_eq!(bus.topic_len("t_changes").await, 2);
    }
}
