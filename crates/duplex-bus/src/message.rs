//! Bus record representation

use serde::{Deserialize, Serialize};

/// One record fetched from the bus.
///
/// `(topic, partition, offset)` identifies the record for commit; records
/// within a partition are delivered in offset order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusRecord {
    /// Topic the record was fetched from
    pub topic: String,
    /// Partition within the topic
    pub partition: u32,
    /// Offset within the partition
    pub offset: u64,
    /// Partition key the producer supplied
    pub key: Option<String>,
    /// Record value; change events are UTF-8 JSON documents
    pub payload: String,
}

impl BusRecord {
    /// Payload bytes for parsers.
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }
}
