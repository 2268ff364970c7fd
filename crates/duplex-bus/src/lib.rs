//! # duplex-bus - Bus interface for duplex replication
//!
//! The message bus is an external system; this crate is the surface the
//! pipeline consumes from it:
//!
//! - [`BusProducer`] / [`BusConsumer`] - the produce / poll / commit seam
//! - [`GatewayProducer`] / [`GatewayConsumer`] - framed TCP client to the
//!   bus gateway (length-prefixed JSON, bounded frames, reconnect backoff)
//! - [`MemoryBus`] - in-process topic-partitioned bus for tests and
//!   loopback deployments
//!
//! Delivery is at-least-once: producers treat any error as "unknown
//! outcome" and replay, consumers acknowledge only after their local
//! transaction commits.

pub mod client;
pub mod memory;
pub mod message;
pub mod traits;
pub mod wire;

pub use client::{GatewayConsumer, GatewayProducer};
pub use memory::{MemoryBus, MemoryBusConsumer};
pub use message::BusRecord;
pub use traits::{BusConsumer, BusProducer};
