//! # duplex-core - Shared model for duplex replication
//!
//! Core types for bidirectional, asynchronous row-level replication
//! between two isolated deployments ("contours") connected only by a
//! georeplicated message bus:
//!
//! - [`ChangeEvent`] - the self-describing change document on the wire
//! - [`ConflictPolicy`] - last-write-wins / skip / error resolution
//! - [`PublisherConfig`] / [`ConsumerConfig`] - process configuration
//! - [`ReplicationError`] - shared error type with retriability and
//!   poison classification
//!
//! The pipeline crates (`duplex-bus`, `duplex-cdc`) build on these types;
//! nothing in this crate talks to a database or a bus.

pub mod config;
pub mod error;
pub mod event;
pub mod policy;

pub use config::{
    BusConfig, ConsumerConfig, DatabaseConfig, LogFormat, LoggingConfig, ProcessingConfig,
    PublisherConfig, ServiceConfig,
};
pub use error::{ErrorCategory, ReplicationError, Result};
pub use event::{value_to_key, ChangeEvent, Operation, SourceInfo};
pub use policy::{ConflictDecision, ConflictPolicy};
