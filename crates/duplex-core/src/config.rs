//! Configuration documents for the replication processes
//!
//! Both long-running processes consume a YAML document naming the contour
//! identity, database connection parameters, bus endpoints and tuning
//! knobs. Values can be overridden through environment variables for
//! containerized deployments. Fatal misconfiguration (missing consumer
//! session identity, empty topic list) refuses to start.

use crate::error::{ReplicationError, Result};
use crate::policy::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_batch_size() -> usize {
    100
}
fn default_pool_size() -> usize {
    8
}
fn default_db_port() -> u16 {
    5432
}
fn default_produce_timeout_ms() -> u64 {
    10_000
}
fn default_bus_poll_timeout_ms() -> u64 {
    1_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}
fn default_shutdown_grace_ms() -> u64 {
    2_000
}

/// Service identity and pacing.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServiceConfig {
    /// Process name, used in log context
    #[validate(length(min = 1))]
    pub name: String,
    /// This deployment's contour identity
    #[validate(length(min = 1))]
    pub contour: String,
    /// Publisher tick interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    /// Maximum outbox rows drained per batch
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 10_000))]
    pub batch_size: usize,
    /// Grace period for draining in-flight work on shutdown, milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl ServiceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// PostgreSQL connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[validate(length(min = 1))]
    pub database: String,
    #[validate(length(min = 1))]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Connection pool size
    #[serde(default = "default_pool_size")]
    #[validate(range(min = 1, max = 256))]
    pub pool_size: usize,
    /// Session identity reported as `application_name`. The capture
    /// triggers compare it against the configured consumer identity, so
    /// the Consumer MUST set it and the Publisher must not reuse it.
    #[serde(default)]
    pub application_name: Option<String>,
}

/// Bus endpoints and consumption parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BusConfig {
    /// Gateway addresses (host:port), tried round-robin
    #[validate(length(min = 1))]
    pub brokers: Vec<String>,
    /// Topics to consume (Consumer only)
    #[serde(default)]
    pub topics: Vec<String>,
    /// Consumer group for offset tracking (Consumer only)
    #[serde(default)]
    pub consumer_group: Option<String>,
    /// Bounded per-message produce timeout, milliseconds
    #[serde(default = "default_produce_timeout_ms")]
    #[validate(range(min = 100))]
    pub produce_timeout_ms: u64,
    /// Poll wait; short so shutdown stays responsive
    #[serde(default = "default_bus_poll_timeout_ms")]
    #[validate(range(min = 50, max = 60_000))]
    pub poll_timeout_ms: u64,
}

impl BusConfig {
    pub fn produce_timeout(&self) -> Duration {
        Duration::from_millis(self.produce_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Consumer-side processing knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Conflict-resolution policy
    #[serde(default)]
    pub conflict_resolution: ConflictPolicy,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logging section, consumed by the daemon's subscriber setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Configuration document for the Publisher process.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PublisherConfig {
    #[validate(nested)]
    pub service: ServiceConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub bus: BusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration document for the Consumer process.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConsumerConfig {
    #[validate(nested)]
    pub service: ServiceConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub bus: BusConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PublisherConfig {
    /// Load from a YAML file, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parse from a YAML string, apply environment overrides, validate.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut cfg: PublisherConfig = serde_yaml::from_str(raw)?;
        apply_env_overrides(&mut cfg.database, &mut cfg.bus, &mut cfg.service.contour);
        cfg.check()?;
        Ok(cfg)
    }

    fn check(&self) -> Result<()> {
        Validate::validate(self).map_err(|e| ReplicationError::config(e.to_string()))?;
        Ok(())
    }
}

impl ConsumerConfig {
    /// Load from a YAML file, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parse from a YAML string, apply environment overrides, validate.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut cfg: ConsumerConfig = serde_yaml::from_str(raw)?;
        apply_env_overrides(&mut cfg.database, &mut cfg.bus, &mut cfg.service.contour);
        if let Ok(group) = std::env::var("BUS_CONSUMER_GROUP") {
            if !group.is_empty() {
                cfg.bus.consumer_group = Some(group);
            }
        }
        cfg.check()?;
        Ok(cfg)
    }

    fn check(&self) -> Result<()> {
        Validate::validate(self).map_err(|e| ReplicationError::config(e.to_string()))?;

        // Without the session identity the Consumer's own writes re-enter
        // the outbox and the contours feed each other forever.
        match self.database.application_name.as_deref() {
            Some(name) if !name.is_empty() => {}
            _ => {
                return Err(ReplicationError::config(
                    "database.application_name is required for the consumer \
                     (loop-suppression session identity)",
                ))
            }
        }
        if self.bus.topics.is_empty() {
            return Err(ReplicationError::config("bus.topics must not be empty"));
        }
        match self.bus.consumer_group.as_deref() {
            Some(group) if !group.is_empty() => {}
            _ => return Err(ReplicationError::config("bus.consumer_group is required")),
        }
        Ok(())
    }

    /// The loop-suppression session identity.
    pub fn session_identity(&self) -> &str {
        self.database.application_name.as_deref().unwrap_or_default()
    }
}

fn apply_env_overrides(db: &mut DatabaseConfig, bus: &mut BusConfig, contour: &mut String) {
    if let Ok(val) = std::env::var("DB_HOST") {
        if !val.is_empty() {
            db.host = val;
        }
    }
    if let Ok(val) = std::env::var("DB_PORT") {
        if let Ok(port) = val.parse() {
            db.port = port;
        }
    }
    if let Ok(val) = std::env::var("DB_DATABASE") {
        if !val.is_empty() {
            db.database = val;
        }
    }
    if let Ok(val) = std::env::var("DB_USER") {
        if !val.is_empty() {
            db.user = val;
        }
    }
    if let Ok(val) = std::env::var("DB_PASSWORD") {
        if !val.is_empty() {
            db.password = val;
        }
    }
    if let Ok(val) = std::env::var("BUS_BROKERS") {
        if !val.is_empty() {
            bus.brokers = val.split(',').map(|s| s.trim().to_string()).collect();
        }
    }
    if let Ok(val) = std::env::var("CONTOUR") {
        if !val.is_empty() {
            *contour = val;
        }
    }
}
