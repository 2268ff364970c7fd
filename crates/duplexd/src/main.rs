//! duplexd - bidirectional cross-contour replication daemon
//!
//! Usage:
//!   # Drain the local outbox onto the bus
//!   duplexd publisher --config config.publisher.yaml
//!
//!   # Apply remote-origin events to the local database
//!   duplexd consumer --config config.consumer.yaml
//!
//!   # Install the capture schema
//!   duplexd migrate --config config.publisher.yaml
//!
//!   # Retention cleanup (cron)
//!   duplexd cleanup --config config.publisher.yaml --retention-days 14
//!
//! SIGINT/SIGTERM trigger a graceful shutdown: the in-flight batch or
//! message finishes within the configured grace period, counters are
//! logged, uncommitted work rolls back.

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{CleanupTarget, Cli, Command};
use duplex_bus::{GatewayConsumer, GatewayProducer};
use duplex_cdc::postgres::{self, maintenance, schema};
use duplex_cdc::{
    Consumer, ConsumerSettings, PgChangeApplier, PgOutboxStore, Publisher, PublisherSettings,
};
use duplex_core::{ConsumerConfig, DatabaseConfig, LogFormat, LoggingConfig, PublisherConfig};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Database and logging sections shared by every config document; the
/// maintenance subcommands accept either process config.
#[derive(Debug, Deserialize)]
struct MaintenanceConfig {
    database: DatabaseConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Publisher { config } => run_publisher(&config).await,
        Command::Consumer { config } => run_consumer(&config).await,
        Command::Migrate { config } => run_migrate(&config).await,
        Command::Cleanup {
            config,
            retention_days,
            target,
        } => run_cleanup(&config, retention_days, target).await,
    }
}

async fn run_publisher(config_path: &Path) -> anyhow::Result<()> {
    let cfg = PublisherConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    init_tracing(&cfg.logging);
    info!(
        service = %cfg.service.name,
        contour = %cfg.service.contour,
        "starting publisher"
    );

    let pool = postgres::connect(&cfg.database)?;
    let store = Arc::new(PgOutboxStore::new(pool));
    let producer = Arc::new(GatewayProducer::new(
        cfg.bus.brokers.clone(),
        cfg.bus.produce_timeout(),
    ));
    let publisher = Arc::new(Publisher::new(
        store,
        producer,
        PublisherSettings::from_config(&cfg),
    ));

    let loop_handle = {
        let publisher = Arc::clone(&publisher);
        tokio::spawn(async move { publisher.start().await })
    };

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received");
    publisher.stop();
    join_within(loop_handle, cfg.service.shutdown_grace()).await;

    let stats = publisher.stats();
    info!(
        processed = stats.processed,
        failed = stats.failed,
        batches = stats.batches,
        "publisher stopped"
    );
    Ok(())
}

async fn run_consumer(config_path: &Path) -> anyhow::Result<()> {
    let cfg = ConsumerConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    init_tracing(&cfg.logging);
    info!(
        service = %cfg.service.name,
        contour = %cfg.service.contour,
        session_identity = %cfg.session_identity(),
        "starting consumer"
    );

    // The pool carries the suppression identity in its startup packet;
    // every session the applier uses is invisible to the capture
    // triggers.
    let pool = postgres::connect(&cfg.database)?;
    let applier = Arc::new(PgChangeApplier::new(pool));
    let group = cfg.bus.consumer_group.clone().unwrap_or_default();
    let bus = Arc::new(GatewayConsumer::new(
        cfg.bus.brokers.clone(),
        group,
        cfg.bus.topics.clone(),
    ));
    let consumer = Arc::new(Consumer::new(
        bus,
        applier,
        ConsumerSettings::from_config(&cfg),
    ));

    let loop_handle = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.start().await })
    };

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received");
    consumer.stop();
    join_within(loop_handle, cfg.service.shutdown_grace()).await;

    let stats = consumer.stats();
    info!(
        processed = stats.processed,
        skipped = stats.skipped,
        failed = stats.failed,
        "consumer stopped"
    );
    Ok(())
}

async fn run_migrate(config_path: &Path) -> anyhow::Result<()> {
    let cfg = load_maintenance_config(config_path)?;
    init_tracing(&cfg.logging);

    let pool = postgres::connect(&cfg.database)?;
    schema::install(&pool).await?;
    info!("capture schema installed; enable tables with duplex_enable_replication(...)");
    Ok(())
}

async fn run_cleanup(
    config_path: &Path,
    retention_days: i32,
    target: CleanupTarget,
) -> anyhow::Result<()> {
    let cfg = load_maintenance_config(config_path)?;
    init_tracing(&cfg.logging);

    let pool = postgres::connect(&cfg.database)?;
    if matches!(target, CleanupTarget::Outbox | CleanupTarget::All) {
        maintenance::cleanup_outbox(&pool, retention_days).await?;
    }
    if matches!(target, CleanupTarget::Ledger | CleanupTarget::All) {
        maintenance::cleanup_ledger(&pool, retention_days).await?;
    }
    Ok(())
}

fn load_maintenance_config(path: &Path) -> anyhow::Result<MaintenanceConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let cfg = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(cfg)
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    match cfg.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Wait for a component loop to finish, bounded by the grace period.
async fn join_within<T>(handle: tokio::task::JoinHandle<T>, grace: Duration)
where
    T: Send + 'static,
{
    if tokio::time::timeout(grace, drive(handle)).await.is_err() {
        warn!(grace_ms = grace.as_millis() as u64, "grace period elapsed; detaching");
    }
}

async fn drive<T>(handle: tokio::task::JoinHandle<T>) {
    let _ = handle.await;
}
