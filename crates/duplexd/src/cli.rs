//! Command-line interface

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Bidirectional cross-contour replication daemon.
#[derive(Debug, Parser)]
#[command(name = "duplexd", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Drain the local outbox onto the bus
    Publisher {
        /// Path to the publisher configuration document
        #[arg(short, long, default_value = "config.publisher.yaml")]
        config: PathBuf,
    },
    /// Apply remote-origin events to the local database
    Consumer {
        /// Path to the consumer configuration document
        #[arg(short, long, default_value = "config.consumer.yaml")]
        config: PathBuf,
    },
    /// Install the capture schema: service tables, trigger and janitor
    /// functions
    Migrate {
        /// Any configuration document with a database section
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Reap published outbox rows and aged ledger entries
    Cleanup {
        /// Any configuration document with a database section
        #[arg(short, long)]
        config: PathBuf,
        /// Retention window in days; for the ledger it must exceed the
        /// bus message retention
        #[arg(long, default_value_t = 7)]
        retention_days: i32,
        /// Which table to clean
        #[arg(long, value_enum, default_value_t = CleanupTarget::All)]
        target: CleanupTarget,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CleanupTarget {
    Outbox,
    Ledger,
    All,
}
