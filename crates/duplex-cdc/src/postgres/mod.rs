//! PostgreSQL backends
//!
//! Production implementations of the outbox and applier seams, pool
//! construction with the session-identity discipline, the embedded
//! capture schema and the janitor routines.
//!
//! Transactions are driven with explicit `BEGIN`/`COMMIT`/`ROLLBACK`
//! statements on pooled clients; pool recycling cleans up any
//! transaction a crashed holder left behind.

pub mod apply;
pub mod maintenance;
pub mod outbox;
pub mod schema;
mod sql;

pub use apply::PgChangeApplier;
pub use outbox::PgOutboxStore;

use deadpool_postgres::{Config as PoolSetup, ManagerConfig, Pool, RecyclingMethod, Runtime};
use duplex_core::{DatabaseConfig, ReplicationError, Result};
use tokio_postgres::NoTls;
use tracing::info;

/// Build a connection pool from the database section of a config
/// document.
///
/// `application_name` is part of the connection startup, so every session
/// of the pool carries the identity the capture triggers test against.
/// The Consumer must pass its suppression identity here; the Publisher
/// must not.
pub fn connect(cfg: &DatabaseConfig) -> Result<Pool> {
    let mut setup = PoolSetup::new();
    setup.host = Some(cfg.host.clone());
    setup.port = Some(cfg.port);
    setup.dbname = Some(cfg.database.clone());
    setup.user = Some(cfg.user.clone());
    setup.password = Some(cfg.password.clone());
    setup.application_name = cfg.application_name.clone();
    setup.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Clean,
    });
    setup.pool = Some(deadpool_postgres::PoolConfig::new(cfg.pool_size));

    let pool = setup
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| ReplicationError::pool(e.to_string()))?;

    info!(
        host = %cfg.host,
        port = cfg.port,
        database = %cfg.database,
        application_name = cfg.application_name.as_deref().unwrap_or(""),
        "database pool configured"
    );
    Ok(pool)
}

/// Check out a client, mapping pool exhaustion to a retriable error.
pub(crate) async fn client(pool: &Pool) -> Result<deadpool_postgres::Object> {
    pool.get()
        .await
        .map_err(|e| ReplicationError::pool(e.to_string()))
}
