//! PostgreSQL target driver.
//!
//! - [`PostgresWriter`]: `TargetWriter` with transactional COPY loads
//! - [`PgChunkStore`]: chunk pool in `_mysql_pg_migrate_pool`
//! - [`PgPhaseStore`]: phase flags in `_mysql_pg_migrate_state`
//!
//! All three share one deadpool-postgres pool built by [`connect_pool`].

mod pool_store;
mod state_store;
mod writer;

pub use pool_store::PgChunkStore;
pub use state_store::PgPhaseStore;
pub use writer::PostgresWriter;

use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::Config as PgConfig;
use tracing::info;

use crate::config::TargetConfig;
use crate::error::{MigrateError, Result};

/// Connection and pool wait timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the target connection pool and test one connection.
pub async fn connect_pool(config: &TargetConfig, max_conns: usize) -> Result<Pool> {
    let mut pg_config = PgConfig::new();
    pg_config.host(&config.host);
    pg_config.port(config.port);
    pg_config.dbname(&config.database);
    pg_config.user(&config.user);
    pg_config.password(&config.password);
    pg_config.application_name("mysql-pg-migrate");

    // Connection options for reliability
    pg_config.keepalives(true);
    pg_config.keepalives_idle(Duration::from_secs(30));
    pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
    let pool = Pool::builder(mgr)
        .max_size(max_conns)
        .wait_timeout(Some(POOL_CONNECTION_TIMEOUT))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?;

    // Test connection
    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::pool(e, "testing PostgreSQL target connection"))?;
    client.simple_query("SELECT 1").await?;

    info!(
        "Connected to PostgreSQL target: {}:{}/{}",
        config.host, config.port, config.database
    );
    Ok(pool)
}

/// Whether a relation exists, by its quoted qualified name.
pub(crate) async fn relation_exists(pool: &Pool, qualified: &str) -> Result<bool> {
    let client = pool.get().await?;
    let row = client
        .query_one("SELECT to_regclass($1) IS NOT NULL", &[&qualified])
        .await?;
    Ok(row.try_get(0)?)
}
