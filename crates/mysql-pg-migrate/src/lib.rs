//! # mysql-pg-migrate
//!
//! Resumable, chunked MySQL to PostgreSQL migration library.
//!
//! A run moves through four phases, each recorded in a state table in the
//! target schema so an interrupted run picks up where it stopped:
//!
//! - **Structure**: tables and sequences created from MySQL metadata
//! - **Data**: tables split into chunks, transferred in parallel over
//!   PostgreSQL COPY, one transaction per chunk
//! - **Binary decode**: hex-transported binary columns decoded in place
//! - **Constraints**: keys, indexes, checks, comments, and foreign keys in
//!   dependency order
//!
//! ## Example
//!
//! ```rust,no_run
//! use mysql_pg_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> mysql_pg_migrate::Result<()> {
//! let config = Config::load("config.yaml")?.with_auto_tuning();
//! let orchestrator = Orchestrator::new(config).await?;
//! let report = orchestrator.run(&CancellationToken::new()).await?;
//! println!("{}: {} rows", report.status, report.rows_transferred);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constraints;
pub mod context;
pub mod core;
pub mod decoder;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod state;
pub mod structure;
pub mod transfer;
pub mod typemap;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use context::MigrationContext;
pub use error::{FailureClass, MigrateError, Result};
pub use orchestrator::{
    HealthCheckResult, MigrationReport, MigrationStatus, Orchestrator, RunStatus, TableValidation,
};
pub use pool::{ChunkStatus, PoolSummary};
pub use state::{PhaseFlag, PhaseState};
