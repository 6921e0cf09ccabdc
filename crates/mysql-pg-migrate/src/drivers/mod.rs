//! Database driver implementations.
//!
//! This module provides implementations of the core traits:
//!
//! - [`mysql`]: MySQL `SourceReader` (sqlx)
//! - [`postgres`]: PostgreSQL `TargetWriter`, `ChunkStore`, and `PhaseStore`
//!   (tokio-postgres + deadpool-postgres)
//! - [`memory`]: in-memory versions of all four, for tests and dry runs
//!
//! # Adding a backend
//!
//! 1. Create a module under `drivers/`
//! 2. Implement `SourceReader` or `TargetWriter` from `core::traits`
//! 3. If the backend can hold migration state, implement `ChunkStore` and
//!    `PhaseStore` as well
//! 4. Wire it up in `Orchestrator::new`

pub mod memory;
pub mod mysql;
pub mod postgres;

pub use memory::{
    Fault, MemoryChunkStore, MemoryPhaseStore, MemorySource, MemoryTable, MemoryTarget, StoreOp,
};
pub use mysql::MysqlReader;
pub use postgres::{PgChunkStore, PgPhaseStore, PostgresWriter};
