//! Chunk store trait for durable pool persistence.
//!
//! The [`ChunkStore`] trait defines the interface for persisting the chunk
//! pool. Implementations:
//!
//! - **PostgreSQL**: `PgChunkStore` in `drivers/postgres/pool_store.rs`, a
//!   table in the target schema
//! - **Memory**: `MemoryChunkStore` in `drivers/memory.rs`, for tests and
//!   dry runs
//!
//! The pool is the only mutable state shared between transfer workers, so
//! every claim and status change is a single atomic row update.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::plan::ChunkSelection;
use crate::error::{MigrateError, Result};

/// Chunk status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// A chunk to be inserted into the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChunk {
    pub table: String,
    pub index: i32,
    pub selection: ChunkSelection,
}

/// A persisted pool entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub table: String,
    /// Position of the chunk within its table (0-based).
    pub index: i32,
    pub selection: ChunkSelection,
    pub status: ChunkStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
}

/// Chunk counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
}

impl PoolSummary {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.done + self.failed
    }

    /// Every chunk is done.
    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.in_progress == 0 && self.failed == 0
    }

    pub(crate) fn add(&mut self, status: ChunkStatus, count: u64) {
        match status {
            ChunkStatus::Pending => self.pending += count,
            ChunkStatus::InProgress => self.in_progress += count,
            ChunkStatus::Done => self.done += count,
            ChunkStatus::Failed => self.failed += count,
        }
    }
}

/// Trait for chunk pool persistence backends.
///
/// Implementations must be `Send + Sync`; every method may be called
/// concurrently from many transfer workers.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Create the pool storage. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Whether the pool already holds chunks for a table.
    async fn has_chunks(&self, table: &str) -> Result<bool>;

    /// Insert chunks as `pending`. Chunks already present (same table and
    /// index) are left untouched.
    async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()>;

    /// Atomically flip one `pending` chunk to `in_progress` and return it.
    ///
    /// Two concurrent callers never receive the same chunk. Returns `None`
    /// when no chunk is pending.
    async fn claim_next(&self) -> Result<Option<ChunkRecord>>;

    /// Mark a chunk `done`. Idempotent.
    async fn mark_done(&self, id: i64) -> Result<()>;

    /// Record a failed attempt and return the chunk's new status.
    ///
    /// The attempt count is incremented. When `retry` is set and the new
    /// count is below `max_attempts` the chunk goes back to `pending`,
    /// otherwise it becomes `failed`.
    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry: bool,
        max_attempts: u32,
    ) -> Result<ChunkStatus>;

    /// Return an `in_progress` chunk to `pending` without counting an attempt.
    async fn release(&self, id: i64) -> Result<()>;

    /// Return every `in_progress` chunk to `pending` (crash recovery).
    async fn requeue_in_progress(&self) -> Result<u64>;

    /// Chunk counts per status.
    async fn summary(&self) -> Result<PoolSummary>;

    /// Permanently failed chunks, ordered by table and index.
    async fn failures(&self) -> Result<Vec<ChunkRecord>>;

    /// Remove every chunk.
    async fn truncate(&self) -> Result<()>;

    /// Remove the pool storage itself.
    async fn drop_store(&self) -> Result<()>;

    /// Statement marking a chunk `done`, for execution inside the target
    /// load transaction. `None` when the pool does not live in the target.
    fn completion_statement(&self, _id: i64) -> Option<String> {
        None
    }

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

/// Helper function to convert ChunkStatus to string representation.
pub fn chunk_status_to_str(status: ChunkStatus) -> &'static str {
    match status {
        ChunkStatus::Pending => "pending",
        ChunkStatus::InProgress => "in_progress",
        ChunkStatus::Done => "done",
        ChunkStatus::Failed => "failed",
    }
}

/// Helper function to parse ChunkStatus from string.
pub fn str_to_chunk_status(s: &str) -> Result<ChunkStatus> {
    match s {
        "pending" => Ok(ChunkStatus::Pending),
        "in_progress" => Ok(ChunkStatus::InProgress),
        "done" => Ok(ChunkStatus::Done),
        "failed" => Ok(ChunkStatus::Failed),
        _ => Err(MigrateError::State(format!("Invalid chunk status: {}", s))),
    }
}

/// Decide the status after a failed attempt.
pub fn status_after_failure(attempts_after: i32, retry: bool, max_attempts: u32) -> ChunkStatus {
    if retry && (attempts_after as i64) < max_attempts as i64 {
        ChunkStatus::Pending
    } else {
        ChunkStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_status_roundtrip() {
        for status in [
            ChunkStatus::Pending,
            ChunkStatus::InProgress,
            ChunkStatus::Done,
            ChunkStatus::Failed,
        ] {
            assert_eq!(str_to_chunk_status(chunk_status_to_str(status)).unwrap(), status);
        }
        assert!(str_to_chunk_status("running").is_err());
    }

    #[test]
    fn test_status_after_failure() {
        assert_eq!(status_after_failure(1, true, 3), ChunkStatus::Pending);
        assert_eq!(status_after_failure(2, true, 3), ChunkStatus::Pending);
        assert_eq!(status_after_failure(3, true, 3), ChunkStatus::Failed);
        assert_eq!(status_after_failure(1, false, 3), ChunkStatus::Failed);
    }

    #[test]
    fn test_summary_complete() {
        let mut summary = PoolSummary::default();
        summary.add(ChunkStatus::Done, 5);
        assert!(summary.is_complete());
        summary.add(ChunkStatus::Failed, 1);
        assert!(!summary.is_complete());
        assert_eq!(summary.total(), 6);
    }
}
