//! Data Pool Manager: splits tables into chunks and hands them out to workers.

mod plan;
mod store;

pub use plan::{plan_table, split_key_range, ChunkSelection, SizingPolicy, TablePlan};
pub use store::{
    chunk_status_to_str, status_after_failure, str_to_chunk_status, ChunkRecord, ChunkStatus,
    ChunkStore, NewChunk, PoolSummary,
};

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::core::{SourceReader, TableDescriptor};
use crate::error::{FailureClass, MigrateError, Result};

/// Settings for the Data Pool Manager.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub chunk_byte_budget: u64,
    pub small_table_threshold: i64,
    /// Attempts per chunk before a transient failure becomes permanent.
    pub max_attempts: u32,
}

impl PoolSettings {
    fn sizing(&self) -> SizingPolicy {
        SizingPolicy {
            chunk_byte_budget: self.chunk_byte_budget,
            small_table_threshold: self.small_table_threshold,
        }
    }
}

/// Chunk pool over a durable [`ChunkStore`].
pub struct PoolManager {
    store: Arc<dyn ChunkStore>,
    settings: PoolSettings,
}

impl PoolManager {
    pub fn new(store: Arc<dyn ChunkStore>, settings: PoolSettings) -> Self {
        Self { store, settings }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Plan and insert chunks for every table. Returns the number of chunks created.
    ///
    /// Tables that already have chunks (a resumed run) are skipped.
    pub async fn build_pools(
        &self,
        source: &dyn SourceReader,
        tables: &[TableDescriptor],
    ) -> Result<usize> {
        let policy = self.settings.sizing();
        let mut created = 0;

        for table in tables {
            if self.store.has_chunks(&table.source_name).await? {
                debug!("{}: pool already built, skipping", table.source_name);
                continue;
            }

            let needs_bounds = policy.chunk_count(table.row_estimate, table.avg_row_width) > 1;
            let key_bounds = match table.integer_key() {
                Some(key) if needs_bounds => source.key_bounds(&table.source_name, &key.name).await?,
                _ => None,
            };

            let plan = plan_table(table, key_bounds, &policy);
            if plan.unsplittable {
                warn!(
                    "{}: ~{} rows but no primary key, transferring as a single chunk",
                    table.source_name, table.row_estimate
                );
            }

            let chunks: Vec<NewChunk> = plan
                .selections
                .into_iter()
                .enumerate()
                .map(|(i, selection)| NewChunk {
                    table: table.source_name.clone(),
                    index: i as i32,
                    selection,
                })
                .collect();

            debug!("{}: {} chunks", table.source_name, chunks.len());
            self.store.insert_chunks(&chunks).await?;
            created += chunks.len();
        }

        info!("Pool built: {} new chunks", created);
        Ok(created)
    }

    /// Claim the next pending chunk.
    pub async fn next_chunk(&self) -> Result<Option<ChunkRecord>> {
        self.store.claim_next().await
    }

    pub async fn mark_done(&self, chunk: &ChunkRecord) -> Result<()> {
        self.store.mark_done(chunk.id).await
    }

    /// Record a failed attempt. Transient failures go back to `pending` until
    /// the attempt ceiling; anything else fails the chunk at once.
    pub async fn mark_failed(&self, chunk: &ChunkRecord, err: &MigrateError) -> Result<ChunkStatus> {
        let retry = err.class() == FailureClass::Transient;
        let status = self
            .store
            .mark_failed(chunk.id, &err.to_string(), retry, self.settings.max_attempts)
            .await?;

        match status {
            ChunkStatus::Pending => warn!(
                "{} chunk {} (id {}): attempt {} failed, will retry: {}",
                chunk.table,
                chunk.index,
                chunk.id,
                chunk.attempts + 1,
                err
            ),
            _ => error!(
                "{} chunk {} (id {}): failed permanently: {}",
                chunk.table, chunk.index, chunk.id, err
            ),
        }
        Ok(status)
    }

    /// Hand an interrupted chunk back to the pool without counting an attempt.
    pub async fn release(&self, chunk: &ChunkRecord) -> Result<()> {
        self.store.release(chunk.id).await
    }

    /// Return chunks left `in_progress` by a previous process to `pending`.
    pub async fn requeue_in_progress(&self) -> Result<u64> {
        let requeued = self.store.requeue_in_progress().await?;
        if requeued > 0 {
            info!("Requeued {} chunks left in progress by an earlier run", requeued);
        }
        Ok(requeued)
    }

    pub async fn summary(&self) -> Result<PoolSummary> {
        self.store.summary().await
    }

    pub async fn failures(&self) -> Result<Vec<ChunkRecord>> {
        self.store.failures().await
    }
}
