//! Data Pipe Manager: parallel chunk transfer from MySQL to PostgreSQL.
//!
//! Each worker claims a chunk from the pool and runs a three-stage pipeline:
//!
//! ```text
//! source.read_chunk ──rows──> encoder task ──COPY text──> target.load_chunk
//! ```
//!
//! Both channels are bounded by `read_ahead`, so a slow target applies
//! back-pressure all the way to the source cursor. The load runs in a single
//! target transaction; a chunk is either fully present or absent.

mod encode;

pub use encode::{expand_bits, is_fixed_point, is_zero_date, RowEncoder};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::identifier::quote_mysql;
use crate::core::{ChunkLoad, ChunkRead, SourceReader, TableDescriptor, TargetWriter};
use crate::error::{FailureClass, MigrateError, Result};
use crate::pool::{ChunkRecord, ChunkStatus, PoolManager};

/// Settings for the Data Pipe Manager.
#[derive(Debug, Clone)]
pub struct PipeSettings {
    pub target_schema: String,
    /// Concurrent chunk transfers.
    pub workers: usize,
    /// Rows per batch read from the source.
    pub batch_size: usize,
    /// Batches buffered between pipeline stages.
    pub read_ahead: usize,
    /// Base delay before a failed chunk is retried; doubles per attempt.
    pub retry_backoff: Duration,
}

/// A chunk that failed permanently during this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_id: i64,
    pub table: String,
    pub index: i32,
    pub error: String,
}

/// Outcome of one data pipe run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipeSummary {
    /// Chunks loaded in this run.
    pub chunks_done: u64,
    /// Chunks that became permanently failed in this run.
    pub chunks_failed: u64,
    /// Failed attempts that sent a chunk back to `pending`.
    pub chunks_retried: u64,
    /// Rows loaded in this run.
    pub rows: u64,
    /// Work stopped before the pool drained.
    pub interrupted: bool,
    /// A connection pool ran dry.
    pub resource_exhausted: bool,
    pub failures: Vec<ChunkFailure>,
}

impl PipeSummary {
    fn merge(&mut self, other: PipeSummary) {
        self.chunks_done += other.chunks_done;
        self.chunks_failed += other.chunks_failed;
        self.chunks_retried += other.chunks_retried;
        self.rows += other.rows;
        self.resource_exhausted |= other.resource_exhausted;
        self.failures.extend(other.failures);
    }
}

/// Per-table transfer plan, computed once per run.
#[derive(Debug)]
struct TransferTable {
    target_name: String,
    columns: Vec<String>,
    select_list: Vec<String>,
    raw_bytes: Vec<bool>,
    encoder: RowEncoder,
}

impl TransferTable {
    fn new(table: &TableDescriptor) -> Result<Self> {
        let select_list = table
            .columns
            .iter()
            .map(|c| Ok(c.mapping.transform.select_expr(&quote_mysql(&c.name)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            target_name: table.target_name.clone(),
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
            select_list,
            raw_bytes: table
                .columns
                .iter()
                .map(|c| c.mapping.transform.reads_bytes())
                .collect(),
            encoder: RowEncoder::new(table),
        })
    }
}

/// Moves every pending chunk of the pool from source to target.
#[derive(Clone)]
pub struct DataPipe {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    pool: Arc<PoolManager>,
    tables: Arc<HashMap<String, TransferTable>>,
    settings: PipeSettings,
}

impl DataPipe {
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        pool: Arc<PoolManager>,
        tables: &[TableDescriptor],
        settings: PipeSettings,
    ) -> Result<Self> {
        let tables = tables
            .iter()
            .map(|t| Ok((t.source_name.clone(), TransferTable::new(t)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            source,
            target,
            pool,
            tables: Arc::new(tables),
            settings,
        })
    }

    /// Run the workers until the pool has no pending chunk, the run is
    /// cancelled, or a connection pool is exhausted.
    ///
    /// Cancellation stops workers from claiming; chunks already in flight
    /// finish. Returns an error only when the pool itself cannot be read or
    /// updated; the first worker to hit one stops the others from claiming.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PipeSummary> {
        let stop = cancel.child_token();
        let workers = self.settings.workers.max(1);
        info!(
            "Transferring data with {} workers (batch size {}, read-ahead {})",
            workers, self.settings.batch_size, self.settings.read_ahead
        );

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let pipe = self.clone();
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                let result = pipe.worker(worker_id, stop.clone()).await;
                if result.is_err() {
                    stop.cancel();
                }
                result
            }));
        }

        let mut summary = PipeSummary::default();
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(stats)) => summary.merge(stats),
                Ok(Err(e)) => {
                    stop.cancel();
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    stop.cancel();
                    first_error.get_or_insert(MigrateError::State(format!(
                        "transfer worker panicked: {}",
                        e
                    )));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        summary.interrupted = summary.resource_exhausted || cancel.is_cancelled();
        info!(
            "Data transfer finished: {} chunks done, {} failed, {} retried, {} rows{}",
            summary.chunks_done,
            summary.chunks_failed,
            summary.chunks_retried,
            summary.rows,
            if summary.interrupted { " (interrupted)" } else { "" }
        );
        Ok(summary)
    }

    async fn worker(&self, worker_id: usize, stop: CancellationToken) -> Result<PipeSummary> {
        let mut stats = PipeSummary::default();

        loop {
            if stop.is_cancelled() {
                debug!("worker {}: stopping", worker_id);
                break;
            }

            let chunk = match self.pool.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) if e.class() == FailureClass::ResourceExhausted => {
                    warn!("worker {}: cannot claim chunks: {}", worker_id, e);
                    stats.resource_exhausted = true;
                    stop.cancel();
                    break;
                }
                Err(e) => return Err(e),
            };

            debug!(
                "worker {}: {} chunk {} (id {}, attempt {})",
                worker_id,
                chunk.table,
                chunk.index,
                chunk.id,
                chunk.attempts + 1
            );

            let err = match self.transfer_chunk(&chunk).await {
                Ok(rows) => {
                    if let Err(e) = self.pool.mark_done(&chunk).await {
                        if e.class() != FailureClass::ResourceExhausted {
                            return Err(e);
                        }
                        warn!(
                            "{} chunk {} loaded but not marked done: {}",
                            chunk.table, chunk.index, e
                        );
                        stats.resource_exhausted = true;
                        stop.cancel();
                        break;
                    }
                    stats.chunks_done += 1;
                    stats.rows += rows;
                    debug!("worker {}: {} chunk {} done, {} rows", worker_id, chunk.table, chunk.index, rows);
                    continue;
                }
                Err(e) => e,
            };

            if err.class() == FailureClass::ResourceExhausted {
                warn!(
                    "{} chunk {} interrupted, returning it to the pool: {}",
                    chunk.table, chunk.index, err
                );
                if let Err(e) = self.pool.release(&chunk).await {
                    // Requeued by the next run instead
                    warn!(
                        "{} chunk {} stays in progress: {}",
                        chunk.table, chunk.index, e
                    );
                }
                stats.resource_exhausted = true;
                stop.cancel();
                break;
            }

            let status = match self.pool.mark_failed(&chunk, &err).await {
                Ok(status) => status,
                Err(e) if e.class() == FailureClass::ResourceExhausted => {
                    warn!(
                        "{} chunk {} failed ({}) and the failure was not recorded: {}",
                        chunk.table, chunk.index, err, e
                    );
                    stats.resource_exhausted = true;
                    stop.cancel();
                    break;
                }
                Err(e) => return Err(e),
            };

            match status {
                ChunkStatus::Pending => {
                    stats.chunks_retried += 1;
                    let delay = backoff_delay(self.settings.retry_backoff, chunk.attempts);
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                _ => {
                    stats.chunks_failed += 1;
                    stats.failures.push(ChunkFailure {
                        chunk_id: chunk.id,
                        table: chunk.table.clone(),
                        index: chunk.index,
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(stats)
    }

    /// Stream one chunk through the encode stage into a single target load.
    async fn transfer_chunk(&self, chunk: &ChunkRecord) -> Result<u64> {
        let table = self.tables.get(&chunk.table).ok_or_else(|| {
            MigrateError::State(format!(
                "chunk {} references unknown table {}",
                chunk.id, chunk.table
            ))
        })?;

        let read_ahead = self.settings.read_ahead.max(1);
        let mut rows_rx = self.source.read_chunk(ChunkRead {
            table: chunk.table.clone(),
            columns: table.columns.clone(),
            select_list: table.select_list.clone(),
            raw_bytes: table.raw_bytes.clone(),
            selection: chunk.selection.clone(),
            batch_size: self.settings.batch_size.max(1),
            read_ahead,
        });

        let (tx, rx) = mpsc::channel::<Result<Bytes>>(read_ahead);
        let encoder = table.encoder.clone();
        let encode = tokio::spawn(async move {
            while let Some(batch) = rows_rx.recv().await {
                let encoded = batch.and_then(|rows| encoder.encode_batch(&rows));
                let failed = encoded.is_err();
                if tx.send(encoded).await.is_err() || failed {
                    break;
                }
            }
        });

        let load = ChunkLoad {
            schema: self.settings.target_schema.clone(),
            table: table.target_name.clone(),
            columns: table.columns.clone(),
            on_commit: self.pool.store().completion_statement(chunk.id),
        };
        let result = self.target.load_chunk(&load, rx).await;

        if let Err(e) = encode.await {
            error!("{} chunk {}: encoder task failed: {}", chunk.table, chunk.index, e);
            if result.is_ok() {
                return Err(MigrateError::interrupted(&chunk.table, "encoder task failed"));
            }
        }
        result
    }
}

/// Delay before the next attempt of a chunk that has failed `attempts` times before.
pub fn backoff_delay(base: Duration, attempts: i32) -> Duration {
    let exp = attempts.clamp(0, 6) as u32;
    base.saturating_mul(1 << exp)
}

/// Run `op` until it succeeds, fails with an error that is neither
/// transient nor resource exhaustion, or has run `max_attempts` times.
pub async fn retry_transient<T, F, Fut>(
    what: &str,
    max_attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Err(e)
                if matches!(
                    e.class(),
                    FailureClass::Transient | FailureClass::ResourceExhausted
                ) && attempt < max_attempts =>
            {
                warn!("{}: attempt {} failed, retrying: {}", what, attempt, e);
                tokio::time::sleep(backoff_delay(backoff, attempt as i32 - 1)).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_transient_stops_at_ceiling() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_transient("decode t", 3, Duration::ZERO, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MigrateError::interrupted("t", "gone"))
        })
        .await;
        assert!(matches!(result, Err(MigrateError::Interrupted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_gives_up_on_permanent_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_transient("decode t", 3, Duration::ZERO, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(MigrateError::data("t", "bad row"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert!(matches!(result, Err(MigrateError::Data { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_transient_recovers() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_transient("decode t", 3, Duration::ZERO, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(MigrateError::interrupted("t", "gone"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 50), Duration::from_millis(6400));
    }

    #[test]
    fn test_summary_merge() {
        let mut total = PipeSummary::default();
        total.merge(PipeSummary {
            chunks_done: 2,
            rows: 10,
            ..Default::default()
        });
        total.merge(PipeSummary {
            chunks_done: 1,
            chunks_failed: 1,
            resource_exhausted: true,
            failures: vec![ChunkFailure {
                chunk_id: 4,
                table: "t".into(),
                index: 3,
                error: "bad".into(),
            }],
            ..Default::default()
        });
        assert_eq!(total.chunks_done, 3);
        assert_eq!(total.rows, 10);
        assert!(total.resource_exhausted);
        assert_eq!(total.failures.len(), 1);
    }
}
