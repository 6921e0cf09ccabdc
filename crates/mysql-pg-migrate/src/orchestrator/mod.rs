//! Migration orchestrator - main workflow coordinator.
//!
//! Runs the phases in a fixed order, each guarded by its persisted flag:
//!
//! 1. structure (tables, sequences, views)
//! 2. data (chunk pool + data pipe)
//! 3. binary decode
//! 4. constraints
//!
//! A phase whose flag is already set is skipped, so re-running after a
//! crash or a cancellation resumes where the previous process stopped.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::constraints::{apply_constraints, ConstraintFailure};
use crate::context::MigrationContext;
use crate::core::{SourceReader, TargetWriter};
use crate::decoder::decode_binary_columns;
use crate::drivers::{postgres, MysqlReader, PgChunkStore, PgPhaseStore, PostgresWriter};
use crate::error::Result;
use crate::pool::{ChunkRecord, ChunkStore, PoolManager, PoolSummary};
use crate::state::{PhaseFlag, PhaseState, PhaseStore, StateManager};
use crate::structure::{apply_structure, load_descriptors, load_views, table_selected, ViewFailure};
use crate::transfer::{ChunkFailure, DataPipe};

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every phase flag is set.
    Completed,
    /// Chunks or constraints failed permanently.
    Failed,
    /// A connection pool ran dry; re-run to continue.
    Interrupted,
    /// Stopped by a signal; re-run to continue.
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::Interrupted => 3,
            RunStatus::Failed => 5,
            RunStatus::Cancelled => 130,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Identifier of this process invocation.
    pub run_id: String,

    /// Run that created the persisted state, when this run resumed it.
    pub resumed_from: Option<String>,

    pub status: RunStatus,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Phase flags at the end of the run.
    pub phases: PhaseState,

    pub tables_total: usize,
    pub tables_created: usize,
    pub views_created: usize,
    pub failed_views: Vec<ViewFailure>,

    /// Chunks in the pool.
    pub chunks_total: u64,
    /// Chunks done, including those loaded by earlier runs.
    pub chunks_done: u64,
    /// Chunks loaded by this run.
    pub chunks_transferred: u64,
    pub chunks_failed: u64,
    /// Failed attempts that were retried during this run.
    pub chunks_retried: u64,
    pub chunk_failures: Vec<ChunkFailure>,

    /// Rows loaded by this run.
    pub rows_transferred: u64,

    /// Average throughput (rows/second).
    pub rows_per_second: u64,

    pub binary_columns_decoded: usize,

    pub constraints_applied: usize,
    pub constraints_failed: usize,
    pub constraint_failures: Vec<ConstraintFailure>,
    /// Tables whose foreign keys were created in the cycle pass.
    pub deferred_fk_tables: Vec<String>,
}

impl MigrationReport {
    fn new(run_id: &str, started_at: DateTime<Utc>, phases: PhaseState) -> Self {
        Self {
            run_id: run_id.to_string(),
            resumed_from: None,
            status: RunStatus::Failed,
            started_at,
            completed_at: started_at,
            duration_seconds: 0.0,
            phases,
            tables_total: 0,
            tables_created: 0,
            views_created: 0,
            failed_views: Vec::new(),
            chunks_total: 0,
            chunks_done: 0,
            chunks_transferred: 0,
            chunks_failed: 0,
            chunks_retried: 0,
            chunk_failures: Vec::new(),
            rows_transferred: 0,
            rows_per_second: 0,
            binary_columns_decoded: 0,
            constraints_applied: 0,
            constraints_failed: 0,
            constraint_failures: Vec::new(),
            deferred_fk_tables: Vec::new(),
        }
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Persisted progress, as reported by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub phases: PhaseState,
    pub pool: PoolSummary,
    pub failed_chunks: Vec<ChunkRecord>,
}

/// Row counts of one table on both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableValidation {
    pub table: String,
    pub source_rows: i64,
    pub target_rows: i64,
    pub matches: bool,
}

/// Result of a connection health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
}

/// Migration orchestrator.
pub struct Orchestrator {
    ctx: Arc<MigrationContext>,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    chunks: Arc<dyn ChunkStore>,
    state: StateManager,
}

impl Orchestrator {
    /// Connect to MySQL and PostgreSQL and keep migration state in the target schema.
    pub async fn new(config: Config) -> Result<Self> {
        let source = MysqlReader::new(
            &config.source,
            config.migration.get_max_source_connections(),
        )
        .await?;

        let pool =
            postgres::connect_pool(&config.target, config.migration.get_max_target_connections())
                .await?;
        let chunks = PgChunkStore::new(pool.clone(), &config.target.schema)?;
        let phases = PgPhaseStore::new(pool.clone(), &config.target.schema)?;
        let target = PostgresWriter::new(pool);

        Ok(Self::with_backends(
            MigrationContext::from_config(&config),
            Arc::new(source),
            Arc::new(target),
            Arc::new(chunks),
            Arc::new(phases),
        ))
    }

    /// Build an orchestrator over arbitrary backends.
    pub fn with_backends(
        ctx: MigrationContext,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        chunks: Arc<dyn ChunkStore>,
        phases: Arc<dyn PhaseStore>,
    ) -> Self {
        Self {
            ctx: Arc::new(ctx),
            source,
            target,
            state: StateManager::new(phases, chunks.clone()),
            chunks,
        }
    }

    pub fn context(&self) -> &MigrationContext {
        &self.ctx
    }

    /// Run (or resume) the migration.
    ///
    /// Permanent chunk and constraint failures are reported in the result,
    /// not as `Err`. Errors are reserved for fatal conditions: type mapping,
    /// structure, binary decode, state, and config mismatches.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let ctx = &self.ctx;

        info!("Starting migration run: {}", ctx.run_id);
        let mut phases = self
            .state
            .ensure_state_table(&ctx.config_hash, &ctx.run_id)
            .await?;

        let mut report = MigrationReport::new(&ctx.run_id, started_at, phases.clone());
        if phases.run_id != ctx.run_id {
            report.resumed_from = Some(phases.run_id.clone());
        }

        let pool = Arc::new(PoolManager::new(self.chunks.clone(), ctx.pool_settings()));
        pool.requeue_in_progress().await?;

        let structure = ctx.structure_settings();
        let tables = load_descriptors(self.source.as_ref(), &structure).await?;
        report.tables_total = tables.len();

        // Phase 1: Structure
        if phases.structure_loaded {
            info!("Phase 1: structure already loaded, skipping");
        } else {
            info!("Phase 1: Creating {} tables in the target", tables.len());
            let views = load_views(self.source.as_ref(), &structure).await?;

            // Fresh tables invalidate any chunk bookkeeping from an earlier attempt
            self.chunks.truncate().await?;
            self.state.clear_table_markers().await?;
            let summary = apply_structure(&self.target, &tables, &views, &structure).await?;
            for failure in &summary.failed_views {
                warn!("View {} was not created: {}", failure.view, failure.error);
            }
            report.tables_created = summary.tables_created;
            report.views_created = summary.views_created;
            report.failed_views = summary.failed_views;
            self.set_phase(&mut phases, PhaseFlag::StructureLoaded).await?;
        }

        if cancel.is_cancelled() {
            return self.finish(report, phases, &pool, RunStatus::Cancelled, timer).await;
        }

        // Phase 2: Data
        if phases.data_loaded {
            info!("Phase 2: data already loaded, skipping");
        } else {
            info!("Phase 2: Transferring data");
            pool.build_pools(self.source.as_ref(), &tables).await?;

            let pipe = DataPipe::new(
                self.source.clone(),
                self.target.clone(),
                pool.clone(),
                &tables,
                ctx.pipe_settings(),
            )?;
            let summary = pipe.run(cancel).await?;
            report.chunks_transferred = summary.chunks_done;
            report.chunks_retried = summary.chunks_retried;
            report.rows_transferred = summary.rows;

            let pool_summary = pool.summary().await?;
            if summary.interrupted || !pool_summary.is_complete() {
                let status = if cancel.is_cancelled() {
                    RunStatus::Cancelled
                } else if summary.resource_exhausted {
                    RunStatus::Interrupted
                } else {
                    RunStatus::Failed
                };
                warn!(
                    "Data phase incomplete: {} pending, {} failed; later phases skipped",
                    pool_summary.pending + pool_summary.in_progress,
                    pool_summary.failed
                );
                return self.finish(report, phases, &pool, status, timer).await;
            }
            self.set_phase(&mut phases, PhaseFlag::DataLoaded).await?;
        }

        if cancel.is_cancelled() {
            return self.finish(report, phases, &pool, RunStatus::Cancelled, timer).await;
        }

        // Phase 3: Binary decode
        if phases.binary_decoded {
            info!("Phase 3: binary columns already decoded, skipping");
        } else {
            info!("Phase 3: Decoding binary columns");
            let summary = decode_binary_columns(
                &self.target,
                &self.state,
                &tables,
                &ctx.decoder_settings(),
            )
            .await?;
            report.binary_columns_decoded = summary.columns_decoded;
            self.set_phase(&mut phases, PhaseFlag::BinaryDecoded).await?;
        }

        if cancel.is_cancelled() {
            return self.finish(report, phases, &pool, RunStatus::Cancelled, timer).await;
        }

        // Phase 4: Constraints
        if phases.constraints_applied {
            info!("Phase 4: constraints already applied, skipping");
        } else {
            info!("Phase 4: Applying keys, indexes, and constraints");
            let summary = apply_constraints(&self.target, &tables, &ctx.constraint_settings()).await?;
            report.constraints_applied = summary.applied;
            report.constraints_failed = summary.failed;
            report.constraint_failures = summary.failures;
            report.deferred_fk_tables = summary.deferred_tables;

            if report.constraints_failed == 0 {
                self.set_phase(&mut phases, PhaseFlag::ConstraintsApplied).await?;
            } else {
                warn!(
                    "{} constraints failed; fix the data and re-run to retry them",
                    report.constraints_failed
                );
            }
        }

        let status = if phases.is_complete() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.finish(report, phases, &pool, status, timer).await
    }

    async fn set_phase(&self, phases: &mut PhaseState, flag: PhaseFlag) -> Result<()> {
        self.state.set_phase(flag).await?;
        phases.set(flag);
        Ok(())
    }

    async fn finish(
        &self,
        mut report: MigrationReport,
        phases: PhaseState,
        pool: &PoolManager,
        status: RunStatus,
        timer: Instant,
    ) -> Result<MigrationReport> {
        let pool_summary = pool.summary().await?;
        report.chunks_total = pool_summary.total();
        report.chunks_done = pool_summary.done;
        report.chunks_failed = pool_summary.failed;
        report.chunk_failures = pool
            .failures()
            .await?
            .into_iter()
            .map(|c| ChunkFailure {
                chunk_id: c.id,
                table: c.table,
                index: c.index,
                error: c.last_error.unwrap_or_default(),
            })
            .collect();

        if status == RunStatus::Completed && self.ctx.remove_transient_artifacts {
            self.state.drop_artifacts().await?;
        }

        let elapsed = timer.elapsed().as_secs_f64();
        report.status = status;
        report.phases = phases;
        report.completed_at = Utc::now();
        report.duration_seconds = elapsed;
        report.rows_per_second = if elapsed > 0.0 {
            (report.rows_transferred as f64 / elapsed) as u64
        } else {
            0
        };

        info!(
            "Migration {}: {} tables, {} rows in {:.1}s ({} rows/s), {} chunks failed, {} constraints failed",
            report.status,
            report.tables_total,
            report.rows_transferred,
            report.duration_seconds,
            report.rows_per_second,
            report.chunks_failed,
            report.constraints_failed
        );
        Ok(report)
    }

    /// Persisted phase flags and pool counts.
    pub async fn status(&self) -> Result<MigrationStatus> {
        Ok(MigrationStatus {
            phases: self.state.get_phase().await?,
            pool: self.chunks.summary().await?,
            failed_chunks: self.chunks.failures().await?,
        })
    }

    /// Clear every phase flag and empty the pool; the next run starts over.
    pub async fn reset(&self) -> Result<()> {
        self.state.reset().await
    }

    /// Compare row counts of every selected table.
    pub async fn validate(&self) -> Result<Vec<TableValidation>> {
        let schema = &self.ctx.target_schema;
        let mut results = Vec::new();

        for table in self.source.list_tables().await? {
            if !table_selected(&table, &self.ctx.include_tables, &self.ctx.exclude_tables) {
                continue;
            }
            let source_rows = self.source.row_count(&table).await?;
            let target_rows = match self.target.row_count(schema, &table).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("{}: cannot count target rows: {}", table, e);
                    0
                }
            };

            let matches = source_rows == target_rows;
            if matches {
                info!("{}: {} rows (match)", table, source_rows);
            } else {
                warn!(
                    "{}: source={} target={} (MISMATCH)",
                    table, source_rows, target_rows
                );
            }
            results.push(TableValidation {
                table,
                source_rows,
                target_rows,
                matches,
            });
        }
        Ok(results)
    }

    /// Round-trip a trivial query on both databases.
    pub async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let source = self.source.test_connection().await;
        let source_latency_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let target = self.target.test_connection().await;
        let target_latency_ms = started.elapsed().as_millis() as u64;

        HealthCheckResult {
            healthy: source.is_ok() && target.is_ok(),
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
        }
    }

    /// Close both connection pools.
    pub async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
    }
}
