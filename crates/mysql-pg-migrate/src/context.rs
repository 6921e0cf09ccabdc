//! Immutable per-run migration context.

use std::time::Duration;

use crate::config::Config;
use crate::constraints::ConstraintSettings;
use crate::decoder::DecoderSettings;
use crate::pool::PoolSettings;
use crate::structure::StructureSettings;
use crate::transfer::PipeSettings;

/// Everything a run needs to know, fixed at start-up.
///
/// Built once from a validated, auto-tuned [`Config`] and shared as
/// `Arc<MigrationContext>`. Phases receive the narrow settings structs
/// below rather than the whole context.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    /// Identifier for this process invocation.
    pub run_id: String,
    /// Hash of the settings that decide what lands in the target.
    pub config_hash: String,

    pub source_database: String,
    pub target_schema: String,
    /// MySQL connection character set.
    pub encoding: String,

    pub workers: usize,
    pub ddl_workers: usize,
    pub batch_size: usize,
    pub read_ahead: usize,
    pub chunk_byte_budget: u64,
    pub small_table_threshold: i64,
    pub max_attempts: u32,
    pub retry_backoff: Duration,

    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,

    pub create_indexes: bool,
    pub create_foreign_keys: bool,
    pub create_comments: bool,
    pub create_views: bool,
    pub create_enum_checks: bool,
    pub remove_transient_artifacts: bool,
}

impl MigrationContext {
    pub fn from_config(config: &Config) -> Self {
        let m = &config.migration;
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            config_hash: config.hash(),
            source_database: config.source.database.clone(),
            target_schema: config.target.schema.clone(),
            encoding: config.source.encoding.clone(),
            workers: m.get_workers(),
            ddl_workers: m.get_ddl_workers(),
            batch_size: m.get_batch_size(),
            read_ahead: m.get_read_ahead(),
            chunk_byte_budget: m.get_chunk_byte_budget(),
            small_table_threshold: m.get_small_table_threshold(),
            max_attempts: m.max_attempts,
            retry_backoff: Duration::from_millis(m.retry_backoff_ms),
            include_tables: m.include_tables.clone(),
            exclude_tables: m.exclude_tables.clone(),
            create_indexes: m.create_indexes,
            create_foreign_keys: m.create_foreign_keys,
            create_comments: m.create_comments,
            create_views: m.create_views,
            create_enum_checks: m.create_enum_checks,
            remove_transient_artifacts: m.remove_transient_artifacts,
        }
    }

    pub fn structure_settings(&self) -> StructureSettings {
        StructureSettings {
            source_database: self.source_database.clone(),
            target_schema: self.target_schema.clone(),
            ddl_workers: self.ddl_workers,
            include_tables: self.include_tables.clone(),
            exclude_tables: self.exclude_tables.clone(),
            create_views: self.create_views,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            chunk_byte_budget: self.chunk_byte_budget,
            small_table_threshold: self.small_table_threshold,
            max_attempts: self.max_attempts,
        }
    }

    pub fn pipe_settings(&self) -> PipeSettings {
        PipeSettings {
            target_schema: self.target_schema.clone(),
            workers: self.workers,
            batch_size: self.batch_size,
            read_ahead: self.read_ahead,
            retry_backoff: self.retry_backoff,
        }
    }

    pub fn decoder_settings(&self) -> DecoderSettings {
        DecoderSettings {
            target_schema: self.target_schema.clone(),
            ddl_workers: self.ddl_workers,
            max_attempts: self.max_attempts,
            retry_backoff: self.retry_backoff,
        }
    }

    pub fn constraint_settings(&self) -> ConstraintSettings {
        ConstraintSettings {
            target_schema: self.target_schema.clone(),
            ddl_workers: self.ddl_workers,
            max_attempts: self.max_attempts,
            retry_backoff: self.retry_backoff,
            create_indexes: self.create_indexes,
            create_foreign_keys: self.create_foreign_keys,
            create_comments: self.create_comments,
            create_enum_checks: self.create_enum_checks,
        }
    }
}
