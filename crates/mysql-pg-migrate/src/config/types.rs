//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MySQL / MariaDB).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source database (MySQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database (schema) to migrate.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Connection character set (default: "utf8mb4").
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// SSL mode: disabled, preferred, required (default: "preferred").
    #[serde(default = "default_preferred")]
    pub ssl_mode: String,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encoding", &self.encoding)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .finish()
    }
}

/// Migration behavior configuration.
/// All performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Maximum simultaneous chunk transfers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Maximum simultaneous DDL statements. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ddl_workers: Option<usize>,

    /// Rows per source read batch. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Read-ahead batches buffered per chunk transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_ahead: Option<usize>,

    /// Approximate bytes per chunk. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_byte_budget: Option<u64>,

    /// Tables with fewer estimated rows are transferred as a single chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_table_threshold: Option<i64>,

    /// Attempts per chunk or DDL statement before a transient failure becomes permanent.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between retries in milliseconds (doubles per attempt).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Maximum MySQL connections. Auto-tuned based on workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_source_connections: Option<usize>,

    /// Maximum PostgreSQL connections. Auto-tuned based on workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_target_connections: Option<usize>,

    /// Tables to include (`*` wildcards). Empty means all tables.
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Tables to exclude (`*` wildcards).
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Create indexes after transfer (default: true).
    #[serde(default = "default_true")]
    pub create_indexes: bool,

    /// Create foreign keys after transfer (default: true).
    #[serde(default = "default_true")]
    pub create_foreign_keys: bool,

    /// Copy table and column comments (default: true).
    #[serde(default = "default_true")]
    pub create_comments: bool,

    /// Translate and create views (default: true).
    #[serde(default = "default_true")]
    pub create_views: bool,

    /// Enforce enum/set legal values with check constraints (default: false).
    #[serde(default)]
    pub create_enum_checks: bool,

    /// Drop the pool and state tables once the migration is fully complete (default: false).
    #[serde(default)]
    pub remove_transient_artifacts: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: None,
            ddl_workers: None,
            batch_size: None,
            read_ahead: None,
            chunk_byte_budget: None,
            small_table_threshold: None,
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_source_connections: None,
            max_target_connections: None,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            create_indexes: true,
            create_foreign_keys: true,
            create_comments: true,
            create_views: true,
            create_enum_checks: false,
            remove_transient_artifacts: false,
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // Workers: cores - 2, between 2 and 32
        if self.workers.is_none() {
            self.workers = Some(cores.saturating_sub(2).clamp(2, 32));
        }
        let workers = self.get_workers();

        // DDL is lock-heavy on the target; keep it narrower than data workers
        if self.ddl_workers.is_none() {
            self.ddl_workers = Some((cores / 2).clamp(2, 8));
        }

        // Batch size: base 10K rows, +5K per 8GB of RAM, cap at 50K
        if self.batch_size.is_none() {
            let batch = 10_000 + (ram_gb / 8.0) as usize * 5_000;
            self.batch_size = Some(batch.clamp(10_000, 50_000));
        }

        if self.read_ahead.is_none() {
            self.read_ahead = Some(((ram_gb / 8.0) as usize).clamp(2, 8));
        }

        // Chunk budget: 64MB, +32MB per 8GB of RAM, cap at 512MB
        if self.chunk_byte_budget.is_none() {
            let budget = (64 + (ram_gb / 8.0) as u64 * 32).min(512);
            self.chunk_byte_budget = Some(budget * 1024 * 1024);
        }

        if self.small_table_threshold.is_none() {
            self.small_table_threshold = Some(100_000);
        }

        // Each worker holds one source and one target connection, plus slack
        // for pool claims and DDL.
        if self.max_source_connections.is_none() {
            self.max_source_connections = Some((workers + 2).clamp(4, 64));
        }
        if self.max_target_connections.is_none() {
            self.max_target_connections = Some((workers * 2 + 2).clamp(4, 64));
        }

        info!(
            "Auto-tuned config: workers={}, ddl_workers={}, batch_size={}, read_ahead={}, \
             chunk_byte_budget={}, small_table_threshold={}, source_conns={}, target_conns={}",
            self.get_workers(),
            self.get_ddl_workers(),
            self.get_batch_size(),
            self.get_read_ahead(),
            self.get_chunk_byte_budget(),
            self.get_small_table_threshold(),
            self.get_max_source_connections(),
            self.get_max_target_connections(),
        );

        self
    }

    // Accessors return the effective value, with fallbacks for configs that
    // were never auto-tuned.

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_ddl_workers(&self) -> usize {
        self.ddl_workers.unwrap_or(2)
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(10_000)
    }

    pub fn get_read_ahead(&self) -> usize {
        self.read_ahead.unwrap_or(4)
    }

    pub fn get_chunk_byte_budget(&self) -> u64 {
        self.chunk_byte_budget.unwrap_or(64 * 1024 * 1024)
    }

    pub fn get_small_table_threshold(&self) -> i64 {
        self.small_table_threshold.unwrap_or(100_000)
    }

    pub fn get_max_source_connections(&self) -> usize {
        self.max_source_connections.unwrap_or(8)
    }

    pub fn get_max_target_connections(&self) -> usize {
        self.max_target_connections.unwrap_or(10)
    }
}

// Default value functions for serde
fn default_mysql_port() -> u16 {
    3306
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_encoding() -> String {
    "utf8mb4".to_string()
}

fn default_preferred() -> String {
    "preferred".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tuning_fills_unset_values_only() {
        let resources = SystemResources {
            total_memory_gb: 16.0,
            cpu_cores: 8,
        };
        let config = MigrationConfig {
            workers: Some(3),
            ..Default::default()
        }
        .with_auto_tuning(&resources);

        assert_eq!(config.workers, Some(3));
        assert_eq!(config.ddl_workers, Some(4));
        assert_eq!(config.batch_size, Some(20_000));
        assert_eq!(config.chunk_byte_budget, Some(128 * 1024 * 1024));
        assert_eq!(config.max_source_connections, Some(5));
        assert_eq!(config.max_target_connections, Some(8));
    }

    #[test]
    fn test_auto_tuning_small_machine_floors() {
        let resources = SystemResources {
            total_memory_gb: 1.0,
            cpu_cores: 1,
        };
        let config = MigrationConfig::default().with_auto_tuning(&resources);
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.ddl_workers, Some(2));
        assert_eq!(config.batch_size, Some(10_000));
        assert_eq!(config.read_ahead, Some(2));
    }
}
