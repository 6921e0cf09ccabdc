//! Query execution boundary between the migration engine and the databases.
//!
//! - [`SourceReader`]: schema metadata and streaming chunk reads from MySQL
//! - [`TargetWriter`]: DDL execution and transactional bulk loads into PostgreSQL
//!
//! Every phase works against `Arc<dyn SourceReader>` / `Arc<dyn TargetWriter>`,
//! so the in-memory implementations in `drivers::memory` can stand in for
//! real servers.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::pool::ChunkSelection;

use super::schema::{SourceTable, ViewDefinition};
use super::value::Row;

/// Request to stream one chunk of a source table.
#[derive(Debug, Clone)]
pub struct ChunkRead {
    /// Source table name.
    pub table: String,

    /// Column names in descriptor order.
    pub columns: Vec<String>,

    /// Select expression per column (same order as `columns`).
    pub select_list: Vec<String>,

    /// Per column: read raw bytes instead of text.
    pub raw_bytes: Vec<bool>,

    /// Which rows belong to the chunk.
    pub selection: ChunkSelection,

    /// Rows per batch sent through the channel.
    pub batch_size: usize,

    /// Channel capacity in batches.
    pub read_ahead: usize,
}

/// Request to bulk-load one chunk into a target table.
#[derive(Debug, Clone)]
pub struct ChunkLoad {
    /// Target schema.
    pub schema: String,

    /// Target table name.
    pub table: String,

    /// Target column names, matching the encoded field order.
    pub columns: Vec<String>,

    /// Statement executed inside the load transaction before commit.
    ///
    /// Used to flip the chunk's pool row to `done` atomically with its rows
    /// when the pool lives in the target database.
    pub on_commit: Option<String>,
}

/// Read schema metadata and rows from the source database.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Names of the base tables in the source database, sorted.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Columns, indexes, foreign keys, comment, and size estimates of a table.
    async fn describe_table(&self, table: &str) -> Result<SourceTable>;

    /// View definitions in the source database.
    async fn list_views(&self) -> Result<Vec<ViewDefinition>>;

    /// Minimum and maximum of an integer key column (`None` for an empty table).
    async fn key_bounds(&self, table: &str, column: &str) -> Result<Option<(i64, i64)>>;

    /// Exact row count.
    async fn row_count(&self, table: &str) -> Result<i64>;

    /// Stream the rows of one chunk.
    ///
    /// A background task fills the returned channel with batches of at most
    /// `batch_size` rows, blocking when `read_ahead` batches are queued. An
    /// `Err` item ends the stream.
    fn read_chunk(&self, request: ChunkRead) -> mpsc::Receiver<Result<Vec<Row>>>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Database type identifier (e.g., "mysql").
    fn db_type(&self) -> &str;

    /// Close the connection pool.
    async fn close(&self);
}

/// Execute statements and bulk-load data into the target database.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Execute one or more statements with no result rows.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Execute statements in one transaction: all of them commit or none do.
    async fn execute_atomic(&self, statements: &[String]) -> Result<()>;

    /// Table that owns the constraint or index `name` in `schema`, if one
    /// exists under that name.
    async fn object_table(&self, schema: &str, name: &str) -> Result<Option<String>>;

    /// Load one chunk of COPY text data in a single transaction.
    ///
    /// Consumes `data` until the sender closes it. An `Err` item, or any COPY
    /// failure, rolls the transaction back and is returned unchanged, so the
    /// target never holds a partial chunk. Returns the number of rows loaded.
    async fn load_chunk(&self, load: &ChunkLoad, data: mpsc::Receiver<Result<Bytes>>)
        -> Result<u64>;

    /// Exact row count of a target table.
    async fn row_count(&self, schema: &str, table: &str) -> Result<i64>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Database type identifier (e.g., "postgres").
    fn db_type(&self) -> &str;

    /// Close the connection pool.
    async fn close(&self);
}
