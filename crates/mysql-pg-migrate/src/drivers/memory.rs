//! In-memory source, target, and state backends.
//!
//! Used by the scenario tests and by dry runs. Every backend is cheap to
//! clone and shares its state between clones, so a test can hand one clone
//! to an orchestrator, drop it, and build a second orchestrator over the
//! same data to simulate a process restart.
//!
//! Faults can be injected into source reads, target statements, and chunk
//! store operations to exercise the retry and failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::core::{
    ChunkLoad, ChunkRead, ForeignKeyDescriptor, IndexDescriptor, Row, SourceColumn, SourceReader,
    SourceTable, SourceValue, TargetWriter, ViewDefinition,
};
use crate::error::{MigrateError, Result};
use crate::pool::{
    status_after_failure, ChunkRecord, ChunkSelection, ChunkStatus, ChunkStore, NewChunk,
    PoolSummary,
};
use crate::state::{PhaseFlag, PhaseState, PhaseStore};

/// Kind of failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Retryable (an interrupted stream).
    Transient,
    /// Caused by the data; never retried.
    Permanent,
    /// Connection pool exhausted.
    Exhausted,
}

impl Fault {
    fn to_error(self, table: &str) -> MigrateError {
        match self {
            Fault::Transient => MigrateError::interrupted(table, "injected connection loss"),
            Fault::Permanent => MigrateError::data(table, "injected data error"),
            Fault::Exhausted => MigrateError::PoolExhausted {
                context: format!("injected pool exhaustion on {}", table),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct ArmedFault {
    fault: Fault,
    /// Remaining triggers; `None` fires forever.
    remaining: Option<u32>,
}

impl ArmedFault {
    fn fire(&mut self) -> Option<Fault> {
        match &mut self.remaining {
            None => Some(self.fault),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(self.fault)
            }
        }
    }
}

// ===== Source =====

/// Builder for one in-memory source table.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    meta: SourceTable,
    rows: Vec<Row>,
    estimate: Option<i64>,
}

impl MemoryTable {
    /// A table with the given columns, no rows, and a 100-byte row width.
    pub fn new(name: impl Into<String>, columns: Vec<SourceColumn>) -> Self {
        Self {
            meta: SourceTable {
                name: name.into(),
                columns,
                indexes: Vec::new(),
                foreign_keys: Vec::new(),
                row_estimate: 0,
                avg_row_width: 100,
                comment: None,
            },
            rows: Vec::new(),
            estimate: None,
        }
    }

    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.meta.indexes.push(index);
        self
    }

    pub fn foreign_key(mut self, fk: ForeignKeyDescriptor) -> Self {
        self.meta.foreign_keys.push(fk);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.meta.comment = Some(comment.into());
        self
    }

    pub fn avg_row_width(mut self, width: i64) -> Self {
        self.meta.avg_row_width = width;
        self
    }

    /// Override the row estimate (defaults to the row count).
    pub fn row_estimate(mut self, rows: i64) -> Self {
        self.estimate = Some(rows);
        self
    }

    /// Rows in primary key order.
    pub fn rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    fn column_position(&self, name: &str) -> Result<usize> {
        self.meta
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                MigrateError::State(format!("no column {} in table {}", name, self.meta.name))
            })
    }

    fn key_of(&self, row: &Row, pos: usize) -> Option<i64> {
        match row.get(pos) {
            Some(SourceValue::Text(s)) => s.parse().ok(),
            _ => None,
        }
    }

    fn select(&self, selection: &ChunkSelection) -> Result<Vec<Row>> {
        match selection {
            ChunkSelection::Full => Ok(self.rows.clone()),
            ChunkSelection::KeyRange { column, .. } => {
                let pos = self.column_position(column)?;
                Ok(self
                    .rows
                    .iter()
                    .filter(|r| {
                        self.key_of(r, pos)
                            .map_or(false, |k| selection.contains_key(k))
                    })
                    .cloned()
                    .collect())
            }
            ChunkSelection::RowWindow { offset, limit, .. } => {
                let skip = (*offset).max(0) as usize;
                let take = limit.map_or(usize::MAX, |l| l.max(0) as usize);
                Ok(self.rows.iter().skip(skip).take(take).cloned().collect())
            }
        }
    }
}

#[derive(Debug, Default)]
struct SourceData {
    tables: Vec<MemoryTable>,
    views: Vec<ViewDefinition>,
    /// (table, key) -> fault. Fires on reads whose selection holds the key.
    read_faults: Vec<(String, i64, ArmedFault)>,
    reads: u64,
}

/// In-memory `SourceReader`.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Arc<Mutex<SourceData>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_table(&self, table: MemoryTable) {
        let mut data = self.data.lock().await;
        data.tables.retain(|t| t.meta.name != table.meta.name);
        data.tables.push(table);
        data.tables.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
    }

    pub async fn add_view(&self, name: impl Into<String>, definition: impl Into<String>) {
        self.data.lock().await.views.push(ViewDefinition {
            name: name.into(),
            definition: definition.into(),
        });
    }

    /// Fail reads of the chunk of `table` that holds integer key `key`.
    ///
    /// `times` of `None` fails every read.
    pub async fn fail_reads(&self, table: &str, key: i64, fault: Fault, times: Option<u32>) {
        self.data.lock().await.read_faults.push((
            table.to_string(),
            key,
            ArmedFault {
                fault,
                remaining: times,
            },
        ));
    }

    /// Number of chunk reads started so far.
    pub async fn reads(&self) -> u64 {
        self.data.lock().await.reads
    }

    async fn with_table<T>(&self, name: &str, f: impl FnOnce(&MemoryTable) -> Result<T>) -> Result<T> {
        let data = self.data.lock().await;
        let table = data
            .tables
            .iter()
            .find(|t| t.meta.name == name)
            .ok_or_else(|| MigrateError::State(format!("no source table {}", name)))?;
        f(table)
    }

    async fn chunk_rows(&self, request: &ChunkRead) -> Result<Vec<Row>> {
        let mut data = self.data.lock().await;
        data.reads += 1;

        for (table, key, armed) in data.read_faults.iter_mut() {
            if *table == request.table && request.selection.contains_key(*key) {
                if let Some(fault) = armed.fire() {
                    return Err(fault.to_error(&request.table));
                }
            }
        }

        let table = data
            .tables
            .iter()
            .find(|t| t.meta.name == request.table)
            .ok_or_else(|| MigrateError::State(format!("no source table {}", request.table)))?;
        table.select(&request.selection)
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let data = self.data.lock().await;
        Ok(data.tables.iter().map(|t| t.meta.name.clone()).collect())
    }

    async fn describe_table(&self, table: &str) -> Result<SourceTable> {
        self.with_table(table, |t| {
            let mut meta = t.meta.clone();
            meta.row_estimate = t.estimate.unwrap_or(t.rows.len() as i64);
            Ok(meta)
        })
        .await
    }

    async fn list_views(&self) -> Result<Vec<ViewDefinition>> {
        Ok(self.data.lock().await.views.clone())
    }

    async fn key_bounds(&self, table: &str, column: &str) -> Result<Option<(i64, i64)>> {
        self.with_table(table, |t| {
            let pos = t.column_position(column)?;
            let keys = t.rows.iter().filter_map(|r| t.key_of(r, pos));
            Ok(keys.fold(None, |acc, k| match acc {
                None => Some((k, k)),
                Some((min, max)) => Some((min.min(k), max.max(k))),
            }))
        })
        .await
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        self.with_table(table, |t| Ok(t.rows.len() as i64)).await
    }

    fn read_chunk(&self, request: ChunkRead) -> mpsc::Receiver<Result<Vec<Row>>> {
        let (tx, rx) = mpsc::channel(request.read_ahead.max(1));
        let source = self.clone();

        tokio::spawn(async move {
            let rows = match source.chunk_rows(&request).await {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            for batch in rows.chunks(request.batch_size.max(1)) {
                if tx.send(Ok(batch.to_vec())).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

// ===== Target =====

#[derive(Debug, Default)]
struct TargetData {
    /// Every statement executed successfully, in order.
    statements: Vec<String>,
    /// Loaded COPY lines per `schema.table`.
    rows: HashMap<String, Vec<String>>,
    /// (schema, constraint or index name) -> owning table.
    objects: HashMap<(String, String), String>,
    /// Substring -> fault.
    statement_faults: Vec<(String, ArmedFault)>,
    load_faults: Vec<(String, ArmedFault)>,
}

impl TargetData {
    fn check_faults(&mut self, sql: &str) -> Result<()> {
        for (pattern, armed) in self.statement_faults.iter_mut() {
            if sql.contains(pattern.as_str()) {
                if let Some(fault) = armed.fire() {
                    let table = statement_table(sql).unwrap_or_else(|| pattern.clone());
                    return Err(fault.to_error(&table));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, sql: &str) {
        if let Some((schema, name, table)) = created_object(sql) {
            self.objects.insert((schema, name), table);
        }
        self.statements.push(sql.to_string());
    }
}

/// Double-quoted identifiers in `sql` as `(start, end, name)`, where the
/// offsets span the quotes.
fn quoted_identifiers(sql: &str) -> Vec<(usize, usize, String)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'"' {
            i += 1;
            continue;
        }
        let start = i;
        let mut name = String::new();
        let mut j = i + 1;
        loop {
            let Some(k) = sql[j..].find('"') else {
                return found;
            };
            let quote = j + k;
            name.push_str(&sql[j..quote]);
            if bytes.get(quote + 1) == Some(&b'"') {
                name.push('"');
                j = quote + 2;
            } else {
                found.push((start, quote + 1, name));
                i = quote + 1;
                break;
            }
        }
    }
    found
}

/// Table of the first `"schema"."table"` reference in a statement.
fn statement_table(sql: &str) -> Option<String> {
    quoted_identifiers(sql)
        .windows(2)
        .find(|w| &sql[w[0].1..w[1].0] == ".")
        .map(|w| w[1].2.clone())
}

/// `(schema, name, table)` of the constraint or index a statement creates.
fn created_object(sql: &str) -> Option<(String, String, String)> {
    let idents = quoted_identifiers(sql);
    if sql.starts_with("ALTER TABLE") && sql.contains(" ADD CONSTRAINT ") && idents.len() >= 3 {
        return Some((idents[0].2.clone(), idents[2].2.clone(), idents[1].2.clone()));
    }
    if sql.starts_with("CREATE INDEX") && idents.len() >= 3 {
        return Some((idents[1].2.clone(), idents[0].2.clone(), idents[2].2.clone()));
    }
    None
}

/// In-memory `TargetWriter` that records DDL and keeps loaded rows as COPY lines.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    data: Arc<Mutex<TargetData>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail statements containing `pattern`.
    pub async fn fail_statements(&self, pattern: &str, fault: Fault, times: Option<u32>) {
        self.data.lock().await.statement_faults.push((
            pattern.to_string(),
            ArmedFault {
                fault,
                remaining: times,
            },
        ));
    }

    /// Fail chunk loads into `table`.
    pub async fn fail_loads(&self, table: &str, fault: Fault, times: Option<u32>) {
        self.data.lock().await.load_faults.push((
            table.to_string(),
            ArmedFault {
                fault,
                remaining: times,
            },
        ));
    }

    /// Statements executed so far.
    pub async fn statements(&self) -> Vec<String> {
        self.data.lock().await.statements.clone()
    }

    /// COPY lines loaded into a table.
    pub async fn rows(&self, schema: &str, table: &str) -> Vec<String> {
        self.data
            .lock()
            .await
            .rows
            .get(&format!("{}.{}", schema, table))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TargetWriter for MemoryTarget {
    async fn execute(&self, sql: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.check_faults(sql)?;
        data.apply(sql);
        Ok(())
    }

    async fn execute_atomic(&self, statements: &[String]) -> Result<()> {
        let mut data = self.data.lock().await;
        for sql in statements {
            data.check_faults(sql)?;
        }
        for sql in statements {
            data.apply(sql);
        }
        Ok(())
    }

    async fn object_table(&self, schema: &str, name: &str) -> Result<Option<String>> {
        let data = self.data.lock().await;
        Ok(data
            .objects
            .get(&(schema.to_string(), name.to_string()))
            .cloned())
    }

    async fn load_chunk(
        &self,
        load: &ChunkLoad,
        mut data: mpsc::Receiver<Result<Bytes>>,
    ) -> Result<u64> {
        {
            let mut target = self.data.lock().await;
            for (table, armed) in target.load_faults.iter_mut() {
                if *table == load.table {
                    if let Some(fault) = armed.fire() {
                        return Err(fault.to_error(&load.table));
                    }
                }
            }
        }

        // Stage everything first; nothing is visible until the stream ends cleanly
        let mut staged = Vec::new();
        while let Some(item) = data.recv().await {
            let bytes = item?;
            let text = std::str::from_utf8(&bytes)
                .map_err(|e| MigrateError::data(&load.table, e.to_string()))?;
            staged.extend(text.lines().map(str::to_string));
        }

        let rows = staged.len() as u64;
        let mut target = self.data.lock().await;
        target
            .rows
            .entry(format!("{}.{}", load.schema, load.table))
            .or_default()
            .extend(staged);
        if let Some(stmt) = &load.on_commit {
            target.statements.push(stmt.clone());
        }
        Ok(rows)
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        Ok(self.rows(schema, table).await.len() as i64)
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

// ===== Chunk pool =====

/// Chunk store operation a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Claim,
    MarkDone,
    MarkFailed,
    Release,
}

#[derive(Debug, Default)]
struct PoolData {
    next_id: i64,
    chunks: Vec<ChunkRecord>,
    faults: Vec<(StoreOp, ArmedFault)>,
}

impl PoolData {
    fn check_faults(&mut self, op: StoreOp) -> Result<()> {
        for (armed_op, armed) in self.faults.iter_mut() {
            if *armed_op == op {
                if let Some(fault) = armed.fire() {
                    return Err(fault.to_error("chunk pool"));
                }
            }
        }
        Ok(())
    }
}

/// In-memory `ChunkStore`.
#[derive(Debug, Clone, Default)]
pub struct MemoryChunkStore {
    data: Arc<Mutex<PoolData>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail calls of one store operation; the chunk is left untouched.
    pub async fn fail_operations(&self, op: StoreOp, fault: Fault, times: Option<u32>) {
        self.data.lock().await.faults.push((
            op,
            ArmedFault {
                fault,
                remaining: times,
            },
        ));
    }

    /// Snapshot of every chunk, ordered by id.
    pub async fn chunks(&self) -> Vec<ChunkRecord> {
        self.data.lock().await.chunks.clone()
    }

    fn find(chunks: &mut [ChunkRecord], id: i64) -> Result<&mut ChunkRecord> {
        chunks
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| MigrateError::State(format!("unknown chunk id {}", id)))
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn has_chunks(&self, table: &str) -> Result<bool> {
        Ok(self.data.lock().await.chunks.iter().any(|c| c.table == table))
    }

    async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()> {
        let mut data = self.data.lock().await;
        for chunk in chunks {
            let exists = data
                .chunks
                .iter()
                .any(|c| c.table == chunk.table && c.index == chunk.index);
            if exists {
                continue;
            }
            data.next_id += 1;
            let id = data.next_id;
            data.chunks.push(ChunkRecord {
                id,
                table: chunk.table.clone(),
                index: chunk.index,
                selection: chunk.selection.clone(),
                status: ChunkStatus::Pending,
                attempts: 0,
                last_error: None,
            });
        }
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<ChunkRecord>> {
        let mut data = self.data.lock().await;
        data.check_faults(StoreOp::Claim)?;
        Ok(data
            .chunks
            .iter_mut()
            .find(|c| c.status == ChunkStatus::Pending)
            .map(|c| {
                c.status = ChunkStatus::InProgress;
                c.clone()
            }))
    }

    async fn mark_done(&self, id: i64) -> Result<()> {
        let mut data = self.data.lock().await;
        data.check_faults(StoreOp::MarkDone)?;
        let chunk = Self::find(&mut data.chunks, id)?;
        chunk.status = ChunkStatus::Done;
        chunk.last_error = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry: bool,
        max_attempts: u32,
    ) -> Result<ChunkStatus> {
        let mut data = self.data.lock().await;
        data.check_faults(StoreOp::MarkFailed)?;
        let chunk = Self::find(&mut data.chunks, id)?;
        chunk.attempts += 1;
        chunk.last_error = Some(error.to_string());
        chunk.status = status_after_failure(chunk.attempts, retry, max_attempts);
        Ok(chunk.status)
    }

    async fn release(&self, id: i64) -> Result<()> {
        let mut data = self.data.lock().await;
        data.check_faults(StoreOp::Release)?;
        let chunk = Self::find(&mut data.chunks, id)?;
        if chunk.status == ChunkStatus::InProgress {
            chunk.status = ChunkStatus::Pending;
        }
        Ok(())
    }

    async fn requeue_in_progress(&self) -> Result<u64> {
        let mut data = self.data.lock().await;
        let mut n = 0;
        for chunk in data
            .chunks
            .iter_mut()
            .filter(|c| c.status == ChunkStatus::InProgress)
        {
            chunk.status = ChunkStatus::Pending;
            n += 1;
        }
        Ok(n)
    }

    async fn summary(&self) -> Result<PoolSummary> {
        let data = self.data.lock().await;
        let mut summary = PoolSummary::default();
        for chunk in &data.chunks {
            summary.add(chunk.status, 1);
        }
        Ok(summary)
    }

    async fn failures(&self) -> Result<Vec<ChunkRecord>> {
        let data = self.data.lock().await;
        let mut failed: Vec<ChunkRecord> = data
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| (&a.table, a.index).cmp(&(&b.table, b.index)));
        Ok(failed)
    }

    async fn truncate(&self) -> Result<()> {
        let mut data = self.data.lock().await;
        data.chunks.clear();
        data.next_id = 0;
        Ok(())
    }

    async fn drop_store(&self) -> Result<()> {
        self.truncate().await
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

// ===== Phase state =====

#[derive(Debug, Default)]
struct PhaseData {
    state: Option<PhaseState>,
    items: HashSet<(PhaseFlag, String)>,
}

/// In-memory `PhaseStore`.
#[derive(Debug, Clone, Default)]
pub struct MemoryPhaseStore {
    data: Arc<Mutex<PhaseData>>,
}

impl MemoryPhaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PhaseStore for MemoryPhaseStore {
    async fn ensure(&self, config_hash: &str, run_id: &str) -> Result<PhaseState> {
        let mut data = self.data.lock().await;
        Ok(data
            .state
            .get_or_insert_with(|| PhaseState::new(config_hash, run_id))
            .clone())
    }

    async fn load(&self) -> Result<Option<PhaseState>> {
        Ok(self.data.lock().await.state.clone())
    }

    async fn set(&self, flag: PhaseFlag) -> Result<()> {
        match self.data.lock().await.state.as_mut() {
            Some(state) => {
                state.set(flag);
                Ok(())
            }
            None => Err(MigrateError::State("phase state not initialized".into())),
        }
    }

    async fn completed_items(&self, flag: PhaseFlag) -> Result<HashSet<String>> {
        let data = self.data.lock().await;
        Ok(data
            .items
            .iter()
            .filter(|(f, _)| *f == flag)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn mark_item(&self, flag: PhaseFlag, item: &str) -> Result<()> {
        self.data.lock().await.items.insert((flag, item.to_string()));
        Ok(())
    }

    fn item_statement(&self, _flag: PhaseFlag, _item: &str) -> Option<String> {
        None
    }

    async fn clear_items(&self) -> Result<()> {
        self.data.lock().await.items.clear();
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut data = self.data.lock().await;
        data.state = None;
        data.items.clear();
        Ok(())
    }

    async fn drop_store(&self) -> Result<()> {
        self.clear().await
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::split_key_range;

    fn numbered(n: i64) -> MemoryTable {
        MemoryTable::new(
            "items",
            vec![
                SourceColumn::new("id", "int", "int(11)").auto_increment(),
                SourceColumn::new("name", "varchar", "varchar(20)"),
            ],
        )
        .index(IndexDescriptor::primary(["id"]))
        .rows(
            (1..=n)
                .map(|i| vec![SourceValue::text(i.to_string()), SourceValue::text(format!("n{}", i))])
                .collect(),
        )
    }

    fn read(selection: ChunkSelection) -> ChunkRead {
        ChunkRead {
            table: "items".into(),
            columns: vec!["id".into(), "name".into()],
            select_list: vec![],
            raw_bytes: vec![false, false],
            selection,
            batch_size: 3,
            read_ahead: 2,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<Result<Vec<Row>>>) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(batch) = rx.recv().await {
            rows.extend(batch?);
        }
        Ok(rows)
    }

    #[tokio::test]
    async fn test_key_range_reads_partition_rows() {
        let source = MemorySource::new();
        source.add_table(numbered(10)).await;
        assert_eq!(source.key_bounds("items", "id").await.unwrap(), Some((1, 10)));

        let mut total = 0;
        for selection in split_key_range("id", 1, 10, 3) {
            total += drain(source.read_chunk(read(selection))).await.unwrap().len();
        }
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn test_read_fault_fires_limited_times() {
        let source = MemorySource::new();
        source.add_table(numbered(5)).await;
        source.fail_reads("items", 3, Fault::Transient, Some(1)).await;

        let first = drain(source.read_chunk(read(ChunkSelection::Full))).await;
        assert!(matches!(first, Err(MigrateError::Interrupted { .. })));
        let second = drain(source.read_chunk(read(ChunkSelection::Full))).await;
        assert_eq!(second.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_no_rows() {
        let target = MemoryTarget::new();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"1\ta\n"))).await.unwrap();
        tx.send(Err(MigrateError::data("items", "bad"))).await.unwrap();
        drop(tx);

        let load = ChunkLoad {
            schema: "public".into(),
            table: "items".into(),
            columns: vec!["id".into(), "name".into()],
            on_commit: None,
        };
        assert!(target.load_chunk(&load, rx).await.is_err());
        assert_eq!(target.row_count("public", "items").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_chunk_store_claims_each_chunk_once() {
        let store = MemoryChunkStore::new();
        let chunks: Vec<NewChunk> = (0..3)
            .map(|i| NewChunk {
                table: "items".into(),
                index: i,
                selection: ChunkSelection::Full,
            })
            .collect();
        store.insert_chunks(&chunks).await.unwrap();
        store.insert_chunks(&chunks).await.unwrap();

        let mut ids = Vec::new();
        while let Some(chunk) = store.claim_next().await.unwrap() {
            ids.push(chunk.id);
        }
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(store.requeue_in_progress().await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_share_a_chunk() {
        let store = MemoryChunkStore::new();
        let chunks: Vec<NewChunk> = (0..100)
            .map(|i| NewChunk {
                table: "items".into(),
                index: i,
                selection: ChunkSelection::Full,
            })
            .collect();
        store.insert_chunks(&chunks).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(chunk) = store.claim_next().await.unwrap() {
                    claimed.push(chunk.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.extend(handle.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=100).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_store_fault_leaves_chunk_untouched() {
        let store = MemoryChunkStore::new();
        store
            .insert_chunks(&[NewChunk {
                table: "items".into(),
                index: 0,
                selection: ChunkSelection::Full,
            }])
            .await
            .unwrap();
        store
            .fail_operations(StoreOp::Release, Fault::Exhausted, Some(1))
            .await;

        let chunk = store.claim_next().await.unwrap().unwrap();
        assert!(matches!(
            store.release(chunk.id).await,
            Err(MigrateError::PoolExhausted { .. })
        ));
        assert_eq!(store.chunks().await[0].status, ChunkStatus::InProgress);
        store.release(chunk.id).await.unwrap();
        assert_eq!(store.chunks().await[0].status, ChunkStatus::Pending);
    }

    #[tokio::test]
    async fn test_atomic_execute_is_all_or_nothing() {
        let target = MemoryTarget::new();
        target
            .fail_statements("steps", Fault::Transient, Some(1))
            .await;
        let statements = vec![
            "UPDATE \"public\".\"files\" SET \"body\" = NULL".to_string(),
            "INSERT INTO \"public\".\"steps\" VALUES ('files')".to_string(),
        ];

        assert!(target.execute_atomic(&statements).await.is_err());
        assert!(target.statements().await.is_empty());

        target.execute_atomic(&statements).await.unwrap();
        assert_eq!(target.statements().await, statements);
    }

    #[tokio::test]
    async fn test_statement_fault_names_the_table() {
        let target = MemoryTarget::new();
        target
            .fail_statements("SET \"body\"", Fault::Transient, Some(1))
            .await;

        let err = target
            .execute("UPDATE \"public\".\"b_files\" SET \"body\" = NULL")
            .await
            .unwrap_err();
        assert!(matches!(&err, MigrateError::Interrupted { table, .. } if table == "b_files"));
    }

    #[test]
    fn test_quoted_identifiers_unescape_quotes() {
        let idents = quoted_identifiers("CREATE INDEX \"odd\"\"name\" ON \"s\".\"t\" (\"c\")");
        let names: Vec<&str> = idents.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(names, vec!["odd\"name", "s", "t", "c"]);
        assert_eq!(
            created_object("CREATE INDEX \"ix\" ON \"s\".\"t\" (\"c\")"),
            Some(("s".to_string(), "ix".to_string(), "t".to_string()))
        );
        assert_eq!(statement_table("COMMENT ON TABLE \"s\".\"t\" IS 'x'").as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_phase_items_are_scoped_and_cleared() {
        let phases = MemoryPhaseStore::new();
        assert!(phases.set(PhaseFlag::DataLoaded).await.is_err());

        phases.ensure("hash", "run").await.unwrap();
        phases.mark_item(PhaseFlag::BinaryDecoded, "files").await.unwrap();
        phases.mark_item(PhaseFlag::BinaryDecoded, "files").await.unwrap();

        let decoded = phases.completed_items(PhaseFlag::BinaryDecoded).await.unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(decoded.contains("files"));
        assert!(phases
            .completed_items(PhaseFlag::ConstraintsApplied)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(phases.item_statement(PhaseFlag::BinaryDecoded, "files"), None);

        phases.clear().await.unwrap();
        assert!(phases
            .completed_items(PhaseFlag::BinaryDecoded)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_retries_until_ceiling() {
        let store = MemoryChunkStore::new();
        store
            .insert_chunks(&[NewChunk {
                table: "items".into(),
                index: 0,
                selection: ChunkSelection::Full,
            }])
            .await
            .unwrap();

        assert_eq!(store.mark_failed(1, "e1", true, 2).await.unwrap(), ChunkStatus::Pending);
        assert_eq!(store.mark_failed(1, "e2", true, 2).await.unwrap(), ChunkStatus::Failed);
        let failures = store.failures().await.unwrap();
        assert_eq!(failures[0].attempts, 2);
        assert_eq!(failures[0].last_error.as_deref(), Some("e2"));
    }
}
