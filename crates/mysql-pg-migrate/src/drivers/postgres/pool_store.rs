//! Chunk pool persisted in the target database.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tracing::debug;

use super::relation_exists;
use crate::core::identifier::qualify_pg;
use crate::error::Result;
use crate::pool::{
    chunk_status_to_str, str_to_chunk_status, ChunkRecord, ChunkStatus, ChunkStore, NewChunk,
    PoolSummary,
};
use crate::structure::ARTIFACT_PREFIX;

const RECORD_COLUMNS: &str =
    "id, table_name, chunk_index, selection, status, attempts, last_error";

/// `ChunkStore` over the `_mysql_pg_migrate_pool` table.
pub struct PgChunkStore {
    pool: Pool,
    schema: String,
    table: String,
}

impl PgChunkStore {
    pub fn new(pool: Pool, schema: &str) -> Result<Self> {
        Ok(Self {
            pool,
            schema: schema.to_string(),
            table: qualify_pg(schema, &format!("{}pool", ARTIFACT_PREFIX))?,
        })
    }

    fn row_to_record(row: &tokio_postgres::Row) -> Result<ChunkRecord> {
        let selection: String = row.try_get("selection")?;
        let status: String = row.try_get("status")?;
        Ok(ChunkRecord {
            id: row.try_get("id")?,
            table: row.try_get("table_name")?,
            index: row.try_get("chunk_index")?,
            selection: serde_json::from_str(&selection)?,
            status: str_to_chunk_status(&status)?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl ChunkStore for PgChunkStore {
    async fn init(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};
                 CREATE TABLE IF NOT EXISTS {table} (
                    id BIGSERIAL PRIMARY KEY,
                    table_name TEXT NOT NULL,
                    chunk_index INTEGER NOT NULL,
                    selection TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'in_progress', 'done', 'failed')),
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    UNIQUE (table_name, chunk_index)
                 )",
                schema = crate::core::identifier::quote_pg(&self.schema)?,
                table = self.table
            ))
            .await?;
        Ok(())
    }

    async fn has_chunks(&self, table: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "SELECT EXISTS (SELECT 1 FROM {} WHERE table_name = $1)",
                    self.table
                ),
                &[&table],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let stmt = tx
            .prepare(&format!(
                "INSERT INTO {} (table_name, chunk_index, selection)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (table_name, chunk_index) DO NOTHING",
                self.table
            ))
            .await?;

        for chunk in chunks {
            let selection = serde_json::to_string(&chunk.selection)?;
            tx.execute(&stmt, &[&chunk.table, &chunk.index, &selection])
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<ChunkRecord>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE {table} SET status = 'in_progress', updated_at = NOW()
                     WHERE id = (
                        SELECT id FROM {table}
                        WHERE status = 'pending'
                        ORDER BY id
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                     )
                     RETURNING {cols}",
                    table = self.table,
                    cols = RECORD_COLUMNS
                ),
                &[],
            )
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn mark_done(&self, id: i64) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                &format!(
                    "UPDATE {} SET status = 'done', last_error = NULL, updated_at = NOW() WHERE id = $1",
                    self.table
                ),
                &[&id],
            )
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry: bool,
        max_attempts: u32,
    ) -> Result<ChunkStatus> {
        let client = self.pool.get().await?;
        let max_attempts = max_attempts.min(i32::MAX as u32) as i32;
        let row = client
            .query_one(
                &format!(
                    "UPDATE {} SET
                        attempts = attempts + 1,
                        last_error = $2,
                        status = CASE WHEN $3 AND attempts + 1 < $4 THEN 'pending' ELSE 'failed' END,
                        updated_at = NOW()
                     WHERE id = $1
                     RETURNING status",
                    self.table
                ),
                &[&id, &error, &retry, &max_attempts],
            )
            .await?;
        let status: String = row.try_get(0)?;
        str_to_chunk_status(&status)
    }

    async fn release(&self, id: i64) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                &format!(
                    "UPDATE {} SET status = 'pending', updated_at = NOW()
                     WHERE id = $1 AND status = 'in_progress'",
                    self.table
                ),
                &[&id],
            )
            .await?;
        Ok(())
    }

    async fn requeue_in_progress(&self) -> Result<u64> {
        let client = self.pool.get().await?;
        let n = client
            .execute(
                &format!(
                    "UPDATE {} SET status = 'pending', updated_at = NOW() WHERE status = 'in_progress'",
                    self.table
                ),
                &[],
            )
            .await?;
        Ok(n)
    }

    async fn summary(&self) -> Result<PoolSummary> {
        let mut summary = PoolSummary::default();
        if !relation_exists(&self.pool, &self.table).await? {
            return Ok(summary);
        }

        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT status, COUNT(*) FROM {} GROUP BY status",
                    self.table
                ),
                &[],
            )
            .await?;
        for row in rows {
            let status: String = row.try_get(0)?;
            let count: i64 = row.try_get(1)?;
            summary.add(str_to_chunk_status(&status)?, count.max(0) as u64);
        }
        Ok(summary)
    }

    async fn failures(&self) -> Result<Vec<ChunkRecord>> {
        if !relation_exists(&self.pool, &self.table).await? {
            return Ok(Vec::new());
        }
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM {} WHERE status = $1 ORDER BY table_name, chunk_index",
                    RECORD_COLUMNS, self.table
                ),
                &[&chunk_status_to_str(ChunkStatus::Failed)],
            )
            .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn truncate(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!("TRUNCATE TABLE {} RESTART IDENTITY", self.table))
            .await?;
        debug!("Truncated chunk pool");
        Ok(())
    }

    async fn drop_store(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS {}", self.table))
            .await?;
        Ok(())
    }

    fn completion_statement(&self, id: i64) -> Option<String> {
        Some(format!(
            "UPDATE {} SET status = 'done', last_error = NULL, updated_at = NOW() WHERE id = {}",
            self.table, id
        ))
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
