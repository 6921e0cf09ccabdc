//! PostgreSQL target writer implementation.
//!
//! Implements the `TargetWriter` trait. Uses deadpool-postgres for
//! connection pooling and text-format COPY for bulk loads.

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::Pool;
use futures::SinkExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::{ChunkLoad, TargetWriter};
use crate::error::Result;

/// PostgreSQL target writer implementation.
pub struct PostgresWriter {
    pool: Pool,
}

impl PostgresWriter {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Owning table of a named constraint, or of a named index.
const OBJECT_OWNER_QUERY: &str = "\
    SELECT t.relname::text FROM pg_constraint c
    JOIN pg_class t ON t.oid = c.conrelid
    JOIN pg_namespace n ON n.oid = c.connamespace
    WHERE n.nspname = $1 AND c.conname = $2
    UNION ALL
    SELECT t.relname::text FROM pg_index x
    JOIN pg_class i ON i.oid = x.indexrelid
    JOIN pg_class t ON t.oid = x.indrelid
    JOIN pg_namespace n ON n.oid = i.relnamespace
    WHERE n.nspname = $1 AND i.relname = $2
    LIMIT 1";

/// `COPY ... FROM STDIN` statement for a chunk load.
pub fn copy_statement(load: &ChunkLoad) -> Result<String> {
    let columns = load
        .columns
        .iter()
        .map(|c| quote_pg(c))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!(
        "COPY {} ({}) FROM STDIN",
        qualify_pg(&load.schema, &load.table)?,
        columns.join(", ")
    ))
}

#[async_trait]
impl TargetWriter for PostgresWriter {
    async fn execute(&self, sql: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn execute_atomic(&self, statements: &[String]) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        for sql in statements {
            tx.batch_execute(sql).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn object_table(&self, schema: &str, name: &str) -> Result<Option<String>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(OBJECT_OWNER_QUERY, &[&schema, &name])
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get(0)?)),
            None => Ok(None),
        }
    }

    async fn load_chunk(
        &self,
        load: &ChunkLoad,
        mut data: mpsc::Receiver<Result<Bytes>>,
    ) -> Result<u64> {
        let copy_sql = copy_statement(load)?;
        let mut client = self.pool.get().await?;

        // Dropping the transaction (any early return) rolls the chunk back
        let tx = client.transaction().await?;
        let sink = tx.copy_in::<_, Bytes>(&copy_sql).await?;
        tokio::pin!(sink);

        while let Some(item) = data.recv().await {
            sink.send(item?).await?;
        }
        let rows = sink.as_mut().finish().await?;

        if let Some(stmt) = &load.on_commit {
            tx.batch_execute(stmt).await?;
        }
        tx.commit().await?;

        debug!("Loaded {} rows into {}.{}", rows, load.schema, load.table);
        Ok(rows)
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!("SELECT COUNT(*) FROM {}", qualify_pg(schema, table)?),
                &[],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_statement() {
        let load = ChunkLoad {
            schema: "app".into(),
            table: "orders".into(),
            columns: vec!["id".into(), "total".into()],
            on_commit: None,
        };
        assert_eq!(
            copy_statement(&load).unwrap(),
            "COPY \"app\".\"orders\" (\"id\", \"total\") FROM STDIN"
        );
    }
}
