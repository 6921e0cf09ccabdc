//! MySQL/MariaDB source reader implementation.
//!
//! Implements the `SourceReader` trait for reading schema metadata and chunk
//! rows from MySQL/MariaDB. Uses SQLx for connection pooling and streams
//! chunk rows through a bounded channel.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::Row as _;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::core::identifier::quote_mysql;
use crate::core::{
    ChunkRead, ForeignKeyDescriptor, IndexDescriptor, IndexKind, Row, SourceColumn,
    SourceColumnType, SourceReader, SourceTable, SourceValue, ViewDefinition,
};
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// MySQL/MariaDB source reader implementation.
pub struct MysqlReader {
    pool: MySqlPool,
    database: String,
}

impl MysqlReader {
    /// Create a new MySQL reader from configuration.
    pub async fn new(config: &SourceConfig, max_conns: usize) -> Result<Self> {
        let ssl_mode = match config.ssl_mode.to_lowercase().as_str() {
            "disabled" => MySqlSslMode::Disabled,
            "required" => MySqlSslMode::Required,
            _ => MySqlSslMode::Preferred,
        };

        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .charset(&config.encoding)
            .ssl_mode(ssl_mode);

        let pool = MySqlPoolOptions::new()
            .max_connections(max_conns as u32)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::pool(e, "creating MySQL source pool"))?;

        // Test connection
        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| MigrateError::pool(e, "testing MySQL source connection"))?;

        info!(
            "Connected to MySQL source: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            database: config.database.clone(),
        })
    }

    async fn load_columns(&self, table: &str) -> Result<Vec<SourceColumn>> {
        // CAST to CHAR: information_schema may report VARBINARY under some collations
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(DATA_TYPE AS CHAR(255)) AS DATA_TYPE,
                CAST(COLUMN_TYPE AS CHAR) AS COLUMN_TYPE,
                CAST(IF(IS_NULLABLE = 'YES', 1, 0) AS SIGNED) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR) AS COLUMN_DEFAULT,
                CAST(IF(EXTRA LIKE '%auto_increment%', 1, 0) AS SIGNED) AS is_auto_increment,
                CAST(COLUMN_COMMENT AS CHAR) AS COLUMN_COMMENT
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let data_type: String = row.try_get("DATA_TYPE")?;
            let column_type: String = row.try_get("COLUMN_TYPE")?;
            let comment: Option<String> = row.try_get("COLUMN_COMMENT")?;
            columns.push(SourceColumn {
                name: row.try_get("COLUMN_NAME")?,
                column_type: SourceColumnType::parse(&data_type, &column_type),
                nullable: row.try_get::<i64, _>("is_nullable")? == 1,
                default: row.try_get("COLUMN_DEFAULT")?,
                auto_increment: row.try_get::<i64, _>("is_auto_increment")? == 1,
                comment: comment.filter(|c| !c.is_empty()),
            });
        }
        Ok(columns)
    }

    async fn load_indexes(&self, table: &str) -> Result<Vec<IndexDescriptor>> {
        let query = r#"
            SELECT
                CAST(INDEX_NAME AS CHAR(255)) AS INDEX_NAME,
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(NON_UNIQUE AS SIGNED) AS NON_UNIQUE,
                CAST(INDEX_TYPE AS CHAR(32)) AS INDEX_TYPE
            FROM INFORMATION_SCHEMA.STATISTICS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY INDEX_NAME = 'PRIMARY' DESC, INDEX_NAME, SEQ_IN_INDEX
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        let mut indexes: Vec<IndexDescriptor> = Vec::new();
        let mut functional: Vec<String> = Vec::new();

        for row in rows {
            let name: String = row.try_get("INDEX_NAME")?;
            // Functional key parts have no column name
            let Some(column): Option<String> = row.try_get("COLUMN_NAME")? else {
                functional.push(name);
                continue;
            };

            match indexes.last_mut() {
                Some(last) if last.name == name => last.columns.push(column),
                _ => {
                    let non_unique: i64 = row.try_get("NON_UNIQUE")?;
                    let index_type: String = row.try_get("INDEX_TYPE")?;
                    let kind = if name == "PRIMARY" {
                        IndexKind::Primary
                    } else if index_type.eq_ignore_ascii_case("FULLTEXT") {
                        IndexKind::FullText
                    } else if index_type.eq_ignore_ascii_case("SPATIAL") {
                        IndexKind::Spatial
                    } else if non_unique == 0 {
                        IndexKind::Unique
                    } else {
                        IndexKind::Plain
                    };
                    indexes.push(IndexDescriptor::new(name, kind, [column]));
                }
            }
        }

        if !functional.is_empty() {
            debug!("{}: skipping functional indexes {:?}", table, functional);
            indexes.retain(|i| !functional.contains(&i.name));
        }
        Ok(indexes)
    }

    async fn load_foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyDescriptor>> {
        let query = r#"
            SELECT
                CAST(rc.CONSTRAINT_NAME AS CHAR(255)) AS CONSTRAINT_NAME,
                CAST(kcu.COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(kcu.REFERENCED_TABLE_NAME AS CHAR(255)) AS REFERENCED_TABLE_NAME,
                CAST(kcu.REFERENCED_COLUMN_NAME AS CHAR(255)) AS REFERENCED_COLUMN_NAME,
                CAST(rc.DELETE_RULE AS CHAR(32)) AS DELETE_RULE,
                CAST(rc.UPDATE_RULE AS CHAR(32)) AS UPDATE_RULE
            FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
                ON rc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA
                AND rc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                AND rc.TABLE_NAME = kcu.TABLE_NAME
            WHERE rc.CONSTRAINT_SCHEMA = ? AND rc.TABLE_NAME = ?
            ORDER BY rc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        let mut foreign_keys: Vec<ForeignKeyDescriptor> = Vec::new();
        for row in rows {
            let name: String = row.try_get("CONSTRAINT_NAME")?;
            let column: String = row.try_get("COLUMN_NAME")?;
            let ref_column: String = row.try_get("REFERENCED_COLUMN_NAME")?;

            match foreign_keys.last_mut() {
                Some(last) if last.name == name => {
                    last.columns.push(column);
                    last.ref_columns.push(ref_column);
                }
                _ => {
                    let mut fk = ForeignKeyDescriptor::new(
                        name,
                        [column],
                        row.try_get::<String, _>("REFERENCED_TABLE_NAME")?,
                        [ref_column],
                    );
                    fk.on_delete = row.try_get("DELETE_RULE")?;
                    fk.on_update = row.try_get("UPDATE_RULE")?;
                    foreign_keys.push(fk);
                }
            }
        }
        Ok(foreign_keys)
    }

    async fn load_stats(&self, table: &str) -> Result<(i64, i64, Option<String>)> {
        let query = r#"
            SELECT
                CAST(COALESCE(TABLE_ROWS, 0) AS SIGNED) AS row_estimate,
                CAST(COALESCE(AVG_ROW_LENGTH, 0) AS SIGNED) AS avg_row_width,
                CAST(TABLE_COMMENT AS CHAR) AS TABLE_COMMENT
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
        "#;

        let row: MySqlRow = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_one(&self.pool)
            .await?;

        let comment: Option<String> = row.try_get("TABLE_COMMENT")?;
        Ok((
            row.try_get("row_estimate")?,
            row.try_get("avg_row_width")?,
            comment.filter(|c| !c.is_empty()),
        ))
    }
}

/// Build the `SELECT` for one chunk.
pub fn chunk_query(request: &ChunkRead) -> Result<String> {
    let select_list = request
        .select_list
        .iter()
        .zip(&request.columns)
        .map(|(expr, col)| Ok(format!("{} AS {}", expr, quote_mysql(col)?)))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    Ok(format!(
        "SELECT {} FROM {}{}",
        select_list,
        quote_mysql(&request.table)?,
        request.selection.to_mysql_clause()?
    ))
}

fn decode_row(row: &MySqlRow, raw_bytes: &[bool]) -> Result<Row> {
    raw_bytes
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            Ok(if *raw {
                SourceValue::from(row.try_get::<Option<Vec<u8>>, _>(i)?)
            } else {
                SourceValue::from(row.try_get::<Option<String>, _>(i)?)
            })
        })
        .collect()
}

async fn stream_chunk(
    pool: MySqlPool,
    request: ChunkRead,
    tx: &mpsc::Sender<Result<Vec<Row>>>,
) -> Result<()> {
    let sql = chunk_query(&request)?;
    debug!("{}: {}", request.table, sql);

    let batch_size = request.batch_size.max(1);
    let mut rows = sqlx::query(&sql).fetch(&pool);
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(row) = rows.try_next().await? {
        batch.push(decode_row(&row, &request.raw_bytes)?);
        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if tx.send(Ok(full)).await.is_err() {
                // Receiver dropped
                return Ok(());
            }
        }
    }

    if !batch.is_empty() {
        let _ = tx.send(Ok(batch)).await;
    }
    Ok(())
}

#[async_trait]
impl SourceReader for MysqlReader {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("TABLE_NAME").map_err(Into::into))
            .collect()
    }

    async fn describe_table(&self, table: &str) -> Result<SourceTable> {
        let columns = self.load_columns(table).await?;
        let indexes = self.load_indexes(table).await?;
        let foreign_keys = self.load_foreign_keys(table).await?;
        let (row_estimate, avg_row_width, comment) = self.load_stats(table).await?;

        debug!(
            "{}: {} columns, {} indexes, {} foreign keys, ~{} rows",
            table,
            columns.len(),
            indexes.len(),
            foreign_keys.len(),
            row_estimate
        );

        Ok(SourceTable {
            name: table.to_string(),
            columns,
            indexes,
            foreign_keys,
            row_estimate,
            avg_row_width,
            comment,
        })
    }

    async fn list_views(&self) -> Result<Vec<ViewDefinition>> {
        let query = r#"
            SELECT
                CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME,
                CAST(VIEW_DEFINITION AS CHAR) AS VIEW_DEFINITION
            FROM INFORMATION_SCHEMA.VIEWS
            WHERE TABLE_SCHEMA = ?
            ORDER BY TABLE_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| {
                Ok(ViewDefinition {
                    name: r.try_get("TABLE_NAME")?,
                    definition: r.try_get("VIEW_DEFINITION")?,
                })
            })
            .collect()
    }

    async fn key_bounds(&self, table: &str, column: &str) -> Result<Option<(i64, i64)>> {
        let col = quote_mysql(column)?;
        let query = format!(
            "SELECT CAST(MIN({col}) AS SIGNED) AS min_key, CAST(MAX({col}) AS SIGNED) AS max_key FROM {}",
            quote_mysql(table)?
        );

        let row: MySqlRow = sqlx::query(&query).fetch_one(&self.pool).await?;
        let min: Option<i64> = row.try_get("min_key")?;
        let max: Option<i64> = row.try_get("max_key")?;
        Ok(min.zip(max))
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let query = format!(
            "SELECT CAST(COUNT(*) AS SIGNED) AS cnt FROM {}",
            quote_mysql(table)?
        );

        let row: MySqlRow = sqlx::query(&query).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("cnt")?)
    }

    fn read_chunk(&self, request: ChunkRead) -> mpsc::Receiver<Result<Vec<Row>>> {
        let (tx, rx) = mpsc::channel(request.read_ahead.max(1));
        let pool = self.pool.clone();

        tokio::spawn(async move {
            if let Err(e) = stream_chunk(pool, request, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mysql"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ChunkSelection;

    #[test]
    fn test_chunk_query() {
        let request = ChunkRead {
            table: "orders".into(),
            columns: vec!["id".into(), "total".into(), "payload".into()],
            select_list: vec![
                "CAST(`id` AS CHAR)".into(),
                "CAST(`total` AS CHAR)".into(),
                "`payload`".into(),
            ],
            raw_bytes: vec![false, false, true],
            selection: ChunkSelection::KeyRange {
                column: "id".into(),
                lower: Some(100),
                upper: None,
            },
            batch_size: 1000,
            read_ahead: 4,
        };
        assert_eq!(
            chunk_query(&request).unwrap(),
            "SELECT CAST(`id` AS CHAR) AS `id`, CAST(`total` AS CHAR) AS `total`, `payload` AS `payload` \
             FROM `orders` WHERE `id` >= 100"
        );
    }
}
