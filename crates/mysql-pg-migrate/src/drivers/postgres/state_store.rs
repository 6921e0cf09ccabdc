//! Phase flags persisted in the target database.
//!
//! The state table holds a single row (`id = 1`). Each flag is its own
//! boolean column so setting one is a single-row `UPDATE`. Per-table
//! markers live in a second table keyed by `(phase, item)`.

use std::collections::HashSet;

use async_trait::async_trait;
use deadpool_postgres::Pool;

use super::relation_exists;
use crate::core::identifier::{qualify_pg, quote_literal, quote_pg};
use crate::error::{MigrateError, Result};
use crate::state::{phase_flag_to_str, PhaseFlag, PhaseState, PhaseStore};
use crate::structure::ARTIFACT_PREFIX;

/// `PhaseStore` over the `_mysql_pg_migrate_state` and
/// `_mysql_pg_migrate_steps` tables.
pub struct PgPhaseStore {
    pool: Pool,
    schema: String,
    table: String,
    steps: String,
}

impl PgPhaseStore {
    pub fn new(pool: Pool, schema: &str) -> Result<Self> {
        Ok(Self {
            pool,
            schema: schema.to_string(),
            table: qualify_pg(schema, &format!("{}state", ARTIFACT_PREFIX))?,
            steps: qualify_pg(schema, &format!("{}steps", ARTIFACT_PREFIX))?,
        })
    }

    fn mark_item_sql(&self, flag: PhaseFlag, item: &str) -> String {
        format!(
            "INSERT INTO {} (phase, item) VALUES ({}, {}) ON CONFLICT (phase, item) DO NOTHING",
            self.steps,
            quote_literal(phase_flag_to_str(flag)),
            quote_literal(item)
        )
    }

    async fn create_table(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};
                 CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    run_id TEXT NOT NULL,
                    config_hash TEXT NOT NULL,
                    structure_loaded BOOLEAN NOT NULL DEFAULT FALSE,
                    data_loaded BOOLEAN NOT NULL DEFAULT FALSE,
                    binary_decoded BOOLEAN NOT NULL DEFAULT FALSE,
                    constraints_applied BOOLEAN NOT NULL DEFAULT FALSE,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                 );
                 CREATE TABLE IF NOT EXISTS {steps} (
                    phase TEXT NOT NULL,
                    item TEXT NOT NULL,
                    done_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (phase, item)
                 )",
                schema = quote_pg(&self.schema)?,
                table = self.table,
                steps = self.steps
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PhaseStore for PgPhaseStore {
    async fn ensure(&self, config_hash: &str, run_id: &str) -> Result<PhaseState> {
        self.create_table().await?;
        {
            let client = self.pool.get().await?;
            client
                .execute(
                    &format!(
                        "INSERT INTO {} (id, run_id, config_hash) VALUES (1, $1, $2)
                         ON CONFLICT (id) DO NOTHING",
                        self.table
                    ),
                    &[&run_id, &config_hash],
                )
                .await?;
        }
        Ok(self
            .load()
            .await?
            .unwrap_or_else(|| PhaseState::new(config_hash, run_id)))
    }

    async fn load(&self) -> Result<Option<PhaseState>> {
        if !relation_exists(&self.pool, &self.table).await? {
            return Ok(None);
        }
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT run_id, config_hash, structure_loaded, data_loaded,
                            binary_decoded, constraints_applied
                     FROM {} WHERE id = 1",
                    self.table
                ),
                &[],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PhaseState {
            run_id: row.try_get("run_id")?,
            config_hash: row.try_get("config_hash")?,
            structure_loaded: row.try_get("structure_loaded")?,
            data_loaded: row.try_get("data_loaded")?,
            binary_decoded: row.try_get("binary_decoded")?,
            constraints_applied: row.try_get("constraints_applied")?,
        }))
    }

    async fn set(&self, flag: PhaseFlag) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                &format!(
                    "UPDATE {} SET {} = TRUE, updated_at = NOW() WHERE id = 1",
                    self.table,
                    phase_flag_to_str(flag)
                ),
                &[],
            )
            .await?;
        expect_state_row(updated, flag)
    }

    async fn completed_items(&self, flag: PhaseFlag) -> Result<HashSet<String>> {
        if !relation_exists(&self.pool, &self.steps).await? {
            return Ok(HashSet::new());
        }
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!("SELECT item FROM {} WHERE phase = $1", self.steps),
                &[&phase_flag_to_str(flag)],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(MigrateError::Target))
            .collect()
    }

    async fn mark_item(&self, flag: PhaseFlag, item: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&self.mark_item_sql(flag, item))
            .await?;
        Ok(())
    }

    fn item_statement(&self, flag: PhaseFlag, item: &str) -> Option<String> {
        Some(self.mark_item_sql(flag, item))
    }

    async fn clear_items(&self) -> Result<()> {
        self.create_table().await?;
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!("DELETE FROM {}", self.steps))
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.create_table().await?;
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!(
                "DELETE FROM {} WHERE id = 1; DELETE FROM {}",
                self.table, self.steps
            ))
            .await?;
        Ok(())
    }

    async fn drop_store(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!(
                "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {}",
                self.steps, self.table
            ))
            .await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

/// A flag update that touched no row means the state row is gone, and the
/// flag was not recorded.
fn expect_state_row(updated: u64, flag: PhaseFlag) -> Result<()> {
    if updated == 0 {
        return Err(MigrateError::State(format!(
            "cannot set {}: phase state row is missing",
            phase_flag_to_str(flag)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_update_requires_state_row() {
        let err = expect_state_row(0, PhaseFlag::DataLoaded).unwrap_err();
        assert!(matches!(err, MigrateError::State(_)));
        assert!(err.to_string().contains("data_loaded"));
        assert!(expect_state_row(1, PhaseFlag::DataLoaded).is_ok());
    }
}
