//! Migration State Manager: persisted phase flags for resumable runs.
//!
//! Each pipeline stage checks its flag first and is skipped when the flag is
//! already set. Flags only move from unset to set; the one way back is an
//! explicit [`StateManager::reset`], which also empties the chunk pool.

mod backend;

pub use backend::{phase_flag_to_str, str_to_phase_flag, PhaseStore};

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MigrateError, Result};
use crate::pool::ChunkStore;

/// One of the ordered phase completion flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseFlag {
    StructureLoaded,
    DataLoaded,
    BinaryDecoded,
    ConstraintsApplied,
}

impl PhaseFlag {
    /// Every flag in phase order.
    pub const ALL: [PhaseFlag; 4] = [
        PhaseFlag::StructureLoaded,
        PhaseFlag::DataLoaded,
        PhaseFlag::BinaryDecoded,
        PhaseFlag::ConstraintsApplied,
    ];
}

/// Persisted phase state (a single row).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    /// Run that created the state row.
    pub run_id: String,
    /// Config hash of that run.
    pub config_hash: String,
    pub structure_loaded: bool,
    pub data_loaded: bool,
    pub binary_decoded: bool,
    pub constraints_applied: bool,
}

impl PhaseState {
    /// A fresh, all-unset state.
    pub fn new(config_hash: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            config_hash: config_hash.into(),
            ..Default::default()
        }
    }

    pub fn is_set(&self, flag: PhaseFlag) -> bool {
        match flag {
            PhaseFlag::StructureLoaded => self.structure_loaded,
            PhaseFlag::DataLoaded => self.data_loaded,
            PhaseFlag::BinaryDecoded => self.binary_decoded,
            PhaseFlag::ConstraintsApplied => self.constraints_applied,
        }
    }

    pub fn set(&mut self, flag: PhaseFlag) {
        match flag {
            PhaseFlag::StructureLoaded => self.structure_loaded = true,
            PhaseFlag::DataLoaded => self.data_loaded = true,
            PhaseFlag::BinaryDecoded => self.binary_decoded = true,
            PhaseFlag::ConstraintsApplied => self.constraints_applied = true,
        }
    }

    /// Every phase has completed.
    pub fn is_complete(&self) -> bool {
        PhaseFlag::ALL.iter().all(|f| self.is_set(*f))
    }
}

/// Phase flag bookkeeping over a [`PhaseStore`].
#[derive(Clone)]
pub struct StateManager {
    phases: Arc<dyn PhaseStore>,
    chunks: Arc<dyn ChunkStore>,
}

impl StateManager {
    pub fn new(phases: Arc<dyn PhaseStore>, chunks: Arc<dyn ChunkStore>) -> Self {
        Self { phases, chunks }
    }

    /// Create the state and pool storage and return the current phase state.
    ///
    /// A persisted state written under a different config hash is rejected
    /// with `ConfigChanged`; resuming it would mix two different migrations.
    pub async fn ensure_state_table(&self, config_hash: &str, run_id: &str) -> Result<PhaseState> {
        let state = self.phases.ensure(config_hash, run_id).await?;
        self.chunks.init().await?;

        if state.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        if state.run_id != run_id {
            info!(
                "Resuming run {} (structure={}, data={}, binary={}, constraints={})",
                state.run_id,
                state.structure_loaded,
                state.data_loaded,
                state.binary_decoded,
                state.constraints_applied
            );
        }
        Ok(state)
    }

    /// Current phase state (all unset when nothing is persisted).
    pub async fn get_phase(&self) -> Result<PhaseState> {
        Ok(self.phases.load().await?.unwrap_or_default())
    }

    /// Durably set a phase flag.
    pub async fn set_phase(&self, flag: PhaseFlag) -> Result<()> {
        self.phases.set(flag).await?;
        debug!("Phase flag set: {}", phase_flag_to_str(flag));
        Ok(())
    }

    /// Tables already finished within `flag`'s phase.
    pub async fn completed_tables(&self, flag: PhaseFlag) -> Result<HashSet<String>> {
        self.phases.completed_items(flag).await
    }

    /// Statement that records `table` as finished within `flag`'s phase
    /// when run in the target transaction doing the table's work.
    pub fn table_done_statement(&self, flag: PhaseFlag, table: &str) -> Option<String> {
        self.phases.item_statement(flag, table)
    }

    pub async fn mark_table_done(&self, flag: PhaseFlag, table: &str) -> Result<()> {
        self.phases.mark_item(flag, table).await
    }

    /// Forget per-table progress; the tables it refers to are being recreated.
    pub async fn clear_table_markers(&self) -> Result<()> {
        self.phases.clear_items().await
    }

    /// Clear every flag and empty the chunk pool.
    pub async fn reset(&self) -> Result<()> {
        self.chunks.init().await?;
        self.chunks.truncate().await?;
        self.phases.clear().await?;
        info!("Migration state reset ({})", self.phases.backend_type());
        Ok(())
    }

    /// Drop the pool and state storage after a fully completed migration.
    pub async fn drop_artifacts(&self) -> Result<()> {
        self.chunks.drop_store().await?;
        self.phases.drop_store().await?;
        info!("Removed migration bookkeeping tables");
        Ok(())
    }
}
