//! Phase store trait for migration phase persistence.
//!
//! The [`PhaseStore`] trait defines the interface for persisting the
//! single-row phase state. Implementations:
//!
//! - **PostgreSQL**: `PgPhaseStore` in `drivers/postgres/state_store.rs`
//! - **Memory**: `MemoryPhaseStore` in `drivers/memory.rs`
//!
//! Besides the flags, a store keeps per-table markers for phases that must
//! not repeat work for a table on resume.
//!
//! The orchestrator works with `Arc<dyn PhaseStore>` without knowing the
//! concrete type.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{PhaseFlag, PhaseState};
use crate::error::{MigrateError, Result};

/// Trait for phase state persistence backends.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
#[async_trait]
pub trait PhaseStore: Send + Sync {
    /// Create the state storage if missing and insert the state row if
    /// there is none, stamped with `config_hash` and `run_id`.
    ///
    /// Returns the persisted state, which belongs to an earlier run when one
    /// exists. Idempotent.
    async fn ensure(&self, config_hash: &str, run_id: &str) -> Result<PhaseState>;

    /// Read the persisted state, if any.
    async fn load(&self) -> Result<Option<PhaseState>>;

    /// Set one flag. Setting an already set flag is a no-op.
    ///
    /// Fails when there is no state row to set it on.
    async fn set(&self, flag: PhaseFlag) -> Result<()>;

    /// Items (target table names) already finished inside a phase that
    /// works table by table.
    async fn completed_items(&self, flag: PhaseFlag) -> Result<HashSet<String>>;

    /// Record an item of a phase as finished. Idempotent.
    async fn mark_item(&self, flag: PhaseFlag, item: &str) -> Result<()>;

    /// A statement recording the item, for stores that live in the target
    /// database. Running it in the same transaction as the item's own work
    /// makes both durable together. `None` when the store is elsewhere.
    fn item_statement(&self, flag: PhaseFlag, item: &str) -> Option<String>;

    /// Forget every item marker.
    async fn clear_items(&self) -> Result<()>;

    /// Delete the state row and the item markers, clearing every flag.
    async fn clear(&self) -> Result<()>;

    /// Remove the state storage itself.
    async fn drop_store(&self) -> Result<()>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

/// Helper function to convert PhaseFlag to its column name.
pub fn phase_flag_to_str(flag: PhaseFlag) -> &'static str {
    match flag {
        PhaseFlag::StructureLoaded => "structure_loaded",
        PhaseFlag::DataLoaded => "data_loaded",
        PhaseFlag::BinaryDecoded => "binary_decoded",
        PhaseFlag::ConstraintsApplied => "constraints_applied",
    }
}

/// Helper function to parse PhaseFlag from string.
pub fn str_to_phase_flag(s: &str) -> Result<PhaseFlag> {
    match s {
        "structure_loaded" => Ok(PhaseFlag::StructureLoaded),
        "data_loaded" => Ok(PhaseFlag::DataLoaded),
        "binary_decoded" => Ok(PhaseFlag::BinaryDecoded),
        "constraints_applied" => Ok(PhaseFlag::ConstraintsApplied),
        _ => Err(MigrateError::State(format!("Invalid phase flag: {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_flag_roundtrip() {
        for flag in PhaseFlag::ALL {
            assert_eq!(str_to_phase_flag(phase_flag_to_str(flag)).unwrap(), flag);
        }
    }

    #[test]
    fn test_invalid_phase_flag() {
        assert!(str_to_phase_flag("indexes_built").is_err());
    }
}
