//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    if !matches!(
        config.source.ssl_mode.to_lowercase().as_str(),
        "disabled" | "preferred" | "required"
    ) {
        return Err(MigrateError::Config(format!(
            "source.ssl_mode must be one of disabled, preferred, required, got '{}'",
            config.source.ssl_mode
        )));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.schema.is_empty() {
        return Err(MigrateError::Config("target.schema is required".into()));
    }

    // Same host and port would mean the same server instance
    if config.source.host == config.target.host && config.source.port == config.target.port {
        return Err(MigrateError::Config(
            "source and target cannot be the same server".into(),
        ));
    }

    // Migration config validation - only check if explicitly set
    let migration = &config.migration;
    if let Some(0) = migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.ddl_workers {
        return Err(MigrateError::Config(
            "migration.ddl_workers must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.batch_size {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.read_ahead {
        return Err(MigrateError::Config(
            "migration.read_ahead must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.chunk_byte_budget {
        return Err(MigrateError::Config(
            "migration.chunk_byte_budget must be at least 1".into(),
        ));
    }
    if matches!(migration.small_table_threshold, Some(n) if n < 0) {
        return Err(MigrateError::Config(
            "migration.small_table_threshold cannot be negative".into(),
        ));
    }
    if migration.max_attempts == 0 {
        return Err(MigrateError::Config(
            "migration.max_attempts must be at least 1".into(),
        ));
    }

    Ok(())
}
