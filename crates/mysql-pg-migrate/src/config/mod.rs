//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 over the settings that decide what lands in the target.
    ///
    /// Tuning knobs (workers, batch sizes, connection counts) are left out so
    /// an interrupted run can be resumed with different parallelism.
    pub fn hash(&self) -> String {
        let identity = (
            &self.source.host,
            self.source.port,
            &self.source.database,
            &self.target.host,
            self.target.port,
            &self.target.database,
            &self.target.schema,
            &self.migration.include_tables,
            &self.migration.exclude_tables,
        );
        let yaml = serde_yaml::to_string(&identity).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl SourceConfig {
    /// Build a MySQL connection URL (password omitted, for logging).
    pub fn display_url(&self) -> String {
        format!(
            "mysql://{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

impl TargetConfig {
    /// Build a connection string for tokio-postgres (password omitted, for logging).
    pub fn display_url(&self) -> String {
        format!(
            "host={} port={} dbname={} user={}",
            self.host, self.port, self.database, self.user
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  host: mysql.internal
  database: shop
  user: root
  password: secret
target:
  host: pg.internal
  database: shop
  user: postgres
  password: secret
migration:
  workers: 6
  max_attempts: 5
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 3306);
        assert_eq!(config.source.encoding, "utf8mb4");
        assert_eq!(config.target.port, 5432);
        assert_eq!(config.target.schema, "public");
        assert_eq!(config.migration.workers, Some(6));
        assert_eq!(config.migration.max_attempts, 5);
        assert!(config.migration.create_foreign_keys);
        assert!(!config.migration.remove_transient_artifacts);
    }

    #[test]
    fn test_hash_ignores_tuning_knobs() {
        let a = Config::from_yaml(YAML).unwrap();
        let mut b = a.clone();
        b.migration.workers = Some(32);
        b.migration.batch_size = Some(1);
        assert_eq!(a.hash(), b.hash());

        b.target.schema = "staging".to_string();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_missing_required_fields_fail() {
        assert!(Config::from_yaml("source:\n  host: x\n").is_err());
    }
}
