//! Structure Loader: source metadata in, target tables and views out.
//!
//! Tables are created with columns (and auto-increment sequences) only.
//! Keys, indexes, and foreign keys are left to the Constraints Processor so
//! the bulk load runs against bare heaps.

mod ddl;
mod views;

pub use ddl::{sequence_name, table_statements, translate_default};
pub use views::{create_views, translate_view, ViewFailure};

use std::sync::Arc;

use tracing::{debug, info};

use crate::core::fanout::run_bounded;
use crate::core::identifier::quote_pg;
use crate::core::{
    ColumnDescriptor, SourceReader, SourceTable, TableDescriptor, TargetWriter, ViewDefinition,
};
use crate::error::{MigrateError, Result};
use crate::typemap::map_column;

/// Prefix of the engine's own bookkeeping tables in the target schema.
pub const ARTIFACT_PREFIX: &str = "_mysql_pg_migrate_";

/// Settings for the Structure Loader.
#[derive(Debug, Clone)]
pub struct StructureSettings {
    pub source_database: String,
    pub target_schema: String,
    pub ddl_workers: usize,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub create_views: bool,
}

/// Outcome of applying structure to the target.
#[derive(Debug, Clone, Default)]
pub struct StructureSummary {
    pub tables_created: usize,
    pub views_created: usize,
    pub failed_views: Vec<ViewFailure>,
}

/// Read and resolve the descriptors of every selected source table.
///
/// Fails with `TypeMapping` on the first column whose type has no target
/// equivalent.
pub async fn load_descriptors(
    source: &dyn SourceReader,
    settings: &StructureSettings,
) -> Result<Vec<TableDescriptor>> {
    let names = source.list_tables().await?;
    let mut tables = Vec::new();

    for name in names {
        if !table_selected(&name, &settings.include_tables, &settings.exclude_tables) {
            debug!("Skipping table {} (filtered)", name);
            continue;
        }
        let raw = source.describe_table(&name).await?;
        tables.push(resolve_table(raw)?);
    }

    info!("Loaded {} table descriptors", tables.len());
    Ok(tables)
}

/// Source views to recreate, or none when view creation is disabled.
pub async fn load_views(
    source: &dyn SourceReader,
    settings: &StructureSettings,
) -> Result<Vec<ViewDefinition>> {
    if !settings.create_views {
        return Ok(Vec::new());
    }
    source.list_views().await
}

/// Resolve every column of a source table through the Type Mapper.
pub fn resolve_table(raw: SourceTable) -> Result<TableDescriptor> {
    let mut columns = Vec::with_capacity(raw.columns.len());
    for col in raw.columns {
        let mapping = map_column(&raw.name, &col.name, &col.column_type)?;
        columns.push(ColumnDescriptor {
            name: col.name,
            source: col.column_type,
            nullable: col.nullable,
            default: col.default,
            auto_increment: col.auto_increment,
            comment: col.comment,
            mapping,
        });
    }

    Ok(TableDescriptor {
        target_name: raw.name.clone(),
        source_name: raw.name,
        columns,
        indexes: raw.indexes,
        foreign_keys: raw.foreign_keys,
        row_estimate: raw.row_estimate.max(0),
        avg_row_width: raw.avg_row_width.max(0),
        comment: raw.comment,
    })
}

/// Create the target schema, every table, and then the views.
///
/// Any table failure is fatal and reported as `Structure` naming the table.
/// View failures are collected in the summary.
pub async fn apply_structure(
    target: &Arc<dyn TargetWriter>,
    tables: &[TableDescriptor],
    views: &[ViewDefinition],
    settings: &StructureSettings,
) -> Result<StructureSummary> {
    let schema = &settings.target_schema;
    target
        .execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_pg(schema)?))
        .await
        .map_err(|e| MigrateError::structure(schema.as_str(), e))?;

    // Build every script first so identifier errors surface before any DDL runs
    let mut scripts = Vec::with_capacity(tables.len());
    for table in tables {
        let statements = table_statements(schema, table)
            .map_err(|e| MigrateError::structure(table.target_name.as_str(), e))?;
        scripts.push((table.target_name.clone(), statements));
    }

    info!(
        "Creating {} tables with up to {} concurrent DDL tasks",
        scripts.len(),
        settings.ddl_workers
    );

    let results = run_bounded(settings.ddl_workers, scripts, |(name, statements)| {
        let target = target.clone();
        async move {
            for sql in &statements {
                target
                    .execute(sql)
                    .await
                    .map_err(|e| MigrateError::structure(name.as_str(), e))?;
            }
            debug!("Created table {}", name);
            Ok(())
        }
    })
    .await;

    let mut tables_created = 0;
    for result in results {
        result?;
        tables_created += 1;
    }

    let (views_created, failed_views) =
        create_views(target, views, &settings.source_database, schema).await;

    Ok(StructureSummary {
        tables_created,
        views_created,
        failed_views,
    })
}

/// Whether a table passes the include/exclude filters.
///
/// Patterns are case-insensitive and support `*` wildcards. An empty include
/// list selects everything. The engine's own bookkeeping tables are never
/// selected.
pub fn table_selected(name: &str, include: &[String], exclude: &[String]) -> bool {
    if name.starts_with(ARTIFACT_PREFIX) {
        return false;
    }
    let included = include.is_empty() || include.iter().any(|p| wildcard_match(p, name));
    included && !exclude.iter().any(|p| wildcard_match(p, name))
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let name = name.to_lowercase();
    let parts: Vec<&str> = pattern.split('*').collect();

    if parts.len() == 1 {
        return pattern == name;
    }

    let mut rest = name.as_str();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SourceColumn;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("orders", "Orders"));
        assert!(wildcard_match("log_*", "log_2024"));
        assert!(wildcard_match("*_archive", "orders_archive"));
        assert!(wildcard_match("a*b*c", "axxbyyc"));
        assert!(!wildcard_match("a*b*c", "axxbyy"));
        assert!(!wildcard_match("log_*", "catalog_x"));
    }

    #[test]
    fn test_table_selected() {
        let include = vec!["order*".to_string(), "users".to_string()];
        let exclude = vec!["*_tmp".to_string()];
        assert!(table_selected("orders", &include, &exclude));
        assert!(table_selected("users", &include, &exclude));
        assert!(!table_selected("orders_tmp", &include, &exclude));
        assert!(!table_selected("products", &include, &exclude));
        assert!(table_selected("products", &[], &[]));
        assert!(!table_selected("_mysql_pg_migrate_pool", &[], &[]));
    }

    #[test]
    fn test_resolve_table_rejects_unknown_type() {
        let raw = SourceTable {
            name: "events".into(),
            columns: vec![
                SourceColumn::new("id", "int", "int(11)"),
                SourceColumn::new("shape", "hyperloglog", "hyperloglog"),
            ],
            indexes: vec![],
            foreign_keys: vec![],
            row_estimate: 10,
            avg_row_width: 10,
            comment: None,
        };
        match resolve_table(raw) {
            Err(MigrateError::TypeMapping { table, column, .. }) => {
                assert_eq!(table, "events");
                assert_eq!(column, "shape");
            }
            other => panic!("expected TypeMapping error, got {:?}", other.map(|t| t.source_name)),
        }
    }
}
