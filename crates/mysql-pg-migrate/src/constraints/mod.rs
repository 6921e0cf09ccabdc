//! Constraints Processor: keys, indexes, checks, comments, foreign keys.
//!
//! Runs after the data is loaded and decoded, in stages:
//!
//! 1. primary keys
//! 2. unique constraints
//! 3. plain, composite, and full-text indexes
//! 4. enum/set check constraints (optional)
//! 5. table and column comments
//! 6. foreign keys in dependency order, cycles in a second pass
//! 7. sequence resets past the loaded keys
//!
//! A failing statement is recorded and the rest still run.

mod order;

pub use order::{fk_order, FkOrder};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::fanout::run_bounded;
use crate::core::identifier::{pg_object_name, qualify_pg, quote_literal, quote_pg};
use crate::core::{IndexDescriptor, IndexKind, TableDescriptor, TargetWriter};
use crate::error::{MigrateError, Result};
use crate::structure::sequence_name;
use crate::transfer::retry_transient;
use crate::typemap::CheckCandidate;

/// Settings for the Constraints Processor.
#[derive(Debug, Clone)]
pub struct ConstraintSettings {
    pub target_schema: String,
    pub ddl_workers: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub create_indexes: bool,
    pub create_foreign_keys: bool,
    pub create_comments: bool,
    pub create_enum_checks: bool,
}

/// A constraint that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintFailure {
    pub table: String,
    pub constraint: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstraintSummary {
    pub applied: usize,
    pub failed: usize,
    /// Tables whose foreign keys sit on a reference cycle.
    pub deferred_tables: Vec<String>,
    pub failures: Vec<ConstraintFailure>,
}

impl ConstraintSummary {
    fn record(&mut self, results: Vec<(Statement, Result<()>)>) {
        for (stmt, result) in results {
            match result {
                Ok(()) => self.applied += 1,
                Err(e) => {
                    error!("{} on {} failed: {}", stmt.constraint, stmt.table, e);
                    self.failed += 1;
                    self.failures.push(ConstraintFailure {
                        table: stmt.table,
                        constraint: stmt.constraint,
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

/// One DDL statement and the constraint it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub table: String,
    pub constraint: String,
    pub sql: String,
    /// Name of the constraint or index created, for statements that create one.
    pub object: Option<String>,
}

impl Statement {
    fn new(table: &TableDescriptor, constraint: impl Into<String>, sql: String) -> Self {
        Self {
            table: table.target_name.clone(),
            constraint: constraint.into(),
            sql,
            object: None,
        }
    }

    /// A statement creating the named constraint or index.
    fn creating(table: &TableDescriptor, name: String, sql: String) -> Self {
        Self {
            object: Some(name.clone()),
            ..Self::new(table, name, sql)
        }
    }
}

fn column_list(columns: &[String]) -> Result<String> {
    Ok(columns
        .iter()
        .map(|c| quote_pg(c))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

pub fn primary_key_statement(schema: &str, table: &TableDescriptor) -> Result<Option<Statement>> {
    let Some(pk) = table.primary_key() else {
        return Ok(None);
    };
    let name = pg_object_name(&[&table.target_name, "pkey"]);
    let sql = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
        qualify_pg(schema, &table.target_name)?,
        quote_pg(&name)?,
        column_list(&pk.columns)?
    );
    Ok(Some(Statement::creating(table, name, sql)))
}

pub fn unique_statement(
    schema: &str,
    table: &TableDescriptor,
    index: &IndexDescriptor,
) -> Result<Statement> {
    let name = pg_object_name(&[&table.target_name, &index.name]);
    let sql = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
        qualify_pg(schema, &table.target_name)?,
        quote_pg(&name)?,
        column_list(&index.columns)?
    );
    Ok(Statement::creating(table, name, sql))
}

/// `CREATE INDEX` for a plain or full-text index; `None` for kinds without
/// a target counterpart.
pub fn index_statement(
    schema: &str,
    table: &TableDescriptor,
    index: &IndexDescriptor,
) -> Result<Option<Statement>> {
    let name = pg_object_name(&[&table.target_name, &index.name]);
    let qualified = qualify_pg(schema, &table.target_name)?;

    let sql = match index.kind {
        IndexKind::Plain => format!(
            "CREATE INDEX {} ON {} ({})",
            quote_pg(&name)?,
            qualified,
            column_list(&index.columns)?
        ),
        IndexKind::FullText => {
            let document = index
                .columns
                .iter()
                .map(|c| Ok(format!("coalesce({}, '')", quote_pg(c)?)))
                .collect::<Result<Vec<_>>>()?
                .join(" || ' ' || ");
            format!(
                "CREATE INDEX {} ON {} USING GIN (to_tsvector('simple', {}))",
                quote_pg(&name)?,
                qualified,
                document
            )
        }
        IndexKind::Primary | IndexKind::Unique | IndexKind::Spatial => return Ok(None),
    };
    Ok(Some(Statement::creating(table, name, sql)))
}

/// Check constraints for enum and set columns.
pub fn check_statements(schema: &str, table: &TableDescriptor) -> Result<Vec<Statement>> {
    let mut statements = Vec::new();
    for column in &table.columns {
        let Some(candidate) = &column.mapping.check_candidate else {
            continue;
        };
        let col = quote_pg(&column.name)?;
        let condition = match candidate {
            CheckCandidate::Enum(values) => format!(
                "{} IN ({})",
                col,
                values.iter().map(|v| quote_literal(v)).collect::<Vec<_>>().join(", ")
            ),
            CheckCandidate::Set(values) => format!(
                "{col} = '' OR string_to_array({col}, ',') <@ ARRAY[{}]::text[]",
                values.iter().map(|v| quote_literal(v)).collect::<Vec<_>>().join(", ")
            ),
        };
        let name = pg_object_name(&[&table.target_name, &column.name, "check"]);
        let sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({})",
            qualify_pg(schema, &table.target_name)?,
            quote_pg(&name)?,
            condition
        );
        statements.push(Statement::creating(table, name, sql));
    }
    Ok(statements)
}

pub fn comment_statements(schema: &str, table: &TableDescriptor) -> Result<Vec<Statement>> {
    let qualified = qualify_pg(schema, &table.target_name)?;
    let mut statements = Vec::new();

    if let Some(comment) = table.comment.as_deref().filter(|c| !c.is_empty()) {
        statements.push(Statement::new(
            table,
            format!("comment on {}", table.target_name),
            format!("COMMENT ON TABLE {} IS {}", qualified, quote_literal(comment)),
        ));
    }
    for column in &table.columns {
        if let Some(comment) = column.comment.as_deref().filter(|c| !c.is_empty()) {
            statements.push(Statement::new(
                table,
                format!("comment on {}.{}", table.target_name, column.name),
                format!(
                    "COMMENT ON COLUMN {}.{} IS {}",
                    qualified,
                    quote_pg(&column.name)?,
                    quote_literal(comment)
                ),
            ));
        }
    }
    Ok(statements)
}

/// Map a MySQL referential action to PostgreSQL.
fn referential_action(action: &str) -> &'static str {
    match action.to_uppercase().replace('_', " ").as_str() {
        "CASCADE" => "CASCADE",
        "SET NULL" => "SET NULL",
        "SET DEFAULT" => "SET DEFAULT",
        "RESTRICT" => "RESTRICT",
        _ => "NO ACTION",
    }
}

pub fn foreign_key_statements(
    schema: &str,
    table: &TableDescriptor,
    target_names: &HashMap<&str, &str>,
) -> Result<Vec<Statement>> {
    let mut statements = Vec::new();
    for fk in &table.foreign_keys {
        let ref_table = target_names
            .get(fk.ref_table.as_str())
            .copied()
            .unwrap_or(fk.ref_table.as_str());
        let name = pg_object_name(&[&table.target_name, &fk.name]);
        let sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            qualify_pg(schema, &table.target_name)?,
            quote_pg(&name)?,
            column_list(&fk.columns)?,
            qualify_pg(schema, ref_table)?,
            column_list(&fk.ref_columns)?,
            referential_action(&fk.on_delete),
            referential_action(&fk.on_update)
        );
        statements.push(Statement::creating(table, name, sql));
    }
    Ok(statements)
}

/// Advance the auto-increment sequence past the largest loaded key.
pub fn sequence_reset_statement(schema: &str, table: &TableDescriptor) -> Result<Option<Statement>> {
    let Some(column) = table.auto_increment_column() else {
        return Ok(None);
    };
    let sequence = qualify_pg(schema, &sequence_name(&table.target_name, &column.name))?;
    let sql = format!(
        "SELECT setval({}, COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
        quote_literal(&sequence),
        quote_pg(&column.name)?,
        qualify_pg(schema, &table.target_name)?
    );
    Ok(Some(Statement::new(
        table,
        format!("sequence reset {}", sequence),
        sql,
    )))
}

/// Apply every constraint stage to the target.
///
/// Statement-building errors (bad identifiers) are returned; execution
/// failures are recorded in the summary.
pub async fn apply_constraints(
    target: &Arc<dyn TargetWriter>,
    tables: &[TableDescriptor],
    settings: &ConstraintSettings,
) -> Result<ConstraintSummary> {
    let schema = settings.target_schema.as_str();
    let mut summary = ConstraintSummary::default();

    let mut primary_keys = Vec::new();
    let mut uniques = Vec::new();
    let mut indexes = Vec::new();
    let mut checks = Vec::new();
    let mut comments = Vec::new();
    let mut sequences = Vec::new();

    for table in tables {
        primary_keys.extend(primary_key_statement(schema, table)?);
        if settings.create_indexes {
            for index in &table.indexes {
                match index.kind {
                    IndexKind::Unique => uniques.push(unique_statement(schema, table, index)?),
                    IndexKind::Spatial => {
                        debug!("Skipping spatial index {} on {}", index.name, table.target_name)
                    }
                    _ => indexes.extend(index_statement(schema, table, index)?),
                }
            }
        }
        if settings.create_enum_checks {
            checks.extend(check_statements(schema, table)?);
        }
        if settings.create_comments {
            comments.extend(comment_statements(schema, table)?);
        }
        sequences.extend(sequence_reset_statement(schema, table)?);
    }

    info!("Applying constraints to {} tables", tables.len());
    for (stage, statements) in [
        ("primary keys", primary_keys),
        ("unique constraints", uniques),
        ("indexes", indexes),
        ("check constraints", checks),
        ("comments", comments),
    ] {
        if statements.is_empty() {
            continue;
        }
        debug!("Creating {} {}", statements.len(), stage);
        let results = run_stage(target, statements, settings).await;
        summary.record(results);
    }

    if settings.create_foreign_keys {
        let order = fk_order(tables);
        for table in &order.deferred {
            warn!(
                "Foreign keys of {} are on a reference cycle; creating them in a second pass",
                table
            );
        }

        let by_name: HashMap<&str, &TableDescriptor> =
            tables.iter().map(|t| (t.source_name.as_str(), t)).collect();
        let target_names: HashMap<&str, &str> = tables
            .iter()
            .map(|t| (t.source_name.as_str(), t.target_name.as_str()))
            .collect();

        // Foreign keys lock both tables, so they run one at a time
        for name in order.ordered.iter().chain(&order.deferred) {
            let Some(table) = by_name.get(name.as_str()) else {
                continue;
            };
            for stmt in foreign_key_statements(schema, table, &target_names)? {
                let result = apply_statement(target.as_ref(), &stmt, settings).await;
                summary.record(vec![(stmt, result)]);
            }
        }
        summary.deferred_tables = order.deferred;
    }

    if !sequences.is_empty() {
        let results = run_stage(target, sequences, settings).await;
        summary.record(results);
    }

    info!(
        "Constraints: {} applied, {} failed",
        summary.applied, summary.failed
    );
    Ok(summary)
}

async fn run_stage(
    target: &Arc<dyn TargetWriter>,
    statements: Vec<Statement>,
    settings: &ConstraintSettings,
) -> Vec<(Statement, Result<()>)> {
    run_bounded(settings.ddl_workers, statements, |stmt| {
        let target = target.clone();
        let settings = settings.clone();
        async move {
            let result = apply_statement(target.as_ref(), &stmt, &settings).await;
            Ok((stmt, result))
        }
    })
    .await
    .into_iter()
    .map(|r| match r {
        Ok(pair) => pair,
        Err(e) => (
            Statement {
                table: String::new(),
                constraint: "ddl task".to_string(),
                sql: String::new(),
                object: None,
            },
            Err(e),
        ),
    })
    .collect()
}

/// Execute one statement, retrying transient failures.
///
/// A name clash counts as applied when the existing object belongs to the
/// statement's table, so a resumed run can re-enter a stage.
async fn apply_statement(
    target: &dyn TargetWriter,
    stmt: &Statement,
    settings: &ConstraintSettings,
) -> Result<()> {
    let what = format!("{} on {}", stmt.constraint, stmt.table);
    let result = retry_transient(&what, settings.max_attempts, settings.retry_backoff, || {
        target.execute(&stmt.sql)
    })
    .await;

    match result {
        Ok(()) => {
            debug!("Applied {}", what);
            Ok(())
        }
        Err(e) if e.is_already_exists() || e.is_duplicate_primary_key() => {
            confirm_existing(target, &settings.target_schema, stmt, e).await
        }
        Err(e) => Err(e),
    }
}

/// Decide a name clash: `Ok` when the object under the statement's name is
/// on the statement's table, otherwise the clash is a failure.
async fn confirm_existing(
    target: &dyn TargetWriter,
    schema: &str,
    stmt: &Statement,
    clash: MigrateError,
) -> Result<()> {
    let Some(object) = &stmt.object else {
        return Err(clash);
    };
    match target.object_table(schema, object).await? {
        Some(owner) if owner == stmt.table => {
            debug!("{} on {} already exists", stmt.constraint, stmt.table);
            Ok(())
        }
        Some(owner) => Err(MigrateError::structure(
            stmt.table.as_str(),
            format!("{} already exists on table {}", object, owner),
        )),
        None => Err(clash),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ForeignKeyDescriptor, SourceColumn, SourceTable};
    use crate::drivers::MemoryTarget;
    use crate::structure::resolve_table;

    fn orders() -> TableDescriptor {
        let mut fk = ForeignKeyDescriptor::new("fk_customer", ["customer_id"], "customers", ["id"]);
        fk.on_delete = "SET NULL".into();
        fk.on_update = "CASCADE".into();
        resolve_table(SourceTable {
            name: "orders".into(),
            columns: vec![
                SourceColumn::new("id", "int", "int").auto_increment(),
                SourceColumn::new("customer_id", "int", "int"),
                SourceColumn::new("ref", "varchar", "varchar(20)").with_comment("external ref"),
                SourceColumn::new("state", "enum", "enum('new','paid')"),
                SourceColumn::new("tags", "set", "set('a','b')"),
                SourceColumn::new("notes", "text", "text"),
            ],
            indexes: vec![
                IndexDescriptor::primary(["id"]),
                IndexDescriptor::new("uq_ref", IndexKind::Unique, ["ref"]),
                IndexDescriptor::new("ix_cust_state", IndexKind::Plain, ["customer_id", "state"]),
                IndexDescriptor::new("ft_notes", IndexKind::FullText, ["ref", "notes"]),
            ],
            foreign_keys: vec![fk],
            row_estimate: 0,
            avg_row_width: 0,
            comment: Some("customer orders".into()),
        })
        .unwrap()
    }

    #[test]
    fn test_primary_key_statement() {
        let stmt = primary_key_statement("app", &orders()).unwrap().unwrap();
        assert_eq!(
            stmt.sql,
            "ALTER TABLE \"app\".\"orders\" ADD CONSTRAINT \"orders_pkey\" PRIMARY KEY (\"id\")"
        );
    }

    #[test]
    fn test_index_statements() {
        let t = orders();
        let unique = unique_statement("app", &t, &t.indexes[1]).unwrap();
        assert!(unique.sql.ends_with("ADD CONSTRAINT \"orders_uq_ref\" UNIQUE (\"ref\")"));

        let plain = index_statement("app", &t, &t.indexes[2]).unwrap().unwrap();
        assert_eq!(
            plain.sql,
            "CREATE INDEX \"orders_ix_cust_state\" ON \"app\".\"orders\" (\"customer_id\", \"state\")"
        );

        let fulltext = index_statement("app", &t, &t.indexes[3]).unwrap().unwrap();
        assert!(fulltext.sql.contains(
            "USING GIN (to_tsvector('simple', coalesce(\"ref\", '') || ' ' || coalesce(\"notes\", '')))"
        ));
    }

    #[test]
    fn test_check_statements() {
        let checks = check_statements("app", &orders()).unwrap();
        assert_eq!(checks.len(), 2);
        assert!(checks[0].sql.ends_with("CHECK (\"state\" IN ('new', 'paid'))"));
        assert!(checks[1]
            .sql
            .ends_with("CHECK (\"tags\" = '' OR string_to_array(\"tags\", ',') <@ ARRAY['a', 'b']::text[])"));
    }

    #[test]
    fn test_foreign_key_statement_maps_actions() {
        let names = HashMap::new();
        let fks = foreign_key_statements("app", &orders(), &names).unwrap();
        assert_eq!(
            fks[0].sql,
            "ALTER TABLE \"app\".\"orders\" ADD CONSTRAINT \"orders_fk_customer\" FOREIGN KEY (\"customer_id\") \
             REFERENCES \"app\".\"customers\" (\"id\") ON DELETE SET NULL ON UPDATE CASCADE"
        );
    }

    #[test]
    fn test_comments_and_sequence_reset() {
        let t = orders();
        let comments = comment_statements("app", &t).unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(
            comments[1].sql,
            "COMMENT ON COLUMN \"app\".\"orders\".\"ref\" IS 'external ref'"
        );

        let reset = sequence_reset_statement("app", &t).unwrap().unwrap();
        assert_eq!(
            reset.sql,
            "SELECT setval('\"app\".\"orders_id_seq\"', COALESCE((SELECT MAX(\"id\") FROM \"app\".\"orders\"), 0) + 1, false)"
        );
    }

    #[tokio::test]
    async fn test_name_clash_accepted_only_on_same_table() {
        let target = MemoryTarget::new();
        let t = orders();
        let index = index_statement("app", &t, &t.indexes[2]).unwrap().unwrap();
        assert_eq!(index.object.as_deref(), Some("orders_ix_cust_state"));
        target.execute(&index.sql).await.unwrap();

        let clash = || MigrateError::structure("orders", "relation already exists");
        confirm_existing(&target, "app", &index, clash()).await.unwrap();

        let mut other = index.clone();
        other.table = "customers".into();
        let err = confirm_existing(&target, "app", &other, clash())
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("orders_ix_cust_state already exists on table orders"));

        // Nothing under that name in another schema
        assert!(confirm_existing(&target, "other", &index, clash()).await.is_err());

        // Comments create nothing, so a clash is never theirs
        let comment = comment_statements("app", &t).unwrap().remove(0);
        assert_eq!(comment.object, None);
        assert!(confirm_existing(&target, "app", &comment, clash()).await.is_err());
    }

    #[tokio::test]
    async fn test_constraint_owner_recorded_for_alter_table() {
        let target = MemoryTarget::new();
        let t = orders();
        let pk = primary_key_statement("app", &t).unwrap().unwrap();
        target.execute(&pk.sql).await.unwrap();
        assert_eq!(
            target.object_table("app", "orders_pkey").await.unwrap().as_deref(),
            Some("orders")
        );
        confirm_existing(&target, "app", &pk, MigrateError::structure("orders", "clash"))
            .await
            .unwrap();
    }

    #[test]
    fn test_referential_action() {
        assert_eq!(referential_action("set_null"), "SET NULL");
        assert_eq!(referential_action("NO ACTION"), "NO ACTION");
        assert_eq!(referential_action("restrict"), "RESTRICT");
    }
}
