//! PostgreSQL DDL for table structure (columns and sequences only).

use tracing::debug;

use crate::core::identifier::{pg_object_name, qualify_pg, quote_literal, quote_pg};
use crate::core::{ColumnDescriptor, TableDescriptor};
use crate::error::Result;
use crate::typemap::ValueTransform;

/// Name of the sequence backing an auto-increment column.
pub fn sequence_name(table: &str, column: &str) -> String {
    pg_object_name(&[table, column, "seq"])
}

/// Statements that (re)create a table with its columns and sequence.
///
/// Order: drop the table (and any sequence it owns), create the sequence,
/// create the table, then hand sequence ownership to the column.
pub fn table_statements(schema: &str, table: &TableDescriptor) -> Result<Vec<String>> {
    let qualified = qualify_pg(schema, &table.target_name)?;
    let mut statements = vec![format!("DROP TABLE IF EXISTS {} CASCADE", qualified)];

    let sequence = match table.auto_increment_column() {
        Some(col) => Some((
            col,
            qualify_pg(schema, &sequence_name(&table.target_name, &col.name))?,
        )),
        None => None,
    };

    if let Some((_, seq)) = &sequence {
        statements.push(format!("DROP SEQUENCE IF EXISTS {} CASCADE", seq));
        statements.push(format!("CREATE SEQUENCE {}", seq));
    }

    let mut column_defs = Vec::with_capacity(table.columns.len());
    for col in &table.columns {
        let mut def = format!("{} {}", quote_pg(&col.name)?, col.mapping.target_type);
        if !col.nullable {
            def.push_str(" NOT NULL");
        }
        let default = match &sequence {
            Some((seq_col, seq)) if seq_col.name == col.name => {
                Some(format!("nextval({}::regclass)", quote_literal(seq)))
            }
            _ => translate_default(&table.target_name, col),
        };
        if let Some(default) = default {
            def.push_str(" DEFAULT ");
            def.push_str(&default);
        }
        column_defs.push(def);
    }

    statements.push(format!(
        "CREATE TABLE {} (\n    {}\n)",
        qualified,
        column_defs.join(",\n    ")
    ));

    if let Some((col, seq)) = &sequence {
        statements.push(format!(
            "ALTER SEQUENCE {} OWNED BY {}.{}",
            seq,
            qualified,
            quote_pg(&col.name)?
        ));
    }

    Ok(statements)
}

/// Translate a MySQL column default into a PostgreSQL default expression.
///
/// Returns `None` when the column has no default, or when the default has no
/// faithful PostgreSQL spelling (expression defaults, binary literals).
pub fn translate_default(table: &str, col: &ColumnDescriptor) -> Option<String> {
    let raw = col.default.as_deref()?.trim();
    if raw.eq_ignore_ascii_case("null") {
        return None;
    }

    // MariaDB reports string defaults quoted, MySQL does not
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .map(|s| s.replace("''", "'"))
        .unwrap_or_else(|| raw.to_string());

    let lower = unquoted.to_lowercase();
    if lower.starts_with("current_timestamp") || lower == "now()" || lower.starts_with("localtimestamp") {
        return Some("CURRENT_TIMESTAMP".to_string());
    }
    if lower == "curdate()" || lower == "current_date" {
        return Some("CURRENT_DATE".to_string());
    }
    if raw.starts_with('(') {
        debug!(
            "{}.{}: expression default {} not carried over",
            table, col.name, raw
        );
        return None;
    }

    match col.mapping.transform {
        ValueTransform::EncodeBinary | ValueTransform::SpatialText => {
            debug!("{}.{}: binary default not carried over", table, col.name);
            None
        }
        ValueTransform::ExpandBitString { .. } => {
            let bits = lower
                .strip_prefix("b'")
                .and_then(|s| s.strip_suffix('\''))
                .unwrap_or(&lower);
            bits.chars()
                .all(|c| c == '0' || c == '1')
                .then(|| format!("B'{}'", bits))
        }
        ValueTransform::ZeroDate if unquoted.starts_with("0000-00-00") => {
            Some("'-infinity'".to_string())
        }
        _ if is_numeric_type(&col.mapping.target_type) && is_numeric_literal(&unquoted) => {
            Some(unquoted)
        }
        _ => Some(quote_literal(&unquoted)),
    }
}

fn is_numeric_type(target_type: &str) -> bool {
    let base = target_type.split('(').next().unwrap_or(target_type);
    matches!(
        base,
        "smallint" | "integer" | "bigint" | "numeric" | "real" | "double precision"
    )
}

fn is_numeric_literal(s: &str) -> bool {
    let body = s.strip_prefix(&['-', '+'][..]).unwrap_or(s);
    let mut seen_digit = false;
    let mut seen_dot = false;
    for c in body.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }
    seen_digit
}
