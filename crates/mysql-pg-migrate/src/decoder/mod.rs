//! Binary Data Decoder: turns hex-loaded bytea columns back into raw bytes.
//!
//! Binary values travel through COPY as their hex text, which PostgreSQL
//! stores verbatim in the bytea column. One in-place `UPDATE` per table
//! restores the original bytes:
//!
//! ```sql
//! UPDATE "s"."t" SET "c" = DECODE(ENCODE("c", 'escape'), 'hex')
//! ```
//!
//! Decoding twice corrupts the data, so every table is marked as decoded in
//! the same transaction as its `UPDATE`, and marked tables are skipped when a
//! failed phase is re-entered.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::fanout::run_bounded;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::{TableDescriptor, TargetWriter};
use crate::error::{MigrateError, Result};
use crate::state::{PhaseFlag, StateManager};
use crate::transfer::retry_transient;

/// Settings for the Binary Data Decoder.
#[derive(Debug, Clone)]
pub struct DecoderSettings {
    pub target_schema: String,
    pub ddl_workers: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodeSummary {
    pub tables_decoded: usize,
    /// Tables decoded by an earlier attempt of the phase.
    pub tables_skipped: usize,
    pub columns_decoded: usize,
}

/// Decode statement for a table, or `None` when it has no binary columns.
pub fn decode_statement(schema: &str, table: &TableDescriptor) -> Result<Option<String>> {
    let assignments = table
        .binary_columns()
        .map(|c| {
            let col = quote_pg(&c.name)?;
            Ok(format!("{col} = DECODE(ENCODE({col}, 'escape'), 'hex')"))
        })
        .collect::<Result<Vec<_>>>()?;

    if assignments.is_empty() {
        return Ok(None);
    }

    Ok(Some(format!(
        "UPDATE {} SET {}",
        qualify_pg(schema, &table.target_name)?,
        assignments.join(", ")
    )))
}

/// Decode every binary column of every table, up to `ddl_workers` tables at a time.
///
/// Transient failures are retried. A table that still fails fails the phase
/// with a `Decode` error naming it; tables decoded before that stay marked.
pub async fn decode_binary_columns(
    target: &Arc<dyn TargetWriter>,
    state: &StateManager,
    tables: &[TableDescriptor],
    settings: &DecoderSettings,
) -> Result<DecodeSummary> {
    let decoded = state.completed_tables(PhaseFlag::BinaryDecoded).await?;

    let mut work = Vec::new();
    let mut summary = DecodeSummary::default();
    for table in tables {
        let Some(sql) = decode_statement(&settings.target_schema, table)
            .map_err(|e| MigrateError::decode(table.target_name.as_str(), e))?
        else {
            continue;
        };
        if decoded.contains(&table.target_name) {
            debug!("Binary columns of {} already decoded", table.target_name);
            summary.tables_skipped += 1;
            continue;
        }
        summary.columns_decoded += table.binary_columns().count();
        work.push((table.target_name.clone(), sql));
    }

    if work.is_empty() {
        info!("No binary columns left to decode");
        return Ok(summary);
    }

    info!(
        "Decoding {} binary columns in {} tables",
        summary.columns_decoded,
        work.len()
    );

    let results = run_bounded(settings.ddl_workers, work, |(name, sql)| {
        let target = target.clone();
        let state = state.clone();
        let settings = settings.clone();
        async move {
            let marker = state.table_done_statement(PhaseFlag::BinaryDecoded, &name);
            let mut statements = vec![sql];
            statements.extend(marker.clone());

            let what = format!("decode {}", name);
            retry_transient(&what, settings.max_attempts, settings.retry_backoff, || {
                target.execute_atomic(&statements)
            })
            .await
            .map_err(|e| MigrateError::decode(name.as_str(), e))?;

            // The store could not join the target transaction
            if marker.is_none() {
                state
                    .mark_table_done(PhaseFlag::BinaryDecoded, &name)
                    .await?;
            }
            debug!("Decoded binary columns of {}", name);
            Ok(())
        }
    })
    .await;

    let mut first_error = None;
    for result in results {
        match result {
            Ok(()) => summary.tables_decoded += 1,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(summary)
}
