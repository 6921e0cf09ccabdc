//! View translation and creation.
//!
//! Views can reference each other, and MySQL reports them in name order, so
//! creation runs in passes: every pass retries the views that failed in the
//! previous one, until a pass makes no progress.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::{TargetWriter, ViewDefinition};
use crate::error::Result;

/// A view that could not be created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewFailure {
    pub view: String,
    pub error: String,
}

/// Character-set introducers MySQL writes in front of string literals.
const INTRODUCERS: &[&str] = &["_utf8mb4'", "_utf8mb3'", "_utf8'", "_latin1'", "_binary'"];

/// Translate a MySQL view definition into `CREATE OR REPLACE VIEW`.
pub fn translate_view(
    view: &ViewDefinition,
    source_database: &str,
    target_schema: &str,
) -> Result<String> {
    let source_qualifier = format!("`{}`.", source_database.replace('`', "``"));
    let target_qualifier = format!("{}.", quote_pg(target_schema)?);

    let mut body = view.definition.replace(&source_qualifier, &target_qualifier);
    for introducer in INTRODUCERS {
        body = body.replace(introducer, "'");
    }
    let body = body.replace('`', "\"");

    Ok(format!(
        "CREATE OR REPLACE VIEW {} AS {}",
        qualify_pg(target_schema, &view.name)?,
        body
    ))
}

/// Create views in repeated passes. Returns the number created and the failures.
pub async fn create_views(
    target: &Arc<dyn TargetWriter>,
    views: &[ViewDefinition],
    source_database: &str,
    target_schema: &str,
) -> (usize, Vec<ViewFailure>) {
    let mut untranslatable = Vec::new();
    let mut pending: Vec<(String, String)> = Vec::new();
    for view in views {
        match translate_view(view, source_database, target_schema) {
            Ok(sql) => pending.push((view.name.clone(), sql)),
            Err(e) => untranslatable.push(ViewFailure {
                view: view.name.clone(),
                error: e.to_string(),
            }),
        }
    }

    let mut created = 0;
    let mut last_errors: Vec<ViewFailure> = Vec::new();

    loop {
        let mut progressed = false;
        last_errors.clear();
        let mut still_pending = Vec::new();

        for (name, sql) in pending {
            match target.execute(&sql).await {
                Ok(()) => {
                    debug!("Created view {}", name);
                    created += 1;
                    progressed = true;
                }
                Err(e) => {
                    last_errors.push(ViewFailure {
                        view: name.clone(),
                        error: e.to_string(),
                    });
                    still_pending.push((name, sql));
                }
            }
        }

        pending = still_pending;
        if pending.is_empty() || !progressed {
            break;
        }
    }
    last_errors.extend(untranslatable);

    for failure in &last_errors {
        warn!("View {} not created: {}", failure.view, failure.error);
    }
    if created > 0 {
        info!("Created {} views", created);
    }

    (created, last_errors)
}
