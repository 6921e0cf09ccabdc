//! Chunk planning: how a table is split into independently transferable chunks.

use serde::{Deserialize, Serialize};

use crate::core::identifier::quote_mysql;
use crate::core::TableDescriptor;
use crate::error::Result;

/// Which rows of a table belong to a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChunkSelection {
    /// The whole table.
    Full,

    /// `lower <= column < upper`; a missing bound is open.
    KeyRange {
        column: String,
        lower: Option<i64>,
        upper: Option<i64>,
    },

    /// Rows `offset .. offset + limit` in `order_by` order; no limit means to the end.
    RowWindow {
        order_by: Vec<String>,
        offset: i64,
        limit: Option<i64>,
    },
}

impl ChunkSelection {
    /// Whether an integer key value falls inside a key-range selection.
    pub fn contains_key(&self, key: i64) -> bool {
        match self {
            ChunkSelection::KeyRange { lower, upper, .. } => {
                lower.map_or(true, |l| key >= l) && upper.map_or(true, |u| key < u)
            }
            ChunkSelection::Full => true,
            ChunkSelection::RowWindow { .. } => false,
        }
    }

    /// MySQL clause restricting a `SELECT ... FROM table` to this chunk.
    pub fn to_mysql_clause(&self) -> Result<String> {
        let clause = match self {
            ChunkSelection::Full => String::new(),
            ChunkSelection::KeyRange {
                column,
                lower,
                upper,
            } => {
                let col = quote_mysql(column)?;
                let mut conditions = Vec::new();
                if let Some(l) = lower {
                    conditions.push(format!("{} >= {}", col, l));
                }
                if let Some(u) = upper {
                    conditions.push(format!("{} < {}", col, u));
                }
                if conditions.is_empty() {
                    String::new()
                } else {
                    format!(" WHERE {}", conditions.join(" AND "))
                }
            }
            ChunkSelection::RowWindow {
                order_by,
                offset,
                limit,
            } => {
                let cols = order_by
                    .iter()
                    .map(|c| quote_mysql(c))
                    .collect::<Result<Vec<_>>>()?;
                // MySQL has no OFFSET without LIMIT; use the documented maximum
                let limit = limit.map_or_else(|| "18446744073709551615".to_string(), |l| l.to_string());
                format!(
                    " ORDER BY {} LIMIT {} OFFSET {}",
                    cols.join(", "),
                    limit,
                    offset
                )
            }
        };
        Ok(clause)
    }
}

/// Inputs that decide chunk sizing.
#[derive(Debug, Clone, Copy)]
pub struct SizingPolicy {
    pub chunk_byte_budget: u64,
    pub small_table_threshold: i64,
}

impl SizingPolicy {
    /// Rows per chunk that keep a chunk under the byte budget.
    pub fn rows_per_chunk(&self, avg_row_width: i64) -> i64 {
        let width = avg_row_width.max(1) as u64;
        (self.chunk_byte_budget / width).clamp(1, i64::MAX as u64) as i64
    }

    /// Number of chunks for a table of `rows` rows.
    pub fn chunk_count(&self, rows: i64, avg_row_width: i64) -> i64 {
        if rows < self.small_table_threshold || rows <= 0 {
            return 1;
        }
        let per_chunk = self.rows_per_chunk(avg_row_width);
        ((rows + per_chunk - 1) / per_chunk).max(1)
    }
}

/// Outcome of planning one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    pub selections: Vec<ChunkSelection>,
    /// Set when a large table had to be transferred as a single chunk.
    pub unsplittable: bool,
}

/// Plan the chunks of a table.
///
/// `key_bounds` is the `[min, max]` of the table's integer key, when it has
/// one; `None` for an empty table or a table without such a key.
pub fn plan_table(
    table: &TableDescriptor,
    key_bounds: Option<(i64, i64)>,
    policy: &SizingPolicy,
) -> TablePlan {
    let n = policy.chunk_count(table.row_estimate, table.avg_row_width);
    let single = |unsplittable| TablePlan {
        selections: vec![ChunkSelection::Full],
        unsplittable,
    };

    if n <= 1 {
        return single(false);
    }

    if let Some(key) = table.integer_key() {
        return match key_bounds {
            Some((min, max)) => TablePlan {
                selections: split_key_range(&key.name, min, max, n),
                unsplittable: false,
            },
            None => single(false),
        };
    }

    let pk = table.pk_columns();
    if pk.is_empty() {
        return single(true);
    }

    let per_chunk = policy.rows_per_chunk(table.avg_row_width);
    let selections = (0..n)
        .map(|i| ChunkSelection::RowWindow {
            order_by: pk.to_vec(),
            offset: i * per_chunk,
            limit: if i == n - 1 { None } else { Some(per_chunk) },
        })
        .collect();

    TablePlan {
        selections,
        unsplittable: false,
    }
}

/// Split the key space `[min, max]` into at most `n` half-open ranges.
///
/// The first range has no lower bound and the last no upper bound, so rows
/// inserted outside the sampled bounds are still covered exactly once.
pub fn split_key_range(column: &str, min: i64, max: i64, n: i64) -> Vec<ChunkSelection> {
    let span = (max as i128) - (min as i128) + 1;
    let n = (n as i128).clamp(1, span.max(1));
    let step = (span + n - 1) / n;

    let boundaries: Vec<i64> = (1..n)
        .map(|i| (min as i128 + i * step) as i64)
        .collect();

    let mut selections = Vec::with_capacity(n as usize);
    let mut lower = None;
    for b in &boundaries {
        selections.push(ChunkSelection::KeyRange {
            column: column.to_string(),
            lower,
            upper: Some(*b),
        });
        lower = Some(*b);
    }
    selections.push(ChunkSelection::KeyRange {
        column: column.to_string(),
        lower,
        upper: None,
    });
    selections
}
