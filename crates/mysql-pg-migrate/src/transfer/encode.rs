//! COPY text encoding of source rows.
//!
//! Each row becomes one line of tab-separated fields, `\N` for NULL, with
//! backslash, tab, newline, and carriage return escaped. Value transforms are
//! applied here, between the source read and the target load.

use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use rust_decimal::Decimal;

use crate::core::{Row, SourceValue, TableDescriptor};
use crate::error::{MigrateError, Result};
use crate::typemap::ValueTransform;

/// Encodes row batches of one table as COPY text.
#[derive(Debug, Clone)]
pub struct RowEncoder {
    table: String,
    columns: Vec<(String, ValueTransform)>,
}

impl RowEncoder {
    pub fn new(table: &TableDescriptor) -> Self {
        Self {
            table: table.source_name.clone(),
            columns: table
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.mapping.transform))
                .collect(),
        }
    }

    /// Encode a batch of rows into one buffer.
    pub fn encode_batch(&self, rows: &[Row]) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(estimate_size(rows));
        for row in rows {
            self.encode_row(row, &mut buf)?;
        }
        Ok(buf.freeze())
    }

    fn encode_row(&self, row: &Row, buf: &mut BytesMut) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(MigrateError::data(
                &self.table,
                format!(
                    "row has {} values, expected {}",
                    row.len(),
                    self.columns.len()
                ),
            ));
        }

        for (i, (value, (column, transform))) in row.iter().zip(&self.columns).enumerate() {
            if i > 0 {
                buf.put_u8(b'\t');
            }
            self.encode_value(column, *transform, value, buf)?;
        }
        buf.put_u8(b'\n');
        Ok(())
    }

    fn encode_value(
        &self,
        column: &str,
        transform: ValueTransform,
        value: &SourceValue,
        buf: &mut BytesMut,
    ) -> Result<()> {
        match (transform, value) {
            (_, SourceValue::Null) => buf.put_slice(b"\\N"),

            (ValueTransform::EncodeBinary, SourceValue::Bytes(b)) => {
                buf.put_slice(hex::encode(b).as_bytes())
            }
            (ValueTransform::EncodeBinary, SourceValue::Text(s)) => {
                buf.put_slice(hex::encode(s.as_bytes()).as_bytes())
            }

            (ValueTransform::ExpandBitString { width }, SourceValue::Bytes(b)) => {
                buf.put_slice(expand_bits(b, width).as_bytes())
            }

            (ValueTransform::FixedPoint, v) => {
                let s = self.as_text(column, v)?;
                let trimmed = s.trim();
                if !is_fixed_point(trimmed) {
                    return Err(MigrateError::data(
                        &self.table,
                        format!("column {}: '{}' is not a decimal value", column, s),
                    ));
                }
                buf.put_slice(trimmed.as_bytes());
            }

            (ValueTransform::ZeroDate, v) => {
                let s = self.as_text(column, v)?;
                if is_zero_date(s) {
                    buf.put_slice(b"-infinity");
                } else {
                    put_escaped(buf, s);
                }
            }

            (_, v) => {
                let s = self.as_text(column, v)?;
                put_escaped(buf, s);
            }
        }
        Ok(())
    }

    fn as_text<'a>(&self, column: &str, value: &'a SourceValue) -> Result<&'a str> {
        match value {
            SourceValue::Text(s) => Ok(s),
            SourceValue::Bytes(b) => std::str::from_utf8(b).map_err(|e| {
                MigrateError::data(
                    &self.table,
                    format!("column {}: invalid UTF-8 in text value: {}", column, e),
                )
            }),
            SourceValue::Null => Ok(""),
        }
    }
}

fn estimate_size(rows: &[Row]) -> usize {
    rows.iter()
        .map(|r| r.iter().map(|v| v.size_hint() + 1).sum::<usize>())
        .sum()
}

/// Append text with COPY escaping.
fn put_escaped(buf: &mut BytesMut, s: &str) {
    for b in s.bytes() {
        match b {
            b'\\' => buf.put_slice(b"\\\\"),
            b'\t' => buf.put_slice(b"\\t"),
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            _ => buf.put_u8(b),
        }
    }
}

/// MySQL zero date or datetime (`0000-00-00`, `0000-00-00 00:00:00[.000]`).
pub fn is_zero_date(s: &str) -> bool {
    s.starts_with("0000-00-00")
}

/// Plain decimal literal: optional sign, digits, optional fraction.
///
/// `rust_decimal` covers up to 28 significant digits; wider MySQL decimals
/// (up to 65 digits) are checked syntactically.
pub fn is_fixed_point(s: &str) -> bool {
    if Decimal::from_str(s).is_ok() {
        return true;
    }
    let unsigned = s.strip_prefix(&['-', '+'][..]).unwrap_or(s);
    let (int, frac) = match unsigned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (unsigned, ""),
    };
    !(int.is_empty() && frac.is_empty())
        && int.bytes().all(|b| b.is_ascii_digit())
        && frac.bytes().all(|b| b.is_ascii_digit())
}

/// Render the low `width` bits of a big-endian value as 0/1 digits.
pub fn expand_bits(bytes: &[u8], width: u32) -> String {
    let all: String = bytes.iter().map(|b| format!("{:08b}", b)).collect();
    let width = width as usize;
    if width == 0 {
        return all;
    }
    if all.len() >= width {
        all[all.len() - width..].to_string()
    } else {
        format!("{}{}", "0".repeat(width - all.len()), all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SourceColumn, SourceTable};
    use crate::structure::resolve_table;

    fn encoder() -> RowEncoder {
        let table = resolve_table(SourceTable {
            name: "items".into(),
            columns: vec![
                SourceColumn::new("id", "int", "int").not_null(),
                SourceColumn::new("price", "decimal", "decimal(12,2)"),
                SourceColumn::new("created", "datetime", "datetime"),
                SourceColumn::new("payload", "blob", "blob"),
                SourceColumn::new("flags", "bit", "bit(5)"),
                SourceColumn::new("note", "text", "text"),
            ],
            indexes: vec![],
            foreign_keys: vec![],
            row_estimate: 1,
            avg_row_width: 64,
            comment: None,
        })
        .unwrap();
        RowEncoder::new(&table)
    }

    #[test]
    fn test_encode_row_applies_transforms() {
        let row = vec![
            SourceValue::text("7"),
            SourceValue::text("12.50"),
            SourceValue::text("0000-00-00 00:00:00"),
            SourceValue::Bytes(vec![0x00, 0xff, 0x5c]),
            SourceValue::Bytes(vec![0b0001_0110]),
            SourceValue::text("a\tb\\c\nd"),
        ];
        let out = encoder().encode_batch(&[row]).unwrap();
        assert_eq!(
            &out[..],
            b"7\t12.50\t-infinity\t00ff5c\t10110\ta\\tb\\\\c\\nd\n".as_slice()
        );
    }

    #[test]
    fn test_encode_nulls() {
        let row = vec![SourceValue::text("1")]
            .into_iter()
            .chain(std::iter::repeat(SourceValue::Null).take(5))
            .collect::<Vec<_>>();
        let out = encoder().encode_batch(&[row]).unwrap();
        assert_eq!(&out[..], b"1\t\\N\t\\N\t\\N\t\\N\t\\N\n".as_slice());
    }

    #[test]
    fn test_bad_decimal_is_data_error() {
        let row = vec![
            SourceValue::text("1"),
            SourceValue::text("12,50"),
            SourceValue::Null,
            SourceValue::Null,
            SourceValue::Null,
            SourceValue::Null,
        ];
        let err = encoder().encode_batch(&[row]).unwrap_err();
        assert!(matches!(err, MigrateError::Data { ref table, .. } if table == "items"));
    }

    #[test]
    fn test_row_width_mismatch() {
        let err = encoder()
            .encode_batch(&[vec![SourceValue::text("1")]])
            .unwrap_err();
        assert!(err.to_string().contains("expected 6"));
    }

    #[test]
    fn test_wide_decimal_accepted() {
        let wide = format!("-{}.{}", "9".repeat(35), "1".repeat(30));
        assert!(is_fixed_point(&wide));
        assert!(is_fixed_point("0.5"));
        assert!(is_fixed_point("5."));
        assert!(!is_fixed_point("."));
        assert!(!is_fixed_point("1e5x"));
    }

    #[test]
    fn test_expand_bits() {
        assert_eq!(expand_bits(&[0x01, 0x02], 10), "0100000010");
        assert_eq!(expand_bits(&[0x03], 12), "000000000011");
        assert_eq!(expand_bits(&[0x80], 1), "0");
    }
}
