//! Type mapping between MySQL and PostgreSQL.
//!
//! [`map_type`] is a pure function of the source column type: the same
//! descriptor always yields the same target type, value transform, and check
//! candidate.

use serde::{Deserialize, Serialize};

use crate::core::SourceColumnType;
use crate::error::{MigrateError, Result};

/// Per-value conversion applied while encoding rows for COPY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValueTransform {
    /// Text passes through (COPY escaping only).
    None,
    /// Decimal string, validated but never parsed into a float.
    FixedPoint,
    /// MySQL zero dates (`0000-00-00 ...`) become `-infinity`.
    ZeroDate,
    /// Bytes are written hex-encoded and decoded in place after the load.
    EncodeBinary,
    /// Big-endian bytes become a string of `width` 0/1 digits.
    ExpandBitString { width: u32 },
    /// Geometry read as WKT text.
    SpatialText,
}

impl ValueTransform {
    /// Source select expression for an already-quoted column.
    pub fn select_expr(&self, quoted_column: &str) -> String {
        match self {
            ValueTransform::EncodeBinary => quoted_column.to_string(),
            ValueTransform::ExpandBitString { .. } => format!("CAST({} AS BINARY)", quoted_column),
            ValueTransform::SpatialText => format!("CAST(ST_AsText({}) AS CHAR)", quoted_column),
            ValueTransform::None | ValueTransform::FixedPoint | ValueTransform::ZeroDate => {
                format!("CAST({} AS CHAR)", quoted_column)
            }
        }
    }

    /// Whether the source value is read as raw bytes rather than text.
    pub fn reads_bytes(&self) -> bool {
        matches!(
            self,
            ValueTransform::EncodeBinary | ValueTransform::ExpandBitString { .. }
        )
    }
}

/// Legal value list kept for an optional check constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "values")]
pub enum CheckCandidate {
    /// Value must be one of the literals.
    Enum(Vec<String>),
    /// Value is a comma-separated subset of the literals.
    Set(Vec<String>),
}

/// Resolved target type for a source column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeMapping {
    /// PostgreSQL type used in `CREATE TABLE`.
    pub target_type: String,

    /// Conversion applied to each value during transfer.
    pub transform: ValueTransform,

    /// Enum/set legal values, not enforced inline.
    pub check_candidate: Option<CheckCandidate>,
}

impl TypeMapping {
    fn plain(target_type: impl Into<String>) -> Self {
        Self::with(target_type, ValueTransform::None)
    }

    fn with(target_type: impl Into<String>, transform: ValueTransform) -> Self {
        Self {
            target_type: target_type.into(),
            transform,
            check_candidate: None,
        }
    }
}

/// Map a column, failing with the table and column named when the type is unknown.
pub fn map_column(table: &str, column: &str, source: &SourceColumnType) -> Result<TypeMapping> {
    map_type(source).ok_or_else(|| MigrateError::TypeMapping {
        table: table.to_string(),
        column: column.to_string(),
        data_type: source.column_type.clone(),
    })
}

/// Map a MySQL column type to PostgreSQL. `None` when the type is unknown.
pub fn map_type(source: &SourceColumnType) -> Option<TypeMapping> {
    let unsigned = source.unsigned;

    let mapping = match source.data_type.as_str() {
        // Integers widen when unsigned so the full source range fits
        "tinyint" => TypeMapping::plain("smallint"),
        "smallint" if unsigned => TypeMapping::plain("integer"),
        "smallint" => TypeMapping::plain("smallint"),
        "mediumint" => TypeMapping::plain("integer"),
        "int" | "integer" if unsigned => TypeMapping::plain("bigint"),
        "int" | "integer" => TypeMapping::plain("integer"),
        "bigint" if unsigned => TypeMapping::plain("numeric(20)"),
        "bigint" => TypeMapping::plain("bigint"),
        "year" => TypeMapping::plain("smallint"),
        "bool" | "boolean" => TypeMapping::plain("boolean"),

        "decimal" | "numeric" => {
            let target = match (source.precision, source.scale) {
                (Some(p), Some(s)) => format!("numeric({},{})", p, s),
                (Some(p), None) => format!("numeric({})", p),
                _ => "numeric".to_string(),
            };
            TypeMapping::with(target, ValueTransform::FixedPoint)
        }
        "float" => TypeMapping::plain("real"),
        "double" | "double precision" | "real" => TypeMapping::plain("double precision"),

        "date" => TypeMapping::with("date", ValueTransform::ZeroDate),
        "time" => TypeMapping::plain(with_fsp("time", source.length)),
        "datetime" | "timestamp" => {
            TypeMapping::with(with_fsp("timestamp", source.length), ValueTransform::ZeroDate)
        }

        "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" => {
            TypeMapping::plain("text")
        }

        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            TypeMapping::with("bytea", ValueTransform::EncodeBinary)
        }

        "bit" => {
            let width = source.bit_width();
            TypeMapping::with(
                format!("bit varying({})", width),
                ValueTransform::ExpandBitString { width },
            )
        }

        "enum" => {
            let longest = source
                .literals
                .iter()
                .map(|l| l.chars().count())
                .max()
                .unwrap_or(0);
            TypeMapping {
                target_type: format!("varchar({})", longest.max(1)),
                transform: ValueTransform::None,
                check_candidate: Some(CheckCandidate::Enum(source.literals.clone())),
            }
        }
        "set" => {
            let members: usize = source.literals.iter().map(|l| l.chars().count()).sum();
            let separators = source.literals.len().saturating_sub(1);
            TypeMapping {
                target_type: format!("varchar({})", (members + separators).max(1)),
                transform: ValueTransform::None,
                check_candidate: Some(CheckCandidate::Set(source.literals.clone())),
            }
        }

        "json" => TypeMapping::plain("json"),

        "geometry" | "point" | "linestring" | "polygon" | "multipoint" | "multilinestring"
        | "multipolygon" | "geometrycollection" | "geomcollection" => {
            TypeMapping::with("text", ValueTransform::SpatialText)
        }

        _ => return None,
    };

    Some(mapping)
}

/// Carry MySQL fractional-second precision over to time/timestamp.
fn with_fsp(base: &str, fsp: Option<u32>) -> String {
    match fsp {
        Some(p) if p > 0 => format!("{}({})", base, p.min(6)),
        _ => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(data_type: &str, column_type: &str) -> TypeMapping {
        map_type(&SourceColumnType::parse(data_type, column_type)).unwrap()
    }

    #[test]
    fn test_integer_types_widen_when_unsigned() {
        assert_eq!(map("tinyint", "tinyint(4)").target_type, "smallint");
        assert_eq!(map("smallint", "smallint(5) unsigned").target_type, "integer");
        assert_eq!(map("int", "int(11)").target_type, "integer");
        assert_eq!(map("int", "int(10) unsigned").target_type, "bigint");
        assert_eq!(map("bigint", "bigint(20)").target_type, "bigint");
        assert_eq!(map("bigint", "bigint(20) unsigned").target_type, "numeric(20)");
    }

    #[test]
    fn test_decimal_keeps_precision_and_is_fixed_point() {
        let m = map("decimal", "decimal(18,4)");
        assert_eq!(m.target_type, "numeric(18,4)");
        assert_eq!(m.transform, ValueTransform::FixedPoint);
    }

    #[test]
    fn test_temporal_types() {
        assert_eq!(map("date", "date").transform, ValueTransform::ZeroDate);
        assert_eq!(map("datetime", "datetime").target_type, "timestamp");
        assert_eq!(map("timestamp", "timestamp(3)").target_type, "timestamp(3)");
        assert_eq!(map("time", "time").target_type, "time");
    }

    #[test]
    fn test_text_variants_collapse() {
        for (dt, ct) in [
            ("char", "char(3)"),
            ("varchar", "varchar(255)"),
            ("tinytext", "tinytext"),
            ("longtext", "longtext"),
        ] {
            assert_eq!(map(dt, ct).target_type, "text");
        }
    }

    #[test]
    fn test_binary_flagged_for_decoder() {
        let m = map("blob", "blob");
        assert_eq!(m.target_type, "bytea");
        assert_eq!(m.transform, ValueTransform::EncodeBinary);
        assert!(m.transform.reads_bytes());
        assert_eq!(m.transform.select_expr("`data`"), "`data`");
    }

    #[test]
    fn test_bit_string() {
        let m = map("bit", "bit(10)");
        assert_eq!(m.target_type, "bit varying(10)");
        assert_eq!(m.transform, ValueTransform::ExpandBitString { width: 10 });
        assert_eq!(m.transform.select_expr("`flags`"), "CAST(`flags` AS BINARY)");
    }

    #[test]
    fn test_enum_and_set_sizes() {
        let e = map("enum", "enum('small','medium','large')");
        assert_eq!(e.target_type, "varchar(6)");
        assert_eq!(
            e.check_candidate,
            Some(CheckCandidate::Enum(vec![
                "small".into(),
                "medium".into(),
                "large".into()
            ]))
        );

        let s = map("set", "set('a','bb','ccc')");
        assert_eq!(s.target_type, "varchar(8)");
    }

    #[test]
    fn test_spatial_reads_wkt() {
        let m = map("point", "point");
        assert_eq!(m.target_type, "text");
        assert_eq!(
            m.transform.select_expr("`loc`"),
            "CAST(ST_AsText(`loc`) AS CHAR)"
        );
    }

    #[test]
    fn test_unknown_type_names_the_column() {
        let err = map_column(
            "events",
            "payload",
            &SourceColumnType::parse("vector", "vector(3)"),
        )
        .unwrap_err();
        assert!(matches!(err, MigrateError::TypeMapping { .. }));
        assert!(err.to_string().contains("events.payload"));
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let t = SourceColumnType::parse("int", "int(10) unsigned");
        assert_eq!(map_type(&t), map_type(&t));
    }
}
