//! Schema and metadata types for tables, columns, indexes, and foreign keys.
//!
//! Source-side metadata ([`SourceTable`], [`SourceColumn`]) is what a
//! [`SourceReader`](super::traits::SourceReader) reports. The Structure
//! Loader resolves every column through the Type Mapper and produces the
//! [`TableDescriptor`] set used by every later phase.

use serde::{Deserialize, Serialize};

use crate::typemap::TypeMapping;

/// Source column type with the modifiers parsed out of MySQL's `COLUMN_TYPE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceColumnType {
    /// Lowercase base type (`DATA_TYPE`), e.g. "int", "varchar", "enum".
    pub data_type: String,

    /// Full column type (`COLUMN_TYPE`), e.g. "int(10) unsigned".
    pub column_type: String,

    /// Declared length for character and binary types.
    pub length: Option<u32>,

    /// Numeric precision.
    pub precision: Option<u32>,

    /// Numeric scale.
    pub scale: Option<u32>,

    /// Whether the integer or decimal type is unsigned.
    pub unsigned: bool,

    /// Legal values for `enum` and `set` columns, in declaration order.
    pub literals: Vec<String>,
}

impl SourceColumnType {
    /// Parse a column type from MySQL's `DATA_TYPE` and `COLUMN_TYPE` pair.
    ///
    /// ```
    /// use mysql_pg_migrate::core::SourceColumnType;
    ///
    /// let t = SourceColumnType::parse("decimal", "decimal(12,4) unsigned");
    /// assert_eq!(t.precision, Some(12));
    /// assert_eq!(t.scale, Some(4));
    /// assert!(t.unsigned);
    /// ```
    pub fn parse(data_type: &str, column_type: &str) -> Self {
        let data_type = data_type.trim().to_lowercase();
        let column_type = column_type.trim().to_string();
        let lower = column_type.to_lowercase();

        let args = match (lower.find('('), lower.rfind(')')) {
            (Some(open), Some(close)) if close > open => Some(&column_type[open + 1..close]),
            _ => None,
        };

        let mut parsed = Self {
            data_type,
            unsigned: lower.contains(" unsigned"),
            column_type: column_type.clone(),
            length: None,
            precision: None,
            scale: None,
            literals: Vec::new(),
        };

        let Some(args) = args else {
            return parsed;
        };

        match parsed.data_type.as_str() {
            "enum" | "set" => parsed.literals = parse_literals(args),
            "decimal" | "numeric" | "float" | "double" | "real" => {
                let mut parts = args.split(',').map(|p| p.trim().parse::<u32>().ok());
                parsed.precision = parts.next().flatten();
                parsed.scale = parts.next().flatten();
            }
            _ => parsed.length = args.trim().parse::<u32>().ok(),
        }

        parsed
    }

    /// Bit width of a `bit(n)` column (MySQL defaults to 1).
    pub fn bit_width(&self) -> u32 {
        self.length.unwrap_or(1).max(1)
    }

    /// Whether the type is one of MySQL's integer types.
    pub fn is_integer(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint"
        )
    }
}

/// Parse a MySQL quoted literal list: `'a','b''c','d,e'`.
fn parse_literals(args: &str) -> Vec<String> {
    let mut literals = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = args.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quote) {
            ('\'', false) => in_quote = true,
            ('\'', true) if chars.peek() == Some(&'\'') => {
                current.push('\'');
                chars.next();
            }
            ('\'', true) => {
                in_quote = false;
                literals.push(std::mem::take(&mut current));
            }
            (c, true) => current.push(c),
            _ => {}
        }
    }

    literals
}

/// Column metadata as reported by the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceColumn {
    /// Column name.
    pub name: String,

    /// Source type with modifiers.
    pub column_type: SourceColumnType,

    /// Whether the column allows NULL.
    pub nullable: bool,

    /// Raw source default expression, if any.
    pub default: Option<String>,

    /// Whether the column is `AUTO_INCREMENT`.
    pub auto_increment: bool,

    /// Column comment (empty comments are `None`).
    pub comment: Option<String>,
}

impl SourceColumn {
    /// Create a nullable column with no default.
    pub fn new(name: impl Into<String>, data_type: &str, column_type: &str) -> Self {
        Self {
            name: name.into(),
            column_type: SourceColumnType::parse(data_type, column_type),
            nullable: true,
            default: None,
            auto_increment: false,
            comment: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Table metadata as reported by the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTable {
    /// Table name.
    pub name: String,

    /// Columns in ordinal order.
    pub columns: Vec<SourceColumn>,

    /// Indexes, including the primary key.
    pub indexes: Vec<IndexDescriptor>,

    /// Foreign keys.
    pub foreign_keys: Vec<ForeignKeyDescriptor>,

    /// Approximate row count.
    pub row_estimate: i64,

    /// Approximate average row width in bytes.
    pub avg_row_width: i64,

    /// Table comment.
    pub comment: Option<String>,
}

/// A source view definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    pub definition: String,
}

/// Table metadata with every column resolved to a target type.
///
/// Built once per run by the Structure Loader and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name in the source database.
    pub source_name: String,

    /// Table name in the target schema.
    pub target_name: String,

    /// Columns in ordinal order.
    pub columns: Vec<ColumnDescriptor>,

    /// Indexes, including the primary key.
    pub indexes: Vec<IndexDescriptor>,

    /// Foreign keys.
    pub foreign_keys: Vec<ForeignKeyDescriptor>,

    /// Approximate row count.
    pub row_estimate: i64,

    /// Approximate average row width in bytes.
    pub avg_row_width: i64,

    /// Table comment.
    pub comment: Option<String>,
}

impl TableDescriptor {
    /// The primary key index, if the table has one.
    pub fn primary_key(&self) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.kind == IndexKind::Primary)
    }

    /// Primary key column names (empty when there is no primary key).
    pub fn pk_columns(&self) -> &[String] {
        self.primary_key().map_or(&[], |pk| pk.columns.as_slice())
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The key column when the primary key is a single signed-range integer.
    ///
    /// Unsigned bigint keys are excluded because their range exceeds `i64`.
    pub fn integer_key(&self) -> Option<&ColumnDescriptor> {
        match self.pk_columns() {
            [only] => self.column(only).filter(|c| {
                c.source.is_integer() && !(c.source.data_type == "bigint" && c.source.unsigned)
            }),
            _ => None,
        }
    }

    /// The auto-increment column, if any.
    pub fn auto_increment_column(&self) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.auto_increment)
    }

    /// Columns whose bytes are loaded hex-encoded and decoded in place later.
    pub fn binary_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns
            .iter()
            .filter(|c| c.mapping.transform == crate::typemap::ValueTransform::EncodeBinary)
    }
}

/// Column metadata with its resolved target mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub source: SourceColumnType,
    pub nullable: bool,
    pub default: Option<String>,
    pub auto_increment: bool,
    pub comment: Option<String>,
    pub mapping: TypeMapping,
}

/// Index kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Primary,
    Unique,
    Plain,
    FullText,
    Spatial,
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name (MySQL names the primary key "PRIMARY").
    pub name: String,

    /// Index kind.
    pub kind: IndexKind,

    /// Indexed column names in key order.
    pub columns: Vec<String>,
}

impl IndexDescriptor {
    pub fn new<I, S>(name: impl Into<String>, kind: IndexKind, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind,
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn primary<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("PRIMARY", IndexKind::Primary, columns)
    }

    /// Whether the index spans more than one column.
    pub fn is_composite(&self) -> bool {
        self.columns.len() > 1
    }
}

/// Foreign key metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    /// Constraint name.
    pub name: String,

    /// Referencing column names.
    pub columns: Vec<String>,

    /// Referenced table name.
    pub ref_table: String,

    /// Referenced column names.
    pub ref_columns: Vec<String>,

    /// ON DELETE action as reported by MySQL (e.g. "CASCADE", "SET NULL").
    pub on_delete: String,

    /// ON UPDATE action.
    pub on_update: String,
}

impl ForeignKeyDescriptor {
    pub fn new<I, J, S>(
        name: impl Into<String>,
        columns: I,
        ref_table: impl Into<String>,
        ref_columns: J,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            ref_table: ref_table.into(),
            ref_columns: ref_columns.into_iter().map(Into::into).collect(),
            on_delete: "RESTRICT".to_string(),
            on_update: "RESTRICT".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unsigned_int() {
        let t = SourceColumnType::parse("INT", "int(10) unsigned");
        assert_eq!(t.data_type, "int");
        assert_eq!(t.length, Some(10));
        assert!(t.unsigned);
        assert!(t.is_integer());
    }

    #[test]
    fn test_parse_enum_literals_with_quotes_and_commas() {
        let t = SourceColumnType::parse("enum", "enum('new','it''s','a,b')");
        assert_eq!(t.literals, vec!["new", "it's", "a,b"]);
        assert_eq!(t.length, None);
    }

    #[test]
    fn test_parse_bit_width() {
        assert_eq!(SourceColumnType::parse("bit", "bit(12)").bit_width(), 12);
        assert_eq!(SourceColumnType::parse("bit", "bit").bit_width(), 1);
    }

    #[test]
    fn test_parse_without_modifiers() {
        let t = SourceColumnType::parse("datetime", "datetime");
        assert_eq!(t.length, None);
        assert_eq!(t.precision, None);
        assert!(!t.unsigned);
    }
}
