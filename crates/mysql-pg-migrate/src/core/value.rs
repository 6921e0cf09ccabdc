//! Row values as read from the source.
//!
//! The MySQL reader selects every column either as text (`CAST(.. AS CHAR)`)
//! or as raw bytes, so a value is one of three shapes. Typed interpretation
//! happens on the target side of the COPY text protocol, never in Rust
//! floating point.

/// A single source value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceValue {
    /// SQL NULL.
    Null,

    /// Textual rendering of the value in the connection character set.
    Text(String),

    /// Raw bytes (binary, blob, and bit columns).
    Bytes(Vec<u8>),
}

impl SourceValue {
    /// Shorthand for a text value.
    pub fn text(value: impl Into<String>) -> Self {
        SourceValue::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SourceValue::Null)
    }

    /// Approximate payload size in bytes.
    pub fn size_hint(&self) -> usize {
        match self {
            SourceValue::Null => 0,
            SourceValue::Text(s) => s.len(),
            SourceValue::Bytes(b) => b.len(),
        }
    }
}

impl From<Option<String>> for SourceValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(SourceValue::Null, SourceValue::Text)
    }
}

impl From<Option<Vec<u8>>> for SourceValue {
    fn from(value: Option<Vec<u8>>) -> Self {
        value.map_or(SourceValue::Null, SourceValue::Bytes)
    }
}

/// One source row, in descriptor column order.
pub type Row = Vec<SourceValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_option() {
        assert_eq!(SourceValue::from(None::<String>), SourceValue::Null);
        assert_eq!(
            SourceValue::from(Some(vec![0u8, 1])),
            SourceValue::Bytes(vec![0, 1])
        );
        assert_eq!(SourceValue::text("abc").size_hint(), 3);
    }
}
