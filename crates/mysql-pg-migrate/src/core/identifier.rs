//! Identifier validation, quoting, and literal escaping for generated SQL.
//!
//! Identifiers (table, column, schema, constraint names) cannot be bound as
//! statement parameters, so every generated statement goes through these
//! helpers: validate, quote with the dialect's delimiter, double the
//! delimiter inside the name.

use sha2::{Digest, Sha256};

use crate::error::{MigrateError, Result};

/// Maximum source identifier length (MySQL allows 64 characters).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// PostgreSQL truncates identifiers beyond this many bytes.
pub const PG_MAX_IDENTIFIER_BYTES: usize = 63;

/// Validate an identifier.
///
/// Rejects empty identifiers, identifiers containing null bytes, and
/// identifiers longer than [`MAX_IDENTIFIER_LENGTH`] bytes.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// ```
/// use mysql_pg_migrate::core::identifier::quote_pg;
///
/// assert_eq!(quote_pg("users").unwrap(), "\"users\"");
/// assert_eq!(quote_pg("odd\"name").unwrap(), "\"odd\"\"name\"");
/// ```
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a MySQL identifier using backticks.
pub fn quote_mysql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Qualify a PostgreSQL relation name with its schema.
pub fn qualify_pg(schema: &str, name: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(name)?))
}

/// Quote a PostgreSQL string literal.
///
/// Uses an `E''` literal only when the value contains a backslash, so plain
/// strings stay readable in logs.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// Hex digits of the name hash appended to shortened object names.
const NAME_HASH_CHARS: usize = 8;

/// Build a PostgreSQL object name from parts joined by `_`.
///
/// MySQL index and constraint names are only unique per table while
/// PostgreSQL index names share the schema namespace, so derived names carry
/// the table name. A name over 63 bytes keeps a prefix cut on a character
/// boundary and ends in `_` plus a hash of the full name, so two long names
/// that share a prefix stay distinct.
pub fn pg_object_name(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_");

    if joined.len() <= PG_MAX_IDENTIFIER_BYTES {
        return joined;
    }

    let digest = hex::encode(Sha256::digest(joined.as_bytes()));
    let mut end = PG_MAX_IDENTIFIER_BYTES - NAME_HASH_CHARS - 1;
    while !joined.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}_{}", &joined[..end], &digest[..NAME_HASH_CHARS])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("column with spaces").is_ok());
        assert!(validate_identifier("日本語").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        let result = validate_identifier("");
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        let result = validate_identifier("table\0name");
        assert!(result.unwrap_err().to_string().contains("null byte"));
    }

    #[test]
    fn test_validate_identifier_rejects_too_long() {
        let long_name = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert!(validate_identifier(&long_name).is_err());
    }

    #[test]
    fn test_quote_mysql_escapes_backticks() {
        assert_eq!(quote_mysql("users").unwrap(), "`users`");
        assert_eq!(quote_mysql("table`name").unwrap(), "`table``name`");
    }

    #[test]
    fn test_qualify_pg() {
        assert_eq!(
            qualify_pg("public", "users").unwrap(),
            "\"public\".\"users\""
        );
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
        assert_eq!(quote_literal("C:\\temp"), "E'C:\\\\temp'");
    }

    #[test]
    fn test_pg_object_name_truncates_on_char_boundary() {
        assert_eq!(pg_object_name(&["orders", "idx_customer"]), "orders_idx_customer");

        let long = "é".repeat(40);
        let name = pg_object_name(&[&long, "idx"]);
        assert!(name.len() <= PG_MAX_IDENTIFIER_BYTES);
        let (prefix, hash) = name.rsplit_once('_').unwrap();
        assert!(prefix.chars().all(|c| c == 'é'));
        assert_eq!(hash.len(), NAME_HASH_CHARS);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_pg_object_name_keeps_long_names_distinct() {
        let created = pg_object_name(&[
            "customer_subscription_billing_history",
            "idx_customer_subscription_created_at",
        ]);
        let updated = pg_object_name(&[
            "customer_subscription_billing_history",
            "idx_customer_subscription_updated_at",
        ]);
        assert_ne!(created, updated);
        assert!(created.len() <= PG_MAX_IDENTIFIER_BYTES);
        assert!(updated.len() <= PG_MAX_IDENTIFIER_BYTES);
        assert!(created.starts_with("customer_subscription_billing_history_idx_"));

        // Same input, same name: re-runs address the object they created
        assert_eq!(
            created,
            pg_object_name(&[
                "customer_subscription_billing_history",
                "idx_customer_subscription_created_at",
            ])
        );
    }
}
