//! Identifier validation, quoting, and file-name derivation.
//!
//! SQL identifiers cannot be bound as parameters, so every dialect quotes them
//! through these helpers. Raw SQL fragments that travel between systems
//! (row filters, default expressions) are screened for statement injection.

use crate::error::{MigrateError, Result};

/// Maximum identifier length (conservative limit across databases).
/// - PostgreSQL: 63 bytes
/// - SQL Server: 128 characters
/// - MySQL: 64 characters
/// - Firebird: 63 characters
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier.
///
/// Rejects empty names, names containing NUL, and names over
/// [`MAX_IDENTIFIER_LENGTH`] bytes.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {}): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Wrap `name` in `open`/`close`, doubling any embedded `close` character.
pub fn quote_with(name: &str, open: char, close: char) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push(open);
    for ch in name.chars() {
        if ch == close {
            out.push(close);
        }
        out.push(ch);
    }
    out.push(close);
    out
}

/// Screen a raw SQL fragment (row filter or default expression).
///
/// Fragments are applied verbatim in the target dialect, so only patterns
/// that could smuggle in a second statement are rejected.
pub fn validate_sql_fragment(kind: &str, fragment: &str) -> Result<()> {
    if fragment.contains(';') {
        return Err(MigrateError::Config(format!(
            "SECURITY: {} contains a semicolon: {:?}",
            kind, fragment
        )));
    }
    if fragment.contains("--") || fragment.contains("/*") || fragment.contains("*/") {
        return Err(MigrateError::Config(format!(
            "SECURITY: {} contains SQL comment markers: {:?}",
            kind, fragment
        )));
    }
    let lower = fragment.to_lowercase();
    if lower
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|word| word == "exec" || word == "execute" || word == "xp_cmdshell")
    {
        return Err(MigrateError::Config(format!(
            "SECURITY: {} contains EXEC: {:?}",
            kind, fragment
        )));
    }
    Ok(())
}

/// Data file stem for a table: `{schema}_{table}` with characters that are
/// unsafe in file names replaced by `_`.
pub fn file_stem(schema: &str, table: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect()
    };
    format!("{}_{}", clean(schema), clean(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bad\0name").is_err());
        assert!(validate_identifier(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_quote_with_escapes_closer() {
        assert_eq!(quote_with("users", '[', ']'), "[users]");
        assert_eq!(quote_with("a]b", '[', ']'), "[a]]b]");
        assert_eq!(quote_with("a\"b", '"', '"'), "\"a\"\"b\"");
        assert_eq!(quote_with("a`b", '`', '`'), "`a``b`");
    }

    #[test]
    fn test_sql_fragment_screening() {
        assert!(validate_sql_fragment("filter", "OrderDate >= '2020-01-01'").is_ok());
        assert!(validate_sql_fragment("filter", "status IN ('a', 'b')").is_ok());
        assert!(validate_sql_fragment("filter", "1=1; DROP TABLE x").is_err());
        assert!(validate_sql_fragment("filter", "1=1 -- x").is_err());
        assert!(validate_sql_fragment("default", "exec('x')").is_err());
        // Column names that merely contain "exec" are fine
        assert!(validate_sql_fragment("filter", "executor_id = 4").is_ok());
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("dbo", "Orders"), "dbo_Orders");
        assert_eq!(file_stem("dbo", "a/b:c"), "dbo_a_b_c");
    }
}
