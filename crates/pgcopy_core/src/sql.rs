//! Identifier and literal quoting for generated SQL.

use crate::error::PgCopyError;

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fully qualify a table name.
pub fn qualify(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Quote a string literal using the driver's escaping rules.
///
/// Fails on embedded NUL, which no PostgreSQL text value can hold.
pub fn quote_literal(value: &str) -> Result<String, PgCopyError> {
    if value.contains('\0') {
        return Err(PgCopyError::internal("A string literal cannot contain NUL (0x00) characters"));
    }
    // escape_literal emits ` E'...'` (with a leading space) when backslashes are present
    Ok(postgres_protocol::escape::escape_literal(value).trim_start().to_string())
}

/// Quote a string literal by doubling single quotes. Never fails.
pub fn naive_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Comma-separated quoted identifiers.
pub fn ident_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names.into_iter().map(quote_ident).collect::<Vec<_>>().join(", ")
}
