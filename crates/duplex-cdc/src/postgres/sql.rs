//! Generic SQL generation from JSON row images
//!
//! Replicated rows travel as untyped column maps; the statements here
//! route every image through `jsonb_populate_record`, so PostgreSQL does
//! the per-column typing against the target table's row type and the
//! applier stays decoupled from the schema. Table and column names are
//! validated before interpolation; values only ever travel as a single
//! JSONB parameter.

use duplex_core::{ReplicationError, Result};
use serde_json::Value;

/// Validate and quote an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(ReplicationError::Identifier(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}

/// `SELECT version` probe by primary key; `$1` is the row image.
pub(crate) fn probe_version_sql(table: &str) -> Result<String> {
    let table = quote_ident(table)?;
    Ok(format!(
        "SELECT t.\"version\" FROM {table} t, \
         jsonb_populate_record(NULL::{table}, $1) r WHERE t.\"id\" = r.\"id\""
    ))
}

/// Full-row INSERT from the image in `$1`.
pub(crate) fn insert_sql(table: &str) -> Result<String> {
    let table = quote_ident(table)?;
    Ok(format!(
        "INSERT INTO {table} SELECT r.* FROM jsonb_populate_record(NULL::{table}, $1) r"
    ))
}

/// Overwrite every non-key column from the image in `$1`, keyed by `id`.
pub(crate) fn update_sql(table: &str, image: &Value) -> Result<String> {
    let quoted_table = quote_ident(table)?;
    let columns = image
        .as_object()
        .ok_or_else(|| ReplicationError::invalid_event("row image is not an object"))?;

    let mut targets = Vec::new();
    let mut sources = Vec::new();
    for column in columns.keys().filter(|c| c.as_str() != "id") {
        let quoted = quote_ident(column)?;
        targets.push(quoted.clone());
        sources.push(format!("r.{quoted}"));
    }
    if targets.is_empty() {
        return Err(ReplicationError::invalid_event(
            "row image carries no non-key columns to update",
        ));
    }

    Ok(format!(
        "UPDATE {quoted_table} t SET ({}) = \
         (SELECT {} FROM jsonb_populate_record(NULL::{quoted_table}, $1) r) \
         WHERE t.\"id\" = (SELECT r.\"id\" FROM jsonb_populate_record(NULL::{quoted_table}, $1) r)",
        targets.join(", "),
        sources.join(", ")
    ))
}

/// Delete by the primary key of the image in `$1`.
pub(crate) fn delete_sql(table: &str) -> Result<String> {
    let table = quote_ident(table)?;
    Ok(format!(
        "DELETE FROM {table} t USING jsonb_populate_record(NULL::{table}, $1) r \
         WHERE t.\"id\" = r.\"id\""
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_ident_accepts_plain_names() {
        assert_eq!(quote_ident("users").unwrap(), "\"users\"");
        assert_eq!(quote_ident("order_items2").unwrap(), "\"order_items2\"");
        assert_eq!(quote_ident("_private").unwrap(), "\"_private\"");
    }

    #[test]
    fn test_quote_ident_rejects_hostile_names() {
        for name in [
            "",
            "Users",
            "users; DROP TABLE users",
            "users\"",
            "1users",
            "name with space",
        ] {
            let err = quote_ident(name).unwrap_err();
            assert!(err.is_poison(), "{name:?} must be rejected");
        }
    }

    #[test]
    fn test_quote_ident_rejects_overlong_names() {
        let name = "a".repeat(64);
        assert!(quote_ident(&name).is_err());
    }

    #[test]
    fn test_probe_version_sql() {
        assert_eq!(
            probe_version_sql("users").unwrap(),
            "SELECT t.\"version\" FROM \"users\" t, \
             jsonb_populate_record(NULL::\"users\", $1) r WHERE t.\"id\" = r.\"id\""
        );
    }

    #[test]
    fn test_insert_sql() {
        assert_eq!(
            insert_sql("users").unwrap(),
            "INSERT INTO \"users\" SELECT r.* FROM jsonb_populate_record(NULL::\"users\", $1) r"
        );
    }

    #[test]
    fn test_update_sql_excludes_the_key() {
        let image = json!({"id": 1, "name": "x", "version": 2});
        let sql = update_sql("users", &image).unwrap();
        assert!(sql.contains("SET (\"name\", \"version\")"));
        assert!(sql.contains("SELECT r.\"name\", r.\"version\""));
        assert!(sql.contains("WHERE t.\"id\""));
        assert!(!sql.contains("SET (\"id\""));
    }

    #[test]
    fn test_update_sql_requires_non_key_columns() {
        let err = update_sql("users", &json!({"id": 1})).unwrap_err();
        assert!(err.is_poison());
        let err = update_sql("users", &json!("not an object")).unwrap_err();
        assert!(err.is_poison());
    }

    #[test]
    fn test_delete_sql() {
        assert_eq!(
            delete_sql("users").unwrap(),
            "DELETE FROM \"users\" t USING jsonb_populate_record(NULL::\"users\", $1) r \
             WHERE t.\"id\" = r.\"id\""
        );
    }
}
