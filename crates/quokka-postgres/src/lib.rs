//! PostgreSQL-backed document storage for QuokkaDB.
//!
//! Each MongoDB database maps to a schema and each collection to a table
//! with a single `_jsonb` column holding one document per row in the tagged
//! extended-JSON form. Schemas and tables are created lazily on first
//! insert.
//!
//! The crate is wire-agnostic: it consumes parsed filter/update/projection
//! documents and produces documents, leaving command parsing and reply
//! construction to the server.

pub mod projection;
pub mod storage;
pub mod update;
pub mod where_clause;

use quokka_core::error::{Error, ErrorCode, Result};

pub use projection::Projection;
pub use storage::{DbStats, FindAndModifyResult, PgStorage, UpdateResult};
pub use where_clause::{Placeholder, SqlArg};

/// A validated `database.collection` pair, usable as quoted SQL identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    db: String,
    collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Result<Self> {
        let db = db.into();
        let collection = collection.into();
        validate_name("database", &db)?;
        validate_name("collection", &collection)?;
        Ok(Namespace { db, collection })
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The quoted `"db"."collection"` form used in SQL.
    pub fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.db, self.collection)
    }

    /// The dotted `db.collection` form used in cursor namespaces.
    pub fn dotted(&self) -> String {
        format!("{}.{}", self.db, self.collection)
    }
}

/// Names become SQL identifiers, so they are restricted to a safe subset
/// well inside PostgreSQL's 63-byte identifier limit.
pub(crate) fn validate_name(what: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                && name.len() <= 63
        }
        None => false,
    };
    if !valid {
        return Err(Error::command(
            ErrorCode::BadValue,
            format!("invalid {what} name {name:?}"),
        ));
    }
    Ok(())
}

pub(crate) fn map_sqlx(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

/// `42P01 undefined_table`: reads of a collection that was never created.
pub(crate) fn is_undefined_table(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

/// `3F000 invalid_schema_name`: the database does not exist.
pub(crate) fn is_undefined_schema(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("3F000"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_accepts_reasonable_names() {
        let ns = Namespace::new("test", "values").unwrap();
        assert_eq!(ns.qualified(), "\"test\".\"values\"");
        assert_eq!(ns.dotted(), "test.values");
        assert!(Namespace::new("_db", "a-b_c9").is_ok());
    }

    #[test]
    fn namespace_rejects_injection_attempts() {
        assert!(Namespace::new("te\"st", "c").is_err());
        assert!(Namespace::new("db", "c; DROP TABLE x").is_err());
        assert!(Namespace::new("", "c").is_err());
        assert!(Namespace::new("db", "").is_err());
        assert!(Namespace::new("9db", "c").is_err());
        assert!(Namespace::new("db", "a".repeat(64)).is_err());
    }
}
