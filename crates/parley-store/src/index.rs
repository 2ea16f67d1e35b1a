// ABOUTME: SQLite-backed relational index: one long-lived connection, schema creation, and typed
// ABOUTME: parameterized execute/query/scalar primitives plus transaction scoping.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params_from_iter};
use thiserror::Error;

use crate::schema::SCHEMA;

/// Errors that can occur during relational index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("relational index is not open")]
    NotOpen,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bound statement parameter. All integral types widen to `Integer`,
/// booleans bind as 0/1 and timestamps as epoch milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(rusqlite::types::ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

macro_rules! widen_integer {
    ($($t:ty),*) => {
        $(impl From<$t> for SqlValue {
            fn from(v: $t) -> Self {
                SqlValue::Integer(v as i64)
            }
        })*
    };
}

widen_integer!(i8, i16, i32, i64, u8, u16, u32, usize);

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(if v { 1 } else { 0 })
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Integer(v.timestamp_millis())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Build a `&[SqlValue]` parameter slice from heterogeneous values.
#[macro_export]
macro_rules! sql_args {
    () => {
        &[][..]
    };
    ($($v:expr),+ $(,)?) => {
        &[$($crate::index::SqlValue::from($v)),+][..]
    };
}

/// The primitives, bound to a connection or to an open transaction.
pub struct IndexSession<'a> {
    conn: &'a Connection,
}

impl IndexSession<'_> {
    /// Run a statement, returning the number of rows changed.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize, IndexError> {
        Ok(self.conn.execute(sql, params_from_iter(params.iter()))?)
    }

    pub fn query<T, F>(&self, sql: &str, params: &[SqlValue], mapper: F) -> Result<Vec<T>, IndexError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), mapper)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn query_one<T, F>(&self, sql: &str, params: &[SqlValue], mapper: F) -> Result<Option<T>, IndexError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self
            .conn
            .query_row(sql, params_from_iter(params.iter()), mapper)
            .optional()?)
    }

    /// First column of the first row as an integer; no row or NULL reads as 0.
    pub fn scalar(&self, sql: &str, params: &[SqlValue]) -> Result<i64, IndexError> {
        let value: Option<Option<i64>> = self
            .conn
            .query_row(sql, params_from_iter(params.iter()), |row| row.get(0))
            .optional()?;
        Ok(value.flatten().unwrap_or(0))
    }
}

/// Owns the single long-lived SQLite connection behind the index. The
/// connection runs in WAL mode with foreign keys enforced.
pub struct RelationalIndex {
    conn: Mutex<Option<Connection>>,
}

impl RelationalIndex {
    /// Open or create the index database, creating parent directories and
    /// the full schema if absent.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %path.display(), "relational index open");

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Close the connection. Later calls fail with `NotOpen`.
    pub fn close(&self) {
        self.lock().take();
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the connection outside of any explicit transaction.
    pub fn with_session<T, E>(&self, f: impl FnOnce(&IndexSession<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<IndexError>,
    {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(IndexError::NotOpen)?;
        f(&IndexSession { conn })
    }

    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize, IndexError> {
        self.with_session(|s| s.execute(sql, params))
    }

    pub fn query<T, F>(&self, sql: &str, params: &[SqlValue], mapper: F) -> Result<Vec<T>, IndexError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_session(|s| s.query(sql, params, mapper))
    }

    pub fn query_one<T, F>(&self, sql: &str, params: &[SqlValue], mapper: F) -> Result<Option<T>, IndexError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_session(|s| s.query_one(sql, params, mapper))
    }

    pub fn scalar(&self, sql: &str, params: &[SqlValue]) -> Result<i64, IndexError> {
        self.with_session(|s| s.scalar(sql, params))
    }

    /// Run `f` inside a transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&IndexSession<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<IndexError>,
    {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(IndexError::NotOpen)?;
        let tx = conn.transaction().map_err(IndexError::from)?;

        let result = f(&IndexSession { conn: &tx });
        match result {
            Ok(value) => {
                tx.commit().map_err(IndexError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RelationalIndex) {
        let dir = TempDir::new().unwrap();
        let idx = RelationalIndex::open(&dir.path().join("nested/index.db")).unwrap();
        (dir, idx)
    }

    #[test]
    fn open_creates_every_table() {
        let (_dir, idx) = open_temp();
        for table in [
            "projects",
            "exchanges",
            "code_elements",
            "summary_nodes",
            "summary_config",
            "collections",
            "collection_items",
            "bookmarks",
            "bookmark_tags",
            "config",
        ] {
            let count = idx
                .scalar(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    sql_args![table],
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn reopening_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.db");
        let idx = RelationalIndex::open(&path).unwrap();
        idx.execute("INSERT INTO config (key, value) VALUES ('k', 'v')", sql_args![])
            .unwrap();
        drop(idx);

        let idx = RelationalIndex::open(&path).unwrap();
        assert_eq!(idx.scalar("SELECT COUNT(*) FROM config", sql_args![]).unwrap(), 1);
    }

    #[test]
    fn parameters_normalize_types() {
        let (_dir, idx) = open_temp();
        idx.execute(
            "INSERT INTO projects (id, name, path, createdAt, lastOpenedAt, isActive) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            sql_args!["p1", String::from("Proj"), "/tmp/p", 5_u32, 7_i64, true],
        )
        .unwrap();

        let row = idx
            .query_one(
                "SELECT createdAt, lastOpenedAt, isActive FROM projects WHERE id = ?1",
                sql_args!["p1"],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, bool>(2)?)),
            )
            .unwrap();
        assert_eq!(row, Some((5, 7, true)));

        let missing = idx
            .query_one("SELECT id FROM projects WHERE id = ?1", sql_args![None::<String>], |r| {
                r.get::<_, String>(0)
            })
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn scalar_reads_null_as_zero() {
        let (_dir, idx) = open_temp();
        let sum = idx
            .scalar("SELECT SUM(totalTokens) FROM exchanges", sql_args![])
            .unwrap();
        assert_eq!(sum, 0);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let (_dir, idx) = open_temp();

        let result: Result<(), IndexError> = idx.transaction(|tx| {
            tx.execute("INSERT INTO config (key, value) VALUES ('a', '1')", sql_args![])?;
            // Duplicate primary key fails and aborts the whole block.
            tx.execute("INSERT INTO config (key, value) VALUES ('a', '2')", sql_args![])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(idx.scalar("SELECT COUNT(*) FROM config", sql_args![]).unwrap(), 0);

        idx.transaction(|tx| {
            tx.execute("INSERT INTO config (key, value) VALUES ('b', '1')", sql_args![])
        })
        .unwrap();
        assert_eq!(idx.scalar("SELECT COUNT(*) FROM config", sql_args![]).unwrap(), 1);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let (_dir, idx) = open_temp();
        let result = idx.execute(
            "INSERT INTO exchanges (id, projectId, providerId, modelId, purpose, timestamp, rawFile)
             VALUES ('e1', 'nope', 'p', 'm', 'CHAT', 0, 'f.jsonl')",
            sql_args![],
        );
        assert!(matches!(result, Err(IndexError::Sqlite(_))));
    }

    #[test]
    fn closed_index_reports_not_open() {
        let (_dir, idx) = open_temp();
        idx.close();
        assert!(!idx.is_open());
        let result = idx.scalar("SELECT 1", sql_args![]);
        assert!(matches!(result, Err(IndexError::NotOpen)));
    }
}
