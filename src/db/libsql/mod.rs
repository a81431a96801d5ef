//! libSQL/Turso backend.
//!
//! Every trait method opens its own connection; multi-statement writes run
//! inside `BEGIN IMMEDIATE` so concurrent writers queue on the busy timeout
//! instead of failing mid-transaction.

mod directory;
mod lifecycle;
mod routing;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use libsql::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::db::Database;
use crate::db::libsql_migrations::SCHEMA;
use crate::error::DatabaseError;

const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Embedded or replicated libSQL database.
pub struct LibSqlBackend {
    db: libsql::Database,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open libsql database: {e}")))?;
        let backend = Self { db };

        let conn = backend.connect().await?;
        let mut rows = conn.query("PRAGMA journal_mode = WAL", ()).await?;
        let _ = rows.next().await?;
        Ok(backend)
    }

    /// Open a local replica that syncs from a remote libSQL server.
    pub async fn new_remote_replica(
        path: &Path,
        url: &str,
        auth_token: &str,
    ) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let db = libsql::Builder::new_remote_replica(path, url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open libsql replica: {e}")))?;
        db.sync()
            .await
            .map_err(|e| DatabaseError::Pool(format!("initial replica sync failed: {e}")))?;
        Ok(Self { db })
    }

    pub async fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("failed to connect: {e}")))?;
        let mut rows = conn
            .query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await?;
        let _ = rows.next().await?;
        Ok(conn)
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("libsql schema: {e}")))?;
        Ok(())
    }
}

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn opt_ts(ts: Option<DateTime<Utc>>) -> Value {
    match ts {
        Some(ts) => Value::Text(fmt_ts(&ts)),
        None => Value::Null,
    }
}

/// Accepts RFC 3339 and SQLite's `YYYY-MM-DD HH:MM:SS` form.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(err) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| err),
    }
}

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    match row.get_value(idx) {
        Ok(Value::Text(s)) => s,
        Ok(Value::Integer(n)) => n.to_string(),
        Ok(Value::Real(n)) => n.to_string(),
        _ => String::new(),
    }
}

pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    match row.get_value(idx) {
        Ok(Value::Text(s)) => Some(s),
        Ok(Value::Integer(n)) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    get_opt_i64(row, idx).unwrap_or(0)
}

pub(crate) fn get_opt_i64(row: &libsql::Row, idx: i32) -> Option<i64> {
    match row.get_value(idx) {
        Ok(Value::Integer(n)) => Some(n),
        Ok(Value::Real(n)) => Some(n as i64),
        Ok(Value::Text(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn get_f64(row: &libsql::Row, idx: i32) -> f64 {
    match row.get_value(idx) {
        Ok(Value::Real(n)) => n,
        Ok(Value::Integer(n)) => n as f64,
        Ok(Value::Text(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub(crate) fn get_bool(row: &libsql::Row, idx: i32) -> bool {
    get_i64(row, idx) != 0
}

pub(crate) fn get_i32(row: &libsql::Row, idx: i32) -> Result<i32, DatabaseError> {
    let raw = get_i64(row, idx);
    i32::try_from(raw)
        .map_err(|_| DatabaseError::Serialization(format!("column {idx} out of i32 range: {raw}")))
}

pub(crate) fn opt_text(value: Option<&str>) -> Value {
    match value {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

pub(crate) fn opt_text_owned(value: Option<String>) -> Value {
    match value {
        Some(s) => Value::Text(s),
        None => Value::Null,
    }
}

pub(crate) fn opt_i64(value: Option<i64>) -> Value {
    match value {
        Some(n) => Value::Integer(n),
        None => Value::Null,
    }
}

pub(crate) fn opt_uuid(value: Option<Uuid>) -> Value {
    opt_text_owned(value.map(|id| id.to_string()))
}

pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {field} uuid: {e}")))
}

pub(crate) fn parse_opt_uuid(
    raw: Option<String>,
    field: &str,
) -> Result<Option<Uuid>, DatabaseError> {
    raw.filter(|value| !value.is_empty())
        .map(|value| parse_uuid(&value, field))
        .transpose()
}

pub(crate) fn parse_dt(raw: &str, field: &str) -> Result<DateTime<Utc>, DatabaseError> {
    parse_timestamp(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {field} timestamp: {e}")))
}

pub(crate) fn parse_dt_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    match raw {
        Some(value) => parse_timestamp(&value)
            .map(Some)
            .map_err(|e| DatabaseError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

pub(crate) fn to_json_text<T: Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Decode a JSON column; blank text decodes as `T::default()`.
pub(crate) fn from_json_text<T: DeserializeOwned + Default>(
    raw: &str,
    field: &str,
) -> Result<T, DatabaseError> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {field} json: {e}")))
}

/// Placeholder list `?start, ?start+1, ...` for `count` positional params.
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::LibSqlBackend;
    use crate::db::Database;

    pub(crate) struct TestBackend {
        pub backend: Arc<LibSqlBackend>,
        _tmpdir: tempfile::TempDir,
    }

    pub(crate) async fn setup_backend() -> TestBackend {
        // Temp-file database so every connection shares schema and state.
        let tmpdir = tempfile::tempdir().expect("tempdir");
        let db_path = tmpdir.path().join("leadflow_test.db");
        let backend = LibSqlBackend::new_local(&db_path)
            .await
            .expect("local backend should initialize");
        backend
            .run_migrations()
            .await
            .expect("migrations should succeed");
        TestBackend {
            backend: Arc::new(backend),
            _tmpdir: tmpdir,
        }
    }

    impl TestBackend {
        /// Shared handle for engine-level tests; keep the fixture alive.
        pub(crate) fn database(&self) -> Arc<dyn Database> {
            self.backend.clone()
        }
    }
}
