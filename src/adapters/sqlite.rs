//! Read-only SQLite data store.
//!
//! Connections are opened with `SQLITE_OPEN_READ_ONLY`, pooled, and used on
//! the blocking thread pool. Statements that SQLite itself reports as
//! writing are refused before they run, independently of the keyword policy.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use super::DataStore;
use crate::config::DatabaseSettings;
use crate::core::error::DataStoreError;
use crate::domain::Row;

struct Pool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    permits: Semaphore,
}

impl Pool {
    fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    fn take(&self) -> Result<Connection, DataStoreError> {
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        match idle {
            Some(conn) => Ok(conn),
            None => Self::open_connection(&self.path)
                .map_err(|e| DataStoreError::Unavailable(e.to_string())),
        }
    }

    fn give_back(&self, conn: Connection) {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).push(conn);
    }
}

/// Pooled read-only SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    pool: Arc<Pool>,
    max_rows: usize,
}

impl SqliteStore {
    /// Open the database, failing early if it cannot be read
    pub fn open(settings: &DatabaseSettings) -> Result<Self> {
        let first = Pool::open_connection(&settings.path)
            .with_context(|| format!("Failed to open database: {}", settings.path.display()))?;

        Ok(Self {
            pool: Arc::new(Pool {
                path: settings.path.clone(),
                idle: Mutex::new(vec![first]),
                permits: Semaphore::new(settings.pool_size.max(1)),
            }),
            max_rows: settings.max_rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.pool.path
    }

    /// Run `work` on a pooled connection off the async runtime
    async fn with_connection<T, F>(&self, work: F) -> Result<T, DataStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DataStoreError> + Send + 'static,
    {
        let _permit = self
            .pool
            .permits
            .acquire()
            .await
            .map_err(|e| DataStoreError::Unavailable(e.to_string()))?;

        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.take()?;
            let result = work(&conn);
            pool.give_back(conn);
            result
        })
        .await
        .map_err(|e| DataStoreError::Unavailable(format!("query task failed: {}", e)))?
    }
}

fn query_error(e: rusqlite::Error) -> DataStoreError {
    DataStoreError::Query(e.to_string())
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

fn run_query(conn: &Connection, sql: &str, max_rows: usize) -> Result<Vec<Row>, DataStoreError> {
    let mut stmt = conn.prepare(sql).map_err(query_error)?;
    if !stmt.readonly() {
        return Err(DataStoreError::Query(
            "attempt to write a readonly database".to_string(),
        ));
    }

    // Duplicate column names (e.g. two joined `Name` columns) get a suffix
    let mut columns: Vec<String> = Vec::with_capacity(stmt.column_count());
    for (idx, name) in stmt.column_names().into_iter().enumerate() {
        if columns.iter().any(|existing| existing == name) {
            columns.push(format!("{}_{}", name, idx));
        } else {
            columns.push(name.to_string());
        }
    }

    let mut rows = stmt.query([]).map_err(query_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(query_error)? {
        if out.len() >= max_rows {
            debug!(max_rows, "Result truncated at row cap");
            break;
        }
        let mut record = Row::new();
        for (idx, column) in columns.iter().enumerate() {
            let value = row.get_ref(idx).map_err(query_error)?;
            record.insert(column.clone(), to_json(value));
        }
        out.push(record);
    }
    Ok(out)
}

#[async_trait]
impl DataStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn list_tables(&self) -> Result<BTreeSet<String>, DataStoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )
                .map_err(|e| DataStoreError::Unavailable(e.to_string()))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .and_then(|rows| rows.collect::<rusqlite::Result<BTreeSet<String>>>())
                .map_err(|e| DataStoreError::Unavailable(e.to_string()))?;
            Ok(names)
        })
        .await
    }

    async fn schema_of(&self, table: &str) -> Result<String, DataStoreError> {
        let table = table.to_string();
        self.with_connection(move |conn| {
            let ddl: Option<Option<String>> = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [&table],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| DataStoreError::Unavailable(e.to_string()))?;
            match ddl {
                Some(ddl) => Ok(ddl.unwrap_or_default()),
                None => Err(DataStoreError::Query(format!("no such table: {}", table))),
            }
        })
        .await
    }

    async fn execute_read_only(&self, sql: &str) -> Result<Vec<Row>, DataStoreError> {
        let sql = sql.to_string();
        let max_rows = self.max_rows;
        self.with_connection(move |conn| run_query(conn, &sql, max_rows))
            .await
    }
}
