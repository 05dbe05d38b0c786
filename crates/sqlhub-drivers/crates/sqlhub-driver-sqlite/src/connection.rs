//! SQLite connection implementation
//!
//! rusqlite is a blocking API, so every database call runs on the tokio
//! blocking pool; the connection itself lives behind a mutex shared with
//! those blocking tasks.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection as RusqliteConnection, InterruptHandle, OpenFlags, params_from_iter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use sqlhub_core::{
    ColumnMeta, Connection, ConnectFailureKind, DatabaseKind, EngineError, QueryCancelHandle,
    QueryResult, Result, Row, RowBatch, StatementResult, StreamSummary, Transaction, Value,
    ValueKind,
};

/// Cancel handle wrapping the rusqlite `InterruptHandle`.
///
/// The interrupted query fails with SQLITE_INTERRUPT, which surfaces as a
/// query error to the caller that requested cancellation.
pub struct SqliteCancelHandle {
    interrupt_handle: Arc<InterruptHandle>,
}

impl QueryCancelHandle for SqliteCancelHandle {
    fn cancel(&self) {
        tracing::debug!("interrupting SQLite query");
        self.interrupt_handle.interrupt();
    }
}

/// SQLite connection wrapper
pub struct SqliteConnection {
    conn: Arc<Mutex<RusqliteConnection>>,
    interrupt_handle: Arc<InterruptHandle>,
    closed: AtomicBool,
}

impl SqliteConnection {
    /// Open a SQLite database file (or `:memory:`)
    pub fn open(path: &str) -> Result<Self> {
        tracing::info!(path = %path, "opening SQLite database");

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if path == ":memory:" {
            RusqliteConnection::open_in_memory().map_err(|e| {
                EngineError::connection(
                    ConnectFailureKind::Other,
                    format!("failed to open in-memory database: {}", e),
                )
            })?
        } else {
            if !path.starts_with("file:") {
                let file_path = std::path::Path::new(path);
                if let Some(parent) = file_path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                {
                    return Err(EngineError::connection(
                        ConnectFailureKind::DatabaseMissing,
                        format!("parent directory does not exist: {}", parent.display()),
                    ));
                }
            }

            RusqliteConnection::open_with_flags(path, flags).map_err(|e| {
                EngineError::connection(
                    ConnectFailureKind::DatabaseMissing,
                    format!("failed to open SQLite database at '{}': {}", path, e),
                )
            })?
        };

        conn.pragma_update(None, "foreign_keys", "ON").map_err(|e| {
            EngineError::connection(
                ConnectFailureKind::Other,
                format!("failed to enable foreign keys: {}", e),
            )
        })?;

        let interrupt_handle = Arc::new(conn.get_interrupt_handle());

        tracing::info!(path = %path, "SQLite database connection established");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt_handle,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn shared(&self) -> Arc<Mutex<RusqliteConnection>> {
        Arc::clone(&self.conn)
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RusqliteConnection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            op(&guard)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("SQLite task failed: {}", e)))?
    }
}

/// Map a declared column type to the canonical value kind.
///
/// SQLite's affinity rules mean the declared type is advisory; the mapping
/// follows the same keyword matching the engine itself uses.
pub(crate) fn map_decl_type(decl: &str) -> ValueKind {
    let upper = decl.to_uppercase();
    if upper.contains("BOOL") {
        ValueKind::Bool
    } else if upper.contains("INT") {
        ValueKind::Int64
    } else if upper.contains("JSON") {
        ValueKind::Json
    } else if upper.contains("UUID") {
        ValueKind::Uuid
    } else if upper.contains("DATETIME") || upper.contains("TIMESTAMP") {
        ValueKind::Timestamp
    } else if upper.contains("DATE") {
        ValueKind::Date
    } else if upper.contains("TIME") {
        ValueKind::Time
    } else if upper.contains("DEC") || upper.contains("NUMERIC") {
        ValueKind::Decimal
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        ValueKind::Float64
    } else if upper.contains("BLOB") {
        ValueKind::Bytes
    } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") {
        ValueKind::Text
    } else {
        ValueKind::Text
    }
}

/// Convert a stored SQLite value into the canonical domain, refining by
/// the column's declared kind where the storage class is ambiguous.
fn value_from_sqlite(value_ref: ValueRef<'_>, kind: ValueKind) -> Value {
    match value_ref {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match kind {
            ValueKind::Bool => Value::Bool(i != 0),
            _ => Value::Int(i),
        },
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match kind {
                ValueKind::Json => serde_json::from_str(&text)
                    .map(Value::Json)
                    .unwrap_or(Value::Text(text)),
                ValueKind::Uuid => text
                    .parse::<uuid::Uuid>()
                    .map(Value::Uuid)
                    .unwrap_or(Value::Text(text)),
                ValueKind::Date => chrono::NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                    .map(Value::Date)
                    .unwrap_or(Value::Text(text)),
                ValueKind::Time => chrono::NaiveTime::parse_from_str(&text, "%H:%M:%S")
                    .or_else(|_| chrono::NaiveTime::parse_from_str(&text, "%H:%M:%S%.f"))
                    .map(Value::Time)
                    .unwrap_or(Value::Text(text)),
                ValueKind::Timestamp => parse_timestamp(&text)
                    .map(Value::Timestamp)
                    .unwrap_or(Value::Text(text)),
                ValueKind::Decimal => Value::Decimal(text),
                _ => Value::Text(text),
            }
        }
    }
}

fn parse_timestamp(text: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&chrono::Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
                .ok()
                .map(|ts| chrono::DateTime::from_naive_utc_and_offset(ts, chrono::Utc))
        })
}

/// Convert canonical values into rusqlite parameter values
pub(crate) fn values_to_sqlite(params: &[Value]) -> Vec<rusqlite::types::Value> {
    params
        .iter()
        .map(|value| match value {
            Value::Null => rusqlite::types::Value::Null,
            Value::Bool(v) => rusqlite::types::Value::Integer(i64::from(*v)),
            Value::Int(v) => rusqlite::types::Value::Integer(*v),
            Value::Float(v) => rusqlite::types::Value::Real(*v),
            Value::Decimal(v) => rusqlite::types::Value::Text(v.clone()),
            Value::Text(v) => rusqlite::types::Value::Text(v.clone()),
            Value::Bytes(v) => rusqlite::types::Value::Blob(v.clone()),
            Value::Timestamp(v) => rusqlite::types::Value::Text(v.to_rfc3339()),
            Value::Date(v) => rusqlite::types::Value::Text(v.to_string()),
            Value::Time(v) => rusqlite::types::Value::Text(v.to_string()),
            Value::Interval(v) => rusqlite::types::Value::Text(v.clone()),
            Value::Uuid(v) => rusqlite::types::Value::Text(v.to_string()),
            Value::Json(v) => rusqlite::types::Value::Text(v.to_string()),
        })
        .collect()
}

/// Run a query on an already-locked connection; shared with streaming.
fn query_locked(
    conn: &RusqliteConnection,
    sql: &str,
    params: &[rusqlite::types::Value],
) -> Result<QueryResult> {
    let start_time = std::time::Instant::now();

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| EngineError::Query(format!("failed to prepare query: {}", e)))?;

    let column_count = stmt.column_count();
    let mut column_names: Vec<String> = Vec::with_capacity(column_count);
    let mut columns: Vec<ColumnMeta> = Vec::with_capacity(column_count);

    for (idx, col) in stmt.columns().iter().enumerate() {
        let name = col.name().to_string();
        let decl = col.decl_type().unwrap_or("DYNAMIC").to_string();
        let kind = map_decl_type(&decl);
        column_names.push(name.clone());
        columns.push(ColumnMeta::new(name, decl, kind, idx));
    }

    let mut rows = Vec::new();
    let mut query_rows = stmt
        .query(params_from_iter(params.iter()))
        .map_err(|e| EngineError::Query(format!("failed to execute query: {}", e)))?;

    while let Some(row) = query_rows
        .next()
        .map_err(|e| EngineError::Query(format!("failed to fetch row: {}", e)))?
    {
        let mut values = Vec::with_capacity(columns.len());
        for (idx, meta) in columns.iter().enumerate() {
            let value_ref = row
                .get_ref(idx)
                .map_err(|e| EngineError::Query(format!("failed to read column {}: {}", idx, e)))?;
            values.push(value_from_sqlite(value_ref, meta.kind));
        }
        rows.push(Row::new(column_names.clone(), values));
    }

    let execution_time_ms = start_time.elapsed().as_millis() as u64;
    tracing::debug!(
        row_count = rows.len(),
        execution_time_ms = execution_time_ms,
        "query executed"
    );

    Ok(QueryResult {
        id: uuid::Uuid::new_v4(),
        columns,
        rows,
        affected_rows: 0,
        truncated: false,
        execution_time_ms,
        editable: None,
        warnings: Vec::new(),
    })
}

#[async_trait]
impl Connection for SqliteConnection {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        let sql = sql.to_string();
        let sqlite_params = values_to_sqlite(params);

        self.run_blocking(move |conn| {
            let start_time = std::time::Instant::now();
            let affected = conn
                .execute(&sql, params_from_iter(sqlite_params.iter()))
                .map_err(|e| EngineError::Query(format!("failed to execute statement: {}", e)))?;
            tracing::debug!(affected_rows = affected, "statement executed");
            Ok(StatementResult {
                affected_rows: affected as u64,
                execution_time_ms: start_time.elapsed().as_millis() as u64,
            })
        })
        .await
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let sql = sql.to_string();
        let sqlite_params = values_to_sqlite(params);
        self.run_blocking(move |conn| query_locked(conn, &sql, &sqlite_params))
            .await
    }

    async fn query_stream(
        &self,
        sql: &str,
        params: &[Value],
        batch_size: usize,
        sink: mpsc::Sender<RowBatch>,
        cancel: CancellationToken,
    ) -> Result<StreamSummary> {
        let sql = sql.to_string();
        let sqlite_params = values_to_sqlite(params);
        let batch_size = batch_size.max(1);

        self.run_blocking(move |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| EngineError::Query(format!("failed to prepare query: {}", e)))?;

            let mut column_names: Vec<String> = Vec::new();
            let mut kinds: Vec<ValueKind> = Vec::new();
            for col in stmt.columns().iter() {
                column_names.push(col.name().to_string());
                kinds.push(map_decl_type(col.decl_type().unwrap_or("DYNAMIC")));
            }

            let mut summary = StreamSummary::default();
            let mut buffer: Vec<Row> = Vec::with_capacity(batch_size);
            let mut query_rows = stmt
                .query(params_from_iter(sqlite_params.iter()))
                .map_err(|e| EngineError::Query(format!("failed to execute query: {}", e)))?;

            loop {
                let row = query_rows
                    .next()
                    .map_err(|e| EngineError::Query(format!("failed to fetch row: {}", e)))?;

                match row {
                    Some(row) => {
                        let mut values = Vec::with_capacity(kinds.len());
                        for (idx, kind) in kinds.iter().enumerate() {
                            let value_ref = row.get_ref(idx).map_err(|e| {
                                EngineError::Query(format!("failed to read column {}: {}", idx, e))
                            })?;
                            values.push(value_from_sqlite(value_ref, *kind));
                        }
                        buffer.push(Row::new(column_names.clone(), values));

                        if buffer.len() >= batch_size {
                            if cancel.is_cancelled() {
                                summary.cancelled = true;
                                return Ok(summary);
                            }
                            let batch = RowBatch {
                                seq: summary.batches,
                                rows: std::mem::take(&mut buffer),
                            };
                            summary.total_rows += batch.rows.len() as u64;
                            summary.batches += 1;
                            if sink.blocking_send(batch).is_err() {
                                summary.cancelled = true;
                                return Ok(summary);
                            }
                        }
                    }
                    None => break,
                }
            }

            if !buffer.is_empty() && !cancel.is_cancelled() {
                let batch = RowBatch {
                    seq: summary.batches,
                    rows: std::mem::take(&mut buffer),
                };
                summary.total_rows += batch.rows.len() as u64;
                summary.batches += 1;
                if sink.blocking_send(batch).is_err() {
                    summary.cancelled = true;
                }
            } else if cancel.is_cancelled() {
                summary.cancelled = true;
            }
            Ok(summary)
        })
        .await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        tracing::debug!("beginning SQLite transaction");
        self.run_blocking(|conn| {
            // DEFERRED acquires the write lock on first write, the default
            // behaviour expected from a plain transaction.
            conn.execute_batch("BEGIN DEFERRED")
                .map_err(|e| EngineError::Query(format!("failed to begin transaction: {}", e)))
        })
        .await?;

        Ok(Box::new(SqliteTransaction {
            conn: Arc::clone(&self.conn),
            finished: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        tracing::info!("closing SQLite connection");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn as_schema_introspection(&self) -> Option<&dyn sqlhub_core::SchemaIntrospection> {
        Some(self)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        Some(Arc::new(SqliteCancelHandle {
            interrupt_handle: Arc::clone(&self.interrupt_handle),
        }))
    }
}

/// SQLite transaction.
///
/// Holds the shared connection handle and issues COMMIT/ROLLBACK through
/// it; a transaction dropped without either is rolled back.
pub struct SqliteTransaction {
    conn: Arc<Mutex<RusqliteConnection>>,
    finished: bool,
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("SQLite transaction dropped without commit or rollback, rolling back");
            let _ = self.conn.lock().execute_batch("ROLLBACK");
        }
    }
}

impl SqliteTransaction {
    async fn finish(mut self: Box<Self>, sql: &'static str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        self.finished = true;
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .execute_batch(sql)
                .map_err(|e| EngineError::Query(format!("failed to {}: {}", sql.to_lowercase(), e)))
        })
        .await
        .map_err(|e| EngineError::Internal(format!("SQLite task failed: {}", e)))?
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        tracing::debug!("committing SQLite transaction");
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        tracing::debug!("rolling back SQLite transaction");
        self.finish("ROLLBACK").await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let sqlite_params = values_to_sqlite(params);
        tokio::task::spawn_blocking(move || query_locked(&conn.lock(), &sql, &sqlite_params))
            .await
            .map_err(|e| EngineError::Internal(format!("SQLite task failed: {}", e)))?
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let sqlite_params = values_to_sqlite(params);
        tokio::task::spawn_blocking(move || {
            let start_time = std::time::Instant::now();
            let affected = conn
                .lock()
                .execute(&sql, params_from_iter(sqlite_params.iter()))
                .map_err(|e| EngineError::Query(format!("failed to execute statement: {}", e)))?;
            Ok(StatementResult {
                affected_rows: affected as u64,
                execution_time_ms: start_time.elapsed().as_millis() as u64,
            })
        })
        .await
        .map_err(|e| EngineError::Internal(format!("SQLite task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod decl_type_tests {
        use super::*;

        #[test]
        fn test_integer_affinity() {
            assert_eq!(map_decl_type("INTEGER"), ValueKind::Int64);
            assert_eq!(map_decl_type("big int"), ValueKind::Int64);
            assert_eq!(map_decl_type("TINYINT"), ValueKind::Int64);
        }

        #[test]
        fn test_bool_beats_integer_keyword() {
            assert_eq!(map_decl_type("BOOLEAN"), ValueKind::Bool);
        }

        #[test]
        fn test_temporal_types() {
            assert_eq!(map_decl_type("DATETIME"), ValueKind::Timestamp);
            assert_eq!(map_decl_type("TIMESTAMP"), ValueKind::Timestamp);
            assert_eq!(map_decl_type("DATE"), ValueKind::Date);
            assert_eq!(map_decl_type("TIME"), ValueKind::Time);
        }

        #[test]
        fn test_unknown_defaults_to_text() {
            assert_eq!(map_decl_type("DYNAMIC"), ValueKind::Text);
        }
    }

    mod roundtrip_tests {
        use super::*;
        use sqlhub_core::Connection as _;

        #[tokio::test]
        async fn test_basic_query_and_execute() {
            let conn = SqliteConnection::open(":memory:").unwrap();
            conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
                .await
                .unwrap();
            let result = conn
                .execute(
                    "INSERT INTO t (id, name) VALUES (?, ?)",
                    &[Value::Int(1), Value::Text("alice".into())],
                )
                .await
                .unwrap();
            assert_eq!(result.affected_rows, 1);

            let result = conn.query("SELECT id, name FROM t", &[]).await.unwrap();
            assert_eq!(result.row_count(), 1);
            assert_eq!(result.columns[0].kind, ValueKind::Int64);
            assert_eq!(result.rows[0].get(0), Some(&Value::Int(1)));
            assert_eq!(
                result.rows[0].get(1),
                Some(&Value::Text("alice".to_string()))
            );
        }

        #[tokio::test]
        async fn test_null_round_trip() {
            let conn = SqliteConnection::open(":memory:").unwrap();
            conn.execute("CREATE TABLE t (v TEXT)", &[]).await.unwrap();
            conn.execute("INSERT INTO t (v) VALUES (?)", &[Value::Null])
                .await
                .unwrap();
            let result = conn.query("SELECT v FROM t", &[]).await.unwrap();
            assert_eq!(result.rows[0].get(0), Some(&Value::Null));
        }

        #[tokio::test]
        async fn test_transaction_rollback_discards_writes() {
            let conn = SqliteConnection::open(":memory:").unwrap();
            conn.execute("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();

            let tx = conn.begin_transaction().await.unwrap();
            tx.execute("INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
            tx.rollback().await.unwrap();

            let result = conn.query("SELECT count(*) FROM t", &[]).await.unwrap();
            assert_eq!(result.rows[0].get(0).and_then(|v| v.as_i64()), Some(0));
        }

        #[tokio::test]
        async fn test_stream_delivers_ordered_batches() {
            let conn = SqliteConnection::open(":memory:").unwrap();
            conn.execute("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();
            for i in 0..10 {
                conn.execute("INSERT INTO t (id) VALUES (?)", &[Value::Int(i)])
                    .await
                    .unwrap();
            }

            let (tx, mut rx) = mpsc::channel(16);
            let summary = conn
                .query_stream(
                    "SELECT id FROM t ORDER BY id",
                    &[],
                    4,
                    tx,
                    CancellationToken::new(),
                )
                .await
                .unwrap();

            assert_eq!(summary.total_rows, 10);
            assert_eq!(summary.batches, 3);
            assert!(!summary.cancelled);

            let mut seen = Vec::new();
            while let Some(batch) = rx.recv().await {
                for row in batch.rows {
                    seen.push(row.get(0).and_then(|v| v.as_i64()).unwrap());
                }
            }
            assert_eq!(seen, (0..10).collect::<Vec<_>>());
        }
    }
}
