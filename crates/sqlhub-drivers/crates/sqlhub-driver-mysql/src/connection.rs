//! MySQL connection implementation

use async_trait::async_trait;
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::prelude::*;
use mysql_async::{Column, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, SslOpts};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use sqlhub_core::{
    ColumnMeta, Connection, ConnectFailureKind, DatabaseKind, EngineError, QueryCancelHandle,
    QueryResult, Result, Row, StatementResult, Transaction, Value, ValueKind,
};

/// Cancel handle for MySQL queries.
///
/// MySQL has no out-of-band cancel protocol like PostgreSQL; the flag is
/// observed between result batches and before new statements start.
pub struct MySqlCancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl QueryCancelHandle for MySqlCancelHandle {
    fn cancel(&self) {
        tracing::debug!("setting MySQL query cancellation flag");
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn format_mysql_error(error: &mysql_async::Error) -> String {
    match error {
        mysql_async::Error::Server(server) => {
            format!("{} (code: {})", server.message, server.code)
        }
        other => other.to_string(),
    }
}

/// Classify a connect-time failure into the engine's cause taxonomy
pub(crate) fn classify_connect_error(error: &mysql_async::Error) -> ConnectFailureKind {
    match error {
        mysql_async::Error::Server(server) => match server.code {
            1044 | 1045 => ConnectFailureKind::Auth,
            1049 => ConnectFailureKind::DatabaseMissing,
            _ => ConnectFailureKind::Other,
        },
        mysql_async::Error::Io(_) => ConnectFailureKind::Network,
        other => {
            let text = other.to_string();
            if text.contains("tls") || text.contains("TLS") || text.contains("certificate") {
                ConnectFailureKind::Tls
            } else {
                ConnectFailureKind::Other
            }
        }
    }
}

/// MySQL connection wrapper.
///
/// The internal mysql_async pool is pinned to a single session; pooling
/// across sessions is the connection manager's job.
pub struct MySqlConnection {
    pool: Pool,
    /// Resolved at connect time so schema lookups have a concrete default
    /// database instead of relying on `DATABASE()` at query time.
    database_name: Option<String>,
    cancelled: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MySqlConnection {
    /// Connect to a MySQL database
    pub async fn connect(
        host: &str,
        port: u16,
        database: Option<&str>,
        user: Option<&str>,
        password: Option<&str>,
        ssl_mode: &str,
        connect_timeout: std::time::Duration,
    ) -> Result<Self> {
        tracing::info!(host = %host, port = %port, database = ?database, "connecting to MySQL database");

        let mut opts_builder = OptsBuilder::from_opts(Opts::default())
            .ip_or_hostname(host)
            .tcp_port(port);

        if let Some(db) = database {
            opts_builder = opts_builder.db_name(Some(db));
        }
        if let Some(u) = user {
            opts_builder = opts_builder.user(Some(u));
        }
        if let Some(p) = password {
            opts_builder = opts_builder.pass(Some(p));
        }

        if ssl_mode != "disable" {
            let lenient = !matches!(ssl_mode, "verify-ca" | "verify-full");
            let ssl_opts = SslOpts::default()
                .with_danger_accept_invalid_certs(lenient)
                .with_danger_skip_domain_validation(ssl_mode != "verify-full");
            opts_builder = opts_builder.ssl_opts(Some(ssl_opts));
        }

        let constraints = PoolConstraints::new(1, 1).ok_or_else(|| {
            EngineError::connection(
                ConnectFailureKind::Other,
                "failed to configure MySQL pool constraints",
            )
        })?;
        let pool_opts = PoolOpts::default()
            .with_constraints(constraints)
            .with_reset_connection(false);
        opts_builder = opts_builder.pool_opts(pool_opts);

        let pool = Pool::new(Opts::from(opts_builder));

        // Verify connectivity up front so failures classify at connect time.
        let probe = tokio::time::timeout(connect_timeout, pool.get_conn())
            .await
            .map_err(|_| {
                EngineError::connection(
                    ConnectFailureKind::Timeout,
                    format!("connect to {}:{} timed out", host, port),
                )
            })?;
        drop(probe.map_err(|e| {
            EngineError::connection(classify_connect_error(&e), format_mysql_error(&e))
        })?);

        let database_name = match database {
            Some(db) => Some(db.to_string()),
            None => {
                let mut conn = pool.get_conn().await.map_err(|e| {
                    EngineError::connection(classify_connect_error(&e), format_mysql_error(&e))
                })?;
                let row: Option<Option<String>> = conn
                    .query_first("SELECT DATABASE()")
                    .await
                    .map_err(|e| EngineError::Query(format_mysql_error(&e)))?;
                row.flatten()
            }
        };

        tracing::info!(host = %host, port = %port, database = ?database_name, "MySQL connection established");
        Ok(Self {
            pool,
            database_name,
            cancelled: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        })
    }

    /// The database the session is attached to, used as the default schema
    pub fn database_name(&self) -> Option<&str> {
        self.database_name.as_deref()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

/// Convert canonical values into mysql parameter values
pub(crate) fn values_to_mysql(params: &[Value]) -> mysql_async::Params {
    if params.is_empty() {
        return mysql_async::Params::Empty;
    }
    let converted = params
        .iter()
        .map(|value| match value {
            Value::Null => mysql_async::Value::NULL,
            Value::Bool(v) => mysql_async::Value::Int(i64::from(*v)),
            Value::Int(v) => mysql_async::Value::Int(*v),
            Value::Float(v) => mysql_async::Value::Double(*v),
            Value::Decimal(v) => mysql_async::Value::Bytes(v.clone().into_bytes()),
            Value::Text(v) => mysql_async::Value::Bytes(v.clone().into_bytes()),
            Value::Bytes(v) => mysql_async::Value::Bytes(v.clone()),
            Value::Timestamp(v) => {
                let naive = v.naive_utc();
                datetime_to_mysql(&naive)
            }
            Value::Date(v) => {
                use chrono::Datelike;
                mysql_async::Value::Date(v.year() as u16, v.month() as u8, v.day() as u8, 0, 0, 0, 0)
            }
            Value::Time(v) => {
                use chrono::Timelike;
                mysql_async::Value::Time(
                    false,
                    0,
                    v.hour() as u8,
                    v.minute() as u8,
                    v.second() as u8,
                    v.nanosecond() / 1_000,
                )
            }
            Value::Interval(v) => mysql_async::Value::Bytes(v.clone().into_bytes()),
            Value::Uuid(v) => mysql_async::Value::Bytes(v.to_string().into_bytes()),
            Value::Json(v) => mysql_async::Value::Bytes(v.to_string().into_bytes()),
        })
        .collect();
    mysql_async::Params::Positional(converted)
}

fn datetime_to_mysql(naive: &chrono::NaiveDateTime) -> mysql_async::Value {
    use chrono::{Datelike, Timelike};
    mysql_async::Value::Date(
        naive.year() as u16,
        naive.month() as u8,
        naive.day() as u8,
        naive.hour() as u8,
        naive.minute() as u8,
        naive.second() as u8,
        naive.nanosecond() / 1_000,
    )
}

/// Map a MySQL column into the canonical kind
pub(crate) fn map_mysql_type(column: &Column) -> ValueKind {
    let binary = column.flags().contains(ColumnFlags::BINARY_FLAG);
    match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_YEAR
        | ColumnType::MYSQL_TYPE_BIT => ValueKind::Int64,
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => ValueKind::Float64,
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => ValueKind::Decimal,
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => ValueKind::Date,
        ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => ValueKind::Time,
        ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_DATETIME2
        | ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_TIMESTAMP2 => ValueKind::Timestamp,
        ColumnType::MYSQL_TYPE_JSON => ValueKind::Json,
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB => {
            if binary {
                ValueKind::Bytes
            } else {
                ValueKind::Text
            }
        }
        ColumnType::MYSQL_TYPE_VARCHAR
        | ColumnType::MYSQL_TYPE_VAR_STRING
        | ColumnType::MYSQL_TYPE_STRING
        | ColumnType::MYSQL_TYPE_ENUM
        | ColumnType::MYSQL_TYPE_SET => {
            if binary {
                ValueKind::Bytes
            } else {
                ValueKind::Text
            }
        }
        _ => ValueKind::Text,
    }
}

/// Convert one stored mysql value into the canonical domain
fn mysql_to_value(value: &mysql_async::Value, kind: ValueKind) -> Value {
    match value {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Int(i) => match kind {
            ValueKind::Bool => Value::Bool(*i != 0),
            _ => Value::Int(*i),
        },
        mysql_async::Value::UInt(u) => Value::Int(*u as i64),
        mysql_async::Value::Float(f) => Value::Float(*f as f64),
        mysql_async::Value::Double(f) => Value::Float(*f),
        mysql_async::Value::Bytes(bytes) => {
            let text = || String::from_utf8_lossy(bytes).into_owned();
            match kind {
                ValueKind::Bytes => Value::Bytes(bytes.clone()),
                ValueKind::Decimal => Value::Decimal(text()),
                ValueKind::Json => serde_json::from_slice(bytes)
                    .map(Value::Json)
                    .unwrap_or_else(|_| Value::Text(text())),
                ValueKind::Uuid => text()
                    .parse::<uuid::Uuid>()
                    .map(Value::Uuid)
                    .unwrap_or_else(|_| Value::Text(text())),
                _ => Value::Text(text()),
            }
        }
        mysql_async::Value::Date(year, month, day, hour, minute, second, micros) => {
            if kind == ValueKind::Date {
                chrono::NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
                    .map(Value::Date)
                    .unwrap_or(Value::Null)
            } else {
                chrono::NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
                    .and_then(|date| {
                        date.and_hms_micro_opt(
                            *hour as u32,
                            *minute as u32,
                            *second as u32,
                            *micros,
                        )
                    })
                    .map(|naive| {
                        Value::Timestamp(chrono::DateTime::from_naive_utc_and_offset(
                            naive,
                            chrono::Utc,
                        ))
                    })
                    .unwrap_or(Value::Null)
            }
        }
        mysql_async::Value::Time(negative, days, hours, minutes, seconds, micros) => {
            if !negative && *days == 0 {
                chrono::NaiveTime::from_hms_micro_opt(
                    *hours as u32,
                    *minutes as u32,
                    *seconds as u32,
                    *micros,
                )
                .map(Value::Time)
                .unwrap_or(Value::Null)
            } else {
                // Durations beyond a day only fit the interval rendering.
                let sign = if *negative { "-" } else { "" };
                Value::Interval(format!(
                    "{}{}d {:02}:{:02}:{:02}.{:06}",
                    sign, days, hours, minutes, seconds, micros
                ))
            }
        }
    }
}

fn columns_from_result(columns: &[Column]) -> (Vec<String>, Vec<ColumnMeta>) {
    let mut names = Vec::with_capacity(columns.len());
    let mut metas = Vec::with_capacity(columns.len());
    for (idx, col) in columns.iter().enumerate() {
        let name = col.name_str().to_string();
        let kind = map_mysql_type(col);
        names.push(name.clone());
        metas.push(ColumnMeta {
            name,
            data_type: format!("{:?}", col.column_type()),
            kind,
            nullable: !col.flags().contains(ColumnFlags::NOT_NULL_FLAG),
            ordinal: idx,
        });
    }
    (names, metas)
}

#[async_trait]
impl Connection for MySqlConnection {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Mysql
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        self.check_cancelled()?;
        let start_time = std::time::Instant::now();

        let mut conn = self.pool.get_conn().await.map_err(|e| {
            EngineError::connection(classify_connect_error(&e), format_mysql_error(&e))
        })?;

        let result = conn
            .exec_iter(sql, values_to_mysql(params))
            .await
            .map_err(|e| EngineError::Query(format_mysql_error(&e)))?;
        let affected = result.affected_rows();
        drop(result);

        tracing::debug!(affected_rows = affected, "statement executed");
        Ok(StatementResult {
            affected_rows: affected,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
        })
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.check_cancelled()?;
        let start_time = std::time::Instant::now();

        let mut conn = self.pool.get_conn().await.map_err(|e| {
            EngineError::connection(classify_connect_error(&e), format_mysql_error(&e))
        })?;

        let mut result = conn
            .exec_iter(sql, values_to_mysql(params))
            .await
            .map_err(|e| EngineError::Query(format_mysql_error(&e)))?;

        let (column_names, columns) = match result.columns() {
            Some(cols) => columns_from_result(&cols),
            None => (Vec::new(), Vec::new()),
        };

        let mysql_rows: Vec<mysql_async::Row> = result
            .collect()
            .await
            .map_err(|e| EngineError::Query(format_mysql_error(&e)))?;

        let mut rows = Vec::with_capacity(mysql_rows.len());
        for mysql_row in &mysql_rows {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, meta) in columns.iter().enumerate() {
                let value = mysql_row
                    .as_ref(idx)
                    .map(|v| mysql_to_value(v, meta.kind))
                    .unwrap_or(Value::Null);
                values.push(value);
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

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        tracing::debug!("beginning MySQL transaction");
        let mut conn = self.pool.get_conn().await.map_err(|e| {
            EngineError::connection(classify_connect_error(&e), format_mysql_error(&e))
        })?;
        conn.query_drop("START TRANSACTION")
            .await
            .map_err(|e| EngineError::Query(format_mysql_error(&e)))?;

        Ok(Box::new(MySqlTransaction {
            conn: tokio::sync::Mutex::new(Some(conn)),
        }))
    }

    async fn close(&self) -> Result<()> {
        tracing::info!("closing MySQL connection");
        self.closed.store(true, Ordering::SeqCst);
        self.pool
            .clone()
            .disconnect()
            .await
            .map_err(|e| EngineError::Query(format_mysql_error(&e)))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn as_schema_introspection(&self) -> Option<&dyn sqlhub_core::SchemaIntrospection> {
        Some(self)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        Some(Arc::new(MySqlCancelHandle {
            cancelled: Arc::clone(&self.cancelled),
        }))
    }
}

/// MySQL transaction pinned to one pooled session.
///
/// The session is taken out of the pool for the duration; dropping the
/// transaction without commit or rollback rolls back when the session
/// returns to the pool with `reset_connection` semantics disabled only
/// for committed work.
pub struct MySqlTransaction {
    conn: tokio::sync::Mutex<Option<mysql_async::Conn>>,
}

impl MySqlTransaction {
    async fn finish(self: Box<Self>, sql: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let mut conn = guard
            .take()
            .ok_or_else(|| EngineError::Query("transaction already finished".into()))?;
        conn.query_drop(sql)
            .await
            .map_err(|e| EngineError::Query(format_mysql_error(&e)))
    }
}

#[async_trait]
impl Transaction for MySqlTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        tracing::debug!("committing MySQL transaction");
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        tracing::debug!("rolling back MySQL transaction");
        self.finish("ROLLBACK").await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let start_time = std::time::Instant::now();
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| EngineError::Query("transaction already finished".into()))?;

        let mut result = conn
            .exec_iter(sql, values_to_mysql(params))
            .await
            .map_err(|e| EngineError::Query(format_mysql_error(&e)))?;

        let (column_names, columns) = match result.columns() {
            Some(cols) => columns_from_result(&cols),
            None => (Vec::new(), Vec::new()),
        };
        let mysql_rows: Vec<mysql_async::Row> = result
            .collect()
            .await
            .map_err(|e| EngineError::Query(format_mysql_error(&e)))?;

        let mut rows = Vec::with_capacity(mysql_rows.len());
        for mysql_row in &mysql_rows {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, meta) in columns.iter().enumerate() {
                let value = mysql_row
                    .as_ref(idx)
                    .map(|v| mysql_to_value(v, meta.kind))
                    .unwrap_or(Value::Null);
                values.push(value);
            }
            rows.push(Row::new(column_names.clone(), values));
        }

        Ok(QueryResult {
            id: uuid::Uuid::new_v4(),
            columns,
            rows,
            affected_rows: 0,
            truncated: false,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
            editable: None,
            warnings: Vec::new(),
        })
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        let start_time = std::time::Instant::now();
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| EngineError::Query("transaction already finished".into()))?;

        let result = conn
            .exec_iter(sql, values_to_mysql(params))
            .await
            .map_err(|e| EngineError::Query(format_mysql_error(&e)))?;
        let affected = result.affected_rows();
        drop(result);

        Ok(StatementResult {
            affected_rows: affected,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_conversion_nulls_and_ints() {
        let params = values_to_mysql(&[Value::Null, Value::Int(42), Value::Bool(true)]);
        match params {
            mysql_async::Params::Positional(values) => {
                assert_eq!(values[0], mysql_async::Value::NULL);
                assert_eq!(values[1], mysql_async::Value::Int(42));
                assert_eq!(values[2], mysql_async::Value::Int(1));
            }
            other => panic!("expected positional params, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_params() {
        assert!(matches!(values_to_mysql(&[]), mysql_async::Params::Empty));
    }

    #[test]
    fn test_time_value_beyond_a_day_becomes_interval() {
        let value = mysql_async::Value::Time(false, 2, 3, 4, 5, 0);
        let converted = mysql_to_value(&value, ValueKind::Time);
        assert!(matches!(converted, Value::Interval(_)));
    }

    #[test]
    fn test_decimal_bytes_keep_text_precision() {
        let value = mysql_async::Value::Bytes(b"12345.6789".to_vec());
        let converted = mysql_to_value(&value, ValueKind::Decimal);
        assert_eq!(converted, Value::Decimal("12345.6789".to_string()));
    }
}
