//! PostgreSQL connection implementation

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{TryStreamExt, pin_mut};
use native_tls::{Certificate, TlsConnector};
use postgres_native_tls::MakeTlsConnector;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{CancelToken, Client, NoTls, Row as PgRow};
use tokio_util::sync::CancellationToken;
use sqlhub_core::{
    ColumnMeta, Connection, ConnectFailureKind, DatabaseKind, EngineError, QueryCancelHandle,
    QueryResult, Result, Row, RowBatch, StatementResult, StreamSummary, Transaction, Value,
    ValueKind,
};

/// Cancel handle wrapping the tokio-postgres `CancelToken`.
///
/// Sends an out-of-band cancel request to the server; cancellation uses
/// NoTls because the cancel protocol carries no payload worth protecting.
pub struct PostgresCancelHandle {
    cancel_token: CancelToken,
}

impl QueryCancelHandle for PostgresCancelHandle {
    fn cancel(&self) {
        tracing::debug!("sending cancel request to PostgreSQL server");
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            if let Err(e) = cancel_token.cancel_query(NoTls).await {
                tracing::warn!(error = %e, "failed to cancel PostgreSQL query");
            }
        });
    }
}

fn format_postgres_error(error: &tokio_postgres::Error) -> String {
    let Some(db_error) = error.as_db_error() else {
        return error.to_string();
    };

    let code = db_error.code();
    let mut message = db_error.message().to_string();

    if let Some(detail) = db_error.detail()
        && !detail.trim().is_empty()
    {
        message.push_str(&format!(" (detail: {})", detail));
    }

    if let Some(hint) = db_error.hint()
        && !hint.trim().is_empty()
    {
        message.push_str(&format!(" (hint: {})", hint));
    }

    match code.code() {
        "23505" => format!("duplicate value violates unique constraint: {}", message),
        "23503" => format!("foreign key violation: {}", message),
        "23502" => format!("null value violates not-null constraint: {}", message),
        "22P02" => format!("invalid input syntax: {}", message),
        _ => format!("{} (code: {:?})", message, code),
    }
}

/// Classify a connect-time failure into the engine's cause taxonomy
pub(crate) fn classify_connect_error(error: &tokio_postgres::Error) -> ConnectFailureKind {
    if let Some(db_error) = error.as_db_error() {
        return match db_error.code().code() {
            "28000" | "28P01" => ConnectFailureKind::Auth,
            "3D000" => ConnectFailureKind::DatabaseMissing,
            _ => ConnectFailureKind::Other,
        };
    }
    let text = error.to_string();
    if text.contains("tls") || text.contains("TLS") || text.contains("certificate") {
        ConnectFailureKind::Tls
    } else {
        ConnectFailureKind::Network
    }
}

/// PostgreSQL connection wrapper
pub struct PostgresConnection {
    client: Arc<Mutex<Client>>,
    cancel_token: CancelToken,
    closed: AtomicBool,
    /// Schema applied when a reference omits one; `search_path` head.
    default_schema: String,
}

impl PostgresConnection {
    /// Connect to a PostgreSQL database
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        host: &str,
        port: u16,
        database: &str,
        user: Option<&str>,
        password: Option<&str>,
        ssl_mode: &str,
        ssl_ca_cert: Option<&str>,
        connect_timeout: std::time::Duration,
    ) -> Result<Self> {
        tracing::info!(
            host = %host,
            port = %port,
            database = %database,
            ssl_mode = %ssl_mode,
            "connecting to PostgreSQL database"
        );

        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .dbname(database)
            .connect_timeout(connect_timeout);

        if let Some(u) = user {
            config.user(u);
        }
        if let Some(p) = password {
            config.password(p);
        }

        let ssl_mode_enum = match ssl_mode.to_lowercase().as_str() {
            "disable" => tokio_postgres::config::SslMode::Disable,
            "require" | "verify-ca" | "verify-full" => tokio_postgres::config::SslMode::Require,
            _ => tokio_postgres::config::SslMode::Prefer,
        };
        config.ssl_mode(ssl_mode_enum);

        let use_tls = ssl_mode != "disable";
        let connect_future = async {
            if use_tls {
                let mut tls_builder = TlsConnector::builder();

                if let Some(ca_cert_path) = ssl_ca_cert
                    && !ca_cert_path.is_empty()
                {
                    let ca_cert_data = fs::read(ca_cert_path).map_err(|e| {
                        EngineError::connection(
                            ConnectFailureKind::Tls,
                            format!("failed to read CA certificate: {}", e),
                        )
                    })?;
                    let ca_cert = Certificate::from_pem(&ca_cert_data).map_err(|e| {
                        EngineError::connection(
                            ConnectFailureKind::Tls,
                            format!("failed to parse CA certificate: {}", e),
                        )
                    })?;
                    tls_builder.add_root_certificate(ca_cert);
                }

                // Modes below verify-ca tolerate self-signed chains.
                let lenient = !matches!(
                    ssl_mode.to_lowercase().as_str(),
                    "verify-ca" | "verify-full"
                );
                tls_builder.danger_accept_invalid_certs(lenient && ssl_ca_cert.is_none());
                tls_builder
                    .danger_accept_invalid_hostnames(ssl_mode.to_lowercase() != "verify-full");

                let tls_connector = tls_builder.build().map_err(|e| {
                    EngineError::connection(
                        ConnectFailureKind::Tls,
                        format!("failed to build TLS connector: {}", e),
                    )
                })?;
                let tls = MakeTlsConnector::new(tls_connector);

                let (client, connection) = config.connect(tls).await.map_err(|e| {
                    EngineError::connection(classify_connect_error(&e), format_postgres_error(&e))
                })?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::error!(error = %e, "PostgreSQL connection error");
                    }
                });
                Ok::<Client, EngineError>(client)
            } else {
                let (client, connection) = config.connect(NoTls).await.map_err(|e| {
                    EngineError::connection(classify_connect_error(&e), format_postgres_error(&e))
                })?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::error!(error = %e, "PostgreSQL connection error");
                    }
                });
                Ok(client)
            }
        };

        let client = tokio::time::timeout(connect_timeout + std::time::Duration::from_secs(1), connect_future)
            .await
            .map_err(|_| {
                EngineError::connection(
                    ConnectFailureKind::Timeout,
                    format!("connect to {}:{} timed out", host, port),
                )
            })??;

        let cancel_token = client.cancel_token();

        tracing::info!(host = %host, port = %port, database = %database, "PostgreSQL connection established");
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            cancel_token,
            closed: AtomicBool::new(false),
            default_schema: "public".to_string(),
        })
    }

    /// Schema applied when a reference omits one
    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }
}

/// Wrapper for converting canonical values into `ToSql` parameters with
/// the width the prepared statement's target type expects.
#[derive(Debug)]
enum PgValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
    Timestamp(chrono::DateTime<chrono::Utc>),
    NaiveTimestamp(chrono::NaiveDateTime),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
}

impl PgValue {
    /// Pick the representation matching the target column type so the
    /// binary protocol writes the correct number of bytes.
    fn from_value_for_type(value: &Value, target_type: &Type) -> Self {
        match value {
            Value::Null => PgValue::Null,
            Value::Bool(v) => PgValue::Bool(*v),
            Value::Int(v) => match *target_type {
                Type::INT2 => PgValue::Int16(*v as i16),
                Type::INT4 => PgValue::Int32(*v as i32),
                _ => PgValue::Int64(*v),
            },
            Value::Float(v) => match *target_type {
                Type::FLOAT4 => PgValue::Float32(*v as f32),
                _ => PgValue::Float64(*v),
            },
            Value::Decimal(v) => PgValue::String(v.clone()),
            Value::Text(v) => Self::coerce_text(v, target_type),
            Value::Bytes(v) => PgValue::Bytes(v.clone()),
            Value::Uuid(v) => PgValue::Uuid(*v),
            Value::Json(v) => PgValue::Json(v.clone()),
            Value::Timestamp(v) => match *target_type {
                Type::TIMESTAMP => PgValue::NaiveTimestamp(v.naive_utc()),
                _ => PgValue::Timestamp(*v),
            },
            Value::Date(v) => PgValue::Date(*v),
            Value::Time(v) => PgValue::Time(*v),
            Value::Interval(v) => PgValue::String(v.clone()),
        }
    }

    /// Coerce text literals into the concrete parameter type the
    /// statement expects, falling back to text on parse failure.
    fn coerce_text(value: &str, target_type: &Type) -> Self {
        match *target_type {
            Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(value)
                .map(PgValue::Json)
                .unwrap_or_else(|_| PgValue::String(value.to_string())),
            Type::UUID => value
                .parse::<uuid::Uuid>()
                .map(PgValue::Uuid)
                .unwrap_or_else(|_| PgValue::String(value.to_string())),
            Type::DATE => chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(PgValue::Date)
                .unwrap_or_else(|_| PgValue::String(value.to_string())),
            Type::TIME => chrono::NaiveTime::parse_from_str(value, "%H:%M:%S")
                .or_else(|_| chrono::NaiveTime::parse_from_str(value, "%H:%M:%S%.f"))
                .map(PgValue::Time)
                .unwrap_or_else(|_| PgValue::String(value.to_string())),
            Type::TIMESTAMPTZ => chrono::DateTime::parse_from_rfc3339(value)
                .map(|ts| PgValue::Timestamp(ts.with_timezone(&chrono::Utc)))
                .unwrap_or_else(|_| PgValue::String(value.to_string())),
            _ => PgValue::String(value.to_string()),
        }
    }

    /// Fallback when the target type is unknown
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => PgValue::Null,
            Value::Bool(v) => PgValue::Bool(*v),
            Value::Int(v) => PgValue::Int64(*v),
            Value::Float(v) => PgValue::Float64(*v),
            Value::Decimal(v) => PgValue::String(v.clone()),
            Value::Text(v) => PgValue::String(v.clone()),
            Value::Bytes(v) => PgValue::Bytes(v.clone()),
            Value::Uuid(v) => PgValue::Uuid(*v),
            Value::Json(v) => PgValue::Json(v.clone()),
            Value::Timestamp(v) => PgValue::Timestamp(*v),
            Value::Date(v) => PgValue::Date(*v),
            Value::Time(v) => PgValue::Time(*v),
            Value::Interval(v) => PgValue::String(v.clone()),
        }
    }
}

impl ToSql for PgValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<postgres_types::IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            PgValue::Null => Ok(postgres_types::IsNull::Yes),
            PgValue::Bool(v) => v.to_sql(ty, out),
            PgValue::Int16(v) => v.to_sql(ty, out),
            PgValue::Int32(v) => v.to_sql(ty, out),
            PgValue::Int64(v) => v.to_sql(ty, out),
            PgValue::Float32(v) => v.to_sql(ty, out),
            PgValue::Float64(v) => v.to_sql(ty, out),
            PgValue::String(v) => v.to_sql(ty, out),
            PgValue::Bytes(v) => v.to_sql(ty, out),
            PgValue::Uuid(v) => v.to_sql(ty, out),
            PgValue::Json(v) => v.to_sql(ty, out),
            PgValue::Timestamp(v) => v.to_sql(ty, out),
            PgValue::NaiveTimestamp(v) => v.to_sql(ty, out),
            PgValue::Date(v) => v.to_sql(ty, out),
            PgValue::Time(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    postgres_types::to_sql_checked!();
}

fn bind_params(params: &[Value], param_types: &[Type]) -> Vec<PgValue> {
    params
        .iter()
        .enumerate()
        .map(|(i, value)| {
            if let Some(target_type) = param_types.get(i) {
                PgValue::from_value_for_type(value, target_type)
            } else {
                PgValue::from_value(value)
            }
        })
        .collect()
}

/// NUMERIC binary payload decoded into its decimal text rendering
#[derive(Debug)]
struct PgNumericText(String);

impl PgNumericText {
    fn parse(raw: &[u8]) -> std::result::Result<String, Box<dyn std::error::Error + Sync + Send>> {
        if raw.len() < 8 {
            return Err("invalid NUMERIC payload: too short".into());
        }

        let ndigits = i16::from_be_bytes([raw[0], raw[1]]) as usize;
        let weight = i16::from_be_bytes([raw[2], raw[3]]);
        let sign = u16::from_be_bytes([raw[4], raw[5]]);
        let dscale = i16::from_be_bytes([raw[6], raw[7]]) as usize;

        if raw.len() < 8 + ndigits * 2 {
            return Err("invalid NUMERIC payload: truncated digits".into());
        }
        if sign == 0xC000 {
            return Ok("NaN".to_string());
        }

        let mut digits = Vec::with_capacity(ndigits);
        for index in 0..ndigits {
            let offset = 8 + index * 2;
            digits.push(u16::from_be_bytes([raw[offset], raw[offset + 1]]));
        }
        if digits.is_empty() {
            return Ok("0".to_string());
        }

        let integer_groups = if weight >= 0 { weight as usize + 1 } else { 0 };
        let mut integer_text = String::new();
        if integer_groups == 0 {
            integer_text.push('0');
        } else {
            for group_index in 0..integer_groups {
                let group = digits.get(group_index).copied().unwrap_or(0);
                if group_index == 0 {
                    integer_text.push_str(&group.to_string());
                } else {
                    integer_text.push_str(&format!("{group:04}"));
                }
            }
        }

        let mut fraction_text = String::new();
        if dscale > 0 {
            for group in digits.iter().skip(integer_groups.min(digits.len())) {
                fraction_text.push_str(&format!("{group:04}"));
            }
            if fraction_text.len() < dscale {
                fraction_text.push_str(&"0".repeat(dscale - fraction_text.len()));
            } else {
                fraction_text.truncate(dscale);
            }
            while fraction_text.ends_with('0') {
                fraction_text.pop();
            }
        }

        let mut output = String::new();
        if sign == 0x4000 && integer_text != "0" {
            output.push('-');
        }
        output.push_str(&integer_text);
        if !fraction_text.is_empty() {
            output.push('.');
            output.push_str(&fraction_text);
        }
        Ok(output)
    }
}

impl<'a> FromSql<'a> for PgNumericText {
    fn from_sql(
        _: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(Self::parse(raw)?))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Last-resort decoder rendering any unhandled type as UTF-8 text
#[derive(Debug)]
struct PgAnyText(String);

impl<'a> FromSql<'a> for PgAnyText {
    fn from_sql(
        _: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(String::from_utf8_lossy(raw).into_owned()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// Map a PostgreSQL wire type into the canonical kind
pub(crate) fn map_pg_type(ty: &Type) -> ValueKind {
    match *ty {
        Type::BOOL => ValueKind::Bool,
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => ValueKind::Int64,
        Type::FLOAT4 | Type::FLOAT8 => ValueKind::Float64,
        Type::NUMERIC => ValueKind::Decimal,
        Type::BYTEA => ValueKind::Bytes,
        Type::UUID => ValueKind::Uuid,
        Type::JSON | Type::JSONB => ValueKind::Json,
        Type::TIMESTAMP | Type::TIMESTAMPTZ => ValueKind::Timestamp,
        Type::DATE => ValueKind::Date,
        Type::TIME | Type::TIMETZ => ValueKind::Time,
        Type::INTERVAL => ValueKind::Interval,
        _ => ValueKind::Text,
    }
}

/// Convert one cell of a result row into the canonical domain
fn postgres_to_value(row: &PgRow, idx: usize) -> Result<Value> {
    let ty = row.columns()[idx].type_().clone();
    let wrap = |e: tokio_postgres::Error| {
        EngineError::Query(format!("failed to decode column {}: {}", idx, e))
    };

    let value = match ty {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, |v| Value::Int(v as i64)),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, |v| Value::Int(v as i64)),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, Value::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, |v| Value::Float(v as f64)),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, Value::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<PgNumericText>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, |v| Value::Decimal(v.0)),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, Value::Bytes),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, Value::Uuid),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, Value::Json),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, Value::Timestamp),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, |v| {
                Value::Timestamp(chrono::DateTime::from_naive_utc_and_offset(v, chrono::Utc))
            }),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, Value::Date),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, Value::Time),
        Type::INTERVAL => row
            .try_get::<_, Option<PgAnyText>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, |v| Value::Interval(v.0)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => row
            .try_get::<_, Option<String>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, Value::Text),
        _ => row
            .try_get::<_, Option<PgAnyText>>(idx)
            .map_err(wrap)?
            .map_or(Value::Null, |v| Value::Text(v.0)),
    };
    Ok(value)
}

fn columns_from_statement(statement: &tokio_postgres::Statement) -> (Vec<String>, Vec<ColumnMeta>) {
    let mut names = Vec::new();
    let mut columns = Vec::new();
    for (idx, col) in statement.columns().iter().enumerate() {
        let name = col.name().to_string();
        names.push(name.clone());
        columns.push(ColumnMeta::new(
            name,
            col.type_().name().to_string(),
            map_pg_type(col.type_()),
            idx,
        ));
    }
    (names, columns)
}

#[async_trait]
impl Connection for PostgresConnection {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        let start_time = std::time::Instant::now();
        let client = self.client.lock().await;

        let statement = client.prepare(sql).await.map_err(|e| {
            EngineError::Query(format!("failed to prepare statement: {}", format_postgres_error(&e)))
        })?;

        let pg_params = bind_params(params, statement.params());
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            pg_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let affected = client.execute(&statement, &param_refs).await.map_err(|e| {
            EngineError::Query(format!("failed to execute statement: {}", format_postgres_error(&e)))
        })?;

        tracing::debug!(affected_rows = affected, "statement executed");
        Ok(StatementResult {
            affected_rows: affected,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
        })
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let start_time = std::time::Instant::now();
        let client = self.client.lock().await;

        // Prepare first so empty result sets still carry column metadata
        // and parameters bind with their target types.
        let statement = client.prepare(sql).await.map_err(|e| {
            EngineError::Query(format!("failed to prepare query: {}", format_postgres_error(&e)))
        })?;

        let pg_params = bind_params(params, statement.params());
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            pg_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let pg_rows = client.query(&statement, &param_refs).await.map_err(|e| {
            EngineError::Query(format!("failed to execute query: {}", format_postgres_error(&e)))
        })?;

        let (column_names, columns) = columns_from_statement(&statement);

        let mut rows = Vec::with_capacity(pg_rows.len());
        for pg_row in &pg_rows {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(postgres_to_value(pg_row, idx)?);
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

    async fn query_stream(
        &self,
        sql: &str,
        params: &[Value],
        batch_size: usize,
        sink: mpsc::Sender<RowBatch>,
        cancel: CancellationToken,
    ) -> Result<StreamSummary> {
        let batch_size = batch_size.max(1);
        let client = self.client.lock().await;

        let statement = client.prepare(sql).await.map_err(|e| {
            EngineError::Query(format!("failed to prepare query: {}", format_postgres_error(&e)))
        })?;

        let pg_params = bind_params(params, statement.params());
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            pg_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let (column_names, columns) = columns_from_statement(&statement);

        let row_stream = client
            .query_raw(&statement, param_refs)
            .await
            .map_err(|e| {
                EngineError::Query(format!("failed to start query stream: {}", format_postgres_error(&e)))
            })?;
        pin_mut!(row_stream);

        let mut summary = StreamSummary::default();
        let mut buffer: Vec<Row> = Vec::with_capacity(batch_size);

        while let Some(pg_row) = row_stream.try_next().await.map_err(|e| {
            EngineError::Query(format!("stream read failed: {}", format_postgres_error(&e)))
        })? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(postgres_to_value(&pg_row, idx)?);
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
                if sink.send(batch).await.is_err() {
                    summary.cancelled = true;
                    return Ok(summary);
                }
            }
        }

        if !buffer.is_empty() {
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
            if sink.send(batch).await.is_err() {
                summary.cancelled = true;
            }
        }
        Ok(summary)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        tracing::debug!("beginning PostgreSQL transaction");
        {
            let client = self.client.lock().await;
            client.execute("BEGIN", &[]).await.map_err(|e| {
                EngineError::Query(format!("failed to begin transaction: {}", format_postgres_error(&e)))
            })?;
        }
        Ok(Box::new(PostgresTransaction {
            client: Arc::clone(&self.client),
            finished: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        tracing::info!("closing PostgreSQL connection");
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
        Some(Arc::new(PostgresCancelHandle {
            cancel_token: self.cancel_token.clone(),
        }))
    }
}

/// PostgreSQL transaction.
///
/// Holds the client mutex handle for the duration so no interleaved
/// statements can run on the session mid-transaction.
pub struct PostgresTransaction {
    client: Arc<Mutex<Client>>,
    finished: bool,
}

impl PostgresTransaction {
    async fn run(&self, sql: &str) -> Result<()> {
        let client = self.client.lock().await;
        client.execute(sql, &[]).await.map_err(|e| {
            EngineError::Query(format!("transaction control failed: {}", format_postgres_error(&e)))
        })?;
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("PostgreSQL transaction dropped without commit or rollback");
            // The next BEGIN on this session implicitly discards it.
        }
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        tracing::debug!("committing PostgreSQL transaction");
        self.run("COMMIT").await?;
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        tracing::debug!("rolling back PostgreSQL transaction");
        self.run("ROLLBACK").await?;
        self.finished = true;
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let start_time = std::time::Instant::now();
        let client = self.client.lock().await;

        let statement = client.prepare(sql).await.map_err(|e| {
            EngineError::Query(format!("failed to prepare query: {}", format_postgres_error(&e)))
        })?;
        let pg_params = bind_params(params, statement.params());
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            pg_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let pg_rows = client.query(&statement, &param_refs).await.map_err(|e| {
            EngineError::Query(format!("failed to execute query: {}", format_postgres_error(&e)))
        })?;

        let (column_names, columns) = columns_from_statement(&statement);
        let mut rows = Vec::with_capacity(pg_rows.len());
        for pg_row in &pg_rows {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(postgres_to_value(pg_row, idx)?);
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
        let client = self.client.lock().await;

        let statement = client.prepare(sql).await.map_err(|e| {
            EngineError::Query(format!("failed to prepare statement: {}", format_postgres_error(&e)))
        })?;
        let pg_params = bind_params(params, statement.params());
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            pg_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let affected = client.execute(&statement, &param_refs).await.map_err(|e| {
            EngineError::Query(format!("failed to execute statement: {}", format_postgres_error(&e)))
        })?;

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
    fn test_numeric_text_parsing() {
        // 123.45 encoded: ndigits=2, weight=0, sign=0, dscale=2, digits [123, 4500]
        let raw: Vec<u8> = [
            2i16.to_be_bytes(),
            0i16.to_be_bytes(),
            0i16.to_be_bytes(),
            2i16.to_be_bytes(),
            123i16.to_be_bytes(),
            4500i16.to_be_bytes(),
        ]
        .concat();
        assert_eq!(PgNumericText::parse(&raw).unwrap(), "123.45");
    }

    #[test]
    fn test_numeric_nan() {
        let raw: Vec<u8> = [
            0i16.to_be_bytes(),
            0i16.to_be_bytes(),
            (0xC000u16).to_be_bytes(),
            0i16.to_be_bytes(),
        ]
        .concat();
        assert_eq!(PgNumericText::parse(&raw).unwrap(), "NaN");
    }

    #[test]
    fn test_type_mapping_totality_over_common_types() {
        assert_eq!(map_pg_type(&Type::INT4), ValueKind::Int64);
        assert_eq!(map_pg_type(&Type::NUMERIC), ValueKind::Decimal);
        assert_eq!(map_pg_type(&Type::TIMESTAMPTZ), ValueKind::Timestamp);
        assert_eq!(map_pg_type(&Type::INTERVAL), ValueKind::Interval);
        // Anything unknown falls back to text rather than failing.
        assert_eq!(map_pg_type(&Type::POINT), ValueKind::Text);
    }
}
