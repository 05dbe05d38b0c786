//! Safe row updates addressed by result-set identity

use crate::analyze::{BaseTableAnalysis, analyze_base_table};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use sqlhub_core::{
    ColumnInfo, EngineError, EngineEvent, EventBus, Result, StatementResult, Value, ValueKind,
};
use sqlhub_connection::ConnectionManager;
use sqlhub_schema::SchemaCache;

/// A row update addressed by unique row identity
#[derive(Debug, Clone)]
pub struct RowUpdateRequest {
    pub connection_id: Uuid,
    pub schema: Option<String>,
    pub table: Option<String>,
    /// Identity columns and their current values
    pub primary_key: HashMap<String, Value>,
    /// Columns to set and their new values
    pub values: HashMap<String, Value>,
    /// Used only to reconstruct schema/table when not given directly
    pub original_query: Option<String>,
}

/// Builds and runs parameterized UPDATEs against the declared row
/// identity, always inside a transaction.
pub struct RowUpdateService {
    manager: Arc<ConnectionManager>,
    schema_cache: Arc<SchemaCache>,
    events: Arc<EventBus>,
    /// Deadline for the whole update transaction
    timeout: Duration,
}

impl RowUpdateService {
    pub fn new(
        manager: Arc<ConnectionManager>,
        schema_cache: Arc<SchemaCache>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            manager,
            schema_cache,
            events,
            timeout: Duration::from_secs(10),
        }
    }

    /// Apply one row update.
    ///
    /// Exactly one row must match the identity; zero matches roll back
    /// with `Conflict`, more than one with `Ambiguous`. Both signal stale
    /// client state.
    #[tracing::instrument(skip(self, request), fields(connection_id = %request.connection_id))]
    pub async fn update_row(&self, request: RowUpdateRequest) -> Result<StatementResult> {
        let outcome = self.try_update(&request).await;
        if let Err(e) = &outcome {
            self.events.emit(EngineEvent::QueryError {
                connection_id: request.connection_id,
                error: e.envelope(),
            });
        }
        outcome
    }

    async fn try_update(&self, request: &RowUpdateRequest) -> Result<StatementResult> {
        if request.primary_key.is_empty() {
            return Err(EngineError::InvalidInput("primary key must not be empty".into()));
        }
        if request.values.is_empty() {
            return Err(EngineError::InvalidInput("no values to update".into()));
        }

        let (schema, table) = self.resolve_target(request)?;

        let details = self
            .schema_cache
            .get_table(request.connection_id, &schema, &table)
            .await?;

        // Every referenced column must exist on the table.
        for column in request.primary_key.keys().chain(request.values.keys()) {
            if details.column(column).is_none() {
                return Err(EngineError::NotFound(format!(
                    "column {} does not exist on {}.{}",
                    column, schema, table
                )));
            }
        }

        // The key set must be exactly the declared unique identity.
        let identity = details.unique_identity().ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "table {}.{} has no unique row identity",
                schema, table
            ))
        })?;
        let mut given: Vec<&String> = request.primary_key.keys().collect();
        given.sort();
        let mut declared: Vec<&String> = identity.iter().collect();
        declared.sort();
        if given != declared {
            return Err(EngineError::InvalidInput(format!(
                "key columns {:?} do not match the declared identity {:?}",
                given, declared
            )));
        }

        for (column, value) in request.primary_key.iter().chain(request.values.iter()) {
            let info = details.column(column).expect("existence checked above");
            check_value_type(info, value)?;
        }

        let dialect = self.manager.dialect(request.connection_id)?;

        // Deterministic column order keeps the statement stable.
        let mut set_columns: Vec<&String> = request.values.keys().collect();
        set_columns.sort();
        let mut key_columns: Vec<&String> = request.primary_key.keys().collect();
        key_columns.sort();

        let mut params: Vec<Value> = Vec::with_capacity(set_columns.len() + key_columns.len());
        let mut position = 0;

        let assignments: Vec<String> = set_columns
            .iter()
            .map(|column| {
                position += 1;
                params.push(request.values[column.as_str()].clone());
                format!("{} = {}", dialect.quote_ident(column), dialect.placeholder(position))
            })
            .collect();

        let conditions: Vec<String> = key_columns
            .iter()
            .map(|column| {
                position += 1;
                params.push(request.primary_key[column.as_str()].clone());
                format!("{} = {}", dialect.quote_ident(column), dialect.placeholder(position))
            })
            .collect();

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            dialect.quote_qualified(Some(&schema), &table),
            assignments.join(", "),
            conditions.join(" AND ")
        );
        tracing::debug!(sql = %sql, "built row update");

        let conn = self.manager.acquire(request.connection_id).await?;
        let tx = conn.begin_transaction().await?;
        self.events.emit(EngineEvent::TransactionStarted {
            connection_id: request.connection_id,
        });

        let result = tokio::time::timeout(self.timeout, tx.execute(&sql, &params)).await;
        let statement = match result {
            Ok(Ok(statement)) => statement,
            Ok(Err(e)) => {
                let _ = tx.rollback().await;
                self.emit_rollback(request.connection_id);
                return Err(e);
            }
            Err(_) => {
                let _ = tx.rollback().await;
                self.emit_rollback(request.connection_id);
                return Err(EngineError::Timeout(format!(
                    "row update exceeded {:?}",
                    self.timeout
                )));
            }
        };

        match statement.affected_rows {
            1 => {
                tx.commit().await?;
                self.events.emit(EngineEvent::TransactionCommitted {
                    connection_id: request.connection_id,
                });
                tracing::info!(table = %table, "row updated");
                Ok(statement)
            }
            0 => {
                let _ = tx.rollback().await;
                self.emit_rollback(request.connection_id);
                Err(EngineError::Conflict(
                    "no row matches the given identity".into(),
                ))
            }
            n => {
                let _ = tx.rollback().await;
                self.emit_rollback(request.connection_id);
                Err(EngineError::Ambiguous(format!(
                    "identity matched {} rows",
                    n
                )))
            }
        }
    }

    /// Resolve the target table, reconstructing from the original query
    /// when schema/table were not supplied.
    fn resolve_target(&self, request: &RowUpdateRequest) -> Result<(String, String)> {
        let (mut schema, mut table) = (request.schema.clone(), request.table.clone());

        if table.is_none()
            && let Some(original) = &request.original_query
            && let BaseTableAnalysis::Single {
                schema: analyzed_schema,
                table: analyzed_table,
                ..
            } = analyze_base_table(original)
        {
            table = Some(analyzed_table);
            if schema.is_none() {
                schema = analyzed_schema;
            }
        }

        let table = table.ok_or_else(|| {
            EngineError::InvalidInput("no target table given or derivable".into())
        })?;
        let schema = match schema {
            Some(schema) => schema,
            None => self
                .manager
                .default_schema(request.connection_id)?
                .ok_or_else(|| EngineError::InvalidInput("no schema could be resolved".into()))?,
        };
        Ok((schema, table))
    }

    fn emit_rollback(&self, connection_id: Uuid) {
        self.events
            .emit(EngineEvent::TransactionRolledBack { connection_id });
    }
}

/// Check a value against a column's canonical kind.
///
/// NULL passes for nullable columns (the backend enforces constraints);
/// everything else must match the column's kind with only numeric
/// widening allowed.
fn check_value_type(column: &ColumnInfo, value: &Value) -> Result<()> {
    let ok = match value.kind() {
        ValueKind::Null => true,
        kind if kind == column.kind => true,
        ValueKind::Int64 => matches!(
            column.kind,
            ValueKind::Float64 | ValueKind::Decimal | ValueKind::Bool
        ),
        ValueKind::Float64 => matches!(column.kind, ValueKind::Decimal),
        ValueKind::Text => matches!(
            column.kind,
            // Text renderings accepted where the engine stores text-like
            // payloads anyway.
            ValueKind::Decimal | ValueKind::Uuid | ValueKind::Json | ValueKind::Interval
        ),
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(EngineError::TypeMismatch(format!(
            "value of kind {:?} does not fit column {} ({:?})",
            value.kind(),
            column.name,
            column.kind
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlhub_core::{ConnectionConfig, SchemaCacheConfig};

    struct Fixture {
        service: RowUpdateService,
        manager: Arc<ConnectionManager>,
        connection_id: Uuid,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("update.db");
        let events = Arc::new(EventBus::default());
        let manager = Arc::new(ConnectionManager::new(Arc::clone(&events)));
        let connection_id = manager
            .create(ConnectionConfig::sqlite(path.to_str().unwrap()).with_name("update"))
            .await
            .unwrap();

        let conn = manager.acquire(connection_id).await.unwrap();
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, status TEXT NOT NULL)",
            &[],
        )
        .await
        .unwrap();
        for (id, status) in [(1, "active"), (2, "inactive"), (3, "active")] {
            conn.execute(
                "INSERT INTO users (id, status) VALUES (?, ?)",
                &[Value::Int(id), Value::Text(status.into())],
            )
            .await
            .unwrap();
        }
        drop(conn);

        let schema_cache = Arc::new(SchemaCache::new(
            Arc::clone(&manager),
            SchemaCacheConfig::default(),
        ));
        let service = RowUpdateService::new(Arc::clone(&manager), schema_cache, events);
        Fixture {
            service,
            manager,
            connection_id,
            _dir: dir,
        }
    }

    fn request(fx: &Fixture, id: i64, status: &str) -> RowUpdateRequest {
        RowUpdateRequest {
            connection_id: fx.connection_id,
            schema: Some("main".into()),
            table: Some("users".into()),
            primary_key: HashMap::from([("id".to_string(), Value::Int(id))]),
            values: HashMap::from([("status".to_string(), Value::Text(status.into()))]),
            original_query: None,
        }
    }

    async fn status_of(fx: &Fixture, id: i64) -> Option<String> {
        let conn = fx.manager.acquire(fx.connection_id).await.unwrap();
        let result = conn
            .query("SELECT status FROM users WHERE id = ?", &[Value::Int(id)])
            .await
            .unwrap();
        result
            .rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    #[tokio::test]
    async fn test_happy_path_updates_exactly_one_row() {
        let fx = fixture().await;
        let result = fx.service.update_row(request(&fx, 3, "archived")).await.unwrap();
        assert_eq!(result.affected_rows, 1);
        assert_eq!(status_of(&fx, 3).await.as_deref(), Some("archived"));
        assert_eq!(status_of(&fx, 1).await.as_deref(), Some("active"));
    }

    #[tokio::test]
    async fn test_missing_row_is_conflict() {
        let fx = fixture().await;
        let err = fx.service.update_row(request(&fx, 99, "x")).await.unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_empty_key_and_values_rejected() {
        let fx = fixture().await;

        let mut r = request(&fx, 1, "x");
        r.primary_key.clear();
        let err = fx.service.update_row(r).await.unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::InvalidInput);

        let mut r = request(&fx, 1, "x");
        r.values.clear();
        let err = fx.service.update_row(r).await.unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_unknown_column_is_not_found() {
        let fx = fixture().await;
        let mut r = request(&fx, 1, "x");
        r.values.insert("nope".to_string(), Value::Int(1));
        let err = fx.service.update_row(r).await.unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_key_must_match_declared_identity() {
        let fx = fixture().await;
        let mut r = request(&fx, 1, "x");
        // status is not the declared identity of the table.
        r.primary_key = HashMap::from([("status".to_string(), Value::Text("active".into()))]);
        let err = fx.service.update_row(r).await.unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_type_mismatch_rejected() {
        let fx = fixture().await;
        let mut r = request(&fx, 1, "x");
        r.values
            .insert("status".to_string(), Value::Bytes(vec![1, 2, 3]));
        let err = fx.service.update_row(r).await.unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::TypeMismatch);
        // Nothing changed.
        assert_eq!(status_of(&fx, 1).await.as_deref(), Some("active"));
    }

    #[tokio::test]
    async fn test_target_reconstructed_from_original_query() {
        let fx = fixture().await;
        let mut r = request(&fx, 2, "archived");
        r.schema = None;
        r.table = None;
        r.original_query = Some("SELECT id, status FROM users WHERE status = 'inactive'".into());
        fx.service.update_row(r).await.unwrap();
        assert_eq!(status_of(&fx, 2).await.as_deref(), Some("archived"));
    }

    #[tokio::test]
    async fn test_idempotent_reapplication() {
        let fx = fixture().await;
        fx.service.update_row(request(&fx, 1, "archived")).await.unwrap();
        let second = fx.service.update_row(request(&fx, 1, "archived")).await.unwrap();
        assert_eq!(second.affected_rows, 1);
        assert_eq!(status_of(&fx, 1).await.as_deref(), Some("archived"));
    }
}
