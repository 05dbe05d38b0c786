//! Single-connection query executor

use crate::analyze::{
    BaseTableAnalysis, StatementKind, analyze_base_table, classify_statement, inject_limit_probe,
};
use crate::jobs::EditableJobRegistry;
use crate::stream::{StreamRegistry, StreamStartOptions};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use sqlhub_core::{
    EditableQueryMetadata, EngineError, EngineEvent, EventBus, ExecutorConfig, QueryResult,
    Result,
};
use sqlhub_connection::ConnectionManager;
use sqlhub_schema::SchemaCache;

/// Caller-supplied execution options
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Deadline for the whole call; executor default applies when unset
    pub timeout: Option<Duration>,
    /// Reject anything that modifies data
    pub read_only: bool,
    /// Row cap; executor default applies when unset
    pub limit: Option<u64>,
}

/// Executes queries against a single registered connection.
///
/// Applies limits and the truncation probe, attaches editability
/// metadata to SELECT results and emits lifecycle events.
pub struct QueryExecutor {
    manager: Arc<ConnectionManager>,
    schema_cache: Arc<SchemaCache>,
    jobs: Arc<EditableJobRegistry>,
    streams: Arc<StreamRegistry>,
    events: Arc<EventBus>,
    config: ExecutorConfig,
}

impl QueryExecutor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        schema_cache: Arc<SchemaCache>,
        jobs: Arc<EditableJobRegistry>,
        streams: Arc<StreamRegistry>,
        events: Arc<EventBus>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            manager,
            schema_cache,
            jobs,
            streams,
            events,
            config,
        }
    }

    /// The stream registry backing `execute_stream`
    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    /// Validate the caller limit against executor bounds.
    ///
    /// `0` is a caller contract violation; anything above the hard cap is
    /// rejected before execution.
    fn effective_limit(&self, requested: Option<u64>) -> Result<u64> {
        match requested {
            Some(0) => Err(EngineError::InvalidInput("limit must be at least 1".into())),
            Some(limit) if limit > self.config.max_result_limit => Err(EngineError::LimitExceeded {
                total_rows: limit,
                limit: self.config.max_result_limit,
            }),
            Some(limit) => Ok(limit),
            None => Ok(self.config.default_limit),
        }
    }

    /// Execute a statement, routing SELECTs through the probe/editability
    /// path and everything else through the mutation path.
    #[tracing::instrument(skip(self, sql, options), fields(connection_id = %connection_id, sql_preview = %sql.chars().take(100).collect::<String>()))]
    pub async fn execute(
        &self,
        connection_id: Uuid,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryResult> {
        let limit = self.effective_limit(options.limit)?;
        let timeout = options.timeout.unwrap_or(self.config.default_timeout());

        let outcome = match classify_statement(sql) {
            StatementKind::Select => self.execute_select(connection_id, sql, limit, timeout).await,
            StatementKind::Mutation => {
                if options.read_only {
                    Err(EngineError::InvalidInput(
                        "mutation rejected by read-only options".into(),
                    ))
                } else {
                    self.execute_mutation(connection_id, sql, timeout).await
                }
            }
            StatementKind::Other => self.execute_passthrough(connection_id, sql, limit, timeout).await,
        };

        if let Err(e) = &outcome {
            self.events.emit(EngineEvent::QueryError {
                connection_id,
                error: e.envelope(),
            });
        }
        outcome
    }

    async fn execute_select(
        &self,
        connection_id: Uuid,
        sql: &str,
        limit: u64,
        timeout: Duration,
    ) -> Result<QueryResult> {
        let (probed_sql, _injected) = inject_limit_probe(sql, limit + 1);

        let conn = self.manager.acquire(connection_id).await?;
        let mut result = tokio::time::timeout(timeout, conn.query(&probed_sql, &[]))
            .await
            .map_err(|_| EngineError::Timeout(format!("query exceeded {:?}", timeout)))??;
        drop(conn);

        if result.rows.len() as u64 > limit {
            result.rows.truncate(limit as usize);
            result.truncated = true;
        }

        result.editable = Some(self.analyze_editability(connection_id, sql, &result).await);

        self.events.emit(EngineEvent::QueryExecuted {
            connection_id,
            query_id: result.id,
            rows: result.rows.len(),
            truncated: result.truncated,
            duration_ms: result.execution_time_ms,
        });
        tracing::info!(
            rows = result.rows.len(),
            truncated = result.truncated,
            duration_ms = result.execution_time_ms,
            "query executed"
        );
        Ok(result)
    }

    async fn execute_mutation(
        &self,
        connection_id: Uuid,
        sql: &str,
        timeout: Duration,
    ) -> Result<QueryResult> {
        let conn = self.manager.acquire(connection_id).await?;
        let statement = tokio::time::timeout(timeout, conn.execute(sql, &[]))
            .await
            .map_err(|_| EngineError::Timeout(format!("statement exceeded {:?}", timeout)))??;

        self.events.emit(EngineEvent::QueryMutated {
            connection_id,
            affected: statement.affected_rows,
            duration_ms: statement.execution_time_ms,
        });
        tracing::info!(
            affected = statement.affected_rows,
            duration_ms = statement.execution_time_ms,
            "statement executed"
        );

        let mut result = QueryResult::empty();
        result.affected_rows = statement.affected_rows;
        result.execution_time_ms = statement.execution_time_ms;
        Ok(result)
    }

    /// SHOW/EXPLAIN/PRAGMA and friends: run through the query path
    /// untouched, still bounded by the row cap.
    async fn execute_passthrough(
        &self,
        connection_id: Uuid,
        sql: &str,
        limit: u64,
        timeout: Duration,
    ) -> Result<QueryResult> {
        let conn = self.manager.acquire(connection_id).await?;
        let mut result = tokio::time::timeout(timeout, conn.query(sql, &[]))
            .await
            .map_err(|_| EngineError::Timeout(format!("query exceeded {:?}", timeout)))??;

        if result.rows.len() as u64 > limit {
            result.rows.truncate(limit as usize);
            result.truncated = true;
        }

        self.events.emit(EngineEvent::QueryExecuted {
            connection_id,
            query_id: result.id,
            rows: result.rows.len(),
            truncated: result.truncated,
            duration_ms: result.execution_time_ms,
        });
        Ok(result)
    }

    /// Decide editability synchronously where one base table is
    /// unambiguous; otherwise record a pending job.
    async fn analyze_editability(
        &self,
        connection_id: Uuid,
        sql: &str,
        result: &QueryResult,
    ) -> EditableQueryMetadata {
        match analyze_base_table(sql) {
            BaseTableAnalysis::Single {
                schema,
                table,
                projection,
            } => {
                let schema = match schema {
                    Some(schema) => Some(schema),
                    None => self.manager.default_schema(connection_id).unwrap_or(None),
                };
                let Some(schema) = schema else {
                    return EditableQueryMetadata::disabled("no schema could be resolved");
                };

                match self
                    .schema_cache
                    .get_table(connection_id, &schema, &table)
                    .await
                {
                    Ok(details) => {
                        let Some(identity) = details.unique_identity() else {
                            return EditableQueryMetadata::disabled(format!(
                                "table {}.{} has no unique row identity",
                                schema, table
                            ));
                        };

                        let columns: Vec<String> = if projection.is_empty() {
                            result.column_names()
                        } else {
                            projection
                        };

                        if !identity.iter().all(|key| columns.contains(key)) {
                            return EditableQueryMetadata::disabled(
                                "result does not project the full row identity",
                            );
                        }

                        EditableQueryMetadata {
                            enabled: true,
                            schema: Some(schema),
                            table: Some(table),
                            primary_key: identity,
                            columns,
                            pending: false,
                            job_id: None,
                            reason: None,
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "editability metadata lookup failed, deferring");
                        let job_id = self.jobs.submit(connection_id, sql.to_string());
                        EditableQueryMetadata::pending(job_id)
                    }
                }
            }
            BaseTableAnalysis::Deferred { reason } => {
                tracing::debug!(reason = %reason, "editability deferred to background job");
                let job_id = self.jobs.submit(connection_id, sql.to_string());
                EditableQueryMetadata::pending(job_id)
            }
            BaseTableAnalysis::NotSelect => {
                EditableQueryMetadata::disabled("statement does not return base-table rows")
            }
        }
    }

    /// Start a cancellable row stream for a SELECT.
    ///
    /// Returns the stream id; batches and termination arrive as
    /// `stream:*` events.
    #[tracing::instrument(skip(self, sql), fields(connection_id = %connection_id))]
    pub async fn execute_stream(
        &self,
        connection_id: Uuid,
        sql: &str,
        batch_size: usize,
    ) -> Result<Uuid> {
        if classify_statement(sql) != StatementKind::Select {
            return Err(EngineError::InvalidInput(
                "only SELECT statements can be streamed".into(),
            ));
        }

        let conn = self.manager.acquire(connection_id).await?;
        self.streams
            .start(
                conn,
                sql.to_string(),
                StreamStartOptions {
                    batch_size,
                    row_cap: self.config.max_result_limit,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlhub_core::{ConnectionConfig, JobConfig, SchemaCacheConfig, Value};

    struct Fixture {
        executor: QueryExecutor,
        connection_id: Uuid,
        events: Arc<EventBus>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.db");
        let events = Arc::new(EventBus::default());
        let manager = Arc::new(ConnectionManager::new(Arc::clone(&events)));
        let connection_id = manager
            .create(ConnectionConfig::sqlite(path.to_str().unwrap()).with_name("exec"))
            .await
            .unwrap();

        {
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
        }

        let schema_cache = Arc::new(SchemaCache::new(
            Arc::clone(&manager),
            SchemaCacheConfig::default(),
        ));
        let jobs = Arc::new(EditableJobRegistry::new(
            Arc::clone(&schema_cache),
            Arc::clone(&manager),
            Arc::clone(&events),
            JobConfig::default(),
        ));
        let streams = Arc::new(StreamRegistry::new(Arc::clone(&events)));
        let executor = QueryExecutor::new(
            manager,
            schema_cache,
            jobs,
            streams,
            Arc::clone(&events),
            ExecutorConfig::default(),
        );

        Fixture {
            executor,
            connection_id,
            events,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_select_attaches_editability() {
        let fx = fixture().await;
        let result = fx
            .executor
            .execute(
                fx.connection_id,
                "SELECT id, status FROM users WHERE status = 'active' ORDER BY id",
                QueryOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.row_count(), 2);
        let editable = result.editable.unwrap();
        assert!(editable.enabled);
        assert_eq!(editable.primary_key, vec!["id".to_string()]);
        assert_eq!(editable.table.as_deref(), Some("users"));
    }

    #[tokio::test]
    async fn test_limit_zero_rejected() {
        let fx = fixture().await;
        let err = fx
            .executor
            .execute(
                fx.connection_id,
                "SELECT * FROM users",
                QueryOptions {
                    limit: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_limit_above_cap_rejected_before_execution() {
        let fx = fixture().await;
        let err = fx
            .executor
            .execute(
                fx.connection_id,
                "SELECT * FROM users",
                QueryOptions {
                    limit: Some(1_000_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::LimitExceeded);
    }

    #[tokio::test]
    async fn test_truncation_probe_sets_flag() {
        let fx = fixture().await;
        let result = fx
            .executor
            .execute(
                fx.connection_id,
                "SELECT id FROM users ORDER BY id",
                QueryOptions {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.row_count(), 2);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_read_only_rejects_mutations() {
        let fx = fixture().await;
        let err = fx
            .executor
            .execute(
                fx.connection_id,
                "DELETE FROM users",
                QueryOptions {
                    read_only: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::InvalidInput);

        // Nothing was deleted.
        let result = fx
            .executor
            .execute(fx.connection_id, "SELECT count(*) FROM users", QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(result.rows[0].get(0).and_then(|v| v.as_i64()), Some(3));
    }

    #[tokio::test]
    async fn test_mutation_emits_event_and_counts() {
        let fx = fixture().await;
        let mut receiver = fx.events.subscribe();

        let result = fx
            .executor
            .execute(
                fx.connection_id,
                "UPDATE users SET status = 'archived' WHERE id = 1",
                QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.affected_rows, 1);

        let mut saw_mutated = false;
        while let Ok(event) = receiver.try_recv() {
            if event.name() == "query:mutated" {
                saw_mutated = true;
            }
        }
        assert!(saw_mutated);
    }

    #[tokio::test]
    async fn test_join_defers_editability_to_job() {
        let fx = fixture().await;
        let result = fx
            .executor
            .execute(
                fx.connection_id,
                "SELECT a.id FROM users a JOIN users b ON a.id = b.id",
                QueryOptions::default(),
            )
            .await
            .unwrap();

        let editable = result.editable.unwrap();
        assert!(!editable.enabled);
        assert!(editable.pending);
        assert!(editable.job_id.is_some());
    }
}
