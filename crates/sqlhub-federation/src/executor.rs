//! Multi-database query execution

use crate::merge::{MergedResult, VirtualTable, execute_merge};
use crate::plan::{FetchStep, Plan, ResolvedStrategy, Strategy, ValidationReport};
use crate::planner::Planner;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use sqlhub_core::{
    EngineError, EngineEvent, EventBus, ExecutorConfig, FederationConfig, Result, Row,
};
use sqlhub_connection::ConnectionManager;
use sqlhub_query::inject_limit_probe;

/// Caller options for one multi-database query
#[derive(Debug, Clone, Default)]
pub struct MultiQueryOptions {
    pub limit: Option<u64>,
    pub timeout: Option<Duration>,
    pub strategy: Strategy,
}

/// Result of a multi-database query
#[derive(Debug, Clone)]
pub struct MultiQueryOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub duration_ms: u64,
    /// Connection names that actually served fetches
    pub connections_used: Vec<String>,
    pub strategy: &'static str,
    pub truncated: bool,
}

/// Plans and executes queries spanning multiple connections.
///
/// Push-down hands the rewritten SQL to the single backend; federation
/// fetches referenced tables in parallel and merges in the coordinator.
/// Any fetch error aborts the query and cancels its siblings; no partial
/// rows are ever returned.
pub struct MultiQueryExecutor {
    manager: Arc<ConnectionManager>,
    planner: Planner,
    events: Arc<EventBus>,
    federation: FederationConfig,
    executor: ExecutorConfig,
}

impl MultiQueryExecutor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        events: Arc<EventBus>,
        federation: FederationConfig,
        executor: ExecutorConfig,
    ) -> Self {
        Self {
            planner: Planner::new(Arc::clone(&manager)),
            manager,
            events,
            federation,
            executor,
        }
    }

    /// Validate without executing
    pub fn validate(&self, sql: &str) -> ValidationReport {
        self.planner.validate(sql)
    }

    /// Plan and execute a multi-database query
    #[tracing::instrument(skip(self, sql, options), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    pub async fn execute(&self, sql: &str, options: MultiQueryOptions) -> Result<MultiQueryOutcome> {
        let outcome = self.try_execute(sql, options).await;
        match &outcome {
            Ok(result) => self.events.emit(EngineEvent::MultiQueryExecuted {
                connections_used: result.connections_used.clone(),
                strategy: result.strategy,
                rows: result.rows.len(),
                duration_ms: result.duration_ms,
            }),
            Err(e) => self.events.emit(EngineEvent::MultiQueryError {
                error: e.envelope(),
            }),
        }
        outcome
    }

    async fn try_execute(&self, sql: &str, options: MultiQueryOptions) -> Result<MultiQueryOutcome> {
        let limit = match options.limit {
            Some(0) => return Err(EngineError::InvalidInput("limit must be at least 1".into())),
            Some(limit) if limit > self.executor.max_result_limit => {
                return Err(EngineError::LimitExceeded {
                    total_rows: limit,
                    limit: self.executor.max_result_limit,
                });
            }
            Some(limit) => limit,
            None => self.executor.default_limit,
        };
        let deadline = options.timeout.unwrap_or(self.federation.default_timeout());

        let started = Instant::now();
        let plan = self.planner.plan(sql, options.strategy)?;

        let result = match plan.strategy {
            ResolvedStrategy::PushDown => {
                tokio::time::timeout(deadline, self.push_down(&plan, limit))
                    .await
                    .map_err(|_| EngineError::Timeout(format!("multi-query exceeded {:?}", deadline)))?
            }
            ResolvedStrategy::Federated => {
                tokio::time::timeout(deadline, self.federate(&plan, limit))
                    .await
                    .map_err(|_| EngineError::Timeout(format!("multi-query exceeded {:?}", deadline)))?
            }
        }?;

        tracing::info!(
            strategy = plan.strategy.as_str(),
            rows = result.rows.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "multi-query executed"
        );

        Ok(MultiQueryOutcome {
            columns: result.columns,
            rows: result.rows,
            duration_ms: started.elapsed().as_millis() as u64,
            connections_used: plan.required_connections.clone(),
            strategy: plan.strategy.as_str(),
            truncated: result.truncated,
        })
    }

    async fn push_down(&self, plan: &Plan, limit: u64) -> Result<InternalResult> {
        let step = &plan.steps[0];
        let (probed, _) = inject_limit_probe(&plan.rewritten_sql, limit + 1);

        let conn = self.manager.acquire(step.connection_id).await?;
        let mut result = conn.query(&probed, &[]).await?;
        drop(conn);

        let truncated = result.rows.len() as u64 > limit;
        if truncated {
            result.rows.truncate(limit as usize);
        }

        Ok(InternalResult {
            columns: result.column_names(),
            rows: result.rows,
            truncated,
        })
    }

    async fn federate(&self, plan: &Plan, limit: u64) -> Result<InternalResult> {
        let tables = self.fetch_all(&plan.steps).await?;
        let merged = execute_merge(&plan.rewritten_sql, &tables, limit + 1)?;

        let truncated = merged.rows.len() as u64 > limit;
        let MergedResult { columns, mut rows } = merged;
        if truncated {
            rows.truncate(limit as usize);
        }

        let rows = rows
            .into_iter()
            .map(|values| Row::new(columns.clone(), values))
            .collect();
        Ok(InternalResult {
            columns,
            rows,
            truncated,
        })
    }

    /// Fetch every referenced table in parallel.
    ///
    /// Bounded by the fan-out cap; the first failure cancels the
    /// remaining fetches and becomes the query's error.
    async fn fetch_all(&self, steps: &[FetchStep]) -> Result<HashMap<String, VirtualTable>> {
        let semaphore = Arc::new(Semaphore::new(self.federation.fanout_limit));
        let cancel = CancellationToken::new();
        let mut join_set = JoinSet::new();

        for (index, step) in steps.iter().enumerate() {
            let manager = Arc::clone(&self.manager);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let step = step.clone();
            let fetch_cap = self.federation.fetch_row_cap;

            join_set.spawn(async move {
                let _permit = semaphore.acquire().await;
                if cancel.is_cancelled() {
                    return (index, Err(EngineError::Cancelled));
                }

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                    fetched = fetch_step(manager, &step, fetch_cap) => fetched,
                };
                if outcome.is_err() {
                    cancel.cancel();
                }
                (index, outcome)
            });
        }

        let mut fetched: Vec<Option<VirtualTable>> = (0..steps.len()).map(|_| None).collect();
        let mut first_error: Option<EngineError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(table))) => fetched[index] = Some(table),
                Ok((_, Err(EngineError::Cancelled))) => {}
                Ok((index, Err(e))) => {
                    tracing::warn!(step = index, error = %e, "federated fetch failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(EngineError::Internal(format!(
                            "fetch task failed: {}",
                            e
                        )));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let mut tables = HashMap::with_capacity(steps.len());
        for (step, table) in steps.iter().zip(fetched) {
            let table = table.ok_or_else(|| {
                // A sibling's cancellation consumed this fetch.
                EngineError::Cancelled
            })?;
            tables.insert(step.placeholder.clone(), table);
        }
        Ok(tables)
    }
}

struct InternalResult {
    columns: Vec<String>,
    rows: Vec<Row>,
    truncated: bool,
}

async fn fetch_step(
    manager: Arc<ConnectionManager>,
    step: &FetchStep,
    fetch_cap: u64,
) -> Result<VirtualTable> {
    let dialect = manager.dialect(step.connection_id)?;
    let sql = format!(
        "SELECT * FROM {} LIMIT {}",
        dialect.quote_qualified(step.schema.as_deref(), &step.table),
        fetch_cap
    );

    tracing::debug!(
        connection = %step.connection_name,
        table = %step.table,
        "fetching virtual table"
    );
    let conn = manager.acquire(step.connection_id).await?;
    let result = conn.query(&sql, &[]).await?;
    drop(conn);

    Ok(VirtualTable {
        name: step.placeholder.clone(),
        columns: result.column_names(),
        rows: result.rows.into_iter().map(|row| row.values).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlhub_core::{ConnectionConfig, Value};

    struct Fixture {
        executor: MultiQueryExecutor,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventBus::default());
        let manager = Arc::new(ConnectionManager::new(Arc::clone(&events)));

        let prod = dir.path().join("prod.db");
        let prod_id = manager
            .create(ConnectionConfig::sqlite(prod.to_str().unwrap()).with_name("prod"))
            .await
            .unwrap();
        {
            let conn = manager.acquire(prod_id).await.unwrap();
            conn.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &[])
                .await
                .unwrap();
            for (id, name) in [(1, "ada"), (2, "grace"), (3, "mary")] {
                conn.execute(
                    "INSERT INTO users (id, name) VALUES (?, ?)",
                    &[Value::Int(id), Value::Text(name.into())],
                )
                .await
                .unwrap();
            }
        }

        let analytics = dir.path().join("analytics.db");
        let analytics_id = manager
            .create(ConnectionConfig::sqlite(analytics.to_str().unwrap()).with_name("analytics"))
            .await
            .unwrap();
        {
            let conn = manager.acquire(analytics_id).await.unwrap();
            conn.execute("CREATE TABLE events (user_id INTEGER, kind TEXT)", &[])
                .await
                .unwrap();
            for (user_id, kind) in [(1, "login"), (1, "click"), (2, "login")] {
                conn.execute(
                    "INSERT INTO events (user_id, kind) VALUES (?, ?)",
                    &[Value::Int(user_id), Value::Text(kind.into())],
                )
                .await
                .unwrap();
            }
        }

        let executor = MultiQueryExecutor::new(
            manager,
            events,
            FederationConfig::default(),
            ExecutorConfig::default(),
        );
        Fixture {
            executor,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_push_down_single_connection() {
        let fx = fixture().await;
        let outcome = fx
            .executor
            .execute(
                "SELECT name FROM @prod.users ORDER BY id",
                MultiQueryOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.strategy, "push_down");
        assert_eq!(outcome.connections_used, vec!["prod"]);
        assert_eq!(outcome.rows.len(), 3);
        assert_eq!(
            outcome.rows[0].get_by_name("name").and_then(|v| v.as_str()),
            Some("ada")
        );
    }

    #[tokio::test]
    async fn test_federated_join_with_group_by() {
        let fx = fixture().await;
        let outcome = fx
            .executor
            .execute(
                "SELECT u.name, count(*) AS n FROM @prod.users u \
                 JOIN @analytics.events e ON e.user_id = u.id \
                 GROUP BY u.name ORDER BY u.name",
                MultiQueryOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.strategy, "federated");
        assert_eq!(outcome.connections_used, vec!["prod", "analytics"]);
        assert_eq!(outcome.columns, vec!["name", "n"]);
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(
            outcome.rows[0].get(0),
            Some(&Value::Text("ada".to_string()))
        );
        assert_eq!(outcome.rows[0].get(1), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_whole_query() {
        let fx = fixture().await;
        let err = fx
            .executor
            .execute(
                "SELECT * FROM @prod.users u JOIN @analytics.missing m ON m.user_id = u.id",
                MultiQueryOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::QueryError);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_rejected() {
        let fx = fixture().await;
        let err = fx
            .executor
            .execute("SELECT * FROM @ghost.users", MultiQueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_limit_bounds_are_enforced() {
        let fx = fixture().await;
        let err = fx
            .executor
            .execute(
                "SELECT * FROM @prod.users",
                MultiQueryOptions {
                    limit: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::InvalidInput);

        let outcome = fx
            .executor
            .execute(
                "SELECT * FROM @prod.users ORDER BY id",
                MultiQueryOptions {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.rows.len(), 2);
        assert!(outcome.truncated);
    }

    #[tokio::test]
    async fn test_forced_federated_on_single_connection() {
        let fx = fixture().await;
        let outcome = fx
            .executor
            .execute(
                "SELECT name FROM @prod.users ORDER BY name",
                MultiQueryOptions {
                    strategy: Strategy::Federated,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.strategy, "federated");
        assert_eq!(outcome.rows.len(), 3);
    }
}
