//! Worker-pool report executor

use crate::cache::{CachedComponent, ReportCache, cache_key};
use crate::types::{ComponentStatus, ReportComponent, ReportComponentResult, ReportRequest};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use sqlhub_core::{EngineError, EngineEvent, EventBus, ReportConfig, Result};
use sqlhub_connection::ConnectionManager;
use sqlhub_query::inject_limit_probe;

/// Executes report components on a fixed worker pool.
///
/// Workers drain a shared task channel until it closes; results land in
/// slots ordered by input position, so callers see a stable order
/// regardless of completion order. A worker panic fails its component
/// and leaves the pool running.
pub struct ReportExecutor {
    manager: Arc<ConnectionManager>,
    cache: Arc<ReportCache>,
    events: Arc<EventBus>,
    config: ReportConfig,
    max_result_limit: u64,
}

struct Task {
    index: usize,
    component: ReportComponent,
}

impl ReportExecutor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        cache: Arc<ReportCache>,
        events: Arc<EventBus>,
        config: ReportConfig,
        max_result_limit: u64,
    ) -> Self {
        Self {
            manager,
            cache,
            events,
            config,
            max_result_limit,
        }
    }

    /// The cache backing this executor
    pub fn cache(&self) -> &Arc<ReportCache> {
        &self.cache
    }

    /// Run a batch of components and return results in input order
    pub async fn run(&self, request: ReportRequest) -> Vec<ReportComponentResult> {
        self.run_with_shared(request, Arc::new(DashMap::new())).await
    }

    /// Run a batch, publishing completed results into `shared`.
    ///
    /// Components that depend on earlier components (summary panes fed
    /// by data panes) read the map concurrently and only ever observe
    /// fully-built results keyed by component id.
    #[tracing::instrument(skip(self, request, shared), fields(components = request.components.len(), force = request.force))]
    pub async fn run_with_shared(
        &self,
        request: ReportRequest,
        shared: Arc<DashMap<String, ReportComponentResult>>,
    ) -> Vec<ReportComponentResult> {
        let component_count = request.components.len();
        if component_count == 0 {
            return Vec::new();
        }
        tracing::info!("running report");

        let (task_tx, task_rx) = mpsc::channel::<Task>(component_count);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let slots: Arc<Mutex<Vec<Option<ReportComponentResult>>>> =
            Arc::new(Mutex::new((0..component_count).map(|_| None).collect()));
        let filters = Arc::new(request.filters);

        let worker_count = self.config.worker_limit.min(component_count).max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let task_rx = Arc::clone(&task_rx);
            let slots = Arc::clone(&slots);
            let shared = Arc::clone(&shared);
            let filters = Arc::clone(&filters);
            let manager = Arc::clone(&self.manager);
            let cache = Arc::clone(&self.cache);
            let events = Arc::clone(&self.events);
            let config = self.config.clone();
            let max_result_limit = self.max_result_limit;
            let force = request.force;

            workers.push(tokio::spawn(async move {
                loop {
                    let task = { task_rx.lock().await.recv().await };
                    let Some(task) = task else {
                        // Channel closed and drained; the worker retires.
                        break;
                    };

                    let component_id = task.component.id.clone();
                    tracing::debug!(worker = worker_id, component = %component_id, "component picked up");
                    events.emit(EngineEvent::ReportComponentStarted {
                        component_id: component_id.clone(),
                    });

                    let started = Instant::now();
                    // Run the component on its own task so a panic is
                    // contained to this component, not the worker.
                    let run = tokio::spawn(run_component(
                        manager.clone(),
                        cache.clone(),
                        config.clone(),
                        max_result_limit,
                        task.component,
                        (*filters).clone(),
                        force,
                    ));
                    let abort = run.abort_handle();

                    let result = match tokio::time::timeout(config.component_timeout(), run).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_error)) => {
                            let message = if join_error.is_panic() {
                                "component worker panicked".to_string()
                            } else {
                                format!("component task failed: {}", join_error)
                            };
                            tracing::error!(component = %component_id, "{}", message);
                            ReportComponentResult::failed(
                                component_id.clone(),
                                ComponentStatus::Error,
                                EngineError::Internal(message).envelope(),
                                started.elapsed().as_millis() as u64,
                            )
                        }
                        Err(_) => {
                            // The deadline propagates as cancellation of
                            // the component's task.
                            abort.abort();
                            tracing::warn!(component = %component_id, "component timed out");
                            ReportComponentResult::failed(
                                component_id.clone(),
                                ComponentStatus::TimedOut,
                                EngineError::Timeout(format!(
                                    "component exceeded {:?}",
                                    config.component_timeout()
                                ))
                                .envelope(),
                                started.elapsed().as_millis() as u64,
                            )
                        }
                    };

                    events.emit(EngineEvent::ReportComponentFinished {
                        component_id: component_id.clone(),
                        status: result.status.as_str(),
                        cache_hit: result.cache_hit,
                        duration_ms: result.duration_ms,
                    });
                    shared.insert(component_id, result.clone());
                    slots.lock().await[task.index] = Some(result);
                }
            }));
        }

        for (index, component) in request.components.into_iter().enumerate() {
            // Capacity matches the component count; sends cannot block.
            let _ = task_tx.send(Task { index, component }).await;
        }
        drop(task_tx);

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "report worker failed");
            }
        }

        let mut slots = slots.lock().await;
        slots
            .iter_mut()
            .enumerate()
            .map(|(index, slot)| {
                slot.take().unwrap_or_else(|| {
                    ReportComponentResult::failed(
                        format!("component-{}", index),
                        ComponentStatus::Error,
                        EngineError::Internal("component produced no result".into()).envelope(),
                        0,
                    )
                })
            })
            .collect()
    }
}

/// Execute one component: cache check, pre-count guard, query, cache fill
async fn run_component(
    manager: Arc<ConnectionManager>,
    cache: Arc<ReportCache>,
    config: ReportConfig,
    max_result_limit: u64,
    component: ReportComponent,
    filters: BTreeMap<String, String>,
    force: bool,
) -> ReportComponentResult {
    let started = Instant::now();
    let component_id = component.id.clone();
    let key = cache_key(&component_id, &component.query, &filters);

    let cache_seconds = component
        .cache_seconds
        .unwrap_or(config.default_cache_seconds);
    let cacheable = cache_seconds > 0;

    if cacheable && !force
        && let Some(hit) = cache.get(&key)
    {
        tracing::debug!(component = %component_id, "report cache hit");
        return ReportComponentResult {
            component_id,
            status: ComponentStatus::Completed,
            columns: hit.columns.clone(),
            rows: hit.rows.clone(),
            cache_hit: true,
            total_rows: hit.total_rows,
            limited_rows: hit.rows.len() as u64,
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        };
    }

    match fetch_component(&manager, max_result_limit, &component).await {
        Ok((columns, rows, total_rows)) => {
            let limited_rows = rows.len() as u64;
            if cacheable {
                cache.set(
                    key,
                    CachedComponent {
                        columns: columns.clone(),
                        rows: rows.clone(),
                        total_rows,
                    },
                    Duration::from_secs(cache_seconds),
                );
            }
            ReportComponentResult {
                component_id,
                status: ComponentStatus::Completed,
                columns,
                rows,
                cache_hit: false,
                total_rows,
                limited_rows,
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
            }
        }
        Err(e) => {
            let status = match e.kind() {
                sqlhub_core::ErrorKind::LimitExceeded => ComponentStatus::LimitExceeded,
                sqlhub_core::ErrorKind::Timeout => ComponentStatus::TimedOut,
                _ => ComponentStatus::Error,
            };
            let mut failed = ReportComponentResult::failed(
                component_id,
                status,
                e.envelope(),
                started.elapsed().as_millis() as u64,
            );
            if let EngineError::LimitExceeded { total_rows, .. } = e {
                failed.total_rows = total_rows;
            }
            failed
        }
    }
}

async fn fetch_component(
    manager: &Arc<ConnectionManager>,
    max_result_limit: u64,
    component: &ReportComponent,
) -> Result<(Vec<String>, Vec<sqlhub_core::Row>, u64)> {
    let limit = component
        .limit
        .unwrap_or(max_result_limit)
        .min(max_result_limit);
    if limit == 0 {
        return Err(EngineError::InvalidInput("limit must be at least 1".into()));
    }

    let conn = manager.acquire(component.connection_id).await?;

    // Count before fetching: an oversized result fails fast with its
    // total, and no data rows are ever read.
    let count_sql = format!(
        "SELECT COUNT(*) AS total FROM ({}) AS sub_count",
        component.query.trim().trim_end_matches(';')
    );
    let count_result = conn.query(&count_sql, &[]).await?;
    let total_rows = count_result
        .rows
        .first()
        .and_then(|row| row.get(0))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
        .max(0) as u64;

    if total_rows > max_result_limit {
        return Err(EngineError::LimitExceeded {
            total_rows,
            limit: max_result_limit,
        });
    }

    let (probed, _) = inject_limit_probe(&component.query, limit);
    let result = conn.query(&probed, &[]).await?;
    drop(conn);

    let columns = result.column_names();
    let mut rows = result.rows;
    rows.truncate(limit as usize);
    Ok((columns, rows, total_rows))
}
