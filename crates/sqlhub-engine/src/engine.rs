//! Engine assembly and request/response surface

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;
use sqlhub_core::{
    ConnectionConfig, EngineConfig, EngineError, EngineEvent, EventBus, QueryResult, Result,
    SchemaInfo, TableDetails, TableInfo,
};
use sqlhub_connection::{ConnectionInfo, ConnectionManager, HealthReport, PoolConfig};
use sqlhub_federation::{MultiQueryExecutor, MultiQueryOptions, MultiQueryOutcome, ValidationReport};
use sqlhub_query::{
    EditableJobRegistry, EditableMetadataJob, QueryExecutor, QueryOptions, RowUpdateRequest,
    RowUpdateService, StreamRegistry,
};
use sqlhub_reports::{ReportCache, ReportComponentResult, ReportExecutor, ReportRequest};
use sqlhub_schema::{SchemaCache, SchemaCacheStats};

/// Wire outcome of a row update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowUpdateOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The assembled federation engine.
///
/// Everything with process-wide state lives behind this holder: stream
/// and job registries, the report cache, the schema cache, the
/// connection registry and the event bus.
pub struct Engine {
    events: Arc<EventBus>,
    manager: Arc<ConnectionManager>,
    schema_cache: Arc<SchemaCache>,
    jobs: Arc<EditableJobRegistry>,
    query: QueryExecutor,
    updates: RowUpdateService,
    multi: MultiQueryExecutor,
    reports: ReportExecutor,
}

impl Engine {
    /// Build an engine with default pool sizing
    pub fn new(config: EngineConfig) -> Self {
        Self::with_pool_config(config, PoolConfig::default())
    }

    /// Build an engine with explicit per-connection pool sizing
    pub fn with_pool_config(config: EngineConfig, pool_config: PoolConfig) -> Self {
        let events = Arc::new(EventBus::default());
        let manager = Arc::new(ConnectionManager::with_pool_config(
            Arc::clone(&events),
            pool_config,
        ));
        let schema_cache = Arc::new(SchemaCache::new(
            Arc::clone(&manager),
            config.schema_cache.clone(),
        ));
        let jobs = Arc::new(EditableJobRegistry::new(
            Arc::clone(&schema_cache),
            Arc::clone(&manager),
            Arc::clone(&events),
            config.jobs.clone(),
        ));
        let streams = Arc::new(StreamRegistry::new(Arc::clone(&events)));
        let query = QueryExecutor::new(
            Arc::clone(&manager),
            Arc::clone(&schema_cache),
            Arc::clone(&jobs),
            streams,
            Arc::clone(&events),
            config.executor.clone(),
        );
        let updates = RowUpdateService::new(
            Arc::clone(&manager),
            Arc::clone(&schema_cache),
            Arc::clone(&events),
        );
        let multi = MultiQueryExecutor::new(
            Arc::clone(&manager),
            Arc::clone(&events),
            config.federation.clone(),
            config.executor.clone(),
        );
        let report_cache = Arc::new(ReportCache::new(config.report.cache_max_bytes));
        let reports = ReportExecutor::new(
            Arc::clone(&manager),
            report_cache,
            Arc::clone(&events),
            config.report.clone(),
            config.executor.max_result_limit,
        );

        Self {
            events,
            manager,
            schema_cache,
            jobs,
            query,
            updates,
            multi,
            reports,
        }
    }

    /// Subscribe to engine lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The event bus shared by all components
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ========== Connections ==========

    /// Register a connection and return its wire snapshot
    pub async fn create_connection(&self, config: ConnectionConfig) -> Result<ConnectionInfo> {
        let id = self.manager.create(config).await?;
        self.manager
            .list()
            .into_iter()
            .find(|info| info.id == id)
            .ok_or_else(|| EngineError::Internal("connection vanished after create".into()))
    }

    /// Remove a connection; idempotent
    pub async fn remove_connection(&self, id: Uuid) -> Result<()> {
        self.schema_cache.invalidate(id);
        self.manager.remove(id).await
    }

    /// Open, ping and close a one-shot connection without registering it
    pub async fn test_connection(&self, config: &ConnectionConfig) -> Result<()> {
        self.manager.test(config).await
    }

    /// Snapshot all registered connections
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.manager.list()
    }

    /// Ping all pools concurrently with a fan-out cap
    pub async fn health_check_all(&self) -> Vec<HealthReport> {
        self.manager.health_check_all(8).await
    }

    // ========== Queries ==========

    /// Execute a statement on one connection
    pub async fn execute_query(
        &self,
        connection_id: Uuid,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryResult> {
        self.query.execute(connection_id, sql, options).await
    }

    /// Start a row stream; batches arrive as `stream:*` events
    pub async fn execute_query_stream(
        &self,
        connection_id: Uuid,
        sql: &str,
        batch_size: usize,
    ) -> Result<Uuid> {
        self.query
            .execute_stream(connection_id, sql, batch_size)
            .await
    }

    /// Cancel a running stream; idempotent
    pub fn cancel_stream(&self, stream_id: Uuid) {
        self.query.streams().cancel(stream_id);
    }

    /// Execute a query spanning one or more connections
    pub async fn execute_multi_database_query(
        &self,
        sql: &str,
        options: MultiQueryOptions,
    ) -> Result<MultiQueryOutcome> {
        self.multi.execute(sql, options).await
    }

    /// Validate a multi-database query without executing it
    pub fn validate_multi_query(&self, sql: &str) -> ValidationReport {
        self.multi.validate(sql)
    }

    /// Apply a row update addressed by result-set identity.
    ///
    /// Stale-state failures (`Conflict`, `Ambiguous`) come back as an
    /// unsuccessful outcome rather than an error; everything else
    /// propagates.
    pub async fn update_query_row(&self, request: RowUpdateRequest) -> Result<RowUpdateOutcome> {
        match self.updates.update_row(request).await {
            Ok(_) => Ok(RowUpdateOutcome {
                success: true,
                message: None,
            }),
            Err(EngineError::Conflict(_)) => Ok(RowUpdateOutcome {
                success: false,
                message: Some("conflict".to_string()),
            }),
            Err(EngineError::Ambiguous(_)) => Ok(RowUpdateOutcome {
                success: false,
                message: Some("ambiguous".to_string()),
            }),
            Err(e) => Err(e),
        }
    }

    /// Look up a deferred editability job
    pub fn get_editable_metadata(&self, job_id: Uuid) -> Result<EditableMetadataJob> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {} not found", job_id)))
    }

    // ========== Reports ==========

    /// Run a batch of report components; results keep input order
    pub async fn run_report(&self, request: ReportRequest) -> Vec<ReportComponentResult> {
        self.reports.run(request).await
    }

    // ========== Schema metadata ==========

    pub async fn get_schemas(&self, connection_id: Uuid) -> Result<Vec<SchemaInfo>> {
        self.schema_cache.get_schemas(connection_id).await
    }

    pub async fn get_tables(&self, connection_id: Uuid, schema: &str) -> Result<Vec<TableInfo>> {
        self.schema_cache.get_tables(connection_id, schema).await
    }

    pub async fn get_table_structure(
        &self,
        connection_id: Uuid,
        schema: &str,
        table: &str,
    ) -> Result<TableDetails> {
        self.schema_cache
            .get_table(connection_id, schema, table)
            .await
    }

    pub fn invalidate_schema_cache(&self, connection_id: Uuid) {
        self.schema_cache.invalidate(connection_id);
    }

    pub async fn refresh_schema(&self, connection_id: Uuid) -> Result<Vec<SchemaInfo>> {
        self.schema_cache.refresh(connection_id).await
    }

    pub fn get_schema_cache_stats(&self) -> SchemaCacheStats {
        self.schema_cache.stats()
    }
}
