//! Background editable-metadata job registry

use crate::analyze::{BaseTableAnalysis, analyze_base_table};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;
use sqlhub_core::{EditableQueryMetadata, EngineEvent, EventBus, JobConfig};
use sqlhub_connection::ConnectionManager;
use sqlhub_schema::SchemaCache;

/// Job lifecycle state; terminal states are immutable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

/// One deferred editability analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditableMetadataJob {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub status: JobStatus,
    pub metadata: Option<EditableQueryMetadata>,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

struct StoredJob {
    job: EditableMetadataJob,
    finished_at: Option<Instant>,
}

type JobMap = Arc<Mutex<HashMap<Uuid, StoredJob>>>;

/// Process-wide registry of editability enrichment jobs.
///
/// Jobs are created `pending` when the synchronous analyzer defers; a
/// spawned worker resolves the metadata through the schema cache.
/// Completed jobs are retained for the configured window and swept on
/// registry access.
pub struct EditableJobRegistry {
    jobs: JobMap,
    schema_cache: Arc<SchemaCache>,
    manager: Arc<ConnectionManager>,
    events: Arc<EventBus>,
    config: JobConfig,
}

impl EditableJobRegistry {
    pub fn new(
        schema_cache: Arc<SchemaCache>,
        manager: Arc<ConnectionManager>,
        events: Arc<EventBus>,
        config: JobConfig,
    ) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            schema_cache,
            manager,
            events,
            config,
        }
    }

    /// Create a pending job for a deferred analysis and spawn its worker
    pub fn submit(&self, connection_id: Uuid, sql: String) -> Uuid {
        let job_id = Uuid::new_v4();
        let job = EditableMetadataJob {
            id: job_id,
            connection_id,
            status: JobStatus::Pending,
            metadata: None,
            error: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        self.jobs.lock().insert(
            job_id,
            StoredJob {
                job,
                finished_at: None,
            },
        );
        tracing::debug!(job_id = %job_id, connection_id = %connection_id, "editable metadata job created");

        let jobs = Arc::clone(&self.jobs);
        let schema_cache = Arc::clone(&self.schema_cache);
        let manager = Arc::clone(&self.manager);
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            let outcome = resolve(&schema_cache, &manager, connection_id, &sql).await;
            finish(&jobs, &events, job_id, connection_id, outcome);
        });

        job_id
    }

    /// Look up a job; expired completed jobs are swept first
    pub fn get(&self, job_id: Uuid) -> Option<EditableMetadataJob> {
        self.sweep_expired();
        self.jobs.lock().get(&job_id).map(|stored| stored.job.clone())
    }

    /// Number of jobs currently retained
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Drop completed/failed jobs older than the retention window
    pub fn sweep_expired(&self) {
        let retention = self.config.retention();
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, stored| {
            stored
                .finished_at
                .is_none_or(|finished| finished.elapsed() < retention)
        });
        let swept = before - jobs.len();
        if swept > 0 {
            tracing::debug!(swept = swept, "swept expired editable metadata jobs");
        }
    }
}

/// Worker: re-run the analysis with schema cache access.
///
/// Single-table queries resolve their identity; genuinely ambiguous
/// queries complete with editing disabled and the reason recorded.
async fn resolve(
    schema_cache: &SchemaCache,
    manager: &ConnectionManager,
    connection_id: Uuid,
    sql: &str,
) -> Result<EditableQueryMetadata, String> {
    match analyze_base_table(sql) {
        BaseTableAnalysis::Single {
            schema,
            table,
            projection,
        } => {
            let schema = match schema {
                Some(schema) => schema,
                None => manager
                    .default_schema(connection_id)
                    .ok()
                    .flatten()
                    .ok_or_else(|| "no schema could be resolved".to_string())?,
            };

            let details = schema_cache
                .get_table(connection_id, &schema, &table)
                .await
                .map_err(|e| e.to_string())?;

            let Some(identity) = details.unique_identity() else {
                return Ok(EditableQueryMetadata::disabled(format!(
                    "table {}.{} has no unique row identity",
                    schema, table
                )));
            };

            let columns: Vec<String> = if projection.is_empty() {
                details.columns.iter().map(|c| c.name.clone()).collect()
            } else {
                projection
            };
            if !identity.iter().all(|key| columns.contains(key)) {
                return Ok(EditableQueryMetadata::disabled(
                    "result does not project the full row identity",
                ));
            }

            Ok(EditableQueryMetadata {
                enabled: true,
                schema: Some(schema),
                table: Some(table),
                primary_key: identity,
                columns,
                pending: false,
                job_id: None,
                reason: None,
            })
        }
        BaseTableAnalysis::Deferred { reason } => Ok(EditableQueryMetadata::disabled(reason)),
        BaseTableAnalysis::NotSelect => {
            Ok(EditableQueryMetadata::disabled("statement is not a SELECT"))
        }
    }
}

fn finish(
    jobs: &JobMap,
    events: &EventBus,
    job_id: Uuid,
    connection_id: Uuid,
    outcome: Result<EditableQueryMetadata, String>,
) {
    {
        let mut jobs = jobs.lock();
        let Some(stored) = jobs.get_mut(&job_id) else {
            return;
        };
        if stored.job.status != JobStatus::Pending {
            // Terminal states are immutable.
            return;
        }

        match outcome {
            Ok(metadata) => {
                stored.job.status = JobStatus::Completed;
                stored.job.metadata = Some(metadata);
            }
            Err(error) => {
                stored.job.status = JobStatus::Failed;
                stored.job.error = Some(error);
            }
        }
        stored.job.completed_at = Some(chrono::Utc::now());
        stored.finished_at = Some(Instant::now());
    }

    tracing::debug!(job_id = %job_id, "editable metadata job finished");
    events.emit(EngineEvent::EditableMetadataReady {
        connection_id,
        job_id,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use sqlhub_core::{ConnectionConfig, SchemaCacheConfig, Value};

    async fn fixture(
        retention_ms: u64,
    ) -> (Arc<EditableJobRegistry>, Uuid, Arc<EventBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let events = Arc::new(EventBus::default());
        let manager = Arc::new(ConnectionManager::new(Arc::clone(&events)));
        let id = manager
            .create(ConnectionConfig::sqlite(path.to_str().unwrap()).with_name("jobs"))
            .await
            .unwrap();

        let conn = manager.acquire(id).await.unwrap();
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, status TEXT)",
            &[],
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO users (id, status) VALUES (?, ?)",
            &[Value::Int(1), Value::Text("active".into())],
        )
        .await
        .unwrap();
        drop(conn);

        let schema_cache = Arc::new(SchemaCache::new(
            Arc::clone(&manager),
            SchemaCacheConfig::default(),
        ));
        let registry = Arc::new(EditableJobRegistry::new(
            schema_cache,
            manager,
            Arc::clone(&events),
            JobConfig { retention_ms },
        ));
        (registry, id, events, dir)
    }

    async fn wait_terminal(registry: &EditableJobRegistry, job_id: Uuid) -> EditableMetadataJob {
        for _ in 0..100 {
            if let Some(job) = registry.get(job_id)
                && job.status != JobStatus::Pending
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never finished");
    }

    #[tokio::test]
    async fn test_single_table_job_completes_enabled() {
        let (registry, id, events, _dir) = fixture(600_000).await;
        let mut receiver = events.subscribe();

        let job_id = registry.submit(id, "SELECT id, status FROM users".into());
        let job = wait_terminal(&registry, job_id).await;

        assert_eq!(job.status, JobStatus::Completed);
        let metadata = job.metadata.unwrap();
        assert!(metadata.enabled);
        assert_eq!(metadata.primary_key, vec!["id".to_string()]);

        let mut saw_ready = false;
        while let Ok(event) = receiver.try_recv() {
            if event.name() == "query:editableMetadata" {
                saw_ready = true;
            }
        }
        assert!(saw_ready);
    }

    #[tokio::test]
    async fn test_join_job_completes_disabled() {
        let (registry, id, _events, _dir) = fixture(600_000).await;
        let job_id = registry.submit(
            id,
            "SELECT a.id FROM users a JOIN users b ON a.id = b.id".into(),
        );
        let job = wait_terminal(&registry, job_id).await;

        assert_eq!(job.status, JobStatus::Completed);
        let metadata = job.metadata.unwrap();
        assert!(!metadata.enabled);
        assert!(metadata.reason.is_some());
    }

    #[tokio::test]
    async fn test_unknown_connection_fails_job() {
        let (registry, _id, _events, _dir) = fixture(600_000).await;
        let job_id = registry.submit(Uuid::new_v4(), "SELECT id FROM users".into());
        let job = wait_terminal(&registry, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.is_some());
    }

    #[tokio::test]
    async fn test_expired_jobs_are_swept() {
        let (registry, id, _events, _dir) = fixture(20).await;
        let job_id = registry.submit(id, "SELECT id FROM users".into());
        wait_terminal(&registry, job_id).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get(job_id).is_none());
        assert!(registry.is_empty());
    }
}
