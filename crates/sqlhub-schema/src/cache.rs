//! Schema metadata cache with TTL and singleflight loads

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;
use sqlhub_core::{
    ColumnInfo, EngineError, Result, SchemaCacheConfig, SchemaInfo, TableDetails, TableInfo,
};
use sqlhub_connection::ConnectionManager;

/// Cache key: one entry per kind of metadata per connection
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum SchemaKey {
    /// Schema list for a connection
    Schemas,
    /// Table list for one schema
    Tables(String),
    /// Full structural details for one table
    Table(String, String),
}

/// Payload stored behind a key
#[derive(Debug, Clone)]
enum CachedData {
    Schemas(Vec<SchemaInfo>),
    Tables(Vec<TableInfo>),
    Table(TableDetails),
}

#[derive(Debug, Clone)]
struct ReadyEntry {
    data: CachedData,
    fetched_at: Instant,
    /// Set when a refresh attempt failed and this data outlived its TTL
    stale: bool,
    /// Error from the most recent failed refresh
    last_error: Option<String>,
}

enum Slot {
    /// A leader is performing the fetch; followers wait on the notify
    Loading {
        notify: Arc<Notify>,
        previous: Option<ReadyEntry>,
    },
    Ready(ReadyEntry),
}

enum FastPath {
    Hit(CachedData),
    Wait(Arc<Notify>),
    Lead(Arc<Notify>),
}

/// Counters exposed through the cache stats endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaCacheStats {
    pub entries: usize,
    pub stale_entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Loads avoided because a concurrent caller was already fetching
    pub collapsed_loads: u64,
    pub failed_refreshes: u64,
}

/// Read-through TTL cache over the adapters' schema introspection.
///
/// Invariants: at most one in-flight load per `(connection, key)`; data
/// past its TTL is never returned without a refresh attempt; a failed
/// refresh keeps the previous data, marked stale, with the error recorded.
pub struct SchemaCache {
    manager: Arc<ConnectionManager>,
    config: SchemaCacheConfig,
    slots: Mutex<HashMap<(Uuid, SchemaKey), Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    collapsed: AtomicU64,
    failed_refreshes: AtomicU64,
}

impl SchemaCache {
    pub fn new(manager: Arc<ConnectionManager>, config: SchemaCacheConfig) -> Self {
        Self {
            manager,
            config,
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            collapsed: AtomicU64::new(0),
            failed_refreshes: AtomicU64::new(0),
        }
    }

    /// List schemas for a connection, read-through with TTL
    pub async fn get_schemas(&self, connection_id: Uuid) -> Result<Vec<SchemaInfo>> {
        let data = self
            .load(connection_id, SchemaKey::Schemas, self.config.schema_ttl())
            .await?;
        match data {
            CachedData::Schemas(schemas) => Ok(schemas),
            _ => Err(EngineError::Internal("schema cache slot type confusion".into())),
        }
    }

    /// List tables in a schema, read-through with TTL
    pub async fn get_tables(&self, connection_id: Uuid, schema: &str) -> Result<Vec<TableInfo>> {
        let data = self
            .load(
                connection_id,
                SchemaKey::Tables(schema.to_string()),
                self.config.schema_ttl(),
            )
            .await?;
        match data {
            CachedData::Tables(tables) => Ok(tables),
            _ => Err(EngineError::Internal("schema cache slot type confusion".into())),
        }
    }

    /// Full table details (columns, keys, indexes), read-through with TTL
    pub async fn get_table(
        &self,
        connection_id: Uuid,
        schema: &str,
        table: &str,
    ) -> Result<TableDetails> {
        let data = self
            .load(
                connection_id,
                SchemaKey::Table(schema.to_string(), table.to_string()),
                self.config.column_ttl(),
            )
            .await?;
        match data {
            CachedData::Table(details) => Ok(details),
            _ => Err(EngineError::Internal("schema cache slot type confusion".into())),
        }
    }

    /// Columns of a table; the column list of `get_table`
    pub async fn get_columns(
        &self,
        connection_id: Uuid,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        Ok(self.get_table(connection_id, schema, table).await?.columns)
    }

    /// Drop every cached entry for one connection
    pub fn invalidate(&self, connection_id: Uuid) {
        tracing::info!(connection_id = %connection_id, "invalidating schema cache");
        self.slots
            .lock()
            .retain(|(id, _), _| *id != connection_id);
    }

    /// Drop everything
    pub fn invalidate_all(&self) {
        tracing::info!("invalidating all schema caches");
        self.slots.lock().clear();
    }

    /// Invalidate one connection and reload its schema list
    pub async fn refresh(&self, connection_id: Uuid) -> Result<Vec<SchemaInfo>> {
        self.invalidate(connection_id);
        self.get_schemas(connection_id).await
    }

    /// Counter snapshot
    pub fn stats(&self) -> SchemaCacheStats {
        let slots = self.slots.lock();
        let stale_entries = slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(entry) if entry.stale))
            .count();
        SchemaCacheStats {
            entries: slots.len(),
            stale_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            collapsed_loads: self.collapsed.load(Ordering::Relaxed),
            failed_refreshes: self.failed_refreshes.load(Ordering::Relaxed),
        }
    }

    /// Singleflight read-through load for one key
    async fn load(&self, connection_id: Uuid, key: SchemaKey, ttl: Duration) -> Result<CachedData> {
        let full_key = (connection_id, key.clone());
        loop {
            let fast = {
                let mut slots = self.slots.lock();
                // Decide with the borrow released before any insert.
                let decision = match slots.get(&full_key) {
                    Some(Slot::Ready(entry))
                        if !entry.stale && entry.fetched_at.elapsed() < ttl =>
                    {
                        Ok(FastPath::Hit(entry.data.clone()))
                    }
                    Some(Slot::Loading { notify, .. }) => {
                        Ok(FastPath::Wait(Arc::clone(notify)))
                    }
                    Some(Slot::Ready(entry)) => Err(Some(entry.clone())),
                    None => Err(None),
                };
                match decision {
                    Ok(path) => path,
                    Err(previous) => {
                        let notify = Arc::new(Notify::new());
                        slots.insert(
                            full_key.clone(),
                            Slot::Loading {
                                notify: Arc::clone(&notify),
                                previous,
                            },
                        );
                        FastPath::Lead(notify)
                    }
                }
            };

            match fast {
                FastPath::Hit(data) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(data);
                }
                FastPath::Wait(notify) => {
                    self.collapsed.fetch_add(1, Ordering::Relaxed);
                    notify.notified().await;
                    // Re-read; the leader has resolved the slot by now.
                    let resolved = {
                        let slots = self.slots.lock();
                        match slots.get(&full_key) {
                            Some(Slot::Ready(entry)) => Some(entry.data.clone()),
                            _ => None,
                        }
                    };
                    match resolved {
                        Some(data) => return Ok(data),
                        // Leader failed with nothing cached; loop takes
                        // the lead and surfaces its own error.
                        None => continue,
                    }
                }
                FastPath::Lead(notify) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return self.lead_fetch(connection_id, key, full_key, notify).await;
                }
            }
        }
    }

    /// Perform the underlying adapter call as the singleflight leader
    async fn lead_fetch(
        &self,
        connection_id: Uuid,
        key: SchemaKey,
        full_key: (Uuid, SchemaKey),
        notify: Arc<Notify>,
    ) -> Result<CachedData> {
        let outcome = self.fetch(connection_id, &key).await;

        let mut slots = self.slots.lock();
        let previous = match slots.remove(&full_key) {
            Some(Slot::Loading { previous, .. }) => previous,
            // Invalidated while loading; nothing to restore.
            _ => None,
        };

        let result = match outcome {
            Ok(data) => {
                slots.insert(
                    full_key,
                    Slot::Ready(ReadyEntry {
                        data: data.clone(),
                        fetched_at: Instant::now(),
                        stale: false,
                        last_error: None,
                    }),
                );
                Ok(data)
            }
            Err(e) => {
                self.failed_refreshes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(connection_id = %connection_id, error = %e, "schema refresh failed");
                match previous {
                    Some(mut entry) => {
                        // Keep serving the old data, visibly stale.
                        entry.stale = true;
                        entry.last_error = Some(e.to_string());
                        let data = entry.data.clone();
                        slots.insert(full_key, Slot::Ready(entry));
                        Ok(data)
                    }
                    None => Err(e),
                }
            }
        };

        drop(slots);
        notify.notify_waiters();
        result
    }

    async fn fetch(&self, connection_id: Uuid, key: &SchemaKey) -> Result<CachedData> {
        let conn = self.manager.acquire(connection_id).await?;
        let introspection = conn.as_schema_introspection().ok_or_else(|| {
            EngineError::Internal("connection does not support schema introspection".into())
        })?;

        match key {
            SchemaKey::Schemas => {
                tracing::debug!(connection_id = %connection_id, "loading schema list");
                Ok(CachedData::Schemas(introspection.list_schemas().await?))
            }
            SchemaKey::Tables(schema) => {
                tracing::debug!(connection_id = %connection_id, schema = %schema, "loading table list");
                Ok(CachedData::Tables(
                    introspection.list_tables(Some(schema)).await?,
                ))
            }
            SchemaKey::Table(schema, table) => {
                tracing::debug!(connection_id = %connection_id, schema = %schema, table = %table, "loading table details");
                Ok(CachedData::Table(
                    introspection.get_table(Some(schema), table).await?,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlhub_core::{ConnectionConfig, EventBus};

    async fn fixture() -> (Arc<ConnectionManager>, Uuid, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let manager = Arc::new(ConnectionManager::new(Arc::new(EventBus::default())));
        let id = manager
            .create(ConnectionConfig::sqlite(path.to_str().unwrap()).with_name("cache-test"))
            .await
            .unwrap();

        let conn = manager.acquire(id).await.unwrap();
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE)",
            &[],
        )
        .await
        .unwrap();
        drop(conn);

        (manager, id, dir)
    }

    #[tokio::test]
    async fn test_read_through_and_hit_counting() {
        let (manager, id, _dir) = fixture().await;
        let cache = SchemaCache::new(manager, SchemaCacheConfig::default());

        let tables = cache.get_tables(id, "main").await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(cache.stats().misses, 1);

        let tables = cache.get_tables(id, "main").await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let (manager, id, _dir) = fixture().await;
        let cache = SchemaCache::new(manager, SchemaCacheConfig::default());

        cache.get_tables(id, "main").await.unwrap();
        cache.invalidate(id);
        cache.get_tables(id, "main").await.unwrap();
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_expired_entries_refetch() {
        let (manager, id, _dir) = fixture().await;
        let cache = SchemaCache::new(
            manager,
            SchemaCacheConfig::uniform(Duration::from_millis(10)),
        );

        cache.get_tables(id, "main").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get_tables(id, "main").await.unwrap();
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_collapse_to_one_load() {
        let (manager, id, _dir) = fixture().await;
        let cache = Arc::new(SchemaCache::new(manager, SchemaCacheConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.get_tables(id, "main").await.unwrap().len()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1);
        }

        let stats = cache.stats();
        assert_eq!(stats.misses, 1, "only the leader should fetch");
        assert_eq!(stats.hits + stats.collapsed_loads, 7);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_data() {
        let (manager, id, _dir) = fixture().await;
        let cache = SchemaCache::new(
            Arc::clone(&manager),
            SchemaCacheConfig::uniform(Duration::from_millis(10)),
        );

        let details = cache.get_table(id, "main", "users").await.unwrap();
        assert_eq!(details.columns.len(), 2);

        // Make refreshes fail by removing the connection out from under
        // the cache, then let the entry expire.
        manager.remove(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let details = cache.get_table(id, "main", "users").await.unwrap();
        assert_eq!(details.columns.len(), 2, "stale data is kept on failed refresh");
        let stats = cache.stats();
        assert_eq!(stats.failed_refreshes, 1);
        assert_eq!(stats.stale_entries, 1);
    }

    #[tokio::test]
    async fn test_miss_on_unknown_connection_errors() {
        let (manager, _id, _dir) = fixture().await;
        let cache = SchemaCache::new(manager, SchemaCacheConfig::default());
        let err = cache.get_schemas(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::NotFound);
    }
}
