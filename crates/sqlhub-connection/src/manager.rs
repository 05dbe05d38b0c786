//! Connection manager owning the id -> connection registry

use crate::health::{self, HealthReport, HealthThresholds};
use crate::pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use sqlhub_core::{
    Connection, ConnectionConfig, DatabaseDriver, DatabaseKind, EngineError, EngineEvent,
    EventBus, Result, SqlDialect,
};
use sqlhub_drivers::DriverRegistry;

/// Wire-visible snapshot of a registered connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub name: String,
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    pub username: Option<String>,
    pub active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

struct DriverFactory {
    driver: Arc<dyn DatabaseDriver>,
    config: ConnectionConfig,
}

#[async_trait]
impl ConnectionFactory for DriverFactory {
    async fn create(&self) -> Result<Arc<dyn Connection>> {
        self.driver.connect(&self.config).await
    }
}

struct ManagedConnection {
    config: ConnectionConfig,
    pool: ConnectionPool,
    driver: Arc<dyn DatabaseDriver>,
}

/// Manages registered database connections.
///
/// Owns the `id -> Connection` map behind a read/write guard; reads
/// vastly outnumber writes, so executors resolve connections without
/// contending with create/remove.
pub struct ConnectionManager {
    drivers: DriverRegistry,
    connections: RwLock<HashMap<Uuid, Arc<ManagedConnection>>>,
    events: Arc<EventBus>,
    pool_config: PoolConfig,
    /// How long `remove` waits for in-flight work to drain
    drain_grace: Duration,
}

impl ConnectionManager {
    /// Create a manager with the default driver registry
    pub fn new(events: Arc<EventBus>) -> Self {
        Self::with_pool_config(events, PoolConfig::default())
    }

    /// Create a manager with a custom pool configuration
    pub fn with_pool_config(events: Arc<EventBus>, pool_config: PoolConfig) -> Self {
        Self {
            drivers: DriverRegistry::with_defaults(),
            connections: RwLock::new(HashMap::new()),
            events,
            pool_config,
            drain_grace: Duration::from_secs(5),
        }
    }

    /// The driver registry
    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Register a connection and open its pool.
    ///
    /// The first connection is established eagerly so a failure leaves no
    /// partial state; the pool keeps it as its first idle entry.
    #[tracing::instrument(skip(self, config), fields(connection_name = %config.name, driver = %config.kind))]
    pub async fn create(&self, config: ConnectionConfig) -> Result<Uuid> {
        tracing::info!("creating connection");
        let driver = self
            .drivers
            .get(config.kind)
            .ok_or_else(|| EngineError::NotFound(format!("no driver for {}", config.kind)))?;

        let id = config.id;
        let pool = ConnectionPool::new(
            self.pool_config.clone(),
            DriverFactory {
                driver: Arc::clone(&driver),
                config: config.clone(),
            },
        );

        // Probe before registering: a failed open must not register.
        let probe = pool.get().await.map_err(|e| {
            tracing::error!(error = %e, "failed to open connection");
            e
        })?;
        drop(probe);

        let managed = Arc::new(ManagedConnection {
            config: config.clone(),
            pool,
            driver,
        });
        self.connections.write().insert(id, managed);

        self.events.emit(EngineEvent::ConnectionCreated {
            connection_id: id,
            name: config.name.clone(),
            kind: config.kind,
        });
        tracing::info!(connection_id = %id, "connection established");
        Ok(id)
    }

    /// Remove a connection, draining in-flight work for a grace period.
    ///
    /// Idempotent: removing an unknown id is a no-op.
    #[tracing::instrument(skip(self), fields(connection_id = %id))]
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let Some(managed) = self.connections.write().remove(&id) else {
            tracing::debug!("remove for unknown connection, nothing to do");
            return Ok(());
        };

        tracing::info!("removing connection");
        let deadline = Instant::now() + self.drain_grace;
        while managed.pool.active() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if managed.pool.active() > 0 {
            tracing::warn!(
                active = managed.pool.active(),
                "grace period elapsed with queries still in flight"
            );
        }
        managed.pool.close_idle().await;

        self.events
            .emit(EngineEvent::ConnectionRemoved { connection_id: id });
        Ok(())
    }

    /// Borrow a pooled connection
    pub async fn acquire(&self, id: Uuid) -> Result<PooledConnection> {
        let managed = self.entry(id)?;
        managed.pool.get().await
    }

    /// Check whether a connection id is registered
    pub fn is_registered(&self, id: Uuid) -> bool {
        self.connections.read().contains_key(&id)
    }

    /// Resolve a connection by display name
    pub fn resolve_name(&self, name: &str) -> Option<Uuid> {
        self.connections
            .read()
            .iter()
            .find(|(_, managed)| managed.config.name == name)
            .map(|(id, _)| *id)
    }

    /// The engine kind behind a connection
    pub fn kind(&self, id: Uuid) -> Result<DatabaseKind> {
        Ok(self.entry(id)?.config.kind)
    }

    /// The SQL dialect for a connection
    pub fn dialect(&self, id: Uuid) -> Result<SqlDialect> {
        Ok(self.entry(id)?.driver.dialect())
    }

    /// The schema applied when a reference against this connection omits
    /// one. MySQL/MariaDB use the database selected at connect time; the
    /// `default_schema` connection parameter overrides for any engine.
    pub fn default_schema(&self, id: Uuid) -> Result<Option<String>> {
        let managed = self.entry(id)?;
        if let Some(overridden) = managed.config.params.get("default_schema") {
            return Ok(Some(overridden.clone()));
        }
        let dialect = managed.driver.dialect();
        Ok(match dialect.default_schema() {
            Some(schema) => Some(schema.to_string()),
            None => managed.config.database.clone(),
        })
    }

    /// Pool statistics for a connection
    pub fn pool_stats(&self, id: Uuid) -> Result<PoolStats> {
        Ok(self.entry(id)?.pool.stats())
    }

    /// Snapshot all registered connections
    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .values()
            .map(|managed| ConnectionInfo {
                id: managed.config.id,
                name: managed.config.name.clone(),
                kind: managed.config.kind,
                host: managed.config.host.clone(),
                port: managed.config.effective_port(),
                database: managed.config.database.clone(),
                username: managed.config.username.clone(),
                active: true,
                created_at: managed.config.created_at,
            })
            .collect()
    }

    /// Open a one-shot connection, ping it, close it. Never registers.
    #[tracing::instrument(skip(self, config), fields(driver = %config.kind))]
    pub async fn test(&self, config: &ConnectionConfig) -> Result<()> {
        tracing::debug!("testing connection config");
        let driver = self
            .drivers
            .get(config.kind)
            .ok_or_else(|| EngineError::NotFound(format!("no driver for {}", config.kind)))?;

        let started = Instant::now();
        let outcome = driver.test_connection(config).await;
        self.events.emit(EngineEvent::ConnectionTested {
            kind: config.kind,
            ok: outcome.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
        });
        outcome
    }

    /// Ping every registered pool concurrently, capped at `concurrency`
    pub async fn health_check_all(&self, concurrency: usize) -> Vec<HealthReport> {
        let pools: Vec<(Uuid, ConnectionPool)> = self
            .connections
            .read()
            .iter()
            .map(|(id, managed)| (*id, managed.pool.clone()))
            .collect();
        health::check_all(pools, concurrency, HealthThresholds::default()).await
    }

    fn entry(&self, id: Uuid) -> Result<Arc<ManagedConnection>> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("connection {} not found", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_config(path: &str, name: &str) -> ConnectionConfig {
        ConnectionConfig::sqlite(path).with_name(name)
    }

    #[tokio::test]
    async fn test_create_and_remove_round_trip() {
        let events = Arc::new(EventBus::default());
        let mut receiver = events.subscribe();
        let manager = ConnectionManager::new(events);

        let id = manager
            .create(sqlite_config(":memory:", "scratch"))
            .await
            .unwrap();
        assert!(manager.is_registered(id));
        assert_eq!(receiver.recv().await.unwrap().name(), "connection:created");

        manager.remove(id).await.unwrap();
        assert!(!manager.is_registered(id));
        assert_eq!(receiver.recv().await.unwrap().name(), "connection:removed");

        // Second remove is a no-op and emits nothing.
        manager.remove(id).await.unwrap();
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_state() {
        let events = Arc::new(EventBus::default());
        let manager = ConnectionManager::new(events);

        let config = sqlite_config("/nonexistent-dir/sub/x.db", "broken");
        let id = config.id;
        assert!(manager.create(config).await.is_err());
        assert!(!manager.is_registered(id));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_unknown_connection() {
        let events = Arc::new(EventBus::default());
        let manager = ConnectionManager::new(events);
        let err = manager.acquire(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_resolve_name_and_default_schema() {
        let events = Arc::new(EventBus::default());
        let manager = ConnectionManager::new(events);
        let id = manager
            .create(sqlite_config(":memory:", "prod"))
            .await
            .unwrap();

        assert_eq!(manager.resolve_name("prod"), Some(id));
        assert_eq!(manager.resolve_name("missing"), None);
        assert_eq!(
            manager.default_schema(id).unwrap(),
            Some("main".to_string())
        );
    }

    #[tokio::test]
    async fn test_health_check_reports_registered_pools() {
        let events = Arc::new(EventBus::default());
        let manager = ConnectionManager::new(events);
        let id = manager
            .create(sqlite_config(":memory:", "hc"))
            .await
            .unwrap();

        let reports = manager.health_check_all(4).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].connection_id, id);
        assert!(reports[0].status.is_usable());
    }
}
