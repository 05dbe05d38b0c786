//! Connection pool implementation
//!
//! Pooled handles are owned guards: they can cross `tokio::spawn`
//! boundaries and return their connection to the pool on drop.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use sqlhub_core::{Connection, EngineError, Result};

use super::config::PoolConfig;
use super::stats::PoolStats;

/// Factory trait for creating new connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Create a new connection
    async fn create(&self) -> Result<Arc<dyn Connection>>;

    /// Validate that a connection is still usable
    async fn validate(&self, conn: &dyn Connection) -> bool {
        !conn.is_closed()
    }
}

/// Idle connection with lifecycle metadata
struct IdleConnection {
    connection: Arc<dyn Connection>,
    created_at: Instant,
    parked_at: Instant,
}

struct PoolShared {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<VecDeque<IdleConnection>>,
    semaphore: Arc<Semaphore>,
    active_count: AtomicUsize,
    waiting_count: AtomicUsize,
}

/// A bounded connection pool.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a new pool with the given configuration and factory
    pub fn new<F: ConnectionFactory>(config: PoolConfig, factory: F) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_open()));
        Self {
            shared: Arc::new(PoolShared {
                config,
                factory: Arc::new(factory),
                idle: Mutex::new(VecDeque::new()),
                semaphore,
                active_count: AtomicUsize::new(0),
                waiting_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Get a connection from the pool.
    ///
    /// Reuses an idle connection when one passes lifetime and validation
    /// checks, creates a new one while under `max_open`, and otherwise
    /// waits for a return up to the acquire timeout.
    pub async fn get(&self) -> Result<PooledConnection> {
        let shared = &self.shared;
        shared.waiting_count.fetch_add(1, Ordering::SeqCst);

        let result = tokio::time::timeout(shared.config.acquire_timeout(), async {
            let permit = shared
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Internal("pool semaphore closed".into()))?;

            let connection = match self.take_idle().await {
                Some(conn) => conn,
                None => shared.factory.create().await?,
            };

            shared.active_count.fetch_add(1, Ordering::SeqCst);
            shared.waiting_count.fetch_sub(1, Ordering::SeqCst);

            Ok(PooledConnection {
                connection: Some(connection),
                shared: Arc::clone(shared),
                _permit: permit,
            })
        })
        .await;

        match result {
            Ok(conn) => conn,
            Err(_) => {
                shared.waiting_count.fetch_sub(1, Ordering::SeqCst);
                Err(EngineError::Timeout(format!(
                    "timed out waiting for a pooled connection ({:?})",
                    shared.config.acquire_timeout()
                )))
            }
        }
    }

    /// Pop idle connections until one passes lifetime and validation checks
    async fn take_idle(&self) -> Option<Arc<dyn Connection>> {
        let shared = &self.shared;
        loop {
            let parked = { shared.idle.lock().pop_front() };
            let parked = parked?;

            if let Some(max_lifetime) = shared.config.max_lifetime()
                && parked.created_at.elapsed() > max_lifetime
            {
                let _ = parked.connection.close().await;
                continue;
            }

            if parked.parked_at.elapsed() > shared.config.idle_timeout() {
                let _ = parked.connection.close().await;
                continue;
            }

            if !shared.factory.validate(&*parked.connection).await {
                let _ = parked.connection.close().await;
                continue;
            }

            return Some(parked.connection);
        }
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.idle.lock().len();
        let active = self.shared.active_count.load(Ordering::SeqCst);
        let waiting = self.shared.waiting_count.load(Ordering::SeqCst);
        PoolStats::new(idle + active, idle, active, waiting)
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Number of connections currently borrowed
    pub fn active(&self) -> usize {
        self.shared.active_count.load(Ordering::SeqCst)
    }

    /// Close all idle connections
    pub async fn close_idle(&self) {
        let connections: Vec<_> = {
            let mut idle = self.shared.idle.lock();
            idle.drain(..).collect()
        };
        for parked in connections {
            let _ = parked.connection.close().await;
        }
    }
}

/// A connection borrowed from the pool.
///
/// Returned to the pool on drop; closed instead when the idle queue is at
/// `max_idle` or the connection reports closed.
pub struct PooledConnection {
    connection: Option<Arc<dyn Connection>>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

impl PooledConnection {
    /// The underlying shared connection handle
    pub fn inner(&self) -> &Arc<dyn Connection> {
        self.connection.as_ref().expect("connection taken")
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.inner().as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };
        self.shared.active_count.fetch_sub(1, Ordering::SeqCst);

        if conn.is_closed() {
            return;
        }

        let mut idle = self.shared.idle.lock();
        if idle.len() < self.shared.config.max_idle() {
            idle.push_back(IdleConnection {
                connection: conn,
                created_at: Instant::now(),
                parked_at: Instant::now(),
            });
        }
        // Over max_idle the connection is simply dropped; engines close
        // their sessions when the last handle goes away.
    }
}
