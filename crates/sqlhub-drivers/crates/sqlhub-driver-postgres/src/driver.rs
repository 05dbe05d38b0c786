//! PostgreSQL driver implementation

use crate::PostgresConnection;
use async_trait::async_trait;
use std::sync::Arc;
use sqlhub_core::{
    Connection, ConnectionConfig, DatabaseDriver, DatabaseKind, DriverCapabilities, Result,
};

/// PostgreSQL database driver
pub struct PostgresDriver;

impl PostgresDriver {
    /// Create a new PostgreSQL driver instance
    pub fn new() -> Self {
        tracing::debug!("PostgreSQL driver initialized");
        Self
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    fn display_name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            supports_transactions: true,
            supports_schemas: true,
            supports_multiple_databases: true,
            supports_streaming: true,
            supports_cancellation: true,
            supports_returning: true,
            supports_ssl: true,
            max_identifier_length: Some(63),
            max_parameters: Some(65_535),
        }
    }

    #[tracing::instrument(skip(self, config), fields(host = %config.host, database = config.database.as_deref()))]
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let host = if config.host.is_empty() {
            "localhost"
        } else {
            &config.host
        };
        let port = config.effective_port();
        let database = config.database.as_deref().unwrap_or("postgres");
        let ssl_ca_cert = config.get_string("ssl_ca_cert");

        let conn = PostgresConnection::connect(
            host,
            port,
            database,
            config.username.as_deref(),
            config.password.as_deref(),
            &config.ssl_mode,
            ssl_ca_cert.as_deref(),
            config.connect_timeout,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to connect to PostgreSQL database");
            e
        })?;

        tracing::info!(host = %host, port = %port, database = %database, "PostgreSQL connection created");
        Ok(Arc::new(conn))
    }
}
