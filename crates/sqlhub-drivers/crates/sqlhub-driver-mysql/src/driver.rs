//! MySQL driver implementation

use crate::MySqlConnection;
use async_trait::async_trait;
use std::sync::Arc;
use sqlhub_core::{
    Connection, ConnectionConfig, DatabaseDriver, DatabaseKind, DriverCapabilities, Result,
};

/// MySQL/MariaDB database driver
pub struct MySqlDriver;

impl MySqlDriver {
    /// Create a new MySQL driver instance
    pub fn new() -> Self {
        tracing::debug!("MySQL driver initialized");
        Self
    }
}

impl Default for MySqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseDriver for MySqlDriver {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Mysql
    }

    fn display_name(&self) -> &'static str {
        "MySQL"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            supports_transactions: true,
            supports_schemas: true,
            supports_multiple_databases: true,
            supports_streaming: true,
            supports_cancellation: false,
            supports_returning: false,
            supports_ssl: true,
            max_identifier_length: Some(64),
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

        let conn = MySqlConnection::connect(
            host,
            port,
            config.database.as_deref(),
            config.username.as_deref(),
            config.password.as_deref(),
            &config.ssl_mode,
            config.connect_timeout,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to connect to MySQL database");
            e
        })?;

        tracing::info!(host = %host, port = %port, "MySQL connection created");
        Ok(Arc::new(conn))
    }
}
