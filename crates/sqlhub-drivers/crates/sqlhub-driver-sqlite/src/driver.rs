//! SQLite driver implementation

use crate::SqliteConnection;
use async_trait::async_trait;
use std::sync::Arc;
use sqlhub_core::{
    Connection, ConnectionConfig, DatabaseDriver, DatabaseKind, DriverCapabilities, EngineError,
    Result,
};

/// SQLite database driver
pub struct SqliteDriver;

impl SqliteDriver {
    /// Create a new SQLite driver instance
    pub fn new() -> Self {
        tracing::debug!("SQLite driver initialized");
        Self
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseDriver for SqliteDriver {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    fn display_name(&self) -> &'static str {
        "SQLite"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            supports_transactions: true,
            supports_schemas: false,
            supports_multiple_databases: false,
            supports_streaming: true,
            supports_cancellation: true,
            supports_returning: true,
            supports_ssl: false,
            max_identifier_length: None,
            max_parameters: Some(32_766),
        }
    }

    #[tracing::instrument(skip(self, config), fields(database = config.database.as_deref()))]
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let path = config
            .database
            .clone()
            .ok_or_else(|| EngineError::InvalidInput("SQLite requires a database path".into()))?;

        let conn = tokio::task::spawn_blocking(move || SqliteConnection::open(&path))
            .await
            .map_err(|e| EngineError::Internal(format!("SQLite open task failed: {}", e)))??;

        Ok(Arc::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_path() {
        let driver = SqliteDriver::new();
        let config = ConnectionConfig::new(DatabaseKind::Sqlite, "no path");
        let err = driver.connect(&config).await.unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_test_connection_round_trip() {
        let driver = SqliteDriver::new();
        let config = ConnectionConfig::sqlite(":memory:");
        driver.test_connection(&config).await.unwrap();
    }
}
