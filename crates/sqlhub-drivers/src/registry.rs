//! Driver registry mapping engine kinds to driver factories

use sqlhub_core::{DatabaseDriver, DatabaseKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available database drivers
pub struct DriverRegistry {
    drivers: HashMap<DatabaseKind, Arc<dyn DatabaseDriver>>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Create a registry with all built-in drivers registered.
    ///
    /// MariaDB is served by the MySQL driver; the registry records it
    /// under both kinds so lookups by either succeed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        #[cfg(feature = "sqlite")]
        registry.register(Arc::new(crate::sqlite::SqliteDriver::new()));
        #[cfg(feature = "postgres")]
        registry.register(Arc::new(crate::postgres::PostgresDriver::new()));
        #[cfg(feature = "mysql")]
        {
            registry.register(Arc::new(crate::mysql::MySqlDriver::new()));
            registry
                .drivers
                .insert(DatabaseKind::Mariadb, Arc::new(crate::mysql::MySqlDriver::new()));
        }

        registry
    }

    /// Register a driver under its own kind
    pub fn register(&mut self, driver: Arc<dyn DatabaseDriver>) {
        let kind = driver.kind();
        tracing::info!(driver = %kind, "registering database driver");
        self.drivers.insert(kind, driver);
    }

    /// Get a driver by kind
    pub fn get(&self, kind: DatabaseKind) -> Option<Arc<dyn DatabaseDriver>> {
        let driver = self.drivers.get(&kind).cloned();
        if driver.is_none() {
            tracing::warn!(driver = %kind, "driver not found in registry");
        }
        driver
    }

    /// List all registered kinds
    pub fn list(&self) -> Vec<DatabaseKind> {
        self.drivers.keys().copied().collect()
    }

    /// Check if a kind is registered
    pub fn has(&self, kind: DatabaseKind) -> bool {
        self.drivers.contains_key(&kind)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_all_spec_engines() {
        let registry = DriverRegistry::with_defaults();
        assert!(registry.has(DatabaseKind::Postgres));
        assert!(registry.has(DatabaseKind::Mysql));
        assert!(registry.has(DatabaseKind::Mariadb));
        assert!(registry.has(DatabaseKind::Sqlite));
    }

    #[test]
    fn test_mariadb_resolves_to_mysql_driver() {
        let registry = DriverRegistry::with_defaults();
        let driver = registry.get(DatabaseKind::Mariadb).unwrap();
        assert_eq!(driver.kind(), DatabaseKind::Mysql);
    }
}
