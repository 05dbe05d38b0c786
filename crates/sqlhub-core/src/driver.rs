//! Database driver trait and connection configuration

use crate::{Connection, Result, SqlDialect};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgres,
    Mysql,
    Mariadb,
    Sqlite,
}

impl DatabaseKind {
    /// Stable identifier used in configs and the driver registry
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
            Self::Sqlite => "sqlite",
        }
    }

    /// Default server port (None for file-based engines)
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::Mysql | Self::Mariadb => Some(3306),
            Self::Sqlite => None,
        }
    }
}

impl std::str::FromStr for DatabaseKind {
    type Err = crate::EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "mariadb" => Ok(Self::Mariadb),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            other => Err(crate::EngineError::InvalidInput(format!(
                "unknown database kind: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capabilities a driver may support
#[derive(Debug, Clone, Default)]
pub struct DriverCapabilities {
    /// Supports transactions
    pub supports_transactions: bool,
    /// Supports schemas (namespaces)
    pub supports_schemas: bool,
    /// Supports multiple databases per server
    pub supports_multiple_databases: bool,
    /// Supports streaming results
    pub supports_streaming: bool,
    /// Supports query cancellation
    pub supports_cancellation: bool,
    /// Supports RETURNING clause
    pub supports_returning: bool,
    /// Supports SSL/TLS
    pub supports_ssl: bool,
    /// Maximum identifier length (None = no limit)
    pub max_identifier_length: Option<usize>,
    /// Maximum parameters per statement (None = no limit)
    pub max_parameters: Option<usize>,
}

/// Immutable connection descriptor.
///
/// `(kind, host, port, database, username)` uniquely identifies a logical
/// connection; the manager assigns the stable `id` and `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Unique identifier assigned by the manager
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Target engine
    pub kind: DatabaseKind,
    /// Host address (empty for file-based databases)
    pub host: String,
    /// Port number (0 = engine default)
    pub port: u16,
    /// Database name or file path
    pub database: Option<String>,
    /// Username
    pub username: Option<String>,
    /// Password, held only in memory; never serialized
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    /// SSL mode: disable, prefer, require, verify-ca, verify-full
    pub ssl_mode: String,
    /// Maximum time to wait when establishing the connection
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Free-form engine parameters
    pub params: HashMap<String, String>,
    /// Created timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values
    pub fn new(kind: DatabaseKind, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            host: String::new(),
            port: 0,
            database: None,
            username: None,
            password: None,
            ssl_mode: "prefer".to_string(),
            connect_timeout: Duration::from_secs(10),
            params: HashMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Create a SQLite configuration
    pub fn sqlite(database_path: &str) -> Self {
        let mut config = Self::new(DatabaseKind::Sqlite, "SQLite Database");
        config.database = Some(database_path.to_string());
        config
    }

    /// Create a PostgreSQL configuration
    pub fn postgres(host: &str, port: u16, database: &str, username: &str) -> Self {
        let mut config = Self::new(DatabaseKind::Postgres, "PostgreSQL");
        config.host = host.to_string();
        config.port = port;
        config.database = Some(database.to_string());
        config.username = Some(username.to_string());
        config
    }

    /// Create a MySQL configuration
    pub fn mysql(host: &str, port: u16, database: &str, username: &str) -> Self {
        let mut config = Self::new(DatabaseKind::Mysql, "MySQL");
        config.host = host.to_string();
        config.port = port;
        config.database = Some(database.to_string());
        config.username = Some(username.to_string());
        config
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set a free-form parameter
    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// The port to dial, falling back to the engine default
    pub fn effective_port(&self) -> u16 {
        if self.port > 0 {
            self.port
        } else {
            self.kind.default_port().unwrap_or(0)
        }
    }

    /// Logical identity of this connection.
    ///
    /// Two configs with the same identity describe the same logical
    /// connection regardless of their assigned ids.
    pub fn identity(&self) -> String {
        format!(
            "{}://{}@{}:{}/{}",
            self.kind,
            self.username.as_deref().unwrap_or(""),
            self.host,
            self.effective_port(),
            self.database.as_deref().unwrap_or(""),
        )
    }

    /// Get a string parameter, consulting known fields first
    pub fn get_string(&self, key: &str) -> Option<String> {
        match key {
            "host" => Some(self.host.clone()),
            "database" | "path" => self.database.clone(),
            "username" | "user" => self.username.clone(),
            "password" => self.password.clone(),
            "ssl_mode" => Some(self.ssl_mode.clone()),
            _ => self.params.get(key).cloned(),
        }
    }
}

/// Core driver trait every database adapter implements.
///
/// Drivers are registered by kind in the driver registry; new engines plug
/// in by implementing this capability set, not by inheritance.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// The engine this driver serves
    fn kind(&self) -> DatabaseKind;

    /// Human-readable name (e.g. "PostgreSQL")
    fn display_name(&self) -> &'static str;

    /// Supported capabilities
    fn capabilities(&self) -> DriverCapabilities;

    /// Default connection port
    fn default_port(&self) -> Option<u16> {
        self.kind().default_port()
    }

    /// The SQL dialect for identifier quoting and placeholders
    fn dialect(&self) -> SqlDialect {
        SqlDialect::new(self.kind())
    }

    /// Establish a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>>;

    /// Open, ping and close a one-shot connection without registering it
    async fn test_connection(&self, config: &ConnectionConfig) -> Result<()> {
        let conn = self.connect(config).await?;
        let outcome = conn.ping().await;
        let _ = conn.close().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_accepts_aliases() {
        assert_eq!("postgresql".parse::<DatabaseKind>().unwrap(), DatabaseKind::Postgres);
        assert_eq!("MariaDB".parse::<DatabaseKind>().unwrap(), DatabaseKind::Mariadb);
        assert!("oracle".parse::<DatabaseKind>().is_err());
    }

    #[test]
    fn test_identity_ignores_assigned_id() {
        let a = ConnectionConfig::postgres("db1", 5432, "app", "svc");
        let b = ConnectionConfig::postgres("db1", 5432, "app", "svc");
        assert_ne!(a.id, b.id);
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_effective_port_defaults() {
        let config = ConnectionConfig::new(DatabaseKind::Mysql, "m");
        assert_eq!(config.effective_port(), 3306);
        let config = ConnectionConfig::sqlite("/tmp/a.db");
        assert_eq!(config.effective_port(), 0);
    }
}
