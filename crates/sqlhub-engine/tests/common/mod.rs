//! Shared fixtures for engine integration tests

use std::collections::HashMap;
use tempfile::TempDir;
use uuid::Uuid;
use sqlhub_engine::{ConnectionConfig, Engine, EngineConfig, QueryOptions};

pub struct TestEnv {
    pub engine: Engine,
    pub connections: HashMap<String, Uuid>,
    _dir: TempDir,
}

/// Build an engine with one temp-file SQLite connection per name.
pub async fn engine_with_connections(names: &[&str]) -> TestEnv {
    engine_with_config(names, EngineConfig::default()).await
}

pub async fn engine_with_config(names: &[&str], config: EngineConfig) -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::new(config);

    let mut connections = HashMap::new();
    for name in names {
        let path = dir.path().join(format!("{}.db", name));
        let config =
            ConnectionConfig::sqlite(path.to_str().expect("utf8 path")).with_name(*name);
        let info = engine
            .create_connection(config)
            .await
            .expect("create connection");
        connections.insert((*name).to_string(), info.id);
    }

    TestEnv {
        engine,
        connections,
        _dir: dir,
    }
}

impl TestEnv {
    pub fn id(&self, name: &str) -> Uuid {
        self.connections[name]
    }

    /// Run DDL/DML against one connection, panicking on failure.
    pub async fn exec(&self, name: &str, sql: &str) {
        self.engine
            .execute_query(self.id(name), sql, QueryOptions::default())
            .await
            .unwrap_or_else(|e| panic!("exec failed on {}: {}: {}", name, sql, e));
    }
}
