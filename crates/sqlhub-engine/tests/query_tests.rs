//! End-to-end single-connection scenarios

mod common;

use std::collections::HashMap;
use std::time::Duration;
use common::engine_with_connections;
use pretty_assertions::assert_eq;
use sqlhub_engine::{
    EngineEvent, JobStatus, QueryOptions, RowUpdateRequest, Value,
};

async fn seed_users(env: &common::TestEnv) {
    env.exec(
        "app",
        "CREATE TABLE users (id INTEGER PRIMARY KEY, status TEXT NOT NULL)",
    )
    .await;
    env.exec("app", "INSERT INTO users (id, status) VALUES (1, 'active')").await;
    env.exec("app", "INSERT INTO users (id, status) VALUES (2, 'inactive')").await;
    env.exec("app", "INSERT INTO users (id, status) VALUES (3, 'active')").await;
}

#[tokio::test]
async fn single_db_select_with_editability() {
    let env = engine_with_connections(&["app"]).await;
    seed_users(&env).await;

    let result = env
        .engine
        .execute_query(
            env.id("app"),
            "SELECT id, status FROM users WHERE status = 'active' ORDER BY id LIMIT 2",
            QueryOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        result.column_names(),
        vec!["id".to_string(), "status".to_string()]
    );
    assert_eq!(result.row_count(), 2);
    assert_eq!(result.rows[0].get(0), Some(&Value::Int(1)));
    assert_eq!(result.rows[1].get(0), Some(&Value::Int(3)));

    let editable = result.editable.expect("editability analysis ran");
    assert!(editable.enabled);
    assert_eq!(editable.primary_key, vec!["id".to_string()]);
    assert_eq!(editable.table.as_deref(), Some("users"));
}

#[tokio::test]
async fn row_update_happy_path() {
    let env = engine_with_connections(&["app"]).await;
    seed_users(&env).await;

    let outcome = env
        .engine
        .update_query_row(RowUpdateRequest {
            connection_id: env.id("app"),
            schema: Some("main".into()),
            table: Some("users".into()),
            primary_key: HashMap::from([("id".to_string(), Value::Int(3))]),
            values: HashMap::from([("status".to_string(), Value::Text("archived".into()))]),
            original_query: None,
        })
        .await
        .unwrap();
    assert!(outcome.success);

    let check = env
        .engine
        .execute_query(
            env.id("app"),
            "SELECT status FROM users WHERE id = 3",
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        check.rows[0].get(0),
        Some(&Value::Text("archived".to_string()))
    );
}

#[tokio::test]
async fn row_update_conflict_after_external_delete() {
    let env = engine_with_connections(&["app"]).await;
    seed_users(&env).await;

    env.exec("app", "DELETE FROM users WHERE id = 3").await;

    let outcome = env
        .engine
        .update_query_row(RowUpdateRequest {
            connection_id: env.id("app"),
            schema: Some("main".into()),
            table: Some("users".into()),
            primary_key: HashMap::from([("id".to_string(), Value::Int(3))]),
            values: HashMap::from([("status".to_string(), Value::Text("archived".into()))]),
            original_query: None,
        })
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.message.as_deref(), Some("conflict"));

    // No partial mutation: remaining rows are untouched.
    let check = env
        .engine
        .execute_query(
            env.id("app"),
            "SELECT count(*) FROM users WHERE status = 'archived'",
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(check.rows[0].get(0).and_then(|v| v.as_i64()), Some(0));
}

#[tokio::test]
async fn deferred_editability_resolves_through_job() {
    let env = engine_with_connections(&["app"]).await;
    seed_users(&env).await;

    let result = env
        .engine
        .execute_query(
            env.id("app"),
            "SELECT a.id FROM users a JOIN users b ON a.id = b.id",
            QueryOptions::default(),
        )
        .await
        .unwrap();

    let editable = result.editable.unwrap();
    assert!(editable.pending);
    let job_id = editable.job_id.unwrap();

    // The worker settles the job shortly after.
    let mut job = env.engine.get_editable_metadata(job_id).unwrap();
    for _ in 0..100 {
        if job.status != JobStatus::Pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        job = env.engine.get_editable_metadata(job_id).unwrap();
    }
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!job.metadata.unwrap().enabled);
}

#[tokio::test]
async fn stream_batches_arrive_in_order_and_cancel_cleanly() {
    let env = engine_with_connections(&["app"]).await;
    env.exec("app", "CREATE TABLE big (id INTEGER PRIMARY KEY)").await;
    for i in 0..50 {
        env.exec("app", &format!("INSERT INTO big (id) VALUES ({})", i)).await;
    }

    let mut events = env.engine.subscribe();
    let stream_id = env
        .engine
        .execute_query_stream(env.id("app"), "SELECT id FROM big ORDER BY id", 10)
        .await
        .unwrap();

    let mut last_end: Option<i64> = None;
    loop {
        match events.recv().await.unwrap() {
            EngineEvent::StreamBatch {
                stream_id: sid,
                rows,
                ..
            } if sid == stream_id => {
                let first = rows.first().and_then(|r| r.get(0)).and_then(|v| v.as_i64());
                if let (Some(first), Some(previous)) = (first, last_end) {
                    assert!(first > previous, "batches must arrive in row order");
                }
                last_end = rows.last().and_then(|r| r.get(0)).and_then(|v| v.as_i64());
            }
            EngineEvent::StreamEnd {
                stream_id: sid,
                total_rows,
                ..
            } if sid == stream_id => {
                assert_eq!(total_rows, 50);
                break;
            }
            _ => {}
        }
    }

    // Cancelling a finished stream is a quiet no-op.
    env.engine.cancel_stream(stream_id);
}

#[tokio::test]
async fn limit_boundaries() {
    let env = engine_with_connections(&["app"]).await;
    seed_users(&env).await;

    let err = env
        .engine
        .execute_query(
            env.id("app"),
            "SELECT * FROM users",
            QueryOptions {
                limit: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), sqlhub_engine::ErrorKind::InvalidInput);

    let err = env
        .engine
        .execute_query(
            env.id("app"),
            "SELECT * FROM users",
            QueryOptions {
                limit: Some(10_000_000),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), sqlhub_engine::ErrorKind::LimitExceeded);
}

#[tokio::test]
async fn create_remove_create_yields_fresh_id() {
    let env = engine_with_connections(&["app"]).await;
    let first = env.id("app");

    env.engine.remove_connection(first).await.unwrap();
    // Second remove is a no-op.
    env.engine.remove_connection(first).await.unwrap();

    let config = sqlhub_engine::ConnectionConfig::sqlite(":memory:").with_name("app2");
    let info = env.engine.create_connection(config).await.unwrap();
    assert_ne!(info.id, first);
    assert_eq!(env.engine.list_connections().len(), 1);
}

#[tokio::test]
async fn schema_endpoints_round_trip() {
    let env = engine_with_connections(&["app"]).await;
    seed_users(&env).await;

    let schemas = env.engine.get_schemas(env.id("app")).await.unwrap();
    assert_eq!(schemas.len(), 1);
    assert_eq!(schemas[0].name, "main");

    let tables = env.engine.get_tables(env.id("app"), "main").await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].name, "users");

    let details = env
        .engine
        .get_table_structure(env.id("app"), "main", "users")
        .await
        .unwrap();
    assert_eq!(details.columns.len(), 2);
    assert_eq!(details.unique_identity(), Some(vec!["id".to_string()]));

    let before = env.engine.get_schema_cache_stats();
    env.engine.invalidate_schema_cache(env.id("app"));
    env.engine.get_tables(env.id("app"), "main").await.unwrap();
    let after = env.engine.get_schema_cache_stats();
    assert!(after.misses > before.misses);
}
