//! End-to-end report execution scenarios

mod common;

use std::collections::BTreeMap;
use common::{engine_with_config, engine_with_connections};
use pretty_assertions::assert_eq;
use sqlhub_engine::{
    ComponentStatus, EngineConfig, ReportComponent, ReportRequest,
};

async fn seed_metrics(env: &common::TestEnv, rows: i64) {
    env.exec("dash", "CREATE TABLE metrics (id INTEGER PRIMARY KEY, value INTEGER)").await;
    for i in 0..rows {
        env.exec(
            "dash",
            &format!("INSERT INTO metrics (id, value) VALUES ({}, {})", i, i * 7),
        )
        .await;
    }
}

fn component(env: &common::TestEnv, id: &str, query: &str) -> ReportComponent {
    ReportComponent {
        id: id.to_string(),
        connection_id: env.id("dash"),
        query: query.to_string(),
        limit: None,
        cache_seconds: Some(300),
    }
}

#[tokio::test]
async fn five_component_report_caches_on_second_run() {
    let env = engine_with_connections(&["dash"]).await;
    seed_metrics(&env, 30).await;

    let request = ReportRequest {
        components: (0..5)
            .map(|i| {
                component(
                    &env,
                    &format!("c{}", i),
                    &format!("SELECT id, value FROM metrics WHERE id >= {} ORDER BY id", i),
                )
            })
            .collect(),
        filters: BTreeMap::new(),
        force: false,
    };

    let first = env.engine.run_report(request.clone()).await;
    assert_eq!(first.len(), 5);
    for (i, result) in first.iter().enumerate() {
        assert_eq!(result.component_id, format!("c{}", i));
        assert_eq!(result.status, ComponentStatus::Completed);
        assert!(!result.cache_hit);
        assert_eq!(result.total_rows, 30 - i as u64);
    }

    let second = env.engine.run_report(request).await;
    for result in &second {
        assert_eq!(result.status, ComponentStatus::Completed);
        assert!(result.cache_hit);
    }
    // Cached rows are identical to the fresh ones.
    assert_eq!(second[0].rows.len(), first[0].rows.len());
}

#[tokio::test]
async fn oversized_component_fails_fast_with_total() {
    let config = {
        let mut config = EngineConfig::default();
        config.executor.max_result_limit = 10;
        config
    };
    let env = engine_with_config(&["dash"], config).await;
    seed_metrics(&env, 25).await;

    let request = ReportRequest {
        components: vec![
            component(&env, "big", "SELECT id FROM metrics"),
            component(&env, "small", "SELECT id FROM metrics WHERE id < 3"),
        ],
        filters: BTreeMap::new(),
        force: false,
    };

    let results = env.engine.run_report(request).await;
    assert_eq!(results[0].status, ComponentStatus::LimitExceeded);
    assert_eq!(results[0].total_rows, 25);
    assert!(results[0].rows.is_empty(), "no rows are fetched past the cap");

    assert_eq!(results[1].status, ComponentStatus::Completed);
    assert_eq!(results[1].limited_rows, 3);
}

#[tokio::test]
async fn filters_participate_in_the_cache_key() {
    let env = engine_with_connections(&["dash"]).await;
    seed_metrics(&env, 5).await;

    let mut filters = BTreeMap::new();
    filters.insert("window".to_string(), "7d".to_string());
    let request = ReportRequest {
        components: vec![component(&env, "c", "SELECT id FROM metrics")],
        filters,
        force: false,
    };

    env.engine.run_report(request.clone()).await;

    let mut shifted = request.clone();
    shifted
        .filters
        .insert("window".to_string(), "30d".to_string());
    let results = env.engine.run_report(shifted).await;
    assert!(!results[0].cache_hit);

    let results = env.engine.run_report(request).await;
    assert!(results[0].cache_hit);
}
