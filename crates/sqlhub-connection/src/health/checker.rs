//! Concurrent health checking with a fan-out cap

use super::status::{HealthReport, HealthThresholds};
use crate::pool::ConnectionPool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Ping every pool concurrently, at most `concurrency` at a time.
///
/// Reports come back in the input order; a failed ping yields a `Down`
/// report rather than an error.
pub async fn check_all(
    pools: Vec<(Uuid, ConnectionPool)>,
    concurrency: usize,
    thresholds: HealthThresholds,
) -> Vec<HealthReport> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let thresholds = Arc::new(thresholds);

    let mut handles = Vec::with_capacity(pools.len());
    for (connection_id, pool) in pools {
        let semaphore = Arc::clone(&semaphore);
        let thresholds = Arc::clone(&thresholds);

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let started = Instant::now();
            match pool.get().await {
                Ok(conn) => match conn.ping().await {
                    Ok(()) => HealthReport::up(connection_id, started.elapsed(), &thresholds),
                    Err(e) => {
                        tracing::warn!(connection_id = %connection_id, error = %e, "health ping failed");
                        HealthReport::down(connection_id, e.to_string())
                    }
                },
                Err(e) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "health check could not acquire a connection");
                    HealthReport::down(connection_id, e.to_string())
                }
            }
        }));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(e) => {
                tracing::error!(error = %e, "health check task failed");
            }
        }
    }
    reports
}
