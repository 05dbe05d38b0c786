//! Registry of cancellable row streams

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use sqlhub_core::{EngineEvent, EventBus, Result};
use sqlhub_connection::PooledConnection;

/// Options for starting a stream
#[derive(Debug, Clone)]
pub struct StreamStartOptions {
    pub batch_size: usize,
    /// Hard cap on rows delivered across all batches
    pub row_cap: u64,
}

struct StreamHandle {
    cancel: CancellationToken,
}

/// Registry of in-flight row streams.
///
/// Batches are emitted as `stream:batch` events; a stream ends with
/// exactly one `stream:end` or `stream:cancelled`. Operations on the
/// registry map are O(1) under an exclusive lock.
pub struct StreamRegistry {
    streams: Arc<Mutex<HashMap<Uuid, StreamHandle>>>,
    events: Arc<EventBus>,
}

impl StreamRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Ids of streams currently running
    pub fn active(&self) -> Vec<Uuid> {
        self.streams.lock().keys().copied().collect()
    }

    /// Cancel a running stream.
    ///
    /// Idempotent; cancelling an unknown or finished stream is a no-op.
    pub fn cancel(&self, stream_id: Uuid) {
        if let Some(handle) = self.streams.lock().get(&stream_id) {
            tracing::debug!(stream_id = %stream_id, "cancelling stream");
            handle.cancel.cancel();
        }
    }

    /// Start pumping a query's batches into the event bus.
    ///
    /// The pooled connection stays borrowed until the stream finishes.
    pub async fn start(
        &self,
        conn: PooledConnection,
        sql: String,
        options: StreamStartOptions,
    ) -> Result<Uuid> {
        let stream_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.streams.lock().insert(
            stream_id,
            StreamHandle {
                cancel: cancel.clone(),
            },
        );

        let streams = Arc::clone(&self.streams);
        let events = Arc::clone(&self.events);
        let batch_size = options.batch_size.max(1);
        let row_cap = options.row_cap;

        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(4);
            let producer_cancel = cancel.clone();
            let producer_sql = sql;

            let producer = tokio::spawn(async move {
                let summary = conn
                    .query_stream(&producer_sql, &[], batch_size, tx, producer_cancel)
                    .await;
                drop(conn);
                summary
            });

            let mut delivered: u64 = 0;
            let mut capped = false;
            while let Some(mut batch) = rx.recv().await {
                if delivered + batch.rows.len() as u64 > row_cap {
                    batch.rows.truncate((row_cap - delivered) as usize);
                    capped = true;
                }
                delivered += batch.rows.len() as u64;
                if !batch.rows.is_empty() {
                    events.emit(EngineEvent::StreamBatch {
                        stream_id,
                        seq: batch.seq,
                        rows: batch.rows,
                    });
                }
                if capped {
                    cancel.cancel();
                    break;
                }
            }
            // Drain remaining batches after a cap-triggered cancel so the
            // producer is never blocked on a full channel.
            while rx.recv().await.is_some() {}

            streams.lock().remove(&stream_id);

            match producer.await {
                Ok(Ok(summary)) => {
                    if summary.cancelled && !capped {
                        tracing::info!(stream_id = %stream_id, "stream cancelled");
                        events.emit(EngineEvent::StreamCancelled { stream_id });
                    } else {
                        tracing::info!(
                            stream_id = %stream_id,
                            total_rows = delivered,
                            "stream finished"
                        );
                        events.emit(EngineEvent::StreamEnd {
                            stream_id,
                            total_rows: delivered,
                            truncated: capped,
                        });
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(stream_id = %stream_id, error = %e, "stream failed");
                    if matches!(e, sqlhub_core::EngineError::Cancelled) {
                        events.emit(EngineEvent::StreamCancelled { stream_id });
                    } else {
                        events.emit(EngineEvent::StreamEnd {
                            stream_id,
                            total_rows: delivered,
                            truncated: capped,
                        });
                    }
                }
                Err(e) => {
                    tracing::error!(stream_id = %stream_id, error = %e, "stream task panicked");
                    events.emit(EngineEvent::StreamCancelled { stream_id });
                }
            }
        });

        Ok(stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlhub_core::{ConnectionConfig, Value};
    use sqlhub_connection::ConnectionManager;

    async fn fixture(rows: i64) -> (Arc<ConnectionManager>, Uuid, Arc<EventBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.db");
        let events = Arc::new(EventBus::default());
        let manager = Arc::new(ConnectionManager::new(Arc::clone(&events)));
        let id = manager
            .create(ConnectionConfig::sqlite(path.to_str().unwrap()).with_name("stream"))
            .await
            .unwrap();
        let conn = manager.acquire(id).await.unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        for i in 0..rows {
            conn.execute("INSERT INTO t (id) VALUES (?)", &[Value::Int(i)])
                .await
                .unwrap();
        }
        drop(conn);
        (manager, id, events, dir)
    }

    #[tokio::test]
    async fn test_stream_emits_batches_then_end() {
        let (manager, id, events, _dir) = fixture(10).await;
        let registry = Arc::new(StreamRegistry::new(Arc::clone(&events)));
        let mut receiver = events.subscribe();

        let conn = manager.acquire(id).await.unwrap();
        let stream_id = registry
            .start(
                conn,
                "SELECT id FROM t ORDER BY id".into(),
                StreamStartOptions {
                    batch_size: 4,
                    row_cap: 1_000,
                },
            )
            .await
            .unwrap();

        let mut batches = 0;
        let mut total = 0;
        loop {
            match receiver.recv().await.unwrap() {
                EngineEvent::StreamBatch { stream_id: sid, rows, .. } if sid == stream_id => {
                    batches += 1;
                    total += rows.len();
                }
                EngineEvent::StreamEnd {
                    stream_id: sid,
                    total_rows,
                    truncated,
                } if sid == stream_id => {
                    assert_eq!(total_rows, 10);
                    assert!(!truncated);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(batches, 3);
        assert_eq!(total, 10);
        assert!(registry.active().is_empty());
    }

    #[tokio::test]
    async fn test_row_cap_truncates_stream() {
        let (manager, id, events, _dir) = fixture(50).await;
        let registry = Arc::new(StreamRegistry::new(Arc::clone(&events)));
        let mut receiver = events.subscribe();

        let conn = manager.acquire(id).await.unwrap();
        let stream_id = registry
            .start(
                conn,
                "SELECT id FROM t ORDER BY id".into(),
                StreamStartOptions {
                    batch_size: 8,
                    row_cap: 20,
                },
            )
            .await
            .unwrap();

        let mut total = 0;
        loop {
            match receiver.recv().await.unwrap() {
                EngineEvent::StreamBatch { stream_id: sid, rows, .. } if sid == stream_id => {
                    total += rows.len();
                }
                EngineEvent::StreamEnd {
                    stream_id: sid,
                    total_rows,
                    truncated,
                } if sid == stream_id => {
                    assert_eq!(total_rows, 20);
                    assert!(truncated);
                    break;
                }
                EngineEvent::StreamCancelled { stream_id: sid } if sid == stream_id => {
                    panic!("cap should end, not cancel");
                }
                _ => {}
            }
        }
        assert_eq!(total, 20);
    }
}
