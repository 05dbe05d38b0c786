//! Connection, transaction and streaming traits

use crate::{DatabaseKind, QueryResult, Result, Row, SchemaIntrospection, StatementResult, Value};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Handle for cancelling a running query from any thread.
///
/// Safe to call from any thread and idempotent; if no query is running,
/// cancellation is a no-op.
pub trait QueryCancelHandle: Send + Sync {
    /// Cancel the currently running query on the associated connection.
    fn cancel(&self);
}

/// One batch of rows produced by a streaming query
#[derive(Debug, Clone)]
pub struct RowBatch {
    /// Batch sequence number, starting at 0
    pub seq: u64,
    /// Rows in row-reading order
    pub rows: Vec<Row>,
}

/// Totals reported when a stream finishes
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// Total rows delivered across all batches
    pub total_rows: u64,
    /// Number of batches delivered
    pub batches: u64,
    /// Whether the stream stopped because of cancellation
    pub cancelled: bool,
}

/// A live database connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// The engine behind this connection
    fn kind(&self) -> DatabaseKind;

    /// Cheap liveness probe honouring the engine's lightest round trip
    async fn ping(&self) -> Result<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    /// Execute a statement that modifies data (INSERT/UPDATE/DELETE/DDL)
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult>;

    /// Execute a query that returns rows (SELECT)
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Stream a query as row batches of `batch_size`.
    ///
    /// Batches arrive in row-reading order; the stream is finite and not
    /// restartable. Cancellation is observed between batches. The default
    /// implementation materializes the full result and chunks it; drivers
    /// with native streaming override this.
    async fn query_stream(
        &self,
        sql: &str,
        params: &[Value],
        batch_size: usize,
        sink: mpsc::Sender<RowBatch>,
        cancel: CancellationToken,
    ) -> Result<StreamSummary> {
        let batch_size = batch_size.max(1);
        let result = self.query(sql, params).await?;
        let mut summary = StreamSummary::default();
        let mut rows = result.rows.into_iter().peekable();
        let mut buffer = Vec::with_capacity(batch_size);

        while rows.peek().is_some() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(summary);
            }
            buffer.extend(rows.by_ref().take(batch_size));
            let batch = RowBatch {
                seq: summary.batches,
                rows: std::mem::take(&mut buffer),
            };
            summary.total_rows += batch.rows.len() as u64;
            summary.batches += 1;
            if sink.send(batch).await.is_err() {
                // Receiver dropped: treat as cancellation, stop reading.
                summary.cancelled = true;
                return Ok(summary);
            }
        }
        Ok(summary)
    }

    /// Begin a transaction
    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>>;

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get schema introspection interface if supported
    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        None
    }

    /// Get a handle that can cancel running queries, if the engine supports it
    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        None
    }
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind())
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

/// A database transaction
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Execute a query within the transaction
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Execute a statement within the transaction
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult>;
}
