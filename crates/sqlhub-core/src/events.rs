//! Typed lifecycle events fanned out to subscribers

use crate::{DatabaseKind, ErrorEnvelope, Row};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Lifecycle events emitted by the engine.
///
/// Delivery is best-effort: a lagging subscriber loses the oldest events
/// rather than blocking emitters. Ordering holds per emitter only.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionCreated {
        connection_id: Uuid,
        name: String,
        kind: DatabaseKind,
    },
    ConnectionRemoved {
        connection_id: Uuid,
    },
    ConnectionTested {
        kind: DatabaseKind,
        ok: bool,
        latency_ms: u64,
    },
    ConnectionError {
        connection_id: Uuid,
        error: ErrorEnvelope,
    },
    QueryExecuted {
        connection_id: Uuid,
        query_id: Uuid,
        rows: usize,
        truncated: bool,
        duration_ms: u64,
    },
    QueryMutated {
        connection_id: Uuid,
        affected: u64,
        duration_ms: u64,
    },
    QueryError {
        connection_id: Uuid,
        error: ErrorEnvelope,
    },
    QueryCancelled {
        connection_id: Uuid,
    },
    EditableMetadataReady {
        connection_id: Uuid,
        job_id: Uuid,
    },
    MultiQueryExecuted {
        connections_used: Vec<String>,
        strategy: &'static str,
        rows: usize,
        duration_ms: u64,
    },
    MultiQueryError {
        error: ErrorEnvelope,
    },
    TransactionStarted {
        connection_id: Uuid,
    },
    TransactionCommitted {
        connection_id: Uuid,
    },
    TransactionRolledBack {
        connection_id: Uuid,
    },
    StreamBatch {
        stream_id: Uuid,
        seq: u64,
        rows: Vec<Row>,
    },
    StreamEnd {
        stream_id: Uuid,
        total_rows: u64,
        truncated: bool,
    },
    StreamCancelled {
        stream_id: Uuid,
    },
    ReportComponentStarted {
        component_id: String,
    },
    ReportComponentFinished {
        component_id: String,
        status: &'static str,
        cache_hit: bool,
        duration_ms: u64,
    },
}

impl EngineEvent {
    /// Stable event name in the `domain:action` form used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionCreated { .. } => "connection:created",
            Self::ConnectionRemoved { .. } => "connection:removed",
            Self::ConnectionTested { .. } => "connection:test",
            Self::ConnectionError { .. } => "connection:error",
            Self::QueryExecuted { .. } => "query:executed",
            Self::QueryMutated { .. } => "query:mutated",
            Self::QueryError { .. } => "query:error",
            Self::QueryCancelled { .. } => "query:cancelled",
            Self::EditableMetadataReady { .. } => "query:editableMetadata",
            Self::MultiQueryExecuted { .. } => "multiquery:executed",
            Self::MultiQueryError { .. } => "multiquery:error",
            Self::TransactionStarted { .. } => "transaction:started",
            Self::TransactionCommitted { .. } => "transaction:committed",
            Self::TransactionRolledBack { .. } => "transaction:rolledback",
            Self::StreamBatch { .. } => "stream:batch",
            Self::StreamEnd { .. } => "stream:end",
            Self::StreamCancelled { .. } => "stream:cancelled",
            Self::ReportComponentStarted { .. } => "report:component:started",
            Self::ReportComponentFinished { .. } => "report:component:finished",
        }
    }
}

/// Fan-out event bus shared by all engine components
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Never blocks and never fails the emitting operation; with no
    /// subscribers the event is dropped.
    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!(event = event.name(), "emitting engine event");
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_fan_out_to_all_subscribers() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(EngineEvent::ConnectionRemoved {
            connection_id: Uuid::new_v4(),
        });

        assert_eq!(first.recv().await.unwrap().name(), "connection:removed");
        assert_eq!(second.recv().await.unwrap().name(), "connection:removed");
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new(8);
        bus.emit(EngineEvent::StreamCancelled {
            stream_id: Uuid::new_v4(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
