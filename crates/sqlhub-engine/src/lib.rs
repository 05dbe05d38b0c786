//! SQLHub Engine - the assembled federation backend
//!
//! `Engine` is the single holder constructed at startup: connection
//! manager, schema cache, query executor, stream and job registries,
//! multi-database executor, report executor and the event bus. There are
//! no globals; tearing down the engine tears down everything it owns.

mod engine;

pub use engine::{Engine, RowUpdateOutcome};

// The request/response surface re-exports the component types callers
// interact with.
pub use sqlhub_core::{
    ColumnMeta, ConnectionConfig, DatabaseKind, EditableQueryMetadata, EngineConfig, EngineError,
    EngineEvent, ErrorEnvelope, ErrorKind, EventBus, QueryResult, Result, Row, Value, ValueKind,
};
pub use sqlhub_connection::{ConnectionInfo, HealthReport, HealthStatus, PoolConfig};
pub use sqlhub_federation::{
    MultiQueryOptions, MultiQueryOutcome, Strategy, ValidationReport,
};
pub use sqlhub_query::{EditableMetadataJob, JobStatus, QueryOptions, RowUpdateRequest};
pub use sqlhub_reports::{
    ComponentStatus, ReportComponent, ReportComponentResult, ReportRequest,
};
pub use sqlhub_schema::SchemaCacheStats;

/// Install the default tracing subscriber.
///
/// Honours `RUST_LOG`; falls back to `info`. Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
