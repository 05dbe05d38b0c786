//! Plan model for multi-database queries

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strategy requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Resolve deterministically from the reference set
    #[default]
    Auto,
    Federated,
    PushDown,
}

/// Strategy the planner settled on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedStrategy {
    Federated,
    PushDown,
}

impl ResolvedStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Federated => "federated",
            Self::PushDown => "push_down",
        }
    }
}

/// One per-connection fetch feeding the coordinator
#[derive(Debug, Clone)]
pub struct FetchStep {
    pub connection_id: Uuid,
    pub connection_name: String,
    /// Schema the fetch reads from, resolved through per-engine defaults
    pub schema: Option<String>,
    pub table: String,
    /// Virtual table name the merge engine binds the rows to
    pub placeholder: String,
}

/// Executable plan for one multi-database query
#[derive(Debug, Clone)]
pub struct Plan {
    pub strategy: ResolvedStrategy,
    /// SQL with references replaced by placeholders (federated) or
    /// native identifiers (push-down)
    pub rewritten_sql: String,
    pub steps: Vec<FetchStep>,
    /// Connection names the plan touches, in reference order
    pub required_connections: Vec<String>,
}

/// Outcome of validating a multi-query without executing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub required_connections: Vec<String>,
    /// Referenced tables in `connection.schema.table` rendering
    pub tables: Vec<String>,
    pub estimated_strategy: Option<ResolvedStrategy>,
}
