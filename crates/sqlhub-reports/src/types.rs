//! Report request and result shapes

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use sqlhub_core::{ErrorEnvelope, Row};

/// One report component: a query plus its caching contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportComponent {
    /// Stable component identifier, part of the cache key
    pub id: String,
    pub connection_id: Uuid,
    pub query: String,
    /// Row cap for this component; the executor default applies when unset
    pub limit: Option<u64>,
    /// Cache TTL in seconds; 0 disables caching for this component,
    /// None applies the configured default
    pub cache_seconds: Option<u64>,
}

/// A batch of components executed under one request
#[derive(Debug, Clone, Default)]
pub struct ReportRequest {
    pub components: Vec<ReportComponent>,
    /// Free-form filters; part of every component's cache key.
    /// BTreeMap keeps the canonical rendering order-independent.
    pub filters: BTreeMap<String, String>,
    /// Bypass cache reads for the whole request
    pub force: bool,
}

/// Terminal state of one component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Completed,
    TimedOut,
    Error,
    LimitExceeded,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timeout",
            Self::Error => "error",
            Self::LimitExceeded => "limit_exceeded",
        }
    }
}

/// Terminal result of one component
#[derive(Debug, Clone)]
pub struct ReportComponentResult {
    pub component_id: String,
    pub status: ComponentStatus,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub cache_hit: bool,
    /// Pre-query COUNT(*) over the component query
    pub total_rows: u64,
    /// Rows actually delivered; always <= the component limit
    pub limited_rows: u64,
    pub duration_ms: u64,
    pub error: Option<ErrorEnvelope>,
}

impl ReportComponentResult {
    /// A failed result carrying the error's envelope
    pub fn failed(
        component_id: String,
        status: ComponentStatus,
        error: ErrorEnvelope,
        duration_ms: u64,
    ) -> Self {
        Self {
            component_id,
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            cache_hit: false,
            total_rows: 0,
            limited_rows: 0,
            duration_ms,
            error: Some(error),
        }
    }
}
