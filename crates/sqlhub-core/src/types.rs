//! Canonical value domain and query result types

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The canonical value kind a driver type maps into.
///
/// Every engine-native type maps to exactly one of these kinds; the
/// executor and the merge engine only ever see this domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Int64,
    Float64,
    Decimal,
    Text,
    Bytes,
    Timestamp,
    Date,
    Time,
    Interval,
    Uuid,
    Json,
}

/// A database value in the canonical domain.
///
/// NULL is a distinct variant, never an empty string or zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer (all integer widths widen into this)
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// Decimal/Numeric, kept as text for precision
    Decimal(String),
    /// UTF-8 string
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timestamp normalized to UTC
    Timestamp(DateTime<Utc>),
    /// Calendar date
    Date(NaiveDate),
    /// Time of day
    Time(NaiveTime),
    /// Interval in the engine's text rendering
    Interval(String),
    /// UUID
    Uuid(Uuid),
    /// JSON document
    Json(serde_json::Value),
}

impl Value {
    /// Check if the value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The canonical kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int64,
            Value::Float(_) => ValueKind::Float64,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::Date(_) => ValueKind::Date,
            Value::Time(_) => ValueKind::Time,
            Value::Interval(_) => ValueKind::Interval,
            Value::Uuid(_) => ValueKind::Uuid,
            Value::Json(_) => ValueKind::Json,
        }
    }

    /// Try to get as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Text(s) => s.parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Try to get as f64, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse::<f64>().ok(),
            Value::Text(s) => s.parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Try to get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Timestamp(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v),
            Value::Interval(v) => write!(f, "{}", v),
            Value::Uuid(v) => write!(f, "{}", v),
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

/// A row from a query result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    /// Column values
    pub values: Vec<Value>,
    /// Column names, aligned with `values`
    columns: Vec<String>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get a value by column index
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Get column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Convert to a HashMap
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Column metadata attached to a query result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column name
    pub name: String,
    /// Engine-native type name as reported by the driver
    pub data_type: String,
    /// Canonical kind the values of this column map into
    pub kind: ValueKind,
    /// Whether the column can be NULL (best effort for computed columns)
    pub nullable: bool,
    /// Column ordinal position (0-based)
    pub ordinal: usize,
}

impl ColumnMeta {
    /// Create column metadata with a canonical kind
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, kind: ValueKind, ordinal: usize) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            kind,
            nullable: true,
            ordinal,
        }
    }
}

/// Editability metadata attached to SELECT results.
///
/// When `enabled` is true, `primary_key` is a non-empty subset of
/// `columns` that uniquely identifies any row of the result on the base
/// table. When the synchronous analyzer defers, `pending` is set and
/// `job_id` points at the background enrichment job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditableQueryMetadata {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub primary_key: Vec<String>,
    pub columns: Vec<String>,
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    /// Why editing is disabled, when it is
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EditableQueryMetadata {
    /// Metadata for a non-editable result with a reason
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            enabled: false,
            schema: None,
            table: None,
            primary_key: Vec::new(),
            columns: Vec::new(),
            pending: false,
            job_id: None,
            reason: Some(reason.into()),
        }
    }

    /// Metadata for a deferred analysis backed by a background job
    pub fn pending(job_id: Uuid) -> Self {
        Self {
            enabled: false,
            schema: None,
            table: None,
            primary_key: Vec::new(),
            columns: Vec::new(),
            pending: true,
            job_id: Some(job_id),
            reason: None,
        }
    }
}

/// Result of a query that returns rows
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Unique query ID
    pub id: Uuid,
    /// Column metadata
    pub columns: Vec<ColumnMeta>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Rows affected (non-zero only for statements routed through query)
    pub affected_rows: u64,
    /// Whether the row set was cut off at the requested limit
    pub truncated: bool,
    /// Execution time in milliseconds
    pub execution_time_ms: u64,
    /// Editability analysis, when performed
    pub editable: Option<EditableQueryMetadata>,
    /// Warnings from the database
    pub warnings: Vec<String>,
}

impl QueryResult {
    /// Create a new empty query result
    pub fn empty() -> Self {
        Self {
            id: Uuid::new_v4(),
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: 0,
            truncated: false,
            execution_time_ms: 0,
            editable: None,
            warnings: Vec::new(),
        }
    }

    /// Number of columns
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Column names in ordinal order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Result of a statement that modifies data
#[derive(Debug, Clone)]
pub struct StatementResult {
    /// Rows affected
    pub affected_rows: u64,
    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}
