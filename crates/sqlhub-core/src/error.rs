//! Error types for the federation engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified cause of a connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailureKind {
    /// Authentication rejected by the server
    Auth,
    /// Host unreachable, DNS failure, connection refused
    Network,
    /// TLS negotiation or certificate failure
    Tls,
    /// The target database does not exist
    DatabaseMissing,
    /// Connect attempt exceeded its deadline
    Timeout,
    /// Anything the driver could not classify
    Other,
}

impl std::fmt::Display for ConnectFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Auth => "auth",
            Self::Network => "network",
            Self::Tls => "tls",
            Self::DatabaseMissing => "dbmissing",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// Core error type for all engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection error ({cause}): {message}")]
    Connection {
        cause: ConnectFailureKind,
        message: String,
    },

    #[error("query error: {0}")]
    Query(String),

    #[error("result limit exceeded: {total_rows} rows (limit {limit})")]
    LimitExceeded { total_rows: u64, limit: u64 },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("ambiguous match: {0}")]
    Ambiguous(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Convenience constructor for classified connection failures.
    pub fn connection(cause: ConnectFailureKind, message: impl Into<String>) -> Self {
        Self::Connection {
            cause,
            message: message.into(),
        }
    }

    /// The stable wire kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Connection { .. } => ErrorKind::ConnectionError,
            Self::Query(_) => ErrorKind::QueryError,
            Self::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Ambiguous(_) => ErrorKind::Ambiguous,
            Self::TypeMismatch(_) => ErrorKind::TypeMismatch,
            Self::Internal(_) | Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Build the wire envelope for this error.
    ///
    /// The envelope never exposes stack traces; the `cause` field carries
    /// the classified connect failure when one applies.
    pub fn envelope(&self) -> ErrorEnvelope {
        let cause = match self {
            Self::Connection { cause, .. } => Some(cause.to_string()),
            _ => None,
        };
        ErrorEnvelope {
            kind: self.kind(),
            message: self.to_string(),
            cause,
        }
    }
}

/// Stable error kinds exposed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    ConnectionError,
    QueryError,
    LimitExceeded,
    Timeout,
    Cancelled,
    Conflict,
    Ambiguous,
    TypeMismatch,
    Internal,
}

/// Serializable error shape carried on the wire and in events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_envelope_carries_cause() {
        let err = EngineError::connection(ConnectFailureKind::Auth, "password rejected");
        let envelope = err.envelope();
        assert_eq!(envelope.kind, ErrorKind::ConnectionError);
        assert_eq!(envelope.cause.as_deref(), Some("auth"));
    }

    #[test]
    fn test_limit_exceeded_kind() {
        let err = EngineError::LimitExceeded {
            total_rows: 1_000_000,
            limit: 50_000,
        };
        assert_eq!(err.kind(), ErrorKind::LimitExceeded);
        assert!(err.to_string().contains("1000000"));
    }

    #[test]
    fn test_internal_kinds_collapse() {
        let err = EngineError::Internal("worker panicked".into());
        assert_eq!(err.kind(), ErrorKind::Internal);
        let io = EngineError::Io(std::io::Error::other("boom"));
        assert_eq!(io.kind(), ErrorKind::Internal);
    }
}
