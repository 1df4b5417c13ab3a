//! Error taxonomy shared by every symmetric-sync crate.

use serde::{Deserialize, Serialize};

/// SQL state recorded when a load fails on an unresolved conflict.
pub const CONFLICT_STATE: &str = "CONFLICT";

/// Broad classes of failure, used to decide how far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Remote node unreachable, busy or refusing us. Retried by the caller.
    Transport,
    /// A row could not be applied. Recorded on the batch, next batch continues.
    Data,
    /// Configuration is missing or invalid.
    Configuration,
    /// Something that should never happen. Aborts the current unit of work.
    Invariant,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Data => "data",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Invariant => "invariant",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics captured from a failed SQL statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlError {
    pub state: Option<String>,
    pub code: i32,
    pub message: String,
}

impl SqlError {
    pub fn new(state: Option<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            state,
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            Some(state) => write!(f, "[{state}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors raised by the routing, extraction and load pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    #[error("Unknown host {0}")]
    UnknownHost(String),

    /// The remote node is busy and turned the connection away.
    #[error("Connection rejected by {0}, the server is busy")]
    ConnectionRejected(String),

    #[error("Authentication failed for node {0}")]
    AuthenticationFailed(String),

    #[error("Synchronization is disabled on {0}")]
    SyncDisabled(String),

    #[error("Node {0} must register before it can synchronize")]
    RegistrationRequired(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("SQL error: {0}")]
    Sql(SqlError),

    #[error("Conflict detected on {table} while applying {event_type}: {detail}")]
    Conflict {
        table: String,
        event_type: String,
        detail: String,
    },

    #[error("Protocol error at line {line}: {message}")]
    Protocol { line: i64, message: String },

    #[error("Invalid router expression for router {router_id}: {message}")]
    RouterSyntax { router_id: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Outgoing batch {batch_id} for node {node_id} was not found")]
    BatchNotFound { batch_id: i64, node_id: String },

    #[error("Node {0} was not found")]
    NodeNotFound(String),

    #[error("Batch {batch_id} cannot move from {from} to {to}")]
    IllegalStatusTransition { batch_id: i64, from: String, to: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::ConnectionRefused(_)
            | SyncError::UnknownHost(_)
            | SyncError::ConnectionRejected(_)
            | SyncError::AuthenticationFailed(_)
            | SyncError::SyncDisabled(_)
            | SyncError::RegistrationRequired(_)
            | SyncError::Transport(_)
            | SyncError::Timeout(_)
            | SyncError::Io(_) => ErrorCategory::Transport,
            SyncError::Sql(_) | SyncError::Conflict { .. } | SyncError::Protocol { .. } => {
                ErrorCategory::Data
            }
            SyncError::RouterSyntax { .. } | SyncError::Configuration(_) => {
                ErrorCategory::Configuration
            }
            SyncError::BatchNotFound { .. }
            | SyncError::NodeNotFound(_)
            | SyncError::IllegalStatusTransition { .. } => ErrorCategory::Invariant,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }

    /// SQL diagnostics to record on a batch row for this error.
    pub fn sql_error(&self) -> SqlError {
        match self {
            SyncError::Sql(e) => e.clone(),
            SyncError::Conflict { .. } => {
                SqlError::new(Some(CONFLICT_STATE.to_string()), 0, self.to_string())
            }
            other => SqlError::new(None, 0, other.to_string()),
        }
    }

    /// Find the first `SyncError` in an `anyhow` error chain.
    pub fn find(error: &anyhow::Error) -> Option<&SyncError> {
        error.chain().find_map(|e| e.downcast_ref::<SyncError>())
    }

    /// SQL diagnostics for any error, falling back to the rendered message.
    pub fn sql_error_of(error: &anyhow::Error) -> SqlError {
        match Self::find(error) {
            Some(e) => e.sql_error(),
            None => SqlError::new(None, 0, format!("{error:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_categories() {
        assert!(SyncError::ConnectionRejected("corp".into()).is_transient());
        assert!(SyncError::AuthenticationFailed("001".into()).is_transient());
        assert_eq!(
            SyncError::RouterSyntax {
                router_id: "r".into(),
                message: "bad".into()
            }
            .category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            SyncError::BatchNotFound {
                batch_id: 1,
                node_id: "n".into()
            }
            .category(),
            ErrorCategory::Invariant
        );
        assert!(!SyncError::Sql(SqlError::default()).is_transient());
    }

    #[test]
    fn test_conflict_maps_to_conflict_state() {
        let err = SyncError::Conflict {
            table: "item".into(),
            event_type: "DELETE".into(),
            detail: "row not found".into(),
        };
        let sql = err.sql_error();
        assert_eq!(sql.state.as_deref(), Some(CONFLICT_STATE));
        assert!(sql.message.contains("item"));
    }

    #[test]
    fn test_find_through_context_chain() {
        let err: anyhow::Result<()> = Err(SyncError::Sql(SqlError::new(
            Some("23505".into()),
            0,
            "duplicate key",
        )))
        .context("Failed to insert item");
        let err = err.unwrap_err();

        let found = SyncError::find(&err).unwrap();
        assert!(matches!(found, SyncError::Sql(_)));
        assert_eq!(
            SyncError::sql_error_of(&err).state.as_deref(),
            Some("23505")
        );

        let plain = anyhow::anyhow!("boom");
        assert_eq!(SyncError::sql_error_of(&plain).message, "boom");
    }
}
