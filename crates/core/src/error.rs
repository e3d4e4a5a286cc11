//! Error types for workflow construction and task execution.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or validating a workflow graph.
///
/// All of these are fatal: a graph that produces one is never run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The must-complete-before relation contains a cycle through `node`.
    #[error("workflow contains a dependency cycle through '{node}'")]
    Cycle { node: String },

    /// An edge or declared predecessor references a node that was never added.
    #[error("unknown node '{node}' referenced by '{referenced_by}'")]
    UnknownNode { node: String, referenced_by: String },

    /// Task and group ids share one namespace.
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    /// External edges must go through a group, never into one of its members.
    #[error("edge {from} -> {to} crosses into group '{group}'; attach it to the group instead")]
    MemberEdge {
        from: String,
        to: String,
        group: String,
    },

    /// A group internal edge references a task that is not a member.
    #[error("group '{group}' has an internal edge to non-member '{node}'")]
    NotAMember { group: String, node: String },

    #[error("group '{0}' has no members")]
    EmptyGroup(String),

    #[error("edge {0} -> {0} is a self loop")]
    SelfLoop(String),
}

/// Errors raised while loading a workflow definition file.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("invalid workflow definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Errors raised while binding a template to a parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// One or more placeholders had no matching key. Names are sorted and unique.
    #[error("unbound template parameter(s): {}", names.join(", "))]
    UnboundParameter { names: Vec<String> },

    #[error("malformed template at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: String },
}

/// Failure reported by a [`Connection`](crate::connection::Connection).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// The target could not be reached.
    #[error("connection unreachable: {0}")]
    Unreachable(String),

    /// The target rejected the statement (syntax, constraint, missing object).
    #[error("statement rejected: {0}")]
    Rejected(String),
}

/// Which half of a transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Prepare,
    Read,
    Write,
}

impl std::fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Errors a single task can fail with. The executor records these per node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("template resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("connection '{connection}' unavailable: {message}")]
    Connection { connection: String, message: String },

    #[error("statement rejected by '{connection}': {message}")]
    Statement { connection: String, message: String },

    /// Transfers are not transactional across systems, so the number of rows
    /// already written is always reported.
    #[error("transfer failed during {phase} phase after {rows_written} row(s): {message}")]
    Transfer {
        phase: TransferPhase,
        rows_written: u64,
        message: String,
    },

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Map a connection-level failure onto the task taxonomy.
    pub fn from_db(connection: &str, err: DbError) -> Self {
        match err {
            DbError::Unreachable(message) => Self::Connection {
                connection: connection.to_string(),
                message,
            },
            DbError::Rejected(message) => Self::Statement {
                connection: connection.to_string(),
                message,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution(ResolutionError::UnboundParameter { .. }) => {
                ErrorKind::UnboundParameter
            }
            Self::Resolution(ResolutionError::Malformed { .. }) => ErrorKind::MalformedTemplate,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Statement { .. } => ErrorKind::Statement,
            Self::Transfer { .. } => ErrorKind::Transfer,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a host may reasonably re-run the workflow after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout(_))
    }
}

/// Stable error classification carried in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnboundParameter,
    MalformedTemplate,
    Connection,
    Statement,
    Transfer,
    Timeout,
    Cancelled,
    /// The node's worker task panicked or was aborted.
    Internal,
}

/// Per-node error detail reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TaskError> for ErrorDetail {
    fn from(err: &TaskError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_error_mapping() {
        let err = TaskError::from_db("mysql_local", DbError::Unreachable("refused".into()));
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_retryable());

        let err = TaskError::from_db("mysql_local", DbError::Rejected("syntax".into()));
        assert_eq!(err.kind(), ErrorKind::Statement);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transfer_error_reports_rows_written() {
        let err = TaskError::Transfer {
            phase: TransferPhase::Write,
            rows_written: 2000,
            message: "duplicate key".into(),
        };
        assert_eq!(
            err.to_string(),
            "transfer failed during write phase after 2000 row(s): duplicate key"
        );
        assert_eq!(ErrorDetail::from(&err).kind, ErrorKind::Transfer);
    }

    #[test]
    fn test_unbound_parameter_message_lists_names() {
        let err = ResolutionError::UnboundParameter {
            names: vec!["col".into(), "table".into()],
        };
        assert_eq!(err.to_string(), "unbound template parameter(s): col, table");
    }
}
