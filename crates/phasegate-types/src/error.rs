use thiserror::Error;

use crate::workflow::InstanceId;

/// Caller misuse of the start/resume/cancel APIs.
///
/// Returned synchronously and never mutates workflow state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("instance '{0}' already exists")]
    DuplicateInstance(InstanceId),

    #[error("no such instance '{0}'")]
    NoSuchInstance(InstanceId),

    #[error("instance '{0}' is not suspended")]
    NotSuspended(InstanceId),

    #[error("signal mismatch: expected {expected}, got {actual}")]
    SignalMismatch { expected: String, actual: String },

    #[error("instance '{0}' was already resumed")]
    AlreadyResumed(InstanceId),
}

/// Errors from repository operations (used by trait definitions in phasegate-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
