//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `shoalkv`.
pub type ShoalResult<T> = Result<T, ShoalError>;

/// Error categories surfaced by storage, replication, and migration code.
///
/// The migration sender reports its terminal failure as the [`ErrorKind`]
/// projection of whichever variant aborted the run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShoalError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// A peer violated the wire protocol or a cursor failed non-terminally.
    #[error("internal error: {0}")]
    Internal(String),

    /// Socket read/write failed, including timed-out reads.
    #[error("network error: {0}")]
    Network(String),

    /// An operation exhausted its retry or iteration budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Cluster metadata or cluster-wide locking failed.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Storage engine operation failed.
    #[error("storage error: {0}")]
    Store(String),
}

impl ShoalError {
    /// Returns the copyable category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) => ErrorKind::Config,
            Self::InvalidState(_) => ErrorKind::State,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Network(_) => ErrorKind::Network,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cluster(_) => ErrorKind::Cluster,
            Self::Store(_) => ErrorKind::Store,
        }
    }
}

/// Copyable error category, used by terminal migration states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ShoalError::InvalidConfig`].
    Config,
    /// See [`ShoalError::InvalidState`].
    State,
    /// See [`ShoalError::Internal`].
    Internal,
    /// See [`ShoalError::Network`].
    Network,
    /// See [`ShoalError::Timeout`].
    Timeout,
    /// See [`ShoalError::Cluster`].
    Cluster,
    /// See [`ShoalError::Store`].
    Store,
}
