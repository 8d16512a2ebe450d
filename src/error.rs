//! Error types for the fusion engine

use std::time::Duration;

use thiserror::Error;

use crate::dispatch::{ExecutionDetails, ExecutionHandle};

/// Main error type for the fusion engine
#[derive(Error, Debug)]
pub enum Error {
    /// Predicate or calculation could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// A request that cannot be fused
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Query dispatch failed
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Malformed predicate, list or calculation text
///
/// Parse failures are fatal for the batch that contains them and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at byte {position}")]
pub struct ParseError {
    /// Byte offset into the input where the problem was detected
    pub position: usize,
    /// What went wrong
    pub message: String,
}

impl ParseError {
    /// Create a parse error at the given byte offset
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// Errors reported by an execution backend
///
/// This is the error type of the [`ExecutionBackend`](crate::dispatch::ExecutionBackend)
/// trait. The dispatcher decides which of these are retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend asked us to slow down
    #[error("Throttled: {0}")]
    Throttled(String),

    /// The backend refused the request outright
    #[error("Rejected ({code}): {message}")]
    Rejected {
        /// Backend error code
        code: String,
        /// Backend error message
        message: String,
    },

    /// The execution handle is unknown to the backend
    #[error("Unknown execution: {0}")]
    UnknownExecution(String),

    /// Transport or client failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl BackendError {
    /// Throttling is the only backend error worth retrying
    pub fn is_retriable(&self) -> bool {
        matches!(self, BackendError::Throttled(_))
    }

    /// Short code used in status metadata
    pub fn code(&self) -> &str {
        match self {
            BackendError::Throttled(_) => "Throttled",
            BackendError::Rejected { code, .. } => code,
            BackendError::UnknownExecution(_) => "UnknownExecution",
            BackendError::Transport(_) => "Transport",
        }
    }
}

/// Family-level dispatch failures
///
/// Every variant is fatal for its compute family. Variants that know the
/// execution handle carry it so statuses can be recovered out-of-band.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// Throttling persisted past the retry budget
    #[error("Backend throttled after {attempts} attempts: {message}")]
    Throttled {
        /// Number of submission attempts made
        attempts: u32,
        /// Last throttling message from the backend
        message: String,
    },

    /// The execution reached FAILED or CANCELLED and the failure threshold was hit
    #[error("Query {} failed: {}", .details.handle, .details.failure_reason())]
    QueryFailed {
        /// Last observed execution details, including the stored query text
        details: Box<ExecutionDetails>,
    },

    /// The poll budget ran out while the execution was still running
    #[error("Query {handle} still running after {polls} polls; cancelled")]
    Timeout {
        /// Execution that was cancelled
        handle: ExecutionHandle,
        /// Polls spent before giving up
        polls: u32,
    },

    /// The execution had already failed when it was first checked after submission
    #[error("Query {} failed immediately: {}", .details.handle, .details.failure_reason())]
    ImmediateFailure {
        /// Execution details as reported right after submission
        details: Box<ExecutionDetails>,
    },

    /// The backend rejected the request with a non-retriable error
    #[error("Backend rejected query ({code}): {message}")]
    Rejected {
        /// Execution handle, when the rejection happened after submission
        handle: Option<ExecutionHandle>,
        /// Backend error code
        code: String,
        /// Backend error message
        message: String,
    },

    /// The family did not finish within the caller-level deadline
    #[error("Family exceeded deadline of {0:?}")]
    Deadline(Duration),

    /// Statuses were requested for an execution that is still running
    #[error("Query {0} has not finished")]
    Pending(ExecutionHandle),
}

impl DispatchError {
    /// Execution handle associated with the failure, if one was issued
    pub fn handle(&self) -> Option<&ExecutionHandle> {
        match self {
            DispatchError::QueryFailed { details } | DispatchError::ImmediateFailure { details } => {
                Some(&details.handle)
            }
            DispatchError::Timeout { handle, .. } | DispatchError::Pending(handle) => Some(handle),
            DispatchError::Rejected { handle, .. } => handle.as_ref(),
            DispatchError::Throttled { .. } | DispatchError::Deadline(_) => None,
        }
    }

    /// Execution details captured with the failure, if any
    pub fn details(&self) -> Option<&ExecutionDetails> {
        match self {
            DispatchError::QueryFailed { details } | DispatchError::ImmediateFailure { details } => {
                Some(details)
            }
            _ => None,
        }
    }

    /// Convert a non-retriable backend error
    pub fn from_backend(err: BackendError, handle: Option<ExecutionHandle>) -> Self {
        match err {
            BackendError::Throttled(message) => DispatchError::Throttled {
                attempts: 1,
                message,
            },
            BackendError::Rejected { code, message } => DispatchError::Rejected {
                handle,
                code,
                message,
            },
            other => DispatchError::Rejected {
                handle,
                code: other.code().to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias for fusion operations
pub type Result<T> = std::result::Result<T, Error>;
