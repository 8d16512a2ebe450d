//! Query dispatch
//!
//! Sends fused queries to an execution backend and turns what comes back
//! into per-indicator statuses.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  run_to_completion  ┌────────────────────┐
//! │  Dispatcher  │────────────────────>│ poll state machine │──┐
//! │              │  submit             └────────────────────┘  │
//! │              │────────────────────>  submit + check once   │
//! └──────┬───────┘                                             │
//!        │ Arc<dyn ExecutionBackend>                           │ Sleeper
//!        v                                                     v
//! ┌──────────────┐                                      ┌────────────┐
//! │   backend    │  submit / describe / cancel / fetch  │ backoff +  │
//! │ (Presto, ..) │                                      │  jitter    │
//! └──────────────┘                                      └────────────┘
//! ```
//!
//! The backend is the only collaborator. Every wait goes through a
//! [`Sleeper`] so tests can record delays instead of sleeping.

pub mod clock;
pub mod demux;
pub mod metrics;
mod poll;
pub mod retry;
mod submit;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use clock::{RecordingSleeper, Sleeper, TokioSleeper};
pub use demux::{demux_rows, parse_query_indicators, IndicatorValue, QueryIndicators};
pub use metrics::{DispatchMetrics, DispatchMetricsSnapshot};
pub use retry::RetryPolicy;

use crate::error::BackendError;

// ============================================================================
// Execution types
// ============================================================================

/// Backend-issued identifier of one query execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    /// Wrap a backend execution id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionState {
    /// Accepted, not started
    Queued,
    /// Running
    Running,
    /// Finished with results
    Succeeded,
    /// Finished with an error
    Failed,
    /// Stopped before finishing
    Cancelled,
}

impl ExecutionState {
    /// No further transitions will happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// FAILED or CANCELLED
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionState::Failed | ExecutionState::Cancelled)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Queued => "QUEUED",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Succeeded => "SUCCEEDED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// What the backend reports about an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDetails {
    /// Execution id
    pub handle: ExecutionHandle,
    /// Current state
    pub state: ExecutionState,
    /// Query text as stored by the backend
    pub query: String,
    /// Why the state last changed
    #[serde(default)]
    pub state_change_reason: Option<String>,
    /// Backend error category
    #[serde(default)]
    pub error_type: Option<String>,
    /// Backend error message
    #[serde(default)]
    pub error_message: Option<String>,
    /// Submission time
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    /// Completion time
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Backend-specific statistics
    #[serde(default)]
    pub statistics: Option<serde_json::Value>,
    /// Workgroup or warehouse
    #[serde(default)]
    pub workgroup: Option<String>,
    /// Engine version
    #[serde(default)]
    pub engine_version: Option<String>,
}

impl ExecutionDetails {
    /// Details with only the required fields set
    pub fn new(handle: ExecutionHandle, state: ExecutionState, query: impl Into<String>) -> Self {
        Self {
            handle,
            state,
            query: query.into(),
            state_change_reason: None,
            error_type: None,
            error_message: None,
            submitted_at: None,
            completed_at: None,
            statistics: None,
            workgroup: None,
            engine_version: None,
        }
    }

    /// Set the state-change reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.state_change_reason = Some(reason.into());
        self
    }

    /// Set the backend error category and message
    pub fn with_error(mut self, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self.error_message = Some(message.into());
        self
    }

    /// Best available explanation of a failure
    pub fn failure_reason(&self) -> &str {
        self.state_change_reason
            .as_deref()
            .or(self.error_message.as_deref())
            .unwrap_or("unknown")
    }
}

/// One result row, column name to value
pub type ResultRow = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Backend trait
// ============================================================================

/// A query execution service
///
/// Implementations wrap a concrete client (Presto/Athena, a cloud warehouse,
/// an embedded engine). Return [`BackendError::Throttled`] for rate limiting;
/// the dispatcher retries only that.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + 'static {
    /// Start executing a statement
    async fn submit(&self, query: &str) -> Result<ExecutionHandle, BackendError>;

    /// Report the current state of an execution
    async fn describe(&self, handle: &ExecutionHandle) -> Result<ExecutionDetails, BackendError>;

    /// Stop an execution
    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), BackendError>;

    /// Result rows of a succeeded execution
    async fn fetch_rows(&self, handle: &ExecutionHandle) -> Result<Vec<ResultRow>, BackendError>;

    /// Backend name for logs
    fn name(&self) -> &str {
        "backend"
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Limits applied while dispatching one statement
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    /// Status checks before the execution is cancelled
    pub max_polls: u32,
    /// FAILED/CANCELLED executions tolerated before giving up
    pub failure_threshold: u32,
    /// Wait between status checks
    pub poll_backoff: RetryPolicy,
    /// Retry budget and wait for throttled requests
    pub throttle_retry: RetryPolicy,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_polls: 10,
            failure_threshold: 1,
            poll_backoff: RetryPolicy::polling(),
            throttle_retry: RetryPolicy::default(),
        }
    }
}

/// Handle of the execution currently in flight for a family
///
/// Lets a caller that times out a family cancel whatever the state machine
/// last submitted, including a submission the backend has not answered yet.
#[derive(Debug, Default)]
pub struct InFlight(Mutex<InFlightSlot>);

#[derive(Debug, Default)]
struct InFlightSlot {
    handle: Option<ExecutionHandle>,
    submitting: bool,
}

impl InFlight {
    /// Nothing in flight
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, handle: Option<ExecutionHandle>) {
        self.0.lock().handle = handle;
    }

    pub(crate) fn set_submitting(&self, submitting: bool) {
        self.0.lock().submitting = submitting;
    }

    /// The handle last submitted and not yet finished
    pub fn current(&self) -> Option<ExecutionHandle> {
        self.0.lock().handle.clone()
    }

    /// A submit call is waiting on the backend
    pub fn is_submitting(&self) -> bool {
        self.0.lock().submitting
    }
}

/// Runs statements against an [`ExecutionBackend`]
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn ExecutionBackend>,
    policy: DispatchPolicy,
    sleeper: Arc<dyn Sleeper>,
    metrics: Arc<DispatchMetrics>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher that sleeps on the tokio timer
    pub fn new(backend: Arc<dyn ExecutionBackend>, policy: DispatchPolicy) -> Self {
        Self {
            backend,
            policy,
            sleeper: Arc::new(TokioSleeper),
            metrics: Arc::new(DispatchMetrics::new()),
        }
    }

    /// Replace the sleeper
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Dispatch counters
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// The backend
    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Active limits
    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Wait through the configured sleeper
    pub async fn sleep(&self, duration: std::time::Duration) {
        self.sleeper.sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionState::Queued.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(ExecutionState::Succeeded.is_terminal());
        assert!(ExecutionState::Cancelled.is_failure());
        assert!(!ExecutionState::Succeeded.is_failure());
    }

    #[test]
    fn test_failure_reason_fallbacks() {
        let handle = ExecutionHandle::new("q");
        let bare = ExecutionDetails::new(handle.clone(), ExecutionState::Failed, "SELECT 1");
        assert_eq!(bare.failure_reason(), "unknown");

        let with_error = bare.clone().with_error("USER_ERROR", "column not found");
        assert_eq!(with_error.failure_reason(), "column not found");

        let with_reason = with_error.with_reason("Query exhausted resources");
        assert_eq!(with_reason.failure_reason(), "Query exhausted resources");
    }

    #[test]
    fn test_state_serializes_uppercase() {
        let json = serde_json::to_string(&ExecutionState::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
    }

    #[test]
    fn test_in_flight_tracking() {
        let in_flight = InFlight::new();
        assert_eq!(in_flight.current(), None);
        in_flight.set(Some(ExecutionHandle::new("a")));
        assert_eq!(in_flight.current(), Some(ExecutionHandle::new("a")));

        assert!(!in_flight.is_submitting());
        in_flight.set_submitting(true);
        assert!(in_flight.is_submitting());
        assert_eq!(in_flight.current(), Some(ExecutionHandle::new("a")));
    }
}
