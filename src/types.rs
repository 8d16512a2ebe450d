//! Core data types shared across the fusion pipeline
//!
//! # Key Types
//!
//! - **`IndicatorRequest`**: one indicator to compute at one evaluation time
//! - **`IndicatorStatus`**: the per-indicator outcome of a batch
//! - **`StatusMetadata`**: empty on success, backend error detail on failure
//!
//! # Example
//!
//! ```rust
//! use indicator_fusion::types::IndicatorRequest;
//!
//! let request = IndicatorRequest::builder(7, "COUNT(DISTINCT device_id)")
//!     .dataset(2, "SELECT * FROM events;")
//!     .group_by("country, platform")
//!     .timestamp_field("received_at")
//!     .evaluation_time(1_654_646_400)
//!     .lookback_window(3600)
//!     .build();
//!
//! assert_eq!(request.group_fields, vec!["country", "platform"]);
//! assert_eq!(request.source_query(), "SELECT * FROM events");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::ExecutionDetails;
use crate::error::DispatchError;

/// Identifier of an indicator
///
/// Ids end up in result column names (`_indicator_<id>`), so batches with a
/// negative id are rejected before anything is dispatched.
pub type IndicatorId = i64;

/// A request to compute one indicator at one evaluation time
///
/// Evaluation time and lookback window are in epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorRequest {
    /// Indicator identifier
    pub id: IndicatorId,

    /// Aggregate expression, e.g. `COUNT(DISTINCT device_id)`
    pub calculation: String,

    /// Ordered group-by columns
    #[serde(default)]
    pub group_fields: Vec<String>,

    /// WHERE-clause predicate without the keyword, possibly empty
    #[serde(default)]
    pub filter: String,

    /// Column holding event time, possibly empty
    #[serde(default)]
    pub timestamp_field: String,

    /// Upper bound (exclusive) of the evaluation window
    pub evaluation_time: i64,

    /// Width of the evaluation window in seconds
    #[serde(default)]
    pub lookback_window: i64,

    /// Cron-like schedule; only used for fingerprinting
    #[serde(default)]
    pub evaluation_interval: String,

    /// Sub-query defining the source rows
    pub dataset_query: String,

    /// Identifier of the computed dataset
    pub dataset_id: i64,

    /// Tenant that owns the indicator
    #[serde(default)]
    pub tenant_id: String,

    /// Explicit sketch type to isolate on
    #[serde(default)]
    pub sketch_type: Option<String>,
}

impl IndicatorRequest {
    /// Start building a request
    pub fn builder(id: IndicatorId, calculation: impl Into<String>) -> IndicatorRequestBuilder {
        IndicatorRequestBuilder::new(id, calculation)
    }

    /// Dataset query with surrounding whitespace and one trailing `;` removed
    pub fn source_query(&self) -> &str {
        strip_statement_terminator(&self.dataset_query)
    }

    /// Lower bound (inclusive) of the evaluation window
    pub fn lookback_start(&self) -> i64 {
        self.evaluation_time - self.lookback_window
    }
}

/// Trim a statement and drop a single trailing `;`
pub fn strip_statement_terminator(statement: &str) -> &str {
    let trimmed = statement.trim();
    trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end()
}

/// Builder for [`IndicatorRequest`]
#[derive(Debug, Clone)]
pub struct IndicatorRequestBuilder {
    request: IndicatorRequest,
}

impl IndicatorRequestBuilder {
    fn new(id: IndicatorId, calculation: impl Into<String>) -> Self {
        Self {
            request: IndicatorRequest {
                id,
                calculation: calculation.into(),
                group_fields: Vec::new(),
                filter: String::new(),
                timestamp_field: String::new(),
                evaluation_time: 0,
                lookback_window: 0,
                evaluation_interval: String::new(),
                dataset_query: String::new(),
                dataset_id: 0,
                tenant_id: String::new(),
                sketch_type: None,
            },
        }
    }

    /// Set the dataset identifier and query
    pub fn dataset(mut self, dataset_id: i64, query: impl Into<String>) -> Self {
        self.request.dataset_id = dataset_id;
        self.request.dataset_query = query.into();
        self
    }

    /// Set group-by columns from a comma-separated string
    pub fn group_by(mut self, fields: &str) -> Self {
        self.request.group_fields = fields
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from)
            .collect();
        self
    }

    /// Set group-by columns
    pub fn group_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.group_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set the filter predicate
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.request.filter = filter.into();
        self
    }

    /// Set the timestamp column
    pub fn timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.request.timestamp_field = field.into();
        self
    }

    /// Set the evaluation time (epoch seconds)
    pub fn evaluation_time(mut self, seconds: i64) -> Self {
        self.request.evaluation_time = seconds;
        self
    }

    /// Set the lookback window (seconds)
    pub fn lookback_window(mut self, seconds: i64) -> Self {
        self.request.lookback_window = seconds;
        self
    }

    /// Set the evaluation interval
    pub fn evaluation_interval(mut self, interval: impl Into<String>) -> Self {
        self.request.evaluation_interval = interval.into();
        self
    }

    /// Set the tenant
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.request.tenant_id = tenant_id.into();
        self
    }

    /// Set an explicit sketch type
    pub fn sketch_type(mut self, sketch_type: impl Into<String>) -> Self {
        self.request.sketch_type = Some(sketch_type.into());
        self
    }

    /// Finish building
    pub fn build(self) -> IndicatorRequest {
        self.request
    }
}

/// Expand one indicator into a request per evaluation time
///
/// The control plane sends evaluation times in epoch milliseconds. Negative
/// entries are dropped, duplicates keep their first position.
pub fn explode_evaluation_times<I>(template: &IndicatorRequest, times_ms: I) -> Vec<IndicatorRequest>
where
    I: IntoIterator<Item = i64>,
{
    let mut seen = Vec::new();
    let mut requests = Vec::new();
    for ms in times_ms {
        if ms < 0 {
            continue;
        }
        let seconds = ms / 1000;
        if seen.contains(&seconds) {
            continue;
        }
        seen.push(seconds);
        requests.push(IndicatorRequest {
            evaluation_time: seconds,
            ..template.clone()
        });
    }
    requests
}

/// Outcome of one indicator at one evaluation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorStatus {
    /// Indicator identifier
    pub indicator_id: IndicatorId,

    /// Evaluation time in epoch milliseconds
    pub evaluation_time: i64,

    /// Empty on success
    #[serde(rename = "meta")]
    pub metadata: StatusMetadata,
}

impl IndicatorStatus {
    /// True when no error was recorded
    pub fn is_success(&self) -> bool {
        self.metadata.error.is_none()
    }
}

/// Error and execution detail attached to a status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusMetadata {
    /// Failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,

    /// Backend execution that produced the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSummary>,
}

/// Failure detail reported with a status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    /// Human readable reason
    pub error_message: String,

    /// Backend error code or category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// When the execution was submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_time: Option<DateTime<Utc>>,

    /// When the execution reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

/// Backend execution information carried on failed statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Backend execution id
    pub id: String,

    /// Query text as stored by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Backend-specific statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<serde_json::Value>,

    /// Workgroup or warehouse that ran the query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workgroup: Option<String>,

    /// Engine version reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
}

impl StatusMetadata {
    /// Metadata for a successful execution
    pub fn success() -> Self {
        Self::default()
    }

    /// Metadata for a failed execution, from what the backend reported
    pub fn from_details(details: &ExecutionDetails) -> Self {
        Self {
            error: Some(StatusError {
                error_message: details.failure_reason().to_string(),
                code: details.error_type.clone(),
                submission_time: details.submitted_at,
                completion_time: details.completed_at,
            }),
            execution: Some(ExecutionSummary {
                id: details.handle.to_string(),
                query: Some(details.query.clone()),
                statistics: details.statistics.clone(),
                workgroup: details.workgroup.clone(),
                engine_version: details.engine_version.clone(),
            }),
        }
    }

    /// Metadata for a family-level dispatch error
    pub fn from_dispatch_error(err: &DispatchError) -> Self {
        if let Some(details) = err.details() {
            return Self::from_details(details);
        }

        let code = match err {
            DispatchError::Throttled { .. } => "Throttled",
            DispatchError::Timeout { .. } => "TimeOver",
            DispatchError::Rejected { code, .. } => code.as_str(),
            DispatchError::Deadline(_) => "Deadline",
            DispatchError::Pending(_) => "Pending",
            DispatchError::QueryFailed { .. } | DispatchError::ImmediateFailure { .. } => "Failed",
        };

        Self {
            error: Some(StatusError {
                error_message: err.to_string(),
                code: Some(code.to_string()),
                submission_time: None,
                completion_time: None,
            }),
            execution: err.handle().map(|handle| ExecutionSummary {
                id: handle.to_string(),
                query: None,
                statistics: None,
                workgroup: None,
                engine_version: None,
            }),
        }
    }

    /// Metadata for a failure with no backend context
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            error: Some(StatusError {
                error_message: message.into(),
                code: None,
                submission_time: None,
                completion_time: None,
            }),
            execution: None,
        }
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.error.is_none() && self.execution.is_none()
    }
}
