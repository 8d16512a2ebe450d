//! Asynchronous dispatch and out-of-band status recovery

use tracing::{debug, error, info, warn};

use super::demux::statuses_from_query;
use super::{Dispatcher, ExecutionDetails, ExecutionHandle};
use crate::error::{BackendError, DispatchError};
use crate::types::{IndicatorStatus, StatusMetadata};

impl Dispatcher {
    /// Submit a statement without waiting for it
    ///
    /// The execution is checked once right after submission. An execution
    /// that has already failed is reported as
    /// [`DispatchError::ImmediateFailure`], carrying its handle and details.
    pub async fn submit(&self, query: &str) -> Result<ExecutionHandle, DispatchError> {
        let backend = self.backend();
        let mut throttles = 0u32;

        debug!(backend = backend.name(), query = %query, "Submitting query");

        let handle = loop {
            match backend.submit(query).await {
                Ok(handle) => break handle,
                Err(BackendError::Throttled(message)) => {
                    self.backoff_throttled(&mut throttles, message).await?;
                }
                Err(err) => {
                    error!(error = %err, "Query submission rejected");
                    return Err(DispatchError::from_backend(err, None));
                }
            }
        };
        self.metrics().record_submission();

        match backend.describe(&handle).await {
            Ok(details) if details.state.is_failure() => {
                self.metrics().record_failure();
                error!(
                    execution = %handle,
                    reason = details.failure_reason(),
                    "Query failed immediately after submission"
                );
                Err(DispatchError::ImmediateFailure {
                    details: Box::new(details),
                })
            }
            Ok(details) => {
                self.metrics().record_poll();
                info!(execution = %handle, state = %details.state, "Query submitted");
                Ok(handle)
            }
            Err(BackendError::Throttled(message)) => {
                self.metrics().record_throttle();
                warn!(execution = %handle, message = %message, "Status check throttled; assuming query is running");
                Ok(handle)
            }
            Err(err) => {
                error!(execution = %handle, error = %err, "Status check after submission failed");
                Err(DispatchError::from_backend(err, Some(handle)))
            }
        }
    }

    /// Describe an execution, retrying throttled requests
    pub async fn describe(&self, handle: &ExecutionHandle) -> Result<ExecutionDetails, DispatchError> {
        let mut throttles = 0u32;
        loop {
            match self.backend().describe(handle).await {
                Ok(details) => {
                    self.metrics().record_poll();
                    return Ok(details);
                }
                Err(BackendError::Throttled(message)) => {
                    self.backoff_throttled(&mut throttles, message).await?;
                }
                Err(err) => return Err(DispatchError::from_backend(err, Some(handle.clone()))),
            }
        }
    }

    /// Statuses for an execution submitted earlier
    ///
    /// Recovers the indicators from the query text the backend stored. A
    /// failed execution yields statuses carrying its error detail; one that
    /// has not finished yields [`DispatchError::Pending`].
    pub async fn statuses_for_execution(
        &self,
        handle: &ExecutionHandle,
    ) -> Result<Vec<IndicatorStatus>, DispatchError> {
        self.statuses_with_fallback(handle, None).await
    }

    /// Like [`statuses_for_execution`](Self::statuses_for_execution), with
    /// the evaluation time known from submission
    ///
    /// `evaluation_time_ms` is used when the stored query has no lookback
    /// literal to read it from.
    pub async fn statuses_for_execution_at(
        &self,
        handle: &ExecutionHandle,
        evaluation_time_ms: i64,
    ) -> Result<Vec<IndicatorStatus>, DispatchError> {
        self.statuses_with_fallback(handle, Some(evaluation_time_ms)).await
    }

    async fn statuses_with_fallback(
        &self,
        handle: &ExecutionHandle,
        fallback_ms: Option<i64>,
    ) -> Result<Vec<IndicatorStatus>, DispatchError> {
        let details = self.describe(handle).await?;
        if !details.state.is_terminal() {
            return Err(DispatchError::Pending(handle.clone()));
        }

        let metadata = if details.state.is_failure() {
            StatusMetadata::from_details(&details)
        } else {
            StatusMetadata::success()
        };
        Ok(statuses_from_query(&details.query, fallback_ms, &metadata))
    }
}
