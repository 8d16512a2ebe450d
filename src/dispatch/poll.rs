//! Synchronous dispatch: submit, poll until terminal, cancel on timeout
//!
//! ```text
//!            ┌─────────────── throttled: back off ───────────────┐
//!            v                                                   │
//!        ┌────────┐  handle   ┌──────┐  SUCCEEDED   ┌──────┐     │
//!  ───>  │ Submit │ ────────> │ Poll │ ───────────> │ done │     │
//!        └────────┘           └──┬───┘              └──────┘     │
//!            ^                   │ FAILED / CANCELLED            │
//!            │  under threshold  v                               │
//!            └──────────────  Failed  ── at threshold ──> QueryFailed
//!                                │
//!              polls exhausted   v
//!                             Cancel ─────────────────> Timeout
//! ```

use tracing::{debug, error, info, warn};

use super::{Dispatcher, ExecutionDetails, ExecutionHandle, InFlight};
use crate::error::{BackendError, DispatchError};
use crate::metrics as prom;

enum PollState {
    Submit,
    Poll { handle: ExecutionHandle, attempt: u32 },
    Failed(Box<ExecutionDetails>),
    Cancel { handle: ExecutionHandle, polls: u32 },
}

impl Dispatcher {
    /// Run a statement to completion
    ///
    /// Returns the details of the succeeded execution. Throttling is retried
    /// per the throttle policy and never counts toward the failure threshold.
    pub async fn run_to_completion(&self, query: &str) -> Result<ExecutionDetails, DispatchError> {
        self.run_tracked(query, &InFlight::new()).await
    }

    /// Like [`run_to_completion`](Self::run_to_completion), publishing the
    /// current execution handle into `in_flight`
    pub async fn run_tracked(
        &self,
        query: &str,
        in_flight: &InFlight,
    ) -> Result<ExecutionDetails, DispatchError> {
        let backend = self.backend();
        let policy = self.policy();
        let mut throttles = 0u32;
        let mut failures = 0u32;
        let mut state = PollState::Submit;

        debug!(backend = backend.name(), query = %query, "Dispatching query");

        loop {
            state = match state {
                PollState::Submit => {
                    in_flight.set_submitting(true);
                    let submitted = backend.submit(query).await;
                    in_flight.set_submitting(false);
                    match submitted {
                        Ok(handle) => {
                            self.metrics().record_submission();
                            info!(execution = %handle, "Query submitted");
                            in_flight.set(Some(handle.clone()));
                            PollState::Poll { handle, attempt: 0 }
                        }
                        Err(BackendError::Throttled(message)) => {
                            self.backoff_throttled(&mut throttles, message).await?;
                            PollState::Submit
                        }
                        Err(err) => {
                            error!(error = %err, "Query submission rejected");
                            return Err(DispatchError::from_backend(err, None));
                        }
                    }
                }

                PollState::Poll { handle, attempt } => {
                    if attempt >= policy.max_polls {
                        PollState::Cancel {
                            handle,
                            polls: attempt,
                        }
                    } else {
                        match backend.describe(&handle).await {
                            Ok(details) => {
                                self.metrics().record_poll();
                                debug!(execution = %handle, state = %details.state, attempt, "Polled execution");
                                if details.state.is_failure() {
                                    PollState::Failed(Box::new(details))
                                } else if details.state.is_terminal() {
                                    in_flight.set(None);
                                    info!(execution = %handle, "Query succeeded");
                                    return Ok(details);
                                } else {
                                    self.sleep(policy.poll_backoff.delay_for_attempt(attempt))
                                        .await;
                                    PollState::Poll {
                                        handle,
                                        attempt: attempt + 1,
                                    }
                                }
                            }
                            Err(BackendError::Throttled(message)) => {
                                self.backoff_throttled(&mut throttles, message).await?;
                                PollState::Poll { handle, attempt }
                            }
                            Err(err) => {
                                error!(execution = %handle, error = %err, "Status check failed");
                                in_flight.set(None);
                                return Err(DispatchError::from_backend(err, Some(handle)));
                            }
                        }
                    }
                }

                PollState::Failed(details) => {
                    failures += 1;
                    self.metrics().record_failure();
                    in_flight.set(None);
                    if failures >= policy.failure_threshold {
                        error!(
                            execution = %details.handle,
                            state = %details.state,
                            reason = details.failure_reason(),
                            "Query failed"
                        );
                        return Err(DispatchError::QueryFailed { details });
                    }
                    warn!(
                        execution = %details.handle,
                        failures,
                        threshold = policy.failure_threshold,
                        reason = details.failure_reason(),
                        "Query failed; resubmitting"
                    );
                    prom::record_retry("resubmit");
                    PollState::Submit
                }

                PollState::Cancel { handle, polls } => {
                    self.metrics().record_timeout();
                    warn!(execution = %handle, polls, "Poll budget exhausted; cancelling query");
                    self.cancel_execution(&handle).await;
                    in_flight.set(None);
                    return Err(DispatchError::Timeout { handle, polls });
                }
            };
        }
    }

    /// Ask the backend to stop an execution; failures are only logged
    pub async fn cancel_execution(&self, handle: &ExecutionHandle) {
        self.metrics().record_cancellation();
        if let Err(err) = self.backend().cancel(handle).await {
            warn!(execution = %handle, error = %err, "Failed to cancel query");
        }
    }

    /// Wait out one throttled request, or give up once the budget is spent
    pub(crate) async fn backoff_throttled(
        &self,
        throttles: &mut u32,
        message: String,
    ) -> Result<(), DispatchError> {
        self.metrics().record_throttle();
        let policy = &self.policy().throttle_retry;
        if !policy.should_retry(*throttles) {
            error!(attempts = *throttles + 1, message = %message, "Backend throttling persisted");
            return Err(DispatchError::Throttled {
                attempts: *throttles + 1,
                message,
            });
        }

        let delay = policy.delay_for_attempt(*throttles);
        warn!(attempt = *throttles + 1, delay_ms = delay.as_millis() as u64, message = %message, "Backend throttled request; backing off");
        prom::record_retry("throttle");
        *throttles += 1;
        self.sleep(delay).await;
        Ok(())
    }
}
