//! Shared test helpers: a scripted in-memory execution backend

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use indicator_fusion::dispatch::{
    ExecutionBackend, ExecutionDetails, ExecutionHandle, ExecutionState, ResultRow,
};
use indicator_fusion::BackendError;
use parking_lot::Mutex;

/// One scripted answer to a status check
#[derive(Debug, Clone)]
pub enum Describe {
    /// Report this state
    State(ExecutionState),
    /// Report a failure with a reason
    Failed(&'static str),
    /// Fail the status check itself
    Error(BackendError),
}

struct Execution {
    query: String,
    script: VecDeque<Describe>,
    last: Describe,
    cancelled: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u32,
    submit_errors: VecDeque<BackendError>,
    scripts: VecDeque<Vec<Describe>>,
    executions: HashMap<String, Execution>,
    rows: VecDeque<Vec<ResultRow>>,
    submitted: Vec<String>,
    cancelled: Vec<ExecutionHandle>,
    describes: usize,
    submit_delay: Duration,
}

/// Backend that replays scripted states
///
/// Each submission takes the next script; an execution without one succeeds
/// on its first status check. The last scripted answer repeats.
#[derive(Default)]
pub struct ScriptedBackend {
    inner: Mutex<Inner>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Throttle the next `n` submissions
    pub fn throttle_submits(self, n: usize) -> Self {
        {
            let mut inner = self.inner.lock();
            for _ in 0..n {
                inner
                    .submit_errors
                    .push_back(BackendError::Throttled("TooManyRequestsException".into()));
            }
        }
        self
    }

    /// Take `delay` to answer every submission
    pub fn slow_submits(self, delay: Duration) -> Self {
        self.inner.lock().submit_delay = delay;
        self
    }

    /// Fail the next submission with `err`
    pub fn fail_submit(self, err: BackendError) -> Self {
        self.inner.lock().submit_errors.push_back(err);
        self
    }

    /// Status checks for the next submitted execution
    pub fn script(self, steps: Vec<Describe>) -> Self {
        self.inner.lock().scripts.push_back(steps);
        self
    }

    /// Rows returned by the next fetch
    pub fn rows(self, rows: Vec<serde_json::Value>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| match row {
                serde_json::Value::Object(map) => map,
                other => panic!("row must be an object, got {}", other),
            })
            .collect();
        self.inner.lock().rows.push_back(rows);
        self
    }

    pub fn submitted(&self) -> Vec<String> {
        self.inner.lock().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<ExecutionHandle> {
        self.inner.lock().cancelled.clone()
    }

    pub fn describes(&self) -> usize {
        self.inner.lock().describes
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn submit(&self, query: &str) -> Result<ExecutionHandle, BackendError> {
        let delay = self.inner.lock().submit_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if let Some(err) = inner.submit_errors.pop_front() {
            return Err(err);
        }

        inner.next_id += 1;
        let id = format!("exec-{}", inner.next_id);
        let script: VecDeque<Describe> = inner.scripts.pop_front().unwrap_or_default().into();
        let last = script
            .back()
            .cloned()
            .unwrap_or(Describe::State(ExecutionState::Succeeded));

        inner.submitted.push(query.to_string());
        inner.executions.insert(
            id.clone(),
            Execution {
                query: query.to_string(),
                script,
                last,
                cancelled: false,
            },
        );
        Ok(ExecutionHandle::new(id))
    }

    async fn describe(&self, handle: &ExecutionHandle) -> Result<ExecutionDetails, BackendError> {
        let mut inner = self.inner.lock();
        inner.describes += 1;
        let execution = inner
            .executions
            .get_mut(handle.as_str())
            .ok_or_else(|| BackendError::UnknownExecution(handle.to_string()))?;

        if execution.cancelled {
            return Ok(ExecutionDetails::new(
                handle.clone(),
                ExecutionState::Cancelled,
                execution.query.clone(),
            )
            .with_reason("Query cancelled by user"));
        }

        let step = execution
            .script
            .pop_front()
            .unwrap_or_else(|| execution.last.clone());

        match step {
            Describe::State(state) => Ok(ExecutionDetails::new(
                handle.clone(),
                state,
                execution.query.clone(),
            )),
            Describe::Failed(reason) => Ok(ExecutionDetails::new(
                handle.clone(),
                ExecutionState::Failed,
                execution.query.clone(),
            )
            .with_reason(reason)
            .with_error("USER_ERROR", reason)),
            Describe::Error(err) => Err(err),
        }
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        inner.cancelled.push(handle.clone());
        if let Some(execution) = inner.executions.get_mut(handle.as_str()) {
            execution.cancelled = true;
        }
        Ok(())
    }

    async fn fetch_rows(&self, _handle: &ExecutionHandle) -> Result<Vec<ResultRow>, BackendError> {
        Ok(self.inner.lock().rows.pop_front().unwrap_or_default())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
