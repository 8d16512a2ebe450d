//! Batch execution
//!
//! Drives one batch of indicator requests through the whole pipeline:
//!
//! ```text
//! requests ─> FamilyGrouper ─> QueryAssembler ─> Dispatcher ─> demux ─> BatchOutcome
//!                 │                  │                │
//!            fingerprints      one statement     sync: poll to completion
//!                              per family        async: submit, return handle
//! ```
//!
//! Families are dispatched one after another with a fixed pause between
//! submissions, or concurrently with their start times staggered by the
//! same pause so the rate seen by the backend does not change.

use std::future::Future;
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use futures::future;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::assembler::{FusedQuery, QueryAssembler};
use crate::config::FusionConfig;
use crate::dialect::DialectKind;
use crate::dispatch::demux::{demux_rows, parse_query_indicators, IndicatorValue};
use crate::dispatch::{Dispatcher, ExecutionBackend, ExecutionHandle, InFlight};
use crate::error::{DispatchError, Error, Result};
use crate::family::FamilyGrouper;
use crate::metrics as prom;
use crate::types::{IndicatorId, IndicatorRequest, IndicatorStatus, StatusMetadata};

/// Whether the engine waits for results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Poll every family to completion
    #[default]
    Sync,
    /// Submit and return handles
    Async,
}

/// Scheduling options for a batch
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Sync or async dispatch
    pub mode: DispatchMode,
    /// Pause between family submissions
    pub inter_family_delay: Duration,
    /// Families in flight at once
    pub max_concurrent_families: usize,
    /// Wall-clock limit per family
    pub family_timeout: Option<Duration>,
    /// Fetch and demultiplex rows of succeeded families
    pub fetch_results: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Sync,
            inter_family_delay: Duration::from_secs(1),
            max_concurrent_families: 1,
            family_timeout: None,
            fetch_results: true,
        }
    }
}

/// A family submitted in async mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingExecution {
    /// Backend execution
    pub handle: ExecutionHandle,
    /// Indicators the execution computes
    pub indicator_ids: Vec<IndicatorId>,
    /// Evaluation time in epoch milliseconds
    pub evaluation_time: i64,
}

/// Everything a batch produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// One per (indicator, evaluation time) of every finished or failed family
    pub statuses: Vec<IndicatorStatus>,
    /// Demultiplexed result values of succeeded families
    pub results: Vec<IndicatorValue>,
    /// Families still running on the backend (async mode)
    pub pending: Vec<PendingExecution>,
}

impl BatchOutcome {
    /// Statuses carrying an error
    pub fn failures(&self) -> impl Iterator<Item = &IndicatorStatus> {
        self.statuses.iter().filter(|s| !s.is_success())
    }

    fn absorb(&mut self, outcome: FamilyOutcome) {
        match outcome {
            FamilyOutcome::Completed { statuses, results } => {
                self.statuses.extend(statuses);
                self.results.extend(results);
            }
            FamilyOutcome::Submitted(pending) => self.pending.push(pending),
            FamilyOutcome::Failed(statuses) => self.statuses.extend(statuses),
        }
    }
}

enum FamilyOutcome {
    Completed {
        statuses: Vec<IndicatorStatus>,
        results: Vec<IndicatorValue>,
    },
    Submitted(PendingExecution),
    Failed(Vec<IndicatorStatus>),
}

/// Fuses, dispatches and demultiplexes indicator batches
#[derive(Debug, Clone)]
pub struct FusionEngine {
    grouper: FamilyGrouper,
    assembler: QueryAssembler,
    dispatcher: Dispatcher,
    options: EngineOptions,
}

impl FusionEngine {
    /// Build an engine from configuration
    ///
    /// Warehouse sketch UDFs force sketch isolation on.
    pub fn new(config: &FusionConfig, backend: Arc<dyn ExecutionBackend>) -> Result<Self> {
        config.validate().map_err(Error::Configuration)?;
        prom::init();

        let dialect = config.dialect();
        let sketch_mode = config.dialect.sketch_mode;
        let isolation =
            config.fingerprint.sketch_isolation || dialect.requires_sketch_isolation(sketch_mode);

        Ok(Self::from_parts(
            FamilyGrouper::new(config.fingerprinter(), isolation),
            QueryAssembler::new(dialect, sketch_mode),
            Dispatcher::new(backend, config.dispatch_policy()),
            config.engine_options(),
        ))
    }

    /// Build an engine from its components
    pub fn from_parts(
        grouper: FamilyGrouper,
        assembler: QueryAssembler,
        dispatcher: Dispatcher,
        options: EngineOptions,
    ) -> Self {
        Self {
            grouper,
            assembler,
            dispatcher,
            options,
        }
    }

    /// The dispatcher
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Scheduling options
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Group and assemble without dispatching
    ///
    /// Fails on a malformed filter or a negative indicator id.
    pub fn plan(&self, requests: &[IndicatorRequest]) -> Result<Vec<FusedQuery>> {
        if let Some(request) = requests.iter().find(|r| r.id < 0) {
            return Err(Error::InvalidRequest(format!(
                "indicator id {} is negative",
                request.id
            )));
        }
        let families = self.grouper.group(requests)?;
        Ok(families.iter().map(|f| self.assembler.assemble(f)).collect())
    }

    /// Run a batch
    ///
    /// Only a malformed request fails the call. Dispatch failures become
    /// error statuses for the affected family.
    pub async fn execute_batch(&self, requests: &[IndicatorRequest]) -> Result<BatchOutcome> {
        let queries = self.plan(requests)?;
        prom::update_batch_families(queries.len());
        info!(
            requests = requests.len(),
            families = queries.len(),
            mode = ?self.options.mode,
            "Executing indicator batch"
        );

        let outcomes = if self.options.max_concurrent_families <= 1 {
            let mut outcomes = Vec::with_capacity(queries.len());
            for (index, query) in queries.iter().enumerate() {
                if index > 0 && !self.options.inter_family_delay.is_zero() {
                    self.dispatcher.sleep(self.options.inter_family_delay).await;
                }
                outcomes.push(self.run_family(query).await);
            }
            outcomes
        } else {
            let start = tokio::time::Instant::now();
            let mut indexed: Vec<(usize, FamilyOutcome)> = stream::iter(queries.iter().enumerate())
                .map(|(index, query)| async move {
                    let offset = self.options.inter_family_delay.saturating_mul(index as u32);
                    let wait = (start + offset).saturating_duration_since(tokio::time::Instant::now());
                    if !wait.is_zero() {
                        self.dispatcher.sleep(wait).await;
                    }
                    (index, self.run_family(query).await)
                })
                .buffer_unordered(self.options.max_concurrent_families)
                .collect()
                .await;
            indexed.sort_by_key(|(index, _)| *index);
            indexed.into_iter().map(|(_, outcome)| outcome).collect()
        };

        let mut batch = BatchOutcome::default();
        for outcome in outcomes {
            batch.absorb(outcome);
        }

        let failed = batch.failures().count();
        prom::record_statuses(batch.statuses.len() - failed, failed);
        info!(
            statuses = batch.statuses.len(),
            failed,
            pending = batch.pending.len(),
            results = batch.results.len(),
            "Indicator batch finished"
        );
        Ok(batch)
    }

    /// Statuses for an execution returned in [`BatchOutcome::pending`]
    pub async fn recover_statuses(
        &self,
        pending: &PendingExecution,
    ) -> std::result::Result<Vec<IndicatorStatus>, DispatchError> {
        self.dispatcher
            .statuses_for_execution_at(&pending.handle, pending.evaluation_time)
            .await
    }

    async fn run_family(&self, query: &FusedQuery) -> FamilyOutcome {
        let started = Instant::now();
        debug!(indicators = ?query.indicator_ids, sql = %query.sql, "Dispatching family");

        let outcome = match self.options.mode {
            DispatchMode::Sync => self.run_family_sync(query).await,
            DispatchMode::Async => match self.dispatcher.submit(&query.sql).await {
                Ok(handle) => FamilyOutcome::Submitted(PendingExecution {
                    handle,
                    indicator_ids: query.indicator_ids.clone(),
                    evaluation_time: query.evaluation_time * 1000,
                }),
                Err(err) => self.fail_family(query, &err),
            },
        };

        let success = !matches!(outcome, FamilyOutcome::Failed(_));
        prom::record_family(
            dialect_label(self.assembler.dialect().kind()),
            started.elapsed().as_secs_f64(),
            success,
        );
        outcome
    }

    async fn run_family_sync(&self, query: &FusedQuery) -> FamilyOutcome {
        let in_flight = InFlight::new();
        let run = self.dispatcher.run_tracked(&query.sql, &in_flight);

        let result = match self.options.family_timeout {
            Some(limit) => {
                let mut run = std::pin::pin!(run);
                match tokio::time::timeout(limit, run.as_mut()).await {
                    Ok(result) => result,
                    Err(_) => {
                        // A submission the backend has not answered yet may still be
                        // accepted; wait for its handle so it can be cancelled.
                        if in_flight.is_submitting() {
                            debug!(indicators = ?query.indicator_ids, "Deadline hit during submission");
                            future::poll_fn(|cx| match run.as_mut().poll(cx) {
                                Poll::Pending if in_flight.is_submitting() => Poll::Pending,
                                _ => Poll::Ready(()),
                            })
                            .await;
                        }
                        if let Some(handle) = in_flight.current() {
                            self.dispatcher.cancel_execution(&handle).await;
                        }
                        Err(DispatchError::Deadline(limit))
                    }
                }
            }
            None => run.await,
        };

        let details = match result {
            Ok(details) => details,
            Err(err) => return self.fail_family(query, &err),
        };

        let results = if self.options.fetch_results {
            match self.dispatcher.backend().fetch_rows(&details.handle).await {
                Ok(rows) => demux_rows(&rows, &query.group_fields),
                Err(err) => {
                    let err = DispatchError::from_backend(err, Some(details.handle.clone()));
                    return self.fail_family(query, &err);
                }
            }
        } else {
            Vec::new()
        };

        FamilyOutcome::Completed {
            statuses: self.statuses(query, &StatusMetadata::success()),
            results,
        }
    }

    fn fail_family(&self, query: &FusedQuery, err: &DispatchError) -> FamilyOutcome {
        error!(indicators = ?query.indicator_ids, error = %err, "Family failed");
        FamilyOutcome::Failed(self.statuses(query, &StatusMetadata::from_dispatch_error(err)))
    }

    fn statuses(&self, query: &FusedQuery, metadata: &StatusMetadata) -> Vec<IndicatorStatus> {
        parse_query_indicators(&query.sql).statuses(query.evaluation_time * 1000, metadata)
    }
}

fn dialect_label(kind: DialectKind) -> &'static str {
    match kind {
        DialectKind::Presto => "presto",
        DialectKind::Warehouse => "warehouse",
        DialectKind::Embedded => "embedded",
    }
}
