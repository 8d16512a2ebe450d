//! End-to-End Fusion Pipeline Tests
//!
//! Drives whole batches through grouping, assembly, dispatch and
//! demultiplexing against a scripted backend.
//!
//! # Test Coverage
//!
//! 1. **Fusion** - Equivalent requests share one statement
//! 2. **Partial Failure** - One failed family does not affect the others
//! 3. **Polling** - Timeout cancels, throttling backs off, resubmission
//! 4. **Async Mode** - Pending handles, immediate failure, status recovery
//! 5. **Scheduling** - Inter-family delay, concurrency, family deadline

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Describe, ScriptedBackend};
use indicator_fusion::{
    assembler::QueryAssembler,
    batch::{DispatchMode, EngineOptions, FusionEngine},
    dialect::Dialect,
    dispatch::{
        DispatchPolicy, Dispatcher, ExecutionHandle, ExecutionState, RecordingSleeper, RetryPolicy,
    },
    family::FamilyGrouper,
    BackendError, DispatchError, FusionConfig, IndicatorId, IndicatorRequest,
};
use serde_json::json;

const EVAL: i64 = 1_654_646_400;
const EVAL_MS: i64 = EVAL * 1000;

// =============================================================================
// Test Helpers
// =============================================================================

fn request(id: IndicatorId, calculation: &str, filter: &str) -> IndicatorRequest {
    IndicatorRequest::builder(id, calculation)
        .dataset(2, "SELECT * FROM events;")
        .group_by("country")
        .filter(filter)
        .timestamp_field("ts")
        .evaluation_time(EVAL)
        .lookback_window(3600)
        .evaluation_interval("0 * * * *")
        .tenant("org-1")
        .build()
}

fn options(mode: DispatchMode) -> EngineOptions {
    EngineOptions {
        mode,
        inter_family_delay: Duration::ZERO,
        ..EngineOptions::default()
    }
}

fn engine_with(
    backend: &Arc<ScriptedBackend>,
    sleeper: &Arc<RecordingSleeper>,
    policy: DispatchPolicy,
    options: EngineOptions,
) -> FusionEngine {
    let dispatcher = Dispatcher::new(backend.clone(), policy).with_sleeper(sleeper.clone());
    FusionEngine::from_parts(
        FamilyGrouper::default(),
        QueryAssembler::new(Dialect::Presto, false),
        dispatcher,
        options,
    )
}

fn engine(backend: &Arc<ScriptedBackend>, sleeper: &Arc<RecordingSleeper>) -> FusionEngine {
    engine_with(
        backend,
        sleeper,
        DispatchPolicy::default(),
        options(DispatchMode::Sync),
    )
}

fn error_code(status: &indicator_fusion::IndicatorStatus) -> Option<String> {
    status.metadata.error.as_ref().and_then(|e| e.code.clone())
}

// =============================================================================
// Fusion
// =============================================================================

#[tokio::test]
async fn test_equivalent_requests_share_one_statement() {
    let backend = Arc::new(ScriptedBackend::new().rows(vec![
        json!({
            "country": "DE",
            "_indicator_1": 10,
            "_indicator_2": 3,
            "_indicator_3": 1.5,
            "_result_min_ts": EVAL - 3000,
            "_result_max_ts": EVAL - 10,
            "_lookback_range_end_ts": EVAL,
            "_lookback_range_start_ts": EVAL - 3600
        }),
        json!({
            "COUNTRY": "FR",
            "_INDICATOR_1": 7,
            "_INDICATOR_2": 1,
            "_INDICATOR_3": 0.5,
            "_LOOKBACK_RANGE_END_TS": EVAL
        }),
    ]));
    let sleeper = Arc::new(RecordingSleeper::new());
    let engine = engine(&backend, &sleeper);

    let batch = vec![
        request(1, "SUM(x)", "a = 1 AND b = 2"),
        request(2, "COUNT(*)", "b = 2 AND a = 1"),
        request(3, "AVG(y)", "a = 1 AND b = 2"),
    ];
    let outcome = engine.execute_batch(&batch).await.unwrap();

    let submitted = backend.submitted();
    assert_eq!(submitted.len(), 1);
    for id in 1..=3 {
        assert!(submitted[0].contains(&format!("as _indicator_{}", id)));
    }

    let ids: Vec<_> = outcome.statuses.iter().map(|s| s.indicator_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(outcome.statuses.iter().all(|s| s.is_success()));
    assert!(outcome.statuses.iter().all(|s| s.evaluation_time == EVAL_MS));
    assert!(outcome.pending.is_empty());

    assert_eq!(outcome.results.len(), 6);
    assert_eq!(outcome.results[0].indicator_id, 1);
    assert_eq!(outcome.results[0].group_values["country"], json!("DE"));
    assert_eq!(outcome.results[3].group_values["country"], json!("FR"));
    assert_eq!(outcome.results[5].value, json!(0.5));
}

#[tokio::test]
async fn test_empty_batch() {
    let backend = Arc::new(ScriptedBackend::new());
    let sleeper = Arc::new(RecordingSleeper::new());
    let outcome = engine(&backend, &sleeper).execute_batch(&[]).await.unwrap();

    assert!(outcome.statuses.is_empty());
    assert!(outcome.results.is_empty());
    assert!(backend.submitted().is_empty());
}

#[tokio::test]
async fn test_malformed_filter_fails_before_dispatch() {
    let backend = Arc::new(ScriptedBackend::new());
    let sleeper = Arc::new(RecordingSleeper::new());
    let batch = vec![
        request(1, "SUM(x)", "a = 1"),
        request(2, "SUM(x)", "(a = 1"),
    ];

    let result = engine(&backend, &sleeper).execute_batch(&batch).await;
    assert!(matches!(result, Err(indicator_fusion::Error::Parse(_))));
    assert!(backend.submitted().is_empty());
}

// =============================================================================
// Partial Failure
// =============================================================================

#[tokio::test]
async fn test_failed_family_does_not_affect_others() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .script(vec![Describe::Failed("SYNTAX_ERROR: line 1:8: Column 'x' cannot be resolved")])
            .script(vec![Describe::State(ExecutionState::Succeeded)]),
    );
    let sleeper = Arc::new(RecordingSleeper::new());
    let engine = engine(&backend, &sleeper);

    let batch = vec![
        request(1, "SUM(x)", "a = 1"),
        request(2, "COUNT(*)", "a = 1"),
        request(3, "SUM(y)", "a = 2"),
    ];
    let outcome = engine.execute_batch(&batch).await.unwrap();

    assert_eq!(backend.submitted().len(), 2);
    assert_eq!(outcome.statuses.len(), 3);

    let failed: Vec<_> = outcome.failures().map(|s| s.indicator_id).collect();
    assert_eq!(failed, vec![1, 2]);

    let metadata = &outcome.statuses[0].metadata;
    let error = metadata.error.as_ref().unwrap();
    assert!(error.error_message.contains("cannot be resolved"));
    assert_eq!(error.code.as_deref(), Some("USER_ERROR"));
    let execution = metadata.execution.as_ref().unwrap();
    assert_eq!(execution.id, "exec-1");
    assert!(execution.query.as_deref().unwrap().contains("_indicator_2"));

    assert!(outcome.statuses[2].is_success());
    assert_eq!(outcome.statuses[2].indicator_id, 3);
}

// =============================================================================
// Polling
// =============================================================================

#[tokio::test]
async fn test_poll_budget_exhaustion_cancels() {
    let backend =
        Arc::new(ScriptedBackend::new().script(vec![Describe::State(ExecutionState::Running)]));
    let sleeper = Arc::new(RecordingSleeper::new());
    let engine = engine(&backend, &sleeper);

    let outcome = engine
        .execute_batch(&[request(1, "SUM(x)", "a = 1")])
        .await
        .unwrap();

    assert_eq!(backend.describes(), 10);
    assert_eq!(sleeper.delays().len(), 10);
    assert_eq!(backend.cancelled().len(), 1);
    assert_eq!(backend.cancelled()[0].as_str(), "exec-1");

    assert_eq!(outcome.statuses.len(), 1);
    assert_eq!(error_code(&outcome.statuses[0]).as_deref(), Some("TimeOver"));

    let snapshot = engine.dispatcher().metrics().snapshot();
    assert_eq!(snapshot.timeouts, 1);
    assert_eq!(snapshot.cancellations, 1);
}

#[tokio::test]
async fn test_poll_backoff_grows() {
    let backend = Arc::new(ScriptedBackend::new().script(vec![
        Describe::State(ExecutionState::Queued),
        Describe::State(ExecutionState::Running),
        Describe::State(ExecutionState::Running),
        Describe::State(ExecutionState::Succeeded),
    ]));
    let sleeper = Arc::new(RecordingSleeper::new());
    let policy = DispatchPolicy {
        poll_backoff: RetryPolicy::polling().jitter(false),
        ..DispatchPolicy::default()
    };
    let engine = engine_with(&backend, &sleeper, policy, options(DispatchMode::Sync));

    let outcome = engine
        .execute_batch(&[request(1, "SUM(x)", "a = 1")])
        .await
        .unwrap();

    assert!(outcome.statuses[0].is_success());
    assert_eq!(
        sleeper.delays(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
}

#[tokio::test]
async fn test_throttled_submission_backs_off() {
    let backend = Arc::new(ScriptedBackend::new().throttle_submits(2));
    let sleeper = Arc::new(RecordingSleeper::new());
    let engine = engine(&backend, &sleeper);

    let outcome = engine
        .execute_batch(&[request(1, "SUM(x)", "a = 1")])
        .await
        .unwrap();

    assert!(outcome.statuses[0].is_success());
    assert_eq!(backend.submitted().len(), 1);
    assert_eq!(sleeper.delays().len(), 2);

    let snapshot = engine.dispatcher().metrics().snapshot();
    assert_eq!(snapshot.throttles, 2);
    assert_eq!(snapshot.failures, 0);
}

#[tokio::test]
async fn test_persistent_throttling_gives_up() {
    let backend = Arc::new(ScriptedBackend::new().throttle_submits(5));
    let sleeper = Arc::new(RecordingSleeper::new());
    let policy = DispatchPolicy {
        throttle_retry: RetryPolicy::immediate(2),
        ..DispatchPolicy::default()
    };
    let engine = engine_with(&backend, &sleeper, policy, options(DispatchMode::Sync));

    let outcome = engine
        .execute_batch(&[request(1, "SUM(x)", "a = 1")])
        .await
        .unwrap();

    assert!(backend.submitted().is_empty());
    assert_eq!(error_code(&outcome.statuses[0]).as_deref(), Some("Throttled"));
}

#[tokio::test]
async fn test_failure_under_threshold_resubmits() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .script(vec![Describe::Failed("Query exhausted resources")])
            .script(vec![Describe::State(ExecutionState::Succeeded)]),
    );
    let sleeper = Arc::new(RecordingSleeper::new());
    let policy = DispatchPolicy {
        failure_threshold: 2,
        ..DispatchPolicy::default()
    };
    let engine = engine_with(&backend, &sleeper, policy, options(DispatchMode::Sync));

    let outcome = engine
        .execute_batch(&[request(1, "SUM(x)", "a = 1")])
        .await
        .unwrap();

    assert_eq!(backend.submitted().len(), 2);
    assert!(outcome.statuses[0].is_success());
}

#[tokio::test]
async fn test_direct_run_reports_query_failure() {
    let backend =
        Arc::new(ScriptedBackend::new().script(vec![Describe::Failed("division by zero")]));
    let dispatcher = Dispatcher::new(backend.clone(), DispatchPolicy::default())
        .with_sleeper(Arc::new(RecordingSleeper::new()));

    let err = dispatcher.run_to_completion("SELECT 1/0").await.unwrap_err();
    match err {
        DispatchError::QueryFailed { details } => {
            assert_eq!(details.failure_reason(), "division by zero");
            assert_eq!(details.query, "SELECT 1/0");
        }
        other => panic!("unexpected error: {}", other),
    }
}

// =============================================================================
// Async Mode
// =============================================================================

#[tokio::test]
async fn test_async_returns_pending_and_recovers_statuses() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .script(vec![Describe::Failed("Table events does not exist")])
            .script(vec![
                Describe::State(ExecutionState::Queued),
                Describe::State(ExecutionState::Running),
                Describe::State(ExecutionState::Succeeded),
            ]),
    );
    let sleeper = Arc::new(RecordingSleeper::new());
    let engine = engine_with(
        &backend,
        &sleeper,
        DispatchPolicy::default(),
        options(DispatchMode::Async),
    );

    let batch = vec![
        request(1, "SUM(x)", "a = 1"),
        request(2, "SUM(x)", "a = 2"),
        request(3, "COUNT(*)", "a = 2"),
    ];
    let outcome = engine.execute_batch(&batch).await.unwrap();

    // Family one failed immediately, family two is still running
    assert_eq!(outcome.statuses.len(), 1);
    assert_eq!(outcome.statuses[0].indicator_id, 1);
    assert!(!outcome.statuses[0].is_success());
    assert_eq!(
        outcome.statuses[0]
            .metadata
            .execution
            .as_ref()
            .map(|e| e.id.as_str()),
        Some("exec-1")
    );

    assert_eq!(outcome.pending.len(), 1);
    let pending = &outcome.pending[0];
    assert_eq!(pending.indicator_ids, vec![2, 3]);
    assert_eq!(pending.evaluation_time, EVAL_MS);

    // Still running on the first recovery attempt
    let err = engine.recover_statuses(pending).await.unwrap_err();
    assert!(matches!(err, DispatchError::Pending(_)));

    let statuses = engine.recover_statuses(pending).await.unwrap();
    let ids: Vec<_> = statuses.iter().map(|s| s.indicator_id).collect();
    assert_eq!(ids, vec![2, 3]);
    assert!(statuses.iter().all(|s| s.is_success() && s.evaluation_time == EVAL_MS));
}

#[tokio::test]
async fn test_async_recovery_of_failed_execution() {
    let backend = Arc::new(ScriptedBackend::new().script(vec![
        Describe::State(ExecutionState::Running),
        Describe::Failed("Query timeout"),
    ]));
    let sleeper = Arc::new(RecordingSleeper::new());
    let engine = engine_with(
        &backend,
        &sleeper,
        DispatchPolicy::default(),
        options(DispatchMode::Async),
    );

    let outcome = engine
        .execute_batch(&[request(4, "SUM(x)", "a = 1")])
        .await
        .unwrap();
    let statuses = engine.recover_statuses(&outcome.pending[0]).await.unwrap();
    assert_eq!(statuses.len(), 1);
    let error = statuses[0].metadata.error.as_ref().unwrap();
    assert_eq!(error.error_message, "Query timeout");
}

#[tokio::test]
async fn test_async_recovery_without_timestamp_field() {
    let backend = Arc::new(ScriptedBackend::new().script(vec![
        Describe::State(ExecutionState::Running),
        Describe::State(ExecutionState::Succeeded),
    ]));
    let sleeper = Arc::new(RecordingSleeper::new());
    let engine = engine_with(
        &backend,
        &sleeper,
        DispatchPolicy::default(),
        options(DispatchMode::Async),
    );

    let untimed = IndicatorRequest::builder(9, "SUM(x)")
        .dataset(2, "SELECT * FROM events")
        .filter("a = 1")
        .evaluation_time(EVAL)
        .lookback_window(3600)
        .build();
    let outcome = engine.execute_batch(&[untimed]).await.unwrap();
    assert!(!backend.submitted()[0].contains("_lookback_range_end_ts"));

    let pending = &outcome.pending[0];
    assert_eq!(pending.evaluation_time, EVAL_MS);

    let statuses = engine.recover_statuses(pending).await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].indicator_id, 9);
    assert_eq!(statuses[0].evaluation_time, EVAL_MS);
}

#[tokio::test]
async fn test_async_rejected_submission() {
    let backend = Arc::new(ScriptedBackend::new().fail_submit(BackendError::Rejected {
        code: "InvalidRequestException".into(),
        message: "line 1:1: mismatched input".into(),
    }));
    let sleeper = Arc::new(RecordingSleeper::new());
    let engine = engine_with(
        &backend,
        &sleeper,
        DispatchPolicy::default(),
        options(DispatchMode::Async),
    );

    let outcome = engine
        .execute_batch(&[request(1, "SUM(x)", "a = 1")])
        .await
        .unwrap();
    assert!(outcome.pending.is_empty());
    assert_eq!(
        error_code(&outcome.statuses[0]).as_deref(),
        Some("InvalidRequestException")
    );
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn test_inter_family_delay_between_families() {
    let backend = Arc::new(ScriptedBackend::new());
    let sleeper = Arc::new(RecordingSleeper::new());
    let options = EngineOptions {
        inter_family_delay: Duration::from_secs(1),
        ..options(DispatchMode::Sync)
    };
    let engine = engine_with(&backend, &sleeper, DispatchPolicy::default(), options);

    let batch = vec![
        request(1, "SUM(x)", "a = 1"),
        request(2, "SUM(x)", "a = 2"),
        request(3, "SUM(x)", "a = 3"),
    ];
    let outcome = engine.execute_batch(&batch).await.unwrap();

    assert_eq!(outcome.statuses.len(), 3);
    assert_eq!(sleeper.delays(), vec![Duration::from_secs(1); 2]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_families_are_staggered() {
    let backend = Arc::new(ScriptedBackend::new());
    let sleeper = Arc::new(RecordingSleeper::new());
    let options = EngineOptions {
        inter_family_delay: Duration::from_secs(1),
        max_concurrent_families: 3,
        ..options(DispatchMode::Sync)
    };
    let engine = engine_with(&backend, &sleeper, DispatchPolicy::default(), options);

    let batch = vec![
        request(1, "SUM(x)", "a = 1"),
        request(2, "SUM(x)", "a = 2"),
        request(3, "SUM(x)", "a = 3"),
    ];
    let outcome = engine.execute_batch(&batch).await.unwrap();

    let ids: Vec<_> = outcome.statuses.iter().map(|s| s.indicator_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let mut delays = sleeper.delays();
    delays.sort();
    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_family_deadline_cancels_execution() {
    let backend =
        Arc::new(ScriptedBackend::new().script(vec![Describe::State(ExecutionState::Running)]));
    let options = EngineOptions {
        family_timeout: Some(Duration::from_secs(5)),
        ..options(DispatchMode::Sync)
    };
    let dispatcher = Dispatcher::new(backend.clone(), DispatchPolicy::default());
    let engine = FusionEngine::from_parts(
        FamilyGrouper::default(),
        QueryAssembler::new(Dialect::Presto, false),
        dispatcher,
        options,
    );

    let outcome = engine
        .execute_batch(&[request(1, "SUM(x)", "a = 1")])
        .await
        .unwrap();

    assert_eq!(error_code(&outcome.statuses[0]).as_deref(), Some("Deadline"));
    assert_eq!(backend.cancelled().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_family_deadline_during_slow_submission() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .slow_submits(Duration::from_secs(10))
            .script(vec![Describe::State(ExecutionState::Running)]),
    );
    let options = EngineOptions {
        family_timeout: Some(Duration::from_secs(5)),
        ..options(DispatchMode::Sync)
    };
    let dispatcher = Dispatcher::new(backend.clone(), DispatchPolicy::default());
    let engine = FusionEngine::from_parts(
        FamilyGrouper::default(),
        QueryAssembler::new(Dialect::Presto, false),
        dispatcher,
        options,
    );

    let outcome = engine
        .execute_batch(&[request(1, "SUM(x)", "a = 1")])
        .await
        .unwrap();

    // The execution accepted after the deadline is still cancelled
    assert_eq!(error_code(&outcome.statuses[0]).as_deref(), Some("Deadline"));
    assert_eq!(backend.submitted().len(), 1);
    assert_eq!(backend.cancelled(), vec![ExecutionHandle::new("exec-1")]);
}

#[tokio::test]
async fn test_engine_from_config() {
    let backend = Arc::new(ScriptedBackend::new());
    let mut config = FusionConfig::default();
    config.dispatch.inter_family_delay_ms = 0;
    config.dispatch.fetch_results = false;

    let engine = FusionEngine::new(&config, backend.clone()).unwrap();
    let outcome = engine
        .execute_batch(&[
            request(1, "COUNT(DISTINCT user_id)", "a = 1"),
            request(2, "approx_percentile(latency, 0.9)", "a = 1"),
        ])
        .await
        .unwrap();

    let submitted = backend.submitted();
    assert_eq!(submitted.len(), 1);
    assert!(submitted[0].contains("APPROX_SET(user_id)"));
    assert!(submitted[0].contains("qdigest_agg(latency)"));
    assert_eq!(outcome.statuses.len(), 2);
    assert!(outcome.results.is_empty());
}
