//! Batch executor tests: ordering, single-flight, fail-fast, clamping,
//! truncation, retries.

mod support;

use hangar_config::{BatchLimits, HangarConfig, TruncationConfig};
use hangar_core::batch::{BatchExecutor, BatchRequest, CallSpec};
use hangar_core::{EventBus, HangarMetrics, Registry};
use hangar_types::ErrorKind;
use serde_json::{json, Value};
use std::sync::Arc;
use support::{test_provider_config, CallScript, MockLauncher, MockTransport};

fn config_with_providers(ids: &[&str]) -> HangarConfig {
    let mut config = HangarConfig::default();
    for id in ids {
        config
            .providers
            .insert(id.to_string(), test_provider_config());
    }
    config
}

fn build(
    config: &HangarConfig,
    launcher: Arc<MockLauncher>,
    truncation: Option<TruncationConfig>,
) -> (Arc<Registry>, BatchExecutor) {
    let bus = Arc::new(EventBus::new());
    let metrics = Arc::new(HangarMetrics::new());
    let registry = Registry::from_config(config, launcher, bus.clone(), metrics.clone()).unwrap();
    let executor = BatchExecutor::new(
        registry.clone(),
        BatchLimits::default(),
        truncation.unwrap_or_default(),
        bus,
        metrics,
    );
    (registry, executor)
}

fn calls(provider: &str, n: usize) -> Vec<CallSpec> {
    (0..n)
        .map(|_| CallSpec {
            provider: provider.to_string(),
            tool: "add".to_string(),
            arguments: json!({"a": 2, "b": 3}),
            timeout: None,
        })
        .collect()
}

fn request(calls: Vec<CallSpec>) -> BatchRequest {
    BatchRequest {
        calls,
        max_concurrency: None,
        timeout: None,
        fail_fast: false,
        max_retries: None,
    }
}

#[tokio::test]
async fn results_are_complete_and_ordered() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    let (_registry, executor) = build(&config, launcher, None);

    let outcome = executor.execute(request(calls("math", 7))).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.total, 7);
    assert_eq!(outcome.succeeded, 7);
    assert_eq!(outcome.results.len(), 7);
    for (i, result) in outcome.results.iter().enumerate() {
        assert_eq!(result.index, i);
        assert!(result.success);
        assert_eq!(result.value.as_ref().unwrap()["sum"], 5);
    }
}

#[tokio::test]
async fn cold_start_is_deduplicated_within_a_batch() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    let (_registry, executor) = build(&config, launcher.clone(), None);

    let outcome = executor.execute(request(calls("math", 10))).await.unwrap();
    assert_eq!(outcome.succeeded, 10);
    assert_eq!(launcher.launch_count(), 1);
}

#[tokio::test]
async fn concurrent_batches_share_one_cold_start() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    let (registry, executor) = build(&config, launcher.clone(), None);
    let bus = Arc::new(EventBus::new());
    let metrics = Arc::new(HangarMetrics::new());
    let executor_b = BatchExecutor::new(
        registry,
        BatchLimits::default(),
        TruncationConfig::default(),
        bus,
        metrics,
    );

    let (a, b) = tokio::join!(
        executor.execute(request(calls("math", 5))),
        executor_b.execute(request(calls("math", 3))),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.succeeded, 5);
    assert_eq!(b.succeeded, 3);
    // Both batches rendezvous on the supervisor's single launch.
    assert_eq!(launcher.launch_count(), 1);
}

#[tokio::test]
async fn distinct_providers_launch_at_most_once_each() {
    let config = config_with_providers(&["a", "b", "c"]);
    let launcher = MockLauncher::new();
    let (_registry, executor) = build(&config, launcher.clone(), None);

    let mut batch = calls("a", 4);
    batch.extend(calls("b", 4));
    batch.extend(calls("c", 4));
    let outcome = executor.execute(request(batch)).await.unwrap();

    assert_eq!(outcome.succeeded, 12);
    assert_eq!(launcher.launch_count(), 3);
}

#[tokio::test]
async fn unknown_provider_rejects_whole_batch() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    let (_registry, executor) = build(&config, launcher.clone(), None);

    let mut batch = calls("math", 2);
    batch.push(CallSpec {
        provider: "nope".into(),
        tool: "add".into(),
        arguments: json!({}),
        timeout: None,
    });

    let err = executor.execute(request(batch)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("call[2]"));
    assert!(err.to_string().contains("unknown_provider"));
    // Eager validation means nothing ran.
    assert_eq!(launcher.launch_count(), 0);
}

#[tokio::test]
async fn oversized_batch_is_rejected() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    let (_registry, executor) = build(&config, launcher, None);

    let err = executor.execute(request(calls("math", 101))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let ok = executor.execute(request(calls("math", 100))).await.unwrap();
    assert_eq!(ok.total, 100);
}

#[tokio::test]
async fn deep_arguments_are_rejected() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    let (_registry, executor) = build(&config, launcher, None);

    let mut nested = json!(1);
    for _ in 0..11 {
        nested = json!({ "n": nested });
    }
    let batch = vec![CallSpec {
        provider: "math".into(),
        tool: "add".into(),
        arguments: nested,
        timeout: None,
    }];
    let err = executor.execute(request(batch)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("nesting"));
}

#[tokio::test]
async fn out_of_range_knobs_are_clamped_not_rejected() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    let (_registry, executor) = build(&config, launcher, None);

    let mut request = request(calls("math", 3));
    request.max_concurrency = Some(0);
    let outcome = executor.execute(request).await.unwrap();
    assert_eq!(outcome.succeeded, 3);

    let mut request = self::request(calls("math", 3));
    request.max_concurrency = Some(21);
    request.timeout = Some(100_000);
    request.max_retries = Some(99);
    let outcome = executor.execute(request).await.unwrap();
    assert_eq!(outcome.succeeded, 3);
}

#[tokio::test]
async fn fail_fast_cancels_not_yet_started_calls() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    launcher.push(MockTransport::scripted(
        vec![CallScript::Transport],
        CallScript::Ok(json!({"sum": 5})),
    ));
    let (_registry, executor) = build(&config, launcher, None);

    let mut request = request(calls("math", 10));
    request.fail_fast = true;
    request.max_concurrency = Some(1);
    let outcome = executor.execute(request).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.results.len(), 10);
    assert_eq!(outcome.results[0].error_kind, Some(ErrorKind::Transport));
    let cancelled = outcome
        .results
        .iter()
        .filter(|r| r.error_kind == Some(ErrorKind::Cancelled))
        .count();
    assert_eq!(cancelled, 9);
}

#[tokio::test]
async fn partial_failure_without_fail_fast() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    launcher.push(MockTransport::scripted(
        vec![CallScript::Transport],
        CallScript::Ok(json!({"sum": 5})),
    ));
    let (_registry, executor) = build(&config, launcher, None);

    let mut request = request(calls("math", 4));
    request.max_concurrency = Some(1);
    let outcome = executor.execute(request).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.succeeded, 3);
    assert_eq!(outcome.failed, 1);
}

#[tokio::test]
async fn retry_recovers_from_transient_failure() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    launcher.push(MockTransport::scripted(
        vec![CallScript::Transport, CallScript::Ok(json!({"sum": 5}))],
        CallScript::Ok(json!({"sum": 5})),
    ));
    let (_registry, executor) = build(&config, launcher, None);

    let mut request = request(calls("math", 1));
    request.max_retries = Some(3);
    let outcome = executor.execute(request).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.results[0].retries, 1);
    assert_eq!(outcome.results[0].value.as_ref().unwrap()["sum"], 5);
}

#[tokio::test]
async fn oversized_payload_is_truncated_but_successful() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    let big = json!({"blob": "x".repeat(500)});
    launcher.push(MockTransport::scripted(vec![], CallScript::Ok(big.clone())));

    let truncation = TruncationConfig {
        enabled: true,
        max_result_bytes: 64,
        max_batch_bytes: 10_000,
        ..Default::default()
    };
    let (_registry, executor) = build(&config, launcher, Some(truncation));

    let outcome = executor.execute(request(calls("math", 1))).await.unwrap();
    let result = &outcome.results[0];
    assert!(result.success);
    assert!(result.truncated);
    assert!(result.value.is_none());
    assert!(result.original_size_bytes.unwrap() > 64);

    // The full payload is recoverable through the continuation store.
    let continuation_id = result.continuation_id.as_ref().unwrap();
    let stored = executor.continuations().get(continuation_id).unwrap();
    assert_eq!(stored, big);
}

#[tokio::test]
async fn cumulative_budget_truncates_later_results() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    let payload = json!({"blob": "y".repeat(100)});
    launcher.push(MockTransport::scripted(vec![], CallScript::Ok(payload)));

    let truncation = TruncationConfig {
        enabled: true,
        max_result_bytes: 10_000,
        // Only about two payloads fit.
        max_batch_bytes: 250,
        ..Default::default()
    };
    let (_registry, executor) = build(&config, launcher, Some(truncation));

    let mut request = request(calls("math", 4));
    request.max_concurrency = Some(1);
    let outcome = executor.execute(request).await.unwrap();

    assert_eq!(outcome.succeeded, 4);
    let truncated = outcome.results.iter().filter(|r| r.truncated).count();
    let kept = outcome.results.iter().filter(|r| r.value.is_some()).count();
    assert_eq!(truncated + kept, 4);
    assert!(truncated >= 2, "expected later payloads to be truncated");
}

#[tokio::test]
async fn global_deadline_bounds_hanging_calls() {
    let config = config_with_providers(&["math"]);
    let launcher = MockLauncher::new();
    launcher.push(MockTransport::scripted(
        vec![CallScript::Hang],
        CallScript::Ok(json!({"sum": 5})),
    ));
    let (_registry, executor) = build(&config, launcher, None);

    let started = std::time::Instant::now();
    let mut request = request(vec![CallSpec {
        provider: "math".into(),
        tool: "add".into(),
        arguments: json!({}),
        timeout: Some(5.0),
    }]);
    request.timeout = Some(1);
    let outcome = executor.execute(request).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.results[0].error_kind, Some(ErrorKind::Timeout));
    assert!(started.elapsed() < std::time::Duration::from_secs(3));

    // The provider answers again on a follow-up call.
    let outcome = executor.execute(self::request(calls("math", 1))).await.unwrap();
    assert!(outcome.success);
    assert_eq!(
        outcome.results[0].value.as_ref().unwrap()["sum"],
        Value::from(5)
    );
}
