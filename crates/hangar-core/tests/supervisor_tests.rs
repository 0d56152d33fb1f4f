//! Supervisor lifecycle tests against a scripted transport.

mod support;

use hangar_core::cancel::CancelToken;
use hangar_core::provider::{ProviderState, ProviderSupervisor};
use hangar_core::{EventBus, HangarMetrics};
use hangar_types::{ErrorKind, HangarError, ProviderId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{test_provider_config, CallScript, MockLauncher, MockTransport};

fn supervisor_with(
    launcher: Arc<MockLauncher>,
    config: hangar_config::ProviderConfig,
) -> Arc<ProviderSupervisor> {
    ProviderSupervisor::with_launcher(
        ProviderId::new("math").unwrap(),
        config,
        launcher,
        Arc::new(EventBus::new()),
        Arc::new(HangarMetrics::new()),
    )
}

#[tokio::test]
async fn cold_provider_has_no_transport_until_started() {
    let launcher = MockLauncher::new();
    let provider = supervisor_with(launcher.clone(), test_provider_config());

    assert_eq!(provider.state(), ProviderState::Cold);
    assert!(!provider.is_alive());

    provider.ensure_ready().await.unwrap();
    assert_eq!(provider.state(), ProviderState::Ready);
    assert!(provider.is_alive());
    assert_eq!(launcher.launch_count(), 1);

    // Discovered tools are cached.
    assert!(provider.has_tool("add"));
    assert!(provider.has_tool("echo"));
}

#[tokio::test]
async fn concurrent_ensure_ready_launches_once() {
    let launcher = MockLauncher::new();
    let provider = supervisor_with(launcher.clone(), test_provider_config());

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let provider = provider.clone();
            tokio::spawn(async move { provider.ensure_ready().await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(launcher.launch_count(), 1);
    assert_eq!(provider.state(), ProviderState::Ready);
}

#[tokio::test]
async fn successful_invocation_resets_consecutive_failures() {
    let launcher = MockLauncher::new();
    launcher.push(MockTransport::scripted(
        vec![CallScript::Transport, CallScript::Ok(json!({"sum": 5}))],
        CallScript::Ok(json!({"sum": 5})),
    ));
    let provider = supervisor_with(launcher, test_provider_config());
    let cancel = CancelToken::new();

    let err = provider
        .invoke("add", json!({}), Duration::from_secs(1), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(provider.health_snapshot().consecutive_failures, 1);

    let value = provider
        .invoke("add", json!({}), Duration::from_secs(1), &cancel)
        .await
        .unwrap();
    assert_eq!(value["sum"], 5);
    assert_eq!(provider.health_snapshot().consecutive_failures, 0);
}

#[tokio::test]
async fn threshold_failures_degrade_and_backoff_blocks() {
    let launcher = MockLauncher::new();
    launcher.push(MockTransport::scripted(
        vec![],
        CallScript::Transport,
    ));
    let mut config = test_provider_config();
    config.max_consecutive_failures = 3;
    let provider = supervisor_with(launcher, config);
    let cancel = CancelToken::new();

    for _ in 0..3 {
        let _ = provider
            .invoke("add", json!({}), Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
    }
    assert_eq!(provider.state(), ProviderState::Degraded);
    assert_eq!(provider.health_snapshot().consecutive_failures, 3);

    // Within backoff every ensure_ready (and thus invoke) is rejected.
    let err = provider.ensure_ready().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LaunchFailed);
    match err {
        HangarError::Degraded {
            backoff_remaining_s,
            ..
        } => assert!(backoff_remaining_s > 0.0),
        other => panic!("expected degraded error, got {other}"),
    }
}

#[tokio::test]
async fn degraded_provider_recovers_after_backoff() {
    let launcher = MockLauncher::new();
    launcher.push(MockTransport::scripted(vec![], CallScript::Transport));
    let mut config = test_provider_config();
    config.max_consecutive_failures = 1;
    // Zero cap makes the backoff expire immediately.
    config.backoff_cap_s = 0;
    let provider = supervisor_with(launcher.clone(), config);
    let cancel = CancelToken::new();

    let _ = provider
        .invoke("add", json!({}), Duration::from_secs(1), &cancel)
        .await
        .unwrap_err();
    assert_eq!(provider.state(), ProviderState::Degraded);

    // Backoff has already elapsed: the next ensure_ready relaunches and
    // resets the streak.
    provider.ensure_ready().await.unwrap();
    assert_eq!(provider.state(), ProviderState::Ready);
    assert_eq!(provider.health_snapshot().consecutive_failures, 0);
    assert_eq!(launcher.launch_count(), 2);
}

#[tokio::test]
async fn tool_errors_pass_through_without_health_impact() {
    let launcher = MockLauncher::new();
    launcher.push(MockTransport::scripted(
        vec![CallScript::ToolError("division by zero".into())],
        CallScript::Ok(json!({})),
    ));
    let provider = supervisor_with(launcher, test_provider_config());
    let cancel = CancelToken::new();

    let err = provider
        .invoke("add", json!({}), Duration::from_secs(1), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolError);
    assert!(err.to_string().contains("division by zero"));

    let health = provider.health_snapshot();
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.total_failures, 1);
    assert_eq!(provider.state(), ProviderState::Ready);
}

#[tokio::test]
async fn unknown_tool_rejected_upfront_with_predefined_schema() {
    let launcher = MockLauncher::new();
    let mut config = test_provider_config();
    config.tools = vec![hangar_types::wire::McpTool {
        name: "add".into(),
        description: None,
        input_schema: json!({"type": "object"}),
        output_schema: None,
    }];
    let provider = supervisor_with(launcher.clone(), config);
    let cancel = CancelToken::new();

    let err = provider
        .invoke("subtract", json!({}), Duration::from_secs(1), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    // Validation happens before any launch.
    assert_eq!(launcher.launch_count(), 0);
    assert_eq!(provider.state(), ProviderState::Cold);
}

#[tokio::test]
async fn stop_returns_to_cold_and_clears_discovered_tools() {
    let launcher = MockLauncher::new();
    let provider = supervisor_with(launcher, test_provider_config());

    provider.ensure_ready().await.unwrap();
    assert!(provider.has_tool("add"));

    provider.shutdown("manual").await;
    assert_eq!(provider.state(), ProviderState::Cold);
    assert!(!provider.is_alive());
    // Purely discovered tools are gone after stop.
    assert!(provider.tool_names().is_empty());
}

#[tokio::test]
async fn stop_keeps_predefined_tools() {
    let launcher = MockLauncher::new();
    let mut config = test_provider_config();
    config.tools = vec![hangar_types::wire::McpTool {
        name: "add".into(),
        description: Some("Add".into()),
        input_schema: json!({"type": "object"}),
        output_schema: None,
    }];
    let provider = supervisor_with(launcher, config);

    provider.ensure_ready().await.unwrap();
    provider.shutdown("manual").await;
    assert_eq!(provider.tool_names(), vec!["add".to_string()]);
}

#[tokio::test]
async fn launch_failure_is_reported_and_restart_is_allowed() {
    let launcher = MockLauncher::new();
    launcher.fail_launches(1);
    let provider = supervisor_with(launcher.clone(), test_provider_config());

    let err = provider.ensure_ready().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LaunchFailed);
    assert_eq!(provider.state(), ProviderState::Dead);

    // DEAD does not mean dead forever: the next attempt relaunches.
    provider.ensure_ready().await.unwrap();
    assert_eq!(provider.state(), ProviderState::Ready);
    assert_eq!(launcher.launch_count(), 2);
}

#[tokio::test]
async fn idle_provider_is_collected() {
    let launcher = MockLauncher::new();
    let mut config = test_provider_config();
    config.idle_ttl_s = 0;
    let provider = supervisor_with(launcher, config);

    provider.ensure_ready().await.unwrap();
    assert_eq!(provider.state(), ProviderState::Ready);

    assert!(provider.maybe_shutdown_idle().await);
    assert_eq!(provider.state(), ProviderState::Cold);
}

#[tokio::test]
async fn fresh_provider_is_not_collected() {
    let launcher = MockLauncher::new();
    let provider = supervisor_with(launcher, test_provider_config());

    provider.ensure_ready().await.unwrap();
    // Default TTL is 300s; nothing to collect yet.
    assert!(!provider.maybe_shutdown_idle().await);
    assert_eq!(provider.state(), ProviderState::Ready);
}

#[tokio::test]
async fn timeout_invocation_counts_and_next_call_succeeds() {
    let launcher = MockLauncher::new();
    launcher.push(MockTransport::scripted(
        vec![CallScript::Hang],
        CallScript::Ok(json!({"sum": 5})),
    ));
    let provider = supervisor_with(launcher, test_provider_config());
    let cancel = CancelToken::new();

    let err = provider
        .invoke("add", json!({}), Duration::from_millis(50), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(provider.health_snapshot().consecutive_failures, 1);

    // The provider answers again afterwards.
    let value = provider
        .invoke("add", json!({}), Duration::from_secs(1), &cancel)
        .await
        .unwrap();
    assert_eq!(value["sum"], 5);
}

#[tokio::test]
async fn health_check_refreshes_and_failure_degrades() {
    let launcher = MockLauncher::new();
    let provider = supervisor_with(launcher, test_provider_config());

    provider.ensure_ready().await.unwrap();
    assert!(provider.health_check().await);

    // Cold providers are not probed.
    provider.shutdown("manual").await;
    assert!(!provider.health_check().await);
}

#[tokio::test]
async fn details_snapshot_reflects_runtime() {
    let launcher = MockLauncher::new();
    let provider = supervisor_with(launcher, test_provider_config());

    let details = provider.details();
    assert_eq!(details.state, ProviderState::Cold);
    assert!(!details.alive);
    assert_eq!(details.tools_count, 0);

    provider.ensure_ready().await.unwrap();
    let details = provider.details();
    assert_eq!(details.state, ProviderState::Ready);
    assert!(details.alive);
    assert_eq!(details.tools_count, 2);
    assert_eq!(details.mode, "subprocess");
}
