//! Hot-reload tests: diff application, state preservation, refusal on
//! invalid configuration.

mod support;

use hangar_config::HangarConfig;
use hangar_core::provider::ProviderState;
use hangar_core::workers::ReloadHandler;
use hangar_core::{EventBus, HangarMetrics, Registry};
use hangar_types::HangarEvent;
use std::sync::Arc;
use support::{test_provider_config, MockLauncher};

fn config_with(ids: &[&str]) -> HangarConfig {
    let mut config = HangarConfig::default();
    for id in ids {
        config
            .providers
            .insert(id.to_string(), test_provider_config());
    }
    config
}

fn registry_for(config: &HangarConfig, launcher: Arc<MockLauncher>) -> Arc<Registry> {
    Registry::from_config(
        config,
        launcher,
        Arc::new(EventBus::new()),
        Arc::new(HangarMetrics::new()),
    )
    .unwrap()
}

#[tokio::test]
async fn unchanged_providers_keep_state_across_reload() {
    let config = config_with(&["x", "y", "z"]);
    let launcher = MockLauncher::new();
    let registry = registry_for(&config, launcher.clone());

    // Warm up y and z.
    registry.provider("y").unwrap().ensure_ready().await.unwrap();
    registry.provider("z").unwrap().ensure_ready().await.unwrap();

    // Modify only x's env.
    let mut new_config = config.clone();
    new_config
        .providers
        .get_mut("x")
        .unwrap()
        .env
        .insert("LOG_LEVEL".into(), "debug".into());

    let outcome = registry.apply_config(&new_config, true).await.unwrap();
    assert_eq!(outcome.diff.updated, vec!["x"]);
    assert_eq!(outcome.diff.unchanged, vec!["y", "z"]);
    assert!(outcome.diff.added.is_empty());
    assert!(outcome.diff.removed.is_empty());

    // x was replaced and is COLD; y and z kept their running state.
    assert_eq!(registry.provider("x").unwrap().state(), ProviderState::Cold);
    assert_eq!(registry.provider("y").unwrap().state(), ProviderState::Ready);
    assert_eq!(registry.provider("z").unwrap().state(), ProviderState::Ready);
}

#[tokio::test]
async fn reload_adds_and_removes_providers() {
    let config = config_with(&["a", "b"]);
    let launcher = MockLauncher::new();
    let registry = registry_for(&config, launcher.clone());

    registry.provider("a").unwrap().ensure_ready().await.unwrap();

    let new_config = config_with(&["b", "c"]);
    let outcome = registry.apply_config(&new_config, true).await.unwrap();
    assert_eq!(outcome.diff.added, vec!["c"]);
    assert_eq!(outcome.diff.removed, vec!["a"]);
    assert_eq!(outcome.diff.unchanged, vec!["b"]);

    assert!(registry.provider("a").is_none());
    assert_eq!(registry.provider("c").unwrap().state(), ProviderState::Cold);
}

#[tokio::test]
async fn noop_reload_preserves_counters() {
    let config = config_with(&["p"]);
    let launcher = MockLauncher::new();
    let registry = registry_for(&config, launcher.clone());

    let provider = registry.provider("p").unwrap();
    provider.ensure_ready().await.unwrap();
    let cancel = hangar_core::CancelToken::new();
    provider
        .invoke(
            "add",
            serde_json::json!({}),
            std::time::Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();
    let before = provider.health_snapshot();

    let outcome = registry.apply_config(&config, true).await.unwrap();
    assert!(outcome.diff.is_noop());

    // Same supervisor, same counters.
    let after = registry.provider("p").unwrap().health_snapshot();
    assert_eq!(after.total_invocations, before.total_invocations);
    assert_eq!(registry.provider("p").unwrap().state(), ProviderState::Ready);
    assert_eq!(launcher.launch_count(), 1);
}

#[tokio::test]
async fn reload_handler_applies_file_changes_and_emits_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hangar.yaml");

    let config = config_with(&["first"]);
    hangar_config::save_config(&config, &path).await.unwrap();

    let launcher = MockLauncher::new();
    let bus = Arc::new(EventBus::new());
    let registry = Registry::from_config(
        &config,
        launcher,
        bus.clone(),
        Arc::new(HangarMetrics::new()),
    )
    .unwrap();
    let handler = ReloadHandler::new(path.clone(), registry.clone(), bus.clone());
    let mut events = bus.subscribe();

    // Write an updated config with one more provider.
    let new_config = config_with(&["first", "second"]);
    hangar_config::save_config(&new_config, &path).await.unwrap();

    let outcome = handler.reload(true, "test").await.unwrap();
    assert_eq!(outcome.diff.added, vec!["second"]);
    assert!(registry.provider_exists("second"));

    // Requested then completed events, in order.
    let requested = events.recv().await.unwrap();
    assert_eq!(requested.name(), "configuration_reload_requested");
    let completed = loop {
        let event = events.recv().await.unwrap();
        if event.name() == "configuration_reloaded" {
            break event;
        }
    };
    match completed {
        HangarEvent::ConfigurationReloaded {
            providers_added,
            providers_unchanged,
            ..
        } => {
            assert_eq!(providers_added, vec!["second"]);
            assert_eq!(providers_unchanged, vec!["first"]);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn invalid_config_is_refused_and_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hangar.yaml");

    let config = config_with(&["stable"]);
    hangar_config::save_config(&config, &path).await.unwrap();

    let launcher = MockLauncher::new();
    let bus = Arc::new(EventBus::new());
    let registry = Registry::from_config(
        &config,
        launcher,
        bus.clone(),
        Arc::new(HangarMetrics::new()),
    )
    .unwrap();
    registry
        .provider("stable")
        .unwrap()
        .ensure_ready()
        .await
        .unwrap();

    let handler = ReloadHandler::new(path.clone(), registry.clone(), bus.clone());
    let mut events = bus.subscribe();

    // Corrupt the file.
    tokio::fs::write(&path, "providers: [broken").await.unwrap();
    let result = handler.reload(true, "test").await;
    assert!(result.is_err());

    // The running provider is untouched.
    assert_eq!(
        registry.provider("stable").unwrap().state(),
        ProviderState::Ready
    );

    // A reload_failed event was emitted.
    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if event.name() == "configuration_reload_failed" {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}
