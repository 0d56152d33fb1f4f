//! Background supervisors.
//!
//! Three long-running jobs mutate provider state through the same
//! serialised lifecycle operations the tools use: the idle GC, the active
//! health prober, and the configuration reload worker (filesystem
//! notifications with a polling fallback).

use hangar_config::{storage, ReloadConfig};
use hangar_types::events::EventMeta;
use hangar_types::{HangarEvent, HangarResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::cancel::CancelToken;
use crate::registry::{Registry, ReloadOutcome};

const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_PROBE_TICK: Duration = Duration::from_secs(10);
const WATCH_DEBOUNCE: Duration = Duration::from_secs(1);

/// Applies a configuration file to a running registry.
///
/// Shared by the file watcher, SIGHUP and the `reload_config` tool. A
/// parse or validation failure leaves the running state untouched.
pub struct ReloadHandler {
    config_path: PathBuf,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
}

impl ReloadHandler {
    pub fn new(config_path: PathBuf, registry: Arc<Registry>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config_path,
            registry,
            bus,
        })
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    pub async fn reload(&self, graceful: bool, requested_by: &str) -> HangarResult<ReloadOutcome> {
        let path_str = self.config_path.display().to_string();
        self.bus.publish(HangarEvent::ConfigurationReloadRequested {
            meta: EventMeta::now(),
            config_path: path_str.clone(),
            requested_by: requested_by.to_string(),
        });

        let new_config = match storage::load_config(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "configuration reload refused");
                self.bus.publish(HangarEvent::ConfigurationReloadFailed {
                    meta: EventMeta::now(),
                    config_path: path_str,
                    reason: e.to_string(),
                    requested_by: requested_by.to_string(),
                });
                return Err(e);
            }
        };

        let outcome = match self.registry.apply_config(&new_config, graceful).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.bus.publish(HangarEvent::ConfigurationReloadFailed {
                    meta: EventMeta::now(),
                    config_path: path_str,
                    reason: e.to_string(),
                    requested_by: requested_by.to_string(),
                });
                return Err(e);
            }
        };

        self.bus.publish(HangarEvent::ConfigurationReloaded {
            meta: EventMeta::now(),
            config_path: path_str,
            providers_added: outcome.diff.added.clone(),
            providers_removed: outcome.diff.removed.clone(),
            providers_updated: outcome.diff.updated.clone(),
            providers_unchanged: outcome.diff.unchanged.clone(),
            reload_duration_ms: outcome.duration_ms,
            requested_by: requested_by.to_string(),
        });

        Ok(outcome)
    }
}

/// Owner of the background tasks; stopping cancels and joins them all.
pub struct BackgroundWorkers {
    shutdown: CancelToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundWorkers {
    pub fn new() -> Self {
        Self {
            shutdown: CancelToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Idle GC: shut down READY providers whose last use is older than
    /// their TTL. The shutdown itself takes the lifecycle lock, so a
    /// provider that is invoked concurrently is left alone.
    pub fn spawn_idle_gc(&self, registry: Arc<Registry>, interval: Option<Duration>) {
        let interval = interval.unwrap_or(DEFAULT_GC_INTERVAL);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tracing::info!(interval_s = interval.as_secs(), "idle GC worker started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                for provider in registry.all_providers() {
                    if provider.maybe_shutdown_idle().await {
                        tracing::info!(provider = %provider.id(), "idle provider collected");
                    }
                }
            }
            tracing::info!("idle GC worker stopped");
        });
        self.handles.lock().push(handle);
    }

    /// Active health prober: `tools/list` against every READY provider
    /// whose probe interval has elapsed.
    pub fn spawn_health_prober(&self, registry: Arc<Registry>, tick: Option<Duration>) {
        let tick = tick.unwrap_or(DEFAULT_PROBE_TICK);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tracing::info!(tick_s = tick.as_secs(), "health prober started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.cancelled() => break,
                }
                for provider in registry.all_providers() {
                    if provider.needs_health_check() {
                        let healthy = provider.health_check().await;
                        if !healthy {
                            tracing::warn!(provider = %provider.id(), "health probe failed");
                        }
                    }
                }
            }
            tracing::info!("health prober stopped");
        });
        self.handles.lock().push(handle);
    }

    /// Configuration reload worker.
    ///
    /// Prefers filesystem notifications (debounced, editors save several
    /// times in a row); falls back to mtime polling when the watcher
    /// cannot be created or `use_watchdog` is off.
    pub fn spawn_config_watcher(&self, handler: Arc<ReloadHandler>, config: ReloadConfig) {
        if !config.enabled {
            tracing::info!("config reload worker disabled");
            return;
        }

        let shutdown = self.shutdown.clone();
        let interval = Duration::from_secs(config.interval_s.max(1));
        let use_watchdog = config.use_watchdog;

        let handle = tokio::spawn(async move {
            let watcher = if use_watchdog {
                start_notify_watcher(&handler)
            } else {
                None
            };

            match watcher {
                Some((watcher, mut rx)) => {
                    tracing::info!(path = %handler.config_path().display(), "config watcher started (notify)");
                    // Keep the watcher alive for the lifetime of the task.
                    let _watcher = watcher;
                    loop {
                        tokio::select! {
                            changed = rx.recv() => {
                                if changed.is_none() {
                                    break;
                                }
                                // Debounce bursts of modify events.
                                tokio::time::sleep(WATCH_DEBOUNCE).await;
                                while rx.try_recv().is_ok() {}
                                if let Err(e) = handler.reload(true, "file_watcher").await {
                                    tracing::warn!(error = %e, "watched reload failed");
                                }
                            }
                            _ = shutdown.cancelled() => break,
                        }
                    }
                }
                None => {
                    tracing::info!(
                        path = %handler.config_path().display(),
                        interval_s = interval.as_secs(),
                        "config watcher started (polling)"
                    );
                    let mut last_mtime = file_mtime(handler.config_path());
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {}
                            _ = shutdown.cancelled() => break,
                        }
                        let mtime = file_mtime(handler.config_path());
                        if mtime.is_some() && mtime != last_mtime {
                            last_mtime = mtime;
                            if let Err(e) = handler.reload(true, "file_watcher").await {
                                tracing::warn!(error = %e, "polled reload failed");
                            }
                        }
                    }
                }
            }
            tracing::info!("config watcher stopped");
        });
        self.handles.lock().push(handle);
    }

    /// Cancel all workers and wait for them to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for BackgroundWorkers {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a notify watcher feeding change signals into a channel.
fn start_notify_watcher(
    handler: &Arc<ReloadHandler>,
) -> Option<(RecommendedWatcher, tokio::sync::mpsc::UnboundedReceiver<()>)> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let config_path = handler.config_path().clone();

    let mut watcher = match notify::recommended_watcher(
        move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "file watch error"),
        },
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create file watcher, falling back to polling");
            return None;
        }
    };

    // Watch the parent directory: editors replace files on save, which a
    // file-level watch can lose.
    let watch_target = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or(config_path);
    if let Err(e) = watcher.watch(&watch_target, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, "failed to watch config path, falling back to polling");
        return None;
    }

    Some((watcher, rx))
}

fn file_mtime(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_without_workers_is_clean() {
        let workers = BackgroundWorkers::new();
        workers.stop().await;
    }

    #[tokio::test]
    async fn test_stop_joins_spawned_workers() {
        let workers = BackgroundWorkers::new();
        let shutdown = workers.shutdown.clone();
        let handle = tokio::spawn(async move {
            shutdown.cancelled().await;
        });
        workers.handles.lock().push(handle);
        tokio::time::timeout(Duration::from_secs(1), workers.stop())
            .await
            .expect("workers must stop promptly");
    }
}
