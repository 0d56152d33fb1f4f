//! Process-wide provider and group registry.
//!
//! Maps provider ids to supervisors and group ids to routers. Writes occur
//! only at startup, hot reload and shutdown; everything else is reads.
//! Tests construct isolated registries with their own launcher.

use dashmap::DashMap;
use hangar_config::{diff_providers, ConfigDiff, GroupConfig, HangarConfig, ProviderConfig};
use hangar_types::{GroupId, HangarError, HangarResult, ProviderId};
use std::sync::Arc;
use std::time::Instant;

use crate::bus::EventBus;
use crate::group::{GroupDetails, ProviderGroup};
use crate::launcher::TransportLauncher;
use crate::metrics::HangarMetrics;
use crate::provider::{ProviderDetails, ProviderState, ProviderSupervisor};

pub struct Registry {
    providers: DashMap<String, Arc<ProviderSupervisor>>,
    groups: DashMap<String, Arc<ProviderGroup>>,
    /// Provider configs as last applied, for reload diffing.
    configs: parking_lot::Mutex<std::collections::BTreeMap<String, ProviderConfig>>,
    launcher: Arc<dyn TransportLauncher>,
    bus: Arc<EventBus>,
    metrics: Arc<HangarMetrics>,
}

/// Result of applying a new configuration.
#[derive(Debug, Clone)]
pub struct ReloadOutcome {
    pub diff: ConfigDiff,
    pub duration_ms: u64,
}

impl Registry {
    /// Build a registry from a validated configuration.
    pub fn from_config(
        config: &HangarConfig,
        launcher: Arc<dyn TransportLauncher>,
        bus: Arc<EventBus>,
        metrics: Arc<HangarMetrics>,
    ) -> HangarResult<Arc<Self>> {
        let registry = Arc::new(Self {
            providers: DashMap::new(),
            groups: DashMap::new(),
            configs: parking_lot::Mutex::new(std::collections::BTreeMap::new()),
            launcher,
            bus,
            metrics,
        });

        for (id, provider_config) in &config.providers {
            registry.register_provider(id, provider_config.clone())?;
        }
        registry.rebuild_groups(&config.groups)?;
        *registry.configs.lock() = config.providers.clone();

        Ok(registry)
    }

    fn register_provider(&self, id: &str, config: ProviderConfig) -> HangarResult<()> {
        let provider_id = ProviderId::new(id)?;
        let supervisor = ProviderSupervisor::with_launcher(
            provider_id,
            config,
            self.launcher.clone(),
            self.bus.clone(),
            self.metrics.clone(),
        );
        self.providers.insert(id.to_string(), supervisor);
        Ok(())
    }

    /// Tear down and rebuild all groups against current supervisors.
    ///
    /// Group routers hold no transport state, so rebuilding them is cheap
    /// and does not disturb member providers.
    fn rebuild_groups(
        &self,
        groups: &std::collections::BTreeMap<String, GroupConfig>,
    ) -> HangarResult<()> {
        self.groups.clear();
        for (id, group_config) in groups {
            let group_id = GroupId::new(id.clone())?;
            let mut members = Vec::with_capacity(group_config.members.len());
            for member in &group_config.members {
                let supervisor = self
                    .providers
                    .get(&member.provider)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| {
                        HangarError::Configuration(format!(
                            "group {id}: unknown member provider {:?}",
                            member.provider
                        ))
                    })?;
                members.push((supervisor, member.weight, member.priority));
            }
            let group = ProviderGroup::new(
                group_id,
                group_config.clone(),
                members,
                self.bus.clone(),
                self.metrics.clone(),
            );
            self.groups.insert(id.clone(), group);
        }
        Ok(())
    }

    // ---- lookup ----

    pub fn provider(&self, id: &str) -> Option<Arc<ProviderSupervisor>> {
        self.providers.get(id).map(|entry| entry.value().clone())
    }

    pub fn group(&self, id: &str) -> Option<Arc<ProviderGroup>> {
        self.groups.get(id).map(|entry| entry.value().clone())
    }

    pub fn provider_exists(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    pub fn group_exists(&self, id: &str) -> bool {
        self.groups.contains_key(id)
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all_providers(&self) -> Vec<Arc<ProviderSupervisor>> {
        self.providers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn all_groups(&self) -> Vec<Arc<ProviderGroup>> {
        self.groups.iter().map(|e| e.value().clone()).collect()
    }

    // ---- queries ----

    pub fn list_providers(&self, state_filter: Option<ProviderState>) -> Vec<ProviderDetails> {
        let mut details: Vec<ProviderDetails> = self
            .providers
            .iter()
            .map(|entry| entry.value().details())
            .filter(|d| state_filter.map(|s| d.state == s).unwrap_or(true))
            .collect();
        details.sort_by(|a, b| a.provider.cmp(&b.provider));
        details
    }

    pub fn list_groups(&self) -> Vec<GroupDetails> {
        let mut details: Vec<GroupDetails> = self
            .groups
            .iter()
            .map(|entry| entry.value().details())
            .collect();
        details.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        details
    }

    /// `(provider_id, state)` pairs for the metrics exposition.
    pub fn provider_states(&self) -> Vec<(String, String)> {
        self.providers
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().state().as_str().to_string(),
                )
            })
            .collect()
    }

    // ---- lifecycle ----

    /// Apply a new configuration: added providers register COLD, removed
    /// ones shut down and deregister, modified ones are replaced, and
    /// unchanged providers keep their state and connections.
    pub async fn apply_config(
        &self,
        new_config: &HangarConfig,
        graceful: bool,
    ) -> HangarResult<ReloadOutcome> {
        let started = Instant::now();
        let old_configs = self.configs.lock().clone();
        let diff = diff_providers(&old_configs, &new_config.providers);

        tracing::info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            updated = diff.updated.len(),
            unchanged = diff.unchanged.len(),
            "applying configuration"
        );

        // Stop removed and modified providers first.
        let reason = if graceful { "config_reload" } else { "config_reload_forced" };
        for id in diff.removed.iter().chain(diff.updated.iter()) {
            if let Some(provider) = self.provider(id) {
                provider.shutdown(reason).await;
            }
        }

        for id in &diff.removed {
            self.providers.remove(id);
        }

        // Replace modified supervisors and register added ones, all COLD.
        for id in diff.updated.iter().chain(diff.added.iter()) {
            let config = new_config
                .providers
                .get(id)
                .expect("diff ids come from the new config")
                .clone();
            self.register_provider(id, config)?;
        }

        self.rebuild_groups(&new_config.groups)?;
        *self.configs.lock() = new_config.providers.clone();

        Ok(ReloadOutcome {
            diff,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Stop every provider. Used at process exit.
    pub async fn shutdown_all(&self, reason: &str) {
        for provider in self.all_providers() {
            provider.shutdown(reason).await;
        }
    }
}
