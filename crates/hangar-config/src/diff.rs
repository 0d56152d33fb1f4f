//! Provider diffing for hot reload.
//!
//! Classifies each provider id as added, removed, updated or unchanged by
//! comparing only launch-affecting fields. A change to a description or a
//! predefined tool schema does not force a restart.

use std::collections::BTreeMap;

use crate::types::ProviderConfig;

/// Result of diffing two provider maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ConfigDiff {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Whether two provider configurations differ in a launch-affecting way.
///
/// Compared fields: mode, command, image, endpoint, auth, tls, env, volumes,
/// network, resources, read_only, user, idle_ttl_s, health_check_interval_s,
/// max_consecutive_failures, backoff_cap_s. Empty collections and defaults
/// are already normalized by serde at parse time, so field equality is exact.
pub fn provider_config_differs(old: &ProviderConfig, new: &ProviderConfig) -> bool {
    old.mode != new.mode
        || old.command != new.command
        || old.image != new.image
        || old.endpoint != new.endpoint
        || old.auth != new.auth
        || old.tls != new.tls
        || old.env != new.env
        || old.volumes != new.volumes
        || old.network != new.network
        || old.resources != new.resources
        || old.read_only != new.read_only
        || old.user != new.user
        || old.idle_ttl_s != new.idle_ttl_s
        || old.health_check_interval_s != new.health_check_interval_s
        || old.max_consecutive_failures != new.max_consecutive_failures
        || old.backoff_cap_s != new.backoff_cap_s
}

/// Diff two provider maps by id.
pub fn diff_providers(
    old: &BTreeMap<String, ProviderConfig>,
    new: &BTreeMap<String, ProviderConfig>,
) -> ConfigDiff {
    let mut diff = ConfigDiff::default();

    for id in new.keys() {
        if !old.contains_key(id) {
            diff.added.push(id.clone());
        }
    }

    for (id, old_config) in old {
        match new.get(id) {
            None => diff.removed.push(id.clone()),
            Some(new_config) => {
                if provider_config_differs(old_config, new_config) {
                    diff.updated.push(id.clone());
                } else {
                    diff.unchanged.push(id.clone());
                }
            }
        }
    }

    diff
}
