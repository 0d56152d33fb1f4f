//! Domain events published on the hangar event bus.
//!
//! Events capture lifecycle and invocation occurrences so that listeners
//! (logging, audit, metrics aggregation) can react without being wired into
//! the hot path. Delivery is best-effort: slow listeners lag and drop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn now() -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::now()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HangarEvent {
    ProviderStarted {
        #[serde(flatten)]
        meta: EventMeta,
        provider_id: String,
        mode: String,
        tools_count: usize,
        startup_duration_ms: u64,
    },
    ProviderStopped {
        #[serde(flatten)]
        meta: EventMeta,
        provider_id: String,
        /// "shutdown", "idle", "error", "degraded", "config_reload"
        reason: String,
    },
    ProviderStateChanged {
        #[serde(flatten)]
        meta: EventMeta,
        provider_id: String,
        old_state: String,
        new_state: String,
    },
    ProviderDegraded {
        #[serde(flatten)]
        meta: EventMeta,
        provider_id: String,
        consecutive_failures: u32,
        total_failures: u64,
        reason: String,
    },
    ToolInvocationCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        provider_id: String,
        tool_name: String,
        correlation_id: String,
        duration_ms: u64,
        result_size_bytes: usize,
    },
    ToolInvocationFailed {
        #[serde(flatten)]
        meta: EventMeta,
        provider_id: String,
        tool_name: String,
        correlation_id: String,
        error_kind: String,
        error_message: String,
    },
    HealthCheckPassed {
        #[serde(flatten)]
        meta: EventMeta,
        provider_id: String,
        duration_ms: u64,
    },
    HealthCheckFailed {
        #[serde(flatten)]
        meta: EventMeta,
        provider_id: String,
        consecutive_failures: u32,
        error_message: String,
    },
    ProviderIdleDetected {
        #[serde(flatten)]
        meta: EventMeta,
        provider_id: String,
        idle_duration_s: f64,
    },
    GroupMemberRemovedFromRotation {
        #[serde(flatten)]
        meta: EventMeta,
        group_id: String,
        provider_id: String,
        consecutive_failures: u32,
    },
    GroupMemberReturnedToRotation {
        #[serde(flatten)]
        meta: EventMeta,
        group_id: String,
        provider_id: String,
    },
    GroupCircuitOpened {
        #[serde(flatten)]
        meta: EventMeta,
        group_id: String,
        failure_count: u32,
    },
    GroupCircuitClosed {
        #[serde(flatten)]
        meta: EventMeta,
        group_id: String,
    },
    BatchCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        batch_id: String,
        total: usize,
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
    },
    ConfigurationReloadRequested {
        #[serde(flatten)]
        meta: EventMeta,
        config_path: String,
        requested_by: String,
    },
    ConfigurationReloaded {
        #[serde(flatten)]
        meta: EventMeta,
        config_path: String,
        providers_added: Vec<String>,
        providers_removed: Vec<String>,
        providers_updated: Vec<String>,
        providers_unchanged: Vec<String>,
        reload_duration_ms: u64,
        requested_by: String,
    },
    ConfigurationReloadFailed {
        #[serde(flatten)]
        meta: EventMeta,
        config_path: String,
        reason: String,
        requested_by: String,
    },
}

impl HangarEvent {
    /// Short name used for logging and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            HangarEvent::ProviderStarted { .. } => "provider_started",
            HangarEvent::ProviderStopped { .. } => "provider_stopped",
            HangarEvent::ProviderStateChanged { .. } => "provider_state_changed",
            HangarEvent::ProviderDegraded { .. } => "provider_degraded",
            HangarEvent::ToolInvocationCompleted { .. } => "tool_invocation_completed",
            HangarEvent::ToolInvocationFailed { .. } => "tool_invocation_failed",
            HangarEvent::HealthCheckPassed { .. } => "health_check_passed",
            HangarEvent::HealthCheckFailed { .. } => "health_check_failed",
            HangarEvent::ProviderIdleDetected { .. } => "provider_idle_detected",
            HangarEvent::GroupMemberRemovedFromRotation { .. } => {
                "group_member_removed_from_rotation"
            }
            HangarEvent::GroupMemberReturnedToRotation { .. } => {
                "group_member_returned_to_rotation"
            }
            HangarEvent::GroupCircuitOpened { .. } => "group_circuit_opened",
            HangarEvent::GroupCircuitClosed { .. } => "group_circuit_closed",
            HangarEvent::BatchCompleted { .. } => "batch_completed",
            HangarEvent::ConfigurationReloadRequested { .. } => "configuration_reload_requested",
            HangarEvent::ConfigurationReloaded { .. } => "configuration_reloaded",
            HangarEvent::ConfigurationReloadFailed { .. } => "configuration_reload_failed",
        }
    }
}
