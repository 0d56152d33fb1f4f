//! Provider supervision.
//!
//! One supervisor per configured provider. Owns the lifecycle state
//! machine (COLD → INITIALIZING → READY → DEGRADED/DEAD), launches and
//! buries the transport, and keeps the health counters honest. Lifecycle
//! transitions are serialised by a per-provider async lock; invocations
//! run concurrently against a READY provider and never hold that lock
//! across I/O.

use chrono::{DateTime, Utc};
use hangar_config::{ProviderConfig, ProviderMode};
use hangar_types::events::EventMeta;
use hangar_types::wire::McpTool;
use hangar_types::{HangarError, HangarEvent, HangarResult, ProviderId, RpcOutcome};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::cancel::CancelToken;
use crate::health::{HealthSnapshot, HealthTracker};
use crate::launcher::{self, TransportLauncher};
use crate::metrics::HangarMetrics;
use crate::singleflight::SingleFlight;
use crate::transport::{StdioTransport, Transport};

/// Timeout for the `initialize` / initial `tools/list` handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for active health probes.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle states of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Cold,
    Initializing,
    Ready,
    Degraded,
    Dead,
}

impl ProviderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderState::Cold => "cold",
            ProviderState::Initializing => "initializing",
            ProviderState::Ready => "ready",
            ProviderState::Degraded => "degraded",
            ProviderState::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cold" => Some(ProviderState::Cold),
            "initializing" => Some(ProviderState::Initializing),
            "ready" => Some(ProviderState::Ready),
            "degraded" => Some(ProviderState::Degraded),
            "dead" => Some(ProviderState::Dead),
            _ => None,
        }
    }
}

/// Data mutated only under the lifecycle lock.
struct Lifecycle {
    backoff_until: Option<Instant>,
}

/// Read-only snapshot for `details` / `list`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDetails {
    pub provider: String,
    pub state: ProviderState,
    pub mode: &'static str,
    pub alive: bool,
    pub tools_count: usize,
    pub tools: Vec<String>,
    pub tools_predefined: bool,
    /// "healthy", "unhealthy" or "unknown".
    pub health_status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_ago_s: Option<f64>,
    pub health: HealthSnapshot,
}

pub struct ProviderSupervisor {
    id: ProviderId,
    config: ProviderConfig,
    launcher: Arc<dyn TransportLauncher>,

    /// Serialises all lifecycle transitions.
    lifecycle: AsyncMutex<Lifecycle>,

    /// State mirror for lock-free snapshots; written under the lifecycle lock.
    state: RwLock<ProviderState>,

    /// Transport mirror; written under the lifecycle lock, read anywhere.
    transport: RwLock<Option<Arc<dyn Transport>>>,

    /// Concrete stdio handle for diagnostics, when the mode has one.
    stdio: RwLock<Option<Arc<StdioTransport>>>,

    /// Tool-schema cache. Predefined entries are authoritative; discovery
    /// adds new names.
    tools: RwLock<BTreeMap<String, McpTool>>,

    health: Mutex<HealthTracker>,

    last_used: Mutex<Option<(Instant, DateTime<Utc>)>>,
    last_health_check: Mutex<Option<Instant>>,

    ensure_flight: SingleFlight<u8, Result<(), Arc<HangarError>>>,

    bus: Arc<EventBus>,
    metrics: Arc<HangarMetrics>,
}

impl ProviderSupervisor {
    /// Build a supervisor with the default mode-dispatching launcher.
    pub fn new(
        id: ProviderId,
        config: ProviderConfig,
        container_runtime: Option<String>,
        bus: Arc<EventBus>,
        metrics: Arc<HangarMetrics>,
    ) -> Arc<Self> {
        Self::with_launcher(
            id,
            config,
            Arc::new(launcher::ModeLauncher { container_runtime }),
            bus,
            metrics,
        )
    }

    /// Build a supervisor with a custom transport launcher.
    pub fn with_launcher(
        id: ProviderId,
        config: ProviderConfig,
        launcher: Arc<dyn TransportLauncher>,
        bus: Arc<EventBus>,
        metrics: Arc<HangarMetrics>,
    ) -> Arc<Self> {
        let mut tools = BTreeMap::new();
        for tool in &config.tools {
            tools.insert(tool.name.clone(), tool.clone());
        }

        let health = HealthTracker::new(
            config.max_consecutive_failures,
            Duration::from_secs(config.backoff_cap_s),
        );

        Arc::new(Self {
            id,
            config,
            launcher,
            lifecycle: AsyncMutex::new(Lifecycle {
                backoff_until: None,
            }),
            state: RwLock::new(ProviderState::Cold),
            transport: RwLock::new(None),
            stdio: RwLock::new(None),
            tools: RwLock::new(tools),
            health: Mutex::new(health),
            last_used: Mutex::new(None),
            last_health_check: Mutex::new(None),
            ensure_flight: SingleFlight::new(),
            bus,
            metrics,
        })
    }

    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn state(&self) -> ProviderState {
        *self.state.read()
    }

    pub fn mode(&self) -> ProviderMode {
        self.config.mode
    }

    /// Whether the predefined tool set makes tool names checkable upfront.
    pub fn tools_predefined(&self) -> bool {
        !self.config.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    pub fn tools(&self) -> Vec<McpTool> {
        self.tools.read().values().cloned().collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Whether the underlying channel is currently believed alive.
    pub fn is_alive(&self) -> bool {
        self.transport
            .read()
            .as_ref()
            .map(|t| t.is_alive())
            .unwrap_or(false)
    }

    fn set_state(&self, new: ProviderState) {
        let old = {
            let mut state = self.state.write();
            let old = *state;
            *state = new;
            old
        };
        if old != new {
            tracing::info!(provider = %self.id, from = old.as_str(), to = new.as_str(), "state transition");
            self.bus.publish(HangarEvent::ProviderStateChanged {
                meta: EventMeta::now(),
                provider_id: self.id.to_string(),
                old_state: old.as_str().to_string(),
                new_state: new.as_str().to_string(),
            });
        }
    }

    fn touch_last_used(&self) {
        *self.last_used.lock() = Some((Instant::now(), Utc::now()));
    }

    /// Seconds since last use, if the provider has been used.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_used.lock().as_ref().map(|(at, _)| at.elapsed())
    }

    /// Whether the active prober should probe this provider now.
    pub fn needs_health_check(&self) -> bool {
        if self.state() != ProviderState::Ready {
            return false;
        }
        let interval = Duration::from_secs(self.config.health_check_interval_s);
        match *self.last_health_check.lock() {
            None => true,
            Some(at) => at.elapsed() >= interval,
        }
    }

    // ---- lifecycle ----

    /// Advance the provider to READY, launching it if necessary.
    ///
    /// Safe to call concurrently: all callers rendezvous on a single
    /// launch attempt and share its outcome.
    pub async fn ensure_ready(&self) -> HangarResult<()> {
        let result = self
            .ensure_flight
            .run(0, || async { self.do_ensure_ready().await.map_err(Arc::new) })
            .await;
        result.map_err(|e| e.duplicate())
    }

    async fn do_ensure_ready(&self) -> HangarResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;

        loop {
            match self.state() {
                ProviderState::Ready => {
                    if self.is_alive() {
                        return Ok(());
                    }
                    // Underlying process died between calls.
                    tracing::warn!(provider = %self.id, "process death observed, will relaunch");
                    self.set_state(ProviderState::Dead);
                }
                ProviderState::Degraded => {
                    if let Some(until) = lifecycle.backoff_until {
                        if Instant::now() < until {
                            let remaining = until.saturating_duration_since(Instant::now());
                            return Err(HangarError::Degraded {
                                provider: self.id.to_string(),
                                backoff_remaining_s: remaining.as_secs_f64(),
                            });
                        }
                    }
                    // Backoff elapsed: bury the old transport and retry.
                    lifecycle.backoff_until = None;
                    self.close_transport().await;
                    self.set_state(ProviderState::Cold);
                }
                ProviderState::Dead => {
                    self.close_transport().await;
                    self.set_state(ProviderState::Cold);
                }
                ProviderState::Cold => break,
                ProviderState::Initializing => {
                    // Single-flight plus the lifecycle lock make this
                    // unreachable; bail rather than spin.
                    return Err(HangarError::Internal(format!(
                        "{} stuck in initializing",
                        self.id
                    )));
                }
            }
        }

        self.launch_locked(&mut lifecycle).await
    }

    async fn launch_locked(&self, _lifecycle: &mut Lifecycle) -> HangarResult<()> {
        self.set_state(ProviderState::Initializing);
        let started = Instant::now();

        let launched = match self.launcher.launch(&self.config).await {
            Ok(launched) => launched,
            Err(e) => {
                self.set_state(ProviderState::Dead);
                self.health.lock().record_failure();
                return Err(HangarError::LaunchFailed {
                    provider: self.id.to_string(),
                    message: e.to_string(),
                    stderr_tail: None,
                    exit_code: None,
                    suggestion: None,
                });
            }
        };

        let cancel = CancelToken::new();

        let init_params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "mcp-hangar",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        if let Err(e) = self
            .handshake_call(&launched, "initialize", Some(init_params), &cancel)
            .await
        {
            return Err(e);
        }

        let tools_result = match self
            .handshake_call(&launched, "tools/list", None, &cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => return Err(e),
        };

        let discovered = parse_tool_list(&tools_result);
        let tools_count = {
            let mut tools = self.tools.write();
            for tool in discovered {
                // Predefined schemas win; discovery only adds new names.
                tools.entry(tool.name.clone()).or_insert(tool);
            }
            tools.len()
        };

        *self.transport.write() = Some(launched.transport.clone());
        *self.stdio.write() = launched.stdio.clone();
        self.set_state(ProviderState::Ready);
        self.health.lock().record_probe_success();
        self.touch_last_used();
        *self.last_health_check.lock() = Some(Instant::now());

        let startup_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_cold_start(self.id.as_str());
        self.bus.publish(HangarEvent::ProviderStarted {
            meta: EventMeta::now(),
            provider_id: self.id.to_string(),
            mode: self.config.mode.as_str().to_string(),
            tools_count,
            startup_duration_ms: startup_ms,
        });
        tracing::info!(provider = %self.id, tools = tools_count, startup_ms, "provider ready");

        Ok(())
    }

    /// One handshake RPC with launch-failure diagnostics on any error.
    async fn handshake_call(
        &self,
        launched: &launcher::Launched,
        method: &str,
        params: Option<Value>,
        cancel: &CancelToken,
    ) -> HangarResult<Value> {
        let failed = |message: String| {
            let (stderr_tail, exit_code) = match &launched.stdio {
                Some(stdio) => {
                    let tail = stdio.stderr_tail();
                    let tail = if tail.is_empty() { None } else { Some(tail) };
                    (tail, stdio.exit_code())
                }
                None => (None, None),
            };
            let suggestion =
                launcher::diagnose_failure(stderr_tail.as_deref().unwrap_or(""), exit_code);
            HangarError::LaunchFailed {
                provider: self.id.to_string(),
                message,
                stderr_tail,
                exit_code,
                suggestion,
            }
        };

        let outcome = launched
            .transport
            .call(method, params, HANDSHAKE_TIMEOUT, cancel)
            .await;

        match outcome {
            Ok(RpcOutcome::Success(value)) => Ok(value),
            Ok(RpcOutcome::Failure(failure)) => {
                launched.transport.close().await;
                self.set_state(ProviderState::Dead);
                self.health.lock().record_failure();
                Err(failed(format!(
                    "{method} rejected: {} (code {})",
                    failure.message, failure.code
                )))
            }
            Err(e) => {
                launched.transport.close().await;
                self.set_state(ProviderState::Dead);
                self.health.lock().record_failure();
                Err(failed(format!("{method} failed: {e}")))
            }
        }
    }

    /// Stop the provider and bury its transport. Idempotent.
    pub async fn shutdown(&self, reason: &str) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.shutdown_locked(&mut lifecycle, reason).await;
    }

    async fn shutdown_locked(&self, lifecycle: &mut Lifecycle, reason: &str) {
        if self.state() == ProviderState::Cold {
            return;
        }

        self.close_transport().await;
        lifecycle.backoff_until = None;

        // Discovered tools die with the transport; predefined schemas stay.
        {
            let mut tools = self.tools.write();
            tools.clear();
            for tool in &self.config.tools {
                tools.insert(tool.name.clone(), tool.clone());
            }
        }

        self.set_state(ProviderState::Cold);
        self.bus.publish(HangarEvent::ProviderStopped {
            meta: EventMeta::now(),
            provider_id: self.id.to_string(),
            reason: reason.to_string(),
        });
        tracing::info!(provider = %self.id, reason, "provider stopped");
    }

    async fn close_transport(&self) {
        let transport = self.transport.write().take();
        *self.stdio.write() = None;
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    /// Shut down if idle past the TTL.
    ///
    /// Takes the lifecycle lock, so it cannot race a concurrent start; a
    /// provider that transitioned away from READY in the meantime is left
    /// alone.
    pub async fn maybe_shutdown_idle(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() != ProviderState::Ready {
            return false;
        }
        let idle = match self.idle_for() {
            Some(idle) => idle,
            None => return false,
        };
        if idle < Duration::from_secs(self.config.idle_ttl_s) {
            return false;
        }

        self.bus.publish(HangarEvent::ProviderIdleDetected {
            meta: EventMeta::now(),
            provider_id: self.id.to_string(),
            idle_duration_s: idle.as_secs_f64(),
        });
        self.shutdown_locked(&mut lifecycle, "idle").await;
        true
    }

    // ---- invocation ----

    /// Invoke a tool. The provider is brought to READY first; counters and
    /// state transitions are updated from the outcome.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> HangarResult<Value> {
        hangar_types::ids::validate_tool_name(tool)?;

        // With a predefined schema the tool set is authoritative before
        // the provider is even started.
        if self.tools_predefined() && !self.has_tool(tool) {
            return Err(HangarError::ToolNotFound {
                provider: self.id.to_string(),
                tool: tool.to_string(),
            });
        }

        self.ensure_ready().await?;

        let transport = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| HangarError::Transport("provider stopped concurrently".into()))?;

        // Discovery may know tools the predefined set did not.
        if !self.tools_predefined() && !self.tools.read().is_empty() && !self.has_tool(tool) {
            return Err(HangarError::ToolNotFound {
                provider: self.id.to_string(),
                tool: tool.to_string(),
            });
        }

        let correlation_id = Uuid::new_v4().to_string();
        let params = json!({ "name": tool, "arguments": arguments });
        let started = Instant::now();

        // The lifecycle lock is not held across this await.
        let outcome = transport
            .call("tools/call", Some(params), timeout, cancel)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(outcome) => self.handle_outcome(tool, &correlation_id, outcome, elapsed_ms),
            Err(e) => {
                self.record_infra_failure(&e).await;
                self.metrics
                    .record_invocation(self.id.as_str(), tool, e.kind().as_str(), elapsed_ms);
                self.bus.publish(HangarEvent::ToolInvocationFailed {
                    meta: EventMeta::now(),
                    provider_id: self.id.to_string(),
                    tool_name: tool.to_string(),
                    correlation_id,
                    error_kind: e.kind().as_str().to_string(),
                    error_message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn handle_outcome(
        &self,
        tool: &str,
        correlation_id: &str,
        outcome: RpcOutcome,
        elapsed_ms: u64,
    ) -> HangarResult<Value> {
        // An error object from the provider is a tool-domain failure:
        // passed through, never counted against health.
        let result = match outcome {
            RpcOutcome::Failure(failure) => {
                self.health.lock().record_invocation_failure();
                self.metrics
                    .record_invocation(self.id.as_str(), tool, "tool_error", elapsed_ms);
                self.bus.publish(HangarEvent::ToolInvocationFailed {
                    meta: EventMeta::now(),
                    provider_id: self.id.to_string(),
                    tool_name: tool.to_string(),
                    correlation_id: correlation_id.to_string(),
                    error_kind: "tool_error".to_string(),
                    error_message: failure.message.clone(),
                });
                return Err(HangarError::ToolError {
                    message: failure.message,
                    data: failure.data,
                });
            }
            RpcOutcome::Success(result) => result,
        };

        // MCP-level tool failure: result carries isError=true.
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let message = extract_tool_error_text(&result);
            self.health.lock().record_invocation_failure();
            self.metrics
                .record_invocation(self.id.as_str(), tool, "tool_error", elapsed_ms);
            self.bus.publish(HangarEvent::ToolInvocationFailed {
                meta: EventMeta::now(),
                provider_id: self.id.to_string(),
                tool_name: tool.to_string(),
                correlation_id: correlation_id.to_string(),
                error_kind: "tool_error".to_string(),
                error_message: message.clone(),
            });
            return Err(HangarError::ToolError {
                message,
                data: Some(result),
            });
        }

        let result_size = serde_json::to_vec(&result).map(|v| v.len()).unwrap_or(0);
        self.health.lock().record_success();
        self.touch_last_used();
        self.metrics
            .record_invocation(self.id.as_str(), tool, "ok", elapsed_ms);
        self.bus.publish(HangarEvent::ToolInvocationCompleted {
            meta: EventMeta::now(),
            provider_id: self.id.to_string(),
            tool_name: tool.to_string(),
            correlation_id: correlation_id.to_string(),
            duration_ms: elapsed_ms,
            result_size_bytes: result_size,
        });

        Ok(result)
    }

    /// Account an infrastructure failure and apply any state transition it
    /// triggers (READY→DEGRADED on threshold, READY→DEAD on process death).
    async fn record_infra_failure(&self, error: &HangarError) {
        if !error.counts_against_health() {
            return;
        }

        let (should_degrade, backoff, consecutive, total) = {
            let mut health = self.health.lock();
            health.record_failure();
            (
                health.should_degrade(),
                health.backoff(),
                health.consecutive_failures(),
                health.total_failures(),
            )
        };

        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() != ProviderState::Ready {
            return;
        }

        if !self.is_alive() {
            tracing::warn!(provider = %self.id, "process died under invocation");
            self.set_state(ProviderState::Dead);
            return;
        }

        if should_degrade {
            lifecycle.backoff_until = Some(Instant::now() + backoff);
            self.set_state(ProviderState::Degraded);
            self.bus.publish(HangarEvent::ProviderDegraded {
                meta: EventMeta::now(),
                provider_id: self.id.to_string(),
                consecutive_failures: consecutive,
                total_failures: total,
                reason: error.kind().as_str().to_string(),
            });
        }
    }

    // ---- health probing ----

    /// Active health probe: `tools/list` with a short timeout.
    ///
    /// Success refreshes the tool cache and the probe clock; failure feeds
    /// the same counter as invocation failures.
    pub async fn health_check(&self) -> bool {
        if self.state() != ProviderState::Ready {
            return false;
        }
        let transport = match self.transport.read().clone() {
            Some(transport) => transport,
            None => return false,
        };

        let cancel = CancelToken::new();
        let started = Instant::now();
        let outcome = transport
            .call("tools/list", None, HEALTH_PROBE_TIMEOUT, &cancel)
            .await;

        match outcome {
            Ok(RpcOutcome::Success(result)) => {
                let discovered = parse_tool_list(&result);
                {
                    let mut tools = self.tools.write();
                    for tool in discovered {
                        tools.entry(tool.name.clone()).or_insert(tool);
                    }
                }
                self.health.lock().record_probe_success();
                *self.last_health_check.lock() = Some(Instant::now());
                self.bus.publish(HangarEvent::HealthCheckPassed {
                    meta: EventMeta::now(),
                    provider_id: self.id.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                true
            }
            Ok(RpcOutcome::Failure(failure)) => {
                self.fail_health_check(HangarError::Protocol(failure.message))
                    .await;
                false
            }
            Err(e) => {
                self.fail_health_check(e).await;
                false
            }
        }
    }

    async fn fail_health_check(&self, error: HangarError) {
        tracing::warn!(provider = %self.id, error = %error, "health check failed");
        self.record_infra_failure(&error).await;
        *self.last_health_check.lock() = Some(Instant::now());
        self.bus.publish(HangarEvent::HealthCheckFailed {
            meta: EventMeta::now(),
            provider_id: self.id.to_string(),
            consecutive_failures: self.health.lock().consecutive_failures(),
            error_message: error.to_string(),
        });
    }

    // ---- snapshots ----

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.lock().snapshot()
    }

    pub fn details(&self) -> ProviderDetails {
        let tools: Vec<String> = self.tool_names();
        let state = self.state();
        let health = self.health_snapshot();
        let health_status = match state {
            ProviderState::Ready => {
                if health.consecutive_failures == 0 {
                    "healthy"
                } else {
                    "unhealthy"
                }
            }
            ProviderState::Degraded | ProviderState::Dead => "unhealthy",
            ProviderState::Cold | ProviderState::Initializing => "unknown",
        };
        ProviderDetails {
            provider: self.id.to_string(),
            state,
            mode: self.config.mode.as_str(),
            alive: self.is_alive(),
            tools_count: tools.len(),
            tools,
            tools_predefined: self.tools_predefined(),
            health_status,
            description: self.config.description.clone(),
            last_used_ago_s: self.idle_for().map(|d| d.as_secs_f64()),
            health,
        }
    }
}

/// Parse the `tools` array out of a `tools/list` result.
fn parse_tool_list(result: &Value) -> Vec<McpTool> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Pull a readable message out of an MCP `isError` result.
fn extract_tool_error_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|content| {
            content
                .iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .next()
        })
        .unwrap_or("tool reported an error")
        .to_string()
}
