//! Configuration types for providers, groups and the serving surface.

use hangar_types::wire::McpTool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

fn default_idle_ttl_s() -> u64 {
    300
}

fn default_health_interval_s() -> u64 {
    60
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_backoff_cap_s() -> u64 {
    60
}

fn default_network() -> String {
    "none".to_string()
}

/// Top-level configuration document.
///
/// Loaded from YAML; every section has serde defaults so a minimal file with
/// just a `providers` map is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HangarConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,

    #[serde(default)]
    pub config_reload: ReloadConfig,

    #[serde(default)]
    pub batch: BatchLimits,

    #[serde(default)]
    pub truncation: TruncationConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// How a provider is launched and reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    Subprocess,
    Container,
    Remote,
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::Subprocess => "subprocess",
            ProviderMode::Container => "container",
            ProviderMode::Remote => "remote",
        }
    }
}

/// Specification for one managed provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub mode: ProviderMode,

    /// Command and arguments (subprocess mode). Never run through a shell.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Image reference (container mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Volume mounts (container mode). Host paths must be absolute.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,

    /// Container network mode. Defaults to "none".
    #[serde(default = "default_network")]
    pub network: String,

    /// Container resource limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,

    /// Read-only root filesystem (container mode).
    #[serde(default = "default_true")]
    pub read_only: bool,

    /// User to run as inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Endpoint URL (remote mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Remote authentication (remote mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RemoteAuth>,

    /// TLS options (remote mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,

    /// Extra environment variables for the child process/container.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Shut the provider down after this much idle time.
    #[serde(default = "default_idle_ttl_s")]
    pub idle_ttl_s: u64,

    /// Interval between active health probes.
    #[serde(default = "default_health_interval_s")]
    pub health_check_interval_s: u64,

    /// Consecutive infrastructure failures before the provider degrades.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Cap for the exponential recovery backoff, in seconds.
    #[serde(default = "default_backoff_cap_s")]
    pub backoff_cap_s: u64,

    /// Predefined tool schemas. When present these are authoritative;
    /// discovery may add new names but never overwrites an entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<McpTool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProviderConfig {
    /// Minimal subprocess provider, used widely in tests.
    pub fn subprocess(command: Vec<String>) -> Self {
        Self {
            mode: ProviderMode::Subprocess,
            command,
            image: None,
            volumes: Vec::new(),
            network: default_network(),
            resources: None,
            read_only: true,
            user: None,
            endpoint: None,
            auth: None,
            tls: None,
            env: BTreeMap::new(),
            idle_ttl_s: default_idle_ttl_s(),
            health_check_interval_s: default_health_interval_s(),
            max_consecutive_failures: default_max_consecutive_failures(),
            backoff_cap_s: default_backoff_cap_s(),
            tools: Vec::new(),
            description: None,
        }
    }

    pub fn remote(endpoint: impl Into<String>) -> Self {
        Self {
            mode: ProviderMode::Remote,
            endpoint: Some(endpoint.into()),
            ..Self::subprocess(Vec::new())
        }
    }
}

/// Volume mount for container providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default = "default_true")]
    pub read_only: bool,
}

/// Container resource limits passed to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// e.g. "512m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// e.g. 0.5
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
}

/// Authentication for remote providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteAuth {
    ApiKey { header: String, key: String },
    Bearer { token: String },
    Basic { username: String, password: String },
}

/// TLS options for remote providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsOptions {
    #[serde(default = "default_true")]
    pub verify: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
}

/// Load-balancing strategy for a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStrategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
    Priority,
}

impl GroupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStrategy::RoundRobin => "round_robin",
            GroupStrategy::WeightedRoundRobin => "weighted_round_robin",
            GroupStrategy::LeastConnections => "least_connections",
            GroupStrategy::Random => "random",
            GroupStrategy::Priority => "priority",
        }
    }
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_min_healthy() -> usize {
    1
}

/// Member of a provider group, referencing a configured provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMemberConfig {
    pub provider: String,

    /// Positive weight for weighted strategies. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,

    /// Priority tier; smaller is preferred. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

/// A routing group over several providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConfig {
    pub members: Vec<GroupMemberConfig>,

    #[serde(default)]
    pub strategy: GroupStrategy,

    /// Consecutive failures before a member leaves rotation.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Consecutive successes before a member rejoins rotation.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Below this many in-rotation members the group is PARTIAL.
    #[serde(default = "default_min_healthy")]
    pub min_healthy: usize,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_s() -> u64 {
    30
}

/// Group-level circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reset_timeout_s")]
    pub reset_timeout_s: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_s: default_reset_timeout_s(),
        }
    }
}

fn default_reload_interval_s() -> u64 {
    5
}

/// Hot-reload worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefer filesystem notifications; polling is the fallback.
    #[serde(default = "default_true")]
    pub use_watchdog: bool,

    /// Polling interval when notifications are unavailable.
    #[serde(default = "default_reload_interval_s")]
    pub interval_s: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_watchdog: true,
            interval_s: default_reload_interval_s(),
        }
    }
}

fn default_max_calls() -> usize {
    100
}

fn default_max_concurrency() -> usize {
    20
}

fn default_max_timeout_s() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    10
}

/// Hard limits applied to batch requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchLimits {
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,

    /// Upper clamp for the caller-supplied `max_concurrency`.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Upper clamp for the caller-supplied global timeout, seconds.
    #[serde(default = "default_max_timeout_s")]
    pub max_timeout_s: u64,

    /// Upper clamp for `max_retries`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            max_concurrency: default_max_concurrency(),
            max_timeout_s: default_max_timeout_s(),
            max_retries: default_max_retries(),
        }
    }
}

const MIB: usize = 1024 * 1024;

fn default_max_result_bytes() -> usize {
    10 * MIB
}

fn default_max_batch_bytes() -> usize {
    50 * MIB
}

fn default_cache_ttl_s() -> u64 {
    300
}

fn default_max_cache_entries() -> usize {
    10_000
}

/// Oversized-payload truncation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TruncationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-call serialized payload cap.
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,

    /// Cumulative batch payload cap.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// TTL for cached full payloads behind continuation ids.
    #[serde(default = "default_cache_ttl_s")]
    pub cache_ttl_s: u64,

    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_result_bytes: default_max_result_bytes(),
            max_batch_bytes: default_max_batch_bytes(),
            cache_ttl_s: default_cache_ttl_s(),
            max_cache_entries: default_max_cache_entries(),
        }
    }
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8848
}

fn default_rate_limit_rps() -> f64 {
    50.0
}

fn default_rate_limit_burst() -> u32 {
    100
}

/// Serving-surface options, overridable from the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_http_host")]
    pub http_host: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Container runtime binary ("podman" or "docker").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<String>,

    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: f64,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            container_runtime: None,
            rate_limit_rps: default_rate_limit_rps(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl ServerConfig {
    /// Apply recognised environment variables on top of the file values.
    ///
    /// `HANGAR_CONTAINER_RUNTIME`, `HANGAR_HTTP_HOST`, `HANGAR_HTTP_PORT`,
    /// `HANGAR_RATE_LIMIT_RPS`, `HANGAR_RATE_LIMIT_BURST`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(runtime) = std::env::var("HANGAR_CONTAINER_RUNTIME") {
            if !runtime.is_empty() {
                self.container_runtime = Some(runtime);
            }
        }
        if let Ok(host) = std::env::var("HANGAR_HTTP_HOST") {
            if !host.is_empty() {
                self.http_host = host;
            }
        }
        if let Ok(port) = std::env::var("HANGAR_HTTP_PORT") {
            if let Ok(port) = port.parse() {
                self.http_port = port;
            }
        }
        if let Ok(rps) = std::env::var("HANGAR_RATE_LIMIT_RPS") {
            if let Ok(rps) = rps.parse() {
                self.rate_limit_rps = rps;
            }
        }
        if let Ok(burst) = std::env::var("HANGAR_RATE_LIMIT_BURST") {
            if let Ok(burst) = burst.parse() {
                self.rate_limit_burst = burst;
            }
        }
    }
}
