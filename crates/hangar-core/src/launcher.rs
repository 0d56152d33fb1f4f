//! Provider launching.
//!
//! Turns a provider configuration into a running transport: direct spawn
//! for subprocess mode, a hardened `podman`/`docker run` command line for
//! container mode, and a lazily-opened HTTP client for remote mode. Also
//! owns the environment sandbox and launch-failure diagnostics.

use async_trait::async_trait;
use hangar_config::{validation, ProviderConfig, ProviderMode};
use hangar_types::{HangarError, HangarResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::transport::{HttpTransport, StdioTransport, Transport};

const DEFAULT_CONTAINER_RUNTIME: &str = "podman";

/// Build the child environment: the parent environment with secret-looking
/// keys removed, overlaid with the provider's explicit `env` entries.
///
/// Explicit entries pass through unfiltered — the operator opted in.
pub fn sandboxed_env(extra: &BTreeMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(key, _)| !validation::is_sensitive_env_key(key))
        .collect();
    for (key, value) in extra {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Build the container run command line with hardening always applied:
/// all capabilities dropped, no new privileges, read-only root unless
/// explicitly disabled, resource limits, and the configured network mode.
pub fn container_command(runtime: &str, config: &ProviderConfig) -> HangarResult<Vec<String>> {
    let image = config
        .image
        .as_deref()
        .ok_or_else(|| HangarError::Configuration("container mode requires image".into()))?;

    let mut cmd: Vec<String> = vec![
        runtime.to_string(),
        "run".into(),
        "--rm".into(),
        "-i".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--network".into(),
        config.network.clone(),
    ];

    if config.read_only {
        cmd.push("--read-only".into());
    }

    if let Some(user) = &config.user {
        cmd.push("--user".into());
        cmd.push(user.clone());
    }

    if let Some(resources) = &config.resources {
        if let Some(memory) = &resources.memory {
            cmd.push("--memory".into());
            cmd.push(memory.clone());
        }
        if let Some(cpus) = resources.cpus {
            cmd.push("--cpus".into());
            cmd.push(cpus.to_string());
        }
    }

    for volume in &config.volumes {
        let suffix = if volume.read_only { ":ro" } else { "" };
        cmd.push("-v".into());
        cmd.push(format!(
            "{}:{}{}",
            volume.host_path, volume.container_path, suffix
        ));
    }

    for (key, value) in &config.env {
        cmd.push("-e".into());
        cmd.push(format!("{key}={value}"));
    }

    cmd.push(image.to_string());
    Ok(cmd)
}

/// A freshly launched transport, with the concrete stdio handle kept
/// around (when there is one) for stderr/exit-code diagnostics.
pub struct Launched {
    pub transport: Arc<dyn Transport>,
    pub stdio: Option<Arc<StdioTransport>>,
}

/// Strategy for turning a provider configuration into a transport.
///
/// The supervisor is parameterised by this seam; production code uses
/// [`ModeLauncher`], tests substitute an in-memory transport.
#[async_trait]
pub trait TransportLauncher: Send + Sync {
    async fn launch(&self, config: &ProviderConfig) -> HangarResult<Launched>;
}

/// Default launcher dispatching on the provider mode.
pub struct ModeLauncher {
    pub container_runtime: Option<String>,
}

#[async_trait]
impl TransportLauncher for ModeLauncher {
    async fn launch(&self, config: &ProviderConfig) -> HangarResult<Launched> {
        launch(config, self.container_runtime.as_deref()).await
    }
}

/// Launch the transport for a provider according to its mode.
pub async fn launch(
    config: &ProviderConfig,
    container_runtime: Option<&str>,
) -> HangarResult<Launched> {
    match config.mode {
        ProviderMode::Subprocess => {
            let env = sandboxed_env(&config.env);
            let transport = Arc::new(StdioTransport::spawn(&config.command, env).await?);
            Ok(Launched {
                transport: transport.clone(),
                stdio: Some(transport),
            })
        }
        ProviderMode::Container => {
            let runtime = container_runtime.unwrap_or(DEFAULT_CONTAINER_RUNTIME);
            let command = container_command(runtime, config)?;
            // Env goes to the container via -e flags; the runtime itself
            // only gets the sandboxed parent environment.
            let env = sandboxed_env(&BTreeMap::new());
            let transport = Arc::new(StdioTransport::spawn(&command, env).await?);
            Ok(Launched {
                transport: transport.clone(),
                stdio: Some(transport),
            })
        }
        ProviderMode::Remote => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                HangarError::Configuration("remote mode requires endpoint".into())
            })?;
            let transport =
                HttpTransport::connect(endpoint, config.auth.clone(), config.tls.as_ref())?;
            Ok(Launched {
                transport: Arc::new(transport),
                stdio: None,
            })
        }
    }
}

/// Derive a human suggestion from launch-failure diagnostics.
///
/// Best effort pattern matching over the stderr tail and exit code; the
/// contract is that *something* actionable is attached when a recognisable
/// signature appears.
pub fn diagnose_failure(stderr_tail: &str, exit_code: Option<i32>) -> Option<String> {
    if stderr_tail.contains("ModuleNotFoundError") || stderr_tail.contains("ImportError") {
        return Some(
            "A Python dependency is missing; install the provider's requirements".into(),
        );
    }
    if stderr_tail.contains("Cannot find module") || stderr_tail.contains("MODULE_NOT_FOUND") {
        return Some("A Node dependency is missing; run the provider's package install".into());
    }
    if stderr_tail.contains("command not found")
        || stderr_tail.contains("No such file or directory")
        || exit_code == Some(127)
    {
        return Some("The command was not found; check the binary name and PATH".into());
    }
    if exit_code == Some(137) {
        return Some(
            "The process was killed (OOM or SIGKILL); raise the memory limit".into(),
        );
    }
    if stderr_tail.to_lowercase().contains("permission denied") || exit_code == Some(126) {
        return Some("Permission denied; check file modes and the configured user".into());
    }
    if stderr_tail.contains("address already in use") || stderr_tail.contains("EADDRINUSE") {
        return Some("The provider's port is already taken; stop the conflicting process".into());
    }
    if stderr_tail.to_lowercase().contains("connection refused") {
        return Some("Connection refused; verify the endpoint is up and reachable".into());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_config::{ResourceLimits, VolumeMount};

    #[test]
    fn test_sandboxed_env_filters_secrets() {
        std::env::set_var("HANGAR_TEST_SECRET_TOKEN", "shh");
        std::env::set_var("HANGAR_TEST_PLAIN", "ok");

        let env = sandboxed_env(&BTreeMap::new());
        assert!(!env.contains_key("HANGAR_TEST_SECRET_TOKEN"));
        assert_eq!(env.get("HANGAR_TEST_PLAIN").map(String::as_str), Some("ok"));

        std::env::remove_var("HANGAR_TEST_SECRET_TOKEN");
        std::env::remove_var("HANGAR_TEST_PLAIN");
    }

    #[test]
    fn test_explicit_env_passes_through() {
        let mut extra = BTreeMap::new();
        extra.insert("PROVIDER_API_KEY".to_string(), "configured".to_string());
        let env = sandboxed_env(&extra);
        assert_eq!(
            env.get("PROVIDER_API_KEY").map(String::as_str),
            Some("configured")
        );
    }

    #[test]
    fn test_container_command_hardening() {
        let mut config = ProviderConfig::subprocess(Vec::new());
        config.mode = ProviderMode::Container;
        config.image = Some("ghcr.io/acme/tools:1".into());
        config.resources = Some(ResourceLimits {
            memory: Some("256m".into()),
            cpus: Some(0.5),
        });
        config.volumes = vec![VolumeMount {
            host_path: "/data".into(),
            container_path: "/work".into(),
            read_only: true,
        }];
        config.env.insert("MODE".into(), "prod".into());

        let cmd = container_command("podman", &config).unwrap();
        let joined = cmd.join(" ");
        assert!(joined.starts_with("podman run --rm -i"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--memory 256m"));
        assert!(joined.contains("--cpus 0.5"));
        assert!(joined.contains("-v /data:/work:ro"));
        assert!(joined.contains("-e MODE=prod"));
        assert!(joined.ends_with("ghcr.io/acme/tools:1"));
    }

    #[test]
    fn test_container_command_read_only_off() {
        let mut config = ProviderConfig::subprocess(Vec::new());
        config.mode = ProviderMode::Container;
        config.image = Some("acme/tools".into());
        config.read_only = false;
        let cmd = container_command("docker", &config).unwrap();
        assert!(!cmd.contains(&"--read-only".to_string()));
    }

    #[test]
    fn test_diagnose_failure_patterns() {
        assert!(diagnose_failure("ModuleNotFoundError: No module named 'mcp'", Some(1))
            .unwrap()
            .contains("Python"));
        assert!(diagnose_failure("", Some(127)).unwrap().contains("not found"));
        assert!(diagnose_failure("", Some(137)).unwrap().contains("memory"));
        assert!(diagnose_failure("bash: Permission denied", None)
            .unwrap()
            .contains("Permission"));
        assert_eq!(diagnose_failure("all fine", Some(0)), None);
    }
}
