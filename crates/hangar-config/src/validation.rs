//! Configuration validation
//!
//! Rejects unsafe launch specifications before they ever reach a spawn:
//! shell metacharacters in commands, sensitive volume mounts, malformed
//! image references and endpoints, and inconsistent group definitions.

use hangar_types::{GroupId, HangarError, HangarResult, ProviderId};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{GroupConfig, HangarConfig, ProviderConfig, ProviderMode};

/// Shell metacharacters that must never appear in a subprocess command.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>', '\n', '\r'];

/// Shell interpreters we refuse to launch directly.
const DENIED_INTERPRETERS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh", "csh", "fish"];

/// Host path prefixes that are never mountable into a container.
const BLOCKED_VOLUME_PREFIXES: &[&str] = &[
    "/etc",
    "/proc",
    "/sys",
    "/dev",
    "/boot",
    "/var/run/docker.sock",
    "/run/docker.sock",
    "/root/.ssh",
    "/root/.aws",
    "/root/.kube",
];

static SENSITIVE_ENV_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|secret|token|api_?key|credential|private_key|auth)").unwrap()
});

static IMAGE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+([._/-][a-z0-9]+)*(:[A-Za-z0-9._-]+)?(@sha256:[a-f0-9]{64})?$").unwrap()
});

/// Whether an environment variable key looks like it carries a secret.
///
/// The launcher filters these out of the inherited environment before
/// handing it to a child. Keys listed explicitly in a provider's `env`
/// section are passed through regardless.
pub fn is_sensitive_env_key(key: &str) -> bool {
    SENSITIVE_ENV_KEY.is_match(key)
}

/// Validate the whole configuration document.
pub fn validate_config(config: &HangarConfig) -> HangarResult<()> {
    for (id, provider) in &config.providers {
        ProviderId::new(id.clone())?;
        validate_provider(id, provider)?;
    }

    for (id, group) in &config.groups {
        GroupId::new(id.clone())?;
        validate_group(id, group, config)?;
    }

    if config.server.rate_limit_rps <= 0.0 {
        return Err(HangarError::Configuration(
            "server.rate_limit_rps must be positive".into(),
        ));
    }

    Ok(())
}

fn validate_provider(id: &str, provider: &ProviderConfig) -> HangarResult<()> {
    match provider.mode {
        ProviderMode::Subprocess => validate_command(id, &provider.command)?,
        ProviderMode::Container => {
            let image = provider.image.as_deref().ok_or_else(|| {
                HangarError::Configuration(format!("provider {id}: container mode requires image"))
            })?;
            if !IMAGE_REFERENCE.is_match(image) {
                return Err(HangarError::Configuration(format!(
                    "provider {id}: invalid image reference {image:?}"
                )));
            }
            for volume in &provider.volumes {
                validate_volume(id, &volume.host_path)?;
            }
        }
        ProviderMode::Remote => {
            let endpoint = provider.endpoint.as_deref().ok_or_else(|| {
                HangarError::Configuration(format!("provider {id}: remote mode requires endpoint"))
            })?;
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(HangarError::Configuration(format!(
                    "provider {id}: endpoint must be http(s), got {endpoint:?}"
                )));
            }
        }
    }

    if provider.idle_ttl_s == 0 {
        return Err(HangarError::Configuration(format!(
            "provider {id}: idle_ttl_s must be positive"
        )));
    }
    if provider.max_consecutive_failures == 0 {
        return Err(HangarError::Configuration(format!(
            "provider {id}: max_consecutive_failures must be positive"
        )));
    }

    for tool in &provider.tools {
        hangar_types::ids::validate_tool_name(&tool.name)?;
    }

    Ok(())
}

/// Validate a subprocess command line.
///
/// The command is executed directly (no shell), so metacharacters in any
/// element are treated as an injection attempt rather than escaped.
fn validate_command(id: &str, command: &[String]) -> HangarResult<()> {
    let program = command.first().ok_or_else(|| {
        HangarError::Configuration(format!("provider {id}: subprocess mode requires command"))
    })?;

    let program_name = program.rsplit('/').next().unwrap_or(program);
    if DENIED_INTERPRETERS.contains(&program_name) {
        return Err(HangarError::Configuration(format!(
            "provider {id}: refusing to launch via shell interpreter {program:?}"
        )));
    }

    for element in command {
        if element.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) {
            return Err(HangarError::Configuration(format!(
                "provider {id}: command element {element:?} contains shell metacharacters"
            )));
        }
    }

    Ok(())
}

fn validate_volume(id: &str, host_path: &str) -> HangarResult<()> {
    if !host_path.starts_with('/') {
        return Err(HangarError::Configuration(format!(
            "provider {id}: volume host path must be absolute, got {host_path:?}"
        )));
    }
    for prefix in BLOCKED_VOLUME_PREFIXES {
        if host_path == *prefix || host_path.starts_with(&format!("{prefix}/")) {
            return Err(HangarError::Configuration(format!(
                "provider {id}: volume host path {host_path:?} is in a blocked location"
            )));
        }
    }
    // ~/.ssh under any home directory
    if host_path.contains("/.ssh") {
        return Err(HangarError::Configuration(format!(
            "provider {id}: volume host path {host_path:?} is in a blocked location"
        )));
    }
    Ok(())
}

fn validate_group(id: &str, group: &GroupConfig, config: &HangarConfig) -> HangarResult<()> {
    if group.members.is_empty() {
        return Err(HangarError::Configuration(format!(
            "group {id}: must have at least one member"
        )));
    }

    for member in &group.members {
        if !config.providers.contains_key(&member.provider) {
            return Err(HangarError::Configuration(format!(
                "group {id}: member references unknown provider {:?}",
                member.provider
            )));
        }
        if member.weight == Some(0) {
            return Err(HangarError::Configuration(format!(
                "group {id}: member {:?} weight must be positive",
                member.provider
            )));
        }
    }

    if group.unhealthy_threshold == 0 || group.healthy_threshold == 0 {
        return Err(HangarError::Configuration(format!(
            "group {id}: thresholds must be positive"
        )));
    }
    if group.min_healthy > group.members.len() {
        return Err(HangarError::Configuration(format!(
            "group {id}: min_healthy {} exceeds member count {}",
            group.min_healthy,
            group.members.len()
        )));
    }
    if group.circuit_breaker.failure_threshold == 0 {
        return Err(HangarError::Configuration(format!(
            "group {id}: circuit_breaker.failure_threshold must be positive"
        )));
    }

    Ok(())
}
