//! Configuration storage - loading and saving YAML files

use hangar_types::{HangarError, HangarResult};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::types::HangarConfig;
use crate::validation;

/// Load and validate configuration from a YAML file.
pub async fn load_config(path: &Path) -> HangarResult<HangarConfig> {
    debug!("Loading configuration from {:?}", path);

    let contents = fs::read_to_string(path)
        .await
        .map_err(|e| HangarError::Configuration(format!("Failed to read {path:?}: {e}")))?;

    let config: HangarConfig = serde_yaml::from_str(&contents)
        .map_err(|e| HangarError::Configuration(format!("Failed to parse {path:?}: {e}")))?;

    validation::validate_config(&config)?;

    info!(
        providers = config.providers.len(),
        groups = config.groups.len(),
        "Configuration loaded from {:?}",
        path
    );
    Ok(config)
}

/// Save configuration to a YAML file.
///
/// Writes to a temporary file first and renames it into place so that a
/// concurrent reader (or the reload watcher) never sees a half-written file.
pub async fn save_config(config: &HangarConfig, path: &Path) -> HangarResult<()> {
    validation::validate_config(config)?;

    let yaml = serde_yaml::to_string(config)
        .map_err(|e| HangarError::Configuration(format!("Failed to serialize config: {e}")))?;

    let temp_path = path.with_extension("yaml.tmp");
    fs::write(&temp_path, yaml)
        .await
        .map_err(|e| HangarError::Configuration(format!("Failed to write {temp_path:?}: {e}")))?;

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| HangarError::Configuration(format!("Failed to rename into {path:?}: {e}")))?;

    debug!("Configuration saved to {:?}", path);
    Ok(())
}
