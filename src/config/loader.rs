//! Config file loader and serialization.

use crate::config::RunConfig;
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "buildrelay";

/// Get the global config path: ~/.config/buildrelay/config.json
pub fn get_global_config_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine config directory".to_string())
    })?;
    Ok(config_dir.join(APP_DIR).join("config.json"))
}

/// Default artifact store root: <data dir>/buildrelay/artifacts, or
/// ./artifacts when the platform has no data directory.
pub fn default_store_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR).join("artifacts"))
        .unwrap_or_else(|| PathBuf::from("artifacts"))
}

/// Load and validate config from a JSON file.
pub fn load_config_from_file(path: &Path) -> Result<RunConfig, ConfigError> {
    validate_config_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!(
                "Configuration file not found at: {}",
                path.display()
            ))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let config: RunConfig = serde_json::from_str(&content).map_err(ConfigError::InvalidJson)?;
    config.validate()?;
    Ok(config)
}

/// Save config to JSON file.
pub fn save_config_to_file(config: &RunConfig, path: &Path) -> Result<(), ConfigError> {
    validate_config_path(path)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(ConfigError::IoError)?;
        }
    }

    let json_content = serde_json::to_string_pretty(config).map_err(ConfigError::InvalidJson)?;
    fs::write(path, json_content).map_err(ConfigError::IoError)?;
    Ok(())
}

/// Load `explicit` if given (it must exist), otherwise the global config if
/// present, otherwise defaults. Returns the file the config came from.
pub fn load_or_default(explicit: Option<&Path>) -> Result<(RunConfig, Option<PathBuf>), ConfigError> {
    if let Some(path) = explicit {
        return Ok((load_config_from_file(path)?, Some(path.to_path_buf())));
    }

    match get_global_config_path() {
        Ok(path) if path.is_file() => {
            log::info!("[Config] Using global config {}", path.display());
            let config = load_config_from_file(&path)?;
            Ok((config, Some(path)))
        }
        _ => Ok((RunConfig::default(), None)),
    }
}

/// Validate config path (.json extension required).
pub fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path cannot be empty".to_string(),
        ));
    }

    match path.extension() {
        Some(ext) if ext == "json" => {}
        Some(ext) => {
            return Err(ConfigError::ValidationFailed(format!(
                "Configuration file must have .json extension, got .{}",
                ext.to_string_lossy()
            )))
        }
        None => {
            return Err(ConfigError::ValidationFailed(
                "Configuration file must have .json extension".to_string(),
            ))
        }
    }

    if path.to_str().is_none() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path contains invalid characters".to_string(),
        ));
    }

    Ok(())
}
