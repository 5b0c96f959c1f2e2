//! Session facts that outlive one CLI invocation. Kept apart from the config file so
//! saving them never rewrites operator settings.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::app::config::config_path;
use crate::app::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceState {
    pub last_known_ip: Option<String>,
}

/// Default location: next to the config file.
pub fn state_path() -> PathBuf {
    state_path_for(&config_path())
}

pub fn state_path_for(config_path: &Path) -> PathBuf {
    config_path.with_extension("state.json")
}

/// A missing file is an empty state.
pub fn load_state(path: &Path, trace_id: &str) -> Result<DeviceState, AppError> {
    if !path.exists() {
        return Ok(DeviceState::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read device state: {err}"), trace_id))?;
    serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse device state: {err}"), trace_id))
}

pub fn save_state(state: &DeviceState, path: &Path, trace_id: &str) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let payload = serde_json::to_string_pretty(state)
        .map_err(|err| AppError::system(format!("Failed to serialize device state: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write device state: {err}"), trace_id))
}
