use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

pub const DEFAULT_WIRELESS_PORT: u16 = 5555;
pub const DEFAULT_HELPER_PACKAGE: &str = "edu.uci.calit2.anteatermo.dev";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
    /// Host `aapt`, used to read the badging of pulled APKs.
    pub aapt_path: String,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: "adb".to_string(),
            aapt_path: "aapt".to_string(),
        }
    }
}

/// How to resolve a device that is attached over USB and wireless at once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DualAttachmentPolicy {
    /// Drop the wireless entry; a plugged-in cable means the operator wants wired control.
    #[default]
    PreferUsb,
    /// Report the ambiguity and let the operator pick a transport.
    Refuse,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    pub wireless_port: u16,
    pub wireless_interface: String,
    pub dual_attachment: DualAttachmentPolicy,
    pub helper_package: String,
    pub helper_data_dir: String,
    pub obb_dir: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            wireless_port: DEFAULT_WIRELESS_PORT,
            wireless_interface: "wlan0".to_string(),
            dual_attachment: DualAttachmentPolicy::PreferUsb,
            helper_package: DEFAULT_HELPER_PACKAGE.to_string(),
            helper_data_dir: "/sdcard/anteater".to_string(),
            obb_dir: "/sdcard/Android/obb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandSettings {
    pub timeout_secs: u64,
    pub transfer_timeout_secs: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            transfer_timeout_secs: 600,
        }
    }
}

impl CommandSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Working root for acquisition; relative files below resolve against it.
    pub root: String,
    pub baseline_file: String,
    pub apk_dir: String,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            root: String::new(),
            baseline_file: "InstalledAPKs".to_string(),
            apk_dir: "APKs".to_string(),
        }
    }
}

impl WorkflowSettings {
    pub fn root_path(&self) -> PathBuf {
        if self.root.trim().is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(self.root.trim())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SudoSettings {
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub command: CommandSettings,
    #[serde(default)]
    pub workflow: WorkflowSettings,
    #[serde(default)]
    pub sudo: SudoSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Sudo credential from the config file, falling back to `OVRSEEN_SUDO_PASSWORD`.
    pub fn sudo_password(&self) -> Option<String> {
        self.sudo
            .password
            .clone()
            .filter(|value| !value.is_empty())
            .or_else(|| {
                std::env::var("OVRSEEN_SUDO_PASSWORD")
                    .ok()
                    .filter(|value| !value.is_empty())
            })
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("OVRSEEN_DEVICE_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ovrseen_device_config.json")
}

pub fn backup_config_path() -> PathBuf {
    config_path().with_extension("backup.json")
}

pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn save_config(config: &AppConfig, trace_id: &str) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), trace_id))?;
    let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
    config = apply_legacy_overrides(config, &value);
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

// Flat keys written by the old panel (`ovrseen_directory.txt` era) still work.
fn apply_legacy_overrides(mut config: AppConfig, value: &serde_json::Value) -> AppConfig {
    if let Some(root) = value.get("ovrseen_directory").and_then(|v| v.as_str()) {
        if config.workflow.root.trim().is_empty() {
            config.workflow.root = root.to_string();
        }
    }
    if let Some(adb_path) = value.get("adb_path").and_then(|v| v.as_str()) {
        config.adb.command_path = adb_path.to_string();
    }
    if let Some(port) = value.get("wireless_port").and_then(|v| v.as_u64()) {
        if let Ok(port) = u16::try_from(port) {
            config.device.wireless_port = port;
        }
    }
    config
}

pub fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = AppConfig::default();
    if config.device.wireless_port == 0 {
        config.device.wireless_port = DEFAULT_WIRELESS_PORT;
    }
    if config.device.wireless_interface.trim().is_empty() {
        config.device.wireless_interface = defaults.device.wireless_interface;
    }
    if config.device.helper_package.trim().is_empty() {
        config.device.helper_package = defaults.device.helper_package;
    }
    if !config.device.obb_dir.starts_with('/') {
        config.device.obb_dir = defaults.device.obb_dir;
    }
    if !config.device.helper_data_dir.starts_with('/') || config.device.helper_data_dir.trim() == "/" {
        config.device.helper_data_dir = defaults.device.helper_data_dir;
    }
    if config.command.timeout_secs == 0 {
        config.command.timeout_secs = defaults.command.timeout_secs;
    }
    if config.command.transfer_timeout_secs < config.command.timeout_secs {
        config.command.transfer_timeout_secs = defaults
            .command
            .transfer_timeout_secs
            .max(config.command.timeout_secs);
    }
    if config.workflow.baseline_file.trim().is_empty() {
        config.workflow.baseline_file = defaults.workflow.baseline_file;
    }
    if config.workflow.apk_dir.trim().is_empty() {
        config.workflow.apk_dir = defaults.workflow.apk_dir;
    }
    if config.adb.aapt_path.trim().is_empty() {
        config.adb.aapt_path = defaults.adb.aapt_path;
    }
    if config.logging.log_level.trim().is_empty() {
        config.logging.log_level = defaults.logging.log_level;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn merges_legacy_values() {
        let value = serde_json::json!({
            "ovrseen_directory": "/opt/ovrseen",
            "adb_path": "/opt/platform-tools/adb",
            "wireless_port": 5556
        });
        let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
        config = apply_legacy_overrides(config, &value);
        assert_eq!(config.workflow.root, "/opt/ovrseen");
        assert_eq!(config.adb.command_path, "/opt/platform-tools/adb");
        assert_eq!(config.device.wireless_port, 5556);
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.device.wireless_port = 0;
        config.device.obb_dir = "sdcard/obb".to_string();
        config.device.helper_data_dir = "/".to_string();
        config.command.timeout_secs = 0;
        config.command.transfer_timeout_secs = 1;
        config.workflow.baseline_file = " ".to_string();
        let validated = validate_config(config);
        assert_eq!(validated.device.wireless_port, 5555);
        assert_eq!(validated.device.obb_dir, "/sdcard/Android/obb");
        assert_eq!(validated.device.helper_data_dir, "/sdcard/anteater");
        assert_eq!(validated.command.timeout_secs, 30);
        assert_eq!(validated.command.transfer_timeout_secs, 600);
        assert_eq!(validated.workflow.baseline_file, "InstalledAPKs");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().expect("tmp");
        let config =
            load_config_from_path(&tmp.path().join("absent.json"), "trace").expect("defaults");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn save_then_load_keeps_backup() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join("config.json");
        let backup = tmp.path().join("config.backup.json");

        let mut config = AppConfig::default();
        config.device.dual_attachment = DualAttachmentPolicy::Refuse;
        save_config_to_path(&config, &path, &backup, "trace").expect("save");
        assert!(!backup.exists());

        config.workflow.apk_dir = "Pulled".to_string();
        save_config_to_path(&config, &path, &backup, "trace").expect("save again");
        assert!(backup.exists());

        let loaded = load_config_from_path(&path, "trace").expect("load");
        assert_eq!(loaded.device.dual_attachment, DualAttachmentPolicy::Refuse);
        assert_eq!(loaded.workflow.apk_dir, "Pulled");
    }

    #[test]
    fn rejects_malformed_json() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load_config_from_path(&path, "trace-9").unwrap_err();
        assert_eq!(err.code, "ERR_VALIDATION");
        assert_eq!(err.trace_id, "trace-9");
    }

    #[test]
    fn empty_root_resolves_to_current_dir() {
        assert_eq!(WorkflowSettings::default().root_path(), PathBuf::from("."));
    }
}
