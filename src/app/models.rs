use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionMode {
    Disconnected,
    Usb,
    WirelessOnPort { ip: String, port: u16 },
}

impl ConnectionMode {
    pub fn is_wireless(&self) -> bool {
        matches!(self, Self::WirelessOnPort { .. })
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Usb => write!(f, "usb"),
            Self::WirelessOnPort { ip, port } => write!(f, "wireless {ip}:{port}"),
        }
    }
}

/// Transport state as last observed. Derived fresh from `adb devices` for every gated operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConnection {
    pub mode: ConnectionMode,
    pub last_known_ip: Option<String>,
}

impl DeviceConnection {
    pub fn disconnected(last_known_ip: Option<String>) -> Self {
        Self {
            mode: ConnectionMode::Disconnected,
            last_known_ip,
        }
    }

    /// adb arguments that address this device on its current transport.
    pub fn adb_selector(&self) -> Vec<String> {
        match &self.mode {
            ConnectionMode::Usb => vec!["-d".to_string()],
            ConnectionMode::WirelessOnPort { ip, port } => {
                vec!["-s".to_string(), format!("{ip}:{port}")]
            }
            ConnectionMode::Disconnected => Vec::new(),
        }
    }
}

/// Stdout and stderr are kept apart so callers can tell diagnostic noise from payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The most useful failure text: stderr when present, otherwise stdout.
    pub fn failure_detail(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcquiredAppRecord {
    pub app_display_name: String,
    pub package_identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageFailure {
    pub package_identifier: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AcquisitionSummary {
    /// True when this run only recorded the first-run baseline.
    pub baseline_created: bool,
    pub candidates: Vec<String>,
    pub acquired: Vec<AcquiredAppRecord>,
    /// Packages whose APK was already on disk, so no pull was issued.
    pub reused_downloads: Vec<String>,
    pub failed: Vec<PackageFailure>,
    pub cancelled: bool,
    pub manifest_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceStatus {
    pub connection: DeviceConnection,
    /// Why the device is unusable right now, when it is.
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallResult {
    pub package_identifier: String,
    pub obb_pushed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeystoreResult {
    pub path: String,
    pub alias: String,
    pub replaced_existing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse<T> {
    pub trace_id: String,
    pub data: T,
}
