//! Command Gate: the single place that decides whether an operation may touch the device
//! on the current transport.
//!
//! Every device-touching operation calls [`authorize`] first. A wrong or dropped transport
//! gets exactly one repair attempt (force USB, or reconnect to the last known address)
//! before the operation is denied.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::adb::link::DeviceLink;
use crate::app::adb::runner::CommandRunner;
use crate::app::error::AppError;
use crate::app::models::{ConnectionMode, DeviceConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Status,
    ConnectWireless,
    ForceUsb,
    RecordBaseline,
    DownloadApks,
    InstallApk,
    ReinstallApk,
    InstallHelper,
    ClearHelperData,
}

impl Operation {
    pub const ALL: [Operation; 9] = [
        Operation::Status,
        Operation::ConnectWireless,
        Operation::ForceUsb,
        Operation::RecordBaseline,
        Operation::DownloadApks,
        Operation::InstallApk,
        Operation::ReinstallApk,
        Operation::InstallHelper,
        Operation::ClearHelperData,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operation::Status => "status",
            Operation::ConnectWireless => "connect_wireless",
            Operation::ForceUsb => "force_usb",
            Operation::RecordBaseline => "record_baseline",
            Operation::DownloadApks => "download_apks",
            Operation::InstallApk => "install_apk",
            Operation::ReinstallApk => "reinstall_apk",
            Operation::InstallHelper => "install_helper",
            Operation::ClearHelperData => "clear_helper_data",
        }
    }

    pub fn requirement(self) -> TransportRequirement {
        match self {
            Operation::Status | Operation::ConnectWireless | Operation::ForceUsb => {
                TransportRequirement::Any
            }
            Operation::RecordBaseline
            | Operation::DownloadApks
            | Operation::InstallApk
            | Operation::ReinstallApk => TransportRequirement::UsbOnly,
            Operation::InstallHelper | Operation::ClearHelperData => {
                TransportRequirement::WirelessAllowed
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportRequirement {
    UsbOnly,
    WirelessAllowed,
    Any,
}

impl TransportRequirement {
    pub fn allows_wireless(self) -> bool {
        !matches!(self, TransportRequirement::UsbOnly)
    }
}

pub fn policy_table() -> Vec<(Operation, TransportRequirement)> {
    Operation::ALL
        .iter()
        .map(|op| (*op, op.requirement()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotConnected,
    UsbRequired,
    WirelessDropped,
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub reason: DenyReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Authorization {
    Proceed(DeviceConnection),
    /// The transport was wrong or had dropped; one transition fixed it.
    Recovered(DeviceConnection),
    Denied(Denial),
}

impl Authorization {
    pub fn into_connection(self, trace_id: &str) -> Result<DeviceConnection, AppError> {
        match self {
            Authorization::Proceed(conn) | Authorization::Recovered(conn) => Ok(conn),
            Authorization::Denied(denial) => Err(AppError::transport(denial.message, trace_id)),
        }
    }
}

const NOT_CONNECTED: &str = "device not connected; plug in and accept the on-device prompt.";
const USB_REQUIRED: &str = "device not connected via USB.";

pub fn authorize(
    operation: Operation,
    link: &mut DeviceLink,
    runner: &mut dyn CommandRunner,
    trace_id: &str,
) -> Result<Authorization, AppError> {
    let requirement = operation.requirement();
    let current = match observe(link, runner, trace_id)? {
        Ok(conn) => conn,
        Err(denial) => return Ok(deny(operation, denial, trace_id)),
    };

    let decision = match (current.mode.clone(), requirement) {
        (ConnectionMode::Usb, _) => Authorization::Proceed(current),
        (ConnectionMode::WirelessOnPort { .. }, TransportRequirement::UsbOnly) => {
            link.force_usb(runner, trace_id)?;
            match observe(link, runner, trace_id)? {
                Ok(conn) if conn.mode == ConnectionMode::Usb => Authorization::Recovered(conn),
                Ok(_) => Authorization::Denied(Denial {
                    reason: DenyReason::UsbRequired,
                    message: USB_REQUIRED.to_string(),
                }),
                Err(denial) => Authorization::Denied(denial),
            }
        }
        (ConnectionMode::WirelessOnPort { .. }, _) => Authorization::Proceed(current),
        (ConnectionMode::Disconnected, requirement) if requirement.allows_wireless() => {
            retry_wireless(link, runner, trace_id)?
        }
        (ConnectionMode::Disconnected, _) => Authorization::Denied(Denial {
            reason: DenyReason::NotConnected,
            message: NOT_CONNECTED.to_string(),
        }),
    };

    Ok(match decision {
        Authorization::Denied(denial) => deny(operation, denial, trace_id),
        Authorization::Recovered(conn) => {
            info!(
                trace_id = %trace_id,
                operation = operation.name(),
                mode = %conn.mode,
                "transport recovered"
            );
            Authorization::Recovered(conn)
        }
        proceed => proceed,
    })
}

fn retry_wireless(
    link: &mut DeviceLink,
    runner: &mut dyn CommandRunner,
    trace_id: &str,
) -> Result<Authorization, AppError> {
    let Some(ip) = link.last_known_ip().map(str::to_string) else {
        return Ok(Authorization::Denied(Denial {
            reason: DenyReason::NotConnected,
            message: NOT_CONNECTED.to_string(),
        }));
    };
    let dropped = || Denial {
        reason: DenyReason::WirelessDropped,
        message: format!(
            "wireless link to {ip} dropped and could not be re-established; \
             re-run the USB pairing step (connect-wireless) once."
        ),
    };
    match link.reconnect(runner, trace_id) {
        Ok(_) => {}
        Err(err) if err.is_transport() => return Ok(Authorization::Denied(dropped())),
        Err(err) => return Err(err),
    }
    Ok(match observe(link, runner, trace_id)? {
        Ok(conn) if conn.mode.is_wireless() => Authorization::Recovered(conn),
        Ok(_) => Authorization::Denied(dropped()),
        Err(denial) => Authorization::Denied(denial),
    })
}

/// Queries the link, turning transport errors into a denial and passing anything else up.
fn observe(
    link: &mut DeviceLink,
    runner: &mut dyn CommandRunner,
    trace_id: &str,
) -> Result<Result<DeviceConnection, Denial>, AppError> {
    match link.query_connection(runner, trace_id) {
        Ok(conn) => Ok(Ok(conn)),
        Err(err) if err.is_transport() => Ok(Err(Denial {
            reason: DenyReason::Transport,
            message: err.error,
        })),
        Err(err) => Err(err),
    }
}

fn deny(operation: Operation, denial: Denial, trace_id: &str) -> Authorization {
    warn!(
        trace_id = %trace_id,
        operation = operation.name(),
        reason = ?denial.reason,
        "operation denied: {}",
        denial.message
    );
    Authorization::Denied(denial)
}
