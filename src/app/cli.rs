//! Command-line surface over [`crate::app::commands`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use crate::app::commands::{get_config, reset_config, ControlPanel};
use crate::app::config::{load_config, load_config_from_path, save_config_to_path, AppConfig};
use crate::app::error::AppError;
use crate::app::gate::policy_table;
use crate::app::models::CommandResponse;
use crate::app::output::{discard_sink, stderr_sink};
use crate::app::state::{state_path, state_path_for};

/// Device session layer for OVRseen headset traffic collection
#[derive(Parser, Debug)]
#[command(
    name = "ovrseen-device",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Read configuration from this file instead of the default location
    #[arg(long, global = true, env = "OVRSEEN_DEVICE_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Trace id attached to logs and the response (generated when absent)
    #[arg(long, global = true)]
    pub trace_id: Option<String>,

    /// Suppress progress lines on stderr; the JSON result still goes to stdout
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show how the headset is attached
    Status,
    /// Switch the headset to wireless debugging (needs USB once)
    ConnectWireless,
    /// Ask adb to go back to USB mode
    ForceUsb,
    /// Start the adb server with sudo, then record or refresh the installed-app baseline
    RecordBaseline,
    /// Pull, label and uninstall every app installed since the baseline
    DownloadApks,
    /// Install a local APK, pushing its OBB data when present
    InstallApk { path: String },
    /// Uninstall the package if present, then install the APK
    ReinstallApk { path: String },
    /// Install the traffic-capture helper APK
    InstallHelper { path: String },
    /// Wipe the helper's capture directory on the headset
    ClearHelperData,
    /// Generate a signing keystore with keytool
    GenerateKeystore {
        #[arg(long, default_value = "appmon.keystore")]
        path: String,
        #[arg(long, default_value = "mykeyaliasname")]
        alias: String,
        #[arg(long, env = "OVRSEEN_KEYSTORE_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Print the operation/transport policy table
    Policy,
    /// Show or reset the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Overwrite the configuration file with defaults
    Reset,
}

/// Runs one command. Errors come back as `AppError` so the caller can pick the exit code.
pub fn execute(cli: Cli) -> Result<String, AppError> {
    let trace_id = cli.trace_id.clone();
    match cli.command {
        Command::Policy => {
            let table: Vec<_> = policy_table()
                .into_iter()
                .map(|(op, requirement)| PolicyRow {
                    operation: op.name(),
                    requirement,
                })
                .collect();
            render(&table)
        }
        Command::Config(ConfigCommand::Show) => match &cli.config {
            Some(path) => {
                let trace = trace_id.unwrap_or_default();
                let config = load_config_from_path(path, &trace)?;
                render(&CommandResponse {
                    trace_id: trace,
                    data: config,
                })
            }
            None => render(&get_config(trace_id)?),
        },
        Command::Config(ConfigCommand::Reset) => match &cli.config {
            Some(path) => {
                let trace = trace_id.unwrap_or_default();
                let config = AppConfig::default();
                save_config_to_path(&config, path, &path.with_extension("backup.json"), &trace)?;
                render(&CommandResponse {
                    trace_id: trace,
                    data: config,
                })
            }
            None => render(&reset_config(trace_id)?),
        },
        command => {
            let config = read_config(cli.config.as_ref(), trace_id.as_deref())?;
            let sink = if cli.quiet { discard_sink() } else { stderr_sink() };
            let state_file = cli.config.as_deref().map(state_path_for).unwrap_or_else(state_path);
            let mut panel = ControlPanel::from_config(config, sink)
                .map_err(|err| err.with_trace(trace_id.as_deref().unwrap_or_default()))?
                .with_state_file(state_file);
            if matches!(command, Command::RecordBaseline | Command::DownloadApks) {
                install_interrupt_handler(panel.cancel_flag());
            }
            match command {
                Command::Status => render(&panel.status(trace_id)?),
                Command::ConnectWireless => render(&panel.connect_wireless(trace_id)?),
                Command::ForceUsb => render(&panel.force_usb(trace_id)?),
                Command::RecordBaseline => render(&panel.record_baseline(trace_id)?),
                Command::DownloadApks => render(&panel.download_apks(trace_id)?),
                Command::InstallApk { path } => render(&panel.install_apk(&path, trace_id)?),
                Command::ReinstallApk { path } => render(&panel.reinstall_apk(&path, trace_id)?),
                Command::InstallHelper { path } => render(&panel.install_helper(&path, trace_id)?),
                Command::ClearHelperData => render(&panel.clear_helper_data(trace_id)?),
                Command::GenerateKeystore {
                    path,
                    alias,
                    password,
                } => render(&panel.generate_keystore(&path, &alias, &password, trace_id)?),
                Command::Policy | Command::Config(_) => Ok(String::new()),
            }
        }
    }
}

/// First Ctrl-C stops the acquisition after the package in flight; a second one exits.
fn install_interrupt_handler(cancel: Arc<AtomicBool>) {
    let installed = ctrlc::set_handler(move || {
        if request_cancel(&cancel) {
            std::process::exit(130);
        }
        eprintln!("stopping after the current package; press Ctrl-C again to abort");
    });
    if let Err(err) = installed {
        warn!(error = %err, "could not install Ctrl-C handler");
    }
}

/// Raises the flag. Returns true when it was already raised.
fn request_cancel(cancel: &AtomicBool) -> bool {
    cancel.swap(true, Ordering::SeqCst)
}

#[derive(Serialize)]
struct PolicyRow {
    operation: &'static str,
    requirement: crate::app::gate::TransportRequirement,
}

pub fn read_config(path: Option<&PathBuf>, trace_id: Option<&str>) -> Result<AppConfig, AppError> {
    let trace_id = trace_id.unwrap_or_default();
    match path {
        Some(path) => load_config_from_path(path, trace_id),
        None => load_config(trace_id),
    }
}

fn render<T: Serialize>(value: &T) -> Result<String, AppError> {
    serde_json::to_string_pretty(value)
        .map_err(|err| AppError::system(format!("Failed to serialize result: {err}"), ""))
}
