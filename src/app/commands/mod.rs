//! Control surface: one entry point per named operation. Every device-touching entry point
//! passes the Command Gate before it runs anything against the headset.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::app::acquire::{AcquisitionOptions, ApkAcquisition};
use crate::app::adb::apps::list_contains_package;
use crate::app::adb::link::DeviceLink;
use crate::app::adb::locator::{
    normalize_command_path, resolve_adb_program, shell_quote_program, validate_adb_program,
};
use crate::app::adb::parse::parse_badging_package;
use crate::app::adb::runner::{CommandRunner, ShellCommand, ShellSession};
use crate::app::config::{load_config, save_config, validate_config, AppConfig};
use crate::app::error::AppError;
use crate::app::gate::{authorize, Authorization, Operation};
use crate::app::models::{
    AcquisitionSummary, CommandResponse, CommandResult, DeviceConnection, DeviceStatus,
    InstallResult, KeystoreResult,
};
use crate::app::output::OutputSink;
use crate::app::state::{load_state, save_state, DeviceState};


const KEYSTORE_MIN_PASSWORD_LEN: usize = 6;

pub fn get_config(trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = load_config(&trace_id)?;
    Ok(CommandResponse {
        trace_id,
        data: config,
    })
}

pub fn save_app_config(
    config: AppConfig,
    trace_id: Option<String>,
) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = validate_config(config);
    save_config(&config, &trace_id)?;
    Ok(CommandResponse {
        trace_id,
        data: config,
    })
}

pub fn reset_config(trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = AppConfig::default();
    save_config(&config, &trace_id)?;
    Ok(CommandResponse {
        trace_id,
        data: config,
    })
}

/// Owns the device session: one runner, one link, one sink, for the life of the process.
pub struct ControlPanel<R: CommandRunner = ShellSession> {
    config: AppConfig,
    runner: R,
    link: DeviceLink,
    sink: OutputSink,
    cancel: Arc<AtomicBool>,
    state_path: Option<PathBuf>,
    saved_ip: Option<String>,
}

impl ControlPanel<ShellSession> {
    /// Resolves and validates the adb program, then opens a shell session.
    pub fn from_config(mut config: AppConfig, sink: OutputSink) -> Result<Self, AppError> {
        let program = resolve_adb_program(&config.adb.command_path);
        if let Err(message) = validate_adb_program(&program) {
            return Err(AppError::validation(message, ""));
        }
        config.adb.command_path = program;
        let runner = ShellSession::new(
            Arc::clone(&sink),
            config.command.timeout(),
            config.sudo_password(),
        );
        Ok(Self::with_runner(config, runner, sink))
    }
}

impl<R: CommandRunner> ControlPanel<R> {
    pub fn with_runner(config: AppConfig, runner: R, sink: OutputSink) -> Self {
        let program = normalize_command_path(&config.adb.command_path);
        let link = DeviceLink::new(&program, &config.device, Arc::clone(&sink));
        Self {
            config,
            runner,
            link,
            sink,
            cancel: Arc::new(AtomicBool::new(false)),
            state_path: None,
            saved_ip: None,
        }
    }

    /// Restores the last known wireless address from `path` and writes it back there
    /// whenever the link learns a new one.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match load_state(&path, "") {
            Ok(state) => {
                if let Some(ip) = &state.last_known_ip {
                    self.link.remember_ip(ip.clone());
                }
                self.saved_ip = state.last_known_ip;
            }
            Err(err) => warn!(path = %path.display(), error = %err.error, "ignoring unreadable device state"),
        }
        self.state_path = Some(path);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    /// Setting the flag stops an acquisition run after the package in flight. It is
    /// cleared when the run returns.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn status(&mut self, trace_id: Option<String>) -> Result<CommandResponse<DeviceStatus>, AppError> {
        let trace_id = self.start(Operation::Status, trace_id);
        let decision = authorize(Operation::Status, &mut self.link, &mut self.runner, &trace_id);
        self.sync_state(&trace_id);
        let data = match decision? {
            Authorization::Proceed(connection) | Authorization::Recovered(connection) => DeviceStatus {
                connection,
                message: None,
            },
            Authorization::Denied(denial) => DeviceStatus {
                connection: DeviceConnection::disconnected(
                    self.link.last_known_ip().map(str::to_string),
                ),
                message: Some(denial.message),
            },
        };
        self.say(&format!("device: {}", data.connection.mode));
        Ok(CommandResponse { trace_id, data })
    }

    /// Returns `ip:port` once connected, or `None` when the headset has no Wi-Fi address.
    pub fn connect_wireless(
        &mut self,
        trace_id: Option<String>,
    ) -> Result<CommandResponse<Option<String>>, AppError> {
        let trace_id = self.start(Operation::ConnectWireless, trace_id);
        self.gate(Operation::ConnectWireless, &trace_id)?;
        let address = self.link.enable_wireless(&mut self.runner, &trace_id);
        self.sync_state(&trace_id);
        let address = address?;
        Ok(CommandResponse {
            trace_id,
            data: address,
        })
    }

    pub fn force_usb(
        &mut self,
        trace_id: Option<String>,
    ) -> Result<CommandResponse<DeviceConnection>, AppError> {
        let trace_id = self.start(Operation::ForceUsb, trace_id);
        self.gate(Operation::ForceUsb, &trace_id)?;
        self.link.force_usb(&mut self.runner, &trace_id)?;
        let connection = self.link.query_connection(&mut self.runner, &trace_id);
        self.sync_state(&trace_id);
        let connection = connection?;
        Ok(CommandResponse {
            trace_id,
            data: connection,
        })
    }

    /// Starts the adb server with elevated privileges, then runs the acquisition
    /// workflow, which records the baseline on a fresh working root.
    pub fn record_baseline(
        &mut self,
        trace_id: Option<String>,
    ) -> Result<CommandResponse<AcquisitionSummary>, AppError> {
        let trace_id = self.start(Operation::RecordBaseline, trace_id);
        let server = self
            .runner
            .run(&ShellCommand::new(&["sudo", self.link.program(), "start-server"]))?;
        if !server.success() {
            return Err(AppError::dependency(
                format!("adb start-server failed: {}", server.failure_detail()),
                &trace_id,
            ));
        }
        self.say("PLEASE confirm the prompt on your headset as well");
        let connection = self.gate(Operation::RecordBaseline, &trace_id)?;
        let summary = self.acquire(&connection, &trace_id)?;
        Ok(CommandResponse {
            trace_id,
            data: summary,
        })
    }

    pub fn download_apks(
        &mut self,
        trace_id: Option<String>,
    ) -> Result<CommandResponse<AcquisitionSummary>, AppError> {
        let trace_id = self.start(Operation::DownloadApks, trace_id);
        let connection = self.gate(Operation::DownloadApks, &trace_id)?;
        self.say("Downloading apps installed since the baseline was recorded");
        let summary = self.acquire(&connection, &trace_id)?;
        Ok(CommandResponse {
            trace_id,
            data: summary,
        })
    }

    pub fn install_apk(
        &mut self,
        apk_path: &str,
        trace_id: Option<String>,
    ) -> Result<CommandResponse<InstallResult>, AppError> {
        let trace_id = self.start(Operation::InstallApk, trace_id);
        self.ensure_local_apk(apk_path, &trace_id)?;
        let connection = self.gate(Operation::InstallApk, &trace_id)?;
        let package = self.package_of(apk_path, &trace_id)?;
        let result = self.install_with_obb(&connection, apk_path, package, &trace_id)?;
        Ok(CommandResponse {
            trace_id,
            data: result,
        })
    }

    /// Uninstalls the package first when the device already has it.
    pub fn reinstall_apk(
        &mut self,
        apk_path: &str,
        trace_id: Option<String>,
    ) -> Result<CommandResponse<InstallResult>, AppError> {
        let trace_id = self.start(Operation::ReinstallApk, trace_id);
        self.ensure_local_apk(apk_path, &trace_id)?;
        let connection = self.gate(Operation::ReinstallApk, &trace_id)?;
        let package = self.package_of(apk_path, &trace_id)?;
        let selector = connection.adb_selector();

        let listing = self.adb(
            &selector,
            &["shell", "pm", "list", "packages", package.as_str()],
            &trace_id,
        )?;
        if list_contains_package(&listing.stdout, &package) {
            let removed = self.adb(&selector, &["uninstall", package.as_str()], &trace_id)?;
            if removed.stdout.contains("Failure") {
                return Err(AppError::dependency(
                    format!("uninstall {package} failed: {}", removed.failure_detail()),
                    &trace_id,
                ));
            }
            self.say(&format!("uninstalled {package}"));
        } else {
            self.say(&format!("{package} is not installed; installing fresh"));
        }

        let result = self.install_with_obb(&connection, apk_path, package, &trace_id)?;
        Ok(CommandResponse {
            trace_id,
            data: result,
        })
    }

    /// Installs the traffic-capture helper. Wireless is fine here.
    pub fn install_helper(
        &mut self,
        apk_path: &str,
        trace_id: Option<String>,
    ) -> Result<CommandResponse<InstallResult>, AppError> {
        let trace_id = self.start(Operation::InstallHelper, trace_id);
        self.ensure_local_apk(apk_path, &trace_id)?;
        let connection = self.gate(Operation::InstallHelper, &trace_id)?;
        self.install_package_file(&connection, apk_path, &trace_id)?;
        Ok(CommandResponse {
            trace_id,
            data: InstallResult {
                package_identifier: self.config.device.helper_package.clone(),
                obb_pushed: false,
            },
        })
    }

    pub fn clear_helper_data(
        &mut self,
        trace_id: Option<String>,
    ) -> Result<CommandResponse<CommandResult>, AppError> {
        let trace_id = self.start(Operation::ClearHelperData, trace_id);
        let connection = self.gate(Operation::ClearHelperData, &trace_id)?;
        let data_dir = self.config.device.helper_data_dir.trim_end_matches('/').to_string();
        if data_dir.is_empty() {
            return Err(AppError::validation("helper data directory is empty", &trace_id));
        }
        let removal = format!("'rm -rf {data_dir}/*'");
        let output = self.adb(
            &connection.adb_selector(),
            &["shell", removal.as_str()],
            &trace_id,
        )?;
        Ok(CommandResponse {
            trace_id,
            data: output,
        })
    }

    /// Host-only: generates a signing keystore by answering keytool's prompts on stdin.
    pub fn generate_keystore(
        &mut self,
        keystore_path: &str,
        alias: &str,
        password: &str,
        trace_id: Option<String>,
    ) -> Result<CommandResponse<KeystoreResult>, AppError> {
        let trace_id = resolve_trace_id(trace_id);
        info!(trace_id = %trace_id, alias = %alias, "generate_keystore");
        self.runner.set_trace_id(&trace_id);
        ensure_non_empty(keystore_path, "keystore_path", &trace_id)?;
        ensure_non_empty(alias, "alias", &trace_id)?;
        if password.chars().count() < KEYSTORE_MIN_PASSWORD_LEN {
            return Err(AppError::validation(
                format!("keystore password must be at least {KEYSTORE_MIN_PASSWORD_LEN} characters"),
                &trace_id,
            ));
        }

        let root = self.config.workflow.root_path();
        let target = root.join(keystore_path);
        let replaced_existing = target.exists();
        if replaced_existing {
            self.say("cleaning old keystore");
            fs::remove_file(&target).map_err(|err| {
                AppError::system(
                    format!("Failed to remove {}: {err}", target.display()),
                    &trace_id,
                )
            })?;
        }

        let keystore = shell_quote_program(keystore_path);
        let alias_arg = shell_quote_program(alias);
        let mut answers = vec![password, password];
        // Name, unit, organisation, city, state, country, then confirmation.
        answers.extend(["a"; 6]);
        answers.push("y");
        let command = ShellCommand::new(&[
            "keytool",
            "-genkey",
            "-v",
            "-keystore",
            keystore.as_str(),
            "-alias",
            alias_arg.as_str(),
            "-keyalg",
            "RSA",
            "-keysize",
            "2048",
            "-validity",
            "10000",
        ])
        .with_input(&answers)
        .in_dir(&root);
        let output = self.runner.run(&command)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("keytool failed: {}", output.failure_detail()),
                &trace_id,
            ));
        }
        Ok(CommandResponse {
            trace_id,
            data: KeystoreResult {
                path: target.to_string_lossy().to_string(),
                alias: alias.to_string(),
                replaced_existing,
            },
        })
    }

    fn start(&mut self, operation: Operation, trace_id: Option<String>) -> String {
        let trace_id = resolve_trace_id(trace_id);
        info!(trace_id = %trace_id, operation = operation.name(), "operation started");
        self.runner.set_trace_id(&trace_id);
        trace_id
    }

    fn gate(&mut self, operation: Operation, trace_id: &str) -> Result<DeviceConnection, AppError> {
        let decision = authorize(operation, &mut self.link, &mut self.runner, trace_id);
        self.sync_state(trace_id);
        let decision = decision?;
        if let Authorization::Denied(denial) = &decision {
            self.say(&denial.message);
        }
        decision.into_connection(trace_id)
    }

    /// Saves the link's address when it differs from what the state file holds. A
    /// failed write is logged and does not fail the operation.
    fn sync_state(&mut self, trace_id: &str) {
        let Some(path) = &self.state_path else {
            return;
        };
        let current = self.link.last_known_ip().map(str::to_string);
        if current.is_none() || current == self.saved_ip {
            return;
        }
        let state = DeviceState {
            last_known_ip: current.clone(),
        };
        match save_state(&state, path, trace_id) {
            Ok(()) => self.saved_ip = current,
            Err(err) => warn!(trace_id = %trace_id, error = %err.error, "failed to save device state"),
        }
    }

    fn acquire(
        &mut self,
        connection: &DeviceConnection,
        trace_id: &str,
    ) -> Result<AcquisitionSummary, AppError> {
        let options = AcquisitionOptions::from_config(&self.config);
        let mut workflow = ApkAcquisition::new(
            &self.link,
            connection,
            options,
            Arc::clone(&self.sink),
            trace_id,
        )
        .with_cancel_flag(Arc::clone(&self.cancel));
        let result = workflow.run(&mut self.runner);
        self.cancel.store(false, Ordering::Relaxed);
        let summary = result?;
        self.say(&format!(
            "acquired {}, reused {} download(s), failed {}{}",
            summary.acquired.len(),
            summary.reused_downloads.len(),
            summary.failed.len(),
            if summary.cancelled { ", cancelled" } else { "" }
        ));
        Ok(summary)
    }

    fn install_with_obb(
        &mut self,
        connection: &DeviceConnection,
        apk_path: &str,
        package: String,
        trace_id: &str,
    ) -> Result<InstallResult, AppError> {
        self.install_package_file(connection, apk_path, trace_id)?;

        let root = self.config.workflow.root_path();
        let apk_dir = self.config.workflow.apk_dir.trim_end_matches('/').to_string();
        let local_obb = format!("{apk_dir}/obb/{package}");
        let obb_pushed = root.join(&local_obb).is_dir();
        if obb_pushed {
            let remote = format!("{}/", self.config.device.obb_dir.trim_end_matches('/'));
            self.adb_transfer(
                &connection.adb_selector(),
                &["push", local_obb.as_str(), remote.as_str()],
                trace_id,
            )?;
            self.say(&format!("pushed expansion data for {package}"));
        }
        info!(trace_id = %trace_id, package = %package, obb_pushed, "apk installed");
        Ok(InstallResult {
            package_identifier: package,
            obb_pushed,
        })
    }

    fn install_package_file(
        &mut self,
        connection: &DeviceConnection,
        apk_path: &str,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let quoted = shell_quote_program(apk_path);
        let output = self.adb_transfer(
            &connection.adb_selector(),
            &["install", quoted.as_str()],
            trace_id,
        )?;
        if output.stdout.contains("Failure") || output.stderr.contains("Failure") {
            warn!(trace_id = %trace_id, apk = %apk_path, "install rejected by package manager");
            return Err(AppError::dependency(
                format!("install {apk_path} failed: {}", output.failure_detail()),
                trace_id,
            ));
        }
        Ok(())
    }

    /// Package identifier from the APK's badging dump.
    fn package_of(&mut self, apk_path: &str, trace_id: &str) -> Result<String, AppError> {
        let aapt = shell_quote_program(&self.config.adb.aapt_path);
        let quoted = shell_quote_program(apk_path);
        let command = ShellCommand::new(&[aapt.as_str(), "dump", "badging", quoted.as_str()])
            .in_dir(self.config.workflow.root_path());
        let output = self.runner.run(&command)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("aapt dump badging failed: {}", output.failure_detail()),
                trace_id,
            ));
        }
        parse_badging_package(&output.stdout).ok_or_else(|| {
            AppError::dependency(
                format!("no package name in the badging of {apk_path}"),
                trace_id,
            )
        })
    }

    fn ensure_local_apk(&self, apk_path: &str, trace_id: &str) -> Result<PathBuf, AppError> {
        ensure_non_empty(apk_path, "apk_path", trace_id)?;
        let path = self.config.workflow.root_path().join(apk_path);
        if !is_apk_file(&path) {
            return Err(AppError::validation(
                format!("APK not found: {}", path.display()),
                trace_id,
            ));
        }
        Ok(path)
    }

    fn adb(
        &mut self,
        selector: &[String],
        args: &[&str],
        trace_id: &str,
    ) -> Result<CommandResult, AppError> {
        let command = self
            .link
            .command(selector, args)
            .in_dir(self.config.workflow.root_path());
        self.checked(command, args, trace_id)
    }

    fn adb_transfer(
        &mut self,
        selector: &[String],
        args: &[&str],
        trace_id: &str,
    ) -> Result<CommandResult, AppError> {
        let command = self
            .link
            .command(selector, args)
            .in_dir(self.config.workflow.root_path())
            .with_timeout(self.config.command.transfer_timeout());
        self.checked(command, args, trace_id)
    }

    fn checked(
        &mut self,
        command: ShellCommand,
        args: &[&str],
        trace_id: &str,
    ) -> Result<CommandResult, AppError> {
        let output = self.runner.run(&command)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("adb {} failed: {}", args.join(" "), output.failure_detail()),
                trace_id,
            ));
        }
        Ok(output)
    }

    fn say(&self, line: &str) {
        (self.sink)(line);
    }
}

fn is_apk_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("apk"))
            .unwrap_or(false)
}

fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn ensure_non_empty(value: &str, field: &str, trace_id: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(
            format!("{field} is required"),
            trace_id,
        ));
    }
    Ok(())
}
