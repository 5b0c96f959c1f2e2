//! APK acquisition: pull every third-party package installed since the baseline was
//! recorded, name it after its package, note its title, then uninstall it.
//!
//! The run is safe to repeat. An APK already on disk is never pulled again, and a package
//! that fails stays installed, so the next run picks it up.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::adb::apps::{listing_has_entry, package_names, parse_pm_path_output};
use crate::app::adb::link::DeviceLink;
use crate::app::adb::locator::shell_quote_program;
use crate::app::adb::parse::parse_badging_label;
use crate::app::adb::runner::{CommandRunner, ShellCommand};
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::models::{
    AcquiredAppRecord, AcquisitionSummary, CommandResult, DeviceConnection, PackageFailure,
};
use crate::app::output::OutputSink;

pub const MANIFEST_HEADER: &str = "app_name,pkg_name";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum AcquisitionState {
    Idle,
    EnumeratingInstalled,
    Diffing,
    PerPackageAcquire(String),
    WritingManifest,
    Done,
    Failed(String),
}

/// Package identifiers already accounted for, in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageSnapshot {
    packages: Vec<String>,
}

impl PackageSnapshot {
    pub fn new(packages: Vec<String>) -> Self {
        let mut snapshot = Self::default();
        for package in packages {
            snapshot.append(package);
        }
        snapshot
    }

    /// `Ok(None)` when the file does not exist yet (first run).
    pub fn load(path: &Path, trace_id: &str) -> Result<Option<Self>, AppError> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(Self::new(
                raw.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect(),
            ))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::system(
                format!("Failed to read baseline {}: {err}", path.display()),
                trace_id,
            )),
        }
    }

    /// Overwrites `path` wholesale, one identifier per line.
    pub fn write(&self, path: &Path, trace_id: &str) -> Result<(), AppError> {
        let mut payload = String::new();
        for package in &self.packages {
            payload.push_str(package);
            payload.push('\n');
        }
        fs::write(path, payload).map_err(|err| {
            AppError::system(
                format!("Failed to write baseline {}: {err}", path.display()),
                trace_id,
            )
        })
    }

    pub fn contains(&self, package: &str) -> bool {
        self.packages.iter().any(|known| known == package)
    }

    pub fn append(&mut self, package: String) {
        if !self.contains(&package) {
            self.packages.push(package);
        }
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }
}

/// `current − baseline − {helper}`, in enumeration order.
pub fn diff_candidates(current: &[String], baseline: &PackageSnapshot, helper: &str) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    for package in current {
        if package == helper || baseline.contains(package) || candidates.contains(package) {
            continue;
        }
        candidates.push(package.clone());
    }
    candidates
}

pub fn manifest_file_name(now: &DateTime<Local>) -> String {
    format!("app-list-{}.csv", now.format("%Y-%m-%d_%H%M"))
}

/// Appends `records` to the timestamped manifest in `dir`, writing the header only when
/// the file is new.
pub fn write_manifest(
    dir: &Path,
    records: &[AcquiredAppRecord],
    now: &DateTime<Local>,
    trace_id: &str,
) -> Result<PathBuf, AppError> {
    let path = dir.join(manifest_file_name(now));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| AppError::system(format!("Failed to open manifest: {err}"), trace_id))?;
    let is_new = file
        .metadata()
        .map(|meta| meta.len() == 0)
        .unwrap_or(true);

    let mut payload = String::new();
    if is_new {
        payload.push_str(MANIFEST_HEADER);
        payload.push('\n');
    }
    for record in records {
        payload.push_str(&csv_field(&record.app_display_name));
        payload.push(',');
        payload.push_str(&csv_field(&record.package_identifier));
        payload.push('\n');
    }
    file.write_all(payload.as_bytes())
        .map_err(|err| AppError::system(format!("Failed to write manifest: {err}"), trace_id))?;
    Ok(path)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    pub root: PathBuf,
    pub baseline_file: String,
    pub apk_dir: String,
    pub aapt: String,
    pub helper_package: String,
    pub obb_dir: String,
    pub transfer_timeout: Duration,
}

impl AcquisitionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            root: config.workflow.root_path(),
            baseline_file: config.workflow.baseline_file.clone(),
            apk_dir: config.workflow.apk_dir.trim_end_matches('/').to_string(),
            aapt: shell_quote_program(&config.adb.aapt_path),
            helper_package: config.device.helper_package.clone(),
            obb_dir: config.device.obb_dir.trim_end_matches('/').to_string(),
            transfer_timeout: config.command.transfer_timeout(),
        }
    }

    fn baseline_path(&self) -> PathBuf {
        self.root.join(&self.baseline_file)
    }

    fn local_apk_dir(&self) -> PathBuf {
        self.root.join(&self.apk_dir)
    }

    fn local_obb_dir(&self) -> PathBuf {
        self.local_apk_dir().join("obb")
    }
}

struct PackageOutcome {
    record: AcquiredAppRecord,
    reused_download: bool,
}

pub struct ApkAcquisition<'a> {
    link: &'a DeviceLink,
    selector: Vec<String>,
    options: AcquisitionOptions,
    sink: OutputSink,
    cancel: Option<Arc<AtomicBool>>,
    state: AcquisitionState,
    trace_id: String,
}

impl<'a> ApkAcquisition<'a> {
    pub fn new(
        link: &'a DeviceLink,
        connection: &DeviceConnection,
        options: AcquisitionOptions,
        sink: OutputSink,
        trace_id: &str,
    ) -> Self {
        Self {
            link,
            selector: connection.adb_selector(),
            options,
            sink,
            cancel: None,
            state: AcquisitionState::Idle,
            trace_id: trace_id.to_string(),
        }
    }

    /// Checked between packages; a package in flight always finishes.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn state(&self) -> &AcquisitionState {
        &self.state
    }

    pub fn run(&mut self, runner: &mut dyn CommandRunner) -> Result<AcquisitionSummary, AppError> {
        match self.run_inner(runner) {
            Ok(summary) => {
                self.transition(AcquisitionState::Done);
                Ok(summary)
            }
            Err(err) => {
                self.transition(AcquisitionState::Failed(err.error.clone()));
                Err(err)
            }
        }
    }

    fn run_inner(&mut self, runner: &mut dyn CommandRunner) -> Result<AcquisitionSummary, AppError> {
        let mut summary = AcquisitionSummary::default();

        self.transition(AcquisitionState::EnumeratingInstalled);
        let installed = self.enumerate(runner)?;

        let baseline_path = self.options.baseline_path();
        let Some(mut baseline) = PackageSnapshot::load(&baseline_path, &self.trace_id)? else {
            self.say("[.] Creating a new installed APK info file...");
            let snapshot = PackageSnapshot::new(installed);
            for package in snapshot.packages() {
                self.say(&format!(
                    "[+] Adding {package} into {}...",
                    self.options.baseline_file
                ));
            }
            snapshot.write(&baseline_path, &self.trace_id)?;
            summary.baseline_created = true;
            return Ok(summary);
        };
        self.say("[.] Installed APK info file exists...");

        self.transition(AcquisitionState::Diffing);
        let candidates = diff_candidates(&installed, &baseline, &self.options.helper_package);
        summary.candidates = candidates.clone();
        if !candidates.is_empty() {
            self.say("[.] Downloading newly installed APK files now...");
            self.ensure_dir(&self.options.local_obb_dir())?;
        }

        for package in candidates {
            if self.cancelled() {
                self.say("[-] Acquisition cancelled; remaining packages left for the next run");
                summary.cancelled = true;
                break;
            }
            self.transition(AcquisitionState::PerPackageAcquire(package.clone()));
            match self.acquire_package(runner, &package) {
                Ok(PackageOutcome {
                    record,
                    reused_download,
                }) => {
                    if reused_download {
                        summary.reused_downloads.push(package.clone());
                    }
                    summary.acquired.push(record);
                    baseline.append(package);
                }
                Err(err) => {
                    warn!(
                        trace_id = %self.trace_id,
                        package = %package,
                        code = %err.code,
                        "package acquisition failed: {}",
                        err.error
                    );
                    self.say(&format!("[-] Failed to acquire {package}: {}", err.error));
                    summary.failed.push(PackageFailure {
                        package_identifier: package,
                        reason: err.error,
                    });
                }
            }
            self.say("");
        }

        self.transition(AcquisitionState::WritingManifest);
        let manifest = write_manifest(
            &self.options.root,
            &summary.acquired,
            &Local::now(),
            &self.trace_id,
        )?;
        self.say(&format!(
            "[+] Saved {} app(s) into {}",
            summary.acquired.len(),
            manifest.display()
        ));
        summary.manifest_path = Some(manifest.to_string_lossy().to_string());

        info!(
            trace_id = %self.trace_id,
            acquired = summary.acquired.len(),
            failed = summary.failed.len(),
            cancelled = summary.cancelled,
            "apk acquisition finished"
        );
        Ok(summary)
    }

    fn enumerate(&mut self, runner: &mut dyn CommandRunner) -> Result<Vec<String>, AppError> {
        let output = self.adb(runner, &["shell", "pm", "list", "packages", "-3"], None)?;
        Ok(package_names(&output))
    }

    fn acquire_package(
        &mut self,
        runner: &mut dyn CommandRunner,
        package: &str,
    ) -> Result<PackageOutcome, AppError> {
        let apk_name = format!("{package}.apk");
        let local_apk = self.options.local_apk_dir().join(&apk_name);
        let relative_apk = format!("{}/{apk_name}", self.options.apk_dir);

        let reused_download = local_apk.is_file();
        if reused_download {
            self.say(&format!("[-] {relative_apk} has previously been downloaded..."));
        } else {
            self.download_apk(runner, package, &local_apk)?;
        }

        let app_name = self.read_label(runner, package, &relative_apk)?;
        self.pull_obb(runner, package)?;

        let uninstall = self.adb_raw(runner, &["uninstall", package], None)?;
        let removed = uninstall.stdout.contains("Success")
            || (uninstall.success() && !uninstall.stdout.contains("Failure"));
        if !removed {
            return Err(AppError::dependency(
                format!("uninstall {package} failed: {}", uninstall.failure_detail()),
                &self.trace_id,
            ));
        }
        self.say(&format!("[+] Uninstalled app {package}..."));

        Ok(PackageOutcome {
            record: AcquiredAppRecord {
                app_display_name: app_name,
                package_identifier: package.to_string(),
            },
            reused_download,
        })
    }

    fn download_apk(
        &mut self,
        runner: &mut dyn CommandRunner,
        package: &str,
        local_apk: &Path,
    ) -> Result<(), AppError> {
        let path_output = self.adb(runner, &["shell", "pm", "path", package], None)?;
        let device_path = parse_pm_path_output(&path_output).ok_or_else(|| {
            AppError::dependency(
                format!("could not resolve the APK path of {package}"),
                &self.trace_id,
            )
        })?;

        let target_dir = format!("{}/", self.options.apk_dir);
        let timeout = self.options.transfer_timeout;
        self.adb(runner, &["pull", device_path.as_str(), target_dir.as_str()], Some(timeout))?;
        self.say(&format!("[+] Downloaded {device_path}..."));

        let installer_name = Path::new(&device_path)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "base.apk".to_string());
        let pulled = self.options.local_apk_dir().join(installer_name);
        fs::rename(&pulled, local_apk).map_err(|err| {
            AppError::system(
                format!(
                    "Failed to rename {} to {}: {err}",
                    pulled.display(),
                    local_apk.display()
                ),
                &self.trace_id,
            )
        })?;
        self.say(&format!("[+] Renamed APK file into {}...", local_apk.display()));
        Ok(())
    }

    fn read_label(
        &mut self,
        runner: &mut dyn CommandRunner,
        package: &str,
        relative_apk: &str,
    ) -> Result<String, AppError> {
        let command = ShellCommand::new(&[self.options.aapt.as_str(), "dump", "badging", relative_apk])
            .in_dir(&self.options.root);
        let output = runner.run(&command)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("aapt dump badging failed for {package}: {}", output.failure_detail()),
                &self.trace_id,
            ));
        }
        let label = parse_badging_label(&output.stdout).ok_or_else(|| {
            AppError::dependency(
                format!("no application label in the badging of {package}"),
                &self.trace_id,
            )
        })?;
        self.say(&format!("[+] Saved app {label} into CSV file..."));
        Ok(label)
    }

    fn pull_obb(&mut self, runner: &mut dyn CommandRunner, package: &str) -> Result<(), AppError> {
        let local_obb = self.options.local_obb_dir().join(package);
        if local_obb.exists() {
            self.say(&format!(
                "[-] {}/obb/{package} has previously been downloaded...",
                self.options.apk_dir
            ));
            return Ok(());
        }
        let obb_root = format!("{}/", self.options.obb_dir);
        let listing = self.adb_raw(runner, &["shell", "ls", obb_root.as_str()], None)?;
        if !listing.success() || !listing_has_entry(&listing.stdout, package) {
            self.say(&format!("[-] No OBB file found for {package}"));
            return Ok(());
        }
        let remote = format!("{}/{package}", self.options.obb_dir);
        let target = format!("{}/obb/", self.options.apk_dir);
        let timeout = self.options.transfer_timeout;
        self.adb(runner, &["pull", remote.as_str(), target.as_str()], Some(timeout))?;
        self.say(&format!(
            "[+] Downloaded OBB file into {}/obb/{package}/...",
            self.options.apk_dir
        ));
        Ok(())
    }

    /// Runs an adb command against the authorized device and fails on a non-zero exit.
    fn adb(
        &self,
        runner: &mut dyn CommandRunner,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<String, AppError> {
        let output = self.adb_raw(runner, args, timeout)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("adb {} failed: {}", args.join(" "), output.failure_detail()),
                &self.trace_id,
            ));
        }
        Ok(output.stdout)
    }

    fn adb_raw(
        &self,
        runner: &mut dyn CommandRunner,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandResult, AppError> {
        let mut command = self.link.command(&self.selector, args).in_dir(&self.options.root);
        if let Some(timeout) = timeout {
            command = command.with_timeout(timeout);
        }
        runner.run(&command)
    }

    fn ensure_dir(&self, dir: &Path) -> Result<(), AppError> {
        if dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(dir).map_err(|err| {
            AppError::system(
                format!("Failed to create {}: {err}", dir.display()),
                &self.trace_id,
            )
        })?;
        self.say(&format!("[+] Created new directory {}/...", dir.display()));
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn transition(&mut self, next: AcquisitionState) {
        debug!(trace_id = %self.trace_id, from = ?self.state, to = ?next, "acquisition state");
        self.state = next;
    }

    fn say(&self, line: &str) {
        (self.sink)(line);
    }
}
