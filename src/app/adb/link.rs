//! Device Link: classifies the current adb transport and switches between USB and
//! wireless debugging.
//!
//! Nothing here is cached across operations except `last_known_ip`, which lets a dropped
//! wireless link be re-established without rediscovering the headset's address.

use tracing::{info, warn};

use crate::app::adb::locator::shell_quote_program;
use crate::app::adb::parse::{classify_devices, parse_adb_devices, parse_interface_ipv4, DeviceListing};
use crate::app::adb::runner::{CommandRunner, ShellCommand};
use crate::app::config::{DeviceSettings, DualAttachmentPolicy};
use crate::app::error::AppError;
use crate::app::models::{CommandResult, ConnectionMode, DeviceConnection};
use crate::app::output::OutputSink;

pub struct DeviceLink {
    adb: String,
    wireless_port: u16,
    interface: String,
    dual_attachment: DualAttachmentPolicy,
    last_known_ip: Option<String>,
    sink: OutputSink,
}

impl DeviceLink {
    pub fn new(adb_program: &str, settings: &DeviceSettings, sink: OutputSink) -> Self {
        Self {
            adb: shell_quote_program(adb_program),
            wireless_port: settings.wireless_port,
            interface: settings.wireless_interface.clone(),
            dual_attachment: settings.dual_attachment,
            last_known_ip: None,
            sink,
        }
    }

    /// The adb program as it appears on command lines.
    pub fn program(&self) -> &str {
        &self.adb
    }

    pub fn wireless_port(&self) -> u16 {
        self.wireless_port
    }

    pub fn last_known_ip(&self) -> Option<&str> {
        self.last_known_ip.as_deref()
    }

    pub fn remember_ip(&mut self, ip: impl Into<String>) {
        self.last_known_ip = Some(ip.into());
    }

    /// `adb <selector> <args…>` as a shell invocation.
    pub fn command<S: AsRef<str>>(&self, selector: &[String], args: &[S]) -> ShellCommand {
        let mut tokens: Vec<String> = Vec::with_capacity(1 + selector.len() + args.len());
        tokens.push(self.adb.clone());
        tokens.extend(selector.iter().cloned());
        tokens.extend(args.iter().map(|arg| arg.as_ref().to_string()));
        ShellCommand::new(&tokens)
    }

    pub fn query_connection(
        &mut self,
        runner: &mut dyn CommandRunner,
        trace_id: &str,
    ) -> Result<DeviceConnection, AppError> {
        let mut resolved_dual = false;
        loop {
            let output = runner.run(&self.command(&[], &["devices"]))?;
            if !output.success() {
                return Err(AppError::dependency(
                    format!("adb devices failed: {}", output.failure_detail()),
                    trace_id,
                ));
            }
            let devices = parse_adb_devices(&output.stdout);
            match classify_devices(&devices, self.wireless_port) {
                DeviceListing::Empty => return Ok(self.connection(ConnectionMode::Disconnected)),
                DeviceListing::Usb { serial, state } => {
                    if state != "device" {
                        (self.sink)(&format!(
                            "device {serial} is {state}; accept the prompt on the headset if asked"
                        ));
                    }
                    return Ok(self.connection(ConnectionMode::Usb));
                }
                DeviceListing::Wireless { ip, port, state } => {
                    self.last_known_ip = Some(ip.clone());
                    if state == "unauthorized" {
                        (self.sink)("wireless device is unauthorized; confirm the prompt on the headset");
                        return Ok(self.connection(ConnectionMode::Disconnected));
                    }
                    return Ok(self.connection(ConnectionMode::WirelessOnPort { ip, port }));
                }
                DeviceListing::Dual {
                    usb_serial,
                    wireless_serial,
                } => {
                    if self.dual_attachment == DualAttachmentPolicy::Refuse || resolved_dual {
                        return Err(AppError::transport(
                            format!(
                                "device attached over USB ({usb_serial}) and wireless ({wireless_serial}); \
                                 unplug the cable or run `adb disconnect {wireless_serial}`"
                            ),
                            trace_id,
                        ));
                    }
                    warn!(
                        trace_id = %trace_id,
                        usb = %usb_serial,
                        wireless = %wireless_serial,
                        "dual attachment; dropping wireless link"
                    );
                    (self.sink)(&format!(
                        "USB cable detected alongside {wireless_serial}; disconnecting the wireless link"
                    ));
                    runner.run(&self.command(&[], &["disconnect", wireless_serial.as_str()]))?;
                    resolved_dual = true;
                }
                DeviceListing::Unsupported(count) => {
                    return Err(AppError::transport(
                        format!("{count} devices attached; connect only the headset"),
                        trace_id,
                    ));
                }
            }
        }
    }

    /// Puts adbd into network mode and connects to it. Returns `ip:port`, or `None` when
    /// the wireless interface has no address.
    pub fn enable_wireless(
        &mut self,
        runner: &mut dyn CommandRunner,
        trace_id: &str,
    ) -> Result<Option<String>, AppError> {
        let dump = runner.run(&self.command(&[], &["shell", "'ip addr show'"]))?;
        if dump.stdout.trim().is_empty() {
            (self.sink)("connection couldn't be established");
            return Ok(None);
        }
        let Some(ip) = parse_interface_ipv4(&dump.stdout, &self.interface) else {
            (self.sink)(&format!(
                "no IPv4 address on {}; is the headset on Wi-Fi?",
                self.interface
            ));
            return Ok(None);
        };

        let port = self.wireless_port.to_string();
        let tcpip = runner.run(&self.command(&[], &["tcpip", port.as_str()]))?;
        if !tcpip.success() {
            return Err(AppError::dependency(
                format!("adb tcpip failed: {}", tcpip.failure_detail()),
                trace_id,
            ));
        }

        self.last_known_ip = Some(ip.clone());
        self.connect(runner, &ip, trace_id)?;
        let address = format!("{ip}:{}", self.wireless_port);
        info!(trace_id = %trace_id, address = %address, "wireless debugging enabled");
        Ok(Some(address))
    }

    /// Reconnects to the last known address without touching USB.
    pub fn reconnect(
        &mut self,
        runner: &mut dyn CommandRunner,
        trace_id: &str,
    ) -> Result<Option<CommandResult>, AppError> {
        let Some(ip) = self.last_known_ip.clone() else {
            return Ok(None);
        };
        self.connect(runner, &ip, trace_id).map(Some)
    }

    /// Best effort: `adb usb` only helps if the cable is actually attached.
    pub fn force_usb(
        &mut self,
        runner: &mut dyn CommandRunner,
        trace_id: &str,
    ) -> Result<CommandResult, AppError> {
        let output = runner.run(&self.command(&[], &["usb"]))?;
        if !output.success() {
            warn!(trace_id = %trace_id, detail = %output.failure_detail(), "adb usb failed");
            (self.sink)("could not switch to USB mode; make sure the USB cable is attached");
        }
        Ok(output)
    }

    fn connect(
        &self,
        runner: &mut dyn CommandRunner,
        ip: &str,
        trace_id: &str,
    ) -> Result<CommandResult, AppError> {
        let address = format!("{ip}:{}", self.wireless_port);
        let output = runner.run(&self.command(&[], &["connect", address.as_str()]))?;
        let combined = format!("{}{}", output.stdout, output.stderr).to_lowercase();
        if !output.success() || combined.contains("failed") || combined.contains("unable") {
            return Err(AppError::transport(
                format!("adb connect {address} failed: {}", output.failure_detail()),
                trace_id,
            ));
        }
        Ok(output)
    }

    fn connection(&self, mode: ConnectionMode) -> DeviceConnection {
        DeviceConnection {
            mode,
            last_known_ip: self.last_known_ip.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::output::discard_sink;
    use crate::app::test_support::{failed, ok, ScriptedRunner};

    const HEADER: &str = "List of devices attached\n";

    fn link(policy: DualAttachmentPolicy) -> DeviceLink {
        let settings = DeviceSettings {
            dual_attachment: policy,
            ..DeviceSettings::default()
        };
        DeviceLink::new("adb", &settings, discard_sink())
    }

    fn devices(lines: &[&str]) -> crate::app::models::CommandResult {
        ok(&format!("{HEADER}{}\n", lines.join("\n")))
    }

    #[test]
    fn empty_listing_is_disconnected() {
        let mut runner = ScriptedRunner::new().on("adb devices", devices(&[]));
        let conn = link(DualAttachmentPolicy::PreferUsb)
            .query_connection(&mut runner, "t")
            .expect("query");
        assert_eq!(conn.mode, ConnectionMode::Disconnected);
        assert_eq!(conn.last_known_ip, None);
    }

    #[test]
    fn single_wired_serial_is_usb() {
        let mut runner = ScriptedRunner::new().on("adb devices", devices(&["1WMHH8 device"]));
        let conn = link(DualAttachmentPolicy::PreferUsb)
            .query_connection(&mut runner, "t")
            .expect("query");
        assert_eq!(conn.mode, ConnectionMode::Usb);
    }

    #[test]
    fn wireless_serial_is_wireless_and_remembers_ip() {
        let mut runner =
            ScriptedRunner::new().on("adb devices", devices(&["192.168.1.42:5555 device"]));
        let mut link = link(DualAttachmentPolicy::PreferUsb);
        let conn = link.query_connection(&mut runner, "t").expect("query");
        assert_eq!(
            conn.mode,
            ConnectionMode::WirelessOnPort {
                ip: "192.168.1.42".to_string(),
                port: 5555
            }
        );
        assert_eq!(link.last_known_ip(), Some("192.168.1.42"));
        assert_eq!(conn.adb_selector(), vec!["-s", "192.168.1.42:5555"]);
    }

    #[test]
    fn unauthorized_wireless_is_disconnected() {
        let mut runner =
            ScriptedRunner::new().on("adb devices", devices(&["192.168.1.42:5555 unauthorized"]));
        let conn = link(DualAttachmentPolicy::PreferUsb)
            .query_connection(&mut runner, "t")
            .expect("query");
        assert_eq!(conn.mode, ConnectionMode::Disconnected);
        assert_eq!(conn.last_known_ip.as_deref(), Some("192.168.1.42"));
    }

    #[test]
    fn dual_attachment_drops_wireless_and_requeries() {
        let mut runner = ScriptedRunner::new().on_seq(
            "adb devices",
            vec![
                devices(&["1WMHH8 device", "192.168.1.42:5555 device"]),
                devices(&["1WMHH8 device"]),
            ],
        );
        let conn = link(DualAttachmentPolicy::PreferUsb)
            .query_connection(&mut runner, "t")
            .expect("query");
        assert_eq!(conn.mode, ConnectionMode::Usb);
        assert_eq!(runner.count_prefix("adb disconnect 192.168.1.42:5555"), 1);
        assert_eq!(runner.count_prefix("adb devices"), 2);
    }

    #[test]
    fn dual_attachment_can_be_refused() {
        let mut runner = ScriptedRunner::new().on(
            "adb devices",
            devices(&["1WMHH8 device", "192.168.1.42:5555 device"]),
        );
        let err = link(DualAttachmentPolicy::Refuse)
            .query_connection(&mut runner, "t")
            .unwrap_err();
        assert_eq!(err.code, "ERR_TRANSPORT");
        assert_eq!(runner.count_prefix("adb disconnect"), 0);
    }

    #[test]
    fn failing_adb_devices_is_a_dependency_error() {
        let mut runner = ScriptedRunner::new().on("adb devices", failed("adb: not found"));
        let err = link(DualAttachmentPolicy::PreferUsb)
            .query_connection(&mut runner, "t")
            .unwrap_err();
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert!(err.error.contains("adb: not found"));
    }

    #[test]
    fn enable_wireless_switches_to_tcpip_and_connects() {
        let mut runner = ScriptedRunner::new()
            .on(
                "adb shell 'ip addr show'",
                ok("3: wlan0: <UP>\n    inet 192.168.1.42/24 brd 192.168.1.255 scope global wlan0\n"),
            )
            .on("adb connect", ok("connected to 192.168.1.42:5555\n"));
        let mut link = link(DualAttachmentPolicy::PreferUsb);
        let address = link.enable_wireless(&mut runner, "t").expect("enable");
        assert_eq!(address.as_deref(), Some("192.168.1.42:5555"));
        assert_eq!(link.last_known_ip(), Some("192.168.1.42"));
        assert_eq!(
            runner.lines(),
            vec![
                "adb shell 'ip addr show'",
                "adb tcpip 5555",
                "adb connect 192.168.1.42:5555"
            ]
        );
    }

    #[test]
    fn enable_wireless_without_interface_returns_none() {
        let mut runner = ScriptedRunner::new().on(
            "adb shell 'ip addr show'",
            ok("1: lo: <LOOPBACK>\n    inet 127.0.0.1/8 scope host lo\n"),
        );
        let mut link = link(DualAttachmentPolicy::PreferUsb);
        assert_eq!(link.enable_wireless(&mut runner, "t").expect("enable"), None);
        assert_eq!(runner.count_prefix("adb tcpip"), 0);
        assert_eq!(link.last_known_ip(), None);
    }

    #[test]
    fn reconnect_requires_known_ip() {
        let mut runner = ScriptedRunner::new();
        let mut link = link(DualAttachmentPolicy::PreferUsb);
        assert_eq!(link.reconnect(&mut runner, "t").expect("reconnect"), None);
        assert!(runner.calls.is_empty());

        let mut runner = ScriptedRunner::new().on(
            "adb connect",
            ok("failed to connect to '192.168.1.42:5555': Connection refused\n"),
        );
        link.remember_ip("192.168.1.42");
        let err = link.reconnect(&mut runner, "t").unwrap_err();
        assert_eq!(err.code, "ERR_TRANSPORT");
    }

    #[test]
    fn force_usb_is_best_effort() {
        let mut runner = ScriptedRunner::new().on("adb usb", failed("error: no devices/emulators found"));
        let output = link(DualAttachmentPolicy::PreferUsb)
            .force_usb(&mut runner, "t")
            .expect("best effort");
        assert!(!output.success());
    }
}
