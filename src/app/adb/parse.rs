use std::net::Ipv4Addr;
use std::sync::OnceLock;

use regex::Regex;

use crate::app::models::DeviceSummary;

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?.to_string();
            let state = tokens.next()?.to_string();
            Some(DeviceSummary { serial, state })
        })
        .collect()
}

/// What `adb devices` shows, before any policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceListing {
    Empty,
    Usb {
        serial: String,
        state: String,
    },
    Wireless {
        ip: String,
        port: u16,
        state: String,
    },
    /// One wired and one wireless entry for what is normally the same headset.
    Dual {
        usb_serial: String,
        wireless_serial: String,
    },
    /// Any other multi-device layout; not something this tool drives.
    Unsupported(usize),
}

pub fn wireless_suffix(port: u16) -> String {
    format!(":{port}")
}

pub fn is_wireless_serial(serial: &str, port: u16) -> bool {
    serial.ends_with(&wireless_suffix(port))
}

pub fn classify_devices(devices: &[DeviceSummary], wireless_port: u16) -> DeviceListing {
    match devices {
        [] => DeviceListing::Empty,
        [single] => {
            if is_wireless_serial(&single.serial, wireless_port) {
                let ip = single
                    .serial
                    .trim_end_matches(&wireless_suffix(wireless_port))
                    .to_string();
                DeviceListing::Wireless {
                    ip,
                    port: wireless_port,
                    state: single.state.clone(),
                }
            } else {
                DeviceListing::Usb {
                    serial: single.serial.clone(),
                    state: single.state.clone(),
                }
            }
        }
        [first, second] => {
            let first_wireless = is_wireless_serial(&first.serial, wireless_port);
            let second_wireless = is_wireless_serial(&second.serial, wireless_port);
            match (first_wireless, second_wireless) {
                (true, false) => DeviceListing::Dual {
                    usb_serial: second.serial.clone(),
                    wireless_serial: first.serial.clone(),
                },
                (false, true) => DeviceListing::Dual {
                    usb_serial: first.serial.clone(),
                    wireless_serial: second.serial.clone(),
                },
                _ => DeviceListing::Unsupported(2),
            }
        }
        many => DeviceListing::Unsupported(many.len()),
    }
}

/// IPv4 address of `interface` from `ip addr show` output.
///
/// Only the interface's own block is searched, so a down interface does not pick up the
/// address of whatever follows it.
pub fn parse_interface_ipv4(dump: &str, interface: &str) -> Option<String> {
    let (header_re, inet_re) = interface_patterns()?;

    let label_at = find_interface_label(dump, interface)?;
    let block = &dump[label_at..];
    let block_end = header_re
        .find_iter(block)
        .map(|found| found.start())
        .find(|start| *start > 0)
        .unwrap_or(block.len());
    let block = &block[..block_end];

    let caps = inet_re.captures(block)?;
    let candidate = caps.get(1)?.as_str();
    candidate.parse::<Ipv4Addr>().ok()?;
    Some(candidate.to_string())
}

fn interface_patterns() -> Option<(&'static Regex, &'static Regex)> {
    static HEADER: OnceLock<Option<Regex>> = OnceLock::new();
    static INET: OnceLock<Option<Regex>> = OnceLock::new();
    let header = HEADER.get_or_init(|| Regex::new(r"(?m)^\d+:\s").ok());
    let inet = INET.get_or_init(|| Regex::new(r"\binet\s+(\d{1,3}(?:\.\d{1,3}){3})/").ok());
    Some((header.as_ref()?, inet.as_ref()?))
}

fn find_interface_label(dump: &str, interface: &str) -> Option<usize> {
    // Prefer the block header ("3: wlan0: <...>"); fall back to the first mention.
    let header = format!(" {interface}:");
    dump.find(&header)
        .map(|index| index + 1)
        .or_else(|| dump.find(interface))
}

/// Human-readable app title from `aapt dump badging`.
pub fn parse_badging_label(dump: &str) -> Option<String> {
    let primary = extract_quoted_after(dump, "application: label='");
    let fallback = || extract_quoted_after(dump, "application-label:'");
    primary
        .or_else(fallback)
        .filter(|label| !label.is_empty())
}

/// Package identifier from the `package: name='…'` line of `aapt dump badging`.
pub fn parse_badging_package(dump: &str) -> Option<String> {
    extract_quoted_after(dump, "package: name='").filter(|name| !name.is_empty())
}

fn extract_quoted_after(dump: &str, marker: &str) -> Option<String> {
    let (_, tail) = dump.split_once(marker)?;
    let value = tail.split('\'').next()?;
    Some(
        value
            .trim_matches(|c: char| c == '\'' || c == '"' || c.is_whitespace())
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_ADDR_SHOW: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN group default qlen 1000
    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
    inet 127.0.0.1/8 scope host lo
       valid_lft forever preferred_lft forever
3: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc mq state UP group default qlen 3000
    link/ether 2c:26:17:aa:bb:cc brd ff:ff:ff:ff:ff:ff
    inet 192.168.1.42/24 brd 192.168.1.255 scope global wlan0
       valid_lft forever preferred_lft forever
    inet6 fe80::2e26:17ff:feaa:bbcc/64 scope link
       valid_lft forever preferred_lft forever
";

    fn summary(serial: &str, state: &str) -> DeviceSummary {
        DeviceSummary {
            serial: serial.to_string(),
            state: state.to_string(),
        }
    }

    #[test]
    fn parses_adb_devices_output() {
        let output = "List of devices attached\n1WMHH812345678 device product:hollywood model:Quest_2 device:hollywood transport_id:1\n192.168.1.42:5555 unauthorized transport_id:2\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].serial, "1WMHH812345678");
        assert_eq!(parsed[0].state, "device");
        assert_eq!(parsed[1].state, "unauthorized");
    }

    #[test]
    fn interface_patterns_are_compiled_once() {
        let (header_a, inet_a) = interface_patterns().expect("patterns");
        let (header_b, inet_b) = interface_patterns().expect("patterns");
        assert!(std::ptr::eq(header_a, header_b));
        assert!(std::ptr::eq(inet_a, inet_b));
    }

    #[test]
    fn ignores_daemon_startup_noise() {
        let output = "* daemon not running; starting now at tcp:5037\n* daemon started successfully\nList of devices attached\n\n";
        assert!(parse_adb_devices(output).is_empty());
    }

    #[test]
    fn classifies_empty_listing() {
        assert_eq!(classify_devices(&[], 5555), DeviceListing::Empty);
    }

    #[test]
    fn classifies_single_usb_regardless_of_state() {
        for state in ["device", "unauthorized", "offline"] {
            let listing = classify_devices(&[summary("1WMHH812345678", state)], 5555);
            assert!(matches!(listing, DeviceListing::Usb { .. }), "{state}");
        }
    }

    #[test]
    fn classifies_wireless_by_port_suffix() {
        let listing = classify_devices(&[summary("192.168.1.42:5555", "device")], 5555);
        assert_eq!(
            listing,
            DeviceListing::Wireless {
                ip: "192.168.1.42".to_string(),
                port: 5555,
                state: "device".to_string(),
            }
        );
        // A different port is not ours.
        let listing = classify_devices(&[summary("192.168.1.42:37099", "device")], 5555);
        assert!(matches!(listing, DeviceListing::Usb { .. }));
    }

    #[test]
    fn classifies_dual_attachment_in_either_order() {
        let usb = summary("1WMHH812345678", "device");
        let wifi = summary("192.168.1.42:5555", "device");
        let expected = DeviceListing::Dual {
            usb_serial: "1WMHH812345678".to_string(),
            wireless_serial: "192.168.1.42:5555".to_string(),
        };
        assert_eq!(classify_devices(&[usb.clone(), wifi.clone()], 5555), expected);
        assert_eq!(classify_devices(&[wifi, usb], 5555), expected);
    }

    #[test]
    fn two_wired_devices_are_unsupported() {
        let listing = classify_devices(&[summary("A", "device"), summary("B", "device")], 5555);
        assert_eq!(listing, DeviceListing::Unsupported(2));
    }

    #[test]
    fn extracts_wlan_ipv4() {
        assert_eq!(
            parse_interface_ipv4(IP_ADDR_SHOW, "wlan0").as_deref(),
            Some("192.168.1.42")
        );
    }

    #[test]
    fn extracts_ipv4_from_compact_dump() {
        let dump = "wlan0 ... inet 192.168.1.42/24 ...";
        assert_eq!(parse_interface_ipv4(dump, "wlan0").as_deref(), Some("192.168.1.42"));
    }

    #[test]
    fn missing_interface_yields_none() {
        let dump = "1: lo: <LOOPBACK>\n    inet 127.0.0.1/8 scope host lo\n";
        assert_eq!(parse_interface_ipv4(dump, "wlan0"), None);
    }

    #[test]
    fn down_interface_does_not_borrow_next_address() {
        let dump = "3: wlan0: <BROADCAST,MULTICAST> state DOWN\n    link/ether 2c:26:17:aa:bb:cc\n4: rmnet0: <UP>\n    inet 10.0.0.5/30 scope global rmnet0\n";
        assert_eq!(parse_interface_ipv4(dump, "wlan0"), None);
    }

    #[test]
    fn parses_badging_label_and_package() {
        let dump = "package: name='com.beatgames.beatsaber' versionCode='1130' versionName='1.29.0'\nsdkVersion:'29'\napplication-label:'Beat Saber'\napplication: label='Beat Saber' icon='res/mipmap/app_icon.png'\n";
        assert_eq!(parse_badging_label(dump).as_deref(), Some("Beat Saber"));
        assert_eq!(
            parse_badging_package(dump).as_deref(),
            Some("com.beatgames.beatsaber")
        );
    }

    #[test]
    fn badging_label_falls_back_to_application_label() {
        let dump = "package: name='com.a'\napplication-label:' Padded Title '\n";
        assert_eq!(parse_badging_label(dump).as_deref(), Some("Padded Title"));
    }

    #[test]
    fn badging_without_label_is_none() {
        assert_eq!(parse_badging_label("package: name='com.a'\n"), None);
        assert_eq!(parse_badging_package("ERROR: dump failed"), None);
    }
}
