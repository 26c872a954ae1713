//! Thin adapter over NetworkManager's `nmcli` tool.
//!
//! All invocations use terse output (`-t`), where fields are separated by
//! `:` and literal colons inside values are escaped as `\:`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::error::{Result, WifiError};
use crate::exec::{self, CommandOutput, CommandRunner};
use crate::scan::{Band, NetworkRecord, SecurityKind};

const NMCLI: &str = "nmcli";

#[derive(Clone)]
pub struct Nmcli {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl Nmcli {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Nmcli { runner, timeout }
    }

    /// Raw output; a non-zero exit status is left for the caller to inspect.
    pub async fn output(&self, args: &[&str]) -> Result<CommandOutput> {
        self.output_within(args, self.timeout).await
    }

    pub async fn output_within(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        self.runner.run(NMCLI, args, timeout).await
    }

    /// Stdout of a successful invocation, `CommandFailed` otherwise.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_within(args, self.timeout).await
    }

    pub async fn run_within(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let output = self.output_within(args, timeout).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            let command = exec::render(NMCLI, args);
            debug!("{} exited with {:?}", command, output.status);
            Err(WifiError::CommandFailed {
                command,
                message: output.diagnostic().to_string(),
            })
        }
    }
}

/// Splits a terse output line on unescaped colons, unescaping `\:` and `\\`.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => current.push('\\'),
            },
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Security column of `device wifi list`, e.g. `WPA1 WPA2` or `WPA2 802.1X`.
pub fn parse_security(value: &str) -> SecurityKind {
    let value = value.to_lowercase();
    if value.contains("wpa3") {
        SecurityKind::Wpa3
    } else if value.contains("wpa2") {
        SecurityKind::Wpa2
    } else if value.contains("wpa") {
        SecurityKind::Wpa
    } else if value.contains("wep") {
        SecurityKind::Wep
    } else {
        SecurityKind::Open
    }
}

/// `802-11-wireless-security.key-mgmt` of a saved profile.
pub fn parse_key_mgmt(value: &str) -> SecurityKind {
    match value.trim().to_lowercase().as_str() {
        "sae" | "wpa-eap-suite-b-192" => SecurityKind::Wpa3,
        "wpa-psk" | "wpa-eap" => SecurityKind::Wpa2,
        "none" | "ieee8021x" => SecurityKind::Wep,
        _ => SecurityKind::Open,
    }
}

/// Signal as a percentage; dBm readings are mapped linearly from -100..-50.
pub fn parse_signal(value: &str) -> u8 {
    let cleaned = value.trim().trim_end_matches("dBm").trim();
    let Ok(signal) = cleaned.parse::<i32>() else {
        return 0;
    };

    match signal {
        0..=100 => signal as u8,
        s if s > 100 => 100,
        s if s <= -100 => 0,
        s if s >= -50 => 100,
        s => ((s + 100) * 2) as u8,
    }
}

pub fn parse_band(channel: &str) -> Band {
    match channel.trim().parse::<u32>() {
        Ok(1..=14) => Band::Ghz2_4,
        Ok(36..=64) | Ok(100..=165) => Band::Ghz5,
        Ok(1..=233) => Band::Ghz6,
        _ => Band::Unknown,
    }
}

/// Parses `-f ACTIVE,SSID,BSSID,SECURITY,CHAN,SIGNAL device wifi list`.
///
/// Hidden networks are skipped and duplicate access points are suppressed,
/// keeping the first occurrence.
pub fn parse_network_list(stdout: &str) -> Vec<NetworkRecord> {
    let mut seen = HashSet::new();
    let mut networks = Vec::new();

    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let fields = split_terse(line);
        if fields.len() < 6 {
            debug!("Skipping malformed scan line: {}", line);
            continue;
        }

        let ssid = fields[1].clone();
        if ssid.is_empty() || ssid == "--" {
            continue;
        }

        let bssid = Some(fields[2].trim().to_uppercase()).filter(|b| !b.is_empty() && b != "--");
        let record = NetworkRecord {
            ssid,
            security: parse_security(&fields[3]),
            signal_strength: parse_signal(&fields[5]),
            frequency_band: parse_band(&fields[4]),
            active: matches!(fields[0].trim(), "*" | "yes"),
            bssid,
        };

        if !seen.insert(record.key().to_string()) {
            debug!("Skipping duplicate access point {}", record.key());
            continue;
        }
        networks.push(record);
    }

    networks
}

/// Parses `-f DEVICE,TYPE,STATE device status` into `(device, state)` pairs
/// of wifi devices.
pub fn parse_wifi_devices(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .map(split_terse)
        .filter(|fields| fields.len() >= 2 && fields[1] == "wifi")
        .map(|mut fields| {
            let state = fields.get(2).cloned().unwrap_or_default();
            (fields.swap_remove(0), state)
        })
        .collect()
}

/// `(name, state)` pairs from `-f NAME,STATE connection show --active`.
pub fn parse_connection_states(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with("Warning:"))
        .map(split_terse)
        .filter(|fields| fields.len() >= 2)
        .map(|mut fields| {
            let state = fields.swap_remove(1);
            (fields.swap_remove(0), state)
        })
        .collect()
}

/// A row of `-f NAME,TYPE,DEVICE connection show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRow {
    pub name: String,
    pub kind: String,
    pub device: Option<String>,
}

impl ConnectionRow {
    pub fn is_wifi(&self) -> bool {
        matches!(self.kind.as_str(), "802-11-wireless" | "wifi")
    }
}

pub fn parse_connection_rows(stdout: &str) -> Vec<ConnectionRow> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with("Warning:"))
        .map(split_terse)
        .filter(|fields| fields.len() >= 2)
        .map(|fields| ConnectionRow {
            name: fields[0].clone(),
            kind: fields[1].clone(),
            device: fields
                .get(2)
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty() && d != "--"),
        })
        .collect()
}

/// Parses `key:value` lines of `connection show <name>`. Keys are lowercased,
/// values split on the first colon only and unescaped.
pub fn parse_properties(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter(|l| !l.starts_with("Warning:"))
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().replace("\\:", ":")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_handles_escaped_colons() {
        let fields = split_terse(r"*:Home:00\:B8\:C2\:01\:7B\:8C:WPA2:6:81");
        assert_eq!(
            fields,
            vec!["*", "Home", "00:B8:C2:01:7B:8C", "WPA2", "6", "81"]
        );
        assert_eq!(split_terse(r"a\\:b"), vec![r"a\", "b"]);
    }

    #[test]
    fn security_prefers_strongest() {
        assert_eq!(parse_security("WPA2 WPA3"), SecurityKind::Wpa3);
        assert_eq!(parse_security("WPA1 WPA2"), SecurityKind::Wpa2);
        assert_eq!(parse_security("WPA1"), SecurityKind::Wpa);
        assert_eq!(parse_security("WEP"), SecurityKind::Wep);
        assert_eq!(parse_security(""), SecurityKind::Open);
        assert_eq!(parse_security("--"), SecurityKind::Open);
    }

    #[test]
    fn key_mgmt_mapping() {
        assert_eq!(parse_key_mgmt("sae"), SecurityKind::Wpa3);
        assert_eq!(parse_key_mgmt("wpa-psk"), SecurityKind::Wpa2);
        assert_eq!(parse_key_mgmt("none"), SecurityKind::Wep);
        assert_eq!(parse_key_mgmt(""), SecurityKind::Open);
    }

    #[test]
    fn signal_percent_and_dbm() {
        assert_eq!(parse_signal("81"), 81);
        assert_eq!(parse_signal("-75 dBm"), 50);
        assert_eq!(parse_signal("-40"), 100);
        assert_eq!(parse_signal("-120"), 0);
        assert_eq!(parse_signal("250"), 100);
        assert_eq!(parse_signal("N/A"), 0);
    }

    #[test]
    fn band_from_channel() {
        assert_eq!(parse_band("6"), Band::Ghz2_4);
        assert_eq!(parse_band("36"), Band::Ghz5);
        assert_eq!(parse_band("149"), Band::Ghz5);
        assert_eq!(parse_band("191"), Band::Ghz6);
        assert_eq!(parse_band("N/A"), Band::Unknown);
        assert_eq!(parse_band("300"), Band::Unknown);
    }

    #[test]
    fn duplicate_bssid_keeps_first() {
        let stdout = "\
no:Home:AA\\:BB\\:CC\\:DD\\:EE\\:01:WPA2:6:81
no:Home:AA\\:BB\\:CC\\:DD\\:EE\\:01:WPA2:6:40
no:Home:AA\\:BB\\:CC\\:DD\\:EE\\:02:WPA2:36:60
";
        let networks = parse_network_list(stdout);
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].signal_strength, 81);
        assert_eq!(networks[0].bssid.as_deref(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(networks[1].frequency_band, Band::Ghz5);
    }

    #[test]
    fn hidden_and_malformed_lines_are_skipped() {
        let stdout = "\
no::AA\\:BB\\:CC\\:DD\\:EE\\:01:WPA2:6:81
yes:Cafe:AA\\:BB\\:CC\\:DD\\:EE\\:02::11:55
garbage
";
        let networks = parse_network_list(stdout);
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].ssid, "Cafe");
        assert!(networks[0].active);
        assert_eq!(networks[0].security, SecurityKind::Open);
    }

    #[test]
    fn wifi_devices_only() {
        let stdout = "eth0:ethernet:connected\nwlan0:wifi:disconnected\nlo:loopback:unmanaged\n";
        assert_eq!(
            parse_wifi_devices(stdout),
            vec![("wlan0".to_string(), "disconnected".to_string())]
        );
    }

    #[test]
    fn connection_rows_and_properties() {
        let rows = parse_connection_rows(
            "Home:802-11-wireless:wlan0\nWired:802-3-ethernet:eth0\nCafe:802-11-wireless:\n",
        );
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_wifi());
        assert_eq!(rows[0].device.as_deref(), Some("wlan0"));
        assert!(!rows[1].is_wifi());
        assert_eq!(rows[2].device, None);

        let props = parse_properties(
            "802-11-wireless.ssid:Home\n802-11-wireless.bssid:AA:BB:CC:DD:EE:01\n802-11-wireless.mode:infrastructure\n",
        );
        assert_eq!(props["802-11-wireless.bssid"], "AA:BB:CC:DD:EE:01");
        assert_eq!(props["802-11-wireless.mode"], "infrastructure");
    }

    #[test]
    fn connection_states_keep_escaped_names() {
        let states = parse_connection_states("Guest\\:5G:activating\nconnectInterface:activated\n");
        assert_eq!(
            states,
            vec![
                ("Guest:5G".to_string(), "activating".to_string()),
                ("connectInterface".to_string(), "activated".to_string()),
            ]
        );
    }
}
