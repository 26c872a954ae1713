//! Saved connection profiles and the station-side probes.
//!
//! Profiles are owned by NetworkManager. This module only lists, activates,
//! creates and deletes them; credentials are never edited in place.
//!
//! # Commands Executed
//! ```bash
//! nmcli -t -f NAME,TYPE,DEVICE connection show [--active]
//! nmcli -t -f 802-11-wireless.ssid,802-11-wireless.mode,... connection show <name>
//! nmcli connection up <name>
//! nmcli device wifi connect <ssid> [password <passphrase>] ifname <interface>
//! nmcli connection delete <name>
//! ```

use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::nmcli::{self, Nmcli};
use crate::scan::SecurityKind;

const PROFILE_FIELDS: &str = "802-11-wireless.ssid,802-11-wireless.mode,802-11-wireless.bssid,802-11-wireless-security.key-mgmt";

/// A WiFi connection profile stored by NetworkManager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedConnectionProfile {
    pub name: String,
    pub ssid: String,
    pub security: SecurityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bssid: Option<String>,
    /// Profiles in `ap` mode are this host's own access points.
    #[serde(skip)]
    pub is_access_point: bool,
}

/// The network the host is currently associated with as a station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedNetwork {
    pub ssid: String,
    pub interface: String,
    pub security: SecurityKind,
    pub connection_name: String,
}

/// Reads the WiFi settings of the profile called `name`.
pub async fn profile_details(nmcli: &Nmcli, name: &str) -> Result<SavedConnectionProfile> {
    let stdout = nmcli
        .run(&["-t", "-f", PROFILE_FIELDS, "connection", "show", name])
        .await?;
    let props = nmcli::parse_properties(&stdout);
    let field = |key: &str| {
        props
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty() && *v != "--")
    };

    Ok(SavedConnectionProfile {
        name: name.to_string(),
        ssid: field("802-11-wireless.ssid").unwrap_or_default().to_string(),
        security: nmcli::parse_key_mgmt(field("802-11-wireless-security.key-mgmt").unwrap_or("")),
        bssid: field("802-11-wireless.bssid").map(str::to_uppercase),
        is_access_point: field("802-11-wireless.mode")
            .is_some_and(|m| m.eq_ignore_ascii_case("ap")),
    })
}

/// All saved WiFi profiles, access points included.
pub async fn list_saved_profiles(nmcli: &Nmcli) -> Result<Vec<SavedConnectionProfile>> {
    let stdout = nmcli
        .run(&["-t", "-f", "NAME,TYPE,DEVICE", "connection", "show"])
        .await?;

    let mut profiles = Vec::new();
    for row in nmcli::parse_connection_rows(&stdout)
        .into_iter()
        .filter(|r| r.is_wifi())
    {
        match profile_details(nmcli, &row.name).await {
            Ok(profile) if !profile.ssid.is_empty() => profiles.push(profile),
            Ok(_) => debug!("Skipping profile {} without SSID", row.name),
            Err(e) => debug!("Skipping profile {}: {}", row.name, e),
        }
    }
    Ok(profiles)
}

/// The active station connection, ignoring this host's own access points.
pub async fn connected_network(nmcli: &Nmcli) -> Result<Option<ConnectedNetwork>> {
    let stdout = nmcli
        .run(&["-t", "-f", "NAME,TYPE,DEVICE", "connection", "show", "--active"])
        .await?;

    for row in nmcli::parse_connection_rows(&stdout)
        .into_iter()
        .filter(|r| r.is_wifi())
    {
        let Some(device) = row.device else {
            continue;
        };
        let profile = match profile_details(nmcli, &row.name).await {
            Ok(profile) => profile,
            Err(e) => {
                debug!("Cannot inspect active connection {}: {}", row.name, e);
                continue;
            }
        };
        if profile.is_access_point || profile.ssid.is_empty() {
            continue;
        }
        return Ok(Some(ConnectedNetwork {
            ssid: profile.ssid,
            interface: device,
            security: profile.security,
            connection_name: row.name,
        }));
    }

    Ok(None)
}

pub async fn profile_exists(nmcli: &Nmcli, name: &str) -> Result<bool> {
    Ok(nmcli
        .output(&["connection", "show", name])
        .await?
        .success())
}

/// Activates an existing profile by name.
pub async fn activate(nmcli: &Nmcli, name: &str, timeout: Duration) -> Result<()> {
    info!("Activating connection '{}'", name);
    nmcli
        .run_within(&["connection", "up", name], timeout)
        .await
        .map(drop)
}

/// Creates a profile for `ssid` and activates it in one step.
pub async fn connect_new(
    nmcli: &Nmcli,
    interface: &str,
    ssid: &str,
    passphrase: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    info!("Connecting to '{}' on interface {}", ssid, interface);
    let mut args = vec!["device", "wifi", "connect", ssid];
    if let Some(passphrase) = passphrase.filter(|p| !p.is_empty()) {
        args.extend(["password", passphrase]);
    }
    args.extend(["ifname", interface]);

    nmcli.run_within(&args, timeout).await.map(drop)
}

/// Deletes a saved connection profile by name.
pub async fn delete_connection(nmcli: &Nmcli, name: &str) -> Result<()> {
    nmcli
        .run(&["connection", "delete", name])
        .await
        .map(drop)
}

/// Displays the connected network in a human-readable format.
///
/// ```text
/// Connected: Home
/// SSID:      Home
/// Security:  wpa2
/// Interface: wlan0
/// ```
pub fn display_connected(connected: Option<&ConnectedNetwork>) {
    match connected {
        Some(network) => {
            println!("Connected: {}", network.connection_name);
            println!("SSID:      {}", network.ssid);
            println!("Security:  {}", network.security);
            println!("Interface: {}", network.interface);
        }
        None => println!("Connected: (none)"),
    }
}

pub fn display_saved(profiles: &[SavedConnectionProfile]) {
    if profiles.is_empty() {
        println!("No saved networks found.");
        return;
    }

    println!("{:<24} {:<32} {}", "NAME", "SSID", "SECURITY");
    println!("{}", "-".repeat(66));
    for profile in profiles {
        println!("{:<24} {:<32} {}", profile.name, profile.ssid, profile.security);
    }
}
