//! WiFi network scanning and the process-wide scan cache.
//!
//! # Scanning Process
//!
//! 1. Triggers a rescan on the interface using `nmcli device wifi rescan`
//! 2. Waits for the radio to finish (`rescan_delay`)
//! 3. Lists the discovered networks using `nmcli device wifi list`
//! 4. Repeats from step 1 while the listing [looks incomplete](result_looks_incomplete),
//!    up to a fixed number of attempts
//! 5. Parses and deduplicates the results, keeping scan order
//!
//! The result of the last live scan is kept in a [`ScanCache`] so the UI can
//! list networks without tearing down an active access point.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Result;
use crate::nmcli::{self, Nmcli};

/// Encryption advertised by a network or required by a saved profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityKind {
    #[default]
    Open,
    Wep,
    Wpa,
    Wpa2,
    Wpa3,
}

impl SecurityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityKind::Open => "open",
            SecurityKind::Wep => "wep",
            SecurityKind::Wpa => "wpa",
            SecurityKind::Wpa2 => "wpa2",
            SecurityKind::Wpa3 => "wpa3",
        }
    }
}

impl fmt::Display for SecurityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Band {
    #[serde(rename = "2.4GHz")]
    Ghz2_4,
    #[serde(rename = "5GHz")]
    Ghz5,
    #[serde(rename = "6GHz")]
    Ghz6,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl Band {
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Ghz2_4 => "2.4GHz",
            Band::Ghz5 => "5GHz",
            Band::Ghz6 => "6GHz",
            Band::Unknown => "unknown",
        }
    }
}

/// A network seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub ssid: String,
    pub security: SecurityKind,
    /// Signal strength as a percentage (0-100).
    pub signal_strength: u8,
    pub frequency_band: Band,
    /// Whether the host is currently associated with this access point.
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bssid: Option<String>,
}

impl NetworkRecord {
    /// Identity used for deduplication: the BSSID when known, else the SSID.
    pub fn key(&self) -> &str {
        self.bssid.as_deref().unwrap_or(&self.ssid)
    }
}

/// Heuristic for "the radio has not finished rescanning yet".
///
/// Right after leaving access-point mode drivers often report only the
/// network the radio was last tuned to, or nothing at all.
pub fn result_looks_incomplete(records: &[NetworkRecord]) -> bool {
    records.len() <= 1
}

#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    /// Number of list attempts before the last result is accepted as-is.
    pub attempts: u32,
    /// Pause between a rescan request and listing.
    pub rescan_delay: Duration,
}

/// Runs a live scan on `interface`, retrying while the result looks incomplete.
///
/// The rescan request may fail when the radio is busy; that is logged and the
/// listing still returns whatever NetworkManager last saw. A failing listing
/// is retried and only reported once the attempts are exhausted.
pub async fn scan_live(
    nmcli: &Nmcli,
    interface: &str,
    settings: ScanSettings,
) -> Result<Vec<NetworkRecord>> {
    let attempts = settings.attempts.max(1);
    let mut listed: Option<Vec<NetworkRecord>> = None;
    let mut last_error = None;

    for attempt in 1..=attempts {
        match nmcli
            .output(&["device", "wifi", "rescan", "ifname", interface])
            .await
        {
            Ok(output) if !output.success() => {
                warn!("Rescan request failed: {}", output.diagnostic())
            }
            Ok(_) => {}
            Err(e) => warn!("Rescan request failed: {}", e),
        }
        tokio::time::sleep(settings.rescan_delay).await;

        match nmcli
            .run(&[
                "-t",
                "-f",
                "ACTIVE,SSID,BSSID,SECURITY,CHAN,SIGNAL",
                "device",
                "wifi",
                "list",
                "ifname",
                interface,
            ])
            .await
        {
            Ok(stdout) => {
                let records = nmcli::parse_network_list(&stdout);
                let incomplete = result_looks_incomplete(&records);
                if incomplete && attempt < attempts {
                    info!(
                        "Scan attempt {}/{} found {} network(s), rescanning",
                        attempt,
                        attempts,
                        records.len()
                    );
                }
                listed = Some(records);
                if !incomplete {
                    break;
                }
            }
            Err(e) => {
                warn!("Scan attempt {}/{} failed: {}", attempt, attempts, e);
                last_error = Some(e);
            }
        }
    }

    match (listed, last_error) {
        (Some(records), _) => {
            debug!("Scan found {} network(s)", records.len());
            Ok(records)
        }
        (None, Some(e)) => Err(e),
        (None, None) => Ok(Vec::new()),
    }
}

/// The last scan result and when it was captured.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCacheEntry {
    pub records: Vec<NetworkRecord>,
    pub captured_at: Instant,
}

/// Holds exactly one scan result, replaced atomically.
///
/// Two read modes are offered: [`get`](ScanCache::get) honours the TTL, while
/// [`last_known`](ScanCache::last_known) answers "has a scan ever happened".
#[derive(Debug)]
pub struct ScanCache {
    ttl: Duration,
    entry: RwLock<Option<Arc<ScanCacheEntry>>>,
}

impl ScanCache {
    pub fn new(ttl: Duration) -> Self {
        ScanCache {
            ttl,
            entry: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached entry, if one exists and its TTL has not elapsed.
    pub fn get(&self) -> Option<Arc<ScanCacheEntry>> {
        self.last_known()
            .filter(|entry| entry.captured_at.elapsed() < self.ttl)
    }

    /// The cached entry regardless of its age.
    pub fn last_known(&self) -> Option<Arc<ScanCacheEntry>> {
        self.entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn put(&self, records: Vec<NetworkRecord>) {
        let entry = Arc::new(ScanCacheEntry {
            records,
            captured_at: Instant::now(),
        });
        debug!("Caching {} network(s)", entry.records.len());
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = Some(entry);
    }

    pub fn invalidate(&self) {
        let previous = self
            .entry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            debug!("Scan cache invalidated");
        }
    }
}

/// Displays a list of networks in a formatted table.
///
/// # Output Format
/// ```text
/// SSID                             SIGNAL      BAND    SECURITY
/// ----------------------------------------------------------------------
/// MyHomeNetwork                      95% ████  5GHz    wpa2 *
/// OpenCafe                           45% ██░░  2.4GHz  open
/// ```
///
/// The trailing `*` marks the network the host is associated with.
pub fn display_networks(networks: &[NetworkRecord]) {
    if networks.is_empty() {
        println!("No networks found.");
        return;
    }

    println!(
        "{:<32} {:>6}      {:<7} {}",
        "SSID", "SIGNAL", "BAND", "SECURITY"
    );
    println!("{}", "-".repeat(70));

    for network in networks {
        println!(
            "{:<32} {:>3}% {}  {:<7} {}{}",
            truncate_ssid(&network.ssid, 32),
            network.signal_strength,
            signal_to_bar(network.signal_strength),
            network.frequency_band.as_str(),
            network.security,
            if network.active { " *" } else { "" }
        );
    }
}

fn truncate_ssid(ssid: &str, max_len: usize) -> String {
    if ssid.chars().count() > max_len {
        let truncated: String = ssid.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    } else {
        ssid.to_string()
    }
}

fn signal_to_bar(signal: u8) -> &'static str {
    match signal {
        80..=100 => "████",
        60..=79 => "███░",
        40..=59 => "██░░",
        20..=39 => "█░░░",
        _ => "░░░░",
    }
}
