//! Use cases behind the API and CLI: scan, connect, forget, startup recovery.
//!
//! Every operation that has to take an access point down to do its work puts
//! the access point back before returning an error, so the host is never
//! left without a way to reach it.

use std::fmt;
use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;

use crate::config::Config;
use crate::connection::{self, ConnectedNetwork, SavedConnectionProfile};
use crate::dhcp::{DhcpServer, Dnsmasq, DnsmasqOptions};
use crate::error::{Result, WifiError};
use crate::exec::{CommandRunner, SystemRunner};
use crate::interface::{self, WifiInterface};
use crate::nmcli::Nmcli;
use crate::orchestrator::{AccessPointKind, ModeOrchestrator, OperatingMode};
use crate::scan::{self, NetworkRecord, ScanCache, ScanCacheEntry, ScanSettings};
use crate::state::{PersistedMode, PersistedState, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Last known result regardless of age. With nothing cached it scans
    /// without touching an active access point.
    Cached,
    /// Scans live, suspending an active access point around the scan.
    LiveIfPossible,
    /// Always scans live, suspending an active access point if needed.
    ForceLive,
}

impl ScanMode {
    pub fn from_flags(use_cache: bool, force_scan: bool) -> Self {
        if force_scan {
            ScanMode::ForceLive
        } else if use_cache {
            ScanMode::Cached
        } else {
            ScanMode::LiveIfPossible
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub networks: Vec<NetworkRecord>,
    pub cached: bool,
    pub age_secs: u64,
}

impl ScanReport {
    fn live(networks: Vec<NetworkRecord>) -> Self {
        ScanReport {
            networks,
            cached: false,
            age_secs: 0,
        }
    }

    fn cached(entry: &ScanCacheEntry) -> Self {
        ScanReport {
            networks: entry.records.clone(),
            cached: true,
            age_secs: entry.captured_at.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub access_point_active: bool,
    pub access_point: Option<AccessPointKind>,
    pub cache_available: bool,
    pub cache_fresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForgetReport {
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
    /// Whether the provisioning access point is up after the operation.
    pub provisioning_active: bool,
}

impl ForgetReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Which saved profiles a forget request targets.
enum Selector {
    Bssid(String),
    Ssid(String),
}

impl Selector {
    fn matches(&self, profile: &SavedConnectionProfile) -> bool {
        match self {
            Selector::Bssid(bssid) => profile.bssid.as_deref() == Some(bssid.as_str()),
            Selector::Ssid(ssid) => profile.ssid == *ssid,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Bssid(bssid) => write!(f, "BSSID {}", bssid),
            Selector::Ssid(ssid) => write!(f, "SSID '{}'", ssid),
        }
    }
}

pub struct Connectivity {
    nmcli: Nmcli,
    orchestrator: ModeOrchestrator,
    cache: Arc<ScanCache>,
    store: StateStore,
    config: Arc<Config>,
}

impl Connectivity {
    pub fn new(
        config: Arc<Config>,
        runner: Arc<dyn CommandRunner>,
        dhcp: Box<dyn DhcpServer>,
    ) -> Self {
        let nmcli = Nmcli::new(runner, config.wifi.command_timeout());
        let cache = Arc::new(ScanCache::new(config.wifi.scan_ttl()));
        let store = StateStore::new(config.wifi.state_file(), config.wifi.state_max_age());
        let orchestrator = ModeOrchestrator::new(
            nmcli.clone(),
            dhcp,
            Arc::clone(&cache),
            store.clone(),
            Arc::clone(&config),
        );

        Connectivity {
            nmcli,
            orchestrator,
            cache,
            store,
            config,
        }
    }

    /// Wires the real `nmcli` runner and `dnsmasq` helper.
    pub fn from_config(config: Arc<Config>) -> Self {
        let dhcp = Dnsmasq::new(DnsmasqOptions {
            gateway: config.wifi.gateway,
            dhcp_range: config.wifi.dhcp_range.clone(),
            log_file: config.wifi.dhcp_log_file.clone(),
            pid_file: config.wifi.dhcp_pid_file(),
            grace: config.wifi.dhcp_grace(),
        });
        Connectivity::new(config, Arc::new(SystemRunner), Box::new(dhcp))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> &OperatingMode {
        self.orchestrator.mode()
    }

    pub fn cache(&self) -> &ScanCache {
        &self.cache
    }

    /// Checks that NetworkManager answers at all.
    pub async fn health(&self) -> Result<()> {
        self.nmcli.run(&["--version"]).await.map(drop)
    }

    pub async fn list_interfaces(&self) -> Result<Vec<WifiInterface>> {
        interface::list_wifi_interfaces(&self.nmcli).await
    }

    pub async fn scan(&mut self, mode: ScanMode) -> Result<ScanReport> {
        if mode == ScanMode::Cached {
            if let Some(entry) = self.cache.last_known() {
                return Ok(ScanReport::cached(&entry));
            }
            // Nothing cached yet: scan in place, keeping any access point up.
            return self.scan_now(self.config.wifi.scan_retries).await.map(ScanReport::live);
        }

        match self.orchestrator.active_access_point().await? {
            Some(kind) => self.scan_suspended(kind).await.map(ScanReport::live),
            None => self.scan_now(self.config.wifi.scan_retries).await.map(ScanReport::live),
        }
    }

    pub async fn scan_status(&self) -> Result<ScanStatus> {
        let access_point = self.orchestrator.active_access_point().await?;
        let warning = access_point.map(|kind| {
            format!(
                "Scanning will briefly disable the {} access point and disconnect its clients",
                kind
            )
        });
        Ok(ScanStatus {
            access_point_active: access_point.is_some(),
            access_point,
            cache_available: self.cache.last_known().is_some(),
            cache_fresh: self.cache.get().is_some(),
            warning,
        })
    }

    /// Connects to `ssid`, restoring the previously active access point on failure.
    pub async fn connect(
        &mut self,
        ssid: &str,
        passphrase: Option<&str>,
    ) -> Result<ConnectedNetwork> {
        let ssid = ssid.trim();
        if ssid.is_empty() {
            return Err(WifiError::InvalidRequest("SSID is required".to_string()));
        }

        let previous = self.orchestrator.active_access_point().await?;
        if let Some(kind) = previous {
            info!("Leaving {} access point to connect to '{}'", kind, ssid);
            if let Err(e) = self.orchestrator.leave_access_point().await {
                self.restore(kind).await;
                return Err(e);
            }
            tokio::time::sleep(self.config.wifi.settle_delay()).await;
        }

        match self.try_connect(ssid, passphrase).await {
            Ok(network) => {
                info!("Connected to '{}' on {}", network.ssid, network.interface);
                self.cache.invalidate();
                self.orchestrator.set_station(network.clone());
                self.store
                    .record(PersistedMode::Connected, Some(network.clone()));
                Ok(network)
            }
            Err(e) => {
                error!("Failed to connect to '{}': {}", ssid, e);
                if let Some(kind) = previous {
                    self.restore(kind).await;
                }
                Err(e)
            }
        }
    }

    /// Deletes saved profiles matching `bssid` (preferred) or `ssid`.
    pub async fn forget(&mut self, ssid: Option<&str>, bssid: Option<&str>) -> Result<ForgetReport> {
        let ssid = ssid.map(str::trim).filter(|s| !s.is_empty());
        let bssid = bssid
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_uppercase);

        let selector = match (bssid, ssid) {
            (Some(bssid), _) => Selector::Bssid(bssid),
            (None, Some(ssid)) => Selector::Ssid(ssid.to_string()),
            (None, None) => {
                return Err(WifiError::InvalidRequest(
                    "Either ssid or bssid is required".to_string(),
                ));
            }
        };

        let targets: Vec<_> = self
            .station_profiles()
            .await?
            .into_iter()
            .filter(|p| selector.matches(p))
            .collect();

        if targets.is_empty() {
            return Err(WifiError::NotFound(format!(
                "No saved network matches {}",
                selector
            )));
        }

        let mut report = self.delete_profiles(&targets).await;
        match self.station_profiles().await {
            Ok(remaining) if remaining.is_empty() => {
                info!("No saved networks left, enabling provisioning access point");
                report.provisioning_active = self.ensure_provisioning().await;
            }
            Ok(_) => {
                report.provisioning_active = self
                    .orchestrator
                    .status(AccessPointKind::Connect)
                    .await
                    .unwrap_or(false);
            }
            Err(e) => warn!("Could not list remaining networks: {}", e),
        }
        Ok(report)
    }

    /// Deletes every saved station profile and falls back to the provisioning access point.
    pub async fn forget_all(&mut self) -> Result<ForgetReport> {
        let profiles = self.station_profiles().await?;
        info!("Forgetting {} saved network(s)", profiles.len());

        let mut report = self.delete_profiles(&profiles).await;
        report.provisioning_active = self.ensure_provisioning().await;
        Ok(report)
    }

    /// Enables or disables one access-point kind, returning whether it is now active.
    pub async fn set_access_point(&mut self, kind: AccessPointKind, enabled: bool) -> Result<bool> {
        if enabled {
            if self.orchestrator.status(kind.other()).await? {
                info!("Disabling {} access point before enabling {}", kind.other(), kind);
                self.orchestrator.leave_access_point().await?;
            }
            self.orchestrator.enter_access_point(kind).await?;
            Ok(true)
        } else {
            if self.orchestrator.status(kind).await? {
                self.orchestrator.leave_access_point().await?;
            }
            Ok(false)
        }
    }

    pub async fn restart_access_point(&mut self, kind: AccessPointKind) -> Result<()> {
        if self.orchestrator.status(kind).await? {
            self.orchestrator.leave_access_point().await?;
            tokio::time::sleep(self.config.wifi.settle_delay()).await;
        }
        self.orchestrator.enter_access_point(kind).await
    }

    pub async fn access_point_status(&self, kind: AccessPointKind) -> Result<bool> {
        self.orchestrator.status(kind).await
    }

    pub async fn list_connected(&self) -> Result<Option<ConnectedNetwork>> {
        connection::connected_network(&self.nmcli).await
    }

    pub async fn list_saved(&self) -> Result<Vec<SavedConnectionProfile>> {
        self.station_profiles().await
    }

    /// Brings the host into a reachable state after boot and returns the resulting mode.
    pub async fn startup(&mut self) -> OperatingMode {
        if let Err(e) = self.orchestrator.cleanup_stale().await {
            warn!("Stale access point cleanup failed: {}", e);
        }
        if !self.config.wifi.startup_check {
            info!("Startup connectivity check disabled");
            return self.orchestrator.mode().clone();
        }

        if let Some(state) = self.store.load() {
            match self.restore_state(&state).await {
                Ok(true) => return self.orchestrator.mode().clone(),
                Ok(false) => {}
                Err(e) => warn!("Could not restore {:?} state: {}", state.mode, e),
            }
        }

        match connection::connected_network(&self.nmcli).await {
            Ok(Some(network)) => {
                info!("Already connected to '{}'", network.ssid);
                self.orchestrator.set_station(network.clone());
                self.store.record(PersistedMode::Connected, Some(network));
                return self.orchestrator.mode().clone();
            }
            Ok(None) => {}
            Err(e) => warn!("Could not read current connection: {}", e),
        }

        if let Err(e) = self.scan_now(self.config.wifi.startup_scan_attempts).await {
            warn!("Initial scan failed: {}", e);
        }

        // The warm-up result stays cached for the first clients of the portal.
        if let Err(e) = self
            .orchestrator
            .resume_access_point(AccessPointKind::Connect)
            .await
        {
            error!("Failed to enable provisioning access point: {}", e);
            self.orchestrator.set_idle();
            self.store.record(PersistedMode::Disconnected, None);
        }
        self.orchestrator.mode().clone()
    }

    /// Stops the helper and records the current mode for the next start.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.orchestrator.stop_helper().await {
            warn!("Failed to stop DHCP helper: {}", e);
        }
        match self.orchestrator.mode().clone() {
            OperatingMode::Station { connection } => {
                self.store.record(PersistedMode::Connected, Some(connection))
            }
            OperatingMode::AccessPoint { kind, .. } => self.store.record(kind.into(), None),
            OperatingMode::Idle => self.store.record(PersistedMode::Disconnected, None),
        }
    }

    async fn restore_state(&mut self, state: &PersistedState) -> Result<bool> {
        match state.mode {
            PersistedMode::Connected => {
                let Some(network) = &state.connected_network else {
                    return Ok(false);
                };
                info!("Restoring connection to '{}'", network.ssid);
                connection::activate(
                    &self.nmcli,
                    &network.connection_name,
                    self.config.wifi.connect_timeout(),
                )
                .await?;
                self.orchestrator.set_station(network.clone());
                self.store
                    .record(PersistedMode::Connected, Some(network.clone()));
                Ok(true)
            }
            PersistedMode::Direct => {
                self.orchestrator
                    .enter_access_point(AccessPointKind::Direct)
                    .await?;
                Ok(true)
            }
            PersistedMode::Connect => {
                self.orchestrator
                    .enter_access_point(AccessPointKind::Connect)
                    .await?;
                Ok(true)
            }
            PersistedMode::Disconnected => Ok(false),
        }
    }

    async fn try_connect(&mut self, ssid: &str, passphrase: Option<&str>) -> Result<ConnectedNetwork> {
        let interface = self.orchestrator.interface().await?;

        match self.scan_now(self.config.wifi.scan_retries).await {
            Ok(records) if !records.iter().any(|r| r.ssid == ssid) => {
                warn!("Network '{}' not found in scan results, trying anyway", ssid)
            }
            Ok(_) => {}
            Err(e) => warn!("Scan before connecting failed: {}", e),
        }

        let timeout = self.config.wifi.connect_timeout();
        let activated = if connection::profile_exists(&self.nmcli, ssid).await? {
            connection::activate(&self.nmcli, ssid, timeout).await
        } else {
            connection::connect_new(&self.nmcli, &interface, ssid, passphrase, timeout).await
        };
        if let Err(e) = activated {
            self.orchestrator.note_failure(&e);
            return Err(e);
        }

        match connection::connected_network(&self.nmcli).await? {
            Some(network) if network.ssid == ssid => Ok(network),
            other => Err(WifiError::VerificationMismatch {
                expected: ssid.to_string(),
                found: other.map(|n| n.ssid),
            }),
        }
    }

    async fn scan_now(&mut self, attempts: u32) -> Result<Vec<NetworkRecord>> {
        let interface = self.orchestrator.interface().await?;
        let settings = ScanSettings {
            attempts,
            rescan_delay: self.config.wifi.rescan_delay(),
        };
        match scan::scan_live(&self.nmcli, &interface, settings).await {
            Ok(records) => {
                self.cache.put(records.clone());
                Ok(records)
            }
            Err(e) => {
                self.orchestrator.note_failure(&e);
                Err(e)
            }
        }
    }

    async fn scan_suspended(&mut self, kind: AccessPointKind) -> Result<Vec<NetworkRecord>> {
        info!("Suspending {} access point to scan", kind);
        let scanned = match self.orchestrator.leave_access_point().await {
            Ok(()) => {
                tokio::time::sleep(self.config.wifi.settle_delay()).await;
                self.scan_now(self.config.wifi.scan_retries).await
            }
            Err(e) => Err(e),
        };
        self.restore(kind).await;
        scanned
    }

    async fn restore(&mut self, kind: AccessPointKind) {
        info!("Restoring {} access point", kind);
        if let Err(e) = self.orchestrator.resume_access_point(kind).await {
            error!("Failed to restore {} access point: {}", kind, e);
        }
    }

    async fn station_profiles(&self) -> Result<Vec<SavedConnectionProfile>> {
        let profiles = connection::list_saved_profiles(&self.nmcli).await?;
        Ok(profiles
            .into_iter()
            .filter(|p| !p.is_access_point && !self.is_access_point_name(&p.name))
            .collect())
    }

    fn is_access_point_name(&self, name: &str) -> bool {
        AccessPointKind::ALL
            .iter()
            .any(|kind| self.config.access_point(*kind).connection_name == name)
    }

    async fn delete_profiles(&mut self, profiles: &[SavedConnectionProfile]) -> ForgetReport {
        let mut report = ForgetReport::default();
        for profile in profiles {
            match connection::delete_connection(&self.nmcli, &profile.name).await {
                Ok(()) => {
                    info!("Forgot network '{}'", profile.name);
                    report.deleted.push(profile.name.clone());
                }
                Err(e) => {
                    warn!("Failed to forget '{}': {}", profile.name, e);
                    report.failed.push(DeleteFailure {
                        name: profile.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let dropped_station = matches!(
            self.orchestrator.mode(),
            OperatingMode::Station { connection } if report.deleted.contains(&connection.connection_name)
        );
        if dropped_station {
            self.orchestrator.set_idle();
        }
        report
    }

    /// Makes sure the provisioning access point is up; persists `disconnected` if it cannot be.
    async fn ensure_provisioning(&mut self) -> bool {
        match self.orchestrator.active_access_point().await {
            Ok(Some(AccessPointKind::Connect)) => return true,
            Ok(Some(AccessPointKind::Direct)) => {
                if let Err(e) = self.orchestrator.leave_access_point().await {
                    warn!("Failed to leave direct access point: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Could not read access point status: {}", e),
        }

        match self
            .orchestrator
            .enter_access_point(AccessPointKind::Connect)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to enable provisioning access point: {}", e);
                self.orchestrator.set_idle();
                self.store.record(PersistedMode::Disconnected, None);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_flags_map_to_modes() {
        assert_eq!(ScanMode::from_flags(false, false), ScanMode::LiveIfPossible);
        assert_eq!(ScanMode::from_flags(true, false), ScanMode::Cached);
        assert_eq!(ScanMode::from_flags(true, true), ScanMode::ForceLive);
        assert_eq!(ScanMode::from_flags(false, true), ScanMode::ForceLive);
    }
}
