//! Mutual exclusion between station mode and the two access-point kinds.
//!
//! The orchestrator owns the DHCP helper and every NetworkManager command that
//! brings an access point up or down. It never switches from one access-point
//! kind to the other on its own: entering a kind while the other is active is
//! refused with [`WifiError::ModeConflict`].

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::connection::{self, ConnectedNetwork};
use crate::dhcp::DhcpServer;
use crate::error::{Result, WifiError};
use crate::interface::InterfaceResolver;
use crate::nmcli::{self, Nmcli};
use crate::scan::ScanCache;
use crate::state::{PersistedMode, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AccessPointKind {
    /// Isolated hotspot: DHCP only, clients get no default route.
    Direct,
    /// Provisioning portal: DHCP and DNS both point at the gateway.
    Connect,
}

impl AccessPointKind {
    pub const ALL: [AccessPointKind; 2] = [AccessPointKind::Direct, AccessPointKind::Connect];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPointKind::Direct => "direct",
            AccessPointKind::Connect => "connect",
        }
    }

    pub fn other(self) -> AccessPointKind {
        match self {
            AccessPointKind::Direct => AccessPointKind::Connect,
            AccessPointKind::Connect => AccessPointKind::Direct,
        }
    }
}

impl fmt::Display for AccessPointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatingMode {
    Idle,
    Station { connection: ConnectedNetwork },
    AccessPoint { kind: AccessPointKind, name: String },
}

impl OperatingMode {
    pub fn access_point(&self) -> Option<AccessPointKind> {
        match self {
            OperatingMode::AccessPoint { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub struct ModeOrchestrator {
    nmcli: Nmcli,
    resolver: InterfaceResolver,
    dhcp: Box<dyn DhcpServer>,
    cache: Arc<ScanCache>,
    store: StateStore,
    config: Arc<Config>,
    mode: OperatingMode,
}

impl ModeOrchestrator {
    pub fn new(
        nmcli: Nmcli,
        dhcp: Box<dyn DhcpServer>,
        cache: Arc<ScanCache>,
        store: StateStore,
        config: Arc<Config>,
    ) -> Self {
        let resolver = InterfaceResolver::new(nmcli.clone(), config.wifi.interface.clone());
        ModeOrchestrator {
            nmcli,
            resolver,
            dhcp,
            cache,
            store,
            config,
            mode: OperatingMode::Idle,
        }
    }

    pub fn mode(&self) -> &OperatingMode {
        &self.mode
    }

    /// Records a station connection established outside the orchestrator.
    pub fn set_station(&mut self, connection: ConnectedNetwork) {
        self.mode = OperatingMode::Station { connection };
    }

    pub fn set_idle(&mut self) {
        self.mode = OperatingMode::Idle;
    }

    pub async fn interface(&mut self) -> Result<String> {
        self.resolver.resolve().await
    }

    /// Forgets the resolved interface after a command reports it missing.
    pub fn note_failure(&mut self, err: &WifiError) {
        let Some(name) = self.resolver.cached() else {
            return;
        };
        let missing = match err {
            WifiError::CommandFailed { message, .. } => {
                let message = message.to_lowercase();
                message.contains(&format!("'{}'", name.to_lowercase()))
                    && (message.contains("not found") || message.contains("no such device"))
            }
            other => other.is_hardware(),
        };
        if missing {
            self.resolver.invalidate();
        }
    }

    /// Kinds whose connection NetworkManager currently reports as activated.
    pub async fn active_access_points(&self) -> Result<Vec<AccessPointKind>> {
        let stdout = self
            .nmcli
            .run(&["-t", "-f", "NAME,STATE", "connection", "show", "--active"])
            .await?;

        let mut active = Vec::new();
        for (name, state) in nmcli::parse_connection_states(&stdout) {
            if state != "activated" {
                continue;
            }
            for kind in AccessPointKind::ALL {
                if name == self.config.access_point(kind).connection_name {
                    active.push(kind);
                }
            }
        }
        Ok(active)
    }

    pub async fn active_access_point(&self) -> Result<Option<AccessPointKind>> {
        Ok(self.active_access_points().await?.into_iter().next())
    }

    pub async fn status(&self, kind: AccessPointKind) -> Result<bool> {
        Ok(self.active_access_points().await?.contains(&kind))
    }

    pub async fn enter_access_point(&mut self, kind: AccessPointKind) -> Result<()> {
        self.enter(kind, true).await
    }

    /// Like [`enter_access_point`](Self::enter_access_point), but keeps the scan
    /// cache: used when returning to an access point that was only suspended.
    pub async fn resume_access_point(&mut self, kind: AccessPointKind) -> Result<()> {
        self.enter(kind, false).await
    }

    async fn enter(&mut self, kind: AccessPointKind, invalidate_cache: bool) -> Result<()> {
        let active = self.active_access_points().await?;
        if active.contains(&kind.other()) {
            return Err(WifiError::ModeConflict {
                requested: kind,
                active: kind.other(),
            });
        }
        let name = self.config.access_point(kind).connection_name.clone();
        if active.contains(&kind) && self.dhcp.is_running() {
            debug!("{} access point is already active", kind);
            self.mode = OperatingMode::AccessPoint { kind, name };
            return Ok(());
        }

        let interface = self.interface().await?;
        info!("Enabling {} access point on {}", kind, interface);
        let previous = self.current_station().await;

        if !connection::profile_exists(&self.nmcli, &name).await? {
            self.create_profile(kind, &interface).await?;
        }

        self.nmcli
            .run(&["connection", "modify", &name, "connection.autoconnect", "yes"])
            .await?;
        if let Err(e) =
            connection::activate(&self.nmcli, &name, self.config.wifi.connect_timeout()).await
        {
            self.note_failure(&e);
            self.roll_back(&name, previous).await;
            return Err(e);
        }

        if let Err(e) = self.start_helper(&interface, kind).await {
            error!("DHCP helper failed for {} mode: {}", kind, e);
            self.roll_back(&name, previous).await;
            return Err(e);
        }

        if invalidate_cache {
            self.cache.invalidate();
        }
        self.mode = OperatingMode::AccessPoint { kind, name };
        self.store.record(kind.into(), None);
        info!("{} access point enabled", kind);
        Ok(())
    }

    /// Takes every active access point down. Succeeds when none is active.
    pub async fn leave_access_point(&mut self) -> Result<()> {
        self.dhcp.stop().await?;

        let active = self.active_access_points().await?;
        for kind in &active {
            let name = self.config.access_point(*kind).connection_name.clone();
            info!("Disabling {} access point", kind);
            self.nmcli
                .run(&["connection", "modify", &name, "connection.autoconnect", "no"])
                .await?;
            self.nmcli.run(&["connection", "down", &name]).await?;
        }

        if !active.is_empty() || self.mode.access_point().is_some() {
            self.cache.invalidate();
            self.mode = OperatingMode::Idle;
            self.store.record(PersistedMode::Disconnected, None);
        }
        Ok(())
    }

    /// Removes access-point profiles and helpers left over by a previous run.
    pub async fn cleanup_stale(&mut self) -> Result<()> {
        for kind in AccessPointKind::ALL {
            let name = self.config.access_point(kind).connection_name.clone();
            if !connection::profile_exists(&self.nmcli, &name).await? {
                continue;
            }
            info!("Removing stale {} access point profile", kind);
            if let Err(e) = self.nmcli.run(&["connection", "down", &name]).await {
                debug!("{} was not active: {}", name, e);
            }
            if let Err(e) = connection::delete_connection(&self.nmcli, &name).await {
                warn!("Failed to delete {}: {}", name, e);
            }
        }
        self.dhcp.stop().await?;
        if self.mode.access_point().is_some() {
            self.mode = OperatingMode::Idle;
        }
        Ok(())
    }

    /// Stops the helper; used on shutdown.
    pub async fn stop_helper(&mut self) -> Result<()> {
        self.dhcp.stop().await
    }

    async fn start_helper(&mut self, interface: &str, kind: AccessPointKind) -> Result<()> {
        self.dhcp.stop().await?;
        tokio::time::sleep(self.config.wifi.dhcp_settle_delay()).await;
        self.dhcp.start(interface, kind).await
    }

    async fn create_profile(&self, kind: AccessPointKind, interface: &str) -> Result<()> {
        let ap = self.config.access_point(kind);
        let name = ap.connection_name.as_str();
        info!("Creating {} access point profile '{}'", kind, name);

        self.nmcli
            .run(&[
                "connection", "add", "type", "wifi", "ifname", interface, "con-name", name,
                "ssid", &ap.ssid,
            ])
            .await?;

        let address = format!("{}/24", self.config.wifi.gateway);
        let mut args = vec![
            "connection",
            "modify",
            name,
            "802-11-wireless.mode",
            "ap",
            "802-11-wireless.band",
            "bg",
            "ipv4.never-default",
            "yes",
            "connection.autoconnect",
            "no",
            "ipv4.method",
            "manual",
            "ipv4.addresses",
            &address,
        ];
        if kind == AccessPointKind::Direct {
            args.extend(["802-11-wireless.powersave", "0"]);
        }
        if let Some(passphrase) = ap.passphrase.as_deref().filter(|p| !p.is_empty()) {
            args.extend(["wifi-sec.key-mgmt", "wpa-psk", "wifi-sec.psk", passphrase]);
        }
        self.nmcli.run(&args).await.map(drop)
    }

    /// The station connection the radio is serving, if any.
    async fn current_station(&self) -> Option<ConnectedNetwork> {
        if let OperatingMode::Station { connection } = &self.mode {
            return Some(connection.clone());
        }
        match connection::connected_network(&self.nmcli).await {
            Ok(network) => network,
            Err(e) => {
                debug!("Could not probe station connection: {}", e);
                None
            }
        }
    }

    /// Takes a half-entered access point down and brings back the station
    /// connection it displaced. The mode ends up matching what is active.
    async fn roll_back(&mut self, name: &str, previous: Option<ConnectedNetwork>) {
        self.deactivate(name).await;

        let Some(station) = previous else {
            if self.mode != OperatingMode::Idle {
                self.mode = OperatingMode::Idle;
                self.store.record(PersistedMode::Disconnected, None);
            }
            return;
        };

        info!("Reconnecting to '{}'", station.ssid);
        match connection::activate(
            &self.nmcli,
            &station.connection_name,
            self.config.wifi.connect_timeout(),
        )
        .await
        {
            Ok(()) => {
                self.store
                    .record(PersistedMode::Connected, Some(station.clone()));
                self.mode = OperatingMode::Station { connection: station };
            }
            Err(e) => {
                error!("Failed to reconnect to '{}': {}", station.ssid, e);
                self.mode = OperatingMode::Idle;
                self.store.record(PersistedMode::Disconnected, None);
            }
        }
    }

    /// Best-effort teardown after a failed activation.
    async fn deactivate(&self, name: &str) {
        if let Err(e) = self.nmcli.run(&["connection", "down", name]).await {
            debug!("Could not deactivate {}: {}", name, e);
        }
        if let Err(e) = self
            .nmcli
            .run(&["connection", "modify", name, "connection.autoconnect", "no"])
            .await
        {
            warn!("Could not disable autoconnect on {}: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_each_others_opposite() {
        for kind in AccessPointKind::ALL {
            assert_ne!(kind, kind.other());
            assert_eq!(kind, kind.other().other());
        }
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AccessPointKind::Direct).unwrap(),
            "\"direct\""
        );
        assert_eq!(AccessPointKind::Connect.to_string(), "connect");
    }
}
