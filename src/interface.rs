use log::{info, warn};

use crate::error::{Result, WifiError};
use crate::nmcli::{self, Nmcli};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiInterface {
    pub name: String,
    pub state: String,
}

/// List all WiFi interfaces known to NetworkManager
pub async fn list_wifi_interfaces(nmcli: &Nmcli) -> Result<Vec<WifiInterface>> {
    let stdout = nmcli
        .run(&["-t", "-f", "DEVICE,TYPE,STATE", "device", "status"])
        .await?;

    Ok(nmcli::parse_wifi_devices(&stdout)
        .into_iter()
        .map(|(name, state)| WifiInterface { name, state })
        .collect())
}

/// Resolves the wireless interface once and remembers it.
///
/// Every other component asks the resolver instead of querying the OS, so the
/// "no wireless hardware" failure is reported from one place.
pub struct InterfaceResolver {
    nmcli: Nmcli,
    preferred: Option<String>,
    cached: Option<String>,
}

impl InterfaceResolver {
    /// `preferred` pins a specific device; it is still verified to be WiFi.
    pub fn new(nmcli: Nmcli, preferred: Option<String>) -> Self {
        InterfaceResolver {
            nmcli,
            preferred,
            cached: None,
        }
    }

    pub async fn resolve(&mut self) -> Result<String> {
        if let Some(name) = &self.cached {
            return Ok(name.clone());
        }

        let interfaces = list_wifi_interfaces(&self.nmcli).await?;
        let found = match &self.preferred {
            Some(name) => interfaces
                .into_iter()
                .find(|i| &i.name == name)
                .ok_or_else(|| WifiError::InterfaceNotFound(name.clone()))?,
            None => interfaces
                .into_iter()
                .next()
                .ok_or(WifiError::HardwareUnavailable)?,
        };

        info!("WiFi interface detected: {}", found.name);
        self.cached = Some(found.name.clone());
        Ok(found.name)
    }

    /// Drops the cached name; the next [`resolve`](Self::resolve) queries the OS once.
    pub fn invalidate(&mut self) {
        if let Some(name) = self.cached.take() {
            warn!("WiFi interface {} went missing, will re-detect", name);
        }
    }

    pub fn cached(&self) -> Option<&str> {
        self.cached.as_deref()
    }
}
