use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::AccessPointKind;

const APP_DIR: &str = "wifi-portal";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub wifi: WifiConfig,
    #[serde(default = "AccessPointConfig::direct")]
    pub direct: AccessPointConfig,
    #[serde(default = "AccessPointConfig::connect")]
    pub connect: AccessPointConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub ui_directory: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            ui_directory: PathBuf::from("ui"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WifiConfig {
    /// Pin a specific device instead of using the first WiFi device found.
    pub interface: Option<String>,
    pub gateway: Ipv4Addr,
    pub dhcp_range: String,
    pub dhcp_log_file: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub state_max_age_secs: u64,
    pub scan_ttl_secs: u64,
    pub scan_retries: u32,
    pub rescan_delay_ms: u64,
    /// Pause after leaving access-point mode before the radio is used again.
    pub settle_delay_ms: u64,
    /// Pause between stopping and restarting the DHCP helper.
    pub dhcp_settle_delay_ms: u64,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub dhcp_grace_secs: u64,
    pub startup_check: bool,
    pub startup_scan_attempts: u32,
}

impl Default for WifiConfig {
    fn default() -> Self {
        WifiConfig {
            interface: None,
            gateway: Ipv4Addr::new(192, 168, 42, 1),
            dhcp_range: "192.168.42.2,192.168.42.20".to_string(),
            dhcp_log_file: None,
            state_file: None,
            state_max_age_secs: 86_400,
            scan_ttl_secs: 300,
            scan_retries: 3,
            rescan_delay_ms: 2_000,
            settle_delay_ms: 3_000,
            dhcp_settle_delay_ms: 1_000,
            command_timeout_secs: 30,
            connect_timeout_secs: 30,
            dhcp_grace_secs: 5,
            startup_check: true,
            startup_scan_attempts: 5,
        }
    }
}

impl WifiConfig {
    pub fn state_max_age(&self) -> Duration {
        Duration::from_secs(self.state_max_age_secs)
    }

    pub fn scan_ttl(&self) -> Duration {
        Duration::from_secs(self.scan_ttl_secs)
    }

    pub fn rescan_delay(&self) -> Duration {
        Duration::from_millis(self.rescan_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn dhcp_settle_delay(&self) -> Duration {
        Duration::from_millis(self.dhcp_settle_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn dhcp_grace(&self) -> Duration {
        Duration::from_secs(self.dhcp_grace_secs)
    }

    /// Where the persisted mode is kept; falls back to the user data directory.
    pub fn state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(env::temp_dir)
                .join(APP_DIR)
                .join("state.json")
        })
    }

    /// The DHCP helper's pid lives in the runtime directory, which does not
    /// survive a reboot; next to the state file when there is none.
    pub fn dhcp_pid_file(&self) -> PathBuf {
        match dirs::runtime_dir() {
            Some(run) => run.join(APP_DIR).join("dnsmasq.pid"),
            None => self.state_file().with_file_name("dnsmasq.pid"),
        }
    }
}

/// Settings for one access-point kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessPointConfig {
    /// NetworkManager connection profile name.
    pub connection_name: String,
    /// Broadcast SSID.
    pub ssid: String,
    /// WPA2 passphrase; the access point is open when unset.
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl AccessPointConfig {
    pub fn direct() -> Self {
        AccessPointConfig {
            connection_name: "directInterface".to_string(),
            ssid: "WiFi Direct".to_string(),
            passphrase: None,
        }
    }

    pub fn connect() -> Self {
        AccessPointConfig {
            connection_name: "connectInterface".to_string(),
            ssid: "WiFi Connect".to_string(),
            passphrase: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig {
            enabled: true,
            origins: vec!["*".to_string()],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Config {
            server: ServerConfig::default(),
            wifi: WifiConfig::default(),
            direct: AccessPointConfig::direct(),
            connect: AccessPointConfig::connect(),
            cors: CorsConfig::default(),
        }
    }

    /// Loads the file at `path` (or the default location) and applies
    /// environment overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Config::new()
        };

        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn access_point(&self, kind: AccessPointKind) -> &AccessPointConfig {
        match kind {
            AccessPointKind::Direct => &self.direct,
            AccessPointKind::Connect => &self.connect,
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("WIFI_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("WIFI_SERVER_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid WIFI_SERVER_PORT: {}", port))?;
        }
        if let Some(level) = var("WIFI_SERVER_LOG_LEVEL") {
            self.server.log_level = level;
        }
        if let Some(interface) = var("WIFI_INTERFACE") {
            self.wifi.interface = Some(interface);
        }
        if let Some(state_file) = var("WIFI_STATE_FILE") {
            self.wifi.state_file = Some(PathBuf::from(state_file));
        }
        if let Some(retries) = var("WIFI_SCAN_RETRIES") {
            self.wifi.scan_retries = retries
                .parse()
                .with_context(|| format!("Invalid WIFI_SCAN_RETRIES: {}", retries))?;
        }
        if let Some(delay) = var("WIFI_RESCAN_DELAY_MS") {
            self.wifi.rescan_delay_ms = delay
                .parse()
                .with_context(|| format!("Invalid WIFI_RESCAN_DELAY_MS: {}", delay))?;
        }
        if let Some(enabled) = var("WIFI_CORS_ENABLED") {
            self.cors.enabled = matches!(
                enabled.to_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            );
        }
        if let Some(origins) = var("WIFI_CORS_ORIGINS") {
            self.cors.origins = origins.split(',').map(|o| o.trim().to_string()).collect();
        }
        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config_dir.join(APP_DIR).join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.direct.connection_name, "directInterface");
        assert_eq!(config.connect.connection_name, "connectInterface");
        assert_eq!(config.wifi.scan_ttl(), Duration::from_secs(300));
        assert_eq!(config.wifi.gateway, Ipv4Addr::new(192, 168, 42, 1));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[wifi]
interface = "wlan1"
scan_retries = 5

[direct]
connection_name = "isolated"
ssid = "Robot"
passphrase = "supersecret"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.wifi.interface.as_deref(), Some("wlan1"));
        assert_eq!(config.wifi.scan_retries, 5);
        assert_eq!(config.wifi.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.access_point(AccessPointKind::Direct).ssid, "Robot");
        assert_eq!(
            config.access_point(AccessPointKind::Connect).connection_name,
            "connectInterface"
        );
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::new();
        config.server.port = 9090;
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.server.port, 9090);
    }

    #[test]
    fn environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WIFI_SERVER_PORT", "8080"),
            ("WIFI_CORS_ENABLED", "off"),
            ("WIFI_CORS_ORIGINS", "http://a, http://b"),
            ("WIFI_INTERFACE", "wlp2s0"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::new();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(!config.cors.enabled);
        assert_eq!(config.cors.origins, vec!["http://a", "http://b"]);
        assert_eq!(config.wifi.interface.as_deref(), Some("wlp2s0"));

        let err = Config::new().apply_env(|k| (k == "WIFI_SERVER_PORT").then(|| "x".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn pid_file_prefers_runtime_dir() {
        let wifi = WifiConfig {
            state_file: Some(PathBuf::from("/var/lib/wifi-portal/state.json")),
            ..Default::default()
        };
        let expected = match dirs::runtime_dir() {
            Some(run) => run.join("wifi-portal").join("dnsmasq.pid"),
            None => PathBuf::from("/var/lib/wifi-portal/dnsmasq.pid"),
        };
        assert_eq!(wifi.dhcp_pid_file(), expected);
    }
}
