#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use wifi_portal::config::Config;
use wifi_portal::dhcp::DhcpServer;
use wifi_portal::exec::{CommandOutput, CommandRunner};
use wifi_portal::{AccessPointKind, Connectivity, Result, WifiError};

pub const IFACE: &str = "wlan0";

#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub ssid: String,
    pub mode: String,
    pub bssid: Option<String>,
    pub key_mgmt: String,
}

impl Profile {
    pub fn station(name: &str) -> Self {
        Profile {
            name: name.to_string(),
            ssid: name.to_string(),
            mode: "infrastructure".to_string(),
            bssid: None,
            key_mgmt: "wpa-psk".to_string(),
        }
    }

    pub fn with_bssid(mut self, bssid: &str) -> Self {
        self.bssid = Some(bssid.to_string());
        self
    }
}

/// A single-radio NetworkManager driven through terse `nmcli` invocations.
#[derive(Debug, Default)]
pub struct NmState {
    pub devices: Vec<String>,
    pub profiles: Vec<Profile>,
    /// At most one profile is active on the radio.
    pub active: Option<String>,
    pub scan_lines: Vec<String>,
    pub fail_list: bool,
    pub fail_up: HashSet<String>,
    pub fail_delete: HashSet<String>,
    /// Activations of these names run into the caller's timeout.
    pub stall_up: HashSet<String>,
    pub log: Vec<String>,
}

impl NmState {
    fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    fn profile_mut(&mut self, name: &str) -> Option<&mut Profile> {
        self.profiles.iter_mut().find(|p| p.name == name)
    }

    fn handle(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["--version"] => CommandOutput::ok("nmcli tool, version 1.42.4\n"),
            ["-t", "-f", "DEVICE,TYPE,STATE", "device", "status"] => {
                let mut out = String::from("lo:loopback:unmanaged\n");
                for device in &self.devices {
                    let state = if self.active.is_some() { "connected" } else { "disconnected" };
                    out.push_str(&format!("{}:wifi:{}\n", device, state));
                }
                CommandOutput::ok(out)
            }
            ["device", "wifi", "rescan", "ifname", _] => CommandOutput::ok(""),
            ["-t", "-f", _, "device", "wifi", "list", "ifname", _] => {
                if self.fail_list {
                    CommandOutput::failed(10, "Error: scan failed")
                } else {
                    CommandOutput::ok(self.scan_lines.join("\n"))
                }
            }
            ["-t", "-f", "NAME,STATE", "connection", "show", "--active"] => {
                CommandOutput::ok(match &self.active {
                    Some(name) => format!("{}:activated\n", name),
                    None => String::new(),
                })
            }
            ["-t", "-f", "NAME,TYPE,DEVICE", "connection", "show", "--active"] => {
                let mut out = String::from("lo:loopback:lo\n");
                if let Some(name) = &self.active {
                    out.push_str(&format!("{}:802-11-wireless:{}\n", name, IFACE));
                }
                CommandOutput::ok(out)
            }
            ["-t", "-f", "NAME,TYPE,DEVICE", "connection", "show"] => {
                let mut out = String::from("Wired connection 1:802-3-ethernet:\n");
                for profile in &self.profiles {
                    let device = if self.active.as_deref() == Some(profile.name.as_str()) {
                        IFACE
                    } else {
                        ""
                    };
                    out.push_str(&format!("{}:802-11-wireless:{}\n", profile.name, device));
                }
                CommandOutput::ok(out)
            }
            ["-t", "-f", _, "connection", "show", name] => match self.profile(name) {
                Some(p) => CommandOutput::ok(format!(
                    "802-11-wireless.ssid:{}\n802-11-wireless.mode:{}\n802-11-wireless.bssid:{}\n802-11-wireless-security.key-mgmt:{}\n",
                    p.ssid,
                    p.mode,
                    p.bssid.as_deref().map(|b| b.replace(':', "\\:")).unwrap_or_default(),
                    p.key_mgmt
                )),
                None => missing(name),
            },
            ["connection", "show", name] => match self.profile(name) {
                Some(_) => CommandOutput::ok("connection.id: x\n"),
                None => missing(name),
            },
            ["connection", "add", "type", "wifi", "ifname", _, "con-name", name, "ssid", ssid] => {
                self.profiles.push(Profile {
                    name: name.to_string(),
                    ssid: ssid.to_string(),
                    mode: "infrastructure".to_string(),
                    bssid: None,
                    key_mgmt: String::new(),
                });
                CommandOutput::ok("")
            }
            ["connection", "modify", name, settings @ ..] => {
                let Some(profile) = self.profile_mut(name) else {
                    return missing(name);
                };
                for pair in settings.chunks(2) {
                    match pair {
                        ["802-11-wireless.mode", mode] => profile.mode = mode.to_string(),
                        ["wifi-sec.key-mgmt", key] => profile.key_mgmt = key.to_string(),
                        _ => {}
                    }
                }
                CommandOutput::ok("")
            }
            ["connection", "up", name] => {
                if self.profile(name).is_none() {
                    return missing(name);
                }
                if self.fail_up.contains(*name) {
                    return CommandOutput::failed(4, "Error: Connection activation failed");
                }
                self.active = Some(name.to_string());
                CommandOutput::ok("Connection successfully activated")
            }
            ["connection", "down", name] => {
                if self.active.as_deref() == Some(*name) {
                    self.active = None;
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(10, format!("Error: '{}' is not an active connection.", name))
                }
            }
            ["connection", "delete", name] => {
                if self.fail_delete.contains(*name) {
                    return CommandOutput::failed(1, "Error: permission denied");
                }
                let before = self.profiles.len();
                self.profiles.retain(|p| p.name != *name);
                if self.profiles.len() == before {
                    return missing(name);
                }
                if self.active.as_deref() == Some(*name) {
                    self.active = None;
                }
                CommandOutput::ok("")
            }
            ["device", "wifi", "connect", ssid, rest @ ..] => {
                if self.fail_up.contains(*ssid) {
                    return CommandOutput::failed(4, "Error: Connection activation failed");
                }
                let mut profile = Profile::station(ssid);
                if !rest.contains(&"password") {
                    profile.key_mgmt = String::new();
                }
                self.profiles.push(profile);
                self.active = Some(ssid.to_string());
                CommandOutput::ok("Device successfully activated")
            }
            _ => CommandOutput::failed(2, format!("unexpected command: {}", args.join(" "))),
        }
    }
}

fn missing(name: &str) -> CommandOutput {
    CommandOutput::failed(10, format!("Error: {} - no such connection profile.", name))
}

#[derive(Clone, Default)]
pub struct FakeNm {
    pub state: Arc<Mutex<NmState>>,
}

impl FakeNm {
    pub fn new() -> Self {
        let nm = FakeNm::default();
        nm.state.lock().unwrap().devices.push(IFACE.to_string());
        nm
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut NmState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn log(&self) -> Vec<String> {
        self.with(|s| s.log.clone())
    }

    pub fn active(&self) -> Option<String> {
        self.with(|s| s.active.clone())
    }

    pub fn clear_log(&self) {
        self.with(|s| s.log.clear());
    }
}

#[async_trait]
impl CommandRunner for FakeNm {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        let command = format!("{} {}", program, args.join(" "));
        state.log.push(command.clone());
        if let ["connection", "up", name] | ["device", "wifi", "connect", name, ..] = args {
            if state.stall_up.contains(*name) {
                return Err(WifiError::Timeout {
                    command,
                    after: timeout,
                });
            }
        }
        Ok(state.handle(args))
    }
}

/// Records helper starts and stops in a shared log.
#[derive(Clone, Default)]
pub struct FakeDhcp {
    pub log: Arc<Mutex<Vec<String>>>,
    pub running: Arc<Mutex<Option<AccessPointKind>>>,
    pub fail_start: Arc<Mutex<bool>>,
}

impl FakeDhcp {
    pub fn running(&self) -> Option<AccessPointKind> {
        *self.running.lock().unwrap()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl DhcpServer for FakeDhcp {
    async fn start(&mut self, interface: &str, kind: AccessPointKind) -> Result<()> {
        self.log.lock().unwrap().push(format!("start {} {}", kind, interface));
        if *self.fail_start.lock().unwrap() {
            return Err(WifiError::CommandFailed {
                command: "dnsmasq".to_string(),
                message: "address already in use".to_string(),
            });
        }
        *self.running.lock().unwrap() = Some(kind);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.running.lock().unwrap().take().is_some() {
            self.log.lock().unwrap().push("stop".to_string());
        }
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.running.lock().unwrap().is_some()
    }
}

pub fn test_config(state_dir: &Path) -> Config {
    let mut config = Config::new();
    config.wifi.state_file = Some(state_dir.join("state.json"));
    config.wifi.rescan_delay_ms = 0;
    config.wifi.settle_delay_ms = 0;
    config.wifi.dhcp_settle_delay_ms = 0;
    config.wifi.scan_retries = 2;
    config.wifi.startup_scan_attempts = 2;
    config
}

pub fn scan_line(ssid: &str, bssid: &str, signal: u8) -> String {
    format!("no:{}:{}:WPA2:6:{}", ssid, bssid.replace(':', "\\:"), signal)
}

pub struct Harness {
    pub nm: FakeNm,
    pub dhcp: FakeDhcp,
    pub connectivity: Connectivity,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Harness::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        adjust(&mut config);

        let nm = FakeNm::new();
        nm.with(|s| {
            s.scan_lines = vec![
                scan_line("Home", "AA:BB:CC:DD:EE:01", 80),
                scan_line("Cafe", "AA:BB:CC:DD:EE:02", 40),
            ]
        });
        let dhcp = FakeDhcp::default();
        let connectivity = Connectivity::new(
            Arc::new(config),
            Arc::new(nm.clone()),
            Box::new(dhcp.clone()),
        );
        Harness {
            nm,
            dhcp,
            connectivity,
            dir,
        }
    }

    pub fn state_file(&self) -> std::path::PathBuf {
        self.dir.path().join("state.json")
    }

    pub fn persisted(&self) -> serde_json::Value {
        let content = std::fs::read_to_string(self.state_file()).unwrap();
        serde_json::from_str(&content).unwrap()
    }
}
