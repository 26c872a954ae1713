//! DHCP/DNS helper bound to access-point mode.
//!
//! The helper is a singleton `dnsmasq` child: starting it stops any prior
//! instance, stopping it is idempotent. Its pid is written to a file so a
//! later process can stop an instance orphaned by a crash; a recorded pid is
//! only signalled while `/proc` still names it `dnsmasq`.

use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use crate::error::{Result, WifiError};
use crate::orchestrator::AccessPointKind;

const DNSMASQ: &str = "dnsmasq";
const STARTUP_PROBE: Duration = Duration::from_millis(500);
const ORPHAN_POLL: Duration = Duration::from_millis(100);

#[async_trait]
pub trait DhcpServer: Send + Sync {
    /// Starts serving on `interface` for the given access-point kind,
    /// replacing any running instance.
    async fn start(&mut self, interface: &str, kind: AccessPointKind) -> Result<()>;

    /// Stops the helper. Succeeds when nothing is running.
    async fn stop(&mut self) -> Result<()>;

    fn is_running(&mut self) -> bool;
}

#[derive(Debug, Clone)]
pub struct DnsmasqOptions {
    pub gateway: Ipv4Addr,
    pub dhcp_range: String,
    pub log_file: Option<PathBuf>,
    pub pid_file: PathBuf,
    /// Time allowed for a graceful exit before the helper is killed.
    pub grace: Duration,
}

/// Arguments for one access-point kind.
///
/// `Connect` hands out the gateway as router and DNS server and answers every
/// DNS query with the gateway so clients land on the portal. `Direct` serves
/// DHCP only: DNS is disabled and an empty router option keeps clients from
/// installing a default route through the device.
pub fn dnsmasq_args(options: &DnsmasqOptions, interface: &str, kind: AccessPointKind) -> Vec<String> {
    let gateway = options.gateway;
    let mut args = vec![
        format!("--interface={}", interface),
        format!("--dhcp-range={}", options.dhcp_range),
        "--keep-in-foreground".to_string(),
        "--bind-interfaces".to_string(),
        "--except-interface=lo".to_string(),
        "--conf-file".to_string(),
        "--no-hosts".to_string(),
    ];

    match kind {
        AccessPointKind::Connect => {
            args.push(format!("--address=/#/{}", gateway));
            args.push(format!("--dhcp-option=option:router,{}", gateway));
            args.push(format!("--dhcp-option=option:dns-server,{}", gateway));
        }
        AccessPointKind::Direct => {
            args.push("--port=0".to_string());
            args.push("--dhcp-option=3".to_string());
        }
    }

    if let Some(log_file) = &options.log_file {
        args.push("--log-dhcp".to_string());
        args.push(format!("--log-facility={}", log_file.display()));
    }

    args
}

pub struct Dnsmasq {
    options: DnsmasqOptions,
    child: Option<Child>,
}

impl Dnsmasq {
    pub fn new(options: DnsmasqOptions) -> Self {
        Dnsmasq {
            options,
            child: None,
        }
    }

    async fn terminate(&self, mut child: Child) -> Result<()> {
        let Some(pid) = child.id() else {
            // Already reaped.
            return Ok(());
        };

        info!("Stopping dnsmasq (pid {})...", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to signal dnsmasq: {}", e);
        }

        match tokio::time::timeout(self.options.grace, child.wait()).await {
            Ok(_) => info!("dnsmasq stopped gracefully"),
            Err(_) => {
                warn!("dnsmasq did not stop gracefully, forcing kill");
                child.kill().await.map_err(|source| WifiError::Spawn {
                    program: DNSMASQ.to_string(),
                    source,
                })?;
                info!("dnsmasq force killed");
            }
        }
        Ok(())
    }

    /// Stops an instance left behind by a previous process.
    async fn terminate_orphan(&self, raw: i32) {
        if !is_dnsmasq(raw) {
            info!("Recorded pid {} is not a running dnsmasq, ignoring it", raw);
            return;
        }
        let pid = Pid::from_raw(raw);
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => info!("Stopping orphaned dnsmasq (pid {})", pid),
            Err(Errno::ESRCH) => return,
            Err(e) => {
                warn!("Failed to signal orphaned dnsmasq {}: {}", pid, e);
                return;
            }
        }

        let deadline = tokio::time::Instant::now() + self.options.grace;
        while tokio::time::Instant::now() < deadline {
            if kill(pid, None).is_err() {
                return;
            }
            tokio::time::sleep(ORPHAN_POLL).await;
        }
        if !is_dnsmasq(raw) {
            return;
        }
        warn!("Orphaned dnsmasq {} ignored SIGTERM, killing", pid);
        match kill(pid, Signal::SIGKILL) {
            Ok(()) => info!("Orphaned dnsmasq {} killed", pid),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill orphaned dnsmasq {}: {}", pid, e),
        }
    }

    fn read_pid_file(&self) -> Option<i32> {
        fs::read_to_string(&self.options.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn write_pid_file(&self, pid: u32) {
        if let Some(parent) = self.options.pid_file.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::write(&self.options.pid_file, pid.to_string()) {
            warn!("Failed to record dnsmasq pid: {}", e);
        }
    }

    fn remove_pid_file(&self) {
        let _ = fs::remove_file(&self.options.pid_file);
    }
}

/// True while `/proc/<pid>/comm` names dnsmasq, so a pid reused after a
/// reboot is never signalled.
fn is_dnsmasq(pid: i32) -> bool {
    pid > 0
        && fs::read_to_string(format!("/proc/{}/comm", pid))
            .map(|comm| comm.trim() == DNSMASQ)
            .unwrap_or(false)
}

/// Keeps the helper's stderr pipe from filling up once it is running.
async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("dnsmasq: {}", line);
    }
}

#[async_trait]
impl DhcpServer for Dnsmasq {
    async fn start(&mut self, interface: &str, kind: AccessPointKind) -> Result<()> {
        self.stop().await?;

        let args = dnsmasq_args(&self.options, interface, kind);
        debug!("Starting dnsmasq with arguments: {}", args.join(" "));

        let mut child = Command::new(DNSMASQ)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| WifiError::Spawn {
                program: DNSMASQ.to_string(),
                source,
            })?;

        tokio::time::sleep(STARTUP_PROBE).await;
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                let output = child.wait_with_output().await.ok();
                let message = output
                    .map(|o| String::from_utf8_lossy(&o.stderr).trim().to_string())
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("exited with {}", status));
                return Err(WifiError::CommandFailed {
                    command: DNSMASQ.to_string(),
                    message,
                });
            }
            Err(source) => {
                return Err(WifiError::Spawn {
                    program: DNSMASQ.to_string(),
                    source,
                });
            }
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }
        if let Some(pid) = child.id() {
            self.write_pid_file(pid);
        }
        info!("dnsmasq started for {} mode on {}", kind, interface);
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let result = match self.child.take() {
            Some(child) => self.terminate(child).await,
            None => {
                if let Some(pid) = self.read_pid_file() {
                    self.terminate_orphan(pid).await;
                } else {
                    debug!("dnsmasq is not running");
                }
                Ok(())
            }
        };
        self.remove_pid_file();
        result
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}
