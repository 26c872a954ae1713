use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;

use wifi_portal::{
    config::{self, Config},
    connection, scan, server, AccessPointKind, Connectivity, ScanMode,
};

#[derive(Parser)]
#[command(name = "wifi-portal")]
#[command(about = "Provision WiFi on a headless device through a local access point")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to <config dir>/wifi-portal/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run startup recovery and serve the control API
    Serve,

    /// List available WiFi interfaces
    ListInterfaces,

    /// Scan for WiFi networks
    Scan {
        /// Return the last known result without scanning when one exists
        #[arg(long, conflicts_with = "force")]
        cached: bool,

        /// Scan live even if an access point has to be suspended
        #[arg(long)]
        force: bool,
    },

    /// Show the network the device is connected to
    ListConnected,

    /// List saved networks
    ListSaved,

    /// Connect to a WiFi network
    Connect {
        /// SSID of the network to connect to
        ssid: String,

        /// Passphrase (not needed for saved or open networks)
        #[arg(short, long)]
        passphrase: Option<String>,
    },

    /// Forget saved networks by SSID or BSSID
    Forget {
        #[arg(long, required_unless_present = "bssid")]
        ssid: Option<String>,

        /// Takes precedence over --ssid
        #[arg(long)]
        bssid: Option<String>,
    },

    /// Forget every saved network and enable the provisioning access point
    ForgetAll,

    /// Enable an access point
    StartHotspot { kind: AccessPointKind },

    /// Disable an access point
    StopHotspot { kind: AccessPointKind },

    /// Report whether an access point is active
    CheckHotspot { kind: AccessPointKind },

    /// Take an access point down and bring it back up
    RestartHotspot { kind: AccessPointKind },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load(cli.config.as_deref())?;
    env_logger::Builder::from_env(Env::default().default_filter_or(cfg.server.log_level.as_str()))
        .init();
    let cfg = Arc::new(cfg);

    match cli.command {
        Commands::Serve => server::run_server(cfg).await,
        Commands::ListInterfaces => cmd_list_interfaces(cfg).await,
        Commands::Scan { cached, force } => cmd_scan(cfg, ScanMode::from_flags(cached, force)).await,
        Commands::ListConnected => cmd_list_connected(cfg).await,
        Commands::ListSaved => cmd_list_saved(cfg).await,
        Commands::Connect { ssid, passphrase } => {
            cmd_connect(cfg, &ssid, passphrase.as_deref()).await
        }
        Commands::Forget { ssid, bssid } => {
            cmd_forget(cfg, ssid.as_deref(), bssid.as_deref()).await
        }
        Commands::ForgetAll => cmd_forget_all(cfg).await,
        Commands::StartHotspot { kind } => cmd_set_hotspot(cfg, kind, true).await,
        Commands::StopHotspot { kind } => cmd_set_hotspot(cfg, kind, false).await,
        Commands::CheckHotspot { kind } => cmd_check_hotspot(cfg, kind).await,
        Commands::RestartHotspot { kind } => cmd_restart_hotspot(cfg, kind).await,
        Commands::ShowConfig => cmd_show_config(&cfg, cli.config),
    }
}

async fn cmd_list_interfaces(cfg: Arc<Config>) -> Result<()> {
    let interfaces = Connectivity::from_config(cfg).list_interfaces().await?;

    if interfaces.is_empty() {
        println!("No WiFi interfaces found.");
        return Ok(());
    }

    println!("{:<16} {}", "INTERFACE", "STATE");
    println!("{}", "-".repeat(32));

    for iface in interfaces {
        println!("{:<16} {}", iface.name, iface.state);
    }

    Ok(())
}

async fn cmd_scan(cfg: Arc<Config>, mode: ScanMode) -> Result<()> {
    let mut connectivity = Connectivity::from_config(cfg);
    let report = connectivity.scan(mode).await?;

    if report.cached {
        println!("Cached result from {}s ago", report.age_secs);
        println!();
    }
    scan::display_networks(&report.networks);

    Ok(())
}

async fn cmd_list_connected(cfg: Arc<Config>) -> Result<()> {
    let connected = Connectivity::from_config(cfg).list_connected().await?;
    connection::display_connected(connected.as_ref());

    Ok(())
}

async fn cmd_list_saved(cfg: Arc<Config>) -> Result<()> {
    let saved = Connectivity::from_config(cfg).list_saved().await?;
    connection::display_saved(&saved);

    Ok(())
}

async fn cmd_connect(cfg: Arc<Config>, ssid: &str, passphrase: Option<&str>) -> Result<()> {
    let mut connectivity = Connectivity::from_config(cfg);
    println!("Connecting to '{}'...", ssid);

    let network = connectivity
        .connect(ssid, passphrase)
        .await
        .with_context(|| format!("Failed to connect to '{}'", ssid))?;
    println!("Connected successfully!");

    println!();
    connection::display_connected(Some(&network));

    Ok(())
}

async fn cmd_forget(cfg: Arc<Config>, ssid: Option<&str>, bssid: Option<&str>) -> Result<()> {
    let report = Connectivity::from_config(cfg).forget(ssid, bssid).await?;

    for name in &report.deleted {
        println!("Forgot '{}'", name);
    }
    for failure in &report.failed {
        println!("Failed to forget '{}': {}", failure.name, failure.error);
    }
    if report.provisioning_active {
        println!("Provisioning access point is active.");
    }

    Ok(())
}

async fn cmd_forget_all(cfg: Arc<Config>) -> Result<()> {
    let report = Connectivity::from_config(cfg).forget_all().await?;

    println!("Forgot {} network(s).", report.deleted.len());
    for failure in &report.failed {
        println!("Failed to forget '{}': {}", failure.name, failure.error);
    }
    if !report.provisioning_active {
        println!("Warning: provisioning access point could not be enabled.");
    }

    Ok(())
}

async fn cmd_set_hotspot(cfg: Arc<Config>, kind: AccessPointKind, enabled: bool) -> Result<()> {
    let active = Connectivity::from_config(cfg)
        .set_access_point(kind, enabled)
        .await?;
    println!("{} hotspot {}", kind, if active { "enabled" } else { "disabled" });

    Ok(())
}

async fn cmd_check_hotspot(cfg: Arc<Config>, kind: AccessPointKind) -> Result<()> {
    let active = Connectivity::from_config(cfg)
        .access_point_status(kind)
        .await?;
    println!("{} hotspot is {}", kind, if active { "active" } else { "inactive" });

    Ok(())
}

async fn cmd_restart_hotspot(cfg: Arc<Config>, kind: AccessPointKind) -> Result<()> {
    Connectivity::from_config(cfg)
        .restart_access_point(kind)
        .await?;
    println!("{} hotspot restarted", kind);

    Ok(())
}

fn cmd_show_config(cfg: &Config, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(p) => p,
        None => config::config_path()?,
    };
    println!("Config file: {}", path.display());
    println!("State file:  {}", cfg.wifi.state_file().display());
    println!();

    let mut shown = cfg.clone();
    for ap in [&mut shown.direct, &mut shown.connect] {
        if let Some(passphrase) = ap.passphrase.as_mut() {
            *passphrase = "*".repeat(passphrase.len().min(12));
        }
    }
    let rendered = toml::to_string_pretty(&shown).context("Failed to serialize config")?;
    println!("{}", rendered);

    Ok(())
}
