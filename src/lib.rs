//! WiFi Provisioning Library
//!
//! This library keeps a headless device reachable while its wireless network
//! is being configured. The radio is either a station on an upstream network
//! or one of two local access points (`direct` or `connect`), never both, and
//! every transition that takes an access point down puts it back on failure.
//!
//! # Modules
//!
//! - [`config`] - TOML configuration with environment overrides
//! - [`connection`] - Saved profiles and the current station connection
//! - [`dhcp`] - `dnsmasq` helper bound to access-point mode
//! - [`error`] - Error type shared by the library
//! - [`exec`] - External command execution with timeouts
//! - [`interface`] - WiFi interface discovery
//! - [`nmcli`] - `nmcli` invocation and output parsing
//! - [`orchestrator`] - Mutual exclusion of station and access-point modes
//! - [`scan`] - Live scanning and the scan cache
//! - [`server`] - HTTP control API
//! - [`state`] - Persisted mode for restart recovery
//! - [`workflow`] - Scan, connect and forget use cases with rollback
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wifi_portal::{Config, Connectivity, ScanMode};
//!
//! # async fn run() -> wifi_portal::Result<()> {
//! let config = Arc::new(Config::new());
//! let mut connectivity = Connectivity::from_config(config);
//!
//! let report = connectivity.scan(ScanMode::ForceLive).await?;
//! println!("{} networks", report.networks.len());
//!
//! connectivity.connect("Home", Some("password123")).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dhcp;
pub mod error;
pub mod exec;
pub mod interface;
pub mod nmcli;
pub mod orchestrator;
pub mod scan;
pub mod server;
pub mod state;
pub mod workflow;

pub use config::Config;
pub use connection::{ConnectedNetwork, SavedConnectionProfile};
pub use error::{Result, WifiError};
pub use orchestrator::{AccessPointKind, ModeOrchestrator, OperatingMode};
pub use scan::{NetworkRecord, ScanCache};
pub use workflow::{Connectivity, ForgetReport, ScanMode, ScanReport};
