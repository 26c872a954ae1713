//! Durable record of the last known connectivity mode.
//!
//! The state file is a small JSON document written after every successful
//! mode transition and at shutdown, and read once at startup. Files that are
//! older than the configured maximum age, or that cannot be parsed, are
//! deleted and treated as absent.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::connection::ConnectedNetwork;
use crate::error::{Result, WifiError};
use crate::orchestrator::AccessPointKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistedMode {
    Connected,
    Direct,
    Connect,
    Disconnected,
}

impl From<AccessPointKind> for PersistedMode {
    fn from(kind: AccessPointKind) -> Self {
        match kind {
            AccessPointKind::Direct => PersistedMode::Direct,
            AccessPointKind::Connect => PersistedMode::Connect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub mode: PersistedMode,
    #[serde(with = "time::serde::timestamp")]
    pub saved_at: OffsetDateTime,
    #[serde(default)]
    pub connected_network: Option<ConnectedNetwork>,
}

impl PersistedState {
    pub fn new(mode: PersistedMode, connected_network: Option<ConnectedNetwork>) -> Self {
        PersistedState {
            mode,
            saved_at: OffsetDateTime::now_utc(),
            connected_network,
        }
    }

    pub fn age(&self) -> Duration {
        let elapsed = OffsetDateTime::now_utc() - self.saved_at;
        elapsed.try_into().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    max_age: Duration,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        StateStore {
            path: path.into(),
            max_age,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted state. Stale or corrupt files are removed.
    pub fn load(&self) -> Option<PersistedState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state file at {}", self.path.display());
                return None;
            }
            Err(e) => {
                error!("Failed to read state file {}: {}", self.path.display(), e);
                return None;
            }
        };

        let state: PersistedState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                error!("Invalid state file {}: {}", self.path.display(), e);
                self.discard("corrupted");
                return None;
            }
        };

        let age = state.age();
        if age > self.max_age {
            info!("State file is too old ({}s), ignoring", age.as_secs());
            self.discard("old");
            return None;
        }

        info!("Loaded WiFi state: {:?}", state.mode);
        Some(state)
    }

    /// Writes `state`, creating the parent directory when needed.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let persist = |e: std::io::Error| {
            WifiError::StatePersistence(format!("{}: {}", self.path.display(), e))
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persist)?;
        }

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| WifiError::StatePersistence(e.to_string()))?;

        // Write-then-rename so a crash never leaves a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(persist)?;
        fs::rename(&tmp, &self.path).map_err(persist)?;

        info!("Saved WiFi state: {:?} to {}", state.mode, self.path.display());
        Ok(())
    }

    /// Persists `mode`; failures are logged and otherwise ignored.
    pub fn record(&self, mode: PersistedMode, connected_network: Option<ConnectedNetwork>) {
        if let Err(e) = self.save(&PersistedState::new(mode, connected_network)) {
            error!("{}", e);
        }
    }

    fn discard(&self, reason: &str) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Removed {} state file", reason),
            Err(e) => warn!("Failed to remove {} state file: {}", reason, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::SecurityKind;

    fn home() -> ConnectedNetwork {
        ConnectedNetwork {
            ssid: "Home".to_string(),
            interface: "wlan0".to_string(),
            security: SecurityKind::Wpa2,
            connection_name: "Home".to_string(),
        }
    }

    #[test]
    fn save_creates_directory_and_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("a/b/state.json"), Duration::from_secs(60));

        store.record(PersistedMode::Connected, Some(home()));
        let state = store.load().unwrap();
        assert_eq!(state.mode, PersistedMode::Connected);
        assert_eq!(state.connected_network, Some(home()));
    }

    #[test]
    fn file_format_uses_lowercase_modes_and_unix_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), Duration::from_secs(60));
        store.record(PersistedMode::Direct, None);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["mode"], "direct");
        assert!(raw["saved_at"].is_i64());
        assert!(raw["connected_network"].is_null());
    }

    #[test]
    fn stale_state_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), Duration::from_secs(60));
        let mut state = PersistedState::new(PersistedMode::Connect, None);
        state.saved_at -= time::Duration::seconds(120);
        store.save(&state).unwrap();

        assert!(store.load().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn corrupt_state_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), Duration::from_secs(60));
        fs::write(store.path(), "{ not json").unwrap();

        assert!(store.load().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn missing_state_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), Duration::from_secs(60));
        assert!(store.load().is_none());
    }

    #[test]
    fn unwritable_location_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "").unwrap();
        let store = StateStore::new(blocker.join("state.json"), Duration::from_secs(60));

        let err = store
            .save(&PersistedState::new(PersistedMode::Disconnected, None))
            .unwrap_err();
        assert!(matches!(err, WifiError::StatePersistence(_)));
    }
}
