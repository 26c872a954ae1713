use std::time::Duration;

use thiserror::Error;

use crate::orchestrator::AccessPointKind;

#[derive(Error, Debug)]
pub enum WifiError {
    #[error("No WiFi interface found")]
    HardwareUnavailable,

    #[error("Interface '{0}' not found or is not a WiFi device")]
    InterfaceNotFound(String),

    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Expected to be connected to '{expected}', but connected network is {}", .found.as_deref().unwrap_or("none"))]
    VerificationMismatch {
        expected: String,
        found: Option<String>,
    },

    #[error("Failed to persist state: {0}")]
    StatePersistence(String),

    #[error("Cannot enable {requested} while {active} is active")]
    ModeConflict {
        requested: AccessPointKind,
        active: AccessPointKind,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl WifiError {
    /// True for failures that mean the radio itself has gone away.
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            WifiError::HardwareUnavailable | WifiError::InterfaceNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WifiError>;
