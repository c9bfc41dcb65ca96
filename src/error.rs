//! Error types for the monitor core and the configuration store.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type MonitorResult<T> = Result<T, MonitorError>;

/// Failures surfaced by [`crate::audio_monitor::AudioDeviceMonitor`] and the audio backends.
///
/// All variants are recoverable: the monitor keeps running and callers are
/// expected to treat "no device" as a displayable state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("audio device not found: {0}")]
    DeviceNotFound(String),
    #[error("audio device handle invalidated: {0}")]
    DeviceInvalidated(String),
    #[error("audio endpoint enumeration failed: {0}")]
    EnumerationFailure(String),
    #[error("audio monitor has been stopped")]
    MonitorStopped,
    #[error("{0}")]
    Unknown(String),
}

impl MonitorError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::DeviceNotFound(what.into())
    }

    pub fn invalidated(what: impl Into<String>) -> Self {
        Self::DeviceInvalidated(what.into())
    }

    pub fn enumeration(what: impl Into<String>) -> Self {
        Self::EnumerationFailure(what.into())
    }

    /// True for the "nothing to show" case, as opposed to an OS fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DeviceNotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the local data directory")]
    NoDataDir,
    #[error("{context} ({path:?}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_error_messages() {
        assert_eq!(
            MonitorError::not_found("speakers").to_string(),
            "audio device not found: speakers"
        );
        assert_eq!(
            MonitorError::MonitorStopped.to_string(),
            "audio monitor has been stopped"
        );
    }

    #[test]
    fn not_found_is_distinguished_from_os_faults() {
        assert!(MonitorError::not_found("x").is_not_found());
        assert!(!MonitorError::invalidated("x").is_not_found());
        assert!(!MonitorError::enumeration("x").is_not_found());
    }

    #[test]
    fn config_io_error_carries_path() {
        let err = ConfigError::io(
            "Failed to write settings",
            "/tmp/settings.json",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("Failed to write settings"));
        assert!(msg.contains("settings.json"));
    }
}
