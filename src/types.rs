//! Core endpoint types and persistent application settings.
//!
//! This module defines the data structures shared by the monitor, the audio
//! backends, and the configuration store: endpoint descriptors, device states,
//! topology notifications, and the per-device threshold profiles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// State of an audio endpoint as reported by the OS.
///
/// Mirrors the `DEVICE_STATE_*` flags of the Windows MMDevice API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// The endpoint is present and enabled
    Active,
    /// The endpoint was disabled by the user
    Disabled,
    /// The endpoint's hardware is not present
    NotPresent,
    /// The jack is unplugged
    Unplugged,
}

impl DeviceState {
    pub fn is_active(self) -> bool {
        self == DeviceState::Active
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Active => "active",
            DeviceState::Disabled => "disabled",
            DeviceState::NotPresent => "not present",
            DeviceState::Unplugged => "unplugged",
        };
        f.write_str(s)
    }
}

/// One enumerable audio render device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioEndpointDescriptor {
    /// Opaque, stable identifier assigned by the OS
    pub id: String,
    /// Display name; neither unique nor guaranteed stable
    pub friendly_name: String,
    pub state: DeviceState,
}

/// Direction of an endpoint's data flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFlow {
    Render,
    Capture,
}

/// Role an endpoint is the default for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Console,
    Multimedia,
    Communications,
}

/// Topology notification delivered by an audio backend.
///
/// Backends may raise these on any thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    DeviceAdded(String),
    DeviceRemoved(String),
    DeviceStateChanged(String, DeviceState),
    /// `id` is `None` when the last endpoint for the role disappeared.
    DefaultDeviceChanged {
        flow: DataFlow,
        role: DeviceRole,
        id: Option<String>,
    },
}

impl TopologyEvent {
    /// True for default changes the monitor follows: render flow, console or multimedia role.
    pub fn is_render_default_change(&self) -> bool {
        matches!(
            self,
            TopologyEvent::DefaultDeviceChanged {
                flow: DataFlow::Render,
                role: DeviceRole::Console | DeviceRole::Multimedia,
                ..
            }
        )
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Per-device threshold profile, in percent of full scale (0-100).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceThresholds {
    /// Level above which the tray turns red
    pub red_threshold: u8,
    /// Level at or above which the tray turns yellow (when enabled)
    pub yellow_threshold: u8,
    pub yellow_enabled: bool,
    pub red_push_notification: bool,
    pub red_sound_notification: bool,
    pub red_sound_volume: u8,
    pub yellow_push_notification: bool,
    pub yellow_sound_notification: bool,
    pub yellow_sound_volume: u8,
}

impl Default for DeviceThresholds {
    fn default() -> Self {
        Self {
            red_threshold: 80,
            yellow_threshold: 60,
            yellow_enabled: true,
            red_push_notification: true,
            red_sound_notification: false,
            red_sound_volume: 50,
            yellow_push_notification: false,
            yellow_sound_notification: false,
            yellow_sound_volume: 50,
        }
    }
}

/// Persistent application settings saved to `settings.json`.
///
/// Unknown or missing fields fall back to their defaults so that older files
/// keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Sampler period in milliseconds
    pub poll_interval_ms: u64,
    /// Pinned device id; ignored while `use_default_device` is set
    pub device_id: Option<String>,
    /// Follow the OS default output device
    pub use_default_device: bool,
    /// Whether the level band (and tray colour) is computed at all
    pub color_change_enabled: bool,
    /// Threshold profiles keyed by endpoint id
    pub device_profiles: BTreeMap<String, DeviceThresholds>,
}

/// Default sampler period, one volume bar refresh.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            device_id: None,
            use_default_device: true,
            color_change_enabled: true,
            device_profiles: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Returns the threshold profile for a device, or the defaults.
    pub fn thresholds_for(&self, device_id: &str) -> DeviceThresholds {
        self.device_profiles
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&DeviceState::NotPresent).unwrap(),
            "\"notpresent\""
        );
        assert_eq!(
            serde_json::to_string(&DeviceState::Active).unwrap(),
            "\"active\""
        );
    }

    #[test]
    fn render_default_change_filter() {
        let multimedia = TopologyEvent::DefaultDeviceChanged {
            flow: DataFlow::Render,
            role: DeviceRole::Multimedia,
            id: Some("a".into()),
        };
        let comms = TopologyEvent::DefaultDeviceChanged {
            flow: DataFlow::Render,
            role: DeviceRole::Communications,
            id: Some("a".into()),
        };
        let capture = TopologyEvent::DefaultDeviceChanged {
            flow: DataFlow::Capture,
            role: DeviceRole::Console,
            id: None,
        };
        assert!(multimedia.is_render_default_change());
        assert!(!comms.is_render_default_change());
        assert!(!capture.is_render_default_change());
        assert!(!TopologyEvent::DeviceAdded("a".into()).is_render_default_change());
    }

    #[test]
    fn app_config_fills_missing_fields() {
        let config: AppConfig = serde_json::from_str(r#"{"device_id":"x"}"#).unwrap();
        assert_eq!(config.device_id.as_deref(), Some("x"));
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert!(config.use_default_device);
    }

    #[test]
    fn thresholds_for_unknown_device_are_defaults() {
        let mut config = AppConfig::default();
        let custom = DeviceThresholds {
            red_threshold: 90,
            ..DeviceThresholds::default()
        };
        config.device_profiles.insert("dev".into(), custom.clone());

        assert_eq!(config.thresholds_for("dev"), custom);
        assert_eq!(config.thresholds_for("other"), DeviceThresholds::default());
    }
}
