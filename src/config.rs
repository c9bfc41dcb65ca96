//! Settings persistence for Volume Sentinel.
//!
//! This module owns all file I/O for `settings.json`: locating the file,
//! loading it with validation and self-repair, and saving it atomically.

use log::{info, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ConfigError;
use crate::types::{AppConfig, DeviceThresholds, DEFAULT_POLL_INTERVAL_MS};

/// Application directory name under the local data directory
pub const APP_DIR_NAME: &str = "VolumeSentinel";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

// =============================================================================
// Directory and Path Utilities
// =============================================================================

/// Returns the settings file location: `<local data dir>/VolumeSentinel/settings.json`.
///
/// On Windows this is `%LOCALAPPDATA%`, so settings do not roam between machines.
///
/// # Errors
///
/// Returns [`ConfigError::NoDataDir`] if the platform has no local
/// data directory.
pub fn default_path() -> Result<PathBuf, ConfigError> {
    let data_dir = dirs::data_local_dir().ok_or(ConfigError::NoDataDir)?;
    Ok(data_dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Sibling temp file used for atomic saves.
fn temp_path_for(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| SETTINGS_FILE_NAME.to_string());
    path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        nanos
    ))
}

// =============================================================================
// Validation
// =============================================================================

/// Resets out-of-range values to their defaults.
///
/// Red is checked first, so a yellow threshold is compared against the
/// already-repaired red one. Returns true if anything changed.
pub fn validate(config: &mut AppConfig) -> bool {
    let defaults = DeviceThresholds::default();
    let mut changed = false;

    if config.poll_interval_ms == 0 {
        config.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
        changed = true;
    }

    for (device_id, profile) in config.device_profiles.iter_mut() {
        let before = profile.clone();

        if !(1..=100).contains(&profile.red_threshold)
            || profile.red_threshold <= profile.yellow_threshold
        {
            profile.red_threshold = defaults.red_threshold;
        }
        if profile.yellow_threshold > 99 || profile.yellow_threshold >= profile.red_threshold {
            profile.yellow_threshold = defaults.yellow_threshold;
        }
        if profile.red_sound_volume > 100 {
            profile.red_sound_volume = defaults.red_sound_volume;
        }
        if profile.yellow_sound_volume > 100 {
            profile.yellow_sound_volume = defaults.yellow_sound_volume;
        }

        if *profile != before {
            warn!("Repaired invalid thresholds for device {}", device_id);
            changed = true;
        }
    }

    changed
}

// =============================================================================
// Store
// =============================================================================

/// Reads and writes [`AppConfig`] at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at [`default_path`].
    pub fn open_default() -> Result<Self, ConfigError> {
        Ok(Self::new(default_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads settings, creating or repairing the file as needed.
    ///
    /// - A missing file is created with defaults.
    /// - Unparseable JSON is replaced with defaults.
    /// - Values fixed up by [`validate`] are written back.
    ///
    /// # Errors
    ///
    /// Only I/O failures are reported; parse failures self-heal.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        if !self.path.exists() {
            info!("No settings at {:?}, writing defaults", self.path);
            let config = AppConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::io("Failed to read settings", &self.path, e))?;

        let mut config = match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Settings at {:?} are corrupt ({}), regenerating", self.path, e);
                let config = AppConfig::default();
                self.save(&config)?;
                return Ok(config);
            }
        };

        if validate(&mut config) {
            self.save(&config)?;
        }
        Ok(config)
    }

    /// Writes settings as pretty JSON via a temp file renamed over the target.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, serialization
    /// fails, or the write or rename fails. The temp file is removed on failure.
    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| ConfigError::io("Failed to create settings directory", dir, e))?;
        }

        let json = serde_json::to_string_pretty(config)?;
        let temp_path = temp_path_for(&self.path);

        let result = write_file(&temp_path, json.as_bytes()).and_then(|_| {
            fs::rename(&temp_path, &self.path)
                .map_err(|e| ConfigError::io("Failed to replace settings", &self.path, e))
        });

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    let mut file = fs::File::create(path)
        .map_err(|e| ConfigError::io("Failed to create temp settings", path, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| ConfigError::io("Failed to write settings", path, e))
}
