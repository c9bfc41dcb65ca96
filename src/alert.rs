//! Threshold alerting on top of the monitored level.
//!
//! Maps the level to a traffic-light band using a device's threshold profile
//! and reports band changes together with the notifications configured for
//! the band being entered.

use std::fmt;

use crate::level::level_to_percent;
use crate::types::{AppConfig, DeviceThresholds};

/// Colour band of the volume bar and tray icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeBand {
    Green,
    Yellow,
    Red,
}

impl fmt::Display for VolumeBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeBand::Green => "green",
            VolumeBand::Yellow => "yellow",
            VolumeBand::Red => "red",
        };
        f.write_str(s)
    }
}

/// Band for a level in percent, or `None` when colour change is disabled.
///
/// Red strictly above the red threshold; yellow (if enabled) from the yellow
/// threshold up to and including red; green otherwise.
pub fn classify(
    percent: u8,
    thresholds: &DeviceThresholds,
    color_change_enabled: bool,
) -> Option<VolumeBand> {
    if !color_change_enabled {
        return None;
    }
    let band = if percent > thresholds.red_threshold {
        VolumeBand::Red
    } else if thresholds.yellow_enabled && percent >= thresholds.yellow_threshold {
        VolumeBand::Yellow
    } else {
        VolumeBand::Green
    };
    Some(band)
}

/// A change of band, with the notifications due for the band entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandTransition {
    pub from: Option<VolumeBand>,
    pub to: VolumeBand,
    pub percent: u8,
    /// Show a push notification
    pub push: bool,
    /// Play the alert sound
    pub sound: bool,
    /// Alert sound volume, 0-100
    pub sound_volume: u8,
}

/// Tracks the current band and edits thresholds while keeping yellow below red.
#[derive(Debug, Clone)]
pub struct ThresholdAlerter {
    thresholds: DeviceThresholds,
    color_change_enabled: bool,
    band: Option<VolumeBand>,
    /// Device whose profile is loaded, if any
    device_id: Option<String>,
}

impl ThresholdAlerter {
    pub fn new(thresholds: DeviceThresholds, color_change_enabled: bool) -> Self {
        Self {
            thresholds,
            color_change_enabled,
            band: None,
            device_id: None,
        }
    }

    /// Alerter for whichever device is monitored, with its saved profile.
    pub fn for_device(config: &AppConfig, device_id: Option<&str>) -> Self {
        let mut alerter = Self::new(DeviceThresholds::default(), config.color_change_enabled);
        alerter.follow_device(config, device_id);
        alerter
    }

    pub fn thresholds(&self) -> &DeviceThresholds {
        &self.thresholds
    }

    pub fn band(&self) -> Option<VolumeBand> {
        self.band
    }

    /// Swaps in another device's profile. The next observation re-announces its band.
    pub fn set_thresholds(&mut self, thresholds: DeviceThresholds) {
        self.thresholds = thresholds;
        self.band = None;
    }

    /// Loads the profile of `device_id` when it differs from the last device seen.
    ///
    /// `None` (no device) falls back to the default thresholds. Returns true
    /// if the profile was swapped.
    pub fn follow_device(&mut self, config: &AppConfig, device_id: Option<&str>) -> bool {
        if self.device_id.as_deref() == device_id {
            return false;
        }
        self.device_id = device_id.map(str::to_string);
        self.set_thresholds(
            device_id
                .map(|id| config.thresholds_for(id))
                .unwrap_or_default(),
        );
        true
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn set_color_change_enabled(&mut self, enabled: bool) {
        self.color_change_enabled = enabled;
        if !enabled {
            self.band = None;
        }
    }

    /// Feeds one level sample. Returns the transition if the band changed.
    pub fn observe(&mut self, level: f32) -> Option<BandTransition> {
        let percent = level_to_percent(level);
        let band = classify(percent, &self.thresholds, self.color_change_enabled);

        if band == self.band {
            return None;
        }
        let from = std::mem::replace(&mut self.band, band);
        let to = band?;

        let t = &self.thresholds;
        let (push, sound, sound_volume) = match to {
            VolumeBand::Green => (false, false, 0),
            VolumeBand::Yellow => (
                t.yellow_push_notification,
                t.yellow_sound_notification,
                t.yellow_sound_volume,
            ),
            VolumeBand::Red => (
                t.red_push_notification,
                t.red_sound_notification,
                t.red_sound_volume,
            ),
        };

        Some(BandTransition {
            from,
            to,
            percent,
            push,
            sound,
            sound_volume,
        })
    }

    // =========================================================================
    // Threshold editing
    // =========================================================================

    /// Sets the red threshold (1-100), pulling yellow down below it if needed.
    pub fn set_red(&mut self, value: u8) {
        let value = value.clamp(1, 100);
        if self.thresholds.yellow_enabled && value <= self.thresholds.yellow_threshold {
            self.thresholds.yellow_threshold = value - 1;
        }
        self.thresholds.red_threshold = value;
    }

    /// Sets the yellow threshold (0-99), pushing red up above it if needed.
    pub fn set_yellow(&mut self, value: u8) {
        let value = value.min(99);
        if self.thresholds.yellow_enabled && value >= self.thresholds.red_threshold {
            self.thresholds.red_threshold = value + 1;
        }
        self.thresholds.yellow_threshold = value;
    }

    pub fn set_yellow_enabled(&mut self, enabled: bool) {
        if enabled && self.thresholds.red_threshold <= self.thresholds.yellow_threshold {
            self.thresholds.yellow_threshold = self.thresholds.red_threshold.saturating_sub(1);
        }
        self.thresholds.yellow_enabled = enabled;
    }
}

/// Tray tooltip content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrayStatus {
    pub device_name: Option<String>,
    pub percent: u8,
    pub band: Option<VolumeBand>,
}

impl fmt::Display for TrayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_name {
            Some(name) => write!(f, "{}: {}%", name, self.percent)?,
            None => write!(f, "No output device")?,
        }
        if let Some(band) = self.band {
            write!(f, " ({})", band)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(red: u8, yellow: u8) -> DeviceThresholds {
        DeviceThresholds {
            red_threshold: red,
            yellow_threshold: yellow,
            ..DeviceThresholds::default()
        }
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn classify_boundaries() {
        let t = thresholds(80, 60);
        assert_eq!(classify(59, &t, true), Some(VolumeBand::Green));
        assert_eq!(classify(60, &t, true), Some(VolumeBand::Yellow));
        assert_eq!(classify(80, &t, true), Some(VolumeBand::Yellow));
        assert_eq!(classify(81, &t, true), Some(VolumeBand::Red));
    }

    #[test]
    fn classify_without_yellow_or_colour() {
        let mut t = thresholds(80, 60);
        t.yellow_enabled = false;
        assert_eq!(classify(70, &t, true), Some(VolumeBand::Green));
        assert_eq!(classify(90, &t, false), None);
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    #[test]
    fn transitions_are_reported_once() {
        let mut alerter = ThresholdAlerter::new(DeviceThresholds::default(), true);

        let first = alerter.observe(0.1).unwrap();
        assert_eq!(first.from, None);
        assert_eq!(first.to, VolumeBand::Green);
        assert!(alerter.observe(0.2).is_none());

        let red = alerter.observe(1.0).unwrap();
        assert_eq!(red.from, Some(VolumeBand::Green));
        assert_eq!(red.to, VolumeBand::Red);
        assert_eq!(red.percent, 100);
        assert!(red.push);
        assert!(!red.sound);
        assert!(alerter.observe(0.9).is_none());
    }

    #[test]
    fn yellow_uses_yellow_notification_flags() {
        let mut t = DeviceThresholds::default();
        t.yellow_sound_notification = true;
        t.yellow_sound_volume = 30;
        let mut alerter = ThresholdAlerter::new(t, true);

        let yellow = alerter.observe(0.65).unwrap();
        assert_eq!(yellow.to, VolumeBand::Yellow);
        assert!(!yellow.push);
        assert!(yellow.sound);
        assert_eq!(yellow.sound_volume, 30);
    }

    #[test]
    fn disabled_colour_change_reports_nothing() {
        let mut alerter = ThresholdAlerter::new(DeviceThresholds::default(), false);
        assert!(alerter.observe(1.0).is_none());
        assert_eq!(alerter.band(), None);

        alerter.set_color_change_enabled(true);
        assert_eq!(alerter.observe(1.0).unwrap().to, VolumeBand::Red);
    }

    #[test]
    fn follows_monitored_device_profile() {
        let mut config = AppConfig::default();
        config.device_profiles.insert("a".into(), thresholds(40, 20));
        let mut alerter = ThresholdAlerter::for_device(&config, Some("a"));
        assert_eq!(alerter.thresholds(), &thresholds(40, 20));
        assert_eq!(alerter.device_id(), Some("a"));

        assert!(!alerter.follow_device(&config, Some("a")));
        assert!(alerter.follow_device(&config, Some("b")));
        assert_eq!(alerter.thresholds(), &DeviceThresholds::default());

        // Lost and reacquired: the saved profile comes back.
        assert!(alerter.follow_device(&config, None));
        assert!(alerter.follow_device(&config, Some("a")));
        assert_eq!(alerter.observe(0.5).unwrap().to, VolumeBand::Red);
    }

    #[test]
    fn new_profile_reannounces_band() {
        let mut alerter = ThresholdAlerter::new(DeviceThresholds::default(), true);
        alerter.observe(0.5);
        alerter.set_thresholds(thresholds(40, 20));

        let t = alerter.observe(0.5).unwrap();
        assert_eq!(t.from, None);
        assert_eq!(t.to, VolumeBand::Red);
    }

    // =========================================================================
    // Threshold Editing
    // =========================================================================

    #[test]
    fn lowering_red_pulls_yellow_down() {
        let mut alerter = ThresholdAlerter::new(thresholds(80, 60), true);
        alerter.set_red(50);
        assert_eq!(alerter.thresholds().red_threshold, 50);
        assert_eq!(alerter.thresholds().yellow_threshold, 49);

        alerter.set_red(0);
        assert_eq!(alerter.thresholds().red_threshold, 1);
        assert_eq!(alerter.thresholds().yellow_threshold, 0);
    }

    #[test]
    fn raising_yellow_pushes_red_up() {
        let mut alerter = ThresholdAlerter::new(thresholds(80, 60), true);
        alerter.set_yellow(85);
        assert_eq!(alerter.thresholds().yellow_threshold, 85);
        assert_eq!(alerter.thresholds().red_threshold, 86);

        alerter.set_yellow(200);
        assert_eq!(alerter.thresholds().yellow_threshold, 99);
        assert_eq!(alerter.thresholds().red_threshold, 100);
    }

    #[test]
    fn disabled_yellow_is_not_nudged() {
        let mut t = thresholds(80, 60);
        t.yellow_enabled = false;
        let mut alerter = ThresholdAlerter::new(t, true);
        alerter.set_yellow(90);
        assert_eq!(alerter.thresholds().red_threshold, 80);

        alerter.set_yellow_enabled(true);
        assert_eq!(alerter.thresholds().yellow_threshold, 79);
    }

    #[test]
    fn tray_status_tooltip() {
        let status = TrayStatus {
            device_name: Some("Speakers".into()),
            percent: 42,
            band: Some(VolumeBand::Green),
        };
        assert_eq!(status.to_string(), "Speakers: 42% (green)");

        let empty = TrayStatus {
            device_name: None,
            percent: 0,
            band: None,
        };
        assert_eq!(empty.to_string(), "No output device");
    }
}
