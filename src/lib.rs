//! Volume Sentinel: watches the output level of one audio render device.
//!
//! The [`AudioDeviceMonitor`] keeps exactly one endpoint open, follows the OS
//! default device unless pinned to a specific one, and publishes the sampled
//! level. Configuration and threshold alerting sit on top of it.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod alert;
pub mod audio_monitor;
pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod level;
pub mod types;

pub use alert::{BandTransition, ThresholdAlerter, TrayStatus, VolumeBand};
pub use audio_monitor::AudioDeviceMonitor;
pub use backend::{AudioBackend, EndpointHandle};
pub use config::ConfigStore;
pub use error::{ConfigError, MonitorError, MonitorResult};
pub use events::{EventChannel, MonitorEvents, SubscriptionId};
pub use types::{AppConfig, AudioEndpointDescriptor, DeviceState, DeviceThresholds};
