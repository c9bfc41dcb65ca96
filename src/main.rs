use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use volume_sentinel_lib::backend::virtual_device::VirtualBackend;
use volume_sentinel_lib::backend::AudioBackend;
use volume_sentinel_lib::config::ConfigStore;
use volume_sentinel_lib::level::{db_spl, level_to_percent};
use volume_sentinel_lib::{
    AppConfig, AudioDeviceMonitor, MonitorResult, ThresholdAlerter, TrayStatus, VolumeBand,
};

/// How often the tray status line is logged
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    info!("Starting Volume Sentinel...");

    if let Err(e) = run() {
        error!("Volume Sentinel failed: {}", e);
        std::process::exit(1);
    }
}

fn load_config() -> AppConfig {
    match ConfigStore::open_default().and_then(|store| store.load()) {
        Ok(config) => config,
        Err(e) => {
            warn!("Config error: {}, using defaults", e);
            AppConfig::default()
        }
    }
}

#[cfg(windows)]
fn open_backend() -> Arc<dyn AudioBackend> {
    match volume_sentinel_lib::backend::native_backend() {
        Ok(backend) => backend,
        Err(e) => {
            warn!("WASAPI unavailable ({}), using virtual devices", e);
            Arc::new(VirtualBackend::demo())
        }
    }
}

#[cfg(not(windows))]
fn open_backend() -> Arc<dyn AudioBackend> {
    info!("No native audio backend on this platform, using virtual devices");
    Arc::new(VirtualBackend::demo())
}

/// Loads the threshold profile of the monitored device whenever it changes.
fn sync_thresholds(
    monitor: &AudioDeviceMonitor,
    config: &AppConfig,
    alerter: &Mutex<ThresholdAlerter>,
) {
    let device_id = monitor.current_device_id().ok();
    if alerter.lock().follow_device(config, device_id.as_deref()) {
        match device_id {
            Some(id) => info!("Using threshold profile for {}", id),
            None => info!("No output device, using default thresholds"),
        }
    }
}

fn run() -> MonitorResult<()> {
    let config = Arc::new(load_config());
    let monitor = Arc::new(AudioDeviceMonitor::new(open_backend())?);

    match (&config.device_id, config.use_default_device) {
        (Some(id), false) => {
            if let Err(e) = monitor.set_device_by_id(id) {
                warn!("Configured device {} unavailable ({}), following default", id, e);
            }
        }
        _ => info!("Following the default output device"),
    }

    let alerter = Arc::new(Mutex::new(ThresholdAlerter::for_device(&config, None)));

    let weak = Arc::downgrade(&monitor);
    let a = Arc::clone(&alerter);
    let c = Arc::clone(&config);
    monitor.events().volume_level_changed.subscribe(move |level| {
        if let Some(monitor) = weak.upgrade() {
            sync_thresholds(&monitor, &c, &a);
        }
        if let Some(transition) = a.lock().observe(*level) {
            let message = format!(
                "Level {}% ({:.0} dB SPL): {} band",
                transition.percent,
                db_spl(*level),
                transition.to
            );
            match transition.to {
                VolumeBand::Red if transition.push => warn!("{}", message),
                _ => info!("{}", message),
            }
            if transition.sound {
                info!("Alert sound at {}% volume", transition.sound_volume);
            }
        }
    });

    let weak = Arc::downgrade(&monitor);
    let a = Arc::clone(&alerter);
    let c = Arc::clone(&config);
    monitor.events().default_device_changed.subscribe(move |id| {
        info!("Default output device is now {}", id);
        if let Some(monitor) = weak.upgrade() {
            sync_thresholds(&monitor, &c, &a);
        }
    });

    let weak = Arc::downgrade(&monitor);
    let a = Arc::clone(&alerter);
    let c = Arc::clone(&config);
    monitor.events().device_list_changed.subscribe(move |_| {
        info!("Audio device list changed");
        if let Some(monitor) = weak.upgrade() {
            sync_thresholds(&monitor, &c, &a);
        }
    });

    monitor.initialize(Duration::from_millis(config.poll_interval_ms))?;
    sync_thresholds(&monitor, &config, &alerter);

    for device in monitor.list_devices() {
        info!("Output device: {} ({})", device.friendly_name, device.id);
    }

    loop {
        thread::sleep(STATUS_INTERVAL);
        let level = monitor.latest_level();
        let status = TrayStatus {
            device_name: monitor.current_device_name().ok(),
            percent: level_to_percent(level),
            band: alerter.lock().band(),
        };
        info!("{}", status);
    }
}
