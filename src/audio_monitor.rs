//! Audio Device Monitor Module
//!
//! Keeps a live connection to exactly one audio render endpoint and samples
//! its output level on a fixed interval:
//! - Explicit (pinned by id) or default-tracking device selection
//! - Safe swap-and-release of the monitored handle
//! - Reaction to OS topology notifications (added/removed/state/default)
//! - Thread-safe, release-safe level and device queries
//!
//! All commands, notifications and sampler ticks run on one [`Dispatcher`]
//! thread. A single lock guards the monitored handle and its flags; it is
//! never held across a backend call.

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::backend::{AudioBackend, EndpointHandle, ListenerRegistration, TopologyListener};
use crate::dispatcher::Dispatcher;
use crate::error::{MonitorError, MonitorResult};
use crate::events::MonitorEvents;
use crate::level::compute_level;
use crate::types::{AudioEndpointDescriptor, TopologyEvent, DEFAULT_POLL_INTERVAL_MS};

/// Name of the dispatcher thread; events are delivered on it
pub const DISPATCHER_THREAD_NAME: &str = "audio-monitor";

/// The device currently being sampled.
#[derive(Debug, Default)]
enum MonitoredDevice {
    #[default]
    NoDevice,
    Device(Arc<dyn EndpointHandle>),
}

impl MonitoredDevice {
    fn handle(&self) -> Option<&Arc<dyn EndpointHandle>> {
        match self {
            MonitoredDevice::NoDevice => None,
            MonitoredDevice::Device(handle) => Some(handle),
        }
    }

    fn is(&self, id: &str) -> bool {
        self.handle().is_some_and(|h| h.id() == id)
    }
}

/// State guarded by the device lock. Only the swap protocol and the
/// device-loss paths mutate it.
#[derive(Debug)]
struct MonitorState {
    device: MonitoredDevice,
    default_tracking: bool,
    /// The sampler already re-emitted the last level for an inactive device
    inactive_reported: bool,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            device: MonitoredDevice::NoDevice,
            default_tracking: true,
            inactive_reported: false,
        }
    }
}

struct MonitorCore {
    backend: Arc<dyn AudioBackend>,
    dispatcher: Dispatcher,
    state: Mutex<MonitorState>,
    /// f32 bits of the latest level
    latest_level: AtomicU32,
    poll_interval: Mutex<Option<Duration>>,
    registration: Mutex<Option<ListenerRegistration>>,
    stopped: AtomicBool,
    events: MonitorEvents,
    self_ref: Weak<MonitorCore>,
}

/// Audio monitor tracking one render endpoint.
pub struct AudioDeviceMonitor {
    core: Arc<MonitorCore>,
}

impl std::fmt::Debug for AudioDeviceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("AudioDeviceMonitor")
            .field("device", &state.device.handle().map(|h| h.id().to_string()))
            .field("default_tracking", &state.default_tracking)
            .field("latest_level", &self.core.level())
            .field("poll_interval", &*self.core.poll_interval.lock())
            .finish()
    }
}

impl AudioDeviceMonitor {
    /// Creates a monitor over `backend` and registers for topology notifications.
    ///
    /// No device is opened until [`initialize`](Self::initialize) or an
    /// explicit selection. A backend without notification support is logged
    /// and tolerated.
    pub fn new(backend: Arc<dyn AudioBackend>) -> MonitorResult<Self> {
        let dispatcher = Dispatcher::new(DISPATCHER_THREAD_NAME)?;

        let core = Arc::new_cyclic(|weak| MonitorCore {
            backend,
            dispatcher,
            state: Mutex::new(MonitorState::default()),
            latest_level: AtomicU32::new(0.0f32.to_bits()),
            poll_interval: Mutex::new(None),
            registration: Mutex::new(None),
            stopped: AtomicBool::new(false),
            events: MonitorEvents::default(),
            self_ref: weak.clone(),
        });

        let weak = Arc::downgrade(&core);
        let listener: TopologyListener = Arc::new(move |event| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            let target = Arc::clone(&core);
            if core
                .dispatcher
                .post(move || target.handle_topology_event(event))
                .is_err()
            {
                debug!("Dropping topology notification: dispatcher stopped");
            }
        });

        match core.backend.register_topology_listener(listener) {
            Ok(registration) => *core.registration.lock() = Some(registration),
            Err(e) => warn!("Topology notifications unavailable: {}", e),
        }

        Ok(Self { core })
    }

    /// Channels for device-list, default-device and level notifications.
    pub fn events(&self) -> &MonitorEvents {
        &self.core.events
    }

    // =========================================================================
    // Commands (run on the dispatcher)
    // =========================================================================

    /// Starts periodic sampling, resolving the default device first if none is set.
    ///
    /// A zero interval is replaced with [`DEFAULT_POLL_INTERVAL_MS`].
    ///
    /// Having no render endpoint at all is not an error: the monitor stays in
    /// the no-device state and reports a level of 0.
    pub fn initialize(&self, poll_interval: Duration) -> MonitorResult<()> {
        self.run(move |core| {
            core.initialize(poll_interval);
            Ok(())
        })
    }

    /// Pins the monitor to an active endpoint by id.
    ///
    /// Unknown ids leave the current device untouched.
    pub fn set_device_by_id(&self, id: &str) -> MonitorResult<()> {
        let id = id.to_string();
        self.run(move |core| core.set_device_by_id(&id))
    }

    /// Pins the monitor to the active endpoint with this (unique) friendly name.
    pub fn set_device_by_name(&self, name: &str) -> MonitorResult<()> {
        let id = self.name_to_id(name)?;
        self.set_device_by_id(&id)
    }

    /// Switches to the OS default render endpoint and follows it from now on.
    pub fn set_device_default(&self) -> MonitorResult<()> {
        self.run(|core| core.set_device_default().map(|_| ()))
    }

    /// Runs one sampler tick immediately.
    pub fn sample_now(&self) -> MonitorResult<()> {
        self.run(|core| {
            core.sample_tick();
            Ok(())
        })
    }

    /// Waits until every queued command and notification has been processed.
    pub fn flush(&self) -> MonitorResult<()> {
        self.core.dispatcher.flush()
    }

    /// Stops sampling, releases the device and unregisters notifications.
    ///
    /// Later commands fail with [`MonitorError::MonitorStopped`]; queries keep
    /// answering from the no-device state.
    pub fn stop(&self) {
        if self.core.stopped.load(Ordering::SeqCst) {
            return;
        }
        let core = Arc::clone(&self.core);
        if let Err(e) = self.core.dispatcher.invoke(move || core.stop()) {
            debug!("Monitor stop skipped: {}", e);
        }
    }

    fn run<F>(&self, f: F) -> MonitorResult<()>
    where
        F: FnOnce(&MonitorCore) -> MonitorResult<()> + Send + 'static,
    {
        if self.core.stopped.load(Ordering::SeqCst) {
            return Err(MonitorError::MonitorStopped);
        }
        let core = Arc::clone(&self.core);
        self.core.dispatcher.invoke(move || {
            // A stop queued ahead of this command wins.
            if core.stopped.load(Ordering::SeqCst) {
                return Err(MonitorError::MonitorStopped);
            }
            f(&core)
        })?
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Active render endpoints, enumerated fresh on every call.
    pub fn list_devices(&self) -> Vec<AudioEndpointDescriptor> {
        match self.core.backend.enumerate_active_render_endpoints() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    pub fn list_device_ids(&self) -> Vec<String> {
        self.list_devices().into_iter().map(|d| d.id).collect()
    }

    pub fn list_device_names(&self) -> Vec<String> {
        self.list_devices()
            .into_iter()
            .map(|d| d.friendly_name)
            .collect()
    }

    pub fn current_device_id(&self) -> MonitorResult<String> {
        self.core
            .snapshot()
            .map(|h| h.id().to_string())
            .ok_or_else(|| MonitorError::not_found("no device selected"))
    }

    /// Friendly name of the monitored device.
    ///
    /// A handle invalidated since the last sample yields `DeviceInvalidated`.
    pub fn current_device_name(&self) -> MonitorResult<String> {
        let handle = self
            .core
            .snapshot()
            .ok_or_else(|| MonitorError::not_found("no device selected"))?;
        handle.friendly_name().map_err(|e| match e {
            MonitorError::DeviceNotFound(msg) => MonitorError::DeviceInvalidated(msg),
            other => other,
        })
    }

    pub fn id_to_name(&self, id: &str) -> MonitorResult<String> {
        let matches: Vec<AudioEndpointDescriptor> = self
            .core
            .backend
            .enumerate_active_render_endpoints()?
            .into_iter()
            .filter(|d| d.id == id)
            .collect();
        unique(matches, id).map(|d| d.friendly_name)
    }

    pub fn name_to_id(&self, name: &str) -> MonitorResult<String> {
        let matches: Vec<AudioEndpointDescriptor> = self
            .core
            .backend
            .enumerate_active_render_endpoints()?
            .into_iter()
            .filter(|d| d.friendly_name == name)
            .collect();
        unique(matches, name).map(|d| d.id)
    }

    /// Last sampled level in [0, 1]; 0 without a device.
    pub fn latest_level(&self) -> f32 {
        self.core.level()
    }

    pub fn is_using_default_device(&self) -> bool {
        self.core.state.lock().default_tracking
    }

    /// True while the sampler timer is armed.
    pub fn is_sampling(&self) -> bool {
        self.core.dispatcher.is_timer_running()
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        *self.core.poll_interval.lock()
    }
}

impl Drop for AudioDeviceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn unique(
    mut matches: Vec<AudioEndpointDescriptor>,
    key: &str,
) -> MonitorResult<AudioEndpointDescriptor> {
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(MonitorError::not_found(key)),
        n => Err(MonitorError::not_found(format!(
            "{} ({} endpoints match)",
            key, n
        ))),
    }
}

// =============================================================================
// Dispatcher-side logic
// =============================================================================

impl MonitorCore {
    fn level(&self) -> f32 {
        f32::from_bits(self.latest_level.load(Ordering::Acquire))
    }

    fn store_level(&self, level: f32) {
        self.latest_level
            .store(level.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    fn publish_level(&self, level: f32) {
        self.store_level(level);
        self.events.volume_level_changed.emit(&self.level());
    }

    fn snapshot(&self) -> Option<Arc<dyn EndpointHandle>> {
        self.state.lock().device.handle().cloned()
    }

    fn initialize(&self, poll_interval: Duration) {
        let poll_interval = if poll_interval.is_zero() {
            warn!(
                "Zero poll interval requested, using {} ms",
                DEFAULT_POLL_INTERVAL_MS
            );
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
        } else {
            poll_interval
        };
        *self.poll_interval.lock() = Some(poll_interval);

        let has_device = self.state.lock().device.handle().is_some();
        if has_device {
            self.stop_sampler();
            self.start_sampler_if_active();
        } else if let Err(e) = self.set_device_default() {
            info!("No render endpoint available, monitoring without a device: {}", e);
        }

        info!(
            "Audio monitoring initialized ({} ms interval)",
            poll_interval.as_millis()
        );
        self.events.device_list_changed.emit(&());
    }

    fn set_device_by_id(&self, id: &str) -> MonitorResult<()> {
        let known = self
            .backend
            .enumerate_active_render_endpoints()?
            .iter()
            .any(|d| d.id == id);
        if !known {
            debug!("Device {} is not an active render endpoint", id);
            return Err(MonitorError::not_found(id));
        }

        let handle = self.backend.endpoint_by_id(id)?;
        self.install(handle, false);
        Ok(())
    }

    /// Returns true when the monitored endpoint changed.
    fn set_device_default(&self) -> MonitorResult<bool> {
        let handle = self.backend.default_render_endpoint()?;
        Ok(self.install(handle, true))
    }

    /// Swap protocol: stop the sampler, swap under the lock, release the old
    /// handle outside it, restart the sampler if the new device is active.
    ///
    /// When `new` is the endpoint already installed, the installed handle is
    /// kept and `new` is discarded. Returns true when the endpoint changed.
    fn install(&self, new: Arc<dyn EndpointHandle>, default_tracking: bool) -> bool {
        self.stop_sampler();

        let replaced = {
            let mut state = self.state.lock();
            state.default_tracking = default_tracking;
            if state.device.is(new.id()) {
                None
            } else {
                state.inactive_reported = false;
                Some(std::mem::replace(
                    &mut state.device,
                    MonitoredDevice::Device(Arc::clone(&new)),
                ))
            }
        };

        let changed = replaced.is_some();
        match replaced {
            Some(MonitoredDevice::Device(old)) => {
                info!("Switched audio device {} -> {}", old.id(), new.id());
                drop(old);
            }
            Some(MonitoredDevice::NoDevice) => info!("Monitoring audio device {}", new.id()),
            None => debug!("Audio device {} already installed", new.id()),
        }
        drop(new);

        self.start_sampler_if_active();
        changed
    }

    fn start_sampler_if_active(&self) {
        let Some(interval) = *self.poll_interval.lock() else {
            return;
        };
        let Some(handle) = self.snapshot() else {
            return;
        };

        match handle.state() {
            Ok(state) if state.is_active() => {
                let weak = self.self_ref.clone();
                self.dispatcher.start_timer(interval, move || {
                    if let Some(core) = weak.upgrade() {
                        core.sample_tick();
                    }
                });
            }
            Ok(state) => debug!("Not sampling {}: device is {}", handle.id(), state),
            Err(e) => debug!("Not sampling {}: {}", handle.id(), e),
        }
    }

    fn stop_sampler(&self) {
        self.dispatcher.stop_timer();
    }

    fn sample_tick(&self) {
        let (handle, inactive_reported) = {
            let state = self.state.lock();
            (state.device.handle().cloned(), state.inactive_reported)
        };

        let Some(handle) = handle else {
            if self.level() != 0.0 {
                self.publish_level(0.0);
            }
            return;
        };

        let reading = handle.state().and_then(|state| {
            if !state.is_active() {
                return Ok(None);
            }
            let peak = handle.peak_meter_value()?;
            let volume = handle.output_volume_scalar()?;
            Ok(Some(compute_level(peak, volume)))
        });

        match reading {
            Ok(Some(level)) => {
                if inactive_reported {
                    self.state.lock().inactive_reported = false;
                }
                trace!("Sampled {} -> {:.3}", handle.id(), level);
                self.publish_level(level);
            }
            Ok(None) => {
                if !inactive_reported {
                    self.state.lock().inactive_reported = true;
                    self.events.volume_level_changed.emit(&self.level());
                }
            }
            Err(e) => self.device_lost(&handle, &e),
        }
    }

    /// Demotes a failed read to device loss.
    fn device_lost(&self, handle: &Arc<dyn EndpointHandle>, error: &MonitorError) {
        warn!("Audio device {} lost while sampling: {}", handle.id(), error);

        let released = {
            let mut state = self.state.lock();
            if state.device.is(handle.id()) {
                state.default_tracking = false;
                state.inactive_reported = false;
                Some(std::mem::take(&mut state.device))
            } else {
                None
            }
        };
        drop(released);

        self.publish_level(0.0);
    }

    fn handle_topology_event(&self, event: TopologyEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        debug!("Topology notification: {:?}", event);

        match event {
            TopologyEvent::DeviceAdded(_) => {}
            TopologyEvent::DeviceRemoved(id) => {
                if self.state.lock().device.is(&id) {
                    info!("Monitored audio device {} was removed", id);
                    self.stop_sampler();
                    let released = std::mem::take(&mut self.state.lock().device);
                    drop(released);
                    self.publish_level(0.0);
                }
            }
            TopologyEvent::DeviceStateChanged(id, state) => {
                if self.state.lock().device.is(&id) {
                    if state.is_active() {
                        info!("Monitored audio device {} is active again", id);
                        self.stop_sampler();
                        self.start_sampler_if_active();
                    } else {
                        info!("Monitored audio device {} is now {}", id, state);
                        self.stop_sampler();
                    }
                }
            }
            ref change @ TopologyEvent::DefaultDeviceChanged { .. } => {
                if !change.is_render_default_change() {
                    return;
                }
                if self.state.lock().default_tracking {
                    match self.set_device_default() {
                        Ok(true) => {
                            if let Some(handle) = self.snapshot() {
                                let id = handle.id().to_string();
                                self.events.default_device_changed.emit(&id);
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warn!("Could not follow default device change: {}", e),
                    }
                }
            }
        }

        self.events.device_list_changed.emit(&());
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_sampler();
        let registration = self.registration.lock().take();
        drop(registration);

        let released = std::mem::take(&mut self.state.lock().device);
        drop(released);
        self.store_level(0.0);
        info!("Audio monitoring stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::virtual_device::VirtualBackend;
    use crate::types::{DataFlow, DeviceRole, DeviceState};
    use crossbeam::channel;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Long enough that the timer never fires during a test; ticks are driven
    /// with `sample_now`.
    const IDLE_INTERVAL: Duration = Duration::from_secs(3600);

    struct Recorder {
        list_changes: Arc<AtomicUsize>,
        defaults: Arc<Mutex<Vec<String>>>,
        levels: Arc<Mutex<Vec<f32>>>,
    }

    impl Recorder {
        fn attach(monitor: &AudioDeviceMonitor) -> Self {
            let recorder = Self {
                list_changes: Arc::new(AtomicUsize::new(0)),
                defaults: Arc::new(Mutex::new(Vec::new())),
                levels: Arc::new(Mutex::new(Vec::new())),
            };

            let list = Arc::clone(&recorder.list_changes);
            monitor.events().device_list_changed.subscribe(move |_| {
                list.fetch_add(1, Ordering::SeqCst);
            });
            let defaults = Arc::clone(&recorder.defaults);
            monitor
                .events()
                .default_device_changed
                .subscribe(move |id| defaults.lock().push(id.clone()));
            let levels = Arc::clone(&recorder.levels);
            monitor
                .events()
                .volume_level_changed
                .subscribe(move |level| levels.lock().push(*level));

            recorder
        }

        fn list_changes(&self) -> usize {
            self.list_changes.load(Ordering::SeqCst)
        }

        fn zero_levels(&self) -> usize {
            self.levels.lock().iter().filter(|l| **l == 0.0).count()
        }
    }

    /// Parks the dispatcher until the returned sender is used.
    fn block_dispatcher(monitor: &AudioDeviceMonitor) -> channel::Sender<()> {
        let (release, gate) = channel::bounded::<()>(0);
        monitor
            .core
            .dispatcher
            .post(move || {
                let _ = gate.recv();
            })
            .unwrap();
        release
    }

    /// Endpoint whose handle reports itself gone on every name lookup.
    struct StaleHandle;

    impl EndpointHandle for StaleHandle {
        fn id(&self) -> &str {
            "stale"
        }

        fn friendly_name(&self) -> MonitorResult<String> {
            Err(MonitorError::not_found("stale"))
        }

        fn state(&self) -> MonitorResult<DeviceState> {
            Ok(DeviceState::Active)
        }

        fn peak_meter_value(&self) -> MonitorResult<f32> {
            Ok(0.0)
        }

        fn output_volume_scalar(&self) -> MonitorResult<f32> {
            Ok(1.0)
        }
    }

    struct StaleBackend;

    impl AudioBackend for StaleBackend {
        fn enumerate_active_render_endpoints(
            &self,
        ) -> MonitorResult<Vec<AudioEndpointDescriptor>> {
            Ok(vec![AudioEndpointDescriptor {
                id: "stale".into(),
                friendly_name: "Stale".into(),
                state: DeviceState::Active,
            }])
        }

        fn default_render_endpoint(&self) -> MonitorResult<Arc<dyn EndpointHandle>> {
            Ok(Arc::new(StaleHandle))
        }

        fn endpoint_by_id(&self, _id: &str) -> MonitorResult<Arc<dyn EndpointHandle>> {
            Ok(Arc::new(StaleHandle))
        }

        fn register_topology_listener(
            &self,
            _listener: TopologyListener,
        ) -> MonitorResult<ListenerRegistration> {
            Ok(ListenerRegistration::new(|| {}))
        }
    }

    /// Endpoints A (default) and B.
    fn two_devices() -> VirtualBackend {
        let backend = VirtualBackend::new();
        backend.add_endpoint("a", "Speakers");
        backend.add_endpoint("b", "Headphones");
        backend.set_default(Some("a"));
        backend
    }

    fn monitor_on(backend: &VirtualBackend) -> AudioDeviceMonitor {
        AudioDeviceMonitor::new(Arc::new(backend.clone())).unwrap()
    }

    fn initialized(backend: &VirtualBackend) -> AudioDeviceMonitor {
        let monitor = monitor_on(backend);
        monitor.initialize(IDLE_INTERVAL).unwrap();
        monitor
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    #[test]
    fn initialize_tracks_default_device() {
        let backend = two_devices();
        let monitor = monitor_on(&backend);
        let recorder = Recorder::attach(&monitor);

        monitor.initialize(IDLE_INTERVAL).unwrap();

        assert_eq!(monitor.current_device_id().unwrap(), "a");
        assert_eq!(monitor.current_device_name().unwrap(), "Speakers");
        assert!(monitor.is_using_default_device());
        assert!(monitor.is_sampling());
        assert_eq!(monitor.poll_interval(), Some(IDLE_INTERVAL));
        assert_eq!(recorder.list_changes(), 1);
        assert_eq!(backend.live_handles().len(), 1);
    }

    #[test]
    fn initialize_without_hardware_is_not_an_error() {
        let backend = VirtualBackend::new();
        let monitor = monitor_on(&backend);

        monitor.initialize(IDLE_INTERVAL).unwrap();

        assert!(monitor.current_device_id().unwrap_err().is_not_found());
        assert!(monitor.current_device_name().unwrap_err().is_not_found());
        assert_eq!(monitor.latest_level(), 0.0);
        assert!(monitor.list_device_ids().is_empty());
        assert!(!monitor.is_sampling());
        monitor.sample_now().unwrap();
        assert_eq!(monitor.latest_level(), 0.0);
    }

    #[test]
    fn zero_interval_falls_back_to_default() {
        let backend = two_devices();
        let monitor = monitor_on(&backend);
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        monitor.events().volume_level_changed.subscribe(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });

        monitor.initialize(Duration::ZERO).unwrap();
        let expected = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(monitor.poll_interval(), Some(expected));
        assert_eq!(monitor.core.dispatcher.timer_interval(), Some(expected));

        thread::sleep(Duration::from_millis(100));
        assert!(ticks.load(Ordering::SeqCst) < 10);
    }

    #[test]
    fn initialize_keeps_an_explicit_selection() {
        let backend = two_devices();
        let monitor = monitor_on(&backend);
        monitor.set_device_by_id("b").unwrap();

        monitor.initialize(IDLE_INTERVAL).unwrap();

        assert_eq!(monitor.current_device_id().unwrap(), "b");
        assert!(!monitor.is_using_default_device());
        assert!(monitor.is_sampling());
    }

    // =========================================================================
    // Sampling
    // =========================================================================

    #[test]
    fn sample_combines_peak_and_volume() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        let recorder = Recorder::attach(&monitor);

        backend.set_signal("a", 0.8, 0.5);
        monitor.sample_now().unwrap();

        assert!((monitor.latest_level() - 0.4).abs() < 1e-6);
        assert_eq!(recorder.levels.lock().len(), 1);
    }

    #[test]
    fn level_is_clamped_to_unit_range() {
        let backend = two_devices();
        let monitor = initialized(&backend);

        backend.set_signal("a", 3.0, 1.0);
        monitor.sample_now().unwrap();
        assert_eq!(monitor.latest_level(), 1.0);

        backend.set_signal("a", -1.0, 1.0);
        monitor.sample_now().unwrap();
        assert_eq!(monitor.latest_level(), 0.0);
    }

    #[test]
    fn events_are_delivered_on_the_dispatcher_thread() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        let thread_name = Arc::new(Mutex::new(None));
        let t = Arc::clone(&thread_name);
        monitor.events().volume_level_changed.subscribe(move |_| {
            *t.lock() = std::thread::current().name().map(str::to_string);
        });

        monitor.sample_now().unwrap();

        assert_eq!(
            thread_name.lock().as_deref(),
            Some(DISPATCHER_THREAD_NAME)
        );
    }

    #[test]
    fn read_failure_is_treated_as_device_loss() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        let recorder = Recorder::attach(&monitor);
        backend.set_signal("a", 0.5, 1.0);
        monitor.sample_now().unwrap();

        backend.set_read_failure("a", true);
        monitor.sample_now().unwrap();

        assert_eq!(monitor.latest_level(), 0.0);
        assert!(monitor.current_device_id().is_err());
        assert!(!monitor.is_using_default_device());
        assert!(backend.live_handles().is_empty());
        assert_eq!(*recorder.levels.lock(), vec![0.5, 0.0]);

        // Further ticks without a device stay quiet.
        monitor.sample_now().unwrap();
        assert_eq!(recorder.levels.lock().len(), 2);
    }

    #[test]
    fn inactive_device_repeats_last_level_once() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        backend.set_signal("a", 0.6, 1.0);
        monitor.sample_now().unwrap();
        let recorder = Recorder::attach(&monitor);

        backend.set_state("a", DeviceState::Disabled);
        monitor.flush().unwrap();
        assert!(!monitor.is_sampling());

        monitor.sample_now().unwrap();
        monitor.sample_now().unwrap();
        assert_eq!(*recorder.levels.lock(), vec![0.6]);
        assert_eq!(monitor.current_device_id().unwrap(), "a");

        backend.set_state("a", DeviceState::Active);
        monitor.flush().unwrap();
        assert!(monitor.is_sampling());
        monitor.sample_now().unwrap();
        assert_eq!(recorder.levels.lock().len(), 2);
        assert_eq!(recorder.list_changes(), 2);
    }

    // =========================================================================
    // Device selection
    // =========================================================================

    #[test]
    fn set_device_by_id_pins_and_releases_previous() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        let (first_serial, _) = backend.live_handles()[0].clone();

        monitor.set_device_by_id("b").unwrap();

        assert_eq!(monitor.current_device_id().unwrap(), "b");
        assert!(!monitor.is_using_default_device());
        assert_eq!(backend.released_handles(), vec![first_serial]);
        assert_eq!(backend.live_handles().len(), 1);
        assert!(monitor.is_sampling());
    }

    #[test]
    fn set_device_by_unknown_id_changes_nothing() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        let before = backend.live_handles();

        let err = monitor.set_device_by_id("missing").unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(monitor.current_device_id().unwrap(), "a");
        assert!(monitor.is_using_default_device());
        assert_eq!(backend.live_handles(), before);
        assert!(backend.released_handles().is_empty());
    }

    #[test]
    fn set_device_by_name_resolves_unique_names() {
        let backend = two_devices();
        let monitor = initialized(&backend);

        monitor.set_device_by_name("Headphones").unwrap();
        assert_eq!(monitor.current_device_id().unwrap(), "b");

        backend.add_endpoint("c", "Headphones");
        assert!(monitor.set_device_by_name("Headphones").is_err());
        assert_eq!(monitor.current_device_id().unwrap(), "b");
    }

    #[test]
    fn set_device_default_twice_releases_nothing() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        let installed = backend.live_handles();
        assert_eq!(installed.len(), 1);

        monitor.set_device_default().unwrap();
        monitor.set_device_default().unwrap();

        assert_eq!(backend.live_handles(), installed);
        assert!(!backend.released_handles().contains(&installed[0].0));
        assert!(monitor.is_using_default_device());
    }

    #[test]
    fn set_device_default_without_default_keeps_current() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        monitor.set_device_by_id("b").unwrap();
        backend.set_default(None);
        monitor.flush().unwrap();

        assert!(monitor.set_device_default().is_err());
        assert_eq!(monitor.current_device_id().unwrap(), "b");
        assert!(!monitor.is_using_default_device());
    }

    #[test]
    fn at_most_one_handle_is_live_across_switches() {
        let backend = two_devices();
        let monitor = initialized(&backend);

        let steps: [Option<&str>; 8] = [
            Some("b"),
            None,
            Some("a"),
            None,
            None,
            Some("b"),
            Some("missing"),
            Some("b"),
        ];
        for step in steps {
            let _ = match step {
                Some(id) => monitor.set_device_by_id(id),
                None => monitor.set_device_default(),
            };
            let live = backend.live_handles();
            assert_eq!(live.len(), 1);
            assert!(!backend.released_handles().contains(&live[0].0));
        }

        let released = backend.released_handles();
        let unique: HashSet<u64> = released.iter().copied().collect();
        assert_eq!(unique.len(), released.len());
    }

    #[test]
    fn lookups_require_a_unique_match() {
        let backend = two_devices();
        let monitor = monitor_on(&backend);

        assert_eq!(monitor.id_to_name("b").unwrap(), "Headphones");
        assert_eq!(monitor.name_to_id("Speakers").unwrap(), "a");
        assert!(monitor.id_to_name("zzz").unwrap_err().is_not_found());

        backend.add_endpoint("c", "Speakers");
        assert!(monitor.name_to_id("Speakers").unwrap_err().is_not_found());
    }

    #[test]
    fn listing_is_fresh_and_tolerates_failure() {
        let backend = two_devices();
        let monitor = monitor_on(&backend);
        assert_eq!(monitor.list_device_ids(), vec!["a", "b"]);
        assert_eq!(monitor.list_device_names(), vec!["Speakers", "Headphones"]);

        backend.set_state("b", DeviceState::Unplugged);
        assert_eq!(monitor.list_device_ids(), vec!["a"]);

        backend.set_enumeration_failure(true);
        assert!(monitor.list_device_ids().is_empty());
        assert!(matches!(
            monitor.set_device_by_id("a"),
            Err(MonitorError::EnumerationFailure(_))
        ));
    }

    // =========================================================================
    // Topology notifications
    // =========================================================================

    #[test]
    fn removing_the_monitored_device_resets_everything() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        backend.set_signal("a", 0.7, 1.0);
        monitor.sample_now().unwrap();
        let recorder = Recorder::attach(&monitor);

        backend.remove_endpoint("a");
        monitor.flush().unwrap();

        assert_eq!(monitor.latest_level(), 0.0);
        assert!(monitor.current_device_id().unwrap_err().is_not_found());
        assert_eq!(recorder.list_changes(), 1);
        assert_eq!(recorder.zero_levels(), 1);
        assert_eq!(recorder.levels.lock().len(), 1);
        assert!(backend.live_handles().is_empty());
        assert!(!monitor.is_sampling());
    }

    #[test]
    fn removing_another_device_only_refreshes_the_list() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        let recorder = Recorder::attach(&monitor);

        backend.remove_endpoint("b");
        monitor.flush().unwrap();

        assert_eq!(monitor.current_device_id().unwrap(), "a");
        assert_eq!(recorder.list_changes(), 1);
        assert!(recorder.levels.lock().is_empty());
        assert!(monitor.is_sampling());
    }

    #[test]
    fn default_change_is_followed_while_tracking() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        let recorder = Recorder::attach(&monitor);

        backend.set_default(Some("b"));
        monitor.flush().unwrap();

        assert_eq!(monitor.current_device_id().unwrap(), "b");
        assert_eq!(*recorder.defaults.lock(), vec!["b".to_string()]);
        assert_eq!(recorder.list_changes(), 1);

        // The console-role notification for the same endpoint is a no-op swap.
        backend.emit(TopologyEvent::DefaultDeviceChanged {
            flow: DataFlow::Render,
            role: DeviceRole::Console,
            id: Some("b".to_string()),
        });
        monitor.flush().unwrap();

        assert_eq!(recorder.defaults.lock().len(), 1);
        assert_eq!(recorder.list_changes(), 2);
        assert_eq!(backend.live_handles().len(), 1);
    }

    #[test]
    fn communications_and_capture_defaults_are_ignored() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        let recorder = Recorder::attach(&monitor);
        backend.set_default(None);
        monitor.flush().unwrap();
        let list_before = recorder.list_changes();

        backend.emit(TopologyEvent::DefaultDeviceChanged {
            flow: DataFlow::Render,
            role: DeviceRole::Communications,
            id: Some("b".to_string()),
        });
        backend.emit(TopologyEvent::DefaultDeviceChanged {
            flow: DataFlow::Capture,
            role: DeviceRole::Multimedia,
            id: Some("b".to_string()),
        });
        monitor.flush().unwrap();

        assert_eq!(monitor.current_device_id().unwrap(), "a");
        assert_eq!(recorder.list_changes(), list_before);
        assert!(recorder.defaults.lock().is_empty());
    }

    #[test]
    fn pinned_device_ignores_default_changes() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        assert_eq!(monitor.current_device_id().unwrap(), "a");

        monitor.set_device_by_id("b").unwrap();
        assert!(!monitor.is_using_default_device());
        let recorder = Recorder::attach(&monitor);

        backend.add_endpoint("c", "USB DAC");
        backend.set_default(Some("c"));
        monitor.flush().unwrap();

        assert_eq!(monitor.current_device_id().unwrap(), "b");
        assert!(recorder.defaults.lock().is_empty());
        assert_eq!(recorder.list_changes(), 2);
    }

    #[test]
    fn device_returns_after_removal_when_tracking_default() {
        let backend = two_devices();
        let monitor = initialized(&backend);

        backend.remove_endpoint("a");
        backend.set_default(Some("b"));
        monitor.flush().unwrap();

        assert_eq!(monitor.current_device_id().unwrap(), "b");
        assert!(monitor.is_sampling());
    }

    // =========================================================================
    // Invalidated handles
    // =========================================================================

    #[test]
    fn name_of_removed_device_is_invalidated_until_notified() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        let release = block_dispatcher(&monitor);

        backend.remove_endpoint("a");

        assert!(matches!(
            monitor.current_device_name(),
            Err(MonitorError::DeviceInvalidated(_))
        ));
        assert_eq!(monitor.current_device_id().unwrap(), "a");

        release.send(()).unwrap();
        monitor.flush().unwrap();
        assert!(monitor.current_device_name().unwrap_err().is_not_found());
    }

    #[test]
    fn vanished_handle_name_maps_to_invalidated() {
        let monitor = AudioDeviceMonitor::new(Arc::new(StaleBackend)).unwrap();
        monitor.set_device_default().unwrap();

        assert_eq!(monitor.current_device_id().unwrap(), "stale");
        assert_eq!(
            monitor.current_device_name(),
            Err(MonitorError::DeviceInvalidated("stale".to_string()))
        );
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    #[test]
    fn command_queued_behind_stop_is_rejected() {
        let backend = two_devices();
        let monitor = Arc::new(initialized(&backend));
        let release = block_dispatcher(&monitor);

        let stopper = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.stop())
        };
        thread::sleep(Duration::from_millis(50));
        let switcher = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.set_device_by_id("b"))
        };
        thread::sleep(Duration::from_millis(50));
        release.send(()).unwrap();

        stopper.join().unwrap();
        assert_eq!(switcher.join().unwrap(), Err(MonitorError::MonitorStopped));
        assert!(backend.live_handles().is_empty());
        assert!(!monitor.is_sampling());
        assert!(monitor.current_device_id().is_err());
    }

    #[test]
    fn stop_releases_device_and_listener() {
        let backend = two_devices();
        let monitor = initialized(&backend);
        assert_eq!(backend.listener_count(), 1);

        monitor.stop();

        assert!(backend.live_handles().is_empty());
        assert_eq!(backend.listener_count(), 0);
        assert!(!monitor.is_sampling());
        assert_eq!(monitor.latest_level(), 0.0);
        assert_eq!(
            monitor.set_device_default(),
            Err(MonitorError::MonitorStopped)
        );
        assert!(monitor.current_device_id().is_err());
    }

    #[test]
    fn dropping_the_monitor_cleans_up() {
        let backend = two_devices();
        {
            let _monitor = initialized(&backend);
            assert_eq!(backend.live_handles().len(), 1);
        }
        assert!(backend.live_handles().is_empty());
        assert_eq!(backend.listener_count(), 0);
    }

    #[test]
    fn running_timer_samples_on_its_own() {
        let backend = two_devices();
        backend.set_signal("a", 0.5, 0.5);
        let monitor = monitor_on(&backend);
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        monitor.events().volume_level_changed.subscribe(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });

        monitor.initialize(Duration::from_millis(5)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert!((monitor.latest_level() - 0.25).abs() < 1e-6);
    }
}
