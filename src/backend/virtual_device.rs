//! In-memory audio backend.
//!
//! Models a set of render endpoints whose state, default role, and signal can
//! be changed at runtime. Every mutation raises the same topology notification
//! the OS would, on the calling thread. Handle opens and releases are recorded
//! so ownership can be audited.
//!
//! Used by the binary on platforms without a native backend and by the
//! monitor tests.

use log::debug;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{AudioBackend, EndpointHandle, ListenerRegistration, TopologyListener};
use crate::error::{MonitorError, MonitorResult};
use crate::types::{AudioEndpointDescriptor, DataFlow, DeviceRole, DeviceState, TopologyEvent};

/// Fallback seed value when system time is unavailable
const FALLBACK_SEED: u64 = 42;

/// What an endpoint's peak meter reports.
#[derive(Debug)]
enum Signal {
    Fixed(f32),
    /// Uniform noise in `0.0..=ceiling`
    Noise { rng: StdRng, ceiling: f32 },
}

impl Signal {
    fn read(&mut self) -> f32 {
        match self {
            Signal::Fixed(peak) => *peak,
            Signal::Noise { rng, ceiling } => rng.random_range(0.0..=*ceiling),
        }
    }
}

#[derive(Debug)]
struct VirtualEndpoint {
    id: String,
    name: String,
    state: DeviceState,
    signal: Signal,
    volume: f32,
    fail_reads: bool,
}

#[derive(Debug, Default)]
struct World {
    endpoints: Vec<VirtualEndpoint>,
    default_id: Option<String>,
    enumeration_fails: bool,
    next_serial: u64,
    /// (serial, endpoint id) of every handle not yet released
    open_handles: Vec<(u64, String)>,
    released: Vec<u64>,
}

impl World {
    fn endpoint(&self, id: &str) -> Option<&VirtualEndpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    fn endpoint_mut(&mut self, id: &str) -> Option<&mut VirtualEndpoint> {
        self.endpoints.iter_mut().find(|e| e.id == id)
    }
}

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, TopologyListener)>>,
}

/// Scriptable render-endpoint backend.
#[derive(Clone, Default)]
pub struct VirtualBackend {
    world: Arc<Mutex<World>>,
    listeners: Arc<Listeners>,
}

impl std::fmt::Debug for VirtualBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let world = self.world.lock();
        f.debug_struct("VirtualBackend")
            .field("endpoints", &world.endpoints.len())
            .field("default_id", &world.default_id)
            .field("open_handles", &world.open_handles.len())
            .finish()
    }
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two endpoints playing random noise, the first one default.
    pub fn demo() -> Self {
        let backend = Self::new();
        backend.add_endpoint("virtual-speakers", "Speakers (Virtual Audio)");
        backend.add_endpoint("virtual-headphones", "Headphones (Virtual Audio)");
        backend.set_noise("virtual-speakers", 1.0);
        backend.set_noise("virtual-headphones", 0.6);
        backend.set_default(Some("virtual-speakers"));
        backend
    }

    // =========================================================================
    // Topology mutation
    // =========================================================================

    /// Adds an Active endpoint at full volume and silent signal.
    pub fn add_endpoint(&self, id: &str, name: &str) {
        {
            let mut world = self.world.lock();
            world.endpoints.push(VirtualEndpoint {
                id: id.to_string(),
                name: name.to_string(),
                state: DeviceState::Active,
                signal: Signal::Fixed(0.0),
                volume: 1.0,
                fail_reads: false,
            });
        }
        self.emit(TopologyEvent::DeviceAdded(id.to_string()));
    }

    /// Removes an endpoint. Open handles on it start failing.
    pub fn remove_endpoint(&self, id: &str) {
        {
            let mut world = self.world.lock();
            world.endpoints.retain(|e| e.id != id);
            if world.default_id.as_deref() == Some(id) {
                world.default_id = None;
            }
        }
        self.emit(TopologyEvent::DeviceRemoved(id.to_string()));
    }

    pub fn set_state(&self, id: &str, state: DeviceState) {
        {
            let mut world = self.world.lock();
            match world.endpoint_mut(id) {
                Some(endpoint) => endpoint.state = state,
                None => return,
            }
        }
        self.emit(TopologyEvent::DeviceStateChanged(id.to_string(), state));
    }

    /// Changes the default render endpoint and raises a multimedia-role notification.
    pub fn set_default(&self, id: Option<&str>) {
        self.world.lock().default_id = id.map(str::to_string);
        self.emit(TopologyEvent::DefaultDeviceChanged {
            flow: DataFlow::Render,
            role: DeviceRole::Multimedia,
            id: id.map(str::to_string),
        });
    }

    // =========================================================================
    // Signal and fault injection
    // =========================================================================

    pub fn set_signal(&self, id: &str, peak: f32, volume: f32) {
        if let Some(endpoint) = self.world.lock().endpoint_mut(id) {
            endpoint.signal = Signal::Fixed(peak);
            endpoint.volume = volume;
        }
    }

    /// Replaces the endpoint's signal with seeded uniform noise.
    pub fn set_noise(&self, id: &str, ceiling: f32) {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(FALLBACK_SEED);

        if let Some(endpoint) = self.world.lock().endpoint_mut(id) {
            endpoint.signal = Signal::Noise {
                rng: StdRng::seed_from_u64(seed),
                ceiling: ceiling.clamp(0.0, 1.0),
            };
        }
    }

    /// Makes meter and volume reads on the endpoint fail.
    pub fn set_read_failure(&self, id: &str, fail: bool) {
        if let Some(endpoint) = self.world.lock().endpoint_mut(id) {
            endpoint.fail_reads = fail;
        }
    }

    pub fn set_enumeration_failure(&self, fail: bool) {
        self.world.lock().enumeration_fails = fail;
    }

    /// Delivers a raw notification to every listener on the calling thread.
    pub fn emit(&self, event: TopologyEvent) {
        let snapshot: Vec<TopologyListener> = self
            .listeners
            .entries
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in snapshot {
            listener(event.clone());
        }
    }

    // =========================================================================
    // Ownership audit
    // =========================================================================

    /// (serial, endpoint id) of every handle not yet released.
    pub fn live_handles(&self) -> Vec<(u64, String)> {
        self.world.lock().open_handles.clone()
    }

    /// Serials of released handles, in release order.
    pub fn released_handles(&self) -> Vec<u64> {
        self.world.lock().released.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.entries.lock().len()
    }

    fn open(&self, id: &str) -> MonitorResult<Arc<dyn EndpointHandle>> {
        let mut world = self.world.lock();
        if world.endpoint(id).is_none() {
            return Err(MonitorError::not_found(id));
        }
        world.next_serial += 1;
        let serial = world.next_serial;
        world.open_handles.push((serial, id.to_string()));
        debug!("Virtual endpoint {} opened as handle #{}", id, serial);

        Ok(Arc::new(VirtualHandle {
            serial,
            id: id.to_string(),
            world: Arc::clone(&self.world),
        }))
    }
}

impl AudioBackend for VirtualBackend {
    fn enumerate_active_render_endpoints(&self) -> MonitorResult<Vec<AudioEndpointDescriptor>> {
        let world = self.world.lock();
        if world.enumeration_fails {
            return Err(MonitorError::enumeration("virtual enumeration failure"));
        }
        Ok(world
            .endpoints
            .iter()
            .filter(|e| e.state.is_active())
            .map(|e| AudioEndpointDescriptor {
                id: e.id.clone(),
                friendly_name: e.name.clone(),
                state: e.state,
            })
            .collect())
    }

    fn default_render_endpoint(&self) -> MonitorResult<Arc<dyn EndpointHandle>> {
        let default_id = self.world.lock().default_id.clone();
        match default_id {
            Some(id) => self.open(&id),
            None => Err(MonitorError::not_found("no default render endpoint")),
        }
    }

    fn endpoint_by_id(&self, id: &str) -> MonitorResult<Arc<dyn EndpointHandle>> {
        self.open(id)
    }

    fn register_topology_listener(
        &self,
        listener: TopologyListener,
    ) -> MonitorResult<ListenerRegistration> {
        let key = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.entries.lock().push((key, listener));

        let listeners = Arc::clone(&self.listeners);
        Ok(ListenerRegistration::new(move || {
            listeners.entries.lock().retain(|(k, _)| *k != key);
        }))
    }
}

/// Handle onto a virtual endpoint; records its release on drop.
struct VirtualHandle {
    serial: u64,
    id: String,
    world: Arc<Mutex<World>>,
}

impl VirtualHandle {
    fn gone(&self) -> MonitorError {
        MonitorError::invalidated(format!("virtual endpoint {} was removed", self.id))
    }
}

impl EndpointHandle for VirtualHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn friendly_name(&self) -> MonitorResult<String> {
        let world = self.world.lock();
        world
            .endpoint(&self.id)
            .map(|e| e.name.clone())
            .ok_or_else(|| self.gone())
    }

    fn state(&self) -> MonitorResult<DeviceState> {
        let world = self.world.lock();
        world
            .endpoint(&self.id)
            .map(|e| e.state)
            .ok_or_else(|| self.gone())
    }

    fn peak_meter_value(&self) -> MonitorResult<f32> {
        let mut world = self.world.lock();
        let endpoint = world.endpoint_mut(&self.id).ok_or_else(|| self.gone())?;
        if endpoint.fail_reads {
            return Err(MonitorError::invalidated(format!(
                "peak meter read failed on {}",
                self.id
            )));
        }
        Ok(endpoint.signal.read())
    }

    fn output_volume_scalar(&self) -> MonitorResult<f32> {
        let world = self.world.lock();
        let endpoint = world.endpoint(&self.id).ok_or_else(|| self.gone())?;
        if endpoint.fail_reads {
            return Err(MonitorError::invalidated(format!(
                "volume read failed on {}",
                self.id
            )));
        }
        Ok(endpoint.volume)
    }
}

impl Drop for VirtualHandle {
    fn drop(&mut self) {
        let mut world = self.world.lock();
        world.open_handles.retain(|(serial, _)| *serial != self.serial);
        world.released.push(self.serial);
    }
}
