//! Audio backend abstraction.
//!
//! The monitor talks to the OS audio subsystem only through these traits:
//! - [`AudioBackend`] enumerates render endpoints, resolves handles, and
//!   delivers topology notifications
//! - [`EndpointHandle`] is one opened endpoint, released when its last
//!   reference is dropped

use std::fmt;
use std::sync::Arc;

use crate::error::MonitorResult;
use crate::types::{AudioEndpointDescriptor, DeviceState, TopologyEvent};

pub mod virtual_device;

#[cfg(windows)]
pub mod wasapi;

/// Callback invoked by a backend for every topology change, on any thread.
pub type TopologyListener = Arc<dyn Fn(TopologyEvent) + Send + Sync + 'static>;

/// An opened audio render endpoint.
///
/// Every method may fail once the underlying device is gone; callers map
/// such failures to device loss.
pub trait EndpointHandle: Send + Sync {
    /// OS identifier of the endpoint this handle was opened on
    fn id(&self) -> &str;

    fn friendly_name(&self) -> MonitorResult<String>;

    fn state(&self) -> MonitorResult<DeviceState>;

    /// Instantaneous peak amplitude, 0.0 to 1.0
    fn peak_meter_value(&self) -> MonitorResult<f32>;

    /// Master volume scalar, 0.0 to 1.0
    fn output_volume_scalar(&self) -> MonitorResult<f32>;
}

impl fmt::Debug for dyn EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("id", &self.id())
            .finish()
    }
}

/// OS audio subsystem binding.
pub trait AudioBackend: Send + Sync {
    /// Lists the render endpoints currently in the Active state.
    fn enumerate_active_render_endpoints(&self) -> MonitorResult<Vec<AudioEndpointDescriptor>>;

    /// Opens the default render endpoint for the multimedia role.
    fn default_render_endpoint(&self) -> MonitorResult<Arc<dyn EndpointHandle>>;

    /// Opens an endpoint by OS identifier.
    fn endpoint_by_id(&self, id: &str) -> MonitorResult<Arc<dyn EndpointHandle>>;

    /// Registers a topology listener. Dropping the returned registration unregisters it.
    fn register_topology_listener(
        &self,
        listener: TopologyListener,
    ) -> MonitorResult<ListenerRegistration>;
}

/// Guard for a registered topology listener.
pub struct ListenerRegistration {
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerRegistration {
    pub fn new<F>(unregister: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            unregister: Some(Box::new(unregister)),
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("active", &self.unregister.is_some())
            .finish()
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

/// Opens the platform's native backend.
#[cfg(windows)]
pub fn native_backend() -> MonitorResult<Arc<dyn AudioBackend>> {
    Ok(Arc::new(wasapi::WasapiBackend::new()?))
}
