//! Windows audio backend.
//!
//! Uses the MMDevice API through WASAPI:
//! - Render endpoint enumeration and default-endpoint resolution
//! - Peak metering via `IAudioMeterInformation`
//! - Master volume via `IAudioEndpointVolume`
//! - Topology notifications via an `IMMNotificationClient`

use log::{debug, warn};
use std::cell::Cell;
use std::sync::Arc;

use windows::core::{implement, PCWSTR, PWSTR};
use windows::Win32::Media::Audio::Endpoints::{IAudioEndpointVolume, IAudioMeterInformation};
use windows::Win32::Media::Audio::{
    eCapture, eCommunications, eConsole, eMultimedia, eRender, EDataFlow, ERole, IMMDevice,
    IMMDeviceEnumerator, IMMNotificationClient, IMMNotificationClient_Impl, MMDeviceEnumerator,
    DEVICE_STATE, DEVICE_STATE_ACTIVE, DEVICE_STATE_DISABLED, DEVICE_STATE_UNPLUGGED,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CLSCTX_ALL, COINIT_MULTITHREADED, STGM_READ,
};
use windows::Win32::UI::Shell::PropertiesSystem::{IPropertyStore, PROPERTYKEY};

use super::{AudioBackend, EndpointHandle, ListenerRegistration, TopologyListener};
use crate::error::{MonitorError, MonitorResult};
use crate::types::{AudioEndpointDescriptor, DataFlow, DeviceRole, DeviceState, TopologyEvent};

// COM initialization result codes
/// S_FALSE - COM already initialized (acceptable)
const COM_S_FALSE: u32 = 1;

/// RPC_E_CHANGED_MODE - COM initialized with different threading model (acceptable)
const COM_RPC_E_CHANGED_MODE: u32 = 0x80010106;

/// HRESULT_FROM_WIN32(ERROR_NOT_FOUND), returned by `GetDevice` for unknown ids
const E_NOTFOUND: u32 = 0x80070490;

// PKEY_Device_FriendlyName = {a45c254e-df1c-4efd-8020-67d146a850e0}, 14
const PKEY_DEVICE_FRIENDLYNAME: PROPERTYKEY = PROPERTYKEY {
    fmtid: windows::core::GUID::from_u128(0xa45c254e_df1c_4efd_8020_67d146a850e0),
    pid: 14,
};

thread_local! {
    static COM_READY: Cell<bool> = const { Cell::new(false) };
}

/// Joins the calling thread to the multithreaded apartment, once per thread.
fn ensure_com() -> MonitorResult<()> {
    if COM_READY.with(Cell::get) {
        return Ok(());
    }

    // SAFETY: CoInitializeEx has no preconditions; S_FALSE and
    // RPC_E_CHANGED_MODE both leave COM usable on this thread.
    let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
    if hr.is_err() {
        let code = hr.0 as u32;
        if code != COM_S_FALSE && code != COM_RPC_E_CHANGED_MODE {
            return Err(MonitorError::Unknown(format!(
                "COM initialization failed: HRESULT 0x{:08X}",
                code
            )));
        }
    }

    COM_READY.with(|ready| ready.set(true));
    Ok(())
}

fn create_enumerator() -> MonitorResult<IMMDeviceEnumerator> {
    ensure_com()?;
    // SAFETY: COM is initialized on this thread.
    unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
        .map_err(|e| MonitorError::enumeration(format!("Failed to create device enumerator: {}", e)))
}

fn map_state(state: DEVICE_STATE) -> DeviceState {
    if state == DEVICE_STATE_ACTIVE {
        DeviceState::Active
    } else if state == DEVICE_STATE_DISABLED {
        DeviceState::Disabled
    } else if state == DEVICE_STATE_UNPLUGGED {
        DeviceState::Unplugged
    } else {
        DeviceState::NotPresent
    }
}

fn map_flow(flow: EDataFlow) -> DataFlow {
    if flow == eCapture {
        DataFlow::Capture
    } else {
        DataFlow::Render
    }
}

fn map_role(role: ERole) -> DeviceRole {
    if role == eConsole {
        DeviceRole::Console
    } else if role == eCommunications {
        DeviceRole::Communications
    } else {
        DeviceRole::Multimedia
    }
}

/// Copies a COM-allocated wide string and frees it.
///
/// # Safety
///
/// `ptr` must be null or a valid, NUL-terminated string allocated with
/// `CoTaskMemAlloc`, not used after this call.
unsafe fn take_co_string(ptr: PWSTR) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let value = ptr.to_string().unwrap_or_default();
    CoTaskMemFree(Some(ptr.0 as *const _));
    value
}

/// Copies a borrowed wide string from a notification callback.
///
/// # Safety
///
/// `ptr` must be null or valid for the duration of the callback.
unsafe fn pcwstr_to_string(ptr: &PCWSTR) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        ptr.to_string().ok()
    }
}

/// Reads the endpoint id of a device.
///
/// # Safety
///
/// COM must be initialized on the current thread.
unsafe fn device_id(device: &IMMDevice) -> MonitorResult<String> {
    let ptr = device
        .GetId()
        .map_err(|e| MonitorError::invalidated(format!("Failed to get device ID: {}", e)))?;
    Ok(take_co_string(ptr))
}

/// Reads the friendly name from the device's property store.
///
/// # Safety
///
/// COM must be initialized on the current thread.
unsafe fn device_name(device: &IMMDevice) -> MonitorResult<String> {
    let store: IPropertyStore = device
        .OpenPropertyStore(STGM_READ)
        .map_err(|e| MonitorError::invalidated(format!("Failed to open property store: {}", e)))?;

    let prop = store
        .GetValue(&PKEY_DEVICE_FRIENDLYNAME)
        .map_err(|e| MonitorError::invalidated(format!("Failed to get device name: {}", e)))?;

    let name = prop.to_string();
    if name.is_empty() {
        Ok("Unknown Device".to_string())
    } else {
        Ok(name)
    }
}

/// COM pointers obtained in the multithreaded apartment.
///
/// SAFETY: MMDevice API objects are free-threaded once created in the MTA,
/// and every thread that touches them calls `ensure_com` first.
struct MtaPtr<T>(T);

unsafe impl<T> Send for MtaPtr<T> {}
unsafe impl<T> Sync for MtaPtr<T> {}

impl<T> MtaPtr<T> {
    fn get(&self) -> &T {
        &self.0
    }
}

// =============================================================================
// Endpoint handle
// =============================================================================

struct WasapiHandle {
    id: String,
    device: MtaPtr<IMMDevice>,
    meter: MtaPtr<IAudioMeterInformation>,
    volume: MtaPtr<IAudioEndpointVolume>,
}

impl WasapiHandle {
    fn open(device: IMMDevice) -> MonitorResult<Self> {
        ensure_com()?;
        // SAFETY: COM is initialized; `device` is a valid endpoint from the enumerator.
        unsafe {
            let id = device_id(&device)?;
            let meter: IAudioMeterInformation = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|e| MonitorError::invalidated(format!("Failed to activate meter: {}", e)))?;
            let volume: IAudioEndpointVolume = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|e| MonitorError::invalidated(format!("Failed to activate volume: {}", e)))?;

            Ok(Self {
                id,
                device: MtaPtr(device),
                meter: MtaPtr(meter),
                volume: MtaPtr(volume),
            })
        }
    }
}

impl EndpointHandle for WasapiHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn friendly_name(&self) -> MonitorResult<String> {
        ensure_com()?;
        // SAFETY: COM is initialized on this thread.
        unsafe { device_name(self.device.get()) }
    }

    fn state(&self) -> MonitorResult<DeviceState> {
        ensure_com()?;
        // SAFETY: COM is initialized on this thread.
        unsafe { self.device.get().GetState() }
            .map(map_state)
            .map_err(|e| MonitorError::invalidated(format!("Failed to get device state: {}", e)))
    }

    fn peak_meter_value(&self) -> MonitorResult<f32> {
        ensure_com()?;
        // SAFETY: COM is initialized on this thread.
        unsafe { self.meter.get().GetPeakValue() }
            .map_err(|e| MonitorError::invalidated(format!("Failed to read peak meter: {}", e)))
    }

    fn output_volume_scalar(&self) -> MonitorResult<f32> {
        ensure_com()?;
        // SAFETY: COM is initialized on this thread.
        unsafe { self.volume.get().GetMasterVolumeLevelScalar() }
            .map_err(|e| MonitorError::invalidated(format!("Failed to read master volume: {}", e)))
    }
}

impl Drop for WasapiHandle {
    fn drop(&mut self) {
        debug!("Releasing audio endpoint {}", self.id);
    }
}

// =============================================================================
// Notification client
// =============================================================================

#[implement(IMMNotificationClient)]
struct NotificationClient {
    listener: TopologyListener,
}

impl IMMNotificationClient_Impl for NotificationClient_Impl {
    fn OnDeviceStateChanged(
        &self,
        pwstrdeviceid: &PCWSTR,
        dwnewstate: DEVICE_STATE,
    ) -> windows::core::Result<()> {
        // SAFETY: the id string is valid for the duration of the callback.
        if let Some(id) = unsafe { pcwstr_to_string(pwstrdeviceid) } {
            (self.listener)(TopologyEvent::DeviceStateChanged(id, map_state(dwnewstate)));
        }
        Ok(())
    }

    fn OnDeviceAdded(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        // SAFETY: the id string is valid for the duration of the callback.
        if let Some(id) = unsafe { pcwstr_to_string(pwstrdeviceid) } {
            (self.listener)(TopologyEvent::DeviceAdded(id));
        }
        Ok(())
    }

    fn OnDeviceRemoved(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        // SAFETY: the id string is valid for the duration of the callback.
        if let Some(id) = unsafe { pcwstr_to_string(pwstrdeviceid) } {
            (self.listener)(TopologyEvent::DeviceRemoved(id));
        }
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        flow: EDataFlow,
        role: ERole,
        pwstrdefaultdeviceid: &PCWSTR,
    ) -> windows::core::Result<()> {
        // SAFETY: the id string is valid (or null) for the duration of the callback.
        let id = unsafe { pcwstr_to_string(pwstrdefaultdeviceid) };
        (self.listener)(TopologyEvent::DefaultDeviceChanged {
            flow: map_flow(flow),
            role: map_role(role),
            id,
        });
        Ok(())
    }

    fn OnPropertyValueChanged(
        &self,
        _pwstrdeviceid: &PCWSTR,
        _key: &PROPERTYKEY,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Backend
// =============================================================================

/// MMDevice-based render endpoint backend.
#[derive(Debug)]
pub struct WasapiBackend;

impl WasapiBackend {
    /// Verifies that COM and the device enumerator are available.
    pub fn new() -> MonitorResult<Self> {
        create_enumerator()?;
        Ok(Self)
    }
}

impl AudioBackend for WasapiBackend {
    fn enumerate_active_render_endpoints(&self) -> MonitorResult<Vec<AudioEndpointDescriptor>> {
        let enumerator = create_enumerator()?;

        // SAFETY: COM is initialized by create_enumerator; all interfaces come from Windows.
        unsafe {
            let collection = enumerator
                .EnumAudioEndpoints(eRender, DEVICE_STATE_ACTIVE)
                .map_err(|e| MonitorError::enumeration(format!("Failed to enumerate endpoints: {}", e)))?;
            let count = collection
                .GetCount()
                .map_err(|e| MonitorError::enumeration(format!("Failed to count endpoints: {}", e)))?;

            let mut endpoints = Vec::with_capacity(count as usize);
            for i in 0..count {
                let device = match collection.Item(i) {
                    Ok(device) => device,
                    Err(e) => {
                        warn!("Skipping endpoint {}: {}", i, e);
                        continue;
                    }
                };
                let id = match device_id(&device) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!("Skipping endpoint {}: {}", i, e);
                        continue;
                    }
                };
                let friendly_name =
                    device_name(&device).unwrap_or_else(|_| "Unknown Device".to_string());
                let state = device
                    .GetState()
                    .map(map_state)
                    .unwrap_or(DeviceState::NotPresent);

                endpoints.push(AudioEndpointDescriptor {
                    id,
                    friendly_name,
                    state,
                });
            }
            Ok(endpoints)
        }
    }

    fn default_render_endpoint(&self) -> MonitorResult<Arc<dyn EndpointHandle>> {
        let enumerator = create_enumerator()?;
        // SAFETY: COM is initialized by create_enumerator.
        let device = unsafe { enumerator.GetDefaultAudioEndpoint(eRender, eMultimedia) }
            .map_err(|e| MonitorError::not_found(format!("No default render endpoint: {}", e)))?;
        Ok(Arc::new(WasapiHandle::open(device)?))
    }

    fn endpoint_by_id(&self, id: &str) -> MonitorResult<Arc<dyn EndpointHandle>> {
        let enumerator = create_enumerator()?;
        let wide: Vec<u16> = id.encode_utf16().chain(std::iter::once(0)).collect();

        // SAFETY: `wide` is NUL-terminated and outlives the call.
        let device = unsafe { enumerator.GetDevice(PCWSTR(wide.as_ptr())) }.map_err(|e| {
            if e.code().0 as u32 == E_NOTFOUND {
                MonitorError::not_found(id)
            } else {
                MonitorError::invalidated(format!("Failed to open {}: {}", id, e))
            }
        })?;
        Ok(Arc::new(WasapiHandle::open(device)?))
    }

    fn register_topology_listener(
        &self,
        listener: TopologyListener,
    ) -> MonitorResult<ListenerRegistration> {
        let enumerator = create_enumerator()?;
        let client: IMMNotificationClient = NotificationClient { listener }.into();

        // SAFETY: COM is initialized; the client stays alive until unregistered below.
        unsafe { enumerator.RegisterEndpointNotificationCallback(&client) }.map_err(|e| {
            MonitorError::Unknown(format!("Failed to register endpoint notifications: {}", e))
        })?;

        let enumerator = MtaPtr(enumerator);
        let client = MtaPtr(client);
        Ok(ListenerRegistration::new(move || {
            if ensure_com().is_err() {
                return;
            }
            // SAFETY: same enumerator/client pair that was registered above.
            if let Err(e) =
                unsafe { enumerator.get().UnregisterEndpointNotificationCallback(client.get()) }
            {
                warn!("Failed to unregister endpoint notifications: {}", e);
            }
        }))
    }
}
