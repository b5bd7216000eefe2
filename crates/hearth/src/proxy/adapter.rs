use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use hearth_ipc::MessageType;
use hearth_ipc::schema::{
    AdapterRef, DeviceDescription, DeviceRef, MockDevice, SetCredentials, SetPin, StartPairing,
};

use crate::deferred::{Deferred, Pending, Slot};
use crate::error::{Error, Result};
use crate::plugin::Plugin;

use super::DeviceProxy;

/// Mirror of an adapter running inside an add-on
pub struct AdapterProxy {
    id: String,
    name: RwLock<String>,
    package_name: String,
    plugin: Weak<Plugin>,
    devices: RwLock<BTreeMap<String, Arc<DeviceProxy>>>,
    unload: Slot<()>,
    /// Mock-adapter test requests, one at a time
    mock: Slot<()>,
}

impl std::fmt::Debug for AdapterProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterProxy")
            .field("id", &self.id)
            .field("package_name", &self.package_name)
            .finish_non_exhaustive()
    }
}

impl AdapterProxy {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        package_name: impl Into<String>,
        plugin: Weak<Plugin>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            name: RwLock::new(name.into()),
            package_name: package_name.into(),
            plugin,
            devices: RwLock::new(BTreeMap::new()),
            unload: Slot::new("Unload"),
            mock: Slot::new("Mock request"),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub(crate) fn plugin(&self) -> Result<Arc<Plugin>> {
        self.plugin
            .upgrade()
            .ok_or_else(|| Error::NotConnected(self.package_name.clone()))
    }

    fn send<P: Serialize>(&self, msg_type: MessageType, payload: &P) -> Result<()> {
        self.plugin()?.send_payload(msg_type, payload)
    }

    fn adapter_ref(&self) -> AdapterRef {
        AdapterRef {
            adapter_id: self.id.clone(),
        }
    }

    fn device_ref(&self, device_id: &str) -> DeviceRef {
        DeviceRef {
            adapter_id: self.id.clone(),
            device_id: device_id.to_string(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────

    pub fn device(&self, device_id: &str) -> Option<Arc<DeviceProxy>> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<DeviceProxy>> {
        self.devices.read().values().cloned().collect()
    }

    /// Store a device. A proxy it displaces fails whatever it still owes,
    /// since nothing reaches it afterwards.
    pub(crate) fn insert_device(&self, device: Arc<DeviceProxy>) {
        let previous = self
            .devices
            .write()
            .insert(device.id().to_string(), device.clone());
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &device) {
                previous.reject_pending("device replaced");
            }
        }
    }

    pub(crate) fn remove_device(&self, device_id: &str) -> Option<Arc<DeviceProxy>> {
        self.devices.write().remove(device_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pairing and removal
    // ─────────────────────────────────────────────────────────────────────

    pub fn start_pairing(&self, timeout: Duration) -> Result<()> {
        self.send(
            MessageType::AdapterStartPairingCommand,
            &StartPairing {
                adapter_id: self.id.clone(),
                timeout: timeout.as_secs(),
            },
        )
    }

    pub fn cancel_pairing(&self) -> Result<()> {
        self.send(MessageType::AdapterCancelPairingCommand, &self.adapter_ref())
    }

    /// Ask the adapter to remove a device. Completion arrives as a
    /// remove-device response naming whichever device was actually removed.
    pub fn remove_thing(&self, device_id: &str) -> Result<()> {
        self.send(
            MessageType::AdapterRemoveDeviceRequest,
            &self.device_ref(device_id),
        )
    }

    pub fn cancel_remove_thing(&self, device_id: &str) -> Result<()> {
        self.send(
            MessageType::AdapterCancelRemoveDeviceCommand,
            &self.device_ref(device_id),
        )
    }

    pub async fn set_pin(&self, device_id: &str, pin: Value) -> Result<DeviceDescription> {
        if self.device(device_id).is_none() {
            return Err(Error::NotFound("Device".to_string()));
        }
        let payload = SetPin {
            adapter_id: self.id.clone(),
            device_id: device_id.to_string(),
            pin,
        };
        self.plugin()?
            .request(MessageType::DeviceSetPinRequest, &payload, |t| {
                &mut t.set_pin
            })?
            .await
    }

    pub async fn set_credentials(
        &self,
        device_id: &str,
        username: &str,
        password: &str,
    ) -> Result<DeviceDescription> {
        if self.device(device_id).is_none() {
            return Err(Error::NotFound("Device".to_string()));
        }
        let payload = SetCredentials {
            adapter_id: self.id.clone(),
            device_id: device_id.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        };
        self.plugin()?
            .request(MessageType::DeviceSetCredentialsRequest, &payload, |t| {
                &mut t.set_credentials
            })?
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Unload
    // ─────────────────────────────────────────────────────────────────────

    /// Ask the adapter to unload. Only one unload may be in flight.
    pub fn unload(&self) -> Pending<()> {
        let pending = match self.unload.claim() {
            Ok(pending) => pending,
            Err(e) => return Pending::failed(e),
        };
        if let Err(e) = self.send(MessageType::AdapterUnloadRequest, &self.adapter_ref()) {
            if let Some(deferred) = self.unload.take() {
                deferred.reject(e);
            }
        }
        pending
    }

    pub(crate) fn take_unload(&self) -> Option<Deferred<()>> {
        self.unload.take()
    }

    /// Reject every reply still owed by this adapter or its devices
    pub(crate) fn reject_pending(&self, reason: &str) {
        self.unload.reject(reason);
        self.mock.reject(reason);
        for device in self.devices() {
            device.reject_pending(reason);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mock adapter surface
    // ─────────────────────────────────────────────────────────────────────

    fn mock_request<P: Serialize>(&self, msg_type: MessageType, payload: &P) -> Pending<()> {
        let pending = match self.mock.claim() {
            Ok(pending) => pending,
            Err(e) => return Pending::failed(e),
        };
        if let Err(e) = self.send(msg_type, payload) {
            if let Some(deferred) = self.mock.take() {
                deferred.reject(e);
            }
        }
        pending
    }

    pub(crate) fn take_mock(&self) -> Option<Deferred<()>> {
        self.mock.take()
    }

    pub async fn mock_clear_state(&self) -> Result<()> {
        self.mock_request(MessageType::MockAdapterClearStateRequest, &self.adapter_ref())
            .await
    }

    pub async fn mock_add_device(&self, description: DeviceDescription) -> Result<()> {
        let payload = MockDevice {
            adapter_id: self.id.clone(),
            device_id: description.id.clone(),
            device_description: description,
        };
        self.mock_request(MessageType::MockAdapterAddDeviceRequest, &payload)
            .await
    }

    pub async fn mock_remove_device(&self, device_id: &str) -> Result<()> {
        self.mock_request(
            MessageType::MockAdapterRemoveDeviceRequest,
            &self.device_ref(device_id),
        )
        .await
    }

    /// Stage a device the mock adapter reports during the next pairing
    pub fn mock_pair_device(&self, description: DeviceDescription) -> Result<()> {
        let payload = MockDevice {
            adapter_id: self.id.clone(),
            device_id: description.id.clone(),
            device_description: description,
        };
        self.send(MessageType::MockAdapterPairDeviceCommand, &payload)
    }

    pub fn mock_unpair_device(&self, device_id: &str) -> Result<()> {
        self.send(
            MessageType::MockAdapterUnpairDeviceCommand,
            &self.device_ref(device_id),
        )
    }
}
