//! Reference add-on
//!
//! A small add-on process speaking the hub protocol. It registers, announces
//! one mock adapter and then answers everything the hub sends that adapter:
//! pairing, removal, property sets, actions, PIN and credential updates, and
//! the mock-adapter test surface used to script devices from the hub side.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use hearth_ipc::schema::{
    ActionRequest, AdapterAdded, AdapterRef, DeviceAdded, DeviceDescription, DeviceRef,
    DeviceUpdateResponse, MockDevice, PropertyChanged, RegisterResponse, ResponseStatus,
    SetCredentials, SetPin, SetProperty,
};
use hearth_ipc::{IpcSender, IpcSocket, Message, MessageType};

#[derive(Debug, Clone)]
pub struct MockAddonConfig {
    /// Hub IPC address
    pub hub: SocketAddr,
    pub plugin_id: String,
    pub adapter_id: String,
    /// Adapter display name
    pub name: String,
}

impl MockAddonConfig {
    pub fn new(hub: SocketAddr, plugin_id: impl Into<String>) -> Self {
        Self {
            hub,
            plugin_id: plugin_id.into(),
            adapter_id: "mock-adapter".to_string(),
            name: "Mock Adapter".to_string(),
        }
    }
}

/// Connect to the hub and serve until it asks the add-on to unload or the
/// connection closes.
pub async fn run(config: MockAddonConfig) -> Result<()> {
    let mut socket = IpcSocket::new();
    let connection = socket
        .connect(config.hub)
        .await
        .with_context(|| format!("Failed to connect to hub at {}", config.hub))?;
    let (sender, mut receiver) = connection.split();

    let mut adapter = MockAdapter::new(config, sender);
    adapter.send(Message::new(
        MessageType::PluginRegisterRequest,
        adapter.config.plugin_id.clone(),
        json!({}),
    ))?;

    while let Some(msg) = receiver.recv().await? {
        if adapter.handle(msg)? == Flow::Stop {
            info!("Mock add-on {} unloaded", adapter.config.plugin_id);
            return Ok(());
        }
    }
    info!("Hub closed the connection");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct MockAdapter {
    config: MockAddonConfig,
    sender: IpcSender,
    devices: BTreeMap<String, DeviceDescription>,
    /// Reported on the next pairing round
    pair_device: Option<DeviceDescription>,
    /// Reported instead of the requested device on the next removal
    unpair_device: Option<String>,
}

impl MockAdapter {
    fn new(config: MockAddonConfig, sender: IpcSender) -> Self {
        Self {
            config,
            sender,
            devices: BTreeMap::new(),
            pair_device: None,
            unpair_device: None,
        }
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.sender.send(msg)?;
        Ok(())
    }

    fn notify<P: serde::Serialize>(&self, msg_type: MessageType, payload: &P) -> Result<()> {
        self.send(Message::with_payload(msg_type, self.config.plugin_id.clone(), payload)?)
    }

    /// Answer a request with a `{success, error}` status plus routing fields
    fn reply_status(
        &self,
        request: &Message,
        msg_type: MessageType,
        status: ResponseStatus,
        device_id: Option<&str>,
    ) -> Result<()> {
        let mut data = match serde_json::to_value(status)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        data.insert("adapterId".to_string(), json!(self.config.adapter_id));
        if let Some(device_id) = device_id {
            data.insert("deviceId".to_string(), json!(device_id));
        }
        self.send(request.reply(msg_type, Value::Object(data)))
    }

    fn add_device(&mut self, device: DeviceDescription) -> Result<()> {
        self.devices.insert(device.id.clone(), device.clone());
        self.notify(
            MessageType::DeviceAddedNotification,
            &DeviceAdded {
                adapter_id: self.config.adapter_id.clone(),
                device,
            },
        )
    }

    fn remove_device(&mut self, device_id: &str) -> Result<()> {
        self.devices.remove(device_id);
        self.notify(
            MessageType::AdapterRemoveDeviceResponse,
            &DeviceRef {
                adapter_id: self.config.adapter_id.clone(),
                device_id: device_id.to_string(),
            },
        )
    }

    fn handle(&mut self, msg: Message) -> Result<Flow> {
        use MessageType::*;

        match msg.msg_type {
            PluginRegisterResponse => {
                let registered: RegisterResponse = msg.parse_data()?;
                info!(
                    "Registered with hub {} as {}",
                    registered.gateway_version, registered.plugin_id
                );
                self.notify(
                    AdapterAddedNotification,
                    &AdapterAdded {
                        adapter_id: self.config.adapter_id.clone(),
                        name: self.config.name.clone(),
                        package_name: self.config.plugin_id.clone(),
                    },
                )?;
            }
            PluginUnloadRequest => {
                self.send(msg.reply(PluginUnloadResponse, json!({})))?;
                return Ok(Flow::Stop);
            }
            AdapterUnloadRequest => {
                let unload: AdapterRef = msg.parse_data()?;
                self.notify(AdapterUnloadResponse, &unload)?;
            }
            AdapterStartPairingCommand => match self.pair_device.take() {
                Some(device) => self.add_device(device)?,
                None => debug!("Pairing started with nothing to pair"),
            },
            AdapterCancelPairingCommand => debug!("Pairing cancelled"),
            AdapterRemoveDeviceRequest => {
                let request: DeviceRef = msg.parse_data()?;
                let device_id = self.unpair_device.take().unwrap_or(request.device_id);
                self.remove_device(&device_id)?;
            }
            AdapterCancelRemoveDeviceCommand => debug!("Removal cancelled"),
            DeviceSavedNotification => {
                let saved: DeviceRef = msg.parse_data()?;
                debug!("Hub knows device {}", saved.device_id);
            }
            DeviceSetPropertyCommand => self.set_property(msg.parse_data()?)?,
            DeviceRequestActionRequest => {
                let request: ActionRequest = msg.parse_data()?;
                let known = self
                    .devices
                    .get(&request.device_id)
                    .is_some_and(|d| d.actions.contains_key(&request.action_name));
                if !known {
                    let status = ResponseStatus::failed(format!(
                        "Unknown action {}",
                        request.action_name
                    ));
                    return self
                        .reply_status(&msg, DeviceRequestActionResponse, status, Some(&request.device_id))
                        .map(|_| Flow::Continue);
                }
                self.reply_status(
                    &msg,
                    DeviceRequestActionResponse,
                    ResponseStatus::ok(),
                    Some(&request.device_id),
                )?;
                self.send(Message::new(
                    DeviceActionStatusNotification,
                    self.config.plugin_id.clone(),
                    json!({
                        "adapterId": self.config.adapter_id,
                        "deviceId": request.device_id,
                        "action": {
                            "id": request.action_id,
                            "name": request.action_name,
                            "input": request.input,
                            "status": "completed",
                        },
                    }),
                ))?;
            }
            DeviceRemoveActionRequest => {
                let request: ActionRequest = msg.parse_data()?;
                self.reply_status(
                    &msg,
                    DeviceRemoveActionResponse,
                    ResponseStatus::ok(),
                    Some(&request.device_id),
                )?;
            }
            DeviceSetPinRequest => {
                let request: SetPin = msg.parse_data()?;
                let valid = match &request.pin {
                    Value::String(pin) => !pin.is_empty(),
                    Value::Number(_) => true,
                    _ => false,
                };
                let reply = self.update_device(&request.device_id, valid, "Invalid PIN", |d| {
                    d.pin.required = false;
                });
                self.send(msg.reply(DeviceSetPinResponse, serde_json::to_value(reply)?))?;
            }
            DeviceSetCredentialsRequest => {
                let request: SetCredentials = msg.parse_data()?;
                let valid = !request.username.is_empty() && !request.password.is_empty();
                let reply =
                    self.update_device(&request.device_id, valid, "Invalid credentials", |d| {
                        d.credentials_required = false;
                    });
                self.send(msg.reply(DeviceSetCredentialsResponse, serde_json::to_value(reply)?))?;
            }
            MockAdapterClearStateRequest => {
                let ids: Vec<String> = self.devices.keys().cloned().collect();
                for id in ids {
                    self.remove_device(&id)?;
                }
                self.reply_status(&msg, MockAdapterClearStateResponse, ResponseStatus::ok(), None)?;
            }
            MockAdapterAddDeviceRequest => {
                let request: MockDevice = msg.parse_data()?;
                if self.devices.contains_key(&request.device_id) {
                    let status =
                        ResponseStatus::failed(format!("Device: {} already exists.", request.device_id));
                    self.reply_status(&msg, MockAdapterAddDeviceResponse, status, Some(&request.device_id))?;
                } else {
                    let mut device = request.device_description;
                    device.id = request.device_id.clone();
                    self.add_device(device)?;
                    self.reply_status(
                        &msg,
                        MockAdapterAddDeviceResponse,
                        ResponseStatus::ok(),
                        Some(&request.device_id),
                    )?;
                }
            }
            MockAdapterRemoveDeviceRequest => {
                let request: DeviceRef = msg.parse_data()?;
                if self.devices.contains_key(&request.device_id) {
                    self.remove_device(&request.device_id)?;
                    self.reply_status(
                        &msg,
                        MockAdapterRemoveDeviceResponse,
                        ResponseStatus::ok(),
                        Some(&request.device_id),
                    )?;
                } else {
                    let status =
                        ResponseStatus::failed(format!("Device: {} not found.", request.device_id));
                    self.reply_status(&msg, MockAdapterRemoveDeviceResponse, status, Some(&request.device_id))?;
                }
            }
            MockAdapterPairDeviceCommand => {
                let request: MockDevice = msg.parse_data()?;
                let mut device = request.device_description;
                device.id = request.device_id;
                self.pair_device = Some(device);
            }
            MockAdapterUnpairDeviceCommand => {
                let request: DeviceRef = msg.parse_data()?;
                self.unpair_device = Some(request.device_id);
            }
            other => warn!("Mock add-on ignoring {:?}", other),
        }
        Ok(Flow::Continue)
    }

    /// Apply a property write, clamped to the declared range, and echo the
    /// resulting value
    fn set_property(&mut self, request: SetProperty) -> Result<()> {
        let Some(device) = self.devices.get_mut(&request.device_id) else {
            bail!("Unknown device {}", request.device_id);
        };
        let Some(property) = device.properties.get_mut(&request.property_name) else {
            bail!(
                "Device {} has no property {}",
                request.device_id,
                request.property_name
            );
        };

        let mut value = request.property_value;
        if let Some(number) = value.as_f64() {
            let mut clamped = number;
            if let Some(min) = property.minimum {
                clamped = clamped.max(min);
            }
            if let Some(max) = property.maximum {
                clamped = clamped.min(max);
            }
            value = if property.kind.as_deref() == Some("integer") {
                json!(clamped.round() as i64)
            } else {
                json!(clamped)
            };
        }
        property.value = value;

        let mut echoed = property.clone();
        echoed.name = Some(request.property_name);
        self.notify(
            MessageType::DevicePropertyChangedNotification,
            &PropertyChanged {
                adapter_id: self.config.adapter_id.clone(),
                device_id: request.device_id,
                property: echoed,
            },
        )
    }

    fn update_device(
        &mut self,
        device_id: &str,
        valid: bool,
        reason: &str,
        apply: impl FnOnce(&mut DeviceDescription),
    ) -> DeviceUpdateResponse {
        let adapter_id = self.config.adapter_id.clone();
        let failed = |error: String| DeviceUpdateResponse {
            adapter_id: adapter_id.clone(),
            device_id: device_id.to_string(),
            success: false,
            device: None,
            error: Some(error),
        };
        let Some(device) = self.devices.get_mut(device_id) else {
            return failed(format!("Device: {} not found.", device_id));
        };
        if !valid {
            return failed(reason.to_string());
        }
        apply(device);
        DeviceUpdateResponse {
            adapter_id: adapter_id.clone(),
            device_id: device_id.to_string(),
            success: true,
            device: Some(device.clone()),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_ipc::schema::PropertyDescription;

    async fn adapter_with_peer() -> (MockAdapter, hearth_ipc::IpcReceiver) {
        let mut server = IpcSocket::new();
        let listener = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = IpcSocket::new();
        let (accepted, connected) = tokio::join!(listener.accept(), client.connect(addr));
        let (_, hub_rx) = accepted.unwrap().split();
        let (sender, _) = connected.unwrap().split();
        let adapter = MockAdapter::new(MockAddonConfig::new(addr, "mock"), sender);
        (adapter, hub_rx)
    }

    fn dimmer() -> DeviceDescription {
        DeviceDescription::new("dimmer", "Dimmer").with_property(
            "level",
            PropertyDescription {
                kind: Some("integer".to_string()),
                minimum: Some(0.0),
                maximum: Some(100.0),
                value: json!(0),
                ..PropertyDescription::default()
            },
        )
    }

    #[tokio::test]
    async fn test_set_property_clamps_and_echoes() {
        let (mut adapter, mut hub_rx) = adapter_with_peer().await;
        adapter.add_device(dimmer()).unwrap();
        let added = hub_rx.recv().await.unwrap().unwrap();
        assert_eq!(added.msg_type, MessageType::DeviceAddedNotification);

        adapter
            .set_property(SetProperty {
                adapter_id: "mock-adapter".to_string(),
                device_id: "dimmer".to_string(),
                property_name: "level".to_string(),
                property_value: json!(150.4),
            })
            .unwrap();
        let changed = hub_rx.recv().await.unwrap().unwrap();
        let changed: PropertyChanged = changed.parse_data().unwrap();
        assert_eq!(changed.property.value, json!(100));
        assert_eq!(changed.property.name.as_deref(), Some("level"));
    }

    #[tokio::test]
    async fn test_unpair_override_reports_other_device() {
        let (mut adapter, mut hub_rx) = adapter_with_peer().await;
        adapter.unpair_device = Some("other".to_string());
        let request = Message::with_payload(
            MessageType::AdapterRemoveDeviceRequest,
            "mock",
            &DeviceRef {
                adapter_id: "mock-adapter".to_string(),
                device_id: "dimmer".to_string(),
            },
        )
        .unwrap();
        assert_eq!(adapter.handle(request).unwrap(), Flow::Continue);

        let removed: DeviceRef = hub_rx.recv().await.unwrap().unwrap().parse_data().unwrap();
        assert_eq!(removed.device_id, "other");
    }
}
