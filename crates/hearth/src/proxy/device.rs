use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;

use hearth_ipc::MessageType;
use hearth_ipc::schema::{ActionRequest, DeviceDescription};

use crate::error::{Error, Result};
use crate::plugin::Plugin;

use super::{AdapterProxy, PropertyProxy};

/// Mirror of a device owned by an adapter
pub struct DeviceProxy {
    id: String,
    adapter_id: String,
    adapter: Weak<AdapterProxy>,
    description: RwLock<DeviceDescription>,
    properties: BTreeMap<String, Arc<PropertyProxy>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for DeviceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProxy")
            .field("id", &self.id)
            .field("adapter_id", &self.adapter_id)
            .finish_non_exhaustive()
    }
}

impl DeviceProxy {
    /// Build a device and one property proxy per described property
    pub fn new(adapter: &Arc<AdapterProxy>, description: DeviceDescription) -> Arc<Self> {
        Arc::new_cyclic(|device| {
            let properties = description
                .properties
                .iter()
                .map(|(name, property)| {
                    let proxy = PropertyProxy::new(name.clone(), property.clone(), device.clone());
                    (name.clone(), Arc::new(proxy))
                })
                .collect();
            Self {
                id: description.id.clone(),
                adapter_id: adapter.id().to_string(),
                adapter: Arc::downgrade(adapter),
                description: RwLock::new(description),
                properties,
                connected: AtomicBool::new(true),
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn adapter(&self) -> Option<Arc<AdapterProxy>> {
        self.adapter.upgrade()
    }

    pub fn title(&self) -> String {
        self.description.read().title.clone()
    }

    pub fn property(&self, name: &str) -> Option<Arc<PropertyProxy>> {
        self.properties.get(name).cloned()
    }

    pub fn properties(&self) -> impl Iterator<Item = &Arc<PropertyProxy>> {
        self.properties.values()
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.description.read().actions.contains_key(name)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Description with property values as last reported by the add-on
    pub fn description(&self) -> DeviceDescription {
        let mut description = self.description.read().clone();
        for (name, property) in &self.properties {
            description
                .properties
                .insert(name.clone(), property.description());
        }
        description
    }

    pub(crate) fn plugin(&self) -> Result<Arc<Plugin>> {
        self.adapter()
            .ok_or_else(|| Error::NotFound(format!("Adapter {}", self.adapter_id)))?
            .plugin()
    }

    pub async fn set_property(&self, name: &str, value: Value) -> Result<Value> {
        let property = self
            .property(name)
            .ok_or_else(|| Error::NotFound(format!("Property \"{}\"", name)))?;
        property.set_value(value)?.await
    }

    pub async fn request_action(&self, action_id: &str, name: &str, input: Value) -> Result<()> {
        if !self.has_action(name) {
            return Err(Error::NotFound(format!("Action \"{}\"", name)));
        }
        let payload = ActionRequest {
            adapter_id: self.adapter_id.clone(),
            device_id: self.id.clone(),
            action_name: name.to_string(),
            action_id: action_id.to_string(),
            input,
        };
        self.plugin()?
            .request(MessageType::DeviceRequestActionRequest, &payload, |t| {
                &mut t.request_action
            })?
            .await
    }

    pub async fn remove_action(&self, action_id: &str, name: &str) -> Result<()> {
        if !self.has_action(name) {
            return Err(Error::NotFound(format!("Action \"{}\"", name)));
        }
        let payload = ActionRequest {
            adapter_id: self.adapter_id.clone(),
            device_id: self.id.clone(),
            action_name: name.to_string(),
            action_id: action_id.to_string(),
            input: Value::Null,
        };
        self.plugin()?
            .request(MessageType::DeviceRemoveActionRequest, &payload, |t| {
                &mut t.remove_action
            })?
            .await
    }

    pub(crate) fn reject_pending(&self, reason: &str) {
        for property in self.properties.values() {
            property.reject_waiters(reason);
        }
    }
}
