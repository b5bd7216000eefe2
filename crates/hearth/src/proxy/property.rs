use std::sync::Weak;

use parking_lot::Mutex;
use serde_json::Value;

use hearth_ipc::MessageType;
use hearth_ipc::schema::{PropertyDescription, SetProperty};

use crate::deferred::{self, Deferred, Pending};
use crate::error::{Error, Result};

use super::DeviceProxy;

/// Mirror of one device property.
///
/// Caches the last value the add-on reported. A set only completes when the
/// add-on echoes a change, and every waiter then sees the echoed value,
/// which may differ from what was requested.
pub struct PropertyProxy {
    name: String,
    device: Weak<DeviceProxy>,
    state: Mutex<PropertyState>,
}

struct PropertyState {
    description: PropertyDescription,
    waiters: Vec<(u64, Deferred<Value>)>,
    next_waiter: u64,
}

impl std::fmt::Debug for PropertyProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyProxy")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PropertyProxy {
    pub(crate) fn new(
        name: String,
        mut description: PropertyDescription,
        device: Weak<DeviceProxy>,
    ) -> Self {
        description.name = Some(name.clone());
        Self {
            name,
            device,
            state: Mutex::new(PropertyState {
                description,
                waiters: Vec::new(),
                next_waiter: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Value {
        self.state.lock().description.value.clone()
    }

    pub fn description(&self) -> PropertyDescription {
        self.state.lock().description.clone()
    }

    /// Apply a change reported by the add-on and release every waiting set.
    /// Metadata absent from the update is left as it was.
    pub(crate) fn do_property_changed(&self, update: PropertyDescription) -> Value {
        let (value, waiters) = {
            let mut state = self.state.lock();
            let current = &mut state.description;
            current.value = update.value;
            if update.title.is_some() {
                current.title = update.title;
            }
            if update.kind.is_some() {
                current.kind = update.kind;
            }
            if update.unit.is_some() {
                current.unit = update.unit;
            }
            if update.minimum.is_some() {
                current.minimum = update.minimum;
            }
            if update.maximum.is_some() {
                current.maximum = update.maximum;
            }
            if update.enumeration.is_some() {
                current.enumeration = update.enumeration;
            }
            if update.read_only.is_some() {
                current.read_only = update.read_only;
            }
            if !update.links.is_empty() {
                current.links = update.links;
            }
            current.extra.extend(update.extra);
            let value = current.value.clone();
            (value, std::mem::take(&mut state.waiters))
        };
        for (_, waiter) in waiters {
            waiter.resolve(value.clone());
        }
        value
    }

    /// Send a set command. The returned future resolves with the value the
    /// add-on reports back.
    pub fn set_value(&self, value: Value) -> Result<Pending<Value>> {
        let device = self
            .device
            .upgrade()
            .ok_or_else(|| Error::NotFound(format!("Property \"{}\"", self.name)))?;
        let plugin = device.plugin()?;

        let (deferred, pending) = deferred::channel();
        let waiter = {
            let mut state = self.state.lock();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push((id, deferred));
            id
        };

        let payload = SetProperty {
            adapter_id: device.adapter_id().to_string(),
            device_id: device.id().to_string(),
            property_name: self.name.clone(),
            property_value: value,
        };
        if let Err(e) = plugin.send_payload(MessageType::DeviceSetPropertyCommand, &payload) {
            self.state.lock().waiters.retain(|(id, _)| *id != waiter);
            return Err(e);
        }
        Ok(pending)
    }

    pub(crate) fn reject_waiters(&self, reason: &str) {
        let waiters = std::mem::take(&mut self.state.lock().waiters);
        for (_, waiter) in waiters {
            waiter.reject(Error::Abandoned(reason.to_string()));
        }
    }
}
