use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use hearth_ipc::MessageType;
use hearth_ipc::schema::{NotifierRef, OutletDescription, OutletNotify};

use crate::deferred::{Deferred, Pending, Slot};
use crate::error::{Error, Result};
use crate::plugin::Plugin;

/// Mirror of a notifier running inside an add-on
pub struct NotifierProxy {
    id: String,
    name: String,
    package_name: String,
    plugin: Weak<Plugin>,
    outlets: RwLock<BTreeMap<String, Arc<OutletProxy>>>,
    unload: Slot<()>,
}

impl std::fmt::Debug for NotifierProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierProxy")
            .field("id", &self.id)
            .field("package_name", &self.package_name)
            .finish_non_exhaustive()
    }
}

impl NotifierProxy {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        package_name: impl Into<String>,
        plugin: Weak<Plugin>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            name: name.into(),
            package_name: package_name.into(),
            plugin,
            outlets: RwLock::new(BTreeMap::new()),
            unload: Slot::new("Unload"),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    fn plugin(&self) -> Result<Arc<Plugin>> {
        self.plugin
            .upgrade()
            .ok_or_else(|| Error::NotConnected(self.package_name.clone()))
    }

    pub fn outlet(&self, outlet_id: &str) -> Option<Arc<OutletProxy>> {
        self.outlets.read().get(outlet_id).cloned()
    }

    pub fn outlets(&self) -> Vec<Arc<OutletProxy>> {
        self.outlets.read().values().cloned().collect()
    }

    pub(crate) fn add_outlet(self: &Arc<Self>, description: OutletDescription) -> Arc<OutletProxy> {
        let outlet = Arc::new(OutletProxy {
            id: description.id,
            name: description.name,
            notifier_id: self.id.clone(),
            notifier: Arc::downgrade(self),
        });
        self.outlets
            .write()
            .insert(outlet.id.clone(), outlet.clone());
        outlet
    }

    pub(crate) fn remove_outlet(&self, outlet_id: &str) -> Option<Arc<OutletProxy>> {
        self.outlets.write().remove(outlet_id)
    }

    pub fn unload(&self) -> Pending<()> {
        let pending = match self.unload.claim() {
            Ok(pending) => pending,
            Err(e) => return Pending::failed(e),
        };
        let payload = NotifierRef {
            notifier_id: self.id.clone(),
        };
        let sent = self
            .plugin()
            .and_then(|plugin| plugin.send_payload(MessageType::NotifierUnloadRequest, &payload));
        if let Err(e) = sent {
            if let Some(deferred) = self.unload.take() {
                deferred.reject(e);
            }
        }
        pending
    }

    pub(crate) fn take_unload(&self) -> Option<Deferred<()>> {
        self.unload.take()
    }

    pub(crate) fn reject_pending(&self, reason: &str) {
        self.unload.reject(reason);
    }
}

/// A notification destination exposed by a notifier
#[derive(Debug)]
pub struct OutletProxy {
    id: String,
    name: String,
    notifier_id: String,
    notifier: Weak<NotifierProxy>,
}

impl OutletProxy {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn notifier_id(&self) -> &str {
        &self.notifier_id
    }

    /// Deliver a notification. `level` is 0 (low), 1 (normal) or 2 (high).
    pub async fn notify(&self, title: &str, message: &str, level: u8) -> Result<()> {
        let notifier = self
            .notifier
            .upgrade()
            .ok_or_else(|| Error::NotFound(format!("Notifier {}", self.notifier_id)))?;
        let payload = OutletNotify {
            notifier_id: self.notifier_id.clone(),
            outlet_id: self.id.clone(),
            title: title.to_string(),
            message: message.to_string(),
            level,
        };
        notifier
            .plugin()?
            .request(MessageType::OutletNotifyRequest, &payload, |t| &mut t.notify)?
            .await
    }
}
