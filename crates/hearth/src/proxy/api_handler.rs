use std::sync::{Arc, Weak};

use serde_json::Value;

use hearth_ipc::MessageType;
use hearth_ipc::schema::{ApiHandlerRef, ApiRequest};

use crate::deferred::{Deferred, Pending, Slot};
use crate::error::{Error, Result};
use crate::plugin::Plugin;

/// Mirror of an add-on's HTTP API handler. One per package.
pub struct ApiHandlerProxy {
    package_name: String,
    plugin: Weak<Plugin>,
    unload: Slot<()>,
}

impl std::fmt::Debug for ApiHandlerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiHandlerProxy")
            .field("package_name", &self.package_name)
            .finish_non_exhaustive()
    }
}

impl ApiHandlerProxy {
    pub fn new(package_name: impl Into<String>, plugin: Weak<Plugin>) -> Arc<Self> {
        Arc::new(Self {
            package_name: package_name.into(),
            plugin,
            unload: Slot::new("Unload"),
        })
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    fn plugin(&self) -> Result<Arc<Plugin>> {
        self.plugin
            .upgrade()
            .ok_or_else(|| Error::NotConnected(self.package_name.clone()))
    }

    /// Forward a request object and wait for the add-on's response object
    pub async fn handle_request(&self, request: Value) -> Result<Value> {
        let payload = ApiRequest {
            package_name: self.package_name.clone(),
            request,
        };
        self.plugin()?
            .request(MessageType::ApiHandlerApiRequest, &payload, |t| {
                &mut t.api_request
            })?
            .await
    }

    pub fn unload(&self) -> Pending<()> {
        let pending = match self.unload.claim() {
            Ok(pending) => pending,
            Err(e) => return Pending::failed(e),
        };
        let payload = ApiHandlerRef {
            package_name: self.package_name.clone(),
        };
        let sent = self
            .plugin()
            .and_then(|plugin| plugin.send_payload(MessageType::ApiHandlerUnloadRequest, &payload));
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
