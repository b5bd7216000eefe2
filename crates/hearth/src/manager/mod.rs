//! Add-on manager
//!
//! The facade the rest of the hub talks to. It owns the adapter, device,
//! notifier and API-handler collections, the hub-wide pairing and removal
//! slots, and the add-on install/load lifecycle (see `lifecycle`).

mod lifecycle;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hearth_ipc::schema::DeviceDescription;

use crate::addon::{HttpFetcher, PackageFetcher};
use crate::config::HubConfig;
use crate::deferred::{self, Deferred, Pending};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind, HubEvent};
use crate::plugin::{PluginHost, PluginServer};
use crate::proxy::{AdapterProxy, ApiHandlerProxy, DeviceProxy, NotifierProxy};
use crate::settings::SettingsStore;
use crate::user_profile::UserProfile;

struct PairingSlot {
    generation: u64,
    deferred: Deferred<Arc<DeviceProxy>>,
    timer: JoinHandle<()>,
}

struct RemovalSlot {
    generation: u64,
    adapter_id: String,
    thing_id: String,
    deferred: Deferred<String>,
    timer: JoinHandle<()>,
}

pub struct AddonManager {
    weak_self: Weak<AddonManager>,
    config: HubConfig,
    profile: UserProfile,
    settings: Arc<dyn SettingsStore>,
    events: EventBus,
    fetcher: Arc<dyn PackageFetcher>,
    server: RwLock<Option<PluginServer>>,

    adapters: DashMap<String, Arc<AdapterProxy>>,
    devices: DashMap<String, Arc<DeviceProxy>>,
    notifiers: DashMap<String, Arc<NotifierProxy>>,
    api_handlers: DashMap<String, Arc<ApiHandlerProxy>>,
    /// Package ids in load order
    installed: RwLock<Vec<String>>,
    saved_things: RwLock<Vec<String>>,
    adapter_waiters: Mutex<HashMap<String, Vec<Deferred<Arc<AdapterProxy>>>>>,

    // Lock order: pairing before removal.
    pairing: Mutex<Option<PairingSlot>>,
    removal: Mutex<Option<RemovalSlot>>,
    next_generation: AtomicU64,

    /// Teardowns scheduled by unloads that did not wait, by package
    kill_tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for AddonManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonManager")
            .field("adapters", &self.adapters.len())
            .field("devices", &self.devices.len())
            .field("installed", &*self.installed.read())
            .finish_non_exhaustive()
    }
}

impl AddonManager {
    pub fn new(config: HubConfig, settings: Arc<dyn SettingsStore>) -> Arc<Self> {
        Self::with_fetcher(config, settings, Arc::new(HttpFetcher::default()))
    }

    /// Construct with a custom package source
    pub fn with_fetcher(
        config: HubConfig,
        settings: Arc<dyn SettingsStore>,
        fetcher: Arc<dyn PackageFetcher>,
    ) -> Arc<Self> {
        let profile = config.profile();
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config,
            profile,
            settings,
            events: EventBus::default(),
            fetcher,
            server: RwLock::new(None),
            adapters: DashMap::new(),
            devices: DashMap::new(),
            notifiers: DashMap::new(),
            api_handlers: DashMap::new(),
            installed: RwLock::new(Vec::new()),
            saved_things: RwLock::new(Vec::new()),
            adapter_waiters: Mutex::new(HashMap::new()),
            pairing: Mutex::new(None),
            removal: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            kill_tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Bind the plugin server. Returns the address add-ons connect to.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let host: Weak<dyn PluginHost> = Arc::downgrade(self) as Weak<dyn PluginHost>;
        let server = PluginServer::bind(&self.config, host, self.settings.clone()).await?;
        let addr = server.local_addr();
        *self.server.write() = Some(server);
        Ok(addr)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    pub fn server(&self) -> Option<PluginServer> {
        self.server.read().clone()
    }

    fn require_server(&self) -> Result<PluginServer> {
        self.server()
            .ok_or_else(|| Error::Config("plugin server not started".to_string()))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server().map(|s| s.local_addr())
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn installed_addons(&self) -> Vec<String> {
        self.installed.read().clone()
    }

    /// Thing ids announced to every adapter as it is added
    pub fn set_saved_things(&self, thing_ids: Vec<String>) {
        *self.saved_things.write() = thing_ids;
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Collections
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_adapters(&self) -> Vec<Arc<AdapterProxy>> {
        let mut adapters: Vec<_> = self.adapters.iter().map(|a| a.value().clone()).collect();
        adapters.sort_by(|a, b| a.id().cmp(b.id()));
        adapters
    }

    pub fn get_adapter(&self, adapter_id: &str) -> Option<Arc<AdapterProxy>> {
        self.adapters.get(adapter_id).map(|a| a.clone())
    }

    pub fn get_adapters_by_package(&self, package: &str) -> Vec<Arc<AdapterProxy>> {
        self.get_adapters()
            .into_iter()
            .filter(|a| a.package_name() == package)
            .collect()
    }

    pub fn get_things(&self) -> Vec<Arc<DeviceProxy>> {
        let mut things: Vec<_> = self.devices.iter().map(|d| d.value().clone()).collect();
        things.sort_by(|a, b| a.id().cmp(b.id()));
        things
    }

    pub fn get_device(&self, thing_id: &str) -> Option<Arc<DeviceProxy>> {
        self.devices.get(thing_id).map(|d| d.clone())
    }

    fn device_or_not_found(&self, thing_id: &str) -> Result<Arc<DeviceProxy>> {
        self.get_device(thing_id)
            .ok_or_else(|| Error::NotFound("Device".to_string()))
    }

    pub fn get_notifiers(&self) -> Vec<Arc<NotifierProxy>> {
        self.notifiers.iter().map(|n| n.value().clone()).collect()
    }

    pub fn get_notifier(&self, notifier_id: &str) -> Option<Arc<NotifierProxy>> {
        self.notifiers.get(notifier_id).map(|n| n.clone())
    }

    pub fn get_api_handler(&self, package: &str) -> Option<Arc<ApiHandlerProxy>> {
        self.api_handlers.get(package).map(|h| h.clone())
    }

    /// Resolves once an adapter with this id has been added
    pub fn wait_for_adapter(&self, adapter_id: &str) -> Pending<Arc<AdapterProxy>> {
        let (deferred, pending) = deferred::channel();
        let mut waiters = self.adapter_waiters.lock();
        // Checked under the waiters lock so a concurrent add cannot slip between.
        match self.get_adapter(adapter_id) {
            Some(adapter) => deferred.resolve(adapter),
            None => waiters
                .entry(adapter_id.to_string())
                .or_default()
                .push(deferred),
        }
        pending
    }

    // ─────────────────────────────────────────────────────────────────────
    // Things
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_property(&self, thing_id: &str, name: &str) -> Result<Value> {
        let device = self.device_or_not_found(thing_id)?;
        device
            .property(name)
            .map(|p| p.value())
            .ok_or_else(|| Error::NotFound(format!("Property \"{}\"", name)))
    }

    /// Set a property and wait for the add-on to report the resulting value
    pub async fn set_property(&self, thing_id: &str, name: &str, value: Value) -> Result<Value> {
        self.device_or_not_found(thing_id)?
            .set_property(name, value)
            .await
    }

    pub async fn request_action(
        &self,
        thing_id: &str,
        action_id: &str,
        name: &str,
        input: Value,
    ) -> Result<()> {
        self.device_or_not_found(thing_id)?
            .request_action(action_id, name, input)
            .await
    }

    /// Request an action under a freshly generated id and return that id
    pub async fn start_action(&self, thing_id: &str, name: &str, input: Value) -> Result<String> {
        let action_id = uuid::Uuid::new_v4().to_string();
        self.request_action(thing_id, &action_id, name, input).await?;
        Ok(action_id)
    }

    pub async fn remove_action(&self, thing_id: &str, action_id: &str, name: &str) -> Result<()> {
        self.device_or_not_found(thing_id)?
            .remove_action(action_id, name)
            .await
    }

    pub async fn set_pin(&self, thing_id: &str, pin: Value) -> Result<DeviceDescription> {
        let device = self.device_or_not_found(thing_id)?;
        let adapter = device
            .adapter()
            .ok_or_else(|| Error::NotFound("Adapter".to_string()))?;
        adapter.set_pin(thing_id, pin).await
    }

    pub async fn set_credentials(
        &self,
        thing_id: &str,
        username: &str,
        password: &str,
    ) -> Result<DeviceDescription> {
        let device = self.device_or_not_found(thing_id)?;
        let adapter = device
            .adapter()
            .ok_or_else(|| Error::NotFound("Adapter".to_string()))?;
        adapter.set_credentials(thing_id, username, password).await
    }

    pub async fn notify(
        &self,
        notifier_id: &str,
        outlet_id: &str,
        title: &str,
        message: &str,
        level: u8,
    ) -> Result<()> {
        let notifier = self
            .get_notifier(notifier_id)
            .ok_or_else(|| Error::NotFound("Notifier".to_string()))?;
        let outlet = notifier
            .outlet(outlet_id)
            .ok_or_else(|| Error::NotFound("Outlet".to_string()))?;
        outlet.notify(title, message, level).await
    }

    pub async fn handle_api_request(&self, package: &str, request: Value) -> Result<Value> {
        let handler = self
            .get_api_handler(package)
            .ok_or_else(|| Error::NotFound("API handler".to_string()))?;
        handler.handle_request(request).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pairing
    // ─────────────────────────────────────────────────────────────────────

    /// Put every adapter into pairing mode. Resolves with the first device
    /// any adapter reports; rejects on timeout or cancellation.
    pub fn add_new_thing(&self, timeout_secs: u64) -> Result<Pending<Arc<DeviceProxy>>> {
        let timeout = Duration::from_secs(timeout_secs);
        let pending = {
            let mut pairing = self.pairing.lock();
            if pairing.is_some() {
                return Err(Error::AddInProgress);
            }
            if self.removal.lock().is_some() {
                return Err(Error::RemoveInProgress);
            }

            let (deferred, pending) = deferred::channel();
            let generation = self.next_generation();
            let weak = self.weak_self.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(manager) = weak.upgrade() {
                    manager.pairing_timed_out(generation);
                }
            });
            *pairing = Some(PairingSlot {
                generation,
                deferred,
                timer,
            });
            pending
        };

        info!("Pairing started ({}s)", timeout_secs);
        for adapter in self.get_adapters() {
            if let Err(e) = adapter.start_pairing(timeout) {
                warn!("Adapter {} failed to start pairing: {}", adapter.id(), e);
            }
        }
        Ok(pending)
    }

    pub fn cancel_add_new_thing(&self) {
        let slot = self.pairing.lock().take();
        for adapter in self.get_adapters() {
            if let Err(e) = adapter.cancel_pairing() {
                debug!("Adapter {} failed to cancel pairing: {}", adapter.id(), e);
            }
        }
        if let Some(slot) = slot {
            slot.timer.abort();
            slot.deferred
                .reject(Error::Cancelled("addNewThing".to_string()));
        }
    }

    fn pairing_timed_out(&self, generation: u64) {
        let slot = {
            let mut pairing = self.pairing.lock();
            match pairing.as_ref() {
                Some(slot) if slot.generation == generation => pairing.take(),
                _ => None,
            }
        };
        let Some(slot) = slot else {
            return;
        };
        info!("Pairing timed out");
        for adapter in self.get_adapters() {
            if let Err(e) = adapter.cancel_pairing() {
                debug!("Adapter {} failed to cancel pairing: {}", adapter.id(), e);
            }
        }
        self.events.publish(EventKind::PairingTimeout);
        slot.deferred
            .reject(Error::Timeout("addNewThing".to_string()));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────

    /// Ask the owning adapter to remove a thing. Resolves with the id of the
    /// device that adapter actually removed.
    pub fn remove_thing(&self, thing_id: &str) -> Result<Pending<String>> {
        let (pending, adapter, generation) = {
            let pairing = self.pairing.lock();
            if pairing.is_some() {
                return Err(Error::AddInProgress);
            }
            let mut removal = self.removal.lock();
            if removal.is_some() {
                return Err(Error::RemoveInProgress);
            }

            let device = self.device_or_not_found(thing_id)?;
            let adapter = device
                .adapter()
                .ok_or_else(|| Error::NotFound("Adapter".to_string()))?;

            let (deferred, pending) = deferred::channel();
            let generation = self.next_generation();
            let weak = self.weak_self.clone();
            let timeout = self.config.removal_timeout();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(manager) = weak.upgrade() {
                    manager.removal_timed_out(generation);
                }
            });
            *removal = Some(RemovalSlot {
                generation,
                adapter_id: adapter.id().to_string(),
                thing_id: thing_id.to_string(),
                deferred,
                timer,
            });
            (pending, adapter, generation)
        };

        if let Err(e) = adapter.remove_thing(thing_id) {
            if let Some(slot) = self.take_removal(generation) {
                slot.timer.abort();
                // The caller gets the send error; nobody awaits this one.
                drop(slot.deferred);
            }
            return Err(e);
        }
        Ok(pending)
    }

    pub fn cancel_remove_thing(&self, thing_id: &str) {
        if let Some(adapter) = self.get_device(thing_id).and_then(|d| d.adapter()) {
            if let Err(e) = adapter.cancel_remove_thing(thing_id) {
                debug!("Adapter {} failed to cancel removal: {}", adapter.id(), e);
            }
        }
        if let Some(slot) = self.removal.lock().take() {
            slot.timer.abort();
            slot.deferred
                .reject(Error::Cancelled("removeThing".to_string()));
        }
    }

    fn take_removal(&self, generation: u64) -> Option<RemovalSlot> {
        let mut removal = self.removal.lock();
        match removal.as_ref() {
            Some(slot) if slot.generation == generation => removal.take(),
            _ => None,
        }
    }

    fn removal_timed_out(&self, generation: u64) {
        let Some(slot) = self.take_removal(generation) else {
            return;
        };
        warn!("Removal of {} timed out", slot.thing_id);
        if let Some(adapter) = self.get_adapter(&slot.adapter_id) {
            if let Err(e) = adapter.cancel_remove_thing(&slot.thing_id) {
                debug!("Adapter {} failed to cancel removal: {}", adapter.id(), e);
            }
        }
        slot.deferred
            .reject(Error::Timeout("removeThing".to_string()));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin callbacks
// ─────────────────────────────────────────────────────────────────────────────

impl PluginHost for AddonManager {
    fn addon_enabled(&self, package_name: &str) -> bool {
        self.settings.addon_enabled(package_name)
    }

    fn add_adapter(&self, adapter: Arc<AdapterProxy>) {
        let id = adapter.id().to_string();
        self.adapters.insert(id.clone(), adapter.clone());
        self.events.publish(EventKind::AdapterAdded {
            adapter_id: id.clone(),
            package_name: adapter.package_name().to_string(),
        });
        let waiters = self.adapter_waiters.lock().remove(&id);
        for waiter in waiters.into_iter().flatten() {
            waiter.resolve(adapter.clone());
        }
    }

    fn add_notifier(&self, notifier: Arc<NotifierProxy>) {
        self.notifiers
            .insert(notifier.id().to_string(), notifier.clone());
        self.events.publish(EventKind::NotifierAdded {
            notifier_id: notifier.id().to_string(),
            package_name: notifier.package_name().to_string(),
        });
    }

    fn add_api_handler(&self, handler: Arc<ApiHandlerProxy>) {
        let package_name = handler.package_name().to_string();
        self.api_handlers.insert(package_name.clone(), handler);
        self.events
            .publish(EventKind::ApiHandlerAdded { package_name });
    }

    fn handle_device_added(&self, device: Arc<DeviceProxy>) {
        self.devices
            .insert(device.id().to_string(), device.clone());
        self.events.publish(EventKind::ThingAdded {
            thing_id: device.id().to_string(),
            adapter_id: device.adapter_id().to_string(),
        });

        let Some(slot) = self.pairing.lock().take() else {
            return;
        };
        slot.timer.abort();
        for adapter in self.get_adapters() {
            if adapter.id() == device.adapter_id() {
                continue;
            }
            if let Err(e) = adapter.cancel_pairing() {
                debug!("Adapter {} failed to cancel pairing: {}", adapter.id(), e);
            }
        }
        info!("Paired {} from adapter {}", device.id(), device.adapter_id());
        slot.deferred.resolve(device);
    }

    fn handle_device_removed(&self, device: Arc<DeviceProxy>) {
        self.devices.remove(device.id());
        self.events.publish(EventKind::ThingRemoved {
            thing_id: device.id().to_string(),
            adapter_id: device.adapter_id().to_string(),
        });

        // The adapter decides which device went away, so match on the adapter.
        let slot = {
            let mut removal = self.removal.lock();
            match removal.as_ref() {
                Some(slot) if slot.adapter_id == device.adapter_id() => removal.take(),
                _ => None,
            }
        };
        if let Some(slot) = slot {
            slot.timer.abort();
            slot.deferred.resolve(device.id().to_string());
        }
    }

    fn handle_device_updated(&self, device: Arc<DeviceProxy>) {
        let thing_id = device.id().to_string();
        self.devices.insert(thing_id.clone(), device);
        self.events.publish(EventKind::ThingModified { thing_id });
    }

    fn saved_things(&self) -> Vec<String> {
        self.saved_things.read().clone()
    }

    fn publish(&self, event: EventKind) {
        self.events.publish(event);
    }

    fn unregister_plugin(&self, plugin_id: &str) {
        if let Some(server) = self.server() {
            server.unregister_plugin(plugin_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::router::tests::loopback;
    use crate::settings::MemorySettings;
    use hearth_ipc::{Message, MessageType};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn manager() -> Arc<AddonManager> {
        AddonManager::new(HubConfig::default(), Arc::new(MemorySettings::new()))
    }

    /// An adapter with no live plugin behind it
    fn detached_adapter(manager: &AddonManager, id: &str) -> Arc<AdapterProxy> {
        let adapter = AdapterProxy::new(id, id, "test-addon", Weak::new());
        manager.add_adapter(adapter.clone());
        adapter
    }

    fn add_device(manager: &AddonManager, adapter: &Arc<AdapterProxy>, id: &str) -> Arc<DeviceProxy> {
        let device = DeviceProxy::new(adapter, DeviceDescription::new(id, id));
        adapter.insert_device(device.clone());
        manager.handle_device_added(device.clone());
        device
    }

    #[tokio::test]
    async fn test_remove_rejected_while_pairing() {
        let manager = manager();
        let adapter = detached_adapter(&manager, "a");
        add_device(&manager, &adapter, "dev-1");

        let pairing = manager.add_new_thing(60).unwrap();
        let err = manager.remove_thing("dev-1").unwrap_err();
        assert_eq!(err.to_string(), "Add already in progress");
        assert!(matches!(manager.add_new_thing(60), Err(Error::AddInProgress)));

        // The pending pairing is untouched and still resolves.
        let device = add_device(&manager, &adapter, "dev-2");
        assert!(Arc::ptr_eq(&pairing.await.unwrap(), &device));
    }

    #[tokio::test]
    async fn test_paired_device_cancels_other_adapters_once() {
        let config = HubConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..HubConfig::default()
        };
        let manager = AddonManager::new(config, Arc::new(MemorySettings::new()));
        manager.start().await.unwrap();
        let plugin = manager.server().unwrap().register_plugin("test-addon");
        let (sender, mut addon) = loopback().await;
        plugin.attach(sender.clone());
        for id in ["a", "b", "c"] {
            plugin.on_message(Message::new(
                MessageType::AdapterAddedNotification,
                "test-addon",
                json!({"adapterId": id, "name": id, "packageName": "test-addon"}),
            ));
        }

        let pairing = manager.add_new_thing(60).unwrap();
        plugin.on_message(Message::new(
            MessageType::DeviceAddedNotification,
            "test-addon",
            json!({"adapterId": "a", "device": {"id": "found", "title": "Found"}}),
        ));
        assert_eq!(pairing.await.unwrap().id(), "found");

        // Once pairing is over, further devices are plain additions.
        plugin.on_message(Message::new(
            MessageType::DeviceAddedNotification,
            "test-addon",
            json!({"adapterId": "b", "device": {"id": "late", "title": "Late"}}),
        ));
        sender.close();

        let mut started = BTreeMap::new();
        let mut cancelled = BTreeMap::new();
        while let Some(msg) = addon.recv().await.unwrap() {
            let adapter_id = msg.data["adapterId"].as_str().unwrap().to_string();
            match msg.msg_type {
                MessageType::AdapterStartPairingCommand => {
                    *started.entry(adapter_id).or_insert(0) += 1;
                }
                MessageType::AdapterCancelPairingCommand => {
                    *cancelled.entry(adapter_id).or_insert(0) += 1;
                }
                _ => {}
            }
        }
        assert_eq!(
            started,
            BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 1), ("c".to_string(), 1)])
        );
        assert_eq!(
            cancelled,
            BTreeMap::from([("b".to_string(), 1), ("c".to_string(), 1)])
        );
    }

    #[tokio::test]
    async fn test_cancel_pairing() {
        let manager = manager();
        detached_adapter(&manager, "a");
        let pairing = manager.add_new_thing(60).unwrap();
        manager.cancel_add_new_thing();
        let err = pairing.await.unwrap_err();
        assert_eq!(err.to_string(), "addNewThing cancelled");
        assert!(manager.add_new_thing(60).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_times_out() {
        let manager = manager();
        let mut events = manager.subscribe();
        let pairing = manager.add_new_thing(5).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(pairing.await, Err(Error::Timeout(w)) if w == "addNewThing"));
        assert_eq!(events.recv().await.unwrap().kind, EventKind::PairingTimeout);
    }

    #[tokio::test]
    async fn test_remove_unknown_thing() {
        let manager = manager();
        assert_eq!(
            manager.remove_thing("ghost").unwrap_err().to_string(),
            "Device not found"
        );
    }

    #[tokio::test]
    async fn test_remove_fails_fast_when_adapter_unreachable() {
        let manager = manager();
        let adapter = detached_adapter(&manager, "a");
        add_device(&manager, &adapter, "dev-1");
        assert!(matches!(manager.remove_thing("dev-1"), Err(Error::NotConnected(_))));
        // The slot was released.
        assert!(manager.add_new_thing(1).is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_adapter() {
        let manager = manager();
        let waiting = manager.wait_for_adapter("late");
        detached_adapter(&manager, "late");
        assert_eq!(waiting.await.unwrap().id(), "late");
        assert_eq!(manager.wait_for_adapter("late").await.unwrap().id(), "late");
    }
}
