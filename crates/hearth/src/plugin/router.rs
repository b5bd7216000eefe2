//! Per-add-on supervision and message routing

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hearth_ipc::schema::{
    ActionStatus, AdapterAdded, ApiHandlerRef, ApiResponse, ConnectedState, DeviceAdded,
    DeviceDescription, DeviceEvent, DeviceRef, DeviceUpdateResponse, ErrorNotification,
    NotifierAdded, OutletAdded, OutletRemoved, PairingPrompt, PropertyChanged, ResponseStatus,
};
use hearth_ipc::{IpcSender, Message, MessageType};

use crate::deferred::{self, CorrelationTable, Deferred, Pending};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::proxy::{AdapterProxy, ApiHandlerProxy, DeviceProxy, NotifierProxy};

use super::host::PluginHost;
use super::process::{self, ExecVars, LaunchSpec, ProcessHandle};
use super::supervisor::{ExitDecision, RestartPolicy, Supervisor};

/// Hub-wide values every plugin launch needs
#[derive(Debug, Clone)]
pub struct PluginEnv {
    pub base_dir: PathBuf,
    pub gateway_dir: PathBuf,
    /// Substituted for `{nodeLoader}` in exec templates
    pub loader: String,
    /// Address add-ons connect back to
    pub ipc_addr: SocketAddr,
    pub restart: RestartPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Known but never connected
    Unregistered,
    /// Process launched, waiting for registration
    Starting,
    Running,
    Unloading,
    /// Exited unexpectedly; a restart may be scheduled
    Crashed,
    Stopped,
}

/// Requests awaiting a correlated reply, one table per request kind
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) request_action: CorrelationTable<()>,
    pub(crate) remove_action: CorrelationTable<()>,
    pub(crate) set_pin: CorrelationTable<DeviceDescription>,
    pub(crate) set_credentials: CorrelationTable<DeviceDescription>,
    pub(crate) notify: CorrelationTable<()>,
    pub(crate) api_request: CorrelationTable<Value>,
}

impl Tables {
    fn reject_all(&mut self, reason: &str) {
        self.request_action.reject_all(reason);
        self.remove_action.reject_all(reason);
        self.set_pin.reject_all(reason);
        self.set_credentials.reject_all(reason);
        self.notify.reject_all(reason);
        self.api_request.reject_all(reason);
    }
}

#[derive(Debug, Clone)]
struct ExecConfig {
    template: String,
    path: PathBuf,
}

struct PluginInner {
    state: PluginState,
    exec: Option<ExecConfig>,
    force_enable: bool,
    sender: Option<IpcSender>,
    adapters: BTreeMap<String, Arc<AdapterProxy>>,
    notifiers: BTreeMap<String, Arc<NotifierProxy>>,
    api_handlers: BTreeMap<String, Arc<ApiHandlerProxy>>,
    tables: Tables,
    supervisor: Supervisor,
    process: Option<ProcessHandle>,
    /// Bumped on every spawn; exit reports from older launches are stale
    launch: u64,
    pending_restart: Option<JoinHandle<()>>,
    /// Resolved once the add-on confirms the plugin-level unload
    unload_waiters: Vec<Deferred<()>>,
}

impl PluginInner {
    fn has_no_components(&self) -> bool {
        self.adapters.is_empty() && self.notifiers.is_empty() && self.api_handlers.is_empty()
    }

    fn abort_restart(&mut self) {
        if let Some(task) = self.pending_restart.take() {
            task.abort();
        }
    }
}

/// Hub-side state for one add-on package.
///
/// The lock is never held across an await or while calling into the host.
pub struct Plugin {
    id: String,
    host: Weak<dyn PluginHost>,
    env: Arc<PluginEnv>,
    next_message_id: AtomicU64,
    inner: Mutex<PluginInner>,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Plugin {
    pub(crate) fn new(id: String, host: Weak<dyn PluginHost>, env: Arc<PluginEnv>) -> Arc<Self> {
        let supervisor = Supervisor::new(env.restart.clone());
        Arc::new(Self {
            id,
            host,
            env,
            next_message_id: AtomicU64::new(1),
            inner: Mutex::new(PluginInner {
                state: PluginState::Unregistered,
                exec: None,
                force_enable: false,
                sender: None,
                adapters: BTreeMap::new(),
                notifiers: BTreeMap::new(),
                api_handlers: BTreeMap::new(),
                tables: Tables::default(),
                supervisor,
                process: None,
                launch: 0,
                pending_restart: None,
                unload_waiters: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PluginState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().sender.is_some()
    }

    pub fn is_process_alive(&self) -> bool {
        self.inner
            .lock()
            .process
            .as_ref()
            .is_some_and(|p| p.is_alive())
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().process.as_ref().and_then(|p| p.pid())
    }

    pub fn adapters(&self) -> Vec<Arc<AdapterProxy>> {
        self.inner.lock().adapters.values().cloned().collect()
    }

    pub fn notifiers(&self) -> Vec<Arc<NotifierProxy>> {
        self.inner.lock().notifiers.values().cloned().collect()
    }

    pub fn api_handlers(&self) -> Vec<Arc<ApiHandlerProxy>> {
        self.inner.lock().api_handlers.values().cloned().collect()
    }

    fn adapter(&self, adapter_id: &str) -> Option<Arc<AdapterProxy>> {
        self.inner.lock().adapters.get(adapter_id).cloned()
    }

    fn notifier(&self, notifier_id: &str) -> Option<Arc<NotifierProxy>> {
        self.inner.lock().notifiers.get(notifier_id).cloned()
    }

    /// Set the launch command and re-arm restarts
    pub(crate) fn configure(&self, exec: &str, path: PathBuf) {
        let mut inner = self.inner.lock();
        inner.exec = Some(ExecConfig {
            template: exec.to_string(),
            path,
        });
        inner.supervisor.enable();
    }

    /// Start even when the package is disabled in settings
    pub fn set_force_enable(&self, force: bool) {
        self.inner.lock().force_enable = force;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────────────────

    /// Bind the connection the add-on registered on
    pub(crate) fn attach(&self, sender: IpcSender) {
        let previous = {
            let mut inner = self.inner.lock();
            inner.state = PluginState::Running;
            inner.sender.replace(sender.clone())
        };
        if let Some(previous) = previous {
            if !previous.same_channel(&sender) {
                debug!("Add-on {} re-registered, closing old connection", self.id);
                previous.close();
            }
        }
    }

    /// The connection closed. Replies that can no longer arrive are
    /// rejected; a stale connection is ignored.
    pub(crate) fn detach(&self, sender: &IpcSender) {
        {
            let mut inner = self.inner.lock();
            if !inner.sender.as_ref().is_some_and(|s| s.same_channel(sender)) {
                return;
            }
            inner.sender = None;
            if inner.process.is_none() && inner.state == PluginState::Running {
                inner.state = PluginState::Stopped;
            }
        }
        self.reject_outstanding("add-on disconnected");
    }

    pub(crate) fn send_msg(&self, msg_type: MessageType, data: Value) -> Result<()> {
        self.send(Message::new(msg_type, self.id.clone(), data))
    }

    pub(crate) fn send_payload<P: Serialize>(&self, msg_type: MessageType, payload: &P) -> Result<()> {
        self.send_msg(msg_type, serde_json::to_value(payload)?)
    }

    fn send(&self, msg: Message) -> Result<()> {
        let sender = self
            .inner
            .lock()
            .sender
            .clone()
            .ok_or_else(|| Error::NotConnected(self.id.clone()))?;
        sender.send(msg)?;
        Ok(())
    }

    /// Send a correlated request. The entry is registered before the send so
    /// a fast reply cannot miss it.
    pub(crate) fn request<T, P>(
        &self,
        msg_type: MessageType,
        payload: &P,
        table: fn(&mut Tables) -> &mut CorrelationTable<T>,
    ) -> Result<Pending<T>>
    where
        P: Serialize,
    {
        let data = serde_json::to_value(payload)?;
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let (deferred, pending) = deferred::channel();
        table(&mut self.inner.lock().tables).insert(message_id, deferred);

        let msg = Message::new(msg_type, self.id.clone(), data).with_message_id(message_id);
        if let Err(e) = self.send(msg) {
            // Dropping the taken entry would reject the pending we never return.
            let _ = table(&mut self.inner.lock().tables).take(message_id);
            return Err(e);
        }
        Ok(pending)
    }

    fn take_pending<T>(
        &self,
        msg: &Message,
        table: fn(&mut Tables) -> &mut CorrelationTable<T>,
    ) -> Option<Deferred<T>> {
        let Some(message_id) = msg.message_id else {
            warn!("Add-on {}: {:?} without messageId", self.id, msg.msg_type);
            return None;
        };
        let deferred = table(&mut self.inner.lock().tables).take(message_id);
        if deferred.is_none() {
            warn!(
                "Add-on {}: no pending request for {:?} messageId {}",
                self.id, msg.msg_type, message_id
            );
        }
        deferred
    }

    fn parse<T: DeserializeOwned>(&self, msg: &Message) -> Option<T> {
        match msg.parse_data() {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Add-on {}: malformed {:?}: {}", self.id, msg.msg_type, e);
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound dispatch
    // ─────────────────────────────────────────────────────────────────────

    /// Route one message from the add-on
    pub fn on_message(self: &Arc<Self>, msg: Message) {
        use MessageType::*;

        // Correlated replies
        match msg.msg_type {
            DeviceRequestActionResponse => {
                if let Some(deferred) = self.take_pending(&msg, |t| &mut t.request_action) {
                    deferred.settle(response_status(&msg));
                }
                return;
            }
            DeviceRemoveActionResponse => {
                if let Some(deferred) = self.take_pending(&msg, |t| &mut t.remove_action) {
                    deferred.settle(response_status(&msg));
                }
                return;
            }
            OutletNotifyResponse => {
                if let Some(deferred) = self.take_pending(&msg, |t| &mut t.notify) {
                    deferred.settle(response_status(&msg));
                }
                return;
            }
            DeviceSetPinResponse => {
                self.settle_device_update(&msg, |t| &mut t.set_pin);
                return;
            }
            DeviceSetCredentialsResponse => {
                self.settle_device_update(&msg, |t| &mut t.set_credentials);
                return;
            }
            ApiHandlerApiResponse => {
                if let Some(deferred) = self.take_pending(&msg, |t| &mut t.api_request) {
                    match msg.parse_data::<ApiResponse>() {
                        Ok(reply) => deferred.resolve(reply.response),
                        Err(e) => deferred.reject(e.into()),
                    }
                }
                return;
            }
            _ => {}
        }

        let Some(host) = self.host.upgrade() else {
            debug!("Add-on {}: host gone, dropping {:?}", self.id, msg.msg_type);
            return;
        };

        // Plugin-level messages
        match msg.msg_type {
            AdapterAddedNotification => {
                self.handle_adapter_added(&*host, &msg);
                return;
            }
            NotifierAddedNotification => {
                self.handle_notifier_added(&*host, &msg);
                return;
            }
            ApiHandlerAddedNotification => {
                let Some(added) = self.parse::<ApiHandlerRef>(&msg) else {
                    return;
                };
                let handler = ApiHandlerProxy::new(added.package_name.clone(), Arc::downgrade(self));
                self.inner
                    .lock()
                    .api_handlers
                    .insert(added.package_name, handler.clone());
                host.add_api_handler(handler);
                return;
            }
            ApiHandlerUnloadResponse => {
                let Some(unloaded) = self.parse::<ApiHandlerRef>(&msg) else {
                    return;
                };
                let handler = self.inner.lock().api_handlers.remove(&unloaded.package_name);
                match handler {
                    Some(handler) => self.component_unloaded(handler.take_unload()),
                    None => warn!(
                        "Add-on {}: unrecognized API handler {}",
                        self.id, unloaded.package_name
                    ),
                }
                return;
            }
            PluginUnloadResponse => {
                let waiters = {
                    let mut inner = self.inner.lock();
                    inner.state = PluginState::Stopped;
                    std::mem::take(&mut inner.unload_waiters)
                };
                self.shutdown("add-on unloaded");
                host.unregister_plugin(&self.id);
                for waiter in waiters {
                    waiter.resolve(());
                }
                return;
            }
            PluginErrorNotification => {
                let message = self
                    .parse::<ErrorNotification>(&msg)
                    .map(|e| e.message)
                    .unwrap_or_default();
                error!("Add-on {} reported an error: {}", self.id, message);
                host.publish(EventKind::PluginError {
                    plugin_id: self.id.clone(),
                    message,
                });
                return;
            }
            PluginRegisterRequest | PluginRegisterResponse => {
                warn!("Add-on {}: unexpected {:?}", self.id, msg.msg_type);
                return;
            }
            _ => {}
        }

        if let Some(adapter_id) = msg.data_str("adapterId") {
            match self.adapter(adapter_id) {
                Some(adapter) => self.handle_adapter_message(&*host, &adapter, &msg),
                None => warn!(
                    "Add-on {}: unrecognized adapter {}, ignoring {:?}",
                    self.id, adapter_id, msg.msg_type
                ),
            }
            return;
        }

        if let Some(notifier_id) = msg.data_str("notifierId") {
            match self.notifier(notifier_id) {
                Some(notifier) => self.handle_notifier_message(&*host, &notifier, &msg),
                None => warn!(
                    "Add-on {}: unrecognized notifier {}, ignoring {:?}",
                    self.id, notifier_id, msg.msg_type
                ),
            }
            return;
        }

        warn!("Add-on {}: unhandled {:?}", self.id, msg.msg_type);
    }

    fn settle_device_update(
        &self,
        msg: &Message,
        table: fn(&mut Tables) -> &mut CorrelationTable<DeviceDescription>,
    ) {
        let Some(deferred) = self.take_pending(msg, table) else {
            return;
        };
        let update: DeviceUpdateResponse = match msg.parse_data() {
            Ok(update) => update,
            Err(e) => return deferred.reject(e.into()),
        };
        if !update.success {
            let reason = update
                .error
                .unwrap_or_else(|| format!("{:?} failed", msg.msg_type));
            return deferred.reject(Error::Rejected(reason));
        }
        let Some(description) = update.device else {
            return deferred.reject(Error::Rejected("response carried no device".to_string()));
        };

        if let Some(adapter) = self.adapter(&update.adapter_id) {
            let device = DeviceProxy::new(&adapter, description.clone());
            adapter.insert_device(device.clone());
            if let Some(host) = self.host.upgrade() {
                host.handle_device_updated(device);
            }
        }
        deferred.resolve(description);
    }

    fn handle_adapter_added(self: &Arc<Self>, host: &dyn PluginHost, msg: &Message) {
        let Some(added) = self.parse::<AdapterAdded>(msg) else {
            return;
        };
        // A restarted add-on re-announces its adapters; keep the existing
        // proxies so references held elsewhere stay valid.
        let adapter = {
            let mut inner = self.inner.lock();
            match inner.adapters.get(&added.adapter_id) {
                Some(existing) => {
                    existing.set_name(&added.name);
                    existing.clone()
                }
                None => {
                    let adapter = AdapterProxy::new(
                        added.adapter_id.clone(),
                        added.name,
                        added.package_name,
                        Arc::downgrade(self),
                    );
                    inner.adapters.insert(added.adapter_id, adapter.clone());
                    adapter
                }
            }
        };
        info!("Add-on {} added adapter {}", self.id, adapter.id());
        host.add_adapter(adapter.clone());

        for thing_id in host.saved_things() {
            let saved = DeviceRef {
                adapter_id: adapter.id().to_string(),
                device_id: thing_id,
            };
            if let Err(e) = self.send_payload(MessageType::DeviceSavedNotification, &saved) {
                warn!("Failed to send saved things to {}: {}", self.id, e);
                break;
            }
        }
    }

    fn handle_notifier_added(self: &Arc<Self>, host: &dyn PluginHost, msg: &Message) {
        let Some(added) = self.parse::<NotifierAdded>(msg) else {
            return;
        };
        let notifier = {
            let mut inner = self.inner.lock();
            match inner.notifiers.get(&added.notifier_id) {
                Some(existing) => existing.clone(),
                None => {
                    let notifier = NotifierProxy::new(
                        added.notifier_id.clone(),
                        added.name,
                        added.package_name,
                        Arc::downgrade(self),
                    );
                    inner.notifiers.insert(added.notifier_id, notifier.clone());
                    notifier
                }
            }
        };
        info!("Add-on {} added notifier {}", self.id, notifier.id());
        host.add_notifier(notifier);
    }

    fn handle_adapter_message(&self, host: &dyn PluginHost, adapter: &Arc<AdapterProxy>, msg: &Message) {
        use MessageType::*;

        match msg.msg_type {
            AdapterUnloadResponse => {
                self.inner.lock().adapters.remove(adapter.id());
                self.component_unloaded(adapter.take_unload());
            }
            DeviceAddedNotification => {
                let Some(added) = self.parse::<DeviceAdded>(msg) else {
                    return;
                };
                let device = DeviceProxy::new(adapter, added.device);
                adapter.insert_device(device.clone());
                host.handle_device_added(device);
            }
            AdapterRemoveDeviceResponse => {
                let Some(removed) = self.parse::<DeviceRef>(msg) else {
                    return;
                };
                match adapter.remove_device(&removed.device_id) {
                    Some(device) => host.handle_device_removed(device),
                    None => warn!(
                        "Adapter {}: removed unknown device {}",
                        adapter.id(),
                        removed.device_id
                    ),
                }
            }
            DevicePropertyChangedNotification => {
                let Some(changed) = self.parse::<PropertyChanged>(msg) else {
                    return;
                };
                let Some(device) = adapter.device(&changed.device_id) else {
                    warn!("Adapter {}: unknown device {}", adapter.id(), changed.device_id);
                    return;
                };
                let Some(name) = changed.property.name.clone() else {
                    warn!("Device {}: property change without a name", device.id());
                    return;
                };
                let Some(property) = device.property(&name) else {
                    warn!("Device {}: unknown property {}", device.id(), name);
                    return;
                };
                let value = property.do_property_changed(changed.property);
                host.publish(EventKind::PropertyChanged {
                    thing_id: changed.device_id,
                    property: name,
                    value,
                });
            }
            DeviceActionStatusNotification => {
                if let Some(status) = self.parse::<ActionStatus>(msg) {
                    host.publish(EventKind::ActionStatus {
                        thing_id: status.device_id,
                        action: status.action,
                    });
                }
            }
            DeviceEventNotification => {
                if let Some(event) = self.parse::<DeviceEvent>(msg) {
                    host.publish(EventKind::Event {
                        thing_id: event.device_id,
                        event: event.event,
                    });
                }
            }
            DeviceConnectedStateNotification => {
                let Some(state) = self.parse::<ConnectedState>(msg) else {
                    return;
                };
                if let Some(device) = adapter.device(&state.device_id) {
                    device.set_connected(state.connected);
                }
                host.publish(EventKind::ConnectedState {
                    thing_id: state.device_id,
                    connected: state.connected,
                });
            }
            AdapterPairingPromptNotification | AdapterUnpairingPromptNotification => {
                let Some(prompt) = self.parse::<PairingPrompt>(msg) else {
                    return;
                };
                let mut line = match prompt.device_id.as_deref().and_then(|id| adapter.device(id)) {
                    Some(device) => format!("{} ({}): {}", adapter.name(), device.title(), prompt.prompt),
                    None => format!("{}: {}", adapter.name(), prompt.prompt),
                };
                if let Some(url) = &prompt.url {
                    line = format!("{} {}", line, url);
                }
                info!("{}", line);
                host.publish(EventKind::Prompt {
                    adapter_id: prompt.adapter_id,
                    thing_id: prompt.device_id,
                    message: prompt.prompt,
                    url: prompt.url,
                });
            }
            MockAdapterClearStateResponse
            | MockAdapterAddDeviceResponse
            | MockAdapterRemoveDeviceResponse => match adapter.take_mock() {
                Some(deferred) => deferred.settle(response_status(msg)),
                None => warn!("Adapter {}: unexpected {:?}", adapter.id(), msg.msg_type),
            },
            other => warn!("Adapter {}: unhandled {:?}", adapter.id(), other),
        }
    }

    fn handle_notifier_message(&self, host: &dyn PluginHost, notifier: &Arc<NotifierProxy>, msg: &Message) {
        use MessageType::*;

        match msg.msg_type {
            NotifierUnloadResponse => {
                self.inner.lock().notifiers.remove(notifier.id());
                self.component_unloaded(notifier.take_unload());
            }
            OutletAddedNotification => {
                let Some(added) = self.parse::<OutletAdded>(msg) else {
                    return;
                };
                let outlet = notifier.add_outlet(added.outlet);
                host.publish(EventKind::OutletAdded {
                    notifier_id: notifier.id().to_string(),
                    outlet_id: outlet.id().to_string(),
                });
            }
            OutletRemovedNotification => {
                let Some(removed) = self.parse::<OutletRemoved>(msg) else {
                    return;
                };
                if notifier.remove_outlet(&removed.outlet_id).is_some() {
                    host.publish(EventKind::OutletRemoved {
                        notifier_id: removed.notifier_id,
                        outlet_id: removed.outlet_id,
                    });
                } else {
                    warn!("Notifier {}: unknown outlet {}", notifier.id(), removed.outlet_id);
                }
            }
            other => warn!("Notifier {}: unhandled {:?}", notifier.id(), other),
        }
    }

    /// A component confirmed its unload. When it was the last one the whole
    /// plugin unloads and the completion waits for that instead.
    fn component_unloaded(&self, completion: Option<Deferred<()>>) {
        let completion = {
            let mut inner = self.inner.lock();
            if inner.has_no_components() {
                inner.unload_waiters.extend(completion);
                None
            } else {
                Some(completion)
            }
        };
        match completion {
            None => self.unload(),
            Some(Some(deferred)) => deferred.resolve(()),
            Some(None) => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Launch the add-on process unless it is disabled or already running
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let (exec, force_enable) = {
            let inner = self.inner.lock();
            if inner.process.as_ref().is_some_and(|p| p.is_alive()) {
                debug!("Add-on {} already running", self.id);
                return Ok(());
            }
            (inner.exec.clone(), inner.force_enable)
        };
        let exec = exec.ok_or_else(|| Error::Spawn(format!("no exec command for {}", self.id)))?;

        let enabled = force_enable
            || self
                .host
                .upgrade()
                .is_some_and(|host| host.addon_enabled(&self.id));
        if !enabled {
            info!("Add-on {} is disabled, not starting", self.id);
            let mut inner = self.inner.lock();
            inner.supervisor.disable();
            inner.state = PluginState::Stopped;
            return Ok(());
        }

        let command_line = render_exec(&exec.template, &exec.path, &self.id, &self.env.loader);
        let spec = LaunchSpec {
            plugin_id: self.id.clone(),
            command_line,
            cwd: exec.path,
            env: vec![
                (
                    "HEARTH_HOME".to_string(),
                    self.env.base_dir.to_string_lossy().into_owned(),
                ),
                (
                    "HEARTH_MODULE_PATH".to_string(),
                    self.env.gateway_dir.join("node_modules").to_string_lossy().into_owned(),
                ),
                ("HEARTH_IPC_ADDR".to_string(), self.env.ipc_addr.to_string()),
            ],
        };

        let launch = {
            let mut inner = self.inner.lock();
            inner.state = PluginState::Starting;
            inner.launch += 1;
            inner.launch
        };
        let weak = Arc::downgrade(self);
        match process::spawn(&spec, move |code| {
            if let Some(plugin) = weak.upgrade() {
                plugin.handle_exit(launch, code);
            }
        }) {
            Ok(handle) => {
                self.inner.lock().process = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start add-on {}: {}", self.id, e);
                let mut inner = self.inner.lock();
                inner.supervisor.disable();
                inner.state = PluginState::Stopped;
                Err(e)
            }
        }
    }

    fn handle_exit(self: &Arc<Self>, launch: u64, code: Option<i32>) {
        let decision = {
            let mut inner = self.inner.lock();
            if inner.launch != launch {
                debug!("Add-on {}: ignoring exit of a replaced process", self.id);
                return;
            }
            if inner.process.as_ref().is_some_and(|p| !p.is_alive()) {
                inner.process = None;
            }
            inner.supervisor.on_exit(code, Instant::now())
        };

        match decision {
            ExitDecision::Restart(delay) => {
                info!(
                    "Add-on {} died (code {:?}), restarting in {:?}",
                    self.id, code, delay
                );
                let weak = Arc::downgrade(self);
                let task = tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if let Some(plugin) = weak.upgrade() {
                        plugin.restart();
                    }
                });
                let mut inner = self.inner.lock();
                inner.state = PluginState::Crashed;
                inner.abort_restart();
                inner.pending_restart = Some(task);
            }
            ExitDecision::GiveUp => {
                error!("Add-on {} keeps crashing, giving up", self.id);
                self.inner.lock().state = PluginState::Stopped;
                self.shutdown("add-on crashed");
            }
            ExitDecision::Stop => {
                debug!("Add-on {} exited (code {:?}), not restarting", self.id, code);
                self.inner.lock().state = PluginState::Stopped;
            }
        }
    }

    fn restart(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.pending_restart = None;
            if !inner.supervisor.is_enabled() {
                return;
            }
            inner.supervisor.on_restart(Instant::now());
        }
        if let Err(e) = self.start() {
            error!("Failed to restart add-on {}: {}", self.id, e);
        }
    }

    /// Ask the add-on to unload as a whole. Restarts are disabled first.
    pub fn unload(&self) {
        {
            let mut inner = self.inner.lock();
            inner.supervisor.disable();
            inner.abort_restart();
            inner.state = PluginState::Unloading;
        }
        if let Err(e) = self.send_msg(MessageType::PluginUnloadRequest, json!({})) {
            warn!("Failed to send unload request to {}: {}", self.id, e);
        }
    }

    /// Unload every adapter, notifier and API handler; the last one to
    /// confirm triggers the plugin-level unload. With no components the
    /// plugin is unloaded directly and this waits for its confirmation.
    pub async fn unload_components(&self) {
        let (adapters, notifiers, handlers) = {
            let mut inner = self.inner.lock();
            inner.supervisor.disable();
            inner.abort_restart();
            (
                inner.adapters.values().cloned().collect::<Vec<_>>(),
                inner.notifiers.values().cloned().collect::<Vec<_>>(),
                inner.api_handlers.values().cloned().collect::<Vec<_>>(),
            )
        };

        if adapters.is_empty() && notifiers.is_empty() && handlers.is_empty() {
            let (deferred, pending) = deferred::channel();
            self.inner.lock().unload_waiters.push(deferred);
            self.unload();
            if let Err(e) = pending.await {
                debug!("Add-on {} unload not confirmed: {}", self.id, e);
            }
            return;
        }

        let mut pending = Vec::new();
        pending.extend(adapters.iter().map(|a| a.unload()));
        pending.extend(notifiers.iter().map(|n| n.unload()));
        pending.extend(handlers.iter().map(|h| h.unload()));
        for result in futures::future::join_all(pending).await {
            if let Err(e) = result {
                warn!("Add-on {}: component unload failed: {}", self.id, e);
            }
        }
    }

    /// Terminate the process outright
    pub fn kill(&self) {
        let process = {
            let mut inner = self.inner.lock();
            inner.supervisor.disable();
            inner.abort_restart();
            inner.state = PluginState::Stopped;
            inner.process.take()
        };
        if let Some(mut process) = process {
            if process.is_alive() {
                process.kill();
            }
        }
        self.reject_outstanding("add-on killed");
    }

    /// Stop restarting and fail everything still waiting on this add-on
    pub fn shutdown(&self, reason: &str) {
        {
            let mut inner = self.inner.lock();
            inner.supervisor.disable();
            inner.abort_restart();
        }
        self.reject_outstanding(reason);
    }

    fn reject_outstanding(&self, reason: &str) {
        let (adapters, notifiers, handlers, waiters) = {
            let mut inner = self.inner.lock();
            inner.tables.reject_all(reason);
            (
                inner.adapters.values().cloned().collect::<Vec<_>>(),
                inner.notifiers.values().cloned().collect::<Vec<_>>(),
                inner.api_handlers.values().cloned().collect::<Vec<_>>(),
                std::mem::take(&mut inner.unload_waiters),
            )
        };
        for adapter in adapters {
            adapter.reject_pending(reason);
        }
        for notifier in notifiers {
            notifier.reject_pending(reason);
        }
        for handler in handlers {
            handler.reject_pending(reason);
        }
        for waiter in waiters {
            waiter.reject(Error::Abandoned(reason.to_string()));
        }
    }
}

fn render_exec(template: &str, path: &std::path::Path, name: &str, loader: &str) -> String {
    process::render_exec(template, &ExecVars { name, path, loader })
}

/// Interpret a `{success, error}` reply
fn response_status(msg: &Message) -> Result<()> {
    let status: ResponseStatus = msg.parse_data()?;
    if status.success {
        Ok(())
    } else {
        Err(Error::Rejected(status.error.unwrap_or_else(|| {
            format!("{:?} failed", msg.msg_type)
        })))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proxy::DeviceProxy;
    use hearth_ipc::{IpcReceiver, IpcSocket};
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;
    use tempfile::tempdir;

    /// A live connection: the hub-side sender and the add-on's receiver
    pub(crate) async fn loopback() -> (IpcSender, IpcReceiver) {
        let mut server = IpcSocket::new();
        let listener = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = IpcSocket::new();
        let (connected, accepted) = tokio::join!(client.connect(addr), listener.accept());
        let (_, addon_rx) = connected.unwrap().split();
        let (hub_tx, _) = accepted.unwrap().split();
        (hub_tx, addon_rx)
    }

    #[derive(Default)]
    struct RecordingHost {
        enabled: bool,
        adapters: PlMutex<Vec<String>>,
        devices: PlMutex<Vec<String>>,
        events: PlMutex<Vec<EventKind>>,
        unregistered: PlMutex<Vec<String>>,
    }

    impl PluginHost for RecordingHost {
        fn addon_enabled(&self, _package_name: &str) -> bool {
            self.enabled
        }
        fn add_adapter(&self, adapter: Arc<AdapterProxy>) {
            self.adapters.lock().push(adapter.id().to_string());
        }
        fn add_notifier(&self, _notifier: Arc<NotifierProxy>) {}
        fn add_api_handler(&self, _handler: Arc<ApiHandlerProxy>) {}
        fn handle_device_added(&self, device: Arc<DeviceProxy>) {
            self.devices.lock().push(device.id().to_string());
        }
        fn handle_device_removed(&self, device: Arc<DeviceProxy>) {
            self.devices.lock().retain(|id| id != device.id());
        }
        fn handle_device_updated(&self, _device: Arc<DeviceProxy>) {}
        fn saved_things(&self) -> Vec<String> {
            Vec::new()
        }
        fn publish(&self, event: EventKind) {
            self.events.lock().push(event);
        }
        fn unregister_plugin(&self, plugin_id: &str) {
            self.unregistered.lock().push(plugin_id.to_string());
        }
    }

    fn env(restart: RestartPolicy) -> Arc<PluginEnv> {
        Arc::new(PluginEnv {
            base_dir: PathBuf::from("/tmp"),
            gateway_dir: PathBuf::from("/tmp"),
            loader: "node loader.js".into(),
            ipc_addr: "127.0.0.1:9500".parse().unwrap(),
            restart,
        })
    }

    fn plugin_with_host(host: &Arc<RecordingHost>) -> Arc<Plugin> {
        let host: Arc<dyn PluginHost> = host.clone();
        Plugin::new("test-addon".into(), Arc::downgrade(&host), env(RestartPolicy::default()))
    }

    fn notification(msg_type: MessageType, data: Value) -> Message {
        Message::new(msg_type, "test-addon", data)
    }

    fn announce_adapter(plugin: &Arc<Plugin>) {
        plugin.on_message(notification(
            MessageType::AdapterAddedNotification,
            json!({"adapterId": "mock", "name": "Mock", "packageName": "test-addon"}),
        ));
    }

    fn announce_lamp(plugin: &Arc<Plugin>) {
        plugin.on_message(notification(
            MessageType::DeviceAddedNotification,
            json!({"adapterId": "mock", "device": {"id": "lamp", "title": "Lamp",
                "properties": {"on": {"type": "boolean", "value": false}}}}),
        ));
    }

    async fn wait_for_state(plugin: &Plugin, state: PluginState) -> bool {
        for _ in 0..300 {
            if plugin.state() == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_request_without_connection_fails() {
        let host = Arc::new(RecordingHost::default());
        let plugin = plugin_with_host(&host);
        let result = plugin.request(MessageType::OutletNotifyRequest, &json!({}), |t| &mut t.notify);
        assert!(matches!(result, Err(Error::NotConnected(_))));
        assert!(plugin.inner.lock().tables.notify.is_empty());
    }

    #[tokio::test]
    async fn test_adapter_and_device_notifications_build_proxies() {
        let host = Arc::new(RecordingHost::default());
        let plugin = plugin_with_host(&host);

        plugin.on_message(notification(
            MessageType::AdapterAddedNotification,
            json!({"adapterId": "mock", "name": "Mock", "packageName": "test-addon"}),
        ));
        plugin.on_message(notification(
            MessageType::DeviceAddedNotification,
            json!({"adapterId": "mock", "device": {"id": "lamp", "title": "Lamp",
                "properties": {"on": {"type": "boolean", "value": false}}}}),
        ));
        assert_eq!(*host.adapters.lock(), vec!["mock".to_string()]);
        assert_eq!(*host.devices.lock(), vec!["lamp".to_string()]);

        plugin.on_message(notification(
            MessageType::DevicePropertyChangedNotification,
            json!({"adapterId": "mock", "deviceId": "lamp", "property": {"name": "on", "value": true}}),
        ));
        let adapter = plugin.adapter("mock").unwrap();
        let property = adapter.device("lamp").unwrap().property("on").unwrap();
        assert_eq!(property.value(), json!(true));
        assert_eq!(property.description().kind.as_deref(), Some("boolean"));
        assert!(matches!(
            host.events.lock().last(),
            Some(EventKind::PropertyChanged { property, .. }) if property == "on"
        ));
    }

    #[tokio::test]
    async fn test_unknown_adapter_is_ignored() {
        let host = Arc::new(RecordingHost::default());
        let plugin = plugin_with_host(&host);
        plugin.on_message(notification(
            MessageType::DeviceAddedNotification,
            json!({"adapterId": "nope", "device": {"id": "lamp"}}),
        ));
        assert!(host.devices.lock().is_empty());
    }

    #[tokio::test]
    async fn test_restarted_addon_keeps_adapter_proxy() {
        let host = Arc::new(RecordingHost::default());
        let plugin = plugin_with_host(&host);
        let added = json!({"adapterId": "mock", "name": "Mock", "packageName": "test-addon"});
        plugin.on_message(notification(MessageType::AdapterAddedNotification, added.clone()));
        let first = plugin.adapter("mock").unwrap();
        plugin.on_message(notification(MessageType::AdapterAddedNotification, added));
        assert!(Arc::ptr_eq(&first, &plugin.adapter("mock").unwrap()));
    }

    #[tokio::test]
    async fn test_reannounced_device_fails_pending_sets() {
        let host = Arc::new(RecordingHost::default());
        let plugin = plugin_with_host(&host);
        let (sender, mut addon) = loopback().await;
        plugin.attach(sender);
        announce_adapter(&plugin);
        announce_lamp(&plugin);

        let old = plugin.adapter("mock").unwrap().device("lamp").unwrap();
        let pending = old.property("on").unwrap().set_value(json!(true)).unwrap();
        let sent = addon.recv().await.unwrap().unwrap();
        assert_eq!(sent.msg_type, MessageType::DeviceSetPropertyCommand);

        announce_lamp(&plugin);
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Abandoned(reason)) if reason == "device replaced"));
        assert!(!Arc::ptr_eq(&old, &plugin.adapter("mock").unwrap().device("lamp").unwrap()));
    }

    #[tokio::test]
    async fn test_pin_reply_fails_sets_on_replaced_device() {
        let host = Arc::new(RecordingHost::default());
        let plugin = plugin_with_host(&host);
        let (sender, mut addon) = loopback().await;
        plugin.attach(sender);
        announce_adapter(&plugin);
        announce_lamp(&plugin);

        let adapter = plugin.adapter("mock").unwrap();
        let pending_set = adapter
            .device("lamp")
            .unwrap()
            .property("on")
            .unwrap()
            .set_value(json!(true))
            .unwrap();
        let pin = tokio::spawn(async move { adapter.set_pin("lamp", json!("1234")).await });

        let request = loop {
            let msg = addon.recv().await.unwrap().unwrap();
            if msg.msg_type == MessageType::DeviceSetPinRequest {
                break msg;
            }
        };
        plugin.on_message(
            notification(
                MessageType::DeviceSetPinResponse,
                json!({"adapterId": "mock", "deviceId": "lamp", "success": true,
                    "device": {"id": "lamp", "title": "Lamp",
                        "properties": {"on": {"type": "boolean", "value": false}}}}),
            )
            .with_message_id(request.message_id.unwrap()),
        );

        assert_eq!(pin.await.unwrap().unwrap().id, "lamp");
        let result = tokio::time::timeout(Duration::from_secs(1), pending_set)
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Abandoned(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crashed_addon_restarts_with_same_adapter() {
        let host = Arc::new(RecordingHost {
            enabled: true,
            ..Default::default()
        });
        let dyn_host: Arc<dyn PluginHost> = host.clone();
        let policy = RestartPolicy {
            increment: Duration::from_millis(300),
            ceiling: Duration::from_secs(5),
            reset_after: Duration::from_secs(60),
            dont_restart_exit_code: 100,
        };
        let plugin = Plugin::new("test-addon".into(), Arc::downgrade(&dyn_host), env(policy));
        announce_adapter(&plugin);
        let adapter = plugin.adapter("mock").unwrap();

        // The first launch exits with 42; the relaunch stays up.
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("run.sh"),
            "if [ -f crashed ]; then exec sleep 30; fi\ntouch crashed\nexit 42\n",
        )
        .unwrap();
        plugin.configure("sh run.sh", dir.path().to_path_buf());
        // A recent restart makes the crash back off instead of relaunching at once.
        plugin.inner.lock().supervisor.on_restart(Instant::now());
        plugin.start().unwrap();
        assert_eq!(plugin.state(), PluginState::Starting);

        assert!(wait_for_state(&plugin, PluginState::Crashed).await);
        assert!(wait_for_state(&plugin, PluginState::Starting).await);
        assert!(plugin.is_process_alive());

        let (sender, _addon) = loopback().await;
        plugin.attach(sender);
        announce_adapter(&plugin);
        assert_eq!(plugin.state(), PluginState::Running);
        assert!(Arc::ptr_eq(&adapter, &plugin.adapter("mock").unwrap()));

        plugin.kill();
    }

    #[tokio::test]
    async fn test_disabled_addon_is_not_started() {
        let host = Arc::new(RecordingHost::default());
        let plugin = plugin_with_host(&host);
        plugin.configure("false", PathBuf::from("/tmp"));
        plugin.start().unwrap();
        assert_eq!(plugin.state(), PluginState::Stopped);
        assert!(!plugin.is_process_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crashing_addon_gives_up() {
        let host = Arc::new(RecordingHost {
            enabled: true,
            ..Default::default()
        });
        let dyn_host: Arc<dyn PluginHost> = host.clone();
        let policy = RestartPolicy {
            increment: Duration::from_millis(10),
            ceiling: Duration::from_millis(25),
            reset_after: Duration::from_secs(60),
            dont_restart_exit_code: 100,
        };
        let plugin = Plugin::new("crasher".into(), Arc::downgrade(&dyn_host), env(policy));
        plugin.configure("false", PathBuf::from("/tmp"));
        plugin.start().unwrap();

        let mut stopped = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if plugin.state() == PluginState::Stopped {
                stopped = true;
                break;
            }
        }
        assert!(stopped);
        assert!(!plugin.inner.lock().supervisor.is_enabled());
    }
}
