//! Plugin server
//!
//! Listens on the loopback IPC port. The first message on a connection must
//! be a registration; after that every message is routed to the plugin named
//! in its envelope.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hearth_ipc::schema::RegisterResponse;
use hearth_ipc::{IpcConnection, IpcListener, IpcSocket, Message, MessageType};

use crate::config::HubConfig;
use crate::error::Result;
use crate::settings::SettingsStore;
use crate::user_profile::UserProfile;

use super::host::PluginHost;
use super::router::{Plugin, PluginEnv};

struct ServerInner {
    plugins: DashMap<String, Arc<Plugin>>,
    host: Weak<dyn PluginHost>,
    env: Arc<PluginEnv>,
    settings: Arc<dyn SettingsStore>,
    profile: UserProfile,
    gateway_version: String,
    local_addr: SocketAddr,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Accepts add-on connections and owns the plugin registry
#[derive(Clone)]
pub struct PluginServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for PluginServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginServer")
            .field("local_addr", &self.inner.local_addr)
            .field("plugins", &self.inner.plugins.len())
            .finish_non_exhaustive()
    }
}

impl PluginServer {
    /// Bind the IPC listener and start accepting connections
    pub async fn bind(
        config: &HubConfig,
        host: Weak<dyn PluginHost>,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        let mut socket = IpcSocket::new();
        let listener = socket.bind(config.listen).await?;
        let local_addr = listener.local_addr()?;
        let profile = config.profile();

        let env = Arc::new(PluginEnv {
            base_dir: profile.base_dir.clone(),
            gateway_dir: profile.gateway_dir.clone(),
            loader: config.loader_command(),
            ipc_addr: local_addr,
            restart: config.restart_policy(),
        });

        let server = Self {
            inner: Arc::new(ServerInner {
                plugins: DashMap::new(),
                host,
                env,
                settings,
                profile,
                gateway_version: config.gateway_version.clone(),
                local_addr,
                accept_task: Mutex::new(None),
            }),
        };

        let task = tokio::spawn(accept_loop(Arc::downgrade(&server.inner), listener));
        *server.inner.accept_task.lock() = Some(task);

        info!("Plugin server listening on {}", local_addr);
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Get or create the plugin for a package
    pub fn register_plugin(&self, plugin_id: &str) -> Arc<Plugin> {
        self.inner
            .plugins
            .entry(plugin_id.to_string())
            .or_insert_with(|| {
                debug!("Registering plugin {}", plugin_id);
                Plugin::new(
                    plugin_id.to_string(),
                    self.inner.host.clone(),
                    self.inner.env.clone(),
                )
            })
            .clone()
    }

    pub fn get_plugin(&self, plugin_id: &str) -> Option<Arc<Plugin>> {
        self.inner.plugins.get(plugin_id).map(|p| p.clone())
    }

    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        self.inner.plugins.iter().map(|p| p.value().clone()).collect()
    }

    pub fn unregister_plugin(&self, plugin_id: &str) {
        if self.inner.plugins.remove(plugin_id).is_some() {
            debug!("Unregistered plugin {}", plugin_id);
        }
    }

    /// Register a package and launch its process
    pub fn load_plugin(&self, path: &Path, plugin_id: &str, exec: &str) -> Result<Arc<Plugin>> {
        let plugin = self.register_plugin(plugin_id);
        plugin.configure(exec, path.to_path_buf());
        plugin.start()?;
        Ok(plugin)
    }

    /// Stop accepting new connections
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
    }

    fn registration_reply(&self, request: &Message) -> Result<Message> {
        let reply = RegisterResponse {
            plugin_id: request.plugin_id.clone(),
            gateway_version: self.inner.gateway_version.clone(),
            user_profile: self.inner.profile.to_wire(),
            preferences: self.inner.settings.preferences(),
        };
        let data = serde_json::to_value(&reply)?;
        Ok(request.reply(MessageType::PluginRegisterResponse, data))
    }
}

async fn accept_loop(server: Weak<ServerInner>, listener: IpcListener) {
    loop {
        let connection = match listener.accept().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to accept add-on connection: {}", e);
                continue;
            }
        };
        let Some(inner) = server.upgrade() else {
            break;
        };
        tokio::spawn(handle_connection(PluginServer { inner }, connection));
    }
}

async fn handle_connection(server: PluginServer, connection: IpcConnection) {
    let peer = connection.peer_addr();
    let (sender, mut receiver) = connection.split();
    let mut registered: Option<Arc<Plugin>> = None;

    loop {
        let msg = match receiver.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                warn!("Add-on connection from {} failed: {}", peer, e);
                break;
            }
        };

        if msg.msg_type == MessageType::PluginRegisterRequest {
            let plugin = server.register_plugin(&msg.plugin_id);
            plugin.attach(sender.clone());
            match server.registration_reply(&msg) {
                Ok(reply) => {
                    if let Err(e) = sender.send(reply) {
                        warn!("Failed to answer registration of {}: {}", msg.plugin_id, e);
                    }
                }
                Err(e) => warn!("Failed to build registration reply: {}", e),
            }
            info!("Add-on {} registered from {}", msg.plugin_id, peer);
            registered = Some(plugin);
            continue;
        }

        if registered.is_none() {
            warn!("Dropping {:?} from unregistered connection {}", msg.msg_type, peer);
            continue;
        }

        match server.get_plugin(&msg.plugin_id) {
            Some(plugin) => plugin.on_message(msg),
            None => warn!(
                "Dropping {:?} for unknown add-on {}",
                msg.msg_type, msg.plugin_id
            ),
        }
    }

    if let Some(plugin) = registered {
        info!("Add-on {} disconnected", plugin.id());
        plugin.detach(&sender);
    }
}
