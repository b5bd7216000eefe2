use std::sync::Arc;

use crate::events::EventKind;
use crate::proxy::{AdapterProxy, ApiHandlerProxy, DeviceProxy, NotifierProxy};

/// Hub-side registry a plugin reports into.
///
/// Plugins hold this weakly and never call it with their own lock held, so
/// implementations may send through any plugin, the reporting one included.
pub trait PluginHost: Send + Sync {
    /// Whether the package is enabled in settings
    fn addon_enabled(&self, package_name: &str) -> bool;

    fn add_adapter(&self, adapter: Arc<AdapterProxy>);

    fn add_notifier(&self, notifier: Arc<NotifierProxy>);

    fn add_api_handler(&self, handler: Arc<ApiHandlerProxy>);

    fn handle_device_added(&self, device: Arc<DeviceProxy>);

    fn handle_device_removed(&self, device: Arc<DeviceProxy>);

    /// A device was rebuilt from a fresh description (after a PIN or
    /// credentials update)
    fn handle_device_updated(&self, device: Arc<DeviceProxy>);

    /// Ids of things the user has saved
    fn saved_things(&self) -> Vec<String>;

    fn publish(&self, event: EventKind);

    /// The plugin confirmed its unload and should be forgotten
    fn unregister_plugin(&self, plugin_id: &str);
}
