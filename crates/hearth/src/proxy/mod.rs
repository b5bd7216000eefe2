//! Proxies
//!
//! Hub-side mirrors of objects that live inside add-on processes. Calls are
//! translated into outbound messages; inbound notifications update the
//! mirrored state. Back-references are weak: a proxy never keeps its plugin
//! (or a device its adapter) alive.

mod adapter;
mod api_handler;
mod device;
mod notifier;
mod property;

pub use adapter::AdapterProxy;
pub use api_handler::ApiHandlerProxy;
pub use device::DeviceProxy;
pub use notifier::{NotifierProxy, OutletProxy};
pub use property::PropertyProxy;
