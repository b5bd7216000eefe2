//! Hearth - add-on host for an IoT hub
//!
//! This crate provides the hub side of the add-on system, including:
//! - Out-of-process add-on supervision with restart backoff
//! - Request/response correlation over the `hearth-ipc` transport
//! - Proxies mirroring remote adapters, devices, properties and notifiers
//! - The `AddonManager` facade: pairing, removal, install and settings

pub mod addon;
pub mod config;
pub mod deferred;
pub mod error;
pub mod events;
pub mod manager;
pub mod plugin;
pub mod proxy;
pub mod settings;
pub mod user_profile;

pub use config::HubConfig;
pub use error::{Error, Result};
pub use events::{EventBus, EventKind, HubEvent};
pub use manager::AddonManager;
