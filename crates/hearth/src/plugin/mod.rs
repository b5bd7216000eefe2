//! Plugin layer
//!
//! One `Plugin` per add-on package: it owns the child process, restarts it
//! with backoff when it crashes, routes inbound messages to proxies and
//! correlates replies. `PluginServer` accepts add-on connections and hands
//! each registered connection to its plugin.

mod host;
pub mod process;
pub(crate) mod router;
mod server;
pub mod supervisor;

pub use host::PluginHost;
pub use router::{Plugin, PluginEnv, PluginState};
pub use server::PluginServer;
pub use supervisor::{ExitDecision, RestartPolicy, Supervisor};
