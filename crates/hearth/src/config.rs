//! Hub configuration
//!
//! Layered with figment: compiled defaults, then `hearth.toml`, then
//! `HEARTH_`-prefixed environment variables (`__` separates nested keys, e.g.
//! `HEARTH_RESTART__CEILING_MS=60000`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::plugin::supervisor::RestartPolicy;
use crate::user_profile::UserProfile;

/// Restart backoff settings, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub increment_ms: u64,
    pub ceiling_ms: u64,
    pub reset_after_ms: u64,
    /// Exit code an add-on uses to ask not to be restarted
    pub dont_restart_exit_code: i32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            increment_ms: 1000,
            ceiling_ms: 30_000,
            reset_after_ms: 60_000,
            dont_restart_exit_code: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the plugin server listens on
    pub listen: SocketAddr,
    /// Profile root (add-ons, config, data, media, log)
    pub base_dir: PathBuf,
    /// Installation directory of the hub
    pub gateway_dir: PathBuf,
    pub gateway_version: String,
    /// Add-on API version checked against legacy `moziot.api` ranges
    pub api_version: u64,
    /// Rendered into `{nodeLoader}` in exec templates
    pub exec_loader: String,
    pub restart: RestartConfig,
    pub pairing_timeout_secs: u64,
    pub removal_timeout_ms: u64,
    /// Grace period between an unload request and a forced kill
    pub unload_kill_delay_ms: u64,
    /// Extra wait after the kill for callers that unload with `wait`
    pub unload_wait_margin_ms: u64,
    /// Refuse manifest.json add-ons that ship without SHA256SUMS
    pub require_checksums: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9500)),
            base_dir: PathBuf::from("./hearth-home"),
            gateway_dir: PathBuf::from("."),
            gateway_version: env!("CARGO_PKG_VERSION").to_string(),
            api_version: 2,
            exec_loader: "node {gatewayDir}/addon-loader.js".to_string(),
            restart: RestartConfig::default(),
            pairing_timeout_secs: 60,
            removal_timeout_ms: 30_000,
            unload_kill_delay_ms: 3000,
            unload_wait_margin_ms: 500,
            require_checksums: true,
        }
    }
}

impl HubConfig {
    /// Load defaults, then the TOML file (if present), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("hearth.toml"));
        Figment::from(Serialized::defaults(HubConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("HEARTH_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile::new(&self.base_dir, &self.gateway_dir)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            increment: Duration::from_millis(self.restart.increment_ms),
            ceiling: Duration::from_millis(self.restart.ceiling_ms),
            reset_after: Duration::from_millis(self.restart.reset_after_ms),
            dont_restart_exit_code: self.restart.dont_restart_exit_code,
        }
    }

    /// Loader command with `{gatewayDir}` filled in
    pub fn loader_command(&self) -> String {
        self.exec_loader
            .replace("{gatewayDir}", &self.gateway_dir.to_string_lossy())
    }

    pub fn removal_timeout(&self) -> Duration {
        Duration::from_millis(self.removal_timeout_ms)
    }

    pub fn unload_kill_delay(&self) -> Duration {
        Duration::from_millis(self.unload_kill_delay_ms)
    }

    pub fn unload_wait_margin(&self) -> Duration {
        Duration::from_millis(self.unload_wait_margin_ms)
    }
}
