//! Add-on lifecycle: load, unload, install, uninstall, enable, disable

use std::path::Path;

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::addon::manifest::{self, ManifestContext};
use crate::addon::package::{self, PACKAGE_DIR};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::plugin::PluginHost;
use crate::settings::{addon_config_key, addon_key};

use super::AddonManager;

impl AddonManager {
    fn manifest_context(&self) -> ManifestContext<'_> {
        ManifestContext {
            gateway_version: &self.config.gateway_version,
            api_version: self.config.api_version,
            require_checksums: self.config.require_checksums,
        }
    }

    /// Validate an installed add-on, persist its merged settings and launch
    /// it if enabled. A disabled add-on is not an error.
    pub async fn load_addon(&self, package: &str) -> Result<()> {
        self.finish_pending_unload(package).await;

        let dir = self.profile.addon_dir(package);
        let loaded = manifest::load_manifest(&dir, package, &self.manifest_context())?;
        let mut record = loaded.record;

        {
            let mut installed = self.installed.write();
            if !installed.iter().any(|p| p == package) {
                installed.push(package.to_string());
            }
        }

        let key = addon_key(package);
        if let Some(saved) = self.settings.get(&key)? {
            let enabled = saved
                .get("enabled")
                .and_then(Value::as_bool)
                .or_else(|| saved.pointer("/moziot/enabled").and_then(Value::as_bool));
            if let Some(enabled) = enabled {
                record.enabled = enabled;
            }
        }
        self.settings.set(&key, serde_json::to_value(&record)?)?;

        let config_key = addon_config_key(package);
        if self.settings.get(&config_key)?.is_none() {
            self.settings.set(&config_key, loaded.default_config)?;
        }

        if !record.enabled {
            info!("Add-on {} is disabled, not loading", package);
            return Ok(());
        }
        if !record.has_process() {
            debug!("Add-on {} has no process to run", package);
            return Ok(());
        }

        std::fs::create_dir_all(self.profile.addon_data_dir(package))?;
        let server = self.require_server()?;
        server.load_plugin(&dir, package, &record.exec)?;
        info!("Loaded add-on {}", package);
        self.events.publish(EventKind::AddonLoaded {
            package_name: package.to_string(),
        });
        Ok(())
    }

    /// Wait out an unload that is still tearing the package down, so a reload
    /// never adopts a process that is about to be killed.
    async fn finish_pending_unload(&self, package: &str) {
        let tasks = self.kill_tasks.lock().remove(package).unwrap_or_default();
        for task in tasks {
            debug!("Waiting for pending unload of {}", package);
            if let Err(e) = task.await {
                error!("Unload task for {} failed: {}", package, e);
            }
        }
    }

    /// Unload an add-on's components, then kill its process after the grace
    /// delay and drop its devices. With `wait` this returns only after the
    /// kill and a further safety margin.
    pub async fn unload_addon(&self, package: &str, wait: bool) -> Result<()> {
        self.finish_pending_unload(package).await;

        let Some(plugin) = self.server().and_then(|s| s.get_plugin(package)) else {
            debug!("Add-on {} is not loaded", package);
            return Ok(());
        };

        let adapter_ids: Vec<String> = self
            .get_adapters_by_package(package)
            .iter()
            .map(|a| a.id().to_string())
            .collect();
        for id in &adapter_ids {
            self.adapters.remove(id);
        }
        self.notifiers.retain(|_, n| n.package_name() != package);
        self.api_handlers.remove(package);

        let kill_delay = self.config.unload_kill_delay();
        let weak = self.weak_self.clone();
        let package_name = package.to_string();
        let task = tokio::spawn(async move {
            if tokio::time::timeout(kill_delay, plugin.unload_components())
                .await
                .is_err()
            {
                warn!("Add-on {} did not confirm its unload in time", package_name);
            }

            let pid = plugin.pid();
            tokio::time::sleep(kill_delay).await;
            // A reload in the meantime owns a new process; leave it alone.
            if plugin.pid() == pid {
                if plugin.is_process_alive() {
                    info!("Killing add-on {}", package_name);
                }
                plugin.kill();
            }
            let Some(manager) = weak.upgrade() else {
                return;
            };
            for device in manager.get_things() {
                if adapter_ids.iter().any(|id| id == device.adapter_id()) {
                    manager.handle_device_removed(device);
                }
            }
            manager.events.publish(EventKind::AddonUnloaded {
                package_name,
            });
        });

        if wait {
            if let Err(e) = task.await {
                error!("Unload task for {} failed: {}", package, e);
            }
            tokio::time::sleep(self.config.unload_wait_margin()).await;
        } else {
            self.kill_tasks
                .lock()
                .entry(package.to_string())
                .or_default()
                .push(task);
        }
        Ok(())
    }

    /// Validate and load every add-on directory, in name order. One add-on
    /// failing does not stop the others.
    pub async fn load_addons(&self) -> Result<()> {
        let addons_dir = &self.profile.addons_dir;
        if !addons_dir.is_dir() {
            return Ok(());
        }
        let mut packages = Vec::new();
        for entry in std::fs::read_dir(addons_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                packages.push(name);
            }
        }
        packages.sort();

        for package in packages {
            if let Err(e) = self.load_addon(&package).await {
                error!("Failed to load add-on {}: {}", package, e);
            }
        }
        Ok(())
    }

    /// Unload everything in reverse load order and wait for pending kills
    pub async fn unload_addons(&self) {
        let installed = self.installed_addons();
        for package in installed.iter().rev() {
            if let Err(e) = self.unload_addon(package, false).await {
                error!("Failed to unload add-on {}: {}", package, e);
            }
        }
        let tasks: Vec<_> = std::mem::take(&mut *self.kill_tasks.lock())
            .into_values()
            .flatten()
            .collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!("Unload task failed: {}", e);
            }
        }
        if let Some(server) = self.server() {
            server.shutdown();
        }
    }

    /// Download a package, check its SHA-256 and install it
    pub async fn install_addon_from_url(
        &self,
        package: &str,
        url: &str,
        checksum: &str,
        enable: bool,
    ) -> Result<()> {
        let staging = tempfile::tempdir()?;
        let tarball = staging.path().join(format!("{}.tgz", package));
        self.fetcher.fetch(url, &tarball).await?;
        package::verify_sha256(&tarball, checksum)?;
        self.install_addon(package, &tarball, enable).await
    }

    /// Install from a local tarball. Anything copied is removed again if the
    /// add-on then fails to load.
    pub async fn install_addon(&self, package: &str, tarball: &Path, enable: bool) -> Result<()> {
        let staging = tempfile::tempdir()?;
        let source = tarball.to_path_buf();
        let target = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || package::extract_tar_gz(&source, &target))
            .await
            .map_err(|e| Error::Package(format!("extraction task failed: {}", e)))??;

        let extracted = staging.path().join(PACKAGE_DIR);
        if !extracted.is_dir() {
            return Err(Error::Package(format!(
                "Package for {} has no {}/ directory",
                package, PACKAGE_DIR
            )));
        }

        let dest = self.profile.addon_dir(package);
        if dest.exists() {
            self.uninstall_addon(package, true, false).await?;
        }

        if let Err(e) = package::copy_dir_all(&extracted, &dest) {
            discard_install(&dest);
            return Err(e);
        }

        if enable {
            self.set_enabled_flag(package, true)?;
        }

        if let Err(e) = self.load_addon(package).await {
            warn!("Installed add-on {} failed to load: {}", package, e);
            discard_install(&dest);
            self.installed.write().retain(|p| p != package);
            return Err(e);
        }
        info!("Installed add-on {}", package);
        Ok(())
    }

    /// Unload and delete an add-on. With `disable` its settings are dropped
    /// too.
    pub async fn uninstall_addon(&self, package: &str, wait: bool, disable: bool) -> Result<()> {
        self.unload_addon(package, wait).await?;

        let dir = self.profile.addon_dir(package);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        if disable {
            self.settings.delete(&addon_key(package))?;
            self.settings.delete(&addon_config_key(package))?;
        }
        self.installed.write().retain(|p| p != package);
        self.unregister_plugin(package);
        info!("Uninstalled add-on {}", package);
        Ok(())
    }

    pub async fn enable_addon(&self, package: &str) -> Result<()> {
        self.set_enabled_flag(package, true)?;
        self.load_addon(package).await
    }

    pub async fn disable_addon(&self, package: &str, wait: bool) -> Result<()> {
        self.set_enabled_flag(package, false)?;
        self.unload_addon(package, wait).await
    }

    fn set_enabled_flag(&self, package: &str, enabled: bool) -> Result<()> {
        let key = addon_key(package);
        let mut record = match self.settings.get(&key)? {
            Some(Value::Object(record)) => record,
            _ => serde_json::Map::new(),
        };
        record.insert("enabled".to_string(), json!(enabled));
        self.settings.set(&key, Value::Object(record))
    }
}

/// Remove a partially installed add-on directory
fn discard_install(dest: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dest) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("Failed to remove {}: {}", dest.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addon::FileFetcher;
    use crate::addon::checksum::{self, SUMS_FILE};
    use crate::addon::package::tests::build_tarball;
    use crate::config::HubConfig;
    use crate::settings::{MemorySettings, SettingsStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn manifest(id: &str) -> Vec<u8> {
        manifest_with(id, false)
    }

    fn manifest_with(id: &str, enabled: bool) -> Vec<u8> {
        manifest_exec(id, "false", enabled)
    }

    fn manifest_exec(id: &str, exec: &str, enabled: bool) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "author": "Hearth",
            "description": "Test",
            "gateway_specific_settings": {
                "webthings": {"primary_type": "adapter", "exec": exec, "enabled": enabled},
            },
            "homepage_url": "https://example.com",
            "id": id,
            "license": "MPL-2.0",
            "manifest_version": 1,
            "name": id,
            "version": "0.1.0",
            "options": {"default": {"interval": 5}},
        }))
        .unwrap()
    }

    async fn started_manager(base: &TempDir) -> (Arc<AddonManager>, Arc<MemorySettings>) {
        let config = HubConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            base_dir: base.path().to_path_buf(),
            require_checksums: false,
            unload_kill_delay_ms: 20,
            unload_wait_margin_ms: 5,
            ..HubConfig::default()
        };
        let settings = Arc::new(MemorySettings::new());
        let manager = AddonManager::with_fetcher(config, settings.clone(), Arc::new(FileFetcher));
        manager.profile().ensure_dirs().unwrap();
        manager.start().await.unwrap();
        (manager, settings)
    }

    fn install_tree(manager: &AddonManager, id: &str, files: &[(&str, &[u8])]) {
        let dir = manager.profile().addon_dir(id);
        std::fs::create_dir_all(&dir).unwrap();
        for (name, contents) in files {
            std::fs::write(dir.join(name), contents).unwrap();
        }
    }

    #[tokio::test]
    async fn test_disabled_addon_persists_record_without_spawning() {
        let base = tempdir().unwrap();
        let (manager, settings) = started_manager(&base).await;
        install_tree(&manager, "quiet", &[("manifest.json", &manifest("quiet"))]);

        manager.load_addon("quiet").await.unwrap();
        let record = settings.get("addons.quiet").unwrap().unwrap();
        assert_eq!(record["enabled"], json!(false));
        assert_eq!(
            settings.get("addons.config.quiet").unwrap(),
            Some(json!({"interval": 5}))
        );
        assert!(manager.server().unwrap().get_plugin("quiet").is_none());
        assert_eq!(manager.installed_addons(), vec!["quiet".to_string()]);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_blocks_load() {
        let base = tempdir().unwrap();
        let (manager, settings) = started_manager(&base).await;
        let legacy = serde_json::to_vec(&json!({
            "name": "x",
            "display_name": "X",
            "description": "checksum test",
            "version": "1.0.0",
            "files": ["index.js", "SHA256SUMS"],
            "moziot": {"api": {"min": 1, "max": 2}, "exec": "false", "enabled": true},
        }))
        .unwrap();
        let sums = format!("{}  index.js\n", "a".repeat(64));
        install_tree(
            &manager,
            "x",
            &[
                ("package.json", &legacy),
                ("index.js", b"module.exports = {}"),
                (SUMS_FILE, sums.as_bytes()),
            ],
        );

        let err = manager.load_addon("x").await.unwrap_err();
        assert!(err.to_string().contains("Checksum failed for file index.js"));
        assert!(manager.server().unwrap().get_plugin("x").is_none());
        assert!(settings.get("addons.x").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_saved_enabled_flag_wins_over_manifest() {
        let base = tempdir().unwrap();
        let (manager, settings) = started_manager(&base).await;
        install_tree(&manager, "quiet", &[("manifest.json", &manifest_with("quiet", true))]);
        settings
            .set("addons.quiet", json!({"moziot": {"enabled": false}}))
            .unwrap();
        manager.load_addon("quiet").await.unwrap();
        assert_eq!(settings.get("addons.quiet").unwrap().unwrap()["enabled"], json!(false));
        assert!(manager.server().unwrap().get_plugin("quiet").is_none());
    }

    #[tokio::test]
    async fn test_install_from_url_and_uninstall() {
        let base = tempdir().unwrap();
        let (manager, settings) = started_manager(&base).await;

        let work = tempdir().unwrap();
        let tarball = work.path().join("quiet.tgz");
        build_tarball(&tarball, &[("manifest.json", &manifest("quiet"))]);
        let digest = checksum::hash_file(&tarball).unwrap();

        let bad = manager
            .install_addon_from_url("quiet", tarball.to_str().unwrap(), &"0".repeat(64), false)
            .await;
        assert!(matches!(bad, Err(Error::Package(_))));
        assert!(!manager.profile().addon_dir("quiet").exists());

        manager
            .install_addon_from_url("quiet", tarball.to_str().unwrap(), &digest, false)
            .await
            .unwrap();
        assert!(manager.profile().addon_dir("quiet").join("manifest.json").is_file());

        manager.uninstall_addon("quiet", true, true).await.unwrap();
        assert!(!manager.profile().addon_dir("quiet").exists());
        assert!(settings.get("addons.quiet").unwrap().is_none());
        assert!(manager.installed_addons().is_empty());
    }

    #[tokio::test]
    async fn test_failed_install_rolls_back() {
        let base = tempdir().unwrap();
        let (manager, _) = started_manager(&base).await;
        let work = tempdir().unwrap();
        let tarball = work.path().join("broken.tgz");
        build_tarball(&tarball, &[("manifest.json", &manifest("someone-else"))]);

        assert!(manager.install_addon("broken", &tarball, true).await.is_err());
        assert!(!manager.profile().addon_dir("broken").exists());
        assert!(manager.installed_addons().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reenable_during_unload_gets_a_fresh_process() {
        let base = tempdir().unwrap();
        let (manager, _) = started_manager(&base).await;
        install_tree(
            &manager,
            "sleeper",
            &[("manifest.json", &manifest_exec("sleeper", "sleep 30", true))],
        );

        manager.load_addon("sleeper").await.unwrap();
        let plugin = manager.server().unwrap().get_plugin("sleeper").unwrap();
        let first_pid = plugin.pid();
        assert!(plugin.is_process_alive());

        manager.disable_addon("sleeper", false).await.unwrap();
        manager.enable_addon("sleeper").await.unwrap();

        // Well past the unload's kill delay
        tokio::time::sleep(Duration::from_millis(200)).await;
        let plugin = manager.server().unwrap().get_plugin("sleeper").unwrap();
        assert!(plugin.is_process_alive());
        assert_ne!(plugin.pid(), first_pid);

        manager.unload_addons().await;
        assert!(!plugin.is_process_alive());
    }

    #[test]
    fn test_discard_install_removes_partial_copy() {
        let base = tempdir().unwrap();
        let dest = base.path().join("half");
        std::fs::create_dir_all(dest.join("lib")).unwrap();
        std::fs::write(dest.join("lib/index.js"), b"partial").unwrap();

        discard_install(&dest);
        assert!(!dest.exists());
        // Nothing to remove is not an error worth reporting.
        discard_install(&dest);
    }

    #[tokio::test]
    async fn test_load_addons_skips_failures() {
        let base = tempdir().unwrap();
        let (manager, _) = started_manager(&base).await;
        install_tree(&manager, "a-broken", &[("manifest.json", b"{ not json")]);
        install_tree(&manager, "b-quiet", &[("manifest.json", &manifest("b-quiet"))]);
        manager.load_addons().await.unwrap();
        assert_eq!(manager.installed_addons(), vec!["b-quiet".to_string()]);
    }
}
