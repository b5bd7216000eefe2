//! Settings collaborator
//!
//! Persisted key/value settings the add-on layer reads and writes: per-add-on
//! records (`addons.<id>`), per-add-on config (`addons.config.<id>`) and the
//! localization preferences handed to add-ons at registration.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use serde_json::Value;

use hearth_ipc::schema::{Preferences, Units};

use crate::error::{Error, Result};

const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Key of the persisted record for an add-on
pub fn addon_key(package_name: &str) -> String {
    format!("addons.{}", package_name)
}

/// Key of the persisted config object for an add-on
pub fn addon_config_key(package_name: &str) -> String {
    format!("addons.config.{}", package_name)
}

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;

    /// Whether the persisted record of an add-on has `enabled: true`
    fn addon_enabled(&self, package_name: &str) -> bool {
        match self.get(&addon_key(package_name)) {
            Ok(Some(record)) => record.get("enabled").and_then(Value::as_bool) == Some(true),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Failed to read settings for {}: {}", package_name, e);
                false
            }
        }
    }

    /// Language and unit preferences, falling back to defaults
    fn preferences(&self) -> Preferences {
        let defaults = Preferences::default();
        let read = |key: &str, fallback: String| match self.get(key) {
            Ok(Some(Value::String(s))) => s,
            _ => fallback,
        };
        Preferences {
            language: read("localization.language", defaults.language),
            units: Units {
                temperature: read("localization.units.temperature", defaults.units.temperature),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, Value>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// redb store
// ─────────────────────────────────────────────────────────────────────────────

/// Settings persisted as JSON blobs in a redb database
pub struct RedbSettings {
    db: Database,
}

impl RedbSettings {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)
            .map_err(|e| Error::Settings(format!("Failed to open database: {}", e)))?;

        // Create the table up front so reads never see a missing table
        let write_txn = db.begin_write().map_err(|e| Error::Settings(e.to_string()))?;
        write_txn
            .open_table(SETTINGS_TABLE)
            .map_err(|e| Error::Settings(e.to_string()))?;
        write_txn
            .commit()
            .map_err(|e| Error::Settings(e.to_string()))?;

        tracing::info!("Settings database opened at {}", path.display());
        Ok(Self { db })
    }
}

impl SettingsStore for RedbSettings {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::Settings(e.to_string()))?;
        let table = read_txn
            .open_table(SETTINGS_TABLE)
            .map_err(|e| Error::Settings(e.to_string()))?;
        let Some(raw) = table.get(key).map_err(|e| Error::Settings(e.to_string()))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(raw.value())?))
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Settings(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(SETTINGS_TABLE)
                .map_err(|e| Error::Settings(e.to_string()))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(|e| Error::Settings(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::Settings(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Settings(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(SETTINGS_TABLE)
                .map_err(|e| Error::Settings(e.to_string()))?;
            table
                .remove(key)
                .map_err(|e| Error::Settings(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::Settings(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_redb_settings_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config").join("settings.redb");

        {
            let settings = RedbSettings::open(&path).unwrap();
            settings
                .set(&addon_key("zigbee"), json!({"enabled": true}))
                .unwrap();
            settings
                .set(&addon_config_key("zigbee"), json!({"port": "/dev/ttyUSB0"}))
                .unwrap();
        }

        let settings = RedbSettings::open(&path).unwrap();
        assert!(settings.addon_enabled("zigbee"));
        assert_eq!(
            settings.get("addons.config.zigbee").unwrap(),
            Some(json!({"port": "/dev/ttyUSB0"}))
        );

        settings.delete(&addon_key("zigbee")).unwrap();
        assert!(!settings.addon_enabled("zigbee"));
    }

    #[test]
    fn test_preferences_fall_back_to_defaults() {
        let settings = MemorySettings::new();
        settings
            .set("localization.language", json!("fr-FR"))
            .unwrap();

        let prefs = settings.preferences();
        assert_eq!(prefs.language, "fr-FR");
        assert_eq!(prefs.units.temperature, "degree celsius");
    }

    #[test]
    fn test_disabled_or_missing_records() {
        let settings = MemorySettings::new();
        assert!(!settings.addon_enabled("nothing"));
        settings
            .set(&addon_key("off"), json!({"enabled": false}))
            .unwrap();
        assert!(!settings.addon_enabled("off"));
    }
}
