//! Profile directories under the hub's base directory

use std::path::PathBuf;

use hearth_ipc::schema;

#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub base_dir: PathBuf,
    pub addons_dir: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub media_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Installation directory of the hub itself
    pub gateway_dir: PathBuf,
}

impl UserProfile {
    pub fn new(base_dir: impl Into<PathBuf>, gateway_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            addons_dir: base_dir.join("addons"),
            config_dir: base_dir.join("config"),
            data_dir: base_dir.join("data"),
            media_dir: base_dir.join("media"),
            log_dir: base_dir.join("log"),
            gateway_dir: gateway_dir.into(),
            base_dir,
        }
    }

    /// Create every profile directory
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.base_dir,
            &self.addons_dir,
            &self.config_dir,
            &self.data_dir,
            &self.media_dir,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn addon_dir(&self, package_name: &str) -> PathBuf {
        self.addons_dir.join(package_name)
    }

    /// Private data directory of an add-on
    pub fn addon_data_dir(&self, package_name: &str) -> PathBuf {
        self.data_dir.join(package_name)
    }

    pub fn settings_db(&self) -> PathBuf {
        self.config_dir.join("settings.redb")
    }

    /// Profile as sent to add-ons at registration
    pub fn to_wire(&self) -> schema::UserProfile {
        schema::UserProfile {
            base_dir: self.base_dir.clone(),
            config_dir: self.config_dir.clone(),
            data_dir: self.data_dir.clone(),
            media_dir: self.media_dir.clone(),
            log_dir: self.log_dir.clone(),
            gateway_dir: self.gateway_dir.clone(),
            addons_dir: self.addons_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_dirs_creates_layout() {
        let dir = tempdir().unwrap();
        let profile = UserProfile::new(dir.path().join("home"), "/opt/hearth");
        profile.ensure_dirs().unwrap();

        assert!(profile.addons_dir.is_dir());
        assert!(profile.log_dir.is_dir());
        assert_eq!(
            profile.addon_data_dir("zigbee"),
            dir.path().join("home/data/zigbee")
        );
        assert_eq!(profile.addon_dir("zigbee"), profile.addons_dir.join("zigbee"));
    }
}
