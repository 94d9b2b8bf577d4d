use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

pub const APP_DIR: &str = "muxbee";

/// On-disk layout shared by the store, the generator and the compose driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl Paths {
    pub fn new(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// XDG locations unless overridden.
    pub fn resolve(config_dir: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match config_dir {
            Some(p) => p,
            None => dirs::config_dir()
                .ok_or(Error::NoBaseDir("config"))?
                .join(APP_DIR),
        };
        let data_dir = match data_dir {
            Some(p) => p,
            None => dirs::data_dir().ok_or(Error::NoBaseDir("data"))?.join(APP_DIR),
        };
        Ok(Self::new(config_dir, data_dir))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.yaml")
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.config_dir.join("docker-compose.yml")
    }

    /// Present once the admin account has been provisioned.
    pub fn admin_marker(&self) -> PathBuf {
        self.data_dir.join(".admin_setup_done")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn synapse_config_dir(&self) -> PathBuf {
        self.config_dir.join("synapse")
    }

    pub fn synapse_data_dir(&self) -> PathBuf {
        self.data_dir.join("synapse")
    }

    pub fn element_config_dir(&self) -> PathBuf {
        self.config_dir.join("element")
    }

    pub fn caddy_config_dir(&self) -> PathBuf {
        self.config_dir.join("caddy")
    }

    /// Registration directory mounted into the homeserver.
    pub fn bridge_config_dir(&self, bridge: &str) -> PathBuf {
        self.config_dir.join("bridges").join(bridge)
    }

    /// Writable `/data` of the bridge container.
    pub fn bridge_data_dir(&self, bridge: &str) -> PathBuf {
        self.data_dir.join("bridges").join(bridge)
    }

    fn skeleton(&self) -> [PathBuf; 8] {
        [
            self.config_dir.join("synapse"),
            self.config_dir.join("element"),
            self.config_dir.join("caddy"),
            self.config_dir.join("bridges"),
            self.data_dir.join("synapse"),
            self.data_dir.join("postgres"),
            self.data_dir.join("caddy"),
            self.data_dir.join("bridges"),
        ]
    }

    pub fn ensure_skeleton(&self) -> Result<()> {
        for dir in self.skeleton() {
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skeleton_is_created_under_both_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("cfg"), tmp.path().join("data"));
        paths.ensure_skeleton().unwrap();

        for sub in ["synapse", "element", "caddy", "bridges"] {
            assert!(paths.config_dir().join(sub).is_dir(), "config/{sub}");
        }
        for sub in ["synapse", "postgres", "caddy", "bridges"] {
            assert!(paths.data_dir().join(sub).is_dir(), "data/{sub}");
        }
    }

    #[test]
    fn overrides_win_over_xdg() {
        let paths = Paths::resolve(Some("/tmp/a".into()), Some("/tmp/b".into())).unwrap();
        assert_eq!(paths.settings_file(), PathBuf::from("/tmp/a/settings.yaml"));
        assert_eq!(paths.admin_marker(), PathBuf::from("/tmp/b/.admin_setup_done"));
        assert_eq!(
            paths.bridge_config_dir("signal"),
            PathBuf::from("/tmp/a/bridges/signal")
        );
    }
}
