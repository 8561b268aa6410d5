//! Runtime configuration
//!
//! Every path and tunable the managers use lives here so tests can point the
//! whole runtime at a scratch directory.

use crate::error::{CorralError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the runtime root directory
pub const ROOT_ENV: &str = "CORRAL_ROOT";

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime-owned root holding `containers/` and `layers/`
    pub root_dir: PathBuf,
    /// Mount point of the host cgroup hierarchy
    pub cgroup_root: PathBuf,
    /// Name of the cgroup grouping every container
    pub cgroup_parent: String,
    /// Host bridge shared by all containers
    pub bridge_name: String,
    /// Private CIDR containers are addressed from
    pub subnet: String,
    /// Directory holding the named network namespaces
    pub netns_dir: PathBuf,
    /// Nameservers written into each container's resolv.conf
    pub dns_servers: Vec<String>,
    /// Seconds to wait after SIGTERM before SIGKILL
    pub stop_grace_secs: u64,
    /// Seconds between monitor probes
    pub monitor_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_parent: "corral".to_string(),
            bridge_name: "corral0".to_string(),
            subnet: "172.19.0.0/16".to_string(),
            netns_dir: PathBuf::from("/var/run/netns"),
            dns_servers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            stop_grace_secs: 10,
            monitor_interval_secs: 5,
        }
    }
}

fn default_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("corral")
}

impl RuntimeConfig {
    /// Create a configuration rooted at `root_dir` with every other value defaulted
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Resolve the effective configuration.
    ///
    /// Precedence, lowest first: built-in defaults, the JSON file (`file`, or
    /// `<root>/config.json` when it exists), `CORRAL_ROOT`, then `root`.
    pub fn load(file: Option<&Path>, root: Option<&Path>) -> Result<Self> {
        let env_root = std::env::var_os(ROOT_ENV).map(PathBuf::from);
        let probe_root = root
            .map(Path::to_path_buf)
            .or_else(|| env_root.clone())
            .unwrap_or_else(default_root);

        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => {
                let implicit = probe_root.join("config.json");
                if implicit.exists() {
                    Self::from_file(&implicit)?
                } else {
                    Self::default()
                }
            }
        };

        if let Some(env_root) = env_root {
            config.root_dir = env_root;
        }
        if let Some(root) = root {
            config.root_dir = root.to_path_buf();
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CorralError::InvalidArgument(format!("cannot read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            CorralError::InvalidArgument(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Check the values the managers cannot recover from at runtime
    pub fn validate(&self) -> Result<()> {
        if self.bridge_name.is_empty() || self.bridge_name.len() > 15 {
            return Err(CorralError::InvalidArgument(format!(
                "bridge name '{}' must be 1-15 bytes",
                self.bridge_name
            )));
        }
        self.subnet
            .parse::<ipnetwork::Ipv4Network>()
            .map_err(|e| CorralError::InvalidArgument(format!("subnet {}: {}", self.subnet, e)))?;
        if self.monitor_interval_secs == 0 {
            return Err(CorralError::InvalidArgument(
                "monitor interval must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding per-container scratch areas
    pub fn containers_dir(&self) -> PathBuf {
        self.root_dir.join("containers")
    }

    /// Directory holding shared image layers
    pub fn layers_dir(&self) -> PathBuf {
        self.root_dir.join("layers")
    }

    /// Scratch area for one container
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    /// File every lifecycle call locks
    pub fn lock_file(&self) -> PathBuf {
        self.root_dir.join("lock")
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bridge_name, "corral0");
        assert_eq!(config.stop_grace(), Duration::from_secs(10));
        assert_eq!(config.monitor_interval(), Duration::from_secs(5));
        assert!(config.root_dir.ends_with("corral"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_layout_paths() {
        let config = RuntimeConfig::with_root("/srv/corral");
        assert_eq!(config.containers_dir(), PathBuf::from("/srv/corral/containers"));
        assert_eq!(config.layers_dir(), PathBuf::from("/srv/corral/layers"));
        assert_eq!(
            config.container_dir("real-1"),
            PathBuf::from("/srv/corral/containers/real-1")
        );
        assert_eq!(config.lock_file(), PathBuf::from("/srv/corral/lock"));
    }

    #[test]
    fn test_load_from_file_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.json");
        std::fs::write(&path, r#"{"bridge_name": "testbr0", "stop_grace_secs": 3}"#).unwrap();

        let config = RuntimeConfig::load(Some(&path), Some(dir.path())).unwrap();
        assert_eq!(config.bridge_name, "testbr0");
        assert_eq!(config.stop_grace_secs, 3);
        assert_eq!(config.subnet, "172.19.0.0/16");
        assert_eq!(config.root_dir, dir.path());
    }

    #[test]
    fn test_implicit_config_in_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"subnet": "10.44.0.0/24"}"#).unwrap();

        let config = RuntimeConfig::load(None, Some(dir.path())).unwrap();
        assert_eq!(config.subnet, "10.44.0.0/24");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RuntimeConfig::default();
        config.bridge_name = "a-very-long-bridge-name".to_string();
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.subnet = "not-a-cidr".to_string();
        assert_eq!(config.validate().unwrap_err().kind(), "invalid_argument");
    }
}
