//! Container configuration

use crate::error::{CorralError, Result};
use crate::filesystem::{FilesystemInfo, FilesystemRecord};
use crate::network::{NetworkInfo, NetworkRecord, PortMap};
use crate::runtime::{CgroupRecord, ResourceLimits, UsageSample};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Container names double as hostnames
const NAME_PATTERN: &str = r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,62}$";

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Resources are provisioned, no process yet
    Created,
    /// The init process is running
    Running,
    /// The init process has exited
    Stopped,
}

impl ContainerStatus {
    pub fn can_start(&self) -> bool {
        matches!(self, ContainerStatus::Created)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Stopped)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// What a caller asks `create` for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub limits: ResourceLimits,
    pub ports: Vec<PortMap>,
}

impl CreateRequest {
    pub fn new(name: &str, image: &str, command: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            command,
            ..Self::default()
        }
    }

    /// Set resource limits
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Add port mapping
    pub fn port(mut self, map: PortMap) -> Self {
        self.ports.push(map);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.image.is_empty() {
            return Err(CorralError::InvalidArgument("image must not be empty".to_string()));
        }
        if self.command.first().map_or(true, |program| program.is_empty()) {
            return Err(CorralError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Check that `name` is usable as a container name and hostname
pub fn validate_name(name: &str) -> Result<()> {
    let pattern =
        Regex::new(NAME_PATTERN).map_err(|e| CorralError::InvalidArgument(e.to_string()))?;
    if !pattern.is_match(name) {
        return Err(CorralError::InvalidArgument(format!(
            "invalid container name '{}': use 1-63 letters, digits, '_', '.' or '-'",
            name
        )));
    }
    Ok(())
}

/// Everything known about one container; this is what `state.json` holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Host PID while running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub resource_limits: ResourceLimits,
    pub filesystem: FilesystemRecord,
    pub network: NetworkRecord,
    pub cgroup: CgroupRecord,
    /// Latest monitor sample
    #[serde(skip)]
    pub last_usage: Option<UsageSample>,
}

impl ContainerRecord {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Move to `stopped`, keeping the exit code when one is known
    pub fn mark_stopped(&mut self, exit_code: Option<i32>) {
        self.status = ContainerStatus::Stopped;
        self.finished_at = Some(Utc::now());
        self.pid = None;
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
    }
}

/// Snapshot returned by `info`
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub container: ContainerRecord,
    pub usage: Option<UsageSample>,
    pub filesystem: Option<FilesystemInfo>,
    pub network: NetworkInfo,
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
