//! Cgroup (Control Groups) management
//!
//! One cgroup per container under `<root>/<parent>/<id>` on the unified
//! hierarchy, or `<root>/<controller>/<parent>/<id>` per controller on v1.

use crate::error::{CorralError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CFS period used for CPU quotas, in microseconds
pub const CPU_PERIOD_US: u64 = 100_000;

/// Controllers a container cgroup lives in on a v1 host
const V1_CONTROLLERS: [&str; 4] = ["memory", "cpu", "cpuacct", "pids"];

const V2_CONTROLLERS: &str = "+cpu +memory +pids";

const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Cgroup version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CgroupVersion {
    /// Cgroup v1 (legacy)
    V1,
    /// Cgroup v2 (unified)
    V2,
}

/// Resource limits; zero in any field means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes
    pub memory_bytes: u64,
    /// CPU share in hundredths of a core (150 = 1.5 cores)
    pub cpu_units: u64,
    /// Maximum number of processes
    pub max_pids: u64,
}

impl ResourceLimits {
    /// CFS quota in microseconds per period, `None` when unlimited
    pub fn cpu_quota_us(&self) -> Option<u64> {
        (self.cpu_units > 0).then(|| self.cpu_units * CPU_PERIOD_US / 100)
    }
}

/// A point-in-time usage sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub memory_bytes: u64,
    pub cpu_seconds: f64,
    pub pid_count: u64,
}

/// The cgroup owned by one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CgroupRecord {
    pub container_id: String,
    pub path: PathBuf,
    pub limits: ResourceLimits,
}

/// Cgroup manager for container resource limits
#[derive(Debug, Clone)]
pub struct CgroupManager {
    version: CgroupVersion,
    root: PathBuf,
    parent: String,
}

impl CgroupManager {
    /// Create a manager over the hierarchy mounted at `root`
    pub fn new(root: impl Into<PathBuf>, parent: impl Into<String>) -> Self {
        let root = root.into();
        let version = Self::detect_version(&root);
        Self::with_version(root, parent, version)
    }

    pub fn with_version(
        root: impl Into<PathBuf>,
        parent: impl Into<String>,
        version: CgroupVersion,
    ) -> Self {
        Self {
            version,
            root: root.into(),
            parent: parent.into(),
        }
    }

    /// v2 when the unified hierarchy's `cgroup.controllers` is present
    pub fn detect_version(root: &Path) -> CgroupVersion {
        if root.join("cgroup.controllers").exists() {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        }
    }

    /// Get the cgroup version
    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Verify the controllers containers need are available
    pub fn check_support(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(CorralError::UnsupportedHost(format!(
                "no cgroup hierarchy mounted at {}",
                self.root.display()
            )));
        }

        let missing: Vec<&str> = match self.version {
            CgroupVersion::V2 => {
                let available = fs::read_to_string(self.root.join("cgroup.controllers"))
                    .map_err(|e| CorralError::external("read cgroup.controllers", e))?;
                let available: BTreeSet<&str> = available.split_whitespace().collect();
                ["cpu", "memory", "pids"]
                    .into_iter()
                    .filter(|c| !available.contains(c))
                    .collect()
            }
            CgroupVersion::V1 => V1_CONTROLLERS
                .into_iter()
                .filter(|c| !self.root.join(c).is_dir())
                .collect(),
        };

        if !missing.is_empty() {
            return Err(CorralError::UnsupportedHost(format!(
                "cgroup controllers unavailable: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Primary path of a container cgroup
    pub fn path(&self, container_id: &str) -> PathBuf {
        match self.version {
            CgroupVersion::V2 => self.root.join(&self.parent).join(container_id),
            CgroupVersion::V1 => self.controller_path("memory", container_id),
        }
    }

    fn controller_path(&self, controller: &str, container_id: &str) -> PathBuf {
        self.root.join(controller).join(&self.parent).join(container_id)
    }

    /// Every directory backing a container cgroup
    fn paths(&self, container_id: &str) -> Vec<PathBuf> {
        match self.version {
            CgroupVersion::V2 => vec![self.path(container_id)],
            CgroupVersion::V1 => V1_CONTROLLERS
                .iter()
                .map(|c| self.controller_path(c, container_id))
                .collect(),
        }
    }

    /// Whether any directory of the container cgroup exists
    pub fn exists(&self, container_id: &str) -> bool {
        self.paths(container_id).iter().any(|p| p.is_dir())
    }

    /// Create a cgroup for a container
    pub fn create(&self, container_id: &str) -> Result<CgroupRecord> {
        if self.version == CgroupVersion::V2 {
            self.enable_controllers(&self.root);
            let parent = self.root.join(&self.parent);
            create_cgroup_dir(&parent)?;
            self.enable_controllers(&parent);
        }

        for path in self.paths(container_id) {
            create_cgroup_dir(&path)?;
        }

        tracing::debug!(container = container_id, path = %self.path(container_id).display(), "created cgroup");
        Ok(CgroupRecord {
            container_id: container_id.to_string(),
            path: self.path(container_id),
            limits: ResourceLimits::default(),
        })
    }

    fn enable_controllers(&self, path: &Path) {
        if let Err(e) = write_cgroup_file(&path.join("cgroup.subtree_control"), V2_CONTROLLERS) {
            tracing::warn!(
                "Failed to enable cgroup controllers in {} (may already be enabled): {}",
                path.display(),
                e
            );
        }
    }

    /// Write memory, CPU and pids limits; any failed write fails the call
    pub fn apply_limits(&self, container_id: &str, limits: &ResourceLimits) -> Result<()> {
        let cpus = num_cpus::get() as u64;
        if limits.cpu_units > cpus * 100 {
            tracing::warn!(
                container = container_id,
                "CPU limit of {} units exceeds the {} cores on this host",
                limits.cpu_units,
                cpus
            );
        }

        match self.version {
            CgroupVersion::V2 => {
                let path = self.path(container_id);
                write_cgroup_file(&path.join("memory.max"), &limit_or_max(limits.memory_bytes))?;
                let quota = limits
                    .cpu_quota_us()
                    .map(|q| q.to_string())
                    .unwrap_or_else(|| "max".to_string());
                write_cgroup_file(&path.join("cpu.max"), &format!("{} {}", quota, CPU_PERIOD_US))?;
                write_cgroup_file(&path.join("pids.max"), &limit_or_max(limits.max_pids))?;
            }
            CgroupVersion::V1 => {
                let memory = self.controller_path("memory", container_id);
                let memory_limit = match limits.memory_bytes {
                    0 => "-1".to_string(),
                    bytes => bytes.to_string(),
                };
                write_cgroup_file(&memory.join("memory.limit_in_bytes"), &memory_limit)?;

                let cpu = self.controller_path("cpu", container_id);
                write_cgroup_file(&cpu.join("cpu.cfs_period_us"), &CPU_PERIOD_US.to_string())?;
                let quota = limits
                    .cpu_quota_us()
                    .map(|q| q.to_string())
                    .unwrap_or_else(|| "-1".to_string());
                write_cgroup_file(&cpu.join("cpu.cfs_quota_us"), &quota)?;

                let pids = self.controller_path("pids", container_id);
                write_cgroup_file(&pids.join("pids.max"), &limit_or_max(limits.max_pids))?;
            }
        }

        tracing::debug!(
            container = container_id,
            memory = limits.memory_bytes,
            cpu_units = limits.cpu_units,
            pids = limits.max_pids,
            "applied cgroup limits"
        );
        Ok(())
    }

    /// Add a process to the cgroup
    pub fn attach(&self, container_id: &str, pid: libc::pid_t) -> Result<()> {
        for path in self.paths(container_id) {
            write_cgroup_file(&path.join("cgroup.procs"), &pid.to_string())?;
        }
        Ok(())
    }

    /// Processes currently in the cgroup
    pub fn live_pids(&self, container_id: &str) -> Result<Vec<libc::pid_t>> {
        let mut pids = BTreeSet::new();
        for path in self.paths(container_id) {
            pids.extend(read_procs(&path)?);
        }
        Ok(pids.into_iter().collect())
    }

    /// Read memory, CPU time and process count; missing counters read as zero
    pub fn sample_usage(&self, container_id: &str) -> Result<UsageSample> {
        let path = self.path(container_id);
        if !path.is_dir() {
            return Err(CorralError::external(
                format!("cgroup {}", path.display()),
                io::Error::from_raw_os_error(libc::ENOENT),
            ));
        }

        match self.version {
            CgroupVersion::V2 => Ok(UsageSample {
                memory_bytes: read_cgroup_u64(&path.join("memory.current"))?,
                cpu_seconds: read_usage_usec(&path.join("cpu.stat"))? as f64 / 1e6,
                pid_count: read_cgroup_u64(&path.join("pids.current"))?,
            }),
            CgroupVersion::V1 => {
                let cpuacct = self.controller_path("cpuacct", container_id);
                let pids = self.controller_path("pids", container_id);
                Ok(UsageSample {
                    memory_bytes: read_cgroup_u64(&path.join("memory.usage_in_bytes"))?,
                    cpu_seconds: read_cgroup_u64(&cpuacct.join("cpuacct.usage"))? as f64 / 1e9,
                    pid_count: read_cgroup_u64(&pids.join("pids.current"))?,
                })
            }
        }
    }

    /// Remove the container cgroup, moving stray processes to the parent first.
    ///
    /// A cgroup that no longer exists is not an error.
    pub fn cleanup(&self, container_id: &str) -> Result<()> {
        let mut first_error = None;
        for path in self.paths(container_id) {
            if let Err(e) = remove_cgroup_dir(&path) {
                tracing::warn!(path = %path.display(), "cgroup cleanup failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::debug!(container = container_id, "removed cgroup");
                Ok(())
            }
        }
    }
}

fn limit_or_max(value: u64) -> String {
    if value == 0 {
        "max".to_string()
    } else {
        value.to_string()
    }
}

fn remove_cgroup_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    migrate_to_parent(path);
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
            std::thread::sleep(BUSY_RETRY_DELAY);
            migrate_to_parent(path);
            fs::remove_dir(path)
                .map_err(|e| CorralError::external(format!("remove cgroup {}", path.display()), e))
        }
        Err(e) => Err(CorralError::external(
            format!("remove cgroup {}", path.display()),
            e,
        )),
    }
}

fn migrate_to_parent(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    let pids = match read_procs(path) {
        Ok(pids) => pids,
        Err(e) => {
            tracing::warn!("Failed to list processes in {}: {}", path.display(), e);
            return;
        }
    };
    for pid in pids {
        if let Err(e) = write_cgroup_file(&parent.join("cgroup.procs"), &pid.to_string()) {
            tracing::warn!(pid, "Failed to move process out of {}: {}", path.display(), e);
        }
    }
}

fn read_procs(path: &Path) -> Result<Vec<libc::pid_t>> {
    let procs = path.join("cgroup.procs");
    let content = match fs::read_to_string(&procs) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CorralError::external(format!("read {}", procs.display()), e)),
    };
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

/// Create cgroup directory
fn create_cgroup_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| CorralError::external(format!("create cgroup {}", path.display()), e))
}

/// Write to a cgroup file
fn write_cgroup_file(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| CorralError::external(format!("open {}", path.display()), e))?;

    file.write_all(value.as_bytes())
        .map_err(|e| CorralError::external(format!("write {} to {}", value, path.display()), e))
}

/// Read a u64 from a cgroup file, zero when the file is absent
fn read_cgroup_u64(path: &Path) -> Result<u64> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(CorralError::external(format!("read {}", path.display()), e)),
    };
    parse_counter(path, content.trim())
}

fn read_usage_usec(path: &Path) -> Result<u64> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(CorralError::external(format!("read {}", path.display()), e)),
    };
    content
        .lines()
        .find_map(|line| line.strip_prefix("usage_usec "))
        .map(|value| parse_counter(path, value.trim()))
        .unwrap_or(Ok(0))
}

fn parse_counter(path: &Path, value: &str) -> Result<u64> {
    if value.is_empty() || value == "max" {
        return Ok(0);
    }
    value.parse().map_err(|_| {
        CorralError::external(
            format!("parse {}", path.display()),
            io::Error::new(io::ErrorKind::InvalidData, format!("unexpected value {:?}", value)),
        )
    })
}
