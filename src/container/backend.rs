//! The seam between the lifecycle core and the host
//!
//! The core only ever talks to a [`ContainerBackend`]; [`LinuxBackend`] is the
//! one that touches the kernel.

use super::config::ContainerRecord;
use crate::config::RuntimeConfig;
use crate::error::{CorralError, Result};
use crate::filesystem::{FilesystemInfo, FilesystemManager, FilesystemRecord};
use crate::network::{NetworkInfo, NetworkManager, NetworkRecord, PortMap};
use crate::runtime::{
    CgroupManager, CgroupRecord, ContainerProcess, NamespaceManager, ProcessConfig,
    ResourceLimits, UsageSample,
};
use std::time::Duration;

pub trait ContainerBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Run every host capability check, one result per manager
    fn support_report(&self) -> Vec<(&'static str, Result<()>)>;

    /// First failing host capability check
    fn check_support(&self) -> Result<()> {
        self.support_report()
            .into_iter()
            .try_for_each(|(_, result)| result)
    }

    fn create_filesystem(&self, container_id: &str, image: &str) -> Result<FilesystemRecord>;

    fn write_resolv_conf(&self, filesystem: &FilesystemRecord) -> Result<()>;

    fn filesystem_info(&self, filesystem: &FilesystemRecord) -> Result<FilesystemInfo>;

    fn cleanup_filesystem(&self, filesystem: &FilesystemRecord) -> Result<()>;

    fn create_network(&self, container_id: &str, hostname: &str) -> Result<NetworkRecord>;

    fn add_port_map(&self, network: &mut NetworkRecord, map: PortMap) -> Result<()>;

    fn network_info(&self, network: &NetworkRecord) -> NetworkInfo;

    fn cleanup_network(&self, network: &NetworkRecord) -> Result<()>;

    /// Take back addresses and ports held by records loaded from disk
    fn restore_network(&self, networks: &[NetworkRecord]) -> Result<()>;

    fn create_cgroup(&self, container_id: &str) -> Result<CgroupRecord>;

    fn apply_limits(&self, container_id: &str, limits: &ResourceLimits) -> Result<()>;

    fn attach_cgroup(&self, container_id: &str, pid: libc::pid_t) -> Result<()>;

    fn sample_usage(&self, container_id: &str) -> Result<UsageSample>;

    fn cleanup_cgroup(&self, container_id: &str) -> Result<()>;

    /// Start the container's init process, parked until released
    fn spawn(&self, container: &ContainerRecord) -> Result<ContainerProcess>;

    /// SIGTERM, then SIGKILL once `grace` runs out; true when the kill was needed
    fn terminate(
        &self,
        container_id: &str,
        process: &mut ContainerProcess,
        grace: Duration,
    ) -> Result<bool>;
}

impl std::fmt::Debug for dyn ContainerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContainerBackend({})", self.name())
    }
}

/// Backend built from the four kernel-facing managers
#[derive(Debug)]
pub struct LinuxBackend {
    namespaces: NamespaceManager,
    cgroups: CgroupManager,
    filesystem: FilesystemManager,
    network: NetworkManager,
    dns_servers: Vec<String>,
}

impl LinuxBackend {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        Ok(Self {
            namespaces: NamespaceManager::new(),
            cgroups: CgroupManager::new(&config.cgroup_root, config.cgroup_parent.clone()),
            filesystem: FilesystemManager::from_config(config),
            network: NetworkManager::new(config)?,
            dns_servers: config.dns_servers.clone(),
        })
    }
}

impl ContainerBackend for LinuxBackend {
    fn name(&self) -> &str {
        "linux"
    }

    fn support_report(&self) -> Vec<(&'static str, Result<()>)> {
        vec![
            ("namespaces", self.namespaces.check_support()),
            ("cgroups", self.cgroups.check_support()),
            ("filesystem", self.filesystem.check_support()),
            ("network", self.network.check_support()),
        ]
    }

    fn create_filesystem(&self, container_id: &str, image: &str) -> Result<FilesystemRecord> {
        self.filesystem.create(container_id, image)
    }

    fn write_resolv_conf(&self, filesystem: &FilesystemRecord) -> Result<()> {
        self.filesystem.write_resolv_conf(filesystem, &self.dns_servers)
    }

    fn filesystem_info(&self, filesystem: &FilesystemRecord) -> Result<FilesystemInfo> {
        self.filesystem.info(filesystem)
    }

    fn cleanup_filesystem(&self, filesystem: &FilesystemRecord) -> Result<()> {
        self.filesystem.cleanup(filesystem)
    }

    fn create_network(&self, container_id: &str, hostname: &str) -> Result<NetworkRecord> {
        self.network.create(container_id, hostname)
    }

    fn add_port_map(&self, network: &mut NetworkRecord, map: PortMap) -> Result<()> {
        self.network.add_port_map(network, map)
    }

    fn network_info(&self, network: &NetworkRecord) -> NetworkInfo {
        self.network.info(network)
    }

    fn cleanup_network(&self, network: &NetworkRecord) -> Result<()> {
        self.network.cleanup(network)
    }

    fn restore_network(&self, networks: &[NetworkRecord]) -> Result<()> {
        self.network.restore(networks)
    }

    fn create_cgroup(&self, container_id: &str) -> Result<CgroupRecord> {
        self.cgroups.create(container_id)
    }

    fn apply_limits(&self, container_id: &str, limits: &ResourceLimits) -> Result<()> {
        self.cgroups.apply_limits(container_id, limits)
    }

    fn attach_cgroup(&self, container_id: &str, pid: libc::pid_t) -> Result<()> {
        self.cgroups.attach(container_id, pid)
    }

    fn sample_usage(&self, container_id: &str) -> Result<UsageSample> {
        self.cgroups.sample_usage(container_id)
    }

    fn cleanup_cgroup(&self, container_id: &str) -> Result<()> {
        self.cgroups.cleanup(container_id)
    }

    fn spawn(&self, container: &ContainerRecord) -> Result<ContainerProcess> {
        let config = ProcessConfig::new(
            container.command.clone(),
            &container.filesystem.merged_dir,
        )
        .hostname(&container.name)
        .netns(&container.network.netns_path);
        self.namespaces.create_isolated_process(&config)
    }

    fn terminate(
        &self,
        container_id: &str,
        process: &mut ContainerProcess,
        grace: Duration,
    ) -> Result<bool> {
        process
            .terminate(grace)
            .map_err(|e| CorralError::external(format!("stop container {}", container_id), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_backend_reports_every_manager() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::with_root(dir.path());
        config.cgroup_root = dir.path().join("cgroup");
        let backend = LinuxBackend::new(&config).unwrap();

        let names: Vec<&str> = backend.support_report().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["namespaces", "cgroups", "filesystem", "network"]);
        // the scratch cgroup root is not a cgroup mount
        assert!(backend.check_support().is_err());
    }

    #[test]
    fn test_linux_backend_rejects_bad_subnet() {
        let mut config = RuntimeConfig::default();
        config.subnet = "10.0.0.0/31".to_string();
        assert!(LinuxBackend::new(&config).is_err());
    }
}
