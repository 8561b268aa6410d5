//! In-memory backend for lifecycle tests
//!
//! Records every call and can be told to fail at any step. Processes are real
//! host children started without isolation.

use super::backend::ContainerBackend;
use super::config::{ContainerRecord, ContainerStatus};
use crate::error::{CorralError, Result};
use crate::filesystem::{FilesystemInfo, FilesystemRecord};
use crate::network::{NetworkInfo, NetworkRecord, PortMap, Protocol};
use crate::runtime::{CgroupRecord, ContainerProcess, ResourceLimits, UsageSample};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<String>,
    failing: BTreeSet<&'static str>,
    next_host: u8,
    ports: HashMap<(Protocol, u16), String>,
    cgroups: BTreeSet<String>,
}

#[derive(Debug)]
pub struct MockBackend {
    root: PathBuf,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(MockState {
                next_host: 2,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Make every later call to `step` fail
    pub fn fail_at(&self, step: &'static str) {
        self.state().failing.insert(step);
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Steps called so far, without their arguments
    pub fn steps(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| c.split(':').next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn has_cgroup(&self, container_id: &str) -> bool {
        self.state().cgroups.contains(container_id)
    }

    pub fn reserved_ports(&self) -> usize {
        self.state().ports.len()
    }

    fn call(&self, step: &'static str, arg: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("{}:{}", step, arg));
        if state.failing.contains(step) {
            return Err(CorralError::external(
                format!("mock {}", step),
                std::io::Error::from_raw_os_error(libc::EIO),
            ));
        }
        Ok(())
    }
}

impl ContainerBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn support_report(&self) -> Vec<(&'static str, Result<()>)> {
        vec![("mock", self.call("check_support", ""))]
    }

    fn create_filesystem(&self, container_id: &str, image: &str) -> Result<FilesystemRecord> {
        self.call("create_filesystem", container_id)?;
        let dir = self.root.join(container_id);
        Ok(FilesystemRecord {
            container_id: container_id.to_string(),
            lower_dirs: vec![self.root.join("layers").join(image)],
            upper_dir: dir.join("upper"),
            work_dir: dir.join("work"),
            merged_dir: dir.join("rootfs"),
        })
    }

    fn write_resolv_conf(&self, filesystem: &FilesystemRecord) -> Result<()> {
        self.call("write_resolv_conf", &filesystem.container_id)
    }

    fn filesystem_info(&self, filesystem: &FilesystemRecord) -> Result<FilesystemInfo> {
        self.call("filesystem_info", &filesystem.container_id)?;
        Ok(FilesystemInfo {
            layer_count: filesystem.lower_dirs.len(),
            upper_size_bytes: 0,
            inode_count: 0,
        })
    }

    fn cleanup_filesystem(&self, filesystem: &FilesystemRecord) -> Result<()> {
        self.call("cleanup_filesystem", &filesystem.container_id)
    }

    fn create_network(&self, container_id: &str, hostname: &str) -> Result<NetworkRecord> {
        self.call("create_network", container_id)?;
        let host = {
            let mut state = self.state();
            let host = state.next_host;
            state.next_host += 1;
            host
        };
        Ok(NetworkRecord {
            container_id: container_id.to_string(),
            host_veth: format!("vh{}", container_id),
            container_veth: format!("vc{}", container_id),
            bridge: "mock0".to_string(),
            container_ip: Ipv4Addr::new(10, 99, 0, host),
            gateway_ip: Ipv4Addr::new(10, 99, 0, 1),
            prefix_len: 24,
            hostname: hostname.to_string(),
            netns_path: self.root.join("netns").join(container_id),
            port_maps: Vec::new(),
        })
    }

    fn add_port_map(&self, network: &mut NetworkRecord, map: PortMap) -> Result<()> {
        self.call("add_port_map", &network.container_id)?;
        let mut state = self.state();
        let key = (map.protocol, map.host_port);
        if state.ports.contains_key(&key) {
            return Err(CorralError::ResourceExhaustion(format!(
                "host port {} taken",
                map.host_port
            )));
        }
        state.ports.insert(key, network.container_id.clone());
        network.port_maps.push(map);
        Ok(())
    }

    fn network_info(&self, network: &NetworkRecord) -> NetworkInfo {
        NetworkInfo {
            ip: network.container_ip,
            gateway: network.gateway_ip,
            host_veth: network.host_veth.clone(),
            container_veth: network.container_veth.clone(),
            port_maps: network.port_maps.clone(),
        }
    }

    fn cleanup_network(&self, network: &NetworkRecord) -> Result<()> {
        self.call("cleanup_network", &network.container_id)?;
        self.state()
            .ports
            .retain(|_, owner| owner != &network.container_id);
        Ok(())
    }

    fn restore_network(&self, networks: &[NetworkRecord]) -> Result<()> {
        self.call("restore_network", &networks.len().to_string())?;
        let mut state = self.state();
        state.ports.clear();
        for network in networks {
            for map in &network.port_maps {
                state
                    .ports
                    .insert((map.protocol, map.host_port), network.container_id.clone());
            }
        }
        Ok(())
    }

    fn create_cgroup(&self, container_id: &str) -> Result<CgroupRecord> {
        self.call("create_cgroup", container_id)?;
        self.state().cgroups.insert(container_id.to_string());
        Ok(CgroupRecord {
            container_id: container_id.to_string(),
            path: self.root.join("cgroup").join(container_id),
            limits: ResourceLimits::default(),
        })
    }

    fn apply_limits(&self, container_id: &str, _limits: &ResourceLimits) -> Result<()> {
        self.call("apply_limits", container_id)
    }

    fn attach_cgroup(&self, container_id: &str, pid: libc::pid_t) -> Result<()> {
        self.call("attach_cgroup", &format!("{}:{}", container_id, pid))
    }

    fn sample_usage(&self, container_id: &str) -> Result<UsageSample> {
        self.call("sample_usage", container_id)?;
        Ok(UsageSample {
            memory_bytes: 4096,
            cpu_seconds: 0.25,
            pid_count: 1,
        })
    }

    fn cleanup_cgroup(&self, container_id: &str) -> Result<()> {
        self.call("cleanup_cgroup", container_id)?;
        self.state().cgroups.remove(container_id);
        Ok(())
    }

    fn spawn(&self, container: &ContainerRecord) -> Result<ContainerProcess> {
        self.call("spawn", &container.id)?;
        let child = Command::new(&container.command[0])
            .args(&container.command[1..])
            .spawn()
            .map_err(|e| CorralError::external("mock spawn", e))?;
        Ok(ContainerProcess::from_child(child))
    }

    fn terminate(
        &self,
        container_id: &str,
        process: &mut ContainerProcess,
        grace: Duration,
    ) -> Result<bool> {
        self.call("terminate", container_id)?;
        process
            .terminate(grace)
            .map_err(|e| CorralError::external("mock terminate", e))
    }
}

/// A created container record with placeholder resources
pub fn sample_record(id: &str, name: &str) -> ContainerRecord {
    let backend = MockBackend::new("/tmp/corral-mock");
    ContainerRecord {
        id: id.to_string(),
        name: name.to_string(),
        image: "alpine".to_string(),
        command: vec!["sleep".to_string(), "30".to_string()],
        status: ContainerStatus::Created,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
        pid: None,
        exit_code: None,
        resource_limits: ResourceLimits::default(),
        filesystem: backend.create_filesystem(id, "alpine").unwrap(),
        network: backend.create_network(id, name).unwrap(),
        cgroup: backend.create_cgroup(id).unwrap(),
        last_usage: None,
    }
}
