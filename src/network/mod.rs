//! Container networking
//!
//! Every container sits in its own network namespace, joined to one host
//! bridge through a veth pair. Addresses come from a single private subnet;
//! port maps and outbound NAT are iptables rules on the host.

pub mod bridge;
pub mod ipam;
pub mod nat;
pub mod netlink;
pub mod netns;

use crate::config::RuntimeConfig;
use crate::error::{CorralError, Result};
use bridge::Bridge;
use ipam::IpAllocator;
use ipnetwork::Ipv4Network;
use nat::Iptables;
use netlink::NetlinkHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

/// Transport protocol of a port map
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(CorralError::InvalidArgument(format!(
                "unknown protocol '{}'",
                other
            ))),
        }
    }
}

/// Host port forwarded to a container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
    /// Host address to match; unspecified matches every local address
    pub host_ip: Ipv4Addr,
}

impl PortMap {
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Tcp,
            host_ip: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl std::fmt::Display for PortMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.host_ip.is_unspecified() {
            write!(f, "{}:", self.host_ip)?;
        }
        write!(
            f,
            "{}:{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

impl FromStr for PortMap {
    type Err = CorralError;

    /// `[HOST_IP:]HOST_PORT:CONTAINER_PORT[/PROTOCOL]`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CorralError::InvalidArgument(format!("invalid port map '{}'", s));
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, protocol)) => (ports, protocol.parse()?),
            None => (s, Protocol::Tcp),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [host, container] => (Ipv4Addr::UNSPECIFIED, *host, *container),
            [ip, host, container] => (ip.parse().map_err(|_| invalid())?, *host, *container),
            _ => return Err(invalid()),
        };

        let port = |value: &str| match value.parse::<u16>() {
            Ok(0) | Err(_) => Err(invalid()),
            Ok(port) => Ok(port),
        };

        Ok(Self {
            host_port: port(host_port)?,
            container_port: port(container_port)?,
            protocol,
            host_ip,
        })
    }
}

/// The network plumbing owned by one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub container_id: String,
    pub host_veth: String,
    pub container_veth: String,
    pub bridge: String,
    pub container_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub hostname: String,
    pub netns_path: PathBuf,
    pub port_maps: Vec<PortMap>,
}

/// Network details reported by `info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub host_veth: String,
    pub container_veth: String,
    pub port_maps: Vec<PortMap>,
}

#[derive(Debug)]
struct NetworkState {
    allocator: IpAllocator,
    /// Host port reservations and the container holding each
    ports: BTreeMap<(Protocol, u16), String>,
    bridge_index: Option<u32>,
}

impl NetworkState {
    fn reserve_port(&mut self, container_id: &str, map: &PortMap) -> Result<()> {
        let key = (map.protocol, map.host_port);
        if let Some(owner) = self.ports.get(&key) {
            return Err(CorralError::ResourceExhaustion(format!(
                "host port {}/{} is already mapped by {}",
                map.host_port, map.protocol, owner
            )));
        }
        self.ports.insert(key, container_id.to_string());
        Ok(())
    }

    fn release_port(&mut self, container_id: &str, map: &PortMap) {
        let key = (map.protocol, map.host_port);
        if self.ports.get(&key).map(String::as_str) == Some(container_id) {
            self.ports.remove(&key);
        }
    }
}

/// Network manager
#[derive(Debug)]
pub struct NetworkManager {
    bridge: Bridge,
    netns_dir: PathBuf,
    proc_sys: PathBuf,
    iptables: Iptables,
    state: Mutex<NetworkState>,
}

impl NetworkManager {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let allocator = IpAllocator::new(&config.subnet)?;
        let address = Ipv4Network::new(allocator.gateway(), allocator.prefix())
            .map_err(|e| CorralError::InvalidArgument(e.to_string()))?;

        Ok(Self {
            bridge: Bridge {
                name: config.bridge_name.clone(),
                address,
                subnet: allocator.network(),
            },
            netns_dir: config.netns_dir.clone(),
            proc_sys: PathBuf::from("/proc/sys"),
            iptables: Iptables::default(),
            state: Mutex::new(NetworkState {
                allocator,
                ports: BTreeMap::new(),
                bridge_index: None,
            }),
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, NetworkState>> {
        self.state
            .lock()
            .map_err(|_| CorralError::Lock("Failed to acquire network state lock".to_string()))
    }

    /// Verify netlink and iptables are usable
    pub fn check_support(&self) -> Result<()> {
        self.iptables.check_support()?;
        NetlinkHandle::new().map_err(|e| {
            CorralError::UnsupportedHost(format!("rtnetlink is unavailable: {}", e))
        })?;
        Ok(())
    }

    /// Path a container's network namespace is pinned at
    pub fn netns_path(&self, container_id: &str) -> PathBuf {
        self.netns_dir.join(container_id)
    }

    /// Rebuild address and host port reservations from exactly `records`,
    /// dropping whatever containers removed elsewhere still held
    pub fn restore<'a>(&self, records: impl IntoIterator<Item = &'a NetworkRecord>) -> Result<()> {
        let mut state = self.state()?;
        state.allocator.reset();
        state.ports.clear();
        for record in records {
            if let Err(e) = state.allocator.reserve(record.container_ip) {
                tracing::warn!(container = %record.container_id, "Failed to restore address: {}", e);
            }
            for map in &record.port_maps {
                if let Err(e) = state.reserve_port(&record.container_id, map) {
                    tracing::warn!(container = %record.container_id, "Failed to restore port map: {}", e);
                }
            }
        }
        Ok(())
    }

    fn bridge_index(&self, netlink: &mut NetlinkHandle) -> Result<u32> {
        let mut state = self.state()?;
        if let Some(index) = state.bridge_index {
            return Ok(index);
        }
        let index = self.bridge.ensure(netlink, &self.iptables, &self.proc_sys)?;
        state.bridge_index = Some(index);
        Ok(index)
    }

    /// Give `container_id` an address, a namespace and a veth pair on the bridge.
    ///
    /// A failure part way through removes whatever was set up.
    pub fn create(&self, container_id: &str, hostname: &str) -> Result<NetworkRecord> {
        let (host_veth, container_veth) = bridge::veth_names(container_id);
        let (container_ip, gateway_ip, prefix_len) = {
            let mut state = self.state()?;
            let ip = state.allocator.allocate()?;
            (ip, state.allocator.gateway(), state.allocator.prefix())
        };

        let record = NetworkRecord {
            container_id: container_id.to_string(),
            host_veth,
            container_veth,
            bridge: self.bridge.name.clone(),
            container_ip,
            gateway_ip,
            prefix_len,
            hostname: hostname.to_string(),
            netns_path: self.netns_path(container_id),
            port_maps: Vec::new(),
        };

        if let Err(e) = self.plumb(&record) {
            if let Err(undo) = self.cleanup(&record) {
                tracing::warn!(container = container_id, "Failed to undo network setup: {}", undo);
            }
            return Err(e);
        }

        tracing::debug!(
            container = container_id,
            ip = %record.container_ip,
            veth = %record.host_veth,
            "network ready"
        );
        Ok(record)
    }

    fn plumb(&self, record: &NetworkRecord) -> Result<()> {
        let mut netlink = NetlinkHandle::new()?;
        let bridge_index = self.bridge_index(&mut netlink)?;

        netns::create(&record.netns_path)?;

        let host_index = netlink.create_veth(&record.host_veth, &record.container_veth)?;
        let peer_index = netlink.require_ifindex(&record.container_veth)?;
        netlink.set_mac(peer_index, bridge::generate_mac_address())?;
        let netns_file = File::open(&record.netns_path).map_err(|e| {
            CorralError::external(format!("open {}", record.netns_path.display()), e)
        })?;
        netlink.move_to_netns(peer_index, netns_file.as_raw_fd())?;
        netlink.set_master(host_index, bridge_index)?;
        netlink.set_link_up(host_index)?;

        let address = Ipv4Network::new(record.container_ip, record.prefix_len)
            .map_err(|e| CorralError::InvalidArgument(e.to_string()))?;
        let gateway = record.gateway_ip;
        let veth = record.container_veth.as_str();
        netns::run_in(&record.netns_path, move || {
            let mut netlink = NetlinkHandle::new()?;
            if let Some(lo) = netlink.ifindex("lo")? {
                netlink.set_link_up(lo)?;
            }
            let index = netlink.require_ifindex(veth)?;
            netlink.add_address(index, address)?;
            netlink.set_link_up(index)?;
            netlink.add_default_route(gateway, index)
        })
    }

    /// Forward a host port to the container. The host port must not be
    /// mapped by any container already.
    pub fn add_port_map(&self, record: &mut NetworkRecord, map: PortMap) -> Result<()> {
        self.state()?.reserve_port(&record.container_id, &map)?;

        if let Err(e) = self
            .iptables
            .add_port_map(&record.container_id, record.container_ip, &map)
        {
            self.state()?.release_port(&record.container_id, &map);
            return Err(e);
        }
        record.port_maps.push(map);
        Ok(())
    }

    pub fn remove_port_map(&self, record: &mut NetworkRecord, map: &PortMap) -> Result<()> {
        self.iptables
            .remove_port_map(&record.container_id, record.container_ip, map)?;
        self.state()?.release_port(&record.container_id, map);
        record.port_maps.retain(|m| m != map);
        Ok(())
    }

    pub fn info(&self, record: &NetworkRecord) -> NetworkInfo {
        NetworkInfo {
            ip: record.container_ip,
            gateway: record.gateway_ip,
            host_veth: record.host_veth.clone(),
            container_veth: record.container_veth.clone(),
            port_maps: record.port_maps.clone(),
        }
    }

    /// Remove rules, links and the namespace, then free the address and
    /// ports. Every step is attempted; the first failure is returned.
    pub fn cleanup(&self, record: &NetworkRecord) -> Result<()> {
        let mut first_error = None;

        for map in &record.port_maps {
            if let Err(e) = self
                .iptables
                .remove_port_map(&record.container_id, record.container_ip, map)
            {
                tracing::warn!(container = %record.container_id, "Failed to remove port map {}: {}", map, e);
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.remove_links(record) {
            tracing::warn!(container = %record.container_id, "Failed to delete veth pair: {}", e);
            first_error.get_or_insert(e);
        }

        if let Err(e) = netns::remove(&record.netns_path) {
            tracing::warn!(container = %record.container_id, "Failed to remove network namespace: {}", e);
            first_error.get_or_insert(e);
        }

        match self.state() {
            Ok(mut state) => {
                state.allocator.release(record.container_ip);
                for map in &record.port_maps {
                    state.release_port(&record.container_id, map);
                }
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn remove_links(&self, record: &NetworkRecord) -> Result<()> {
        let mut netlink = NetlinkHandle::new()?;
        let Some(index) = netlink.ifindex(&record.host_veth)? else {
            return Ok(());
        };
        if let Err(e) = netlink.set_master(index, 0) {
            tracing::debug!(veth = %record.host_veth, "detach from bridge failed: {}", e);
        }
        netlink.delete_link(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_map() {
        let map: PortMap = "8080:80".parse().unwrap();
        assert_eq!(map, PortMap::tcp(8080, 80));

        let map: PortMap = "5353:53/udp".parse().unwrap();
        assert_eq!(map.protocol, Protocol::Udp);
        assert_eq!(map.host_port, 5353);

        let map: PortMap = "127.0.0.1:8443:443".parse().unwrap();
        assert_eq!(map.host_ip, Ipv4Addr::LOCALHOST);
        assert_eq!(map.to_string(), "127.0.0.1:8443:443/tcp");
    }

    #[test]
    fn test_parse_port_map_rejects_garbage() {
        for bad in ["80", "0:80", "8080:70000", "a:b", "8080:80/sctp", "1:2:3:4"] {
            let err = bad.parse::<PortMap>().unwrap_err();
            assert_eq!(err.kind(), "invalid_argument", "{}", bad);
        }
    }

    #[test]
    fn test_port_reservations() {
        let manager = NetworkManager::new(&RuntimeConfig::default()).unwrap();
        let mut state = manager.state().unwrap();

        state.reserve_port("real-1", &PortMap::tcp(8080, 80)).unwrap();
        let err = state
            .reserve_port("real-2", &PortMap::tcp(8080, 8000))
            .unwrap_err();
        assert_eq!(err.kind(), "resource_exhaustion");

        // same number, other protocol
        let udp = PortMap {
            protocol: Protocol::Udp,
            ..PortMap::tcp(8080, 80)
        };
        state.reserve_port("real-2", &udp).unwrap();

        // only the owner releases
        state.release_port("real-2", &PortMap::tcp(8080, 80));
        assert!(state.reserve_port("real-3", &PortMap::tcp(8080, 80)).is_err());
        state.release_port("real-1", &PortMap::tcp(8080, 80));
        state.reserve_port("real-3", &PortMap::tcp(8080, 80)).unwrap();
    }

    #[test]
    fn test_restore_rebuilds_pool() {
        let manager = NetworkManager::new(&RuntimeConfig::default()).unwrap();
        let record = NetworkRecord {
            container_id: "real-1".to_string(),
            host_veth: "vhreal1".to_string(),
            container_veth: "vcreal1".to_string(),
            bridge: "corral0".to_string(),
            container_ip: Ipv4Addr::new(172, 19, 0, 2),
            gateway_ip: Ipv4Addr::new(172, 19, 0, 1),
            prefix_len: 16,
            hostname: "web".to_string(),
            netns_path: manager.netns_path("real-1"),
            port_maps: vec![PortMap::tcp(8080, 80)],
        };
        manager.restore([&record]).unwrap();

        {
            let mut state = manager.state().unwrap();
            assert_eq!(state.allocator.allocate().unwrap(), Ipv4Addr::new(172, 19, 0, 3));
            assert!(state.reserve_port("real-2", &PortMap::tcp(8080, 81)).is_err());
        }

        // a container removed by another instance gives its address and port back
        manager.restore([]).unwrap();
        let mut state = manager.state().unwrap();
        assert_eq!(state.allocator.allocate().unwrap(), Ipv4Addr::new(172, 19, 0, 2));
        state.reserve_port("real-2", &PortMap::tcp(8080, 81)).unwrap();
    }

    #[test]
    fn test_info() {
        let manager = NetworkManager::new(&RuntimeConfig::default()).unwrap();
        let record = NetworkRecord {
            container_id: "real-9".to_string(),
            host_veth: "vhreal9".to_string(),
            container_veth: "vcreal9".to_string(),
            bridge: "corral0".to_string(),
            container_ip: Ipv4Addr::new(172, 19, 0, 9),
            gateway_ip: Ipv4Addr::new(172, 19, 0, 1),
            prefix_len: 16,
            hostname: "db".to_string(),
            netns_path: manager.netns_path("real-9"),
            port_maps: Vec::new(),
        };
        let info = manager.info(&record);
        assert_eq!(info.ip, Ipv4Addr::new(172, 19, 0, 9));
        assert_eq!(info.host_veth, "vhreal9");
        assert_eq!(
            manager.netns_path("real-9"),
            PathBuf::from("/var/run/netns/real-9")
        );
    }
}
