//! Host bridge bootstrap and veth naming

use super::nat::Iptables;
use super::netlink::NetlinkHandle;
use crate::error::{CorralError, Result};
use ipnetwork::Ipv4Network;
use std::fs;
use std::path::Path;

/// Longest interface name the kernel accepts
pub const IFNAMSIZ_MAX: usize = 15;

const VETH_SUFFIX_LEN: usize = 13;

/// Host and container veth names for a container id
pub fn veth_names(container_id: &str) -> (String, String) {
    let chars: Vec<char> = container_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let suffix: String = chars[chars.len().saturating_sub(VETH_SUFFIX_LEN)..]
        .iter()
        .collect();
    (format!("vh{}", suffix), format!("vc{}", suffix))
}

/// Random locally administered unicast MAC address
pub fn generate_mac_address() -> [u8; 6] {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    [
        0x02, // Locally administered
        rng.gen(),
        rng.gen(),
        rng.gen(),
        rng.gen(),
        rng.gen(),
    ]
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Write a value under `/proc/sys`; `key` is the slash-separated path
pub fn write_sysctl(proc_sys: &Path, key: &str, value: &str) -> Result<()> {
    let path = proc_sys.join(key);
    fs::write(&path, value)
        .map_err(|e| CorralError::external(format!("write {}", path.display()), e))
}

/// Host bridge shared by all containers
#[derive(Debug, Clone)]
pub struct Bridge {
    pub name: String,
    /// Gateway address with the subnet's prefix length
    pub address: Ipv4Network,
    pub subnet: Ipv4Network,
}

impl Bridge {
    /// Create the bridge if it is missing, bring it up, and make sure the host
    /// forwards and masquerades for it. Returns the bridge's link index.
    pub fn ensure(
        &self,
        netlink: &mut NetlinkHandle,
        iptables: &Iptables,
        proc_sys: &Path,
    ) -> Result<u32> {
        let index = match netlink.ifindex(&self.name)? {
            Some(index) => index,
            None => {
                let index = netlink.create_bridge(&self.name)?;
                tracing::info!(bridge = %self.name, address = %self.address, "created bridge");
                index
            }
        };

        match netlink.add_address(index, self.address) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {}
            Err(e) => return Err(e),
        }
        netlink.set_link_up(index)?;

        write_sysctl(proc_sys, "net/ipv4/ip_forward", "1")?;
        // lets OUTPUT DNAT send 127.0.0.1 traffic into the bridge
        write_sysctl(
            proc_sys,
            &format!("net/ipv4/conf/{}/route_localnet", self.name),
            "1",
        )?;
        iptables.setup_bridge(&self.name, &self.subnet.to_string())?;

        Ok(index)
    }
}
