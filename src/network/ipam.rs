//! Container address allocation

use crate::error::{CorralError, Result};
use ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Hands out the lowest free host address of a subnet.
///
/// The first host address belongs to the bridge.
#[derive(Debug, Clone)]
pub struct IpAllocator {
    network: Ipv4Network,
    gateway: Ipv4Addr,
    allocated: BTreeSet<Ipv4Addr>,
}

impl IpAllocator {
    /// Create a new IP allocator for a subnet such as `172.19.0.0/16`
    pub fn new(subnet: &str) -> Result<Self> {
        let parsed: Ipv4Network = subnet
            .parse()
            .map_err(|e| CorralError::InvalidArgument(format!("subnet {}: {}", subnet, e)))?;
        if parsed.prefix() > 30 {
            return Err(CorralError::InvalidArgument(format!(
                "subnet {} has no room for containers",
                subnet
            )));
        }
        let network = Ipv4Network::new(parsed.network(), parsed.prefix())
            .map_err(|e| CorralError::InvalidArgument(format!("subnet {}: {}", subnet, e)))?;
        let gateway = Ipv4Addr::from(u32::from(network.network()) + 1);

        Ok(Self {
            network,
            gateway,
            allocated: BTreeSet::new(),
        })
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn prefix(&self) -> u8 {
        self.network.prefix()
    }

    /// Number of addresses currently handed out
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    fn host_range(&self) -> std::ops::RangeInclusive<u32> {
        let first = u32::from(self.gateway) + 1;
        let last = u32::from(self.network.broadcast()) - 1;
        first..=last
    }

    /// Allocate an IP address
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let ip = self
            .host_range()
            .map(Ipv4Addr::from)
            .find(|ip| !self.allocated.contains(ip))
            .ok_or_else(|| {
                CorralError::ResourceExhaustion(format!(
                    "no free addresses left in {}",
                    self.network
                ))
            })?;
        self.allocated.insert(ip);
        Ok(ip)
    }

    /// Mark an address restored from a saved record as taken
    pub fn reserve(&mut self, ip: Ipv4Addr) -> Result<()> {
        if !self.host_range().contains(&u32::from(ip)) {
            return Err(CorralError::InvalidArgument(format!(
                "{} is not a container address in {}",
                ip, self.network
            )));
        }
        if !self.allocated.insert(ip) {
            return Err(CorralError::ResourceExhaustion(format!(
                "{} is already allocated",
                ip
            )));
        }
        Ok(())
    }

    /// Forget every allocation
    pub fn reset(&mut self) {
        self.allocated.clear();
    }

    /// Release an IP address; unknown addresses are ignored
    pub fn release(&mut self, ip: Ipv4Addr) {
        self.allocated.remove(&ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_allocator() {
        let mut allocator = IpAllocator::new("172.19.0.0/16").unwrap();
        assert_eq!(allocator.gateway(), Ipv4Addr::new(172, 19, 0, 1));

        let ip1 = allocator.allocate().unwrap();
        assert_eq!(ip1, Ipv4Addr::new(172, 19, 0, 2));

        let ip2 = allocator.allocate().unwrap();
        assert_eq!(ip2, Ipv4Addr::new(172, 19, 0, 3));

        allocator.release(ip1);
        assert_eq!(allocator.allocate().unwrap(), ip1);
    }

    #[test]
    fn test_host_bits_in_subnet_are_ignored() {
        let allocator = IpAllocator::new("10.1.2.77/24").unwrap();
        assert_eq!(allocator.gateway(), Ipv4Addr::new(10, 1, 2, 1));
        assert_eq!(allocator.network().to_string(), "10.1.2.0/24");
    }

    #[test]
    fn test_exhaustion() {
        // .1 is the gateway and .7 the broadcast address
        let mut allocator = IpAllocator::new("192.168.50.0/29").unwrap();
        for last in 2..=6 {
            assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(192, 168, 50, last));
        }
        let err = allocator.allocate().unwrap_err();
        assert_eq!(err.kind(), "resource_exhaustion");
        assert_eq!(allocator.allocated_count(), 5);
    }

    #[test]
    fn test_reserve() {
        let mut allocator = IpAllocator::new("172.19.0.0/16").unwrap();
        allocator.reserve(Ipv4Addr::new(172, 19, 0, 2)).unwrap();
        assert!(allocator.reserve(Ipv4Addr::new(172, 19, 0, 2)).is_err());
        assert!(allocator.reserve(Ipv4Addr::new(172, 19, 0, 1)).is_err());
        assert!(allocator.reserve(Ipv4Addr::new(10, 0, 0, 2)).is_err());
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(172, 19, 0, 3));
    }

    #[test]
    fn test_rejects_tiny_subnets() {
        assert!(IpAllocator::new("10.0.0.0/31").is_err());
        assert!(IpAllocator::new("garbage").is_err());
    }
}
