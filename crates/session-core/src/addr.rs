//! Address allocator (C10): per-session IPv4/IPv6 prefix pools, one pool
//! per Network, grounded on the teacher's `generate_p2p_subnet` but
//! generalized from a fixed /30-per-link scheme to arbitrary
//! per-network-kind prefixes.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};
use thiserror::Error;

use crate::ids::NetworkId;

#[derive(Error, Debug)]
pub enum AddrError {
    #[error("address pool for network {0} exhausted")]
    PoolExhausted(NetworkId),

    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("address not allocated: {0}")]
    NotAllocated(String),
}

struct Ipv4Pool {
    network: Ipv4Network,
    allocated: HashSet<u32>,
    next: u32,
}

impl Ipv4Pool {
    fn new(network: Ipv4Network) -> Self {
        Self {
            network,
            allocated: HashSet::new(),
            next: 1,
        }
    }

    /// Next unused host, skipping network and broadcast addresses (spec
    /// §4.9).
    fn allocate(&mut self, net_id: NetworkId) -> Result<(Ipv4Addr, u8), AddrError> {
        let host_bits = 32 - self.network.prefix();
        let max_hosts = if host_bits >= 32 { u32::MAX } else { (1u32 << host_bits).saturating_sub(2) };
        // Scan at most two full passes over the address range so a
        // freed address near the end of the range is found even right
        // after `next` has wrapped past it.
        let attempts = max_hosts.saturating_mul(2).max(2);

        for _ in 0..attempts {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if candidate == 0 || candidate as u64 >= (1u64 << host_bits) - 1 {
                self.next = 1;
                continue;
            }
            if self.allocated.contains(&candidate) {
                continue;
            }
            self.allocated.insert(candidate);
            let base = u32::from(self.network.network());
            let addr = Ipv4Addr::from(base + candidate);
            return Ok((addr, self.network.prefix()));
        }
        Err(AddrError::PoolExhausted(net_id))
    }

    fn deallocate(&mut self, addr: Ipv4Addr) {
        let base = u32::from(self.network.network());
        let host = u32::from(addr).wrapping_sub(base);
        self.allocated.remove(&host);
    }
}

struct Ipv6Pool {
    network: Ipv6Network,
    allocated: HashSet<u128>,
    next: u128,
}

impl Ipv6Pool {
    fn new(network: Ipv6Network) -> Self {
        Self {
            network,
            allocated: HashSet::new(),
            next: 1,
        }
    }

    fn allocate(&mut self, net_id: NetworkId) -> Result<(Ipv6Addr, u8), AddrError> {
        let base = u128::from(self.network.network());
        for _ in 0..1_000_000u32 {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if candidate == 0 {
                continue;
            }
            if self.allocated.contains(&candidate) {
                continue;
            }
            self.allocated.insert(candidate);
            return Ok((Ipv6Addr::from(base + candidate), self.network.prefix()));
        }
        Err(AddrError::PoolExhausted(net_id))
    }

    fn deallocate(&mut self, addr: Ipv6Addr) {
        let base = u128::from(self.network.network());
        let host = u128::from(addr).wrapping_sub(base);
        self.allocated.remove(&host);
    }
}

/// Per-session address allocator: one IPv4 and one IPv6 pool per
/// Network, prefixes chosen by network kind at pool-creation time.
pub struct AddressAllocator {
    v4_pools: std::collections::HashMap<NetworkId, Ipv4Pool>,
    v6_pools: std::collections::HashMap<NetworkId, Ipv6Pool>,
    next_subnet_octet: u8,
}

impl AddressAllocator {
    pub fn new() -> Self {
        Self {
            v4_pools: std::collections::HashMap::new(),
            v6_pools: std::collections::HashMap::new(),
            next_subnet_octet: 0,
        }
    }

    /// Derives a disjoint /24-in-10.0.0.0/8 subnet for the network, the
    /// way the teacher derives a /30 per link from a link-id seed.
    pub fn provision_ipv4(&mut self, net_id: NetworkId, prefix_len: u8) -> Result<(), AddrError> {
        if prefix_len == 0 || prefix_len > 30 {
            return Err(AddrError::InvalidPrefix(format!("prefix /{prefix_len} unusable")));
        }
        let block = self.next_subnet_octet;
        self.next_subnet_octet = self.next_subnet_octet.wrapping_add(1);
        let base = Ipv4Addr::new(10, block, 0, 0);
        let network = Ipv4Network::new(base, prefix_len).map_err(|e| AddrError::InvalidPrefix(e.to_string()))?;
        self.v4_pools.insert(net_id, Ipv4Pool::new(network));
        Ok(())
    }

    pub fn provision_ipv6(&mut self, net_id: NetworkId, prefix_len: u8) -> Result<(), AddrError> {
        let block = self.v6_pools.len() as u16;
        let base = Ipv6Addr::new(0xfd00, block, 0, 0, 0, 0, 0, 0);
        let network = Ipv6Network::new(base, prefix_len).map_err(|e| AddrError::InvalidPrefix(e.to_string()))?;
        self.v6_pools.insert(net_id, Ipv6Pool::new(network));
        Ok(())
    }

    pub fn allocate_v4(&mut self, net_id: NetworkId) -> Result<(Ipv4Addr, u8), AddrError> {
        self.v4_pools
            .get_mut(&net_id)
            .ok_or_else(|| AddrError::InvalidPrefix(format!("no ipv4 pool for network {net_id}")))?
            .allocate(net_id)
    }

    pub fn allocate_v6(&mut self, net_id: NetworkId) -> Result<(Ipv6Addr, u8), AddrError> {
        self.v6_pools
            .get_mut(&net_id)
            .ok_or_else(|| AddrError::InvalidPrefix(format!("no ipv6 pool for network {net_id}")))?
            .allocate(net_id)
    }

    pub fn deallocate_v4(&mut self, net_id: NetworkId, addr: Ipv4Addr) {
        if let Some(pool) = self.v4_pools.get_mut(&net_id) {
            pool.deallocate(addr);
        }
    }

    pub fn deallocate_v6(&mut self, net_id: NetworkId, addr: Ipv6Addr) {
        if let Some(pool) = self.v6_pools.get_mut(&net_id) {
            pool.deallocate(addr);
        }
    }
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_addresses_skipping_network_and_broadcast() {
        let mut alloc = AddressAllocator::new();
        let net = NetworkId(1 << 16);
        alloc.provision_ipv4(net, 30).unwrap();
        let (a1, _) = alloc.allocate_v4(net).unwrap();
        let (a2, _) = alloc.allocate_v4(net).unwrap();
        assert_ne!(a1, a2);
        assert_ne!(a1.octets()[3], 0);
        assert_ne!(a1.octets()[3], 3);
    }

    #[test]
    fn pool_exhaustion_reported() {
        let mut alloc = AddressAllocator::new();
        let net = NetworkId(1 << 16);
        alloc.provision_ipv4(net, 30).unwrap();
        alloc.allocate_v4(net).unwrap();
        alloc.allocate_v4(net).unwrap();
        assert!(alloc.allocate_v4(net).is_err());
    }

    #[test]
    fn deallocate_frees_address_for_reuse() {
        let mut alloc = AddressAllocator::new();
        let net = NetworkId(1 << 16);
        alloc.provision_ipv4(net, 29).unwrap();
        let (a1, _) = alloc.allocate_v4(net).unwrap();
        alloc.deallocate_v4(net, a1);
        let (a2, _) = alloc.allocate_v4(net).unwrap();
        assert_eq!(a1, a2);
    }
}
