//! Per-network IP pool. The allocator owns a CIDR, optionally narrowed to a
//! sub-range, and hands out host addresses in ascending order, skipping the
//! gateway and everything already allocated.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAllocator {
    pub cidr: String,
    #[serde(default)]
    pub range: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub allocated: Vec<String>,

    // allocation window and prefix length, recomputed from the CIDR strings
    // after every deserialize
    #[serde(skip)]
    window: (u32, u32),
    #[serde(skip)]
    prefix: u8,
}

impl IpAllocator {
    pub fn new(cidr: &str, range: &str, gateway: &str) -> Result<Self> {
        let mut allocator = Self {
            cidr: cidr.to_string(),
            range: range.to_string(),
            gateway: gateway.to_string(),
            allocated: Vec::new(),
            window: (0, 0),
            prefix: 0,
        };
        allocator.init()?;
        Ok(allocator)
    }

    /// Recomputes the non-persistent fields. Must be called after loading
    /// the allocator from a manifest.
    pub fn init(&mut self) -> Result<()> {
        let network: Ipv4Network = self
            .cidr
            .parse()
            .with_context(|| format!("invalid CIDR {}", self.cidr))?;
        self.prefix = network.prefix();
        self.window = host_window(&network);

        if !self.range.is_empty() {
            let range: Ipv4Network = self
                .range
                .parse()
                .with_context(|| format!("invalid range CIDR {}", self.range))?;
            self.window = host_window(&range);
        }

        if self.gateway.is_empty() {
            let first_host = Ipv4Addr::from(u32::from(network.network()) + 1);
            self.gateway = format!("{first_host}/{}", self.prefix);
        }
        Ok(())
    }

    /// Hands out the lowest free address in the window, formatted as
    /// `address/prefixlen`.
    pub fn allocate(&mut self) -> Result<String> {
        let used = self.used_ips()?;
        for value in self.window.0..=self.window.1 {
            let ip = Ipv4Addr::from(value);
            if !used.contains(&ip) {
                let cidr = format!("{ip}/{}", self.prefix);
                self.allocated.push(cidr.clone());
                return Ok(cidr);
            }
        }
        bail!("no available IP in {}", self.cidr)
    }

    /// Returns an address to the pool. Unknown addresses are ignored.
    pub fn release(&mut self, cidr: &str) {
        self.allocated.retain(|allocated| allocated != cidr);
    }

    pub fn gateway_ip(&self) -> Result<Ipv4Addr> {
        parse_cidr_addr(&self.gateway)
            .with_context(|| format!("invalid gateway {}", self.gateway))
    }

    fn used_ips(&self) -> Result<HashSet<Ipv4Addr>> {
        let mut used: HashSet<Ipv4Addr> = self
            .allocated
            .iter()
            .filter_map(|cidr| parse_cidr_addr(cidr).ok())
            .collect();
        used.insert(self.gateway_ip()?);
        Ok(used)
    }
}

/// First and last allocatable host address of a network: everything between
/// the network address and the broadcast address, both exclusive.
fn host_window(network: &Ipv4Network) -> (u32, u32) {
    let base = u32::from(network.network());
    let broadcast = u32::from(network.broadcast());
    (base + 1, broadcast.saturating_sub(1))
}

/// The address part of an `a.b.c.d/len` string.
pub fn parse_cidr_addr(cidr: &str) -> Result<Ipv4Addr> {
    let network: Ipv4Network = cidr.parse().with_context(|| format!("invalid CIDR {cidr}"))?;
    Ok(network.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_in_ascending_order() {
        let mut pool = IpAllocator::new("10.0.0.0/24", "", "10.0.0.1/24").unwrap();

        assert_eq!(pool.allocate().unwrap(), "10.0.0.2/24");
        assert_eq!(pool.allocate().unwrap(), "10.0.0.3/24");
        assert_eq!(pool.allocate().unwrap(), "10.0.0.4/24");
    }

    #[test]
    fn test_release_makes_address_available_again() {
        let mut pool = IpAllocator::new("10.0.0.0/24", "", "10.0.0.1/24").unwrap();
        let first = pool.allocate().unwrap();
        let _second = pool.allocate().unwrap();

        pool.release(&first);

        assert_eq!(pool.allocate().unwrap(), first);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut pool = IpAllocator::new("10.0.0.0/24", "", "").unwrap();
        pool.release("10.0.0.77/24");
        assert_eq!(pool.allocate().unwrap(), "10.0.0.2/24");
    }

    #[test]
    fn test_exhaustion() {
        // /29 leaves host addresses .1 through .6; .1 is the gateway
        let mut pool = IpAllocator::new("10.0.0.0/29", "", "").unwrap();
        for _ in 0..5 {
            pool.allocate().expect("allocate from free pool");
        }

        let err = pool.allocate().unwrap_err();
        assert!(err.to_string().contains("no available IP"));
    }

    #[test]
    fn test_gateway_defaults_to_first_host() {
        let pool = IpAllocator::new("172.18.0.0/16", "", "").unwrap();
        assert_eq!(pool.gateway, "172.18.0.1/16");
        assert_eq!(pool.gateway_ip().unwrap(), Ipv4Addr::new(172, 18, 0, 1));
    }

    #[test]
    fn test_range_narrows_window() {
        let mut pool = IpAllocator::new("10.0.0.0/16", "10.0.5.0/24", "10.0.0.1/16").unwrap();

        assert_eq!(pool.allocate().unwrap(), "10.0.5.1/16");
    }

    #[test]
    fn test_invalid_cidr() {
        assert!(IpAllocator::new("not-a-cidr", "", "").is_err());
        assert!(IpAllocator::new("10.0.0.0/24", "bogus", "").is_err());
    }

    #[test]
    fn test_survives_manifest_round_trip() {
        let mut pool = IpAllocator::new("10.0.0.0/24", "", "").unwrap();
        pool.allocate().unwrap();

        let json = serde_json::to_string(&pool).unwrap();
        let mut restored: IpAllocator = serde_json::from_str(&json).unwrap();
        restored.init().unwrap();

        assert_eq!(restored.allocated, pool.allocated);
        assert_eq!(restored.allocate().unwrap(), "10.0.0.3/24");
    }

    quickcheck! {
        fn prop_allocations_unique_and_in_window(count: u8) -> bool {
            let count = (count % 64) as usize;
            let mut pool = IpAllocator::new("10.1.0.0/24", "", "").unwrap();
            let mut seen = std::collections::HashSet::new();
            for _ in 0..count {
                let cidr = pool.allocate().unwrap();
                let addr = parse_cidr_addr(&cidr).unwrap();
                let value = u32::from(addr);
                if !seen.insert(value) {
                    return false;
                }
                // inside (network, broadcast) and never the gateway
                if value <= u32::from(Ipv4Addr::new(10, 1, 0, 1)) {
                    return false;
                }
                if value >= u32::from(Ipv4Addr::new(10, 1, 0, 255)) {
                    return false;
                }
            }
            true
        }
    }
}
