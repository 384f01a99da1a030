//! Address pool allocation for null ("any") addresses.
//!
//! A static address of `0.0.0.0/24` or `::/64` asks for any free subnet of
//! that size. The [`AddressPoolManager`] walks the configured pools and hands
//! out the first subnet that overlaps nothing already issued or in use.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

use crate::address::{Address, AddressFamily};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::util::addr::{mask_addr, max_prefixlen};

/// A network prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    pub address: IpAddr,
    pub prefixlen: u8,
}

impl Subnet {
    /// Create a subnet, clearing host bits.
    pub fn new(address: IpAddr, prefixlen: u8) -> Self {
        let prefixlen = prefixlen.min(max_prefixlen(&address));
        Self {
            address: mask_addr(&address, prefixlen),
            prefixlen,
        }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.address)
    }

    /// Whether the two subnets share any address.
    pub fn overlaps(&self, other: &Subnet) -> bool {
        if self.family() != other.family() {
            return false;
        }
        let shorter = self.prefixlen.min(other.prefixlen);
        mask_addr(&self.address, shorter) == mask_addr(&other.address, shorter)
    }

    fn bits(&self) -> u128 {
        to_bits(&self.address)
    }

    /// Number of host bits.
    fn host_bits(&self) -> u32 {
        u32::from(max_prefixlen(&self.address) - self.prefixlen)
    }

    /// Last address of the subnet as an integer.
    fn last(&self) -> u128 {
        self.bits() | host_mask(self.host_bits())
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefixlen)
    }
}

impl From<&Address> for Subnet {
    fn from(address: &Address) -> Self {
        Subnet::new(address.in_addr, address.prefixlen)
    }
}

fn to_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn from_bits(family: AddressFamily, bits: u128) -> IpAddr {
    match family {
        AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::from(bits)),
        _ => IpAddr::V4(Ipv4Addr::from(bits as u32)),
    }
}

fn host_mask(host_bits: u32) -> u128 {
    1u128
        .checked_shl(host_bits)
        .map(|v| v - 1)
        .unwrap_or(u128::MAX)
}

/// Manager-wide pool state.
#[derive(Debug, Clone, Default)]
pub struct AddressPoolManager {
    pools: Vec<Subnet>,
    issued: Vec<Subnet>,
}

impl AddressPoolManager {
    pub fn new(config: &ManagerConfig) -> Self {
        Self::from_pools(
            config
                .pools
                .iter()
                .map(|p| Subnet::new(p.prefix, p.prefixlen))
                .collect(),
        )
    }

    pub fn from_pools(pools: Vec<Subnet>) -> Self {
        Self {
            pools,
            issued: Vec::new(),
        }
    }

    pub fn pools(&self) -> &[Subnet] {
        &self.pools
    }

    pub fn issued(&self) -> &[Subnet] {
        &self.issued
    }

    /// Hand out a free subnet of `family` and `prefixlen`.
    ///
    /// `in_use` lists prefixes already present on links, which are skipped
    /// like issued ones.
    pub fn acquire(
        &mut self,
        family: AddressFamily,
        prefixlen: u8,
        in_use: &[Subnet],
    ) -> Result<Subnet> {
        let exhausted = Error::PoolExhausted { family, prefixlen };

        if prefixlen > family.max_prefixlen() || family == AddressFamily::Unspec {
            return Err(exhausted);
        }

        for pool in self.pools.iter().filter(|p| p.family() == family) {
            if pool.prefixlen > prefixlen {
                continue;
            }

            let width = u32::from(family.max_prefixlen());
            let Some(step) = 1u128.checked_shl(width - u32::from(prefixlen)) else {
                continue;
            };

            let end = pool.last();
            let mut candidate = pool.bits();

            loop {
                let subnet = Subnet {
                    address: from_bits(family, candidate),
                    prefixlen,
                };

                let blocker = self
                    .issued
                    .iter()
                    .chain(in_use.iter())
                    .find(|s| s.overlaps(&subnet))
                    .copied();

                match blocker {
                    None => {
                        debug!(pool = %pool, subnet = %subnet, "acquired subnet from pool");
                        self.issued.push(subnet);
                        return Ok(subnet);
                    }
                    // Skip past a larger blocking prefix in one go.
                    Some(b) if b.prefixlen < prefixlen => {
                        let Some(next) = b.last().checked_add(1) else {
                            break;
                        };
                        candidate = next;
                    }
                    Some(_) => {
                        let Some(next) = candidate.checked_add(step) else {
                            break;
                        };
                        candidate = next;
                    }
                }

                if candidate > end || candidate.saturating_add(step - 1) > end {
                    break;
                }
            }
        }

        Err(exhausted)
    }

    /// Return a subnet to the pool. Returns false if it was not issued.
    pub fn release(&mut self, subnet: &Subnet) -> bool {
        let Some(pos) = self.issued.iter().position(|s| s == subnet) else {
            return false;
        };
        self.issued.remove(pos);
        true
    }
}

/// First usable address of an acquired subnet, and for IPv4 prefixes up to
/// /30 its broadcast address.
pub fn subnet_address(subnet: &Subnet) -> (IpAddr, Option<Ipv4Addr>) {
    match subnet.address {
        IpAddr::V4(network) => {
            let address = Ipv4Addr::from(u32::from(network) | 1);
            let broadcast = (subnet.prefixlen <= 30)
                .then(|| Ipv4Addr::from(u32::from(network) | (u32::MAX >> subnet.prefixlen)));
            (IpAddr::V4(address), broadcast)
        }
        IpAddr::V6(network) => {
            let mut octets = network.octets();
            octets[15] |= 1;
            (IpAddr::V6(Ipv6Addr::from(octets)), None)
        }
    }
}
