//! The address entity.
//!
//! An [`Address`] is one IP address assignment. The same type is used for
//! static templates owned by a [`Network`](crate::config::Network), for live
//! entries owned by a link's [`AddressStore`], and for pool leases.
//!
//! Identity follows the kernel: two addresses are equal when their
//! [`AddressKey`]s are equal. For IPv4 the key carries the prefix length and
//! the network prefix of the peer (or local) address, so
//! `10.0.0.1 peer 10.0.1.0/24` and `10.0.0.1/24` are different addresses.
//! For IPv6 only the address bytes count.
//!
//! # Example
//!
//! ```ignore
//! use linkaddr::address::Address;
//!
//! let a = Address::from_prefix("192.0.2.5".parse()?, 24);
//! let b = Address::from_prefix("192.0.2.5".parse()?, 24);
//! assert_eq!(a, b);
//! assert_eq!(a.to_string(), "192.0.2.5/24");
//! ```

mod store;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use store::{AddressStore, Lookup, PoolLease};

use crate::config::NetworkId;
use crate::dad::Ipv4Dad;
use crate::netlink::types::addr::{IfaCacheinfo, INFINITY_LIFE_TIME, Scope, ifa_flags};
use crate::util::addr::{is_ipv6_link_local, mask_addr};

/// Address family of an entity.
///
/// Ordered the same way as the raw `AF_*` values.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Unspec,
    Inet,
    Inet6,
}

impl AddressFamily {
    /// Family of an IP address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Inet,
            IpAddr::V6(_) => Self::Inet6,
        }
    }

    /// Convert from a raw `AF_*` value. Families other than IPv4/IPv6 give `None`.
    pub fn from_raw(family: u8) -> Option<Self> {
        match family as i32 {
            libc::AF_INET => Some(Self::Inet),
            libc::AF_INET6 => Some(Self::Inet6),
            _ => None,
        }
    }

    /// Raw `AF_*` value.
    pub fn as_raw(self) -> u8 {
        match self {
            Self::Unspec => libc::AF_UNSPEC as u8,
            Self::Inet => libc::AF_INET as u8,
            Self::Inet6 => libc::AF_INET6 as u8,
        }
    }

    /// Width of an address of this family in bits.
    pub fn max_prefixlen(self) -> u8 {
        match self {
            Self::Unspec => 0,
            Self::Inet => 32,
            Self::Inet6 => 128,
        }
    }

    /// The all-zero address of this family.
    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unspec => "unspec",
            Self::Inet => "ipv4",
            Self::Inet6 => "ipv6",
        })
    }
}

/// Families for which duplicate address detection runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DadFamilies {
    None,
    Ipv4,
    #[default]
    Ipv6,
    Both,
}

impl DadFamilies {
    pub fn includes_ipv4(self) -> bool {
        matches!(self, Self::Ipv4 | Self::Both)
    }

    pub fn includes_ipv6(self) -> bool {
        matches!(self, Self::Ipv6 | Self::Both)
    }
}

impl FromStr for DadFamilies {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "ipv4" => Ok(Self::Ipv4),
            "ipv6" => Ok(Self::Ipv6),
            "both" => Ok(Self::Both),
            _ => Err(()),
        }
    }
}

/// Preferred and valid lifetimes, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub preferred: u32,
    pub valid: u32,
}

impl CacheInfo {
    /// Lifetimes that never expire.
    pub const INFINITE: Self = Self {
        preferred: INFINITY_LIFE_TIME,
        valid: INFINITY_LIFE_TIME,
    };

    /// Whether the preferred lifetime is finite.
    pub fn is_preferred_finite(&self) -> bool {
        self.preferred != INFINITY_LIFE_TIME
    }
}

impl Default for CacheInfo {
    fn default() -> Self {
        Self::INFINITE
    }
}

impl From<IfaCacheinfo> for CacheInfo {
    fn from(info: IfaCacheinfo) -> Self {
        Self {
            preferred: info.ifa_prefered,
            valid: info.ifa_valid,
        }
    }
}

impl From<CacheInfo> for IfaCacheinfo {
    fn from(info: CacheInfo) -> Self {
        IfaCacheinfo::with_lifetimes(info.preferred, info.valid)
    }
}

/// Identity of a configuration file section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId {
    pub filename: String,
    pub line: u32,
}

impl SectionId {
    pub fn new(filename: impl Into<String>, line: u32) -> Self {
        Self {
            filename: filename.into(),
            line,
        }
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.line)
    }
}

/// Who an entity belongs to. A relation, never followed after destruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Owner {
    #[default]
    Detached,
    /// Live, foreign or pool entry of the link with this ifindex.
    Link(u32),
    /// Static template of a network configuration.
    Network(NetworkId),
}

/// Single-shot action run when an address becomes ready.
pub enum ReadyCallback {
    /// Aggregate readiness of the link's static addresses.
    StaticAddress,
    /// Caller supplied notification, given the ifindex and the address.
    Notify(Box<dyn FnOnce(u32, &Address)>),
}

impl fmt::Debug for ReadyCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaticAddress => f.write_str("StaticAddress"),
            Self::Notify(_) => f.write_str("Notify(..)"),
        }
    }
}

/// Kernel-compatible identity of an address, used as the set key.
///
/// The derived ordering is family, then (IPv4 only) prefix length and
/// network prefix, then raw address bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressKey {
    family: AddressFamily,
    prefixlen: u8,
    prefix: u32,
    local: [u8; 16],
}

impl AddressKey {
    /// Compute the key from its parts.
    pub fn new(
        family: AddressFamily,
        in_addr: &IpAddr,
        peer: Option<&IpAddr>,
        prefixlen: u8,
    ) -> Self {
        let mut key = Self {
            family,
            prefixlen: 0,
            prefix: 0,
            local: [0; 16],
        };

        match (family, in_addr) {
            (AddressFamily::Inet, IpAddr::V4(local)) => {
                key.prefixlen = prefixlen;
                key.local[..4].copy_from_slice(&local.octets());

                let base = match peer {
                    Some(IpAddr::V4(p)) if !p.is_unspecified() => *p,
                    _ => *local,
                };
                key.prefix = ipv4_prefix(base, prefixlen);
            }
            (AddressFamily::Inet6, IpAddr::V6(local)) => {
                key.local = local.octets();
            }
            _ => {}
        }

        key
    }

    /// Key used to look up a kernel-reported address (no peer).
    pub fn lookup(in_addr: &IpAddr, prefixlen: u8) -> Self {
        Self::new(AddressFamily::of(in_addr), in_addr, None, prefixlen)
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }
}

/// Network prefix of an IPv4 address, shifted down. Prefix length 0 yields 0.
fn ipv4_prefix(addr: Ipv4Addr, prefixlen: u8) -> u32 {
    if prefixlen == 0 {
        return 0;
    }
    let shift = 32 - u32::from(prefixlen.min(32));
    u32::from(addr) >> shift
}

/// Flags set from configuration. The rest reflect kernel state.
const CONFIGURED_FLAGS: u32 = ifa_flags::PERMANENT
    | ifa_flags::NODAD
    | ifa_flags::HOMEADDRESS
    | ifa_flags::MANAGETEMPADDR
    | ifa_flags::NOPREFIXROUTE
    | ifa_flags::MCAUTOJOIN;

/// One IP address assignment.
#[derive(Debug)]
pub struct Address {
    pub family: AddressFamily,
    pub in_addr: IpAddr,
    pub in_addr_peer: Option<IpAddr>,
    pub prefixlen: u8,
    /// IPv4 broadcast address.
    pub broadcast: Option<Ipv4Addr>,
    pub scope: u8,
    /// Set when `Scope=` was given explicitly.
    pub scope_set: bool,
    /// IFA_F_* flags, as last reported by the kernel for live entries.
    pub flags: u32,
    pub cache_info: CacheInfo,
    pub label: Option<String>,
    pub duplicate_address_detection: DadFamilies,
    pub home_address: bool,
    pub manage_temporary_address: bool,
    pub prefix_route: bool,
    pub autojoin: bool,
    /// A masquerade rule is installed for this address.
    pub ip_masquerade_done: bool,
    pub owner: Owner,
    /// Configuration section of a static template.
    pub section: Option<SectionId>,
    /// Section failed validation and will be dropped on verification.
    pub section_invalid: bool,
    pub callback: Option<ReadyCallback>,
    /// IPv4 duplicate address detection armed on a static template.
    pub dad: Option<Ipv4Dad>,
}

impl Default for Address {
    fn default() -> Self {
        Self::new()
    }
}

impl Address {
    /// Create an address with default settings: no family, universe scope,
    /// infinite lifetimes, IPv6-only DAD, prefix route enabled.
    pub fn new() -> Self {
        Self {
            family: AddressFamily::Unspec,
            in_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            in_addr_peer: None,
            prefixlen: 0,
            broadcast: None,
            scope: Scope::Universe as u8,
            scope_set: false,
            flags: 0,
            cache_info: CacheInfo::INFINITE,
            label: None,
            duplicate_address_detection: DadFamilies::Ipv6,
            home_address: false,
            manage_temporary_address: false,
            prefix_route: true,
            autojoin: false,
            ip_masquerade_done: false,
            owner: Owner::Detached,
            section: None,
            section_invalid: false,
            callback: None,
            dad: None,
        }
    }

    /// Create an address for `in_addr/prefixlen`.
    pub fn from_prefix(in_addr: IpAddr, prefixlen: u8) -> Self {
        Self {
            family: AddressFamily::of(&in_addr),
            in_addr,
            prefixlen,
            ..Self::new()
        }
    }

    /// Identity key of this address.
    pub fn key(&self) -> AddressKey {
        AddressKey::new(
            self.family,
            &self.in_addr,
            self.in_addr_peer.as_ref(),
            self.prefixlen,
        )
    }

    /// Key of the live entry this address produces once configured. IPv6
    /// addresses with a peer are tracked under the peer.
    pub fn live_key(&self) -> AddressKey {
        AddressKey::lookup(&self.live_address(), self.prefixlen)
    }

    /// Address the kernel reports for this entry once configured.
    pub fn live_address(&self) -> IpAddr {
        match (self.family, self.in_addr_peer) {
            (AddressFamily::Inet6, Some(peer)) if !peer.is_unspecified() => peer,
            _ => self.in_addr,
        }
    }

    /// An address is ready once the kernel has cleared the tentative flag.
    pub fn is_ready(&self) -> bool {
        self.flags & ifa_flags::TENTATIVE == 0
    }

    /// Whether this is the all-zero placeholder to be filled from a pool.
    pub fn is_null(&self) -> bool {
        self.in_addr.is_unspecified()
    }

    pub fn is_ipv6_link_local(&self) -> bool {
        match self.in_addr {
            IpAddr::V6(v6) => self.family == AddressFamily::Inet6 && is_ipv6_link_local(&v6),
            IpAddr::V4(_) => false,
        }
    }

    /// The address with host bits cleared.
    pub fn masked(&self) -> IpAddr {
        mask_addr(&self.in_addr, self.prefixlen)
    }

    /// Derive the IPv4 broadcast address for prefixes up to /30.
    pub fn derive_broadcast(&self) -> Option<Ipv4Addr> {
        match self.in_addr {
            IpAddr::V4(v4) if self.family == AddressFamily::Inet && self.prefixlen <= 30 => {
                let host_mask = u32::MAX.checked_shr(u32::from(self.prefixlen)).unwrap_or(0);
                Some(Ipv4Addr::from(u32::from(v4) | host_mask))
            }
            _ => None,
        }
    }

    /// Flags to send when configuring this address.
    pub fn request_flags(&self) -> u32 {
        let mut flags = self.flags | ifa_flags::PERMANENT;

        if self.home_address {
            flags |= ifa_flags::HOMEADDRESS;
        }
        if !self.duplicate_address_detection.includes_ipv6() {
            flags |= ifa_flags::NODAD;
        }
        if self.manage_temporary_address {
            flags |= ifa_flags::MANAGETEMPADDR;
        }
        if !self.prefix_route {
            flags |= ifa_flags::NOPREFIXROUTE;
        }
        if self.autojoin {
            flags |= ifa_flags::MCAUTOJOIN;
        }

        flags & !ifa_flags::TENTATIVE
    }

    /// Copy the configuration of this address into a new, detached entity.
    ///
    /// Runtime state (owner, section, callback, DAD, masquerade) is not copied.
    pub fn detached_copy(&self) -> Address {
        Address {
            family: self.family,
            in_addr: self.in_addr,
            in_addr_peer: self.in_addr_peer,
            prefixlen: self.prefixlen,
            broadcast: self.broadcast,
            scope: self.scope,
            scope_set: self.scope_set,
            flags: self.flags,
            cache_info: self.cache_info,
            label: self.label.clone(),
            duplicate_address_detection: self.duplicate_address_detection,
            home_address: self.home_address,
            manage_temporary_address: self.manage_temporary_address,
            prefix_route: self.prefix_route,
            autojoin: self.autojoin,
            ..Address::new()
        }
    }

    /// Broadcast address a configure request carries. Point-to-point
    /// addresses and prefixes longer than /30 have none.
    pub fn request_broadcast(&self) -> Option<Ipv4Addr> {
        let has_peer = self.in_addr_peer.is_some_and(|p| !p.is_unspecified());
        if has_peer || self.prefixlen > 30 {
            return None;
        }
        self.broadcast
    }

    /// Whether a live entry already carries what this template asks for.
    ///
    /// The kernel reports a label for every IPv4 address, so label and
    /// broadcast only count when the template sets them.
    pub fn satisfies(&self, template: &Address) -> bool {
        let wanted_broadcast = template.request_broadcast();

        self.is_ready()
            && self.prefixlen == template.prefixlen
            && self.flags & CONFIGURED_FLAGS == template.request_flags() & CONFIGURED_FLAGS
            && self.scope == template.scope
            && self.cache_info.preferred == template.cache_info.preferred
            && (template.label.is_none() || self.label == template.label)
            && (wanted_broadcast.is_none() || self.broadcast == wanted_broadcast)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.in_addr, self.prefixlen)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}
