//! Per-link state seen by the address engine.

use std::net::{IpAddr, Ipv6Addr};

use crate::address::{AddressFamily, AddressStore};
use crate::config::NetworkId;
use crate::error::Result;

/// Route protocol of DHCP-installed routes (RTPROT_DHCP).
pub const RTPROT_DHCP: u8 = 16;

/// Lifecycle state of a link, as far as address handling cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Pending,
    Configuring,
    Configured,
    Failed,
    Linger,
}

/// In-flight request bookkeeping of one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounters {
    /// Outstanding add/replace requests.
    pub pending_adds: u32,
    /// Outstanding removals.
    pub pending_removals: u32,
    /// An apply pass is waiting for removals to finish.
    pub deferred_apply: bool,
}

/// A route not installed by us, as far as the dynamic-address heuristic
/// needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignRoute {
    pub family: AddressFamily,
    pub protocol: u8,
    pub prefsrc: Option<IpAddr>,
}

/// Link state and addresses.
#[derive(Debug)]
pub struct Link {
    pub ifindex: u32,
    pub name: String,
    pub mac: Option<[u8; 6]>,
    pub state: LinkState,
    pub network: Option<NetworkId>,
    pub addresses: AddressStore,
    pub counters: RequestCounters,
    /// All requests of the apply pass were acknowledged.
    pub addresses_configured: bool,
    /// Every static address is ready.
    pub addresses_ready: bool,
    pub ipv6ll_address: Option<Ipv6Addr>,
    pub routes_foreign: Vec<ForeignRoute>,
}

impl Link {
    pub fn new(ifindex: u32, name: impl Into<String>) -> Self {
        Self {
            ifindex,
            name: name.into(),
            mac: None,
            state: LinkState::Pending,
            network: None,
            addresses: AddressStore::new(),
            counters: RequestCounters::default(),
            addresses_configured: false,
            addresses_ready: false,
            ipv6ll_address: None,
            routes_foreign: Vec::new(),
        }
    }

    pub fn with_mac(mut self, mac: [u8; 6]) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn with_network(mut self, network: NetworkId) -> Self {
        self.network = Some(network);
        self
    }

    /// Completions for failed or lingering links are ignored.
    pub fn is_failed_or_linger(&self) -> bool {
        matches!(self.state, LinkState::Failed | LinkState::Linger)
    }

    /// Whether a DHCP route uses `addr` as its preferred source.
    pub fn has_dhcp_route_from(&self, family: AddressFamily, addr: &IpAddr) -> bool {
        self.routes_foreign.iter().any(|route| {
            route.protocol == RTPROT_DHCP
                && route.family == family
                && route.prefsrc.as_ref() == Some(addr)
        })
    }
}

/// Calls from the address engine into the rest of the link state machine.
pub trait LinkHooks {
    /// Addresses are ready; configure routes next.
    fn configure_routes(&mut self, ifindex: u32) -> Result<()>;

    /// Re-evaluate overall link readiness.
    fn check_ready(&mut self, ifindex: u32);

    /// Recompute the operational state.
    fn update_operstate(&mut self, ifindex: u32);

    /// The link's IPv6 link-local address became usable.
    fn ipv6ll_gained(&mut self, ifindex: u32, address: Ipv6Addr) -> Result<()>;

    /// The link entered the failed state.
    fn link_failed(&mut self, ifindex: u32);
}

/// Hooks that do nothing.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl LinkHooks for NoopHooks {
    fn configure_routes(&mut self, _ifindex: u32) -> Result<()> {
        Ok(())
    }

    fn check_ready(&mut self, _ifindex: u32) {}

    fn update_operstate(&mut self, _ifindex: u32) {}

    fn ipv6ll_gained(&mut self, _ifindex: u32, _address: Ipv6Addr) -> Result<()> {
        Ok(())
    }

    fn link_failed(&mut self, _ifindex: u32) {}
}
