//! The address manager.
//!
//! [`Manager`] owns every link's address state, the network configurations
//! and the manager-wide address pool. It is driven from a single task: the
//! reconciliation passes (`set_addresses`, `drop_foreign_addresses`,
//! `drop_all_addresses`), kernel notifications (`process_address_event`),
//! request completions (`process_reply`) and probe events
//! (`process_dad_event`) all run to completion without suspending.
//!
//! Collaborators outside the engine are reached through traits: the
//! [`Transport`] that talks to the kernel, the [`Firewall`] for masquerade
//! rules, the [`DadProber`] and the [`LinkHooks`] of the link state machine.
//!
//! # Example
//!
//! ```ignore
//! use linkaddr::{Manager, ManagerConfig, Link, Network};
//!
//! let mut manager = Manager::new(ManagerConfig::default(), transport)
//!     .with_hooks(hooks);
//!
//! let network = manager.add_network(network);
//! manager.add_link(Link::new(2, "eth0").with_network(network));
//!
//! manager.drop_foreign_addresses(2)?;
//! manager.set_addresses(2)?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, error, warn};

use crate::address::{Address, AddressFamily, AddressKey, CacheInfo, Lookup, ReadyCallback};
use crate::config::{ManagerConfig, Network, NetworkId};
use crate::correlator::PendingRequest;
use crate::dad::{DadEvent, DadProber, Ipv4Dad, NoopProber};
use crate::error::{Error, Result};
use crate::link::{Link, LinkHooks, LinkState, NoopHooks};
use crate::masquerade::{self, Firewall, NoFirewall};
use crate::netlink::messages::AddressMessage;
use crate::netlink::{AddressRequest, Transport};
use crate::pool::{AddressPoolManager, Subnet};

/// Address reconciliation engine for all links.
pub struct Manager {
    pub(crate) config: ManagerConfig,
    pub(crate) links: BTreeMap<u32, Link>,
    pub(crate) networks: BTreeMap<NetworkId, Network>,
    next_network: u32,
    pub(crate) pool: AddressPoolManager,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) firewall: Box<dyn Firewall>,
    pub(crate) prober: Box<dyn DadProber>,
    pub(crate) hooks: Box<dyn LinkHooks>,
    pub(crate) pending: HashMap<u32, PendingRequest>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("links", &self.links.keys().collect::<Vec<_>>())
            .field("networks", &self.networks.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Create a manager sending requests through `transport`.
    ///
    /// Masquerade, probing and link hooks default to no-ops.
    pub fn new(config: ManagerConfig, transport: impl Transport + 'static) -> Self {
        let pool = AddressPoolManager::new(&config);
        Self {
            config,
            links: BTreeMap::new(),
            networks: BTreeMap::new(),
            next_network: 1,
            pool,
            transport: Box::new(transport),
            firewall: Box::new(NoFirewall),
            prober: Box::new(NoopProber),
            hooks: Box::new(NoopHooks),
            pending: HashMap::new(),
        }
    }

    pub fn with_firewall(mut self, firewall: impl Firewall + 'static) -> Self {
        self.firewall = Box::new(firewall);
        self
    }

    pub fn with_prober(mut self, prober: impl DadProber + 'static) -> Self {
        self.prober = Box::new(prober);
        self
    }

    pub fn with_hooks(mut self, hooks: impl LinkHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn pool(&self) -> &AddressPoolManager {
        &self.pool
    }

    /// Register a network configuration and return its id.
    pub fn add_network(&mut self, mut network: Network) -> NetworkId {
        let id = NetworkId(self.next_network);
        self.next_network += 1;
        network.set_id(id);
        self.networks.insert(id, network);
        id
    }

    pub fn network(&self, id: NetworkId) -> Option<&Network> {
        self.networks.get(&id)
    }

    pub fn network_mut(&mut self, id: NetworkId) -> Option<&mut Network> {
        self.networks.get_mut(&id)
    }

    pub fn add_link(&mut self, link: Link) {
        self.links.insert(link.ifindex, link);
    }

    pub fn link(&self, ifindex: u32) -> Option<&Link> {
        self.links.get(&ifindex)
    }

    pub fn link_mut(&mut self, ifindex: u32) -> Option<&mut Link> {
        self.links.get_mut(&ifindex)
    }

    /// Forget a link, undoing masquerade rules and returning pool subnets.
    ///
    /// Replies still in flight for it are ignored when they arrive.
    pub fn remove_link(&mut self, ifindex: u32) -> Option<Link> {
        let mut link = self.links.remove(&ifindex)?;

        for key in link.addresses.owned_keys() {
            if let Some(address) = link.addresses.get_mut(&key)
                && let Err(e) = masquerade::release(address, self.firewall.as_mut())
            {
                warn!(ifindex, link = %link.name, address = %address, "failed to disable IP masquerading: {}", e);
            }
        }

        for lease in link.addresses.take_leases() {
            self.pool.release(&Subnet::from(&lease.address));
        }

        for network in self.networks.values_mut() {
            for (_, template) in network.templates_mut() {
                if let Some(dad) = template.dad.as_mut()
                    && dad.ifindex == ifindex
                {
                    if dad.is_probing() {
                        dad.stop(self.prober.as_mut());
                    }
                    template.dad = None;
                }
            }
        }

        Some(link)
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Whether every static address of the link is ready and no IPv4 probe
    /// is still running.
    pub fn addresses_ready(&self, ifindex: u32) -> bool {
        let Some(link) = self.links.get(&ifindex) else {
            return false;
        };
        if !link.addresses_ready {
            return false;
        }

        let probing = link
            .network
            .and_then(|id| self.networks.get(&id))
            .is_some_and(|network| {
                network.templates().any(|(_, t)| {
                    t.dad
                        .as_ref()
                        .is_some_and(|d| d.ifindex == ifindex && d.is_probing())
                })
            });

        !probing
    }

    pub(crate) fn link_or_err(&mut self, ifindex: u32) -> Result<&mut Link> {
        self.links
            .get_mut(&ifindex)
            .ok_or(Error::LinkNotFound { ifindex })
    }

    pub(crate) fn network_of(&self, ifindex: u32) -> Option<&Network> {
        let id = self.links.get(&ifindex)?.network?;
        self.networks.get(&id)
    }

    /// Put a link into the failed state.
    pub(crate) fn link_enter_failed(&mut self, ifindex: u32) {
        let Some(link) = self.links.get_mut(&ifindex) else {
            return;
        };
        if link.state == LinkState::Failed {
            return;
        }

        warn!(ifindex, link = %link.name, "failed");
        link.state = LinkState::Failed;
        self.hooks.link_failed(ifindex);
    }

    /// Prefixes taken by addresses on any link or in any configuration.
    pub(crate) fn in_use_subnets(&self) -> Vec<Subnet> {
        let live = self
            .links
            .values()
            .flat_map(|link| link.addresses.all())
            .filter(|a| !a.is_null() && a.family != AddressFamily::Unspec);

        let templates = self
            .networks
            .values()
            .flat_map(|network| network.templates().map(|(_, t)| t))
            .filter(|a| !a.is_null() && a.family != AddressFamily::Unspec);

        live.chain(templates).map(Subnet::from).collect()
    }

    /// Handle one RTM_NEWADDR or RTM_DELADDR notification.
    ///
    /// Returns `Ok(false)` for notifications that were ignored (unknown
    /// link, unsupported family, missing address) and an
    /// [`Error::InvalidMessage`] for any other message type.
    pub fn process_address_event(&mut self, msg: &AddressMessage) -> Result<bool> {
        if !msg.is_new() && !msg.is_del() {
            return Err(Error::InvalidMessage(format!(
                "unexpected message type {} while processing addresses",
                msg.msg_type
            )));
        }

        let ifindex = msg.ifindex();
        if ifindex == 0 {
            warn!("received address message with invalid ifindex 0, ignoring");
            return Ok(false);
        }

        let Some(link) = self.links.get_mut(&ifindex) else {
            debug!(ifindex, "received address for unknown link, ignoring");
            return Ok(false);
        };

        let Some(family) = AddressFamily::from_raw(msg.family()) else {
            debug!(ifindex, link = %link.name, family = msg.family(), "received address message with invalid family, ignoring");
            return Ok(false);
        };

        let Some(in_addr) = msg.identity_address().filter(|a| AddressFamily::of(a) == family) else {
            warn!(ifindex, link = %link.name, "received address message without valid address, ignoring");
            return Ok(false);
        };

        let prefixlen = msg.prefix_len();
        let key = AddressKey::lookup(&in_addr, prefixlen);
        let cache_info = msg.cache_info.map(CacheInfo::from).unwrap_or_default();

        if msg.is_new() {
            match link.addresses.lookup(&key) {
                Lookup::NotFound => {
                    if let Err(e) = link.addresses.add_foreign(ifindex, in_addr, prefixlen) {
                        warn!(ifindex, link = %link.name, address = %format_args!("{}/{}", in_addr, prefixlen), "failed to remember foreign address, ignoring: {}", e);
                        return Ok(false);
                    }
                    debug!(ifindex, link = %link.name, address = %format_args!("{}/{}", in_addr, prefixlen), valid = cache_info.valid, "remembering foreign address");
                }
                _ => {
                    debug!(ifindex, link = %link.name, address = %format_args!("{}/{}", in_addr, prefixlen), valid = cache_info.valid, "remembering updated address");
                }
            }

            if let Some(address) = link.addresses.get_mut(&key) {
                address.prefixlen = prefixlen;
                address.label = msg.label.clone();
                address.broadcast = match msg.broadcast {
                    Some(IpAddr::V4(broadcast)) => Some(broadcast),
                    _ => None,
                };
            }

            if let Err(e) =
                self.address_update(ifindex, &key, msg.all_flags(), msg.header.ifa_scope, cache_info)
            {
                warn!(ifindex, "failed to update address: {}", e);
                self.link_enter_failed(ifindex);
            }
        } else if link.addresses.lookup(&key) != Lookup::NotFound {
            debug!(ifindex, link = %link.name, address = %format_args!("{}/{}", in_addr, prefixlen), "forgetting address");
            self.address_drop(ifindex, &key);
        } else {
            debug!(ifindex, link = %link.name, address = %format_args!("{}/{}", in_addr, prefixlen), "kernel removed an address we don't remember, ignoring");
        }

        Ok(true)
    }

    /// Record new kernel state for an address and run readiness follow-ups.
    pub(crate) fn address_update(
        &mut self,
        ifindex: u32,
        key: &AddressKey,
        flags: u32,
        scope: u8,
        cache_info: CacheInfo,
    ) -> Result<()> {
        let Some(link) = self.links.get_mut(&ifindex) else {
            return Ok(());
        };
        let failed = link.is_failed_or_linger();
        let has_ipv6ll = link.ipv6ll_address.is_some();

        let Some(address) = link.addresses.get_mut(key) else {
            return Ok(());
        };

        let was_ready = address.is_ready();
        address.flags = flags;
        address.scope = scope;
        address.cache_info = cache_info;

        if failed {
            return Ok(());
        }

        let became_ready = !was_ready && address.is_ready();
        let ipv6ll = match address.in_addr {
            IpAddr::V6(v6) if became_ready && !has_ipv6ll && address.is_ipv6_link_local() => Some(v6),
            _ => None,
        };

        self.hooks.update_operstate(ifindex);
        self.hooks.check_ready(ifindex);

        if !became_ready {
            return Ok(());
        }

        self.run_ready_callback(ifindex, key)?;

        if let Some(v6) = ipv6ll {
            if let Some(link) = self.links.get_mut(&ifindex) {
                link.ipv6ll_address = Some(v6);
            }
            self.hooks.ipv6ll_gained(ifindex, v6)?;
        }

        Ok(())
    }

    /// Run the ready callback of an address.
    ///
    /// Caller notifications are consumed. The static address callback stays
    /// armed until every static address is ready.
    pub(crate) fn run_ready_callback(&mut self, ifindex: u32, key: &AddressKey) -> Result<()> {
        let Some(address) = self
            .links
            .get_mut(&ifindex)
            .and_then(|link| link.addresses.get_mut(key))
        else {
            return Ok(());
        };

        if matches!(address.callback, Some(ReadyCallback::StaticAddress)) {
            return self.static_address_ready(ifindex);
        }

        if let Some(ReadyCallback::Notify(notify)) = address.callback.take() {
            notify(ifindex, &*address);
        }
        Ok(())
    }

    /// Forget an address the kernel removed.
    pub(crate) fn address_drop(&mut self, ifindex: u32, key: &AddressKey) {
        let Some(link) = self.links.get_mut(&ifindex) else {
            return;
        };
        let Some(mut address) = link.addresses.remove(key) else {
            return;
        };

        let ready = address.is_ready();

        if let Err(e) = masquerade::release(&mut address, self.firewall.as_mut()) {
            warn!(ifindex, link = %link.name, address = %address, "failed to disable IP masquerading, ignoring: {}", e);
        }
        drop(address);

        self.hooks.update_operstate(ifindex);

        if !ready {
            self.hooks.check_ready(ifindex);
        }
    }

    /// Arm IPv4 duplicate address detection for the link's static addresses
    /// that ask for it. Probes start when the address is configured.
    pub fn configure_ipv4_dad(&mut self, ifindex: u32) -> Result<()> {
        let link = self.links.get(&ifindex).ok_or(Error::LinkNotFound { ifindex })?;
        let mac = link.mac;
        let Some(network) = link.network.and_then(|id| self.networks.get_mut(&id)) else {
            return Ok(());
        };

        let wants_dad = |template: &Address| {
            template.family == AddressFamily::Inet
                && template.duplicate_address_detection.includes_ipv4()
                && matches!(template.in_addr, IpAddr::V4(_))
        };

        // Nothing is armed unless every template can be.
        if let Some((_, bound)) = network
            .templates()
            .find(|(_, t)| wants_dad(t) && t.dad.is_some())
        {
            return Err(Error::invalid_config(
                "DuplicateAddressDetection",
                format!("{} is already bound to a link", bound),
            ));
        }

        for (_, template) in network.templates_mut() {
            let IpAddr::V4(v4) = template.in_addr else {
                continue;
            };
            if !wants_dad(&*template) {
                continue;
            }

            debug!(ifindex, address = %template, "arming IPv4 duplicate address detection");
            template.dad = Some(Ipv4Dad::new(ifindex, mac, v4));
        }

        Ok(())
    }

    /// Handle a probe event for `address` on `ifindex`.
    ///
    /// Returns false when no running probe matches.
    pub fn process_dad_event(&mut self, ifindex: u32, address: Ipv4Addr, event: DadEvent) -> Result<bool> {
        let Some(network) = self
            .links
            .get(&ifindex)
            .and_then(|link| link.network)
            .and_then(|id| self.networks.get_mut(&id))
        else {
            return Ok(false);
        };

        let Some(template) = network.templates_mut().map(|(_, t)| t).find(|t| {
            t.dad
                .as_ref()
                .is_some_and(|d| d.ifindex == ifindex && d.address == address)
        }) else {
            debug!(ifindex, %address, ?event, "no probe for address, ignoring");
            return Ok(false);
        };

        let shown = template.to_string();
        let removal = (event == DadEvent::Conflict).then(|| AddressRequest::delete(ifindex, template));

        let Some(dad) = template.dad.as_mut() else {
            return Ok(false);
        };
        if dad.handle(event).is_none() {
            debug!(ifindex, address = %shown, ?event, "probe is not running, ignoring");
            return Ok(false);
        }

        match event {
            DadEvent::Stop => {
                debug!(ifindex, address = %shown, "stopping IPv4 duplicate address detection");
                return Ok(true);
            }
            DadEvent::Bind => {
                debug!(ifindex, address = %shown, "successfully claimed address");
            }
            DadEvent::Conflict => {
                warn!(ifindex, address = %shown, "duplicate address detected, dropping address");
            }
        }
        dad.stop(self.prober.as_mut());

        if let Some(request) = removal
            && let Err(e) = self.send_request(ifindex, request, crate::correlator::RequestKind::Remove)
        {
            error!(ifindex, address = %shown, "failed to drop conflicting address: {}", e);
        }

        self.hooks.check_ready(ifindex);
        Ok(true)
    }
}
