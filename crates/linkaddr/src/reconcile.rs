//! Reconciliation passes.
//!
//! The drop-foreign pass removes (or adopts) addresses found on the link
//! that nobody asked for. The apply pass brings the static addresses of the
//! link's network, plus EUI-64 addresses from delegated prefixes, onto the
//! link. Both passes can be repeated: addresses that already match what is
//! configured produce no requests.

use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, error, warn};

use crate::Manager;
use crate::address::{Address, AddressKey, Lookup, PoolLease, ReadyCallback};
use crate::config::{KeepConfiguration, TemplateId};
use crate::correlator::RequestKind;
use crate::dad::DadState;
use crate::error::{Error, Result};
use crate::link::LinkState;
use crate::masquerade;
use crate::netlink::AddressRequest;
use crate::pool::{Subnet, subnet_address};
use crate::util::addr::eui64_address;

/// One entry of the apply pass.
struct Desired {
    template: Option<TemplateId>,
    address: Address,
    /// Always use replace semantics.
    force_update: bool,
}

impl Manager {
    /// Remove addresses the kernel reports on the link that we did not
    /// request, honoring the network's `KeepConfiguration=` policy.
    ///
    /// Foreign addresses matching a static template are adopted instead of
    /// removed; the following apply pass updates them in place.
    pub fn drop_foreign_addresses(&mut self, ifindex: u32) -> Result<()> {
        let link = self
            .links
            .get(&ifindex)
            .ok_or(Error::LinkNotFound { ifindex })?;
        let network = link.network.and_then(|id| self.networks.get(&id));
        let keep = network.map_or(KeepConfiguration::No, |n| n.keep_configuration);
        let link_local_managed = network.is_some_and(|n| n.link_local_ipv6);

        let mut adopt = Vec::new();
        let mut remove = Vec::new();

        for address in link.addresses.foreign() {
            if link_local_managed && address.is_ipv6_link_local() {
                continue;
            }

            // DHCP leases may carry infinite lifetimes; a DHCP route using the
            // address as its source marks it dynamic as well.
            let dynamic = address.cache_info.is_preferred_finite()
                || link.has_dhcp_route_from(address.family, &address.in_addr);

            if dynamic && keep.keeps_dynamic() {
                continue;
            }
            if !dynamic && keep.keeps_static() {
                continue;
            }

            if network.and_then(|n| n.find_static(address)).is_some() {
                adopt.push((address.in_addr, address.prefixlen));
            } else {
                remove.push(AddressRequest::delete(ifindex, address));
            }
        }

        if let Some(link) = self.links.get_mut(&ifindex) {
            for (in_addr, prefixlen) in adopt {
                debug!(ifindex, link = %link.name, address = %format_args!("{}/{}", in_addr, prefixlen), "adopting foreign address");
                link.addresses.add(ifindex, in_addr, prefixlen);
            }
        }

        // Keep going after a failed send, report the first failure.
        let mut result = Ok(());
        for request in remove {
            if let Err(e) = self.send_request(ifindex, request, RequestKind::RemoveStatic)
                && result.is_ok()
            {
                result = Err(e);
            }
        }

        result
    }

    /// Remove every address we own on the link, except a link-local address
    /// the link manages itself, and return pool subnets.
    ///
    /// Every address is attempted and every lease released even when a
    /// request cannot be sent; the first such error is returned.
    pub fn drop_all_addresses(&mut self, ifindex: u32) -> Result<()> {
        let link = self
            .links
            .get(&ifindex)
            .ok_or(Error::LinkNotFound { ifindex })?;
        let link_local_managed = link
            .network
            .and_then(|id| self.networks.get(&id))
            .is_some_and(|n| n.link_local_ipv6);

        let targets: Vec<_> = link
            .addresses
            .owned()
            .filter(|a| !(link_local_managed && a.is_ipv6_link_local()))
            .map(|a| (a.key(), AddressRequest::delete(ifindex, a)))
            .collect();

        let mut result = Ok(());
        for (key, request) in targets {
            if let Err(e) = self.send_request(ifindex, request, RequestKind::RemoveStatic)
                && result.is_ok()
            {
                result = Err(e);
            }

            let lease = self
                .links
                .get_mut(&ifindex)
                .and_then(|link| link.addresses.take_lease(&key));
            if let Some(lease) = lease {
                self.pool.release(&Subnet::from(&lease.address));
            }
        }

        result
    }

    /// Apply the link's static addresses.
    ///
    /// Deferred while removals are in flight; the last removal reply reruns
    /// it. When nothing needed a request the address stage completes at
    /// once.
    pub fn set_addresses(&mut self, ifindex: u32) -> Result<()> {
        let link = self
            .links
            .get_mut(&ifindex)
            .ok_or(Error::LinkNotFound { ifindex })?;

        if link.network.is_none() {
            debug!(ifindex, link = %link.name, "no network configuration, not setting addresses");
            return Ok(());
        }

        if link.counters.pending_removals > 0 {
            debug!(ifindex, link = %link.name, pending = link.counters.pending_removals, "removing old addresses, deferring");
            link.counters.deferred_apply = true;
            return Ok(());
        }

        link.counters.deferred_apply = false;
        link.addresses_configured = false;
        link.addresses_ready = false;

        let desired = self.desired_addresses(ifindex)?;

        debug!(ifindex, count = desired.len(), "setting addresses");

        for entry in desired {
            self.configure(
                ifindex,
                entry.template,
                entry.address,
                entry.force_update,
                RequestKind::Configure,
                None,
            )
            .inspect_err(|e| warn!(ifindex, "could not set addresses: {}", e))?;
        }

        let link = self
            .links
            .get_mut(&ifindex)
            .ok_or(Error::LinkNotFound { ifindex })?;

        if link.counters.pending_adds > 0 {
            link.state = LinkState::Configuring;
            return Ok(());
        }

        debug!(ifindex, link = %link.name, "addresses set");
        link.addresses_configured = true;
        self.static_address_ready(ifindex)
    }

    fn desired_addresses(&self, ifindex: u32) -> Result<Vec<Desired>> {
        let Some(link) = self.links.get(&ifindex) else {
            return Ok(Vec::new());
        };
        let Some(network) = link.network.and_then(|id| self.networks.get(&id)) else {
            return Ok(Vec::new());
        };

        let mut desired: Vec<Desired> = network
            .templates()
            .map(|(id, template)| Desired {
                template: Some(id),
                address: template.detached_copy(),
                force_update: false,
            })
            .collect();

        for prefix in network.prefixes.iter().filter(|p| p.assign) {
            let mac = link.mac.ok_or_else(|| {
                Error::invalid_config(
                    "Prefix",
                    format!(
                        "{} has no hardware address to derive an address in {}/{}",
                        link.name, prefix.prefix, prefix.prefixlen
                    ),
                )
            })?;

            desired.push(Desired {
                template: None,
                address: Address::from_prefix(
                    IpAddr::V6(eui64_address(prefix.prefix, mac)),
                    prefix.prefixlen,
                ),
                force_update: true,
            });
        }

        Ok(desired)
    }

    /// Configure an address on behalf of another producer (DHCP, IPv4LL,
    /// router advertisements). The reply never moves the link's counters;
    /// a failure other than `EEXIST` fails the link.
    pub fn configure_address(
        &mut self,
        ifindex: u32,
        address: Address,
        update: bool,
        callback: Option<ReadyCallback>,
    ) -> Result<()> {
        self.configure(ifindex, None, address, update, RequestKind::External, callback)
    }

    /// Ask the kernel to remove one owned address. The entry is forgotten
    /// when the kernel's RTM_DELADDR arrives.
    pub fn remove_address(&mut self, ifindex: u32, in_addr: IpAddr, prefixlen: u8) -> Result<()> {
        let link = self
            .links
            .get(&ifindex)
            .ok_or(Error::LinkNotFound { ifindex })?;

        let key = AddressKey::lookup(&in_addr, prefixlen);
        let request = match link.addresses.lookup(&key) {
            Lookup::Owned => link
                .addresses
                .get(&key)
                .map(|address| AddressRequest::delete(ifindex, address)),
            Lookup::Foreign | Lookup::NotFound => None,
        }
        .ok_or_else(|| Error::NoSuchAddress {
            address: format!("{}/{}", in_addr, prefixlen),
        })?;

        self.send_request(ifindex, request, RequestKind::Remove)?;
        Ok(())
    }

    pub(crate) fn configure(
        &mut self,
        ifindex: u32,
        template: Option<TemplateId>,
        address: Address,
        update: bool,
        kind: RequestKind,
        callback: Option<ReadyCallback>,
    ) -> Result<()> {
        let max = self.config.addresses_per_link_max;
        let link = self
            .links
            .get(&ifindex)
            .ok_or(Error::LinkNotFound { ifindex })?;

        if link.addresses.lookup(&address.live_key()) != Lookup::Owned
            && link.addresses.len() >= max
        {
            error!(ifindex, link = %link.name, address = %address, "too many addresses on link");
            return Err(Error::TooManyAddresses { limit: max });
        }

        let address = if address.is_null() {
            self.pool_address(ifindex, template, &address)?
        } else {
            address
        };

        let live_key = address.live_key();
        let masquerade = self.network_of(ifindex).is_some_and(|n| n.ip_masquerade);

        let Some(link) = self.links.get_mut(&ifindex) else {
            return Err(Error::LinkNotFound { ifindex });
        };
        let found = link.addresses.lookup(&live_key);

        if kind == RequestKind::Configure
            && found == Lookup::Owned
            && let Some(live) = link.addresses.get_mut(&live_key)
            && live.satisfies(&address)
        {
            debug!(ifindex, link = %link.name, address = %address, "address already configured");
            live.callback = Some(ReadyCallback::StaticAddress);
            link.addresses.mark_static(live_key);
            if let Some(id) = template {
                self.start_ipv4_dad(ifindex, id);
            }
            return Ok(());
        }

        // The kernel refuses to create an address it already has, kept
        // foreign entries included.
        let request =
            AddressRequest::configure(ifindex, &address, update || found != Lookup::NotFound);
        self.send_request(ifindex, request, kind)?;

        let Some(link) = self.links.get_mut(&ifindex) else {
            return Err(Error::LinkNotFound { ifindex });
        };
        let (key, before) = link
            .addresses
            .add(ifindex, address.live_address(), address.prefixlen);

        if let Some(live) = link.addresses.get_mut(&key) {
            if before == Lookup::NotFound {
                live.scope = address.scope;
                live.cache_info = address.cache_info;
                live.label = address.label.clone();
                live.broadcast = address.broadcast;
            }

            match kind {
                RequestKind::Configure => live.callback = Some(ReadyCallback::StaticAddress),
                RequestKind::External => live.callback = callback,
                RequestKind::Remove | RequestKind::RemoveStatic => {}
            }

            if let Err(e) = masquerade::establish(live, masquerade, self.firewall.as_mut()) {
                warn!(ifindex, link = %link.name, address = %live, "could not enable IP masquerading: {}", e);
            }
        }

        if kind == RequestKind::Configure {
            link.addresses.mark_static(key);
        }

        if let Some(id) = template {
            self.start_ipv4_dad(ifindex, id);
        }

        Ok(())
    }

    /// Start the probe of a template armed for this link, once.
    fn start_ipv4_dad(&mut self, ifindex: u32, id: TemplateId) {
        let Some(template) = self
            .links
            .get(&ifindex)
            .and_then(|link| link.network)
            .and_then(|network| self.networks.get_mut(&network))
            .and_then(|network| network.template_mut(id))
        else {
            return;
        };
        let shown = template.to_string();

        let Some(dad) = template.dad.as_mut() else {
            return;
        };
        if dad.ifindex != ifindex || dad.state() != DadState::None {
            return;
        }

        debug!(ifindex, address = %shown, "starting IPv4 duplicate address detection");
        if let Err(e) = dad.start(self.prober.as_mut()) {
            warn!(ifindex, address = %shown, "failed to start IPv4 duplicate address detection: {}", e);
        }
    }

    /// Resolve a null address through the pool. A template keeps the subnet
    /// it was given before.
    fn pool_address(
        &mut self,
        ifindex: u32,
        template: Option<TemplateId>,
        address: &Address,
    ) -> Result<Address> {
        let reused = template.and_then(|id| {
            self.links
                .get(&ifindex)?
                .addresses
                .lease_for_template(id)
                .map(|lease| (lease.address.in_addr, lease.address.broadcast))
        });

        let (in_addr, broadcast) = match reused {
            Some(found) => found,
            None => {
                let in_use = self.in_use_subnets();
                let subnet = self
                    .pool
                    .acquire(address.family, address.prefixlen, &in_use)
                    .inspect_err(|e| warn!(ifindex, address = %address, "could not acquire pool address: {}", e))?;
                let (in_addr, broadcast) = subnet_address(&subnet);

                if let Some(link) = self.links.get_mut(&ifindex) {
                    link.addresses.push_lease(PoolLease {
                        template,
                        address: pool_copy(address, in_addr, broadcast),
                    });
                }
                (in_addr, broadcast)
            }
        };

        debug!(ifindex, template = %address, address = %in_addr, "using pool address");
        Ok(pool_copy(address, in_addr, broadcast))
    }
}

/// Concrete address for a pool placeholder. Only scope, lifetimes and label
/// carry over from the template.
fn pool_copy(template: &Address, in_addr: IpAddr, broadcast: Option<Ipv4Addr>) -> Address {
    let mut address = Address::from_prefix(in_addr, template.prefixlen);
    address.scope = template.scope;
    address.scope_set = template.scope_set;
    address.cache_info = template.cache_info;
    address.label = template.label.clone();
    address.broadcast = broadcast;
    address
}
