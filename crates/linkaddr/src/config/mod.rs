//! Network configuration and manager settings.
//!
//! A [`Network`] holds the static address templates declared for links that
//! use it, indexed by configuration section so a re-parse updates the same
//! template. [`ManagerConfig`] carries the manager-wide limits and address
//! pools.
//!
//! # Example
//!
//! ```ignore
//! use linkaddr::config::{KeepConfiguration, Network, SettingContext, parse_address_setting};
//!
//! let mut network = Network::new("lan");
//! network.keep_configuration = KeepConfiguration::Dhcp;
//!
//! let ctx = SettingContext::section("lan.network", 3, 4);
//! parse_address_setting(&mut network, &ctx, "Address", "192.0.2.5/24")?;
//! parse_address_setting(&mut network, &ctx, "Label", "lan0")?;
//! network.verify_addresses();
//! ```

mod keys;

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use keys::{SettingContext, parse_address_setting};

use crate::address::{Address, AddressFamily, Owner, SectionId};
use crate::error::{Error, Result};

/// Live addresses allowed on one link.
pub const ADDRESSES_PER_LINK_MAX: usize = 2048;

/// Static addresses allowed in one network configuration.
pub const STATIC_ADDRESSES_PER_NETWORK_MAX: usize = 1024;

/// Identifier of a network configuration registered with the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkId(pub u32);

/// Identifier of a static template inside its network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TemplateId(pub u32);

/// Which foreign addresses survive the drop-foreign pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepConfiguration {
    #[default]
    No,
    /// Keep addresses that look DHCP assigned.
    Dhcp,
    /// Keep addresses that look statically assigned.
    Static,
    Yes,
}

impl KeepConfiguration {
    pub fn keeps_dynamic(self) -> bool {
        matches!(self, Self::Dhcp | Self::Yes)
    }

    pub fn keeps_static(self) -> bool {
        matches!(self, Self::Static | Self::Yes)
    }
}

impl FromStr for KeepConfiguration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" | "false" | "0" | "off" => Ok(Self::No),
            "dhcp" | "dhcp-on-stop" => Ok(Self::Dhcp),
            "static" => Ok(Self::Static),
            "yes" | "true" | "1" | "on" => Ok(Self::Yes),
            _ => Err(Error::invalid_config(
                "KeepConfiguration",
                format!("unknown policy '{}'", s),
            )),
        }
    }
}

/// An IPv6 prefix handed out by router advertisements or prefix delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegatedPrefix {
    pub prefix: Ipv6Addr,
    pub prefixlen: u8,
    /// Assign an EUI-64 address from this prefix to the link.
    pub assign: bool,
}

/// Network configuration shared by the links that match it.
#[derive(Debug)]
pub struct Network {
    pub id: NetworkId,
    pub name: String,
    pub keep_configuration: KeepConfiguration,
    pub ip_masquerade: bool,
    /// The link manages its own IPv6 link-local address.
    pub link_local_ipv6: bool,
    pub prefixes: Vec<DelegatedPrefix>,
    templates: BTreeMap<TemplateId, Address>,
    by_section: HashMap<SectionId, TemplateId>,
    next_template: u32,
    static_max: usize,
}

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NetworkId::default(),
            name: name.into(),
            keep_configuration: KeepConfiguration::No,
            ip_masquerade: false,
            link_local_ipv6: true,
            prefixes: Vec::new(),
            templates: BTreeMap::new(),
            by_section: HashMap::new(),
            next_template: 0,
            static_max: STATIC_ADDRESSES_PER_NETWORK_MAX,
        }
    }

    /// Set the static address cap.
    pub fn with_static_limit(mut self, limit: usize) -> Self {
        self.static_max = limit;
        self
    }

    /// Record the id assigned by the manager and point templates at it.
    pub(crate) fn set_id(&mut self, id: NetworkId) {
        self.id = id;
        for template in self.templates.values_mut() {
            template.owner = Owner::Network(id);
        }
    }

    /// Get the template for `section`, or create one.
    ///
    /// Without a section a fresh template is always created. Fails with
    /// [`Error::TooManyAddresses`] when the network is full.
    pub fn new_static(&mut self, section: Option<&SectionId>) -> Result<TemplateId> {
        if let Some(section) = section
            && let Some(id) = self.by_section.get(section)
        {
            return Ok(*id);
        }

        if self.templates.len() >= self.static_max {
            return Err(Error::TooManyAddresses {
                limit: self.static_max,
            });
        }

        let id = TemplateId(self.next_template);
        self.next_template += 1;

        let mut address = Address::new();
        address.owner = Owner::Network(self.id);

        if let Some(section) = section {
            address.section = Some(section.clone());
            self.by_section.insert(section.clone(), id);
        }

        self.templates.insert(id, address);
        Ok(id)
    }

    /// Add a fully built static address.
    pub fn add_static_address(&mut self, mut address: Address) -> Result<TemplateId> {
        let id = self.new_static(None)?;
        address.owner = Owner::Network(self.id);
        address.section = None;
        self.templates.insert(id, address);
        Ok(id)
    }

    pub fn template(&self, id: TemplateId) -> Option<&Address> {
        self.templates.get(&id)
    }

    pub fn template_mut(&mut self, id: TemplateId) -> Option<&mut Address> {
        self.templates.get_mut(&id)
    }

    /// Templates in declaration order.
    pub fn templates(&self) -> impl Iterator<Item = (TemplateId, &Address)> {
        self.templates.iter().map(|(id, a)| (*id, a))
    }

    pub fn templates_mut(&mut self) -> impl Iterator<Item = (TemplateId, &mut Address)> {
        self.templates.iter_mut().map(|(id, a)| (*id, a))
    }

    pub fn template_ids(&self) -> Vec<TemplateId> {
        self.templates.keys().copied().collect()
    }

    /// Remove a template and its section index entry.
    pub fn remove_template(&mut self, id: TemplateId) -> Option<Address> {
        let address = self.templates.remove(&id)?;
        if let Some(ref section) = address.section {
            self.by_section.remove(section);
        }
        Some(address)
    }

    pub fn static_address_count(&self) -> usize {
        self.templates.len()
    }

    /// Find the template configured with the same identity as `address`, or,
    /// for IPv6, whose peer equals it.
    pub fn find_static(&self, address: &Address) -> Option<TemplateId> {
        self.templates.iter().find_map(|(id, template)| {
            let peer_match = address.family == AddressFamily::Inet6
                && template.in_addr_peer == Some(address.in_addr);
            (template == address || peer_match).then_some(*id)
        })
    }

    /// Drop templates that failed validation or never got an address, and
    /// give loopback addresses host scope.
    pub fn verify_addresses(&mut self) {
        let invalid: Vec<TemplateId> = self
            .templates
            .iter()
            .filter(|(_, a)| a.section_invalid || a.family == AddressFamily::Unspec)
            .map(|(id, _)| *id)
            .collect();

        for id in invalid {
            if let Some(address) = self.remove_template(id) {
                warn!(
                    network = %self.name,
                    section = ?address.section.as_ref().map(ToString::to_string),
                    "dropping invalid [Address] section"
                );
            }
        }

        for template in self.templates.values_mut() {
            if !template.scope_set && is_loopback(&template.in_addr) {
                template.scope = crate::netlink::types::addr::Scope::Host as u8;
            }
        }
    }
}

fn is_loopback(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// One address pool, as written in the manager configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub prefix: IpAddr,
    pub prefixlen: u8,
}

impl PoolConfig {
    pub fn new(prefix: IpAddr, prefixlen: u8) -> Self {
        Self { prefix, prefixlen }
    }
}

/// Manager-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub pools: Vec<PoolConfig>,
    pub addresses_per_link_max: usize,
    pub static_addresses_per_network_max: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        use std::net::Ipv4Addr;

        Self {
            pools: vec![
                PoolConfig::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 8),
                PoolConfig::new(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 0)), 12),
                PoolConfig::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 0)), 16),
                PoolConfig::new(IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0)), 8),
            ],
            addresses_per_link_max: ADDRESSES_PER_LINK_MAX,
            static_addresses_per_network_max: STATIC_ADDRESSES_PER_NETWORK_MAX,
        }
    }
}

impl ManagerConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
