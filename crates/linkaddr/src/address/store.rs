//! Per-link address sets.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use super::{Address, AddressFamily, AddressKey, Owner};
use crate::config::TemplateId;
use crate::error::{Error, Result};
use crate::netlink::types::addr::ifa_flags;

/// Where an address was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Created by us.
    Owned,
    /// Observed from the kernel.
    Foreign,
    NotFound,
}

/// An address obtained from the pool, with the template it was filled for.
#[derive(Debug)]
pub struct PoolLease {
    pub template: Option<TemplateId>,
    pub address: Address,
}

/// The owned, foreign, static and pool sets of one link.
///
/// An entity lives in at most one of the owned/foreign sets. The static set
/// only names owned entries.
#[derive(Debug, Default)]
pub struct AddressStore {
    addresses: BTreeMap<AddressKey, Address>,
    addresses_foreign: BTreeMap<AddressKey, Address>,
    static_addresses: BTreeSet<AddressKey>,
    pool_addresses: Vec<PoolLease>,
}

impl AddressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find which set holds `key`.
    pub fn lookup(&self, key: &AddressKey) -> Lookup {
        if self.addresses.contains_key(key) {
            Lookup::Owned
        } else if self.addresses_foreign.contains_key(key) {
            Lookup::Foreign
        } else {
            Lookup::NotFound
        }
    }

    /// Get an owned or foreign entry.
    pub fn get(&self, key: &AddressKey) -> Option<&Address> {
        self.addresses
            .get(key)
            .or_else(|| self.addresses_foreign.get(key))
    }

    pub fn get_mut(&mut self, key: &AddressKey) -> Option<&mut Address> {
        match self.addresses.get_mut(key) {
            Some(address) => Some(address),
            None => self.addresses_foreign.get_mut(key),
        }
    }

    /// Number of owned addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Record an address the kernel reported but we did not create.
    ///
    /// Fails with `EEXIST` when the address is already known.
    pub fn add_foreign(&mut self, ifindex: u32, in_addr: IpAddr, prefixlen: u8) -> Result<AddressKey> {
        let address = new_live(ifindex, in_addr, prefixlen);
        let key = address.key();

        if self.lookup(&key) != Lookup::NotFound {
            return Err(Error::from_errno(-libc::EEXIST));
        }

        self.addresses_foreign.insert(key, address);
        Ok(key)
    }

    /// Take ownership of an address.
    ///
    /// A foreign entry with the same identity is moved to the owned set.
    /// Otherwise a new tentative entry is created. Returns the key and where
    /// the address was found before the call.
    pub fn add(&mut self, ifindex: u32, in_addr: IpAddr, prefixlen: u8) -> (AddressKey, Lookup) {
        let key = AddressKey::lookup(&in_addr, prefixlen);

        match self.lookup(&key) {
            Lookup::Owned => (key, Lookup::Owned),
            Lookup::Foreign => {
                if let Some(address) = self.addresses_foreign.remove(&key) {
                    self.addresses.insert(key, address);
                }
                (key, Lookup::Foreign)
            }
            Lookup::NotFound => {
                self.addresses.insert(key, new_live(ifindex, in_addr, prefixlen));
                (key, Lookup::NotFound)
            }
        }
    }

    /// Remove an entry from every set.
    pub fn remove(&mut self, key: &AddressKey) -> Option<Address> {
        self.static_addresses.remove(key);
        self.addresses
            .remove(key)
            .or_else(|| self.addresses_foreign.remove(key))
    }

    pub fn owned(&self) -> impl Iterator<Item = &Address> {
        self.addresses.values()
    }

    pub fn foreign(&self) -> impl Iterator<Item = &Address> {
        self.addresses_foreign.values()
    }

    /// Owned and foreign entries, in key order within each set.
    pub fn all(&self) -> impl Iterator<Item = &Address> {
        self.owned().chain(self.foreign())
    }

    pub fn owned_keys(&self) -> Vec<AddressKey> {
        self.addresses.keys().copied().collect()
    }

    pub fn foreign_keys(&self) -> Vec<AddressKey> {
        self.addresses_foreign.keys().copied().collect()
    }

    /// Mark an owned entry as static. Returns false if it is not owned.
    pub fn mark_static(&mut self, key: AddressKey) -> bool {
        if !self.addresses.contains_key(&key) {
            return false;
        }
        self.static_addresses.insert(key);
        true
    }

    pub fn is_static(&self, key: &AddressKey) -> bool {
        self.static_addresses.contains(key)
    }

    pub fn static_keys(&self) -> impl Iterator<Item = &AddressKey> {
        self.static_addresses.iter()
    }

    pub fn statics(&self) -> impl Iterator<Item = &Address> {
        self.static_addresses
            .iter()
            .filter_map(|key| self.addresses.get(key))
    }

    /// First static address in key order.
    pub fn first_static_mut(&mut self) -> Option<&mut Address> {
        let key = *self.static_addresses.iter().next()?;
        self.addresses.get_mut(&key)
    }

    /// Drop the ready callback of every static address.
    pub fn clear_static_callbacks(&mut self) {
        for key in &self.static_addresses {
            if let Some(address) = self.addresses.get_mut(key) {
                address.callback = None;
            }
        }
    }

    /// Whether every static address has left the tentative state.
    pub fn statics_ready(&self) -> bool {
        self.statics().all(Address::is_ready)
    }

    /// Record a pool lease. Newest leases come first.
    pub fn push_lease(&mut self, lease: PoolLease) {
        self.pool_addresses.insert(0, lease);
    }

    pub fn leases(&self) -> &[PoolLease] {
        &self.pool_addresses
    }

    pub fn lease_for_template(&self, template: TemplateId) -> Option<&PoolLease> {
        self.pool_addresses
            .iter()
            .find(|lease| lease.template == Some(template))
    }

    /// Remove the lease whose address has identity `key`.
    pub fn take_lease(&mut self, key: &AddressKey) -> Option<PoolLease> {
        let pos = self
            .pool_addresses
            .iter()
            .position(|lease| lease.address.key() == *key)?;
        Some(self.pool_addresses.remove(pos))
    }

    /// Remove every lease.
    pub fn take_leases(&mut self) -> Vec<PoolLease> {
        std::mem::take(&mut self.pool_addresses)
    }

    /// Families present among owned and foreign entries.
    pub fn families(&self) -> BTreeSet<AddressFamily> {
        self.all().map(|a| a.family).collect()
    }
}

fn new_live(ifindex: u32, in_addr: IpAddr, prefixlen: u8) -> Address {
    let mut address = Address::from_prefix(in_addr, prefixlen);
    address.flags = ifa_flags::TENTATIVE;
    address.owner = Owner::Link(ifindex);
    address
}
