//! Masquerade rules tied to address lifetime.

use std::net::{IpAddr, Ipv4Addr};

use crate::address::{Address, AddressFamily};
use crate::error::{Error, Result};
use crate::netlink::types::addr::Scope;

/// Installs and removes source NAT rules.
pub trait Firewall {
    /// Add or remove masquerading for `source/prefixlen`.
    fn set_masquerade(&mut self, add: bool, source: Ipv4Addr, prefixlen: u8) -> Result<()>;
}

/// Firewall that accepts every change without doing anything.
#[derive(Debug, Default)]
pub struct NoFirewall;

impl Firewall for NoFirewall {
    fn set_masquerade(&mut self, _add: bool, _source: Ipv4Addr, _prefixlen: u8) -> Result<()> {
        Ok(())
    }
}

/// Whether `address` should be masqueraded given the network setting.
pub fn wants_masquerade(address: &Address, enabled: bool) -> bool {
    enabled && address.family == AddressFamily::Inet && address.scope < Scope::Link as u8
}

fn rule_source(address: &Address) -> Result<Ipv4Addr> {
    match address.masked() {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(Error::Firewall(format!(
            "{} is not an IPv4 address",
            address
        ))),
    }
}

/// Bring the rule for `address` in line with the desired state.
///
/// No call is made when the recorded state already matches.
pub fn establish(address: &mut Address, enabled: bool, firewall: &mut dyn Firewall) -> Result<()> {
    let wanted = wants_masquerade(address, enabled);
    if wanted == address.ip_masquerade_done {
        return Ok(());
    }

    firewall.set_masquerade(wanted, rule_source(address)?, address.prefixlen)?;
    address.ip_masquerade_done = wanted;
    Ok(())
}

/// Remove the rule for `address` if one is installed.
pub fn release(address: &mut Address, firewall: &mut dyn Firewall) -> Result<()> {
    if !address.ip_masquerade_done {
        return Ok(());
    }

    firewall.set_masquerade(false, rule_source(address)?, address.prefixlen)?;
    address.ip_masquerade_done = false;
    Ok(())
}
