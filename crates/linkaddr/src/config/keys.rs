//! Validation of `[Address]` section keys.
//!
//! The file grammar is handled elsewhere; this module receives one key/value
//! pair at a time and applies it to the matching static template.

use std::net::{IpAddr, Ipv4Addr};

use tracing::warn;

use super::{Network, TemplateId};
use crate::address::{Address, AddressFamily, DadFamilies, SectionId};
use crate::error::{Error, Result};
use crate::netlink::types::addr::{INFINITY_LIFE_TIME, Scope};
use crate::util::addr::{classful_prefixlen, parse_prefix};
use crate::util::ifname;

/// Where a key/value pair came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingContext {
    pub filename: String,
    /// Line of the assignment.
    pub line: u32,
    /// Line of the `[Address]` header, or `None` for `[Network]` keys.
    pub section_line: Option<u32>,
}

impl SettingContext {
    /// An `Address=` line inside `[Network]`.
    pub fn network(filename: impl Into<String>, line: u32) -> Self {
        Self {
            filename: filename.into(),
            line,
            section_line: None,
        }
    }

    /// A key inside an `[Address]` section starting at `section_line`.
    pub fn section(filename: impl Into<String>, section_line: u32, line: u32) -> Self {
        Self {
            filename: filename.into(),
            line,
            section_line: Some(section_line),
        }
    }

    fn section_id(&self) -> Option<SectionId> {
        self.section_line
            .map(|line| SectionId::new(self.filename.clone(), line))
    }
}

/// Apply one address setting to `network`.
///
/// A rejected value is logged and marks the section invalid, so
/// [`Network::verify_addresses`] drops it later. A rejected `[Network]`
/// `Address=` discards its template immediately. The error is returned
/// either way.
pub fn parse_address_setting(
    network: &mut Network,
    ctx: &SettingContext,
    key: &str,
    value: &str,
) -> Result<()> {
    let section = ctx.section_id();

    let id = network.new_static(section.as_ref()).inspect_err(|e| {
        warn!(
            file = %ctx.filename,
            line = ctx.line,
            "failed to allocate new address, ignoring {}={}: {}",
            key,
            value,
            e
        );
    })?;

    let Some(template) = network.template_mut(id) else {
        return Err(Error::invalid_config(key, "template vanished"));
    };

    match apply(template, ctx, key, value) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(
                file = %ctx.filename,
                line = ctx.line,
                "ignoring {}={}: {}",
                key,
                value,
                e
            );
            reject(network, id, section.is_some());
            Err(e)
        }
    }
}

fn reject(network: &mut Network, id: TemplateId, has_section: bool) {
    if has_section {
        if let Some(template) = network.template_mut(id) {
            template.section_invalid = true;
        }
    } else {
        network.remove_template(id);
    }
}

fn apply(template: &mut Address, ctx: &SettingContext, key: &str, value: &str) -> Result<()> {
    match key {
        "Address" | "Peer" => apply_address(template, ctx, key, value),
        "Broadcast" => apply_broadcast(template, value),
        "Label" => {
            if !ifname::is_valid(value) {
                return Err(Error::invalid_config(key, "interface label is not valid"));
            }
            template.label = Some(value.to_string());
            Ok(())
        }
        "PreferredLifetime" => {
            template.cache_info.preferred = match value {
                "" | "forever" | "infinity" => INFINITY_LIFE_TIME,
                "0" => 0,
                _ => {
                    return Err(Error::invalid_config(
                        key,
                        "only 'forever', 'infinity', '0' or empty are supported",
                    ));
                }
            };
            Ok(())
        }
        "HomeAddress" => {
            template.home_address = parse_bool(key, value)?;
            Ok(())
        }
        "ManageTemporaryAddress" => {
            template.manage_temporary_address = parse_bool(key, value)?;
            Ok(())
        }
        "PrefixRoute" => {
            template.prefix_route = !parse_bool(key, value)?;
            Ok(())
        }
        "AddPrefixRoute" => {
            template.prefix_route = parse_bool(key, value)?;
            Ok(())
        }
        "AutoJoin" => {
            template.autojoin = parse_bool(key, value)?;
            Ok(())
        }
        "Scope" => {
            template.scope = match Scope::from_name(value) {
                Some(scope) => scope as u8,
                None => value
                    .parse::<u8>()
                    .map_err(|_| Error::invalid_config(key, "unknown scope"))?,
            };
            template.scope_set = true;
            Ok(())
        }
        "DuplicateAddressDetection" => {
            if let Some(legacy) = boolean(value) {
                let families = if legacy {
                    DadFamilies::None
                } else {
                    DadFamilies::Both
                };
                warn!(
                    file = %ctx.filename,
                    line = ctx.line,
                    "for historical reasons, {}={} means {}={:?}; use 'both', 'ipv4', 'ipv6' or 'none' instead",
                    key,
                    value,
                    key,
                    families
                );
                template.duplicate_address_detection = families;
                return Ok(());
            }

            template.duplicate_address_detection = value
                .parse()
                .map_err(|_| Error::invalid_config(key, "unknown address family"))?;
            Ok(())
        }
        _ => Err(Error::invalid_config(key, "unknown key in [Address] section")),
    }
}

fn apply_address(template: &mut Address, ctx: &SettingContext, key: &str, value: &str) -> Result<()> {
    let (addr, prefixlen) =
        parse_prefix(value).map_err(|e| Error::invalid_config(key, e.to_string()))?;
    let family = AddressFamily::of(&addr);

    let prefixlen = match prefixlen {
        Some(prefixlen) => prefixlen,
        None => {
            let legacy = match addr {
                IpAddr::V4(v4) => classful_prefixlen(v4),
                IpAddr::V6(_) => Some(0),
            };
            let Some(legacy) = legacy else {
                return Err(Error::invalid_config(
                    key,
                    "address without prefix length outside the classful ranges",
                ));
            };
            warn!(
                file = %ctx.filename,
                line = ctx.line,
                "address '{}' has no prefix length, assuming /{}; this legacy default will be removed, please specify it",
                value,
                legacy
            );
            legacy
        }
    };

    if template.family != AddressFamily::Unspec && template.family != family {
        return Err(Error::invalid_config(
            key,
            "address is incompatible with the family of this section",
        ));
    }

    if key == "Address" {
        let min = if family == AddressFamily::Inet { 8 } else { 64 };
        if addr.is_unspecified() && prefixlen < min {
            return Err(Error::invalid_config(
                key,
                format!("null address needs a prefix length of at least {}", min),
            ));
        }
        template.in_addr = addr;
    } else {
        template.in_addr_peer = Some(addr);
    }

    template.family = family;
    template.prefixlen = prefixlen;

    if key == "Address" && template.broadcast.is_none() {
        template.broadcast = template.derive_broadcast();
    }

    Ok(())
}

fn apply_broadcast(template: &mut Address, value: &str) -> Result<()> {
    if template.family == AddressFamily::Inet6 {
        return Err(Error::invalid_config(
            "Broadcast",
            "broadcast is not valid for IPv6 addresses",
        ));
    }

    let broadcast: Ipv4Addr = value
        .parse()
        .map_err(|_| Error::invalid_config("Broadcast", "not an IPv4 address"))?;

    template.broadcast = Some(broadcast);
    template.family = AddressFamily::Inet;
    Ok(())
}

fn boolean(value: &str) -> Option<bool> {
    match value {
        "1" | "yes" | "y" | "true" | "t" | "on" => Some(true),
        "0" | "no" | "n" | "false" | "f" | "off" => Some(false),
        _ => None,
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    boolean(value).ok_or_else(|| Error::invalid_config(key, "not a boolean"))
}
