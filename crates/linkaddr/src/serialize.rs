//! The `ADDRESSES=` state line.
//!
//! The owned addresses of a link are written to its state file as
//!
//! ```text
//! ADDRESSES=192.0.2.5/24 2001:db8::1/64
//! ```
//!
//! and read back on restart, before the first kernel dump, so that
//! addresses we configured are not mistaken for foreign ones.

use std::fmt::Write as _;
use std::net::IpAddr;

use tracing::debug;

use crate::Manager;
use crate::address::{Address, AddressFamily};
use crate::error::{Error, Result};

const KEY: &str = "ADDRESSES=";

/// Format addresses as one state line, newline terminated.
pub fn format_addresses<'a>(addresses: impl IntoIterator<Item = &'a Address>) -> String {
    let mut line = String::from(KEY);
    let mut first = true;

    for address in addresses {
        if !first {
            line.push(' ');
        }
        first = false;
        let _ = write!(line, "{}/{}", address.in_addr, address.prefixlen);
    }

    line.push('\n');
    line
}

/// Parse a state line, with or without the `ADDRESSES=` key.
///
/// Malformed tokens are skipped.
pub fn parse_addresses(value: &str) -> Vec<(IpAddr, u8)> {
    let value = value.trim();
    let value = value.strip_prefix(KEY).unwrap_or(value);

    value
        .split_whitespace()
        .filter_map(|token| match parse_token(token) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(token, "failed to parse address, ignoring: {}", e);
                None
            }
        })
        .collect()
}

fn parse_token(token: &str) -> Result<(IpAddr, u8)> {
    let (addr, prefixlen) = token
        .rsplit_once('/')
        .ok_or_else(|| Error::Parse(format!("missing prefix length in '{}'", token)))?;

    let prefixlen: u8 = prefixlen
        .parse()
        .map_err(|_| Error::Parse(format!("invalid prefix length in '{}'", token)))?;

    let addr: IpAddr = addr
        .parse()
        .map_err(|_| Error::Parse(format!("invalid address in '{}'", token)))?;

    if prefixlen > AddressFamily::of(&addr).max_prefixlen() {
        return Err(Error::Parse(format!("prefix length too long in '{}'", token)));
    }

    Ok((addr, prefixlen))
}

impl Manager {
    /// State line of the link's owned addresses.
    pub fn serialize_addresses(&self, ifindex: u32) -> Result<String> {
        let link = self
            .links
            .get(&ifindex)
            .ok_or(Error::LinkNotFound { ifindex })?;
        Ok(format_addresses(link.addresses.owned()))
    }

    /// Restore owned addresses from a state line. Returns how many entries
    /// were read.
    pub fn deserialize_addresses(&mut self, ifindex: u32, value: &str) -> Result<usize> {
        let link = self
            .links
            .get_mut(&ifindex)
            .ok_or(Error::LinkNotFound { ifindex })?;

        let parsed = parse_addresses(value);
        for (addr, prefixlen) in &parsed {
            link.addresses.add(ifindex, *addr, *prefixlen);
        }

        debug!(ifindex, link = %link.name, count = parsed.len(), "restored addresses");
        Ok(parsed.len())
    }
}
