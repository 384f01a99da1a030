//! Address parsing, masking and derivation helpers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Error type for address parsing.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid prefix length: {0}")]
    InvalidPrefix(String),

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
}

pub type Result<T> = std::result::Result<T, AddrError>;

/// Parse an IP address from string.
pub fn parse_addr(s: &str) -> Result<IpAddr> {
    s.parse()
        .map_err(|_| AddrError::InvalidAddress(s.to_string()))
}

/// Parse `address[/prefixlen]`. The prefix length is `None` when absent.
pub fn parse_prefix(s: &str) -> Result<(IpAddr, Option<u8>)> {
    let Some((addr_str, prefix_str)) = s.rsplit_once('/') else {
        return Ok((parse_addr(s)?, None));
    };

    let addr = parse_addr(addr_str)?;
    let prefix: u8 = prefix_str
        .parse()
        .map_err(|_| AddrError::InvalidPrefix(prefix_str.to_string()))?;

    let max_prefix = max_prefixlen(&addr);
    if prefix > max_prefix {
        return Err(AddrError::InvalidPrefix(format!(
            "{} exceeds maximum {} for address family",
            prefix, max_prefix
        )));
    }

    Ok((addr, Some(prefix)))
}

/// Width of the address in bits.
pub fn max_prefixlen(addr: &IpAddr) -> u8 {
    if addr.is_ipv4() { 32 } else { 128 }
}

/// Legacy classful prefix length for an IPv4 address given without one.
///
/// Class A gives /8, class B /16, class C /24. Anything else has no
/// default.
pub fn classful_prefixlen(addr: Ipv4Addr) -> Option<u8> {
    let first = addr.octets()[0];
    match first {
        0..=127 => Some(8),
        128..=191 => Some(16),
        192..=223 => Some(24),
        _ => None,
    }
}

/// Clear the host bits of `addr`.
pub fn mask_addr(addr: &IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mask = (!0u32).checked_shl(32 - u32::from(prefix_len.min(32))).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(u32::from(*v4) & mask))
        }
        IpAddr::V6(v6) => {
            let mask = (!0u128)
                .checked_shl(128 - u32::from(prefix_len.min(128)))
                .unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(u128::from(*v6) & mask))
        }
    }
}

/// Whether `addr` is in `fe80::/10`.
pub fn is_ipv6_link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

/// Build an address from a /64 prefix and a MAC using modified EUI-64.
pub fn eui64_address(prefix: Ipv6Addr, mac: [u8; 6]) -> Ipv6Addr {
    let mut octets = prefix.octets();

    octets[8] = mac[0] ^ 0x02;
    octets[9] = mac[1];
    octets[10] = mac[2];
    octets[11] = 0xff;
    octets[12] = 0xfe;
    octets[13] = mac[3];
    octets[14] = mac[4];
    octets[15] = mac[5];

    Ipv6Addr::from(octets)
}

/// Parse a MAC address from string.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(AddrError::InvalidMac(s.to_string()));
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).map_err(|_| AddrError::InvalidMac(s.to_string()))?;
    }

    Ok(mac)
}

/// Format a MAC address.
pub fn format_mac(bytes: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

/// Check if an IPv4 address is in a given prefix.
pub fn ipv4_in_prefix(addr: Ipv4Addr, prefix_addr: Ipv4Addr, prefix_len: u8) -> bool {
    if prefix_len == 0 {
        return true;
    }
    if prefix_len > 32 {
        return false;
    }

    let mask = !0u32 << (32 - prefix_len);
    let addr_bits = u32::from(addr);
    let prefix_bits = u32::from(prefix_addr);

    (addr_bits & mask) == (prefix_bits & mask)
}

/// Check if an IPv6 address is in a given prefix.
pub fn ipv6_in_prefix(addr: Ipv6Addr, prefix_addr: Ipv6Addr, prefix_len: u8) -> bool {
    if prefix_len == 0 {
        return true;
    }
    if prefix_len > 128 {
        return false;
    }

    let addr_bits = u128::from(addr);
    let prefix_bits = u128::from(prefix_addr);
    let mask = !0u128 << (128 - prefix_len);

    (addr_bits & mask) == (prefix_bits & mask)
}
