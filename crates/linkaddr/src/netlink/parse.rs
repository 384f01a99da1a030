//! Parser combinators and traits for strongly-typed netlink message parsing.
//!
//! # Example
//!
//! ```ignore
//! use linkaddr::netlink::parse::FromNetlink;
//! use linkaddr::netlink::messages::AddressMessage;
//!
//! let msg = AddressMessage::from_bytes(&payload)?;
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use winnow::binary::le_u16;
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::take;

use crate::error::{Error, Result};

/// Result type for winnow parsers.
pub type PResult<T> = core::result::Result<T, ErrMode<ContextError>>;

/// Trait for types that can be parsed from netlink wire format.
pub trait FromNetlink: Sized {
    /// Parse from a mutable byte slice reference.
    /// The slice is advanced past the consumed bytes.
    fn parse(input: &mut &[u8]) -> PResult<Self>;

    /// Parse from a complete byte slice.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::parse
            .parse(data)
            .map_err(|e| Error::Parse(format!("{}", e)))
    }
}

/// Build a hard parse failure.
pub fn cut() -> ErrMode<ContextError> {
    ErrMode::Cut(ContextError::new())
}

/// Parse one attribute and return (type without flags, payload).
pub fn parse_attr<'a>(input: &mut &'a [u8]) -> PResult<(u16, &'a [u8])> {
    let len = le_u16.parse_next(input)? as usize;
    let attr_type = le_u16.parse_next(input)?;

    if len < 4 {
        return Err(cut());
    }

    let payload: &[u8] = take(len - 4).parse_next(input)?;

    let padding = ((len + 3) & !3) - len;
    if input.len() >= padding {
        let _: &[u8] = take(padding).parse_next(input)?;
    }

    Ok((attr_type & 0x3FFF, payload))
}

/// Parse an IP address from raw bytes, given the address family.
pub fn parse_ip_addr(data: &[u8], family: u8) -> Result<IpAddr> {
    match (family as i32, data.len()) {
        (libc::AF_INET, 4..) => Ok(IpAddr::V4(Ipv4Addr::new(
            data[0], data[1], data[2], data[3],
        ))),
        (libc::AF_INET6, 16..) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(Error::InvalidAttribute(format!(
            "bad address payload: family {}, {} bytes",
            family,
            data.len()
        ))),
    }
}

/// Parse a null-terminated string from raw bytes.
pub fn parse_string_from_bytes(data: &[u8]) -> String {
    let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..len]).into_owned()
}

/// Read a native-endian u32 from the front of an attribute payload.
pub fn parse_u32_ne(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_ne_bytes(bytes))
}
