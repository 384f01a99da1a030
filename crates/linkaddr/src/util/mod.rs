//! Shared address and name helpers.

pub mod addr;
pub mod ifname;

pub use addr::{AddrError, mask_addr, parse_addr, parse_mac, parse_prefix};
