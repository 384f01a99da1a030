//! Strongly-typed netlink messages.

mod address;

pub use address::{AddressMessage, AddressMessageBuilder};
