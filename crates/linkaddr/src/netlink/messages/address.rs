//! Strongly-typed address message.

use std::net::{IpAddr, Ipv4Addr};

use winnow::prelude::*;
use winnow::token::take;

use crate::netlink::builder::MessageBuilder;
use crate::netlink::message::{NLM_F_REQUEST, NlMsgType};
use crate::netlink::parse::{
    FromNetlink, PResult, cut, parse_attr, parse_ip_addr, parse_string_from_bytes, parse_u32_ne,
};
use crate::netlink::types::addr::{IfAddrMsg, IfaAttr, IfaCacheinfo, ifa_flags};

/// Address notification or request with all attributes parsed.
#[derive(Debug, Clone, Default)]
pub struct AddressMessage {
    /// RTM_NEWADDR or RTM_DELADDR, taken from the netlink header.
    pub msg_type: u16,
    /// Fixed-size header.
    pub header: IfAddrMsg,
    /// Address (IFA_ADDRESS).
    pub address: Option<IpAddr>,
    /// Local address (IFA_LOCAL).
    pub local: Option<IpAddr>,
    /// Interface label (IFA_LABEL).
    pub label: Option<String>,
    /// Broadcast address (IFA_BROADCAST).
    pub broadcast: Option<IpAddr>,
    /// Extended flags (IFA_FLAGS).
    pub flags: Option<u32>,
    /// Cache info (IFA_CACHEINFO).
    pub cache_info: Option<IfaCacheinfo>,
}

impl AddressMessage {
    /// Parse a message payload, recording the netlink message type.
    pub fn from_payload(msg_type: u16, payload: &[u8]) -> crate::Result<Self> {
        let mut msg = Self::from_bytes(payload)?;
        msg.msg_type = msg_type;
        Ok(msg)
    }

    /// Check if this announces a new or changed address.
    pub fn is_new(&self) -> bool {
        self.msg_type == NlMsgType::RTM_NEWADDR
    }

    /// Check if this announces a removed address.
    pub fn is_del(&self) -> bool {
        self.msg_type == NlMsgType::RTM_DELADDR
    }

    /// Get the address family.
    pub fn family(&self) -> u8 {
        self.header.ifa_family
    }

    /// Get the prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.header.ifa_prefixlen
    }

    /// Get the interface index.
    pub fn ifindex(&self) -> u32 {
        self.header.ifa_index
    }

    /// Full flag word: IFA_FLAGS when present, the header byte otherwise.
    pub fn all_flags(&self) -> u32 {
        self.flags.unwrap_or(self.header.ifa_flags as u32)
    }

    /// Check if this address is tentative.
    pub fn is_tentative(&self) -> bool {
        self.all_flags() & ifa_flags::TENTATIVE != 0
    }

    /// The address identifying this entry: IFA_LOCAL for IPv4, IFA_ADDRESS
    /// for IPv6.
    pub fn identity_address(&self) -> Option<IpAddr> {
        match self.family() as i32 {
            libc::AF_INET => self.local,
            libc::AF_INET6 => self.address,
            _ => None,
        }
    }

    /// Encode as a complete netlink message.
    pub fn encode(&self, seq: u32) -> Vec<u8> {
        let mut builder = MessageBuilder::new(self.msg_type, NLM_F_REQUEST);
        builder.sequence(seq, 0);
        builder.header(&self.header);

        if let Some(ref addr) = self.address {
            builder.attr_addr(IfaAttr::Address, addr);
        }
        if let Some(ref addr) = self.local {
            builder.attr_addr(IfaAttr::Local, addr);
        }
        if let Some(ref label) = self.label {
            builder.attr_str(IfaAttr::Label, label);
        }
        if let Some(ref addr) = self.broadcast {
            builder.attr_addr(IfaAttr::Broadcast, addr);
        }
        if let Some(ref info) = self.cache_info {
            builder.attr(IfaAttr::Cacheinfo, info.as_bytes());
        }
        if let Some(flags) = self.flags {
            builder.attr_u32(IfaAttr::Flags, flags);
        }

        builder.finish()
    }
}

impl FromNetlink for AddressMessage {
    fn parse(input: &mut &[u8]) -> PResult<Self> {
        if input.len() < IfAddrMsg::SIZE {
            return Err(cut());
        }

        let header_bytes: &[u8] = take(IfAddrMsg::SIZE).parse_next(input)?;
        let header = IfAddrMsg::from_bytes(header_bytes).map_err(|_| cut())?;

        let mut msg = AddressMessage {
            header,
            ..Default::default()
        };

        while input.len() >= 4 {
            let Ok((attr_type, attr_data)) = parse_attr(input) else {
                break;
            };

            match IfaAttr::from(attr_type) {
                IfaAttr::Address => {
                    msg.address = parse_ip_addr(attr_data, header.ifa_family).ok();
                }
                IfaAttr::Local => {
                    msg.local = parse_ip_addr(attr_data, header.ifa_family).ok();
                }
                IfaAttr::Label => {
                    msg.label = Some(parse_string_from_bytes(attr_data));
                }
                IfaAttr::Broadcast => {
                    msg.broadcast = parse_ip_addr(attr_data, header.ifa_family).ok();
                }
                IfaAttr::Flags => {
                    msg.flags = parse_u32_ne(attr_data);
                }
                IfaAttr::Cacheinfo => {
                    msg.cache_info = IfaCacheinfo::from_bytes(attr_data);
                }
                _ => {}
            }
        }

        // Trailing bytes too short for an attribute are ignored.
        *input = &[];

        Ok(msg)
    }
}

/// Builder for constructing AddressMessage.
#[derive(Debug, Clone, Default)]
pub struct AddressMessageBuilder {
    msg: AddressMessage,
}

impl AddressMessageBuilder {
    /// Start a RTM_NEWADDR notification.
    pub fn new_address() -> Self {
        let mut builder = Self::default();
        builder.msg.msg_type = NlMsgType::RTM_NEWADDR;
        builder
    }

    /// Start a RTM_DELADDR notification.
    pub fn del_address() -> Self {
        let mut builder = Self::default();
        builder.msg.msg_type = NlMsgType::RTM_DELADDR;
        builder
    }

    /// Set the interface index.
    pub fn ifindex(mut self, index: u32) -> Self {
        self.msg.header.ifa_index = index;
        self
    }

    /// Set the prefix length.
    pub fn prefix_len(mut self, len: u8) -> Self {
        self.msg.header.ifa_prefixlen = len;
        self
    }

    /// Set the scope.
    pub fn scope(mut self, scope: u8) -> Self {
        self.msg.header.ifa_scope = scope;
        self
    }

    /// Set the address the way the kernel reports it: IPv4 in both
    /// IFA_LOCAL and IFA_ADDRESS, IPv6 in IFA_ADDRESS only.
    pub fn address(mut self, addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => {
                self.msg.header.ifa_family = libc::AF_INET as u8;
                self.msg.local = Some(addr);
            }
            IpAddr::V6(_) => self.msg.header.ifa_family = libc::AF_INET6 as u8,
        }
        self.msg.address = Some(addr);
        self
    }

    /// Set the label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.msg.label = Some(label.into());
        self
    }

    /// Set the IPv4 broadcast address.
    pub fn broadcast(mut self, broadcast: Ipv4Addr) -> Self {
        self.msg.broadcast = Some(IpAddr::V4(broadcast));
        self
    }

    /// Set the full flag word. Extended bits go into IFA_FLAGS.
    pub fn flags(mut self, flags: u32) -> Self {
        self.msg.header.ifa_flags = (flags & 0xff) as u8;
        self.msg.flags = Some(flags);
        self
    }

    /// Set preferred and valid lifetimes.
    pub fn lifetimes(mut self, preferred: u32, valid: u32) -> Self {
        self.msg.cache_info = Some(IfaCacheinfo::with_lifetimes(preferred, valid));
        self
    }

    /// Build the message.
    pub fn build(self) -> AddressMessage {
        self.msg
    }
}
