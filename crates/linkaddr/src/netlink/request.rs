//! Outgoing address requests and the transport seam.
//!
//! An [`AddressRequest`] is a snapshot of what one RTM_NEWADDR or
//! RTM_DELADDR message carries. The [`Transport`] hands it to the kernel and
//! returns the sequence number the reply will be correlated by.

use std::net::{IpAddr, Ipv4Addr};

use serde::Serialize;

use super::builder::MessageBuilder;
use super::message::{NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST, NlMsgType};
use super::types::addr::{IfAddrMsg, IfaAttr, IfaCacheinfo};
use crate::address::{Address, AddressFamily, CacheInfo};
use crate::error::Result;

/// Kind of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressOp {
    /// New address, fails if it exists.
    Add,
    /// Create or update in place.
    Replace,
    Delete,
}

/// One address request as sent to the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressRequest {
    pub op: AddressOp,
    pub ifindex: u32,
    pub family: AddressFamily,
    pub prefixlen: u8,
    pub flags: u32,
    pub scope: u8,
    pub local: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_info: Option<CacheInfo>,
}

impl AddressRequest {
    /// Request configuring `address` on `ifindex`. `update` selects replace
    /// semantics.
    pub fn configure(ifindex: u32, address: &Address, update: bool) -> Self {
        let peer = address.in_addr_peer.filter(|p| !p.is_unspecified());

        Self {
            op: if update {
                AddressOp::Replace
            } else {
                AddressOp::Add
            },
            ifindex,
            family: address.family,
            prefixlen: address.prefixlen,
            flags: address.request_flags(),
            scope: address.scope,
            local: address.in_addr,
            peer,
            broadcast: address.request_broadcast(),
            label: address.label.clone(),
            cache_info: Some(address.cache_info),
        }
    }

    /// Request removing `address` from `ifindex`.
    pub fn delete(ifindex: u32, address: &Address) -> Self {
        Self {
            op: AddressOp::Delete,
            ifindex,
            family: address.family,
            prefixlen: address.prefixlen,
            flags: 0,
            scope: 0,
            local: address.in_addr,
            peer: address.in_addr_peer.filter(|p| !p.is_unspecified()),
            broadcast: None,
            label: None,
            cache_info: None,
        }
    }

    /// Netlink message type.
    pub fn msg_type(&self) -> u16 {
        match self.op {
            AddressOp::Add | AddressOp::Replace => NlMsgType::RTM_NEWADDR,
            AddressOp::Delete => NlMsgType::RTM_DELADDR,
        }
    }

    /// Netlink header flags.
    pub fn nlmsg_flags(&self) -> u16 {
        match self.op {
            AddressOp::Add => NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            AddressOp::Replace => NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
            AddressOp::Delete => NLM_F_REQUEST | NLM_F_ACK,
        }
    }

    /// Encode as a complete netlink message.
    pub fn encode(&self, seq: u32, pid: u32) -> Vec<u8> {
        let mut builder = MessageBuilder::new(self.msg_type(), self.nlmsg_flags());
        builder.sequence(seq, pid);

        let header = IfAddrMsg::new()
            .with_family(self.family.as_raw())
            .with_prefixlen(self.prefixlen)
            .with_flags(self.flags)
            .with_scope(self.scope)
            .with_index(self.ifindex);
        builder.header(&header);

        if self.flags > 0xff {
            builder.attr_u32(IfaAttr::Flags, self.flags);
        }

        builder.attr_addr(IfaAttr::Local, &self.local);

        if let Some(ref peer) = self.peer {
            builder.attr_addr(IfaAttr::Address, peer);
        } else if let Some(broadcast) = self.broadcast {
            builder.attr_addr(IfaAttr::Broadcast, &IpAddr::V4(broadcast));
        }

        if let Some(ref label) = self.label {
            builder.attr_str(IfaAttr::Label, label);
        }

        if let Some(info) = self.cache_info {
            let info = IfaCacheinfo::from(info);
            builder.attr(IfaAttr::Cacheinfo, info.as_bytes());
        }

        builder.finish()
    }
}

impl std::fmt::Display for AddressRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.op {
            AddressOp::Add => "add",
            AddressOp::Replace => "replace",
            AddressOp::Delete => "del",
        };
        write!(f, "{} {}/{}", op, self.local, self.prefixlen)?;
        if let Some(peer) = self.peer {
            write!(f, " peer {}", peer)?;
        }
        if let Some(broadcast) = self.broadcast {
            write!(f, " brd {}", broadcast)?;
        }
        if let Some(ref label) = self.label {
            write!(f, " label {}", label)?;
        }
        write!(f, " dev {}", self.ifindex)
    }
}

/// Sends requests to the kernel.
pub trait Transport {
    /// Queue `request` and return its sequence number.
    fn send(&mut self, request: &AddressRequest) -> Result<u32>;
}
