//! In-process stand-in for the kernel side of the route socket.
//!
//! Every request is carried out at once: the kernel announces the address
//! change and then acknowledges the request, in one datagram.

use std::net::IpAddr;

use bytes::{Bytes, BytesMut};
use linkaddr::AddressFamily;
use linkaddr::driver::encode_ack;
use linkaddr::netlink::messages::{AddressMessage, AddressMessageBuilder};
use linkaddr::netlink::types::addr::{INFINITY_LIFE_TIME, ifa_flags};
use linkaddr::netlink::{AddressOp, AddressRequest};

/// Netlink port id used for requests and replies.
pub const PORT_ID: u32 = 4242;

/// Answer to `request`: notification first, then the acknowledgement.
pub fn answer(seq: u32, request: &AddressRequest) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&notification(request).encode(0));
    buf.extend_from_slice(&encode_ack(seq, PORT_ID, 0));
    buf.freeze()
}

fn notification(request: &AddressRequest) -> AddressMessage {
    // IPv6 point-to-point addresses are reported under the peer.
    let identity = match (request.family, request.peer) {
        (AddressFamily::Inet6, Some(peer)) => peer,
        _ => request.local,
    };

    let builder = match request.op {
        AddressOp::Add | AddressOp::Replace => {
            let info = request.cache_info.unwrap_or_default();
            AddressMessageBuilder::new_address()
                .flags((request.flags | ifa_flags::PERMANENT) & !ifa_flags::TENTATIVE)
                .lifetimes(info.preferred, info.valid)
        }
        AddressOp::Delete => AddressMessageBuilder::del_address(),
    };

    let mut builder = builder
        .ifindex(request.ifindex)
        .prefix_len(request.prefixlen)
        .scope(request.scope)
        .address(identity);

    if let Some(broadcast) = request.broadcast {
        builder = builder.broadcast(broadcast);
    }
    if let Some(ref label) = request.label {
        builder = builder.label(label.clone());
    }
    builder.build()
}

/// Dump entry for an address found on the link before the run.
pub fn existing(ifindex: u32, addr: IpAddr, prefixlen: u8, dynamic: bool) -> Bytes {
    let (flags, preferred, valid) = if dynamic {
        (0, 1800, 3600)
    } else {
        (ifa_flags::PERMANENT, INFINITY_LIFE_TIME, INFINITY_LIFE_TIME)
    };

    let msg = AddressMessageBuilder::new_address()
        .ifindex(ifindex)
        .prefix_len(prefixlen)
        .address(addr)
        .flags(flags)
        .lifetimes(preferred, valid)
        .build();
    Bytes::from(msg.encode(0))
}
