//! Encoding of address messages.

use std::net::IpAddr;

use zerocopy::{Immutable, IntoBytes};

use super::message::{NLMSG_HDRLEN, NlMsgHdr, nlmsg_align};
use super::types::addr::IfaAttr;

/// Size of the `rtattr` header preceding each attribute payload.
pub const RTA_HDRLEN: usize = 4;

/// Byte buffer for one outgoing netlink message.
///
/// The `nlmsghdr` is written up front and its length patched in by
/// [`MessageBuilder::finish`]. Every part appended is padded to four bytes.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(NlMsgHdr::new(msg_type, flags).as_bytes());
        buf.resize(NLMSG_HDRLEN, 0);
        Self { buf }
    }

    /// Stamp the sequence number and sender port.
    pub fn sequence(&mut self, seq: u32, pid: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
    }

    /// Append the family header (`ifaddrmsg`, `nlmsgerr`).
    pub fn header<T: IntoBytes + Immutable>(&mut self, header: &T) {
        self.buf.extend_from_slice(header.as_bytes());
        self.pad();
    }

    pub fn attr(&mut self, kind: IfaAttr, payload: &[u8]) {
        let len = (RTA_HDRLEN + payload.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&(kind as u16).to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.pad();
    }

    pub fn attr_u32(&mut self, kind: IfaAttr, value: u32) {
        self.attr(kind, &value.to_ne_bytes());
    }

    /// NUL terminated, as the kernel expects for `IFA_LABEL`.
    pub fn attr_str(&mut self, kind: IfaAttr, value: &str) {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.attr(kind, &payload);
    }

    /// Address in network byte order.
    pub fn attr_addr(&mut self, kind: IfaAttr, addr: &IpAddr) {
        match addr {
            IpAddr::V4(v4) => self.attr(kind, &v4.octets()),
            IpAddr::V6(v6) => self.attr(kind, &v6.octets()),
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }

    fn pad(&mut self) {
        let aligned = nlmsg_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }
}
