//! `nlmsghdr` framing and acknowledgements.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Messages and attributes are padded to this boundary.
pub const NLMSG_ALIGNTO: usize = 4;

#[inline]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

pub const NLMSG_HDRLEN: usize = nlmsg_align(std::mem::size_of::<NlMsgHdr>());

/// struct nlmsghdr.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgHdr {
    /// Total length, header included.
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    /// Port id of the sender.
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Header for an empty message of `msg_type`.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            ..Default::default()
        }
    }

    /// An acknowledgement or error reply.
    pub fn is_error(&self) -> bool {
        self.nlmsg_type == NlMsgType::ERROR
    }

    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::read_from_prefix(data)
            .map(|(hdr, _)| hdr)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Message types seen on an address socket.
pub struct NlMsgType;

impl NlMsgType {
    pub const NOOP: u16 = 1;
    /// Acknowledgement when the error code is 0.
    pub const ERROR: u16 = 2;
    /// End of a dump.
    pub const DONE: u16 = 3;

    pub const RTM_NEWADDR: u16 = 20;
    pub const RTM_DELADDR: u16 = 21;
    pub const RTM_GETADDR: u16 = 22;
}

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_ACK: u16 = 0x04;

// NEW request modifiers
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;

/// Walks the messages packed into one datagram.
///
/// Yields the header and the payload after it. A header whose length runs
/// past the buffer ends the walk with an error.
pub struct MessageIter<'a> {
    data: &'a [u8],
}

impl<'a> MessageIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<(NlMsgHdr, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLMSG_HDRLEN {
            return None;
        }

        let header = match NlMsgHdr::from_bytes(self.data) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };

        let len = header.nlmsg_len as usize;
        if !(NLMSG_HDRLEN..=self.data.len()).contains(&len) {
            self.data = &[];
            return Some(Err(Error::InvalidMessage(format!(
                "message length {} out of range",
                len
            ))));
        }

        let payload = &self.data[NLMSG_HDRLEN..len];
        let next = nlmsg_align(len).min(self.data.len());
        self.data = &self.data[next..];

        Some(Ok((header, payload)))
    }
}

/// struct nlmsgerr: the reply to a request sent with `NLM_F_ACK`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgError {
    /// 0 or a negative errno.
    pub error: i32,
    /// Header of the request being answered.
    pub msg: NlMsgHdr,
}

impl NlMsgError {
    pub fn new(error: i32, request: NlMsgHdr) -> Self {
        Self { error, msg: request }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::read_from_prefix(data)
            .map(|(err, _)| err)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }

    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    pub fn is_ack(&self) -> bool {
        self.error == 0
    }

    /// Sequence number of the answered request.
    pub fn seq(&self) -> u32 {
        self.msg.nlmsg_seq
    }
}
