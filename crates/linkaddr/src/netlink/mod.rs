//! Kernel address message wire format.
//!
//! Only the subset of rtnetlink needed for address reconciliation lives
//! here: the `nlmsghdr` framing, attributes, `ifaddrmsg` and the two
//! address message types. Socket I/O is left to the [`Transport`]
//! implementation.
//!
//! # Example
//!
//! ```ignore
//! use linkaddr::netlink::{AddressRequest, MessageIter, NlMsgType};
//! use linkaddr::netlink::messages::AddressMessage;
//!
//! let bytes = AddressRequest::configure(2, &address, false).encode(1, 0);
//! for msg in MessageIter::new(&bytes) {
//!     let (header, payload) = msg?;
//!     if header.nlmsg_type == NlMsgType::RTM_NEWADDR {
//!         let parsed = AddressMessage::from_payload(header.nlmsg_type, payload)?;
//!         println!("{:?}", parsed.identity_address());
//!     }
//! }
//! ```

mod builder;
pub mod message;
pub mod messages;
pub mod parse;
mod request;
pub mod types;

pub use builder::MessageBuilder;
pub use message::{MessageIter, NLMSG_HDRLEN, NlMsgError, NlMsgHdr, NlMsgType};
pub use request::{AddressOp, AddressRequest, Transport};
