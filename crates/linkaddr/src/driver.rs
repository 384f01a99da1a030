//! Single-task event loop around the [`Manager`].
//!
//! Everything that can happen to the engine arrives as an [`Event`] on one
//! channel: reconciliation triggers from the link state machine, raw kernel
//! messages (notifications and acknowledgements), and probe events. The loop
//! handles one event at a time, so no two handlers ever run concurrently.
//!
//! Requests leave through a [`ChannelTransport`], which encodes them and
//! forwards them to whatever owns the netlink socket.
//!
//! # Example
//!
//! ```ignore
//! use linkaddr::driver::{self, ChannelTransport, Event};
//!
//! let (transport, mut requests) = ChannelTransport::new(0);
//! let (events, rx) = tokio::sync::mpsc::unbounded_channel();
//! let manager = Manager::new(ManagerConfig::default(), transport);
//!
//! events.send(Event::SetAddresses(2))?;
//! drop(events);
//! let manager = driver::run(manager, rx).await;
//! ```

use std::net::Ipv4Addr;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace, warn};

use crate::Manager;
use crate::dad::DadEvent;
use crate::error::{Error, Result};
use crate::netlink::messages::AddressMessage;
use crate::netlink::{AddressRequest, MessageBuilder, MessageIter, NlMsgError, NlMsgHdr, NlMsgType, Transport};

/// Input of the event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// Run the apply pass.
    SetAddresses(u32),
    /// Run the drop-foreign pass.
    DropForeign(u32),
    /// Remove every owned address.
    DropAll(u32),
    /// Arm IPv4 duplicate address detection.
    ConfigureDad(u32),
    /// One or more netlink messages as read from the socket.
    KernelMessage(Bytes),
    /// Completion of a request, for transports that decode replies
    /// themselves.
    Reply { seq: u32, errno: i32 },
    /// Probe event.
    Dad {
        ifindex: u32,
        address: Ipv4Addr,
        event: DadEvent,
    },
}

/// Run the event loop until the sender side is dropped, then hand the
/// manager back.
pub async fn run(mut manager: Manager, rx: mpsc::UnboundedReceiver<Event>) -> Manager {
    let mut events = UnboundedReceiverStream::new(rx);

    while let Some(event) = events.next().await {
        trace!(?event, "event");
        if let Err(e) = manager.dispatch(event) {
            warn!("event failed: {}", e);
        }
    }

    debug!("event channel closed, stopping");
    manager
}

impl Manager {
    /// Handle one event.
    pub fn dispatch(&mut self, event: Event) -> Result<()> {
        match event {
            Event::SetAddresses(ifindex) => self.set_addresses(ifindex),
            Event::DropForeign(ifindex) => self.drop_foreign_addresses(ifindex),
            Event::DropAll(ifindex) => self.drop_all_addresses(ifindex),
            Event::ConfigureDad(ifindex) => self.configure_ipv4_dad(ifindex),
            Event::KernelMessage(data) => self.process_kernel_message(&data),
            Event::Reply { seq, errno } => {
                self.process_reply(seq, errno);
                Ok(())
            }
            Event::Dad {
                ifindex,
                address,
                event,
            } => self.process_dad_event(ifindex, address, event).map(|_| ()),
        }
    }

    /// Feed a datagram from the netlink socket.
    ///
    /// Acknowledgements complete pending requests, address notifications
    /// update the stores. Other message types are skipped.
    pub fn process_kernel_message(&mut self, data: &[u8]) -> Result<()> {
        for msg in MessageIter::new(data) {
            let (header, payload) = msg?;

            match header.nlmsg_type {
                NlMsgType::ERROR => {
                    let err = NlMsgError::from_bytes(payload)?;
                    self.process_reply(header.nlmsg_seq, err.error);
                }
                NlMsgType::RTM_NEWADDR | NlMsgType::RTM_DELADDR => {
                    let msg = AddressMessage::from_payload(header.nlmsg_type, payload)?;
                    self.process_address_event(&msg)?;
                }
                NlMsgType::NOOP | NlMsgType::DONE => {}
                other => {
                    debug!(msg_type = other, "skipping netlink message");
                }
            }
        }
        Ok(())
    }
}

/// An encoded request on its way to the socket.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub seq: u32,
    pub request: AddressRequest,
    pub bytes: Bytes,
}

/// Transport forwarding encoded requests over a channel.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundRequest>,
    next_seq: u32,
    pid: u32,
}

impl ChannelTransport {
    /// Create a transport and the receiver its requests arrive on. `pid` is
    /// the port id written into every header.
    pub fn new(pid: u32) -> (Self, mpsc::UnboundedReceiver<OutboundRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_seq: 1,
                pid,
            },
            rx,
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, request: &AddressRequest) -> Result<u32> {
        let seq = self.next_seq;
        // Sequence 0 is what unsolicited notifications carry.
        self.next_seq = self.next_seq.wrapping_add(1).max(1);

        let bytes = Bytes::from(request.encode(seq, self.pid));
        self.tx
            .send(OutboundRequest {
                seq,
                request: request.clone(),
                bytes,
            })
            .map_err(|_| Error::Transport("request channel closed".into()))?;

        Ok(seq)
    }
}

/// Encode the kernel's answer to request `seq`: an ACK when `errno` is 0,
/// an error otherwise (`errno` negative).
pub fn encode_ack(seq: u32, pid: u32, errno: i32) -> Bytes {
    let mut request = NlMsgHdr::new(NlMsgType::RTM_NEWADDR, 0);
    request.nlmsg_seq = seq;
    request.nlmsg_pid = pid;

    let mut builder = MessageBuilder::new(NlMsgType::ERROR, 0);
    builder.sequence(seq, pid);
    builder.header(&NlMsgError::new(errno, request));
    Bytes::from(builder.finish())
}
