//! Common test utilities for integration tests.
//!
//! Provides a [`Harness`] wrapping a [`Manager`] whose collaborators record
//! every call, plus a small kernel simulation that answers requests with
//! the notifications and acknowledgements the kernel would send.

#![allow(dead_code)]

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use linkaddr::dad::DadProber;
use linkaddr::driver::encode_ack;
use linkaddr::masquerade::Firewall;
use linkaddr::netlink::messages::{AddressMessage, AddressMessageBuilder};
use linkaddr::netlink::types::addr::{INFINITY_LIFE_TIME, ifa_flags};
use linkaddr::netlink::{AddressOp, AddressRequest, Transport};
use linkaddr::{
    Address, AddressFamily, Error, Link, LinkHooks, Manager, ManagerConfig, Network, Result,
};

/// Interface index of the test link.
pub const IFINDEX: u32 = 2;

/// Hardware address of the test link.
pub const MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];

pub fn ip(s: &str) -> IpAddr {
    s.parse().expect("valid address")
}

/// Parse `addr/prefixlen` into a static address.
pub fn address(s: &str) -> Address {
    let (addr, prefixlen) = s.split_once('/').expect("prefix length");
    Address::from_prefix(ip(addr), prefixlen.parse().expect("numeric prefix length"))
}

/// A network with the given static addresses.
pub fn network_with(addresses: &[&str]) -> Network {
    let mut network = Network::new("test");
    for a in addresses {
        network
            .add_static_address(address(a))
            .expect("room for static address");
    }
    network
}

#[derive(Debug, Default)]
pub struct TransportState {
    pub sent: Vec<(u32, AddressRequest)>,
    pub next_seq: u32,
    pub fail: bool,
    /// Fail this many sends, then recover.
    pub fail_next: usize,
}

/// Transport that keeps every request.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport(pub Rc<RefCell<TransportState>>);

impl Transport for RecordingTransport {
    fn send(&mut self, request: &AddressRequest) -> Result<u32> {
        let mut state = self.0.borrow_mut();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::Transport("no buffer space".into()));
        }
        if state.fail {
            return Err(Error::Transport("socket closed".into()));
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        state.sent.push((seq, request.clone()));
        Ok(seq)
    }
}

#[derive(Debug, Default)]
pub struct HookState {
    pub check_ready: usize,
    pub operstate: usize,
    pub routes: Vec<u32>,
    pub failed: Vec<u32>,
    pub ipv6ll: Vec<(u32, Ipv6Addr)>,
}

/// Link hooks counting every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingHooks(pub Rc<RefCell<HookState>>);

impl LinkHooks for RecordingHooks {
    fn configure_routes(&mut self, ifindex: u32) -> Result<()> {
        self.0.borrow_mut().routes.push(ifindex);
        Ok(())
    }

    fn check_ready(&mut self, _ifindex: u32) {
        self.0.borrow_mut().check_ready += 1;
    }

    fn update_operstate(&mut self, _ifindex: u32) {
        self.0.borrow_mut().operstate += 1;
    }

    fn ipv6ll_gained(&mut self, ifindex: u32, address: Ipv6Addr) -> Result<()> {
        self.0.borrow_mut().ipv6ll.push((ifindex, address));
        Ok(())
    }

    fn link_failed(&mut self, ifindex: u32) {
        self.0.borrow_mut().failed.push(ifindex);
    }
}

/// Firewall keeping `(add, source, prefixlen)` for every change.
#[derive(Debug, Clone, Default)]
pub struct RecordingFirewall(pub Rc<RefCell<Vec<(bool, Ipv4Addr, u8)>>>);

impl Firewall for RecordingFirewall {
    fn set_masquerade(&mut self, add: bool, source: Ipv4Addr, prefixlen: u8) -> Result<()> {
        self.0.borrow_mut().push((add, source, prefixlen));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ProberState {
    pub started: Vec<(u32, Ipv4Addr)>,
    pub stopped: Vec<(u32, Ipv4Addr)>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingProber(pub Rc<RefCell<ProberState>>);

impl DadProber for RecordingProber {
    fn start(&mut self, ifindex: u32, _mac: Option<[u8; 6]>, address: Ipv4Addr) -> Result<()> {
        self.0.borrow_mut().started.push((ifindex, address));
        Ok(())
    }

    fn stop(&mut self, ifindex: u32, address: Ipv4Addr) {
        self.0.borrow_mut().stopped.push((ifindex, address));
    }
}

/// A manager with one link (`eth0`, index 2) bound to one network.
pub struct Harness {
    pub manager: Manager,
    pub transport: RecordingTransport,
    pub hooks: RecordingHooks,
    pub firewall: RecordingFirewall,
    pub prober: RecordingProber,
    /// Requests already answered by [`Harness::settle`].
    answered: usize,
}

impl Harness {
    pub fn new(network: Network) -> Self {
        Self::with_config(ManagerConfig::default(), network)
    }

    pub fn with_config(config: ManagerConfig, network: Network) -> Self {
        let transport = RecordingTransport::default();
        let hooks = RecordingHooks::default();
        let firewall = RecordingFirewall::default();
        let prober = RecordingProber::default();

        let mut manager = Manager::new(config, transport.clone())
            .with_hooks(hooks.clone())
            .with_firewall(firewall.clone())
            .with_prober(prober.clone());

        let id = manager.add_network(network);
        manager.add_link(Link::new(IFINDEX, "eth0").with_mac(MAC).with_network(id));

        Self {
            manager,
            transport,
            hooks,
            firewall,
            prober,
            answered: 0,
        }
    }

    /// Every request sent so far.
    pub fn requests(&self) -> Vec<(u32, AddressRequest)> {
        self.transport.0.borrow().sent.clone()
    }

    pub fn request_count(&self) -> usize {
        self.transport.0.borrow().sent.len()
    }

    pub fn last_request(&self) -> (u32, AddressRequest) {
        self.transport
            .0
            .borrow()
            .sent
            .last()
            .cloned()
            .expect("a request was sent")
    }

    /// Answer request `seq` with `errno` (0 for success).
    pub fn reply(&mut self, seq: u32, errno: i32) -> bool {
        self.manager.process_reply(seq, errno)
    }

    /// Feed a kernel notification.
    pub fn notify(&mut self, msg: AddressMessage) -> bool {
        self.manager
            .process_address_event(&msg)
            .expect("address message type")
    }

    /// Report `addr/prefixlen` as present with `flags` and infinite
    /// lifetimes.
    pub fn kernel_new(&mut self, s: &str, flags: u32) -> bool {
        let a = address(s);
        self.notify(
            AddressMessageBuilder::new_address()
                .ifindex(IFINDEX)
                .prefix_len(a.prefixlen)
                .address(a.in_addr)
                .flags(flags)
                .lifetimes(INFINITY_LIFE_TIME, INFINITY_LIFE_TIME)
                .build(),
        )
    }

    /// Report `addr/prefixlen` as present with finite lifetimes.
    pub fn kernel_new_dynamic(&mut self, s: &str, preferred: u32, valid: u32) -> bool {
        let a = address(s);
        self.notify(
            AddressMessageBuilder::new_address()
                .ifindex(IFINDEX)
                .prefix_len(a.prefixlen)
                .address(a.in_addr)
                .flags(0)
                .lifetimes(preferred, valid)
                .build(),
        )
    }

    /// Report `addr/prefixlen` as removed.
    pub fn kernel_del(&mut self, s: &str) -> bool {
        let a = address(s);
        self.notify(
            AddressMessageBuilder::del_address()
                .ifindex(IFINDEX)
                .prefix_len(a.prefixlen)
                .address(a.in_addr)
                .build(),
        )
    }

    /// Answer every unanswered request the way the kernel does: the
    /// notification first, then the acknowledgement. Repeats until no new
    /// request appears.
    pub fn settle(&mut self) {
        loop {
            let sent = self.requests();
            if self.answered >= sent.len() {
                return;
            }

            let batch = sent[self.answered..].to_vec();
            self.answered = sent.len();

            for (seq, request) in batch {
                self.notify(notification(&request));
                self.reply(seq, 0);
            }
        }
    }

    /// Run both passes the way the link state machine does on startup.
    pub fn configure(&mut self) -> Result<()> {
        self.manager.drop_foreign_addresses(IFINDEX)?;
        self.manager.set_addresses(IFINDEX)
    }

    pub fn check_ready_calls(&self) -> usize {
        self.hooks.0.borrow().check_ready
    }

    pub fn routes_configured(&self) -> usize {
        self.hooks.0.borrow().routes.len()
    }

    pub fn failed(&self) -> bool {
        !self.hooks.0.borrow().failed.is_empty()
    }
}

/// The notification the kernel sends after carrying out `request`.
pub fn notification(request: &AddressRequest) -> AddressMessage {
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

/// Notification followed by acknowledgement, as one datagram.
pub fn kernel_answer(seq: u32, request: &AddressRequest) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&notification(request).encode(0));
    buf.extend_from_slice(&encode_ack(seq, 0, 0));
    buf.freeze()
}
