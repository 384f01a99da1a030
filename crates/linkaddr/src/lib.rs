//! Address reconciliation for a Linux link manager.
//!
//! This crate keeps the IP addresses of network links in line with their
//! configuration. For every link it tracks the addresses we own, the
//! addresses the kernel reports that nobody asked for, and the static
//! addresses of the link's network. Reconciliation issues RTM_NEWADDR and
//! RTM_DELADDR requests, correlates the kernel's replies, and reports when
//! all static addresses are ready so route configuration can start.
//!
//! Side effects outside the address engine are reached through traits:
//!
//! - [`Transport`](netlink::Transport) - hands requests to the kernel
//! - [`Firewall`](masquerade::Firewall) - masquerade rules
//! - [`DadProber`](dad::DadProber) - IPv4 duplicate address detection
//! - [`LinkHooks`](link::LinkHooks) - the rest of the link state machine
//!
//! # Example
//!
//! ```ignore
//! use linkaddr::driver::{self, ChannelTransport, Event};
//! use linkaddr::{Address, Link, Manager, ManagerConfig, Network};
//!
//! let (transport, requests) = ChannelTransport::new(0);
//! let mut manager = Manager::new(ManagerConfig::default(), transport);
//!
//! let mut network = Network::new("lan");
//! network.add_static_address(Address::from_prefix("192.0.2.5".parse()?, 24))?;
//! let id = manager.add_network(network);
//! manager.add_link(Link::new(2, "eth0").with_network(id));
//!
//! let (events, rx) = tokio::sync::mpsc::unbounded_channel();
//! events.send(Event::DropForeign(2))?;
//! events.send(Event::SetAddresses(2))?;
//! let manager = driver::run(manager, rx).await;
//! ```

pub mod address;
pub mod config;
mod correlator;
pub mod dad;
pub mod driver;
pub mod error;
pub mod link;
mod manager;
pub mod masquerade;
pub mod netlink;
pub mod pool;
mod reconcile;
pub mod serialize;
pub mod util;

pub use address::{Address, AddressFamily, AddressKey, CacheInfo, DadFamilies, ReadyCallback};
pub use config::{KeepConfiguration, ManagerConfig, Network, NetworkId, TemplateId};
pub use correlator::{PendingRequest, RequestKind};
pub use error::{Error, Result};
pub use link::{Link, LinkHooks, LinkState};
pub use manager::Manager;
