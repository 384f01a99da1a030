//! addrplan command - plan and simulate link address reconciliation.
//!
//! Builds a network from `Address=` values, runs the reconciliation engine
//! against an in-process kernel and prints the requests it would send.

mod kernel;

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use linkaddr::config::{DelegatedPrefix, SettingContext, parse_address_setting};
use linkaddr::driver::{self, ChannelTransport, Event};
use linkaddr::masquerade::Firewall;
use linkaddr::netlink::AddressRequest;
use linkaddr::util::addr::{max_prefixlen, parse_mac, parse_prefix};
use linkaddr::{KeepConfiguration, Link, LinkHooks, Manager, ManagerConfig, Network};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Interface index of the simulated link.
const IFINDEX: u32 = 2;

#[derive(Parser)]
#[command(name = "addrplan", version, about = "Link address reconciliation planner")]
struct Cli {
    /// Static address, as in an `Address=` line (repeatable).
    #[arg(short = 'a', long = "address", value_name = "ADDR[/LEN]")]
    addresses: Vec<String>,

    /// Address already on the link, statically assigned (repeatable).
    #[arg(long = "foreign", value_name = "ADDR[/LEN]")]
    foreign: Vec<String>,

    /// Address already on the link, with finite lifetimes (repeatable).
    #[arg(long = "dynamic", value_name = "ADDR[/LEN]")]
    dynamic: Vec<String>,

    /// IPv6 prefix to assign an EUI-64 address from (repeatable).
    #[arg(long = "prefix", value_name = "PREFIX/LEN")]
    prefixes: Vec<String>,

    /// Which foreign addresses to keep: no, dhcp, static or yes.
    #[arg(short = 'k', long, default_value = "no")]
    keep: String,

    /// Hardware address of the link.
    #[arg(short = 'm', long)]
    mac: Option<String>,

    /// Interface name.
    #[arg(short = 'd', long, default_value = "eth0")]
    dev: String,

    /// Masquerade traffic from the configured IPv4 subnets.
    #[arg(long)]
    masquerade: bool,

    /// Manager configuration (JSON).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// State file line from a previous run, e.g. `ADDRESSES=192.0.2.5/24`.
    #[arg(short = 'r', long, value_name = "LINE")]
    restore: Option<String>,

    /// Print the state file line.
    #[arg(short = 's', long)]
    state: bool,

    /// Give up waiting for the link after this many milliseconds.
    #[arg(short = 't', long, default_value_t = 1000)]
    timeout: u64,

    /// Output JSON.
    #[arg(short = 'j', long)]
    json: bool,

    /// Pretty print JSON.
    #[arg(short = 'p', long)]
    pretty: bool,
}

/// How the link ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ready,
    Failed,
}

/// Hooks reporting the link outcome over a channel.
struct Signal(mpsc::UnboundedSender<Outcome>);

impl LinkHooks for Signal {
    fn configure_routes(&mut self, ifindex: u32) -> linkaddr::Result<()> {
        debug!(ifindex, "addresses ready");
        let _ = self.0.send(Outcome::Ready);
        Ok(())
    }

    fn check_ready(&mut self, _ifindex: u32) {}

    fn update_operstate(&mut self, _ifindex: u32) {}

    fn ipv6ll_gained(&mut self, ifindex: u32, address: Ipv6Addr) -> linkaddr::Result<()> {
        info!(ifindex, %address, "link-local address gained");
        Ok(())
    }

    fn link_failed(&mut self, _ifindex: u32) {
        let _ = self.0.send(Outcome::Failed);
    }
}

/// Firewall that only remembers the rules it was asked for.
#[derive(Clone, Default)]
struct RuleLog(Rc<RefCell<Vec<String>>>);

impl Firewall for RuleLog {
    fn set_masquerade(&mut self, add: bool, source: Ipv4Addr, prefixlen: u8) -> linkaddr::Result<()> {
        let op = if add { "add" } else { "del" };
        self.0
            .borrow_mut()
            .push(format!("masquerade {} {}/{}", op, source, prefixlen));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ManagerConfig::from_json(&json)?
        }
        None => ManagerConfig::default(),
    };

    let network = build_network(&cli, &config)?;

    let mut link = Link::new(IFINDEX, cli.dev.clone());
    if let Some(ref mac) = cli.mac {
        link = link.with_mac(parse_mac(mac)?);
    }

    let mut dump = Vec::new();
    for (values, dynamic) in [(&cli.foreign, false), (&cli.dynamic, true)] {
        for value in values {
            let (addr, prefixlen) = host_prefix(value)?;
            dump.push(kernel::existing(IFINDEX, addr, prefixlen, dynamic));
        }
    }

    let (transport, mut requests) = ChannelTransport::new(kernel::PORT_ID);
    let (signal, mut outcomes) = mpsc::unbounded_channel();
    let rules = RuleLog::default();

    let mut manager = Manager::new(config, transport)
        .with_hooks(Signal(signal))
        .with_firewall(rules.clone());
    let id = manager.add_network(network);
    manager.add_link(link.with_network(id));
    if let Some(ref line) = cli.restore {
        let restored = manager.deserialize_addresses(IFINDEX, line)?;
        debug!(restored, "restored addresses");
    }

    let (events, rx) = mpsc::unbounded_channel();
    for datagram in dump {
        events.send(Event::KernelMessage(datagram))?;
    }
    events.send(Event::DropForeign(IFINDEX))?;
    events.send(Event::SetAddresses(IFINDEX))?;

    let timeout = Duration::from_millis(cli.timeout);
    let kernel = async move {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut sent: Vec<AddressRequest> = Vec::new();
        let outcome = loop {
            tokio::select! {
                biased;
                Some(outbound) = requests.recv() => {
                    let reply = kernel::answer(outbound.seq, &outbound.request);
                    sent.push(outbound.request);
                    if events.send(Event::KernelMessage(reply)).is_err() {
                        break None;
                    }
                }
                Some(outcome) = outcomes.recv() => break Some(outcome),
                _ = &mut deadline => break None,
                else => break None,
            }
        };
        drop(events);
        (sent, outcome)
    };

    let (manager, (sent, outcome)) = tokio::join!(driver::run(manager, rx), kernel);

    let ready = manager.addresses_ready(IFINDEX);
    let state = if cli.state {
        Some(manager.serialize_addresses(IFINDEX)?)
    } else {
        None
    };
    let rules = rules.0.borrow().clone();

    if cli.json {
        let output = serde_json::json!({
            "dev": cli.dev,
            "requests": sent,
            "masquerade": rules,
            "ready": ready,
            "state": state.as_deref().map(str::trim_end),
        });
        if cli.pretty {
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!("{}", serde_json::to_string(&output)?);
        }
    } else {
        for request in &sent {
            println!("{}", request);
        }
        for rule in &rules {
            println!("{}", rule);
        }
        println!("{}: {}", cli.dev, if ready { "ready" } else { "not ready" });
        if let Some(state) = state {
            print!("{}", state);
        }
    }

    match outcome {
        Some(Outcome::Failed) => bail!("{}: address configuration failed", cli.dev),
        None if !ready => bail!("{}: timed out waiting for addresses", cli.dev),
        _ => Ok(()),
    }
}

fn build_network(cli: &Cli, config: &ManagerConfig) -> anyhow::Result<Network> {
    let mut network =
        Network::new("command line").with_static_limit(config.static_addresses_per_network_max);
    network.keep_configuration = cli.keep.parse::<KeepConfiguration>()?;
    network.ip_masquerade = cli.masquerade;

    for (i, value) in cli.addresses.iter().enumerate() {
        let ctx = SettingContext::network("command line", i as u32 + 1);
        parse_address_setting(&mut network, &ctx, "Address", value)?;
    }
    network.verify_addresses();

    for value in &cli.prefixes {
        let (addr, prefixlen) = parse_prefix(value)?;
        let (IpAddr::V6(prefix), Some(prefixlen)) = (addr, prefixlen) else {
            bail!("prefix must be IPv6 with a length: {}", value);
        };
        network.prefixes.push(DelegatedPrefix {
            prefix,
            prefixlen,
            assign: true,
        });
    }

    Ok(network)
}

/// Parse `addr[/len]`; a missing length means a host address.
fn host_prefix(value: &str) -> anyhow::Result<(IpAddr, u8)> {
    let (addr, prefixlen) = parse_prefix(value)?;
    Ok((addr, prefixlen.unwrap_or_else(|| max_prefixlen(&addr))))
}
