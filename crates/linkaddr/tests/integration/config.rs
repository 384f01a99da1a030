//! Configuration keys through to kernel requests.

use std::net::Ipv4Addr;

use linkaddr::config::{SettingContext, parse_address_setting};
use linkaddr::netlink::types::addr::{Scope, ifa_flags};
use linkaddr::{ManagerConfig, Network, Result};

use crate::common::{Harness, IFINDEX, ip};

const FILE: &str = "10-lan.network";

fn section(network: &mut Network, header: u32, settings: &[(&str, &str)]) {
    for (i, (key, value)) in settings.iter().enumerate() {
        let ctx = SettingContext::section(FILE, header, header + 1 + i as u32);
        let _ = parse_address_setting(network, &ctx, key, value);
    }
}

#[test]
fn test_sections_to_requests() -> Result<()> {
    let mut network = Network::new("lan");
    section(
        &mut network,
        1,
        &[
            ("Address", "192.0.2.5/24"),
            ("Label", "lan0"),
            ("Scope", "link"),
            ("AddPrefixRoute", "no"),
        ],
    );
    section(
        &mut network,
        10,
        &[
            ("Address", "2001:db8::5/64"),
            ("Peer", "192.0.2.1/24"),
        ],
    );
    section(
        &mut network,
        20,
        &[("Address", "2001:db8::7/64"), ("ManageTemporaryAddress", "yes")],
    );
    network.verify_addresses();
    assert_eq!(network.static_address_count(), 2);

    let mut h = Harness::new(network);
    h.configure()?;

    let requests = h.requests();
    assert_eq!(requests.len(), 2);

    let v4 = &requests[0].1;
    assert_eq!(v4.local, ip("192.0.2.5"));
    assert_eq!(v4.label.as_deref(), Some("lan0"));
    assert_eq!(v4.scope, Scope::Link as u8);
    assert_eq!(v4.broadcast, Some(Ipv4Addr::new(192, 0, 2, 255)));
    assert_ne!(v4.flags & ifa_flags::NOPREFIXROUTE, 0);

    let v6 = &requests[1].1;
    assert_eq!(v6.local, ip("2001:db8::7"));
    assert_ne!(v6.flags & ifa_flags::MANAGETEMPADDR, 0);
    assert_eq!(v6.flags & ifa_flags::NOPREFIXROUTE, 0);

    h.settle();
    assert!(h.manager.addresses_ready(IFINDEX));
    Ok(())
}

#[test]
fn test_network_section_addresses() -> Result<()> {
    let mut network = Network::new("lan");
    for (line, value) in [(3, "192.0.2.5/24"), (4, "not-an-address"), (5, "127.0.0.2/8")] {
        let ctx = SettingContext::network(FILE, line);
        let _ = parse_address_setting(&mut network, &ctx, "Address", value);
    }
    network.verify_addresses();
    assert_eq!(network.static_address_count(), 2);

    let mut h = Harness::new(network);
    h.configure()?;

    let loopback = h
        .requests()
        .into_iter()
        .find(|(_, r)| r.local == ip("127.0.0.2"))
        .map(|(_, r)| r)
        .unwrap();
    assert_eq!(loopback.scope, Scope::Host as u8);
    Ok(())
}

#[test]
fn test_static_cap_from_manager_config() {
    let config = ManagerConfig::from_json(r#"{ "static_addresses_per_network_max": 1 }"#).unwrap();
    assert_eq!(config.pools.len(), 4);

    let mut network = Network::new("lan").with_static_limit(config.static_addresses_per_network_max);
    let ctx = SettingContext::network(FILE, 3);
    parse_address_setting(&mut network, &ctx, "Address", "192.0.2.5/24").unwrap();

    let ctx = SettingContext::network(FILE, 4);
    let err = parse_address_setting(&mut network, &ctx, "Address", "192.0.2.6/24").unwrap_err();
    assert!(err.is_too_big());
    assert_eq!(network.static_address_count(), 1);
}
