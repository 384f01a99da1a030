//! Reconciliation pass tests.

use linkaddr::address::{CacheInfo, Lookup};
use linkaddr::config::{DelegatedPrefix, PoolConfig};
use linkaddr::netlink::AddressOp;
use linkaddr::netlink::types::addr::ifa_flags;
use linkaddr::{AddressKey, KeepConfiguration, LinkState, ManagerConfig, Result};

use crate::common::{Harness, IFINDEX, address, ip, network_with};

#[test]
fn test_static_address_added_once() -> Result<()> {
    let mut h = Harness::new(network_with(&["192.0.2.5/24"]));
    h.configure()?;

    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    let (seq, request) = &requests[0];
    assert_eq!(request.op, AddressOp::Add);
    assert_eq!(request.local, ip("192.0.2.5"));
    assert_eq!(request.prefixlen, 24);

    let key = AddressKey::lookup(&ip("192.0.2.5"), 24);
    let link = h.manager.link(IFINDEX).unwrap();
    assert_eq!(link.addresses.lookup(&key), Lookup::Owned);
    assert!(link.addresses.is_static(&key));
    assert!(!link.addresses.get(&key).unwrap().is_ready());
    assert_eq!(link.state, LinkState::Configuring);

    // The acknowledgement alone does not make the address ready.
    let seq = *seq;
    h.reply(seq, 0);
    assert!(!h.manager.addresses_ready(IFINDEX));
    assert_eq!(h.routes_configured(), 0);

    // Still tentative.
    h.kernel_new("192.0.2.5/24", ifa_flags::PERMANENT | ifa_flags::TENTATIVE);
    assert!(!h.manager.addresses_ready(IFINDEX));

    h.kernel_new("192.0.2.5/24", ifa_flags::PERMANENT);
    assert!(h.manager.addresses_ready(IFINDEX));
    assert_eq!(h.routes_configured(), 1);
    assert_eq!(h.request_count(), 1);
    Ok(())
}

#[test]
fn test_ready_before_ack() -> Result<()> {
    let mut h = Harness::new(network_with(&["192.0.2.5/24", "2001:db8::5/64"]));
    h.configure()?;
    assert_eq!(h.request_count(), 2);

    h.kernel_new("192.0.2.5/24", ifa_flags::PERMANENT);
    h.kernel_new("2001:db8::5/64", ifa_flags::PERMANENT);
    assert!(!h.manager.addresses_ready(IFINDEX));

    h.reply(1, 0);
    assert!(!h.manager.addresses_ready(IFINDEX));
    h.reply(2, 0);
    assert!(h.manager.addresses_ready(IFINDEX));
    assert_eq!(h.routes_configured(), 1);

    // Callbacks are disarmed once ready.
    let link = h.manager.link(IFINDEX).unwrap();
    assert!(link.addresses.statics().all(|a| a.callback.is_none()));
    Ok(())
}

#[test]
fn test_second_apply_is_idempotent() -> Result<()> {
    let mut h = Harness::new(network_with(&["192.0.2.5/24", "2001:db8::5/64"]));
    h.configure()?;
    h.settle();
    assert!(h.manager.addresses_ready(IFINDEX));
    let before = h.request_count();

    h.configure()?;
    assert_eq!(h.request_count(), before);
    assert!(h.manager.addresses_ready(IFINDEX));
    assert_eq!(h.routes_configured(), 2);
    Ok(())
}

#[test]
fn test_no_static_addresses_completes_immediately() -> Result<()> {
    let mut h = Harness::new(network_with(&[]));
    h.configure()?;
    assert_eq!(h.request_count(), 0);
    assert!(h.manager.addresses_ready(IFINDEX));
    assert_eq!(h.routes_configured(), 1);
    Ok(())
}

#[test]
fn test_foreign_dynamic_kept() -> Result<()> {
    let mut network = network_with(&[]);
    network.keep_configuration = KeepConfiguration::Dhcp;
    let mut h = Harness::new(network);

    h.kernel_new_dynamic("192.0.2.9/24", 3600, 7200);
    h.manager.drop_foreign_addresses(IFINDEX)?;
    assert_eq!(h.request_count(), 0);

    let key = AddressKey::lookup(&ip("192.0.2.9"), 24);
    assert_eq!(
        h.manager.link(IFINDEX).unwrap().addresses.lookup(&key),
        Lookup::Foreign
    );
    Ok(())
}

#[test]
fn test_foreign_static_dropped_unless_kept() -> Result<()> {
    let mut h = Harness::new(network_with(&[]));
    h.kernel_new("198.51.100.7/24", ifa_flags::PERMANENT);
    h.kernel_new_dynamic("192.0.2.9/24", 3600, 7200);

    h.manager.drop_foreign_addresses(IFINDEX)?;
    let requests = h.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|(_, r)| r.op == AddressOp::Delete));
    assert_eq!(
        h.manager.link(IFINDEX).unwrap().counters.pending_removals,
        2
    );

    let mut network = network_with(&[]);
    network.keep_configuration = KeepConfiguration::Static;
    let mut h = Harness::new(network);
    h.kernel_new("198.51.100.7/24", ifa_flags::PERMANENT);
    h.kernel_new_dynamic("192.0.2.9/24", 3600, 7200);

    h.manager.drop_foreign_addresses(IFINDEX)?;
    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.local, ip("192.0.2.9"));
    Ok(())
}

#[test]
fn test_dhcp_route_marks_address_dynamic() -> Result<()> {
    let mut network = network_with(&[]);
    network.keep_configuration = KeepConfiguration::Dhcp;
    let mut h = Harness::new(network);

    h.kernel_new("192.0.2.9/24", ifa_flags::PERMANENT);
    h.manager
        .link_mut(IFINDEX)
        .unwrap()
        .routes_foreign
        .push(linkaddr::link::ForeignRoute {
            family: linkaddr::AddressFamily::Inet,
            protocol: linkaddr::link::RTPROT_DHCP,
            prefsrc: Some(ip("192.0.2.9")),
        });

    h.manager.drop_foreign_addresses(IFINDEX)?;
    assert_eq!(h.request_count(), 0);
    Ok(())
}

#[test]
fn test_link_local_left_alone() -> Result<()> {
    let mut h = Harness::new(network_with(&[]));
    h.kernel_new("fe80::1/64", ifa_flags::PERMANENT);
    h.manager.drop_foreign_addresses(IFINDEX)?;
    assert_eq!(h.request_count(), 0);

    let mut network = network_with(&[]);
    network.link_local_ipv6 = false;
    let mut h = Harness::new(network);
    h.kernel_new("fe80::1/64", ifa_flags::PERMANENT);
    h.manager.drop_foreign_addresses(IFINDEX)?;
    assert_eq!(h.request_count(), 1);
    Ok(())
}

#[test]
fn test_foreign_match_adopted_and_replaced() -> Result<()> {
    let mut h = Harness::new(network_with(&["192.0.2.5/24"]));

    // Present but not permanent: adopted, then updated in place.
    h.kernel_new("192.0.2.5/24", 0);
    h.configure()?;

    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.op, AddressOp::Replace);

    let key = AddressKey::lookup(&ip("192.0.2.5"), 24);
    let link = h.manager.link(IFINDEX).unwrap();
    assert_eq!(link.addresses.lookup(&key), Lookup::Owned);
    assert_eq!(link.addresses.foreign().count(), 0);
    Ok(())
}

#[test]
fn test_foreign_match_already_satisfied() -> Result<()> {
    let mut h = Harness::new(network_with(&["192.0.2.5/24"]));
    h.kernel_new("192.0.2.5/24", ifa_flags::PERMANENT);
    h.configure()?;

    assert_eq!(h.request_count(), 0);
    assert!(h.manager.addresses_ready(IFINDEX));
    Ok(())
}

#[test]
fn test_apply_deferred_until_removals_finish() -> Result<()> {
    let mut h = Harness::new(network_with(&["192.0.2.5/24"]));
    h.kernel_new("198.51.100.7/24", ifa_flags::PERMANENT);

    h.configure()?;
    assert_eq!(h.request_count(), 1);
    let (seq, removal) = h.last_request();
    assert_eq!(removal.op, AddressOp::Delete);
    assert!(h.manager.link(IFINDEX).unwrap().counters.deferred_apply);

    h.reply(seq, 0);
    let link = h.manager.link(IFINDEX).unwrap();
    assert!(!link.counters.deferred_apply);
    assert_eq!(link.counters.pending_removals, 0);
    assert_eq!(link.state, LinkState::Configuring);

    assert_eq!(h.request_count(), 2);
    let (_, add) = h.last_request();
    assert_eq!(add.op, AddressOp::Add);
    assert_eq!(add.local, ip("192.0.2.5"));
    Ok(())
}

#[test]
fn test_eui64_address_from_prefix() -> Result<()> {
    let mut network = network_with(&[]);
    network.prefixes.push(DelegatedPrefix {
        prefix: "2001:db8::".parse().unwrap(),
        prefixlen: 64,
        assign: true,
    });
    network.prefixes.push(DelegatedPrefix {
        prefix: "2001:db8:1::".parse().unwrap(),
        prefixlen: 64,
        assign: false,
    });
    let mut h = Harness::new(network);
    h.configure()?;

    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0].1;
    assert_eq!(request.op, AddressOp::Replace);
    assert_eq!(request.local, ip("2001:db8::ff:fe00:1"));
    assert_eq!(request.prefixlen, 64);

    h.settle();
    assert!(h.manager.addresses_ready(IFINDEX));
    Ok(())
}

#[test]
fn test_eui64_needs_mac() {
    let mut network = network_with(&[]);
    network.prefixes.push(DelegatedPrefix {
        prefix: "2001:db8::".parse().unwrap(),
        prefixlen: 64,
        assign: true,
    });
    let mut h = Harness::new(network);
    h.manager.link_mut(IFINDEX).unwrap().mac = None;

    let err = h.manager.set_addresses(IFINDEX).unwrap_err();
    assert!(matches!(err, linkaddr::Error::InvalidConfig { .. }));
    assert_eq!(h.request_count(), 0);
}

#[test]
fn test_per_link_cap() {
    let config = ManagerConfig {
        addresses_per_link_max: 1,
        ..Default::default()
    };
    let mut h = Harness::with_config(config, network_with(&["192.0.2.5/24", "192.0.2.6/24"]));

    let err = h.manager.set_addresses(IFINDEX).unwrap_err();
    assert!(err.is_too_big());
    assert_eq!(h.request_count(), 1);
}

#[test]
fn test_ipv6_peer_tracked_under_peer() -> Result<()> {
    let mut network = network_with(&[]);
    let mut a = address("2001:db8::1/128");
    a.in_addr_peer = Some(ip("2001:db8::2"));
    network.add_static_address(a)?;
    let mut h = Harness::new(network);

    h.configure()?;
    let (_, request) = h.last_request();
    assert_eq!(request.peer, Some(ip("2001:db8::2")));

    let peer_key = AddressKey::lookup(&ip("2001:db8::2"), 128);
    assert_eq!(
        h.manager.link(IFINDEX).unwrap().addresses.lookup(&peer_key),
        Lookup::Owned
    );

    h.settle();
    assert!(h.manager.addresses_ready(IFINDEX));
    Ok(())
}

#[test]
fn test_masquerade_follows_address() -> Result<()> {
    let mut network = network_with(&["192.0.2.5/24", "2001:db8::5/64"]);
    network.ip_masquerade = true;
    let mut h = Harness::new(network);

    h.configure()?;
    h.settle();
    assert_eq!(
        *h.firewall.0.borrow(),
        vec![(true, "192.0.2.0".parse().unwrap(), 24)]
    );

    // Re-applying does not install the rule twice.
    h.configure()?;
    assert_eq!(h.firewall.0.borrow().len(), 1);

    h.kernel_del("192.0.2.5/24");
    assert_eq!(
        h.firewall.0.borrow().last(),
        Some(&(false, "192.0.2.0".parse().unwrap(), 24))
    );
    Ok(())
}

#[test]
fn test_drop_all_addresses() -> Result<()> {
    let mut h = Harness::new(network_with(&["192.0.2.5/24", "2001:db8::5/64"]));
    h.configure()?;
    h.settle();
    h.kernel_new("fe80::1/64", ifa_flags::PERMANENT);
    let before = h.request_count();

    h.manager.drop_all_addresses(IFINDEX)?;
    let requests = h.requests();
    let removals = &requests[before..];
    assert_eq!(removals.len(), 2);
    assert!(removals.iter().all(|(_, r)| r.op == AddressOp::Delete));
    assert_eq!(
        h.manager.link(IFINDEX).unwrap().counters.pending_removals,
        2
    );

    h.settle();
    let link = h.manager.link(IFINDEX).unwrap();
    assert_eq!(link.counters.pending_removals, 0);
    assert_eq!(link.addresses.len(), 0);
    Ok(())
}

#[test]
fn test_remove_address() -> Result<()> {
    let mut h = Harness::new(network_with(&["192.0.2.5/24"]));
    h.configure()?;
    h.settle();

    let err = h
        .manager
        .remove_address(IFINDEX, ip("192.0.2.77"), 24)
        .unwrap_err();
    assert!(err.is_not_found());

    h.manager.remove_address(IFINDEX, ip("192.0.2.5"), 24)?;
    let (_, request) = h.last_request();
    assert_eq!(request.op, AddressOp::Delete);
    // Not counted as part of a reconciliation batch.
    assert_eq!(
        h.manager.link(IFINDEX).unwrap().counters.pending_removals,
        0
    );

    h.settle();
    assert_eq!(h.manager.link(IFINDEX).unwrap().addresses.len(), 0);
    Ok(())
}

#[test]
fn test_unknown_link() {
    let mut h = Harness::new(network_with(&[]));
    assert!(h.manager.set_addresses(99).unwrap_err().is_not_found());
    assert!(h.manager.drop_foreign_addresses(99).is_err());
    assert!(h.manager.drop_all_addresses(99).is_err());
}

#[test]
fn test_kept_foreign_address_replaced() -> Result<()> {
    let mut network = network_with(&["192.0.2.5/24"]);
    network.keep_configuration = KeepConfiguration::Dhcp;
    let mut h = Harness::new(network);

    h.kernel_new_dynamic("192.0.2.5/24", 300, 600);
    h.configure()?;

    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0].1;
    assert_eq!(request.op, AddressOp::Replace);
    assert_eq!(request.cache_info, Some(CacheInfo::INFINITE));

    h.settle();
    let key = AddressKey::lookup(&ip("192.0.2.5"), 24);
    let link = h.manager.link(IFINDEX).unwrap();
    assert_eq!(link.addresses.lookup(&key), Lookup::Owned);
    assert!(!link.addresses.get(&key).unwrap().cache_info.is_preferred_finite());
    assert!(h.manager.addresses_ready(IFINDEX));
    Ok(())
}

#[test]
fn test_prefixlen_change_reapplied() -> Result<()> {
    let mut h = Harness::new(network_with(&["2001:db8::1/48"]));
    h.kernel_new("2001:db8::1/64", ifa_flags::PERMANENT);
    h.configure()?;

    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.op, AddressOp::Replace);
    assert_eq!(requests[0].1.prefixlen, 48);

    h.settle();
    h.configure()?;
    assert_eq!(h.request_count(), 1);
    Ok(())
}

#[test]
fn test_flag_change_reapplied() -> Result<()> {
    let mut network = network_with(&[]);
    let mut a = address("192.0.2.5/24");
    a.prefix_route = false;
    network.add_static_address(a)?;
    let mut h = Harness::new(network);

    h.kernel_new("192.0.2.5/24", ifa_flags::PERMANENT);
    h.configure()?;

    let (_, request) = h.last_request();
    assert_eq!(request.op, AddressOp::Replace);
    assert_eq!(
        request.flags,
        ifa_flags::PERMANENT | ifa_flags::NOPREFIXROUTE
    );

    h.settle();
    h.configure()?;
    assert_eq!(h.request_count(), 1);
    Ok(())
}

#[test]
fn test_label_change_reapplied() -> Result<()> {
    let mut h = Harness::new(network_with(&["192.0.2.5/24"]));
    h.configure()?;
    h.settle();
    assert_eq!(h.request_count(), 1);

    let id = h.manager.link(IFINDEX).unwrap().network.unwrap();
    let network = h.manager.network_mut(id).unwrap();
    for (_, template) in network.templates_mut() {
        template.label = Some("eth0:lan".into());
    }

    h.configure()?;
    assert_eq!(h.request_count(), 2);
    let (_, request) = h.last_request();
    assert_eq!(request.op, AddressOp::Replace);
    assert_eq!(request.label.as_deref(), Some("eth0:lan"));

    h.settle();
    h.configure()?;
    assert_eq!(h.request_count(), 2);
    Ok(())
}

#[test]
fn test_drop_foreign_continues_after_send_failure() {
    let mut h = Harness::new(network_with(&[]));
    h.kernel_new("198.51.100.7/24", ifa_flags::PERMANENT);
    h.kernel_new("198.51.100.8/24", ifa_flags::PERMANENT);
    h.kernel_new("198.51.100.9/24", ifa_flags::PERMANENT);
    h.transport.0.borrow_mut().fail_next = 1;

    let err = h.manager.drop_foreign_addresses(IFINDEX).unwrap_err();
    assert!(matches!(err, linkaddr::Error::Transport(_)));

    let requests = h.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|(_, r)| r.op == AddressOp::Delete));
    assert_eq!(
        h.manager.link(IFINDEX).unwrap().counters.pending_removals,
        2
    );
}

#[test]
fn test_drop_all_continues_after_send_failure() -> Result<()> {
    let config = ManagerConfig {
        pools: vec![PoolConfig::new(ip("10.0.0.0"), 16)],
        ..Default::default()
    };
    let mut h = Harness::with_config(
        config,
        network_with(&["0.0.0.0/24", "192.0.2.5/24", "2001:db8::5/64"]),
    );
    h.configure()?;
    h.settle();
    assert_eq!(h.manager.pool().issued().len(), 1);
    let before = h.request_count();

    // The pool address sorts first and is the one that cannot be sent.
    h.transport.0.borrow_mut().fail_next = 1;
    let err = h.manager.drop_all_addresses(IFINDEX).unwrap_err();
    assert!(matches!(err, linkaddr::Error::Transport(_)));

    let requests = h.requests();
    let removals: Vec<_> = requests[before..].iter().map(|(_, r)| r.local).collect();
    assert_eq!(removals, vec![ip("192.0.2.5"), ip("2001:db8::5")]);

    let link = h.manager.link(IFINDEX).unwrap();
    assert_eq!(link.counters.pending_removals, 2);
    assert!(link.addresses.leases().is_empty());
    assert!(h.manager.pool().issued().is_empty());
    Ok(())
}
