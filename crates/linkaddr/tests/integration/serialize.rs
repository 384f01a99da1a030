//! State file tests.

use std::collections::BTreeSet;

use linkaddr::address::Lookup;
use linkaddr::serialize::parse_addresses;
use linkaddr::{AddressKey, Result};

use crate::common::{Harness, IFINDEX, ip, network_with};

#[test]
fn test_round_trip() -> Result<()> {
    let mut h = Harness::new(network_with(&["192.0.2.5/24", "2001:db8::5/64", "10.1.2.3/8"]));
    h.configure()?;
    h.settle();

    let line = h.manager.serialize_addresses(IFINDEX)?;
    assert!(line.starts_with("ADDRESSES="));
    assert!(line.ends_with('\n'));

    let mut restored = Harness::new(network_with(&[]));
    assert_eq!(restored.manager.deserialize_addresses(IFINDEX, &line)?, 3);

    let original: BTreeSet<_> = parse_addresses(&line).into_iter().collect();
    let again: BTreeSet<_> = parse_addresses(&restored.manager.serialize_addresses(IFINDEX)?)
        .into_iter()
        .collect();
    assert_eq!(original, again);
    assert!(original.contains(&(ip("2001:db8::5"), 64)));
    Ok(())
}

#[test]
fn test_restored_addresses_are_owned() -> Result<()> {
    let mut h = Harness::new(network_with(&[]));
    h.manager
        .deserialize_addresses(IFINDEX, "ADDRESSES=192.0.2.5/24 bogus 192.0.2.6/40")?;

    let link = h.manager.link(IFINDEX).unwrap();
    assert_eq!(link.addresses.len(), 1);
    assert_eq!(
        link.addresses
            .lookup(&AddressKey::lookup(&ip("192.0.2.5"), 24)),
        Lookup::Owned
    );

    // The kernel dump that follows does not turn it into a foreign entry.
    h.kernel_new("192.0.2.5/24", linkaddr::netlink::types::addr::ifa_flags::PERMANENT);
    let link = h.manager.link(IFINDEX).unwrap();
    assert_eq!(link.addresses.foreign().count(), 0);
    assert!(link.addresses.owned().all(|a| a.is_ready()));

    // And the drop-foreign pass leaves it alone.
    h.manager.drop_foreign_addresses(IFINDEX)?;
    assert_eq!(h.request_count(), 0);
    Ok(())
}

#[test]
fn test_unknown_link() {
    let mut h = Harness::new(network_with(&[]));
    assert!(h.manager.serialize_addresses(7).is_err());
    assert!(h.manager.deserialize_addresses(7, "ADDRESSES=").is_err());
}
