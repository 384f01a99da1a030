//! Event loop tests.

use linkaddr::driver::{self, ChannelTransport, Event};
use linkaddr::netlink::AddressOp;
use linkaddr::{Link, Manager, ManagerConfig};
use tokio::sync::mpsc;

use crate::common::{IFINDEX, RecordingHooks, kernel_answer, network_with};

#[tokio::test]
async fn test_run_to_ready() {
    let (transport, mut requests) = ChannelTransport::new(0);
    let hooks = RecordingHooks::default();
    let mut manager = Manager::new(ManagerConfig::default(), transport).with_hooks(hooks.clone());
    let id = manager.add_network(network_with(&["192.0.2.5/24", "2001:db8::5/64"]));
    manager.add_link(Link::new(IFINDEX, "eth0").with_network(id));

    let (events, rx) = mpsc::unbounded_channel();
    events.send(Event::DropForeign(IFINDEX)).unwrap();
    events.send(Event::SetAddresses(IFINDEX)).unwrap();

    let kernel = async move {
        let mut ops = Vec::new();
        for _ in 0..2 {
            let outbound = requests.recv().await.unwrap();
            ops.push(outbound.request.op);
            events
                .send(Event::KernelMessage(kernel_answer(outbound.seq, &outbound.request)))
                .unwrap();
        }
        // Closing the channel stops the loop.
        drop(events);
        ops
    };

    let (manager, ops) = tokio::join!(driver::run(manager, rx), kernel);

    assert_eq!(ops, vec![AddressOp::Add, AddressOp::Add]);
    assert!(manager.addresses_ready(IFINDEX));
    assert_eq!(manager.pending_requests(), 0);
    assert_eq!(hooks.0.borrow().routes, vec![IFINDEX]);
}

#[tokio::test]
async fn test_errors_do_not_stop_loop() {
    let (transport, _requests) = ChannelTransport::new(0);
    let manager = Manager::new(ManagerConfig::default(), transport);

    let (events, rx) = mpsc::unbounded_channel();
    events.send(Event::SetAddresses(42)).unwrap();
    events
        .send(Event::KernelMessage(bytes::Bytes::from_static(&[1, 2, 3])))
        .unwrap();
    events.send(Event::Reply { seq: 9, errno: 0 }).unwrap();
    drop(events);

    let manager = driver::run(manager, rx).await;
    assert_eq!(manager.pending_requests(), 0);
}
