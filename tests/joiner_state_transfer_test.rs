//! A single founder builds up counter state, a second node joins, and the joiner's object
//! state matches immediately after its first installed view; subsequent increments apply
//! identically on both replicas.

use std::time::Duration;

use log::LevelFilter;

use flock_rs::group::Membership;
use flock_rs::types::basic::{NodeId, ViewId};

mod common;

use crate::common::{
    logging::setup_logger, mem_log::MemLogStore, node::Node, node::NodeOptions,
    transport::mock_transport, wait_until,
};

#[test]
fn joiner_state_transfer_test() {
    setup_logger(LevelFilter::Info);

    // 1. Create a mock network that already knows both node ids (the joiner connects later).
    let all_ids = vec![NodeId::new(10), NodeId::new(20)];
    let (mut transports, _faults) = mock_transport(&all_ids);
    let joiner_transport = transports.pop().unwrap();
    let founder_transport = transports.pop().unwrap();

    // 2. Node 10 founds the group alone and applies 50 increments.
    let founder = Node::start(
        10,
        founder_transport,
        Membership::Founding(vec![NodeId::new(10)]),
        MemLogStore::new(),
        NodeOptions::default(),
    )
    .expect("the founder starts");

    log::info!("applying 50 increments on the singleton group");
    for _ in 0..50 {
        founder.add(1);
    }
    assert_eq!(founder.read_counter(), 50);

    // 3. Node 20 joins through node 10. Its join blocks until state transfer installs, so the
    //    counter must be at 50 the moment it returns.
    log::info!("joining node 20");
    let joiner = Node::start(
        20,
        joiner_transport,
        Membership::Joining(NodeId::new(10)),
        MemLogStore::new(),
        NodeOptions::default(),
    )
    .expect("the joiner completes state transfer");

    assert!(joiner.group.current_view().view_id >= ViewId::new(1));
    assert!(joiner.group.current_view().is_member(NodeId::new(10)));
    assert_eq!(joiner.read_counter(), 50);

    // 4. The founder eventually installs the two-member view too.
    wait_until(Duration::from_secs(30), "the founder installs the joint view", || {
        founder.group.current_view().is_member(NodeId::new(20))
    });

    // 5. Increments submitted by either member now apply identically on both replicas.
    log::info!("incrementing from both members");
    founder.add(1);
    joiner.add(1);
    wait_until(Duration::from_secs(30), "both counters reach 52", || {
        founder.read_counter() == 52 && joiner.read_counter() == 52
    });
}
