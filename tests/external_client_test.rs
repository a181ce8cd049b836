//! A non-member process queries a subgroup point-to-point through an external caller, and
//! receives one-way notifications from a member.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::LevelFilter;

use flock_rs::group::{ExternalCaller, Membership};
use flock_rs::notification::NotificationMessage;
use flock_rs::types::basic::NodeId;

mod common;

use crate::common::{
    counter::READ, logging::setup_logger, mem_log::MemLogStore, node::Node, node::NodeOptions,
    transport::mock_transport, wait_until,
};

#[test]
fn external_client_test() {
    setup_logger(LevelFilter::Info);

    // 1. A two-member group plus one external process, all wired into the same mock network.
    let all_ids = vec![NodeId::new(1), NodeId::new(2), NodeId::new(99)];
    let member_ids = vec![NodeId::new(1), NodeId::new(2)];
    let (mut transports, _faults) = mock_transport(&all_ids);
    let external_transport = transports.pop().unwrap();

    let nodes: Vec<Node> = member_ids
        .iter()
        .zip(transports)
        .map(|(id, transport)| {
            Node::start(
                id.int(),
                transport,
                Membership::Founding(member_ids.clone()),
                MemLogStore::new(),
                NodeOptions::default(),
            )
            .expect("members start")
        })
        .collect();
    let subgroup = nodes[0].subgroup_id();

    // 2. Build up a little state.
    nodes[0].add(7);

    // 3. The external caller queries a member point-to-point; no membership required.
    let caller = ExternalCaller::connect(NodeId::new(99), external_transport, &member_ids);
    let replies = caller
        .p2p_query::<(), u64>(NodeId::new(2), subgroup, READ, &())
        .wait_timeout(Duration::from_secs(10))
        .expect("the member answers the external query");
    assert_eq!(replies[&NodeId::new(2)], 7);

    // 4. A member pushes a notification to the external client; the registered handler runs.
    let received_type = Arc::new(AtomicU64::new(0));
    let handler_seen = received_type.clone();
    caller.add_notification_handler(move |notification: &NotificationMessage| {
        handler_seen.store(notification.message_type, Ordering::SeqCst);
    });

    nodes[1]
        .group
        .notify(NodeId::new(99), NotificationMessage::new(42, b"state changed".to_vec()));
    wait_until(Duration::from_secs(10), "the notification arrives", || {
        received_type.load(Ordering::SeqCst) == 42
    });
}
