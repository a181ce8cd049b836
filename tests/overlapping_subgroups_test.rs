//! Two overlapping subgroups: a member of both sees each subgroup's total order
//! independently, with no cross-subgroup ordering implied, and members outside a subgroup see
//! none of its traffic.

use std::{sync::Arc, time::Duration};

use log::LevelFilter;

use flock_rs::group::Membership;
use flock_rs::multicast::SendError;
use flock_rs::types::{
    basic::{NodeId, SubgroupTypeId},
    view::{LayoutFn, ShardLayout},
};

mod common;

use crate::common::{
    logging::setup_logger, mem_log::MemLogStore, node::Node, node::NodeOptions,
    transport::mock_transport, wait_until,
};

const MESSAGES_PER_SENDER: usize = 20;

#[test]
fn overlapping_subgroups_test() {
    setup_logger(LevelFilter::Info);

    // 1. Six members; type 0 runs on the first three, type 1 on members three through five,
    //    so member 30 belongs to both.
    let member_ids: Vec<NodeId> = (1..=6).map(|n| NodeId::new(n * 10)).collect();
    let layout: LayoutFn = Arc::new(|members: &[NodeId]| {
        vec![
            vec![ShardLayout::Active(vec![members[0..3].to_vec()])],
            vec![ShardLayout::Active(vec![members[2..5].to_vec()])],
        ]
    });

    let (transports, _faults) = mock_transport(&member_ids);
    let nodes: Vec<Node> = member_ids
        .iter()
        .zip(transports)
        .map(|(id, transport)| {
            Node::start(
                id.int(),
                transport,
                Membership::Founding(member_ids.clone()),
                MemLogStore::new(),
                NodeOptions {
                    suspicion_timeout: Duration::from_secs(30),
                    num_counter_types: 2,
                    layout: Some(layout.clone()),
                    ..NodeOptions::default()
                },
            )
            .expect("founders start")
        })
        .collect();

    let view = nodes[0].group.current_view();
    let subgroup_a = view
        .subgroup_by_type(SubgroupTypeId::new(0), 0)
        .unwrap()
        .subgroup_id;
    let subgroup_b = view
        .subgroup_by_type(SubgroupTypeId::new(1), 0)
        .unwrap()
        .subgroup_id;
    assert_ne!(subgroup_a, subgroup_b);

    // 2. Every member of each subgroup sends into it concurrently; node 30 (index 2) sends
    //    into both.
    log::info!("sending into both subgroups concurrently");
    std::thread::scope(|scope| {
        for (index, node) in nodes.iter().enumerate() {
            scope.spawn(move || {
                for _ in 0..MESSAGES_PER_SENDER {
                    if index < 3 {
                        send_raw_to_type(node, 0);
                    }
                    if (2..5).contains(&index) {
                        send_raw_to_type(node, 1);
                    }
                }
            });
        }
    });

    // 3. Each subgroup's members deliver all of its traffic; outsiders deliver none of it.
    wait_until(Duration::from_secs(60), "both subgroups fully stable", || {
        nodes[..3]
            .iter()
            .all(|node| node.recorder.deliveries(subgroup_a).len() == 3 * MESSAGES_PER_SENDER)
            && nodes[2..5]
                .iter()
                .all(|node| node.recorder.deliveries(subgroup_b).len() == 3 * MESSAGES_PER_SENDER)
    });
    for node in &nodes[3..] {
        assert!(node.recorder.deliveries(subgroup_a).is_empty());
    }
    for node in nodes[..2].iter().chain(&nodes[5..]) {
        assert!(node.recorder.deliveries(subgroup_b).is_empty());
    }

    // 4. Within each subgroup, the delivery order is identical on all of its members.
    let order_a = nodes[0].recorder.deliveries(subgroup_a);
    for node in &nodes[1..3] {
        assert_eq!(node.recorder.deliveries(subgroup_a), order_a);
    }
    let order_b = nodes[2].recorder.deliveries(subgroup_b);
    for node in &nodes[3..5] {
        assert_eq!(node.recorder.deliveries(subgroup_b), order_b);
    }

    // 5. Members outside a subgroup's shard cannot send into it.
    assert!(matches!(
        nodes[5]
            .group
            .get_subgroup(SubgroupTypeId::new(0), 0)
            .send(8, |buffer| buffer.fill(0)),
        Err(SendError::NotAShardMember)
    ));
}

fn send_raw_to_type(node: &Node, type_index: u32) {
    wait_until(Duration::from_secs(30), "a raw send is accepted", || {
        match node
            .group
            .get_subgroup(SubgroupTypeId::new(type_index), 0)
            .send(8, |buffer| buffer.fill(type_index as u8))
        {
            Ok(()) => true,
            Err(SendError::Backpressure) => false,
            Err(err) => panic!("raw send failed: {err:?}"),
        }
    });
}
