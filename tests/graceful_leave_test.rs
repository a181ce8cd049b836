//! A member departs gracefully: the leader turns its announcement into a leave change, the
//! remaining members install the smaller view, and the shard keeps replicating. Also exercises
//! the barrier, which completes once every member's heartbeat has made a full round.

use std::time::Duration;

use log::LevelFilter;

use flock_rs::group::Membership;
use flock_rs::types::basic::NodeId;

mod common;

use crate::common::{
    logging::setup_logger, mem_log::MemLogStore, node::Node, node::NodeOptions,
    transport::mock_transport, wait_until,
};

#[test]
fn graceful_leave_test() {
    setup_logger(LevelFilter::Info);

    // 1. Three founding members.
    let member_ids = vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)];
    let (transports, _faults) = mock_transport(&member_ids);
    let mut nodes: Vec<Node> = member_ids
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
            .expect("founders start")
        })
        .collect();

    // 2. The barrier returns once a full heartbeat round has been observed.
    nodes[0].group.barrier_sync();

    // 3. Some replicated state before the departure.
    nodes[0].add(5);
    wait_until(Duration::from_secs(30), "all three counters reach 5", || {
        nodes.iter().all(|node| node.read_counter() == 5)
    });

    // 4. Node 3 leaves gracefully: its announcement, not the failure detector, drives the
    //    view change.
    log::info!("node 3 leaves gracefully");
    let leaver = nodes.pop().unwrap();
    leaver.group.leave(true);

    wait_until(Duration::from_secs(30), "the remaining members exclude node 3", || {
        nodes.iter().all(|node| {
            let view = node.group.current_view();
            view.num_members() == 2 && !view.is_member(NodeId::new(3))
        })
    });

    // 5. The two-member shard keeps replicating.
    nodes[1].add(1);
    wait_until(Duration::from_secs(30), "the survivors' counters reach 6", || {
        nodes.iter().all(|node| node.read_counter() == 6)
    });
}
