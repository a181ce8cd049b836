//! A sender crashes mid-view after its messages reached the survivors unevenly: one survivor
//! holds message ids 0..=47, the other only 0..=40. The ragged trim must make both survivors
//! deliver exactly 0..=40 from the failed sender: nothing more, and the same set on both.

use std::time::Duration;

use log::LevelFilter;

use flock_rs::group::Membership;
use flock_rs::types::basic::{MessageId, NodeId};

mod common;

use crate::common::{
    logging::setup_logger, mem_log::MemLogStore, node::Node, node::NodeOptions,
    transport::mock_transport, wait_until,
};

#[test]
fn sender_failure_ragged_trim_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start members {10, 20, 30}; the transport will let node 30 receive only the first 41
    //    multicast payloads from node 20 (status columns still flow, as they would from a
    //    sender that crashed after its last table push).
    let member_ids = vec![NodeId::new(10), NodeId::new(20), NodeId::new(30)];
    let (transports, faults) = mock_transport(&member_ids);
    faults
        .lock()
        .unwrap()
        .limit_multicast(NodeId::new(20), NodeId::new(30), 41);

    let options = || NodeOptions {
        suspicion_timeout: Duration::from_millis(600),
        window: 64,
        ..NodeOptions::default()
    };
    let mut nodes: Vec<Node> = member_ids
        .iter()
        .zip(transports)
        .map(|(id, transport)| {
            Node::start(
                id.int(),
                transport,
                Membership::Founding(member_ids.clone()),
                MemLogStore::new(),
                options(),
            )
            .expect("founders start")
        })
        .collect();
    let subgroup = nodes[0].subgroup_id();

    // 2. Node 20 publishes message ids 0..=47, then crashes. (48 sends fit inside the window
    //    even though node 30 stops acknowledging at 40.)
    log::info!("node 20 publishes 48 messages");
    let crashing = nodes.remove(1);
    for _ in 0..48 {
        crashing.send_raw(64, 20);
    }
    // Give the payloads time to reach their (fault-filtered) destinations, then crash.
    std::thread::sleep(Duration::from_millis(300));
    log::info!("crashing node 20");
    drop(crashing);

    // 3. The survivors suspect 20 and install a view without it.
    wait_until(Duration::from_secs(30), "the survivors exclude node 20", || {
        nodes.iter().all(|node| {
            let view = node.group.current_view();
            !view.is_member(NodeId::new(20)) && view.num_members() == 2
        })
    });

    // 4. Virtual synchrony: both survivors delivered exactly message ids 0..=40 from node 20;
    //    the ragged trim discarded 41..=47 even on node 10, which had received them.
    wait_until(Duration::from_secs(10), "deliveries from 20 settle", || {
        nodes.iter().all(|node| {
            node.recorder
                .deliveries(subgroup)
                .iter()
                .filter(|(sender, _)| *sender == NodeId::new(20))
                .count()
                == 41
        })
    });
    for node in &nodes {
        let from_20: Vec<MessageId> = node
            .recorder
            .deliveries(subgroup)
            .iter()
            .filter(|(sender, _)| *sender == NodeId::new(20))
            .map(|(_, msg_id)| *msg_id)
            .collect();
        let expected: Vec<MessageId> = (0..=40).map(MessageId::new).collect();
        assert_eq!(from_20, expected);
    }

    // 5. The complete delivery sequences of the dying view agree between the survivors.
    assert_eq!(
        nodes[0].recorder.deliveries(subgroup),
        nodes[1].recorder.deliveries(subgroup)
    );

    // 6. The surviving shard keeps working: a post-failure increment applies on both.
    nodes[0].add(1);
    wait_until(Duration::from_secs(10), "the new view's counter applies", || {
        nodes.iter().all(|node| node.read_counter() == 1)
    });
}
