//! Three members, no failures: every replica delivers the same messages in the same order,
//! the stable watermark covers all of them, and the global-persistence callback fires once per
//! version on every replica.

use std::time::Duration;

use log::LevelFilter;

use flock_rs::group::Membership;
use flock_rs::types::basic::NodeId;

mod common;

use crate::common::{
    logging::setup_logger, mem_log::MemLogStore, node::Node, node::NodeOptions,
    transport::mock_transport, wait_until,
};

const MESSAGES_PER_SENDER: usize = 100;
const PAYLOAD: usize = 4096;

#[test]
fn three_member_stability_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start three founding members over a mock transport.
    let member_ids = vec![NodeId::new(10), NodeId::new(20), NodeId::new(30)];
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
                    // No failures in this test; keep the detector quiet even under load.
                    suspicion_timeout: Duration::from_secs(30),
                    ..NodeOptions::default()
                },
            )
            .expect("founders start")
        })
        .collect();
    let subgroup = nodes[0].subgroup_id();

    // 2. Every member sends 100 raw messages of 4 KiB, riding through backpressure.
    log::info!("submitting {MESSAGES_PER_SENDER} messages of {PAYLOAD} bytes from each member");
    std::thread::scope(|scope| {
        for node in &nodes {
            scope.spawn(move || {
                for _ in 0..MESSAGES_PER_SENDER {
                    node.send_raw(PAYLOAD, node.id.int() as u8);
                }
            });
        }
    });

    // 3. Wait until every replica has seen all 300 messages reach stability.
    log::info!("waiting for 300 stable deliveries on every replica");
    wait_until(Duration::from_secs(60), "300 stable deliveries", || {
        nodes
            .iter()
            .all(|node| node.recorder.deliveries(subgroup).len() == 3 * MESSAGES_PER_SENDER)
    });

    // 4. The stable watermark counts 300 versions: indices 0..=299.
    for node in &nodes {
        assert_eq!(node.group.stable_version(subgroup).index(), 299);
    }

    // 5. Delivery order is identical on all replicas, and each sender's 100 messages appear in
    //    strictly increasing message-id order (null tokens may consume ids before a sender's
    //    first real message, so the ids need not start at zero).
    let reference = nodes[0].recorder.deliveries(subgroup);
    for node in &nodes[1..] {
        assert_eq!(node.recorder.deliveries(subgroup), reference);
    }
    for sender in &member_ids {
        let ids: Vec<i32> = reference
            .iter()
            .filter(|(from, _)| from == sender)
            .map(|(_, msg_id)| msg_id.int())
            .collect();
        assert_eq!(ids.len(), MESSAGES_PER_SENDER);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    // 6. Every version becomes globally persisted, and the callback fired exactly once per
    //    version on each replica.
    log::info!("waiting for global persistence of all 300 versions");
    wait_until(Duration::from_secs(60), "global persistence of 300 versions", || {
        nodes.iter().all(|node| {
            node.group.global_persisted(subgroup).index() == 299
                && node
                    .recorder
                    .local_persists
                    .load(std::sync::atomic::Ordering::SeqCst)
                    == 300
                && node
                    .recorder
                    .global_persists
                    .load(std::sync::atomic::Ordering::SeqCst)
                    == 300
        })
    });
    // Once per version, not more: the counters settle at exactly 300.
    std::thread::sleep(Duration::from_millis(200));
    for node in &nodes {
        assert_eq!(
            node.recorder
                .global_persists
                .load(std::sync::atomic::Ordering::SeqCst),
            300
        );
    }
}
