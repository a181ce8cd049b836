//! Signed logs: a two-member shard persists ten signed versions; after one member's log is
//! corrupted on disk and both restart, the verified watermark refuses to pass the corruption
//! while the persisted watermark still covers the whole log.

use std::{fs, path::Path, time::Duration};

use ed25519_dalek::SigningKey;
use log::LevelFilter;
use rand_core::OsRng;

use flock_rs::group::Membership;
use flock_rs::keys::PublicKeyStore;
use flock_rs::log_store::{FileLogStore, LogRecord};
use flock_rs::types::basic::NodeId;

mod common;

use crate::common::{
    logging::setup_logger, node::Node, node::NodeOptions, transport::mock_transport, wait_until,
};

#[test]
fn signed_log_test() {
    setup_logger(LevelFilter::Info);

    let member_ids = vec![NodeId::new(1), NodeId::new(2)];
    let dirs = [tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap()];

    // 1. Generate both keypairs and the shared public-key store.
    let mut csprg = OsRng {};
    let keys: Vec<SigningKey> = (0..2).map(|_| SigningKey::generate(&mut csprg)).collect();
    let mut public_keys = PublicKeyStore::new();
    for (id, key) in member_ids.iter().zip(keys.iter()) {
        public_keys.insert(*id, key.verifying_key());
    }

    let start_pair = |keys: &[SigningKey], public_keys: &PublicKeyStore| -> Vec<Node> {
        let (transports, _faults) = mock_transport(&member_ids);
        member_ids
            .iter()
            .zip(transports)
            .zip(keys)
            .map(|((id, transport), key)| {
                Node::start(
                    id.int(),
                    transport,
                    Membership::Founding(member_ids.clone()),
                    FileLogStore::open(dirs[(id.int() - 1) as usize].path()).unwrap(),
                    NodeOptions {
                        suspicion_timeout: Duration::from_secs(30),
                        signing: Some((key.clone(), public_keys.clone())),
                        ..NodeOptions::default()
                    },
                )
                .expect("members start")
            })
            .collect()
    };

    // 2. First run: ten increments, all ten versions persisted and verified shard-wide.
    {
        let nodes = start_pair(&keys, &public_keys);
        let subgroup = nodes[0].subgroup_id();
        log::info!("applying 10 increments under signing");
        for _ in 0..10 {
            nodes[0].add(1);
        }
        wait_until(Duration::from_secs(60), "10 versions verified shard-wide", || {
            nodes.iter().all(|node| {
                node.group.global_persisted(subgroup).index() == 9
                    && node.group.global_verified(subgroup).index() == 9
            })
        });
        // The verified callback fired once per version.
        wait_until(Duration::from_secs(10), "10 verified callbacks per node", || {
            nodes.iter().all(|node| {
                node.recorder
                    .global_verifies
                    .load(std::sync::atomic::Ordering::SeqCst)
                    == 10
            })
        });
    }

    // 3. Corrupt one payload byte of node 2's record for the sixth version (index 5).
    log::info!("corrupting node 2's log record at version index 5");
    corrupt_record_payload(&dirs[1].path().join("subgroup_0.log"), 5);

    // 4. Second run over the same logs and keys.
    let nodes = start_pair(&keys, &public_keys);
    let subgroup = nodes[0].subgroup_id();

    // 5. Durability is unaffected: every version is still on every disk. Verification stops at
    //    the last version before the corruption, on both members, and stays there.
    wait_until(
        Duration::from_secs(60),
        "the persisted watermark recovers and verification pins at index 4",
        || {
            nodes.iter().all(|node| {
                node.group.global_persisted(subgroup).index() == 9
                    && node.group.global_verified(subgroup).index() == 4
            })
        },
    );
    std::thread::sleep(Duration::from_secs(1));
    for node in &nodes {
        assert_eq!(node.group.global_verified(subgroup).index(), 4);
        assert_eq!(node.group.global_persisted(subgroup).index(), 9);
    }
}

/// Flip one payload byte of the `target_index`-th record in a log file, leaving every length
/// field and signature untouched.
fn corrupt_record_payload(path: &Path, target_index: u64) {
    let bytes = fs::read(path).unwrap();
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (record, consumed) = LogRecord::decode(&bytes[offset..]).unwrap();
        records.push(record);
        offset += consumed;
    }

    let target = records
        .iter_mut()
        .find(|record| record.version.index() == target_index)
        .expect("the target version is in the log");
    target.payload[0] ^= 0xff;

    let mut rewritten = Vec::new();
    for record in &records {
        rewritten.extend_from_slice(&record.encode());
    }
    fs::write(path, rewritten).unwrap();
}
