/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The persistence manager: a worker thread that drains a queue of `(subgroup, version)`
//! requests, writes each version's staged state snapshot to the subgroup's append-only log,
//! signs it into the subgroup's hash chain when signing is enabled, and publishes the new
//! persisted watermark (and signature) through the status table.
//!
//! ## Signature chain
//!
//! The signature over version v covers `sha256(record bytes of v) || signature of v−1`, so each
//! log is a hash chain: verifying a peer's signature at v against one's own (byte-identical)
//! record at v, chained through the peer's previous signature, proves agreement on the whole
//! prefix. Verification is sequential per peer and never skips: the verified watermark simply
//! stops advancing at the first version whose signature does not check out.
//!
//! ## Queue discipline
//!
//! Enqueue happens on the delivery path, so the queue is guarded by a test-and-set spin flag
//! that is never held across I/O; a counting semaphore wakes the single worker. Log writes and
//! signing happen outside every lock; only the two column writes at the end run under the
//! current-view read lock, staged into locals first to keep the critical section to a few table
//! stores.
//!
//! ## Failure semantics
//!
//! A log-write failure is logged and the version is parked: it is not reported persisted, and a
//! view install re-posts it. A corrupt signature from a peer is reported once and pins that
//! peer's verified watermark; the subgroup keeps running.

use sha2::{Digest, Sha256};
use std::{
    cell::UnsafeCell,
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender, TryRecvError},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::SystemTime,
};

use crate::dispatcher::{ObjectRegistry, UserMessageCallbacks};
use crate::events::{Event, GlobalPersistEvent, GlobalVerifyEvent, LocalPersistEvent, SignatureInvalidEvent};
use crate::keys::{Keypair, PublicKeyStore};
use crate::log_store::{LogRecord, LogStore};
use crate::replicated::StagedVersion;
use crate::status_table::ColumnSet;
use crate::transport::{PushDest, StatusPusher, Transport};
use crate::types::basic::{NodeId, SignatureBytes, SubgroupId, Version};
use crate::view_manager::SharedCurrentView;

/// A mutual exclusion primitive built on a test-and-set flag. Held only for queue pushes and
/// pops, never across I/O, so spinning beats parking.
pub(crate) struct SpinLock<T> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the flag serializes all access to `value`; `acquire`/`release` orderings make the
// protected writes visible to the next holder.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub(crate) fn new(value: T) -> SpinLock<T> {
        SpinLock {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        while self
            .flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        // Safety: the flag is held, so this is the only live reference.
        let result = f(unsafe { &mut *self.value.get() });
        self.flag.store(false, Ordering::Release);
        result
    }
}

/// A counting semaphore: `post` adds a permit and wakes a waiter, `wait` blocks for one.
pub(crate) struct Semaphore {
    permits: Mutex<u64>,
    available: Condvar,
}

impl Semaphore {
    pub(crate) fn new() -> Semaphore {
        Semaphore {
            permits: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    pub(crate) fn post(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.available.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
    }
}

struct PersistenceShared {
    queue: SpinLock<VecDeque<(SubgroupId, Version)>>,
    wakeup: Semaphore,
    shutdown: AtomicBool,
    /// Staged snapshots whose log write failed, awaiting the next view install's retry.
    failed: Mutex<Vec<(SubgroupId, StagedVersion)>>,
    /// Subgroups whose local log was populated by state transfer rather than by this process:
    /// the first version signed here starts a fresh chain (empty previous signature) instead of
    /// chaining over the donor's last signature.
    chain_reset: Mutex<HashSet<SubgroupId>>,
}

/// Cloneable handle through which the delivery path posts persistence requests.
#[derive(Clone)]
pub(crate) struct PersistenceHandle {
    shared: Arc<PersistenceShared>,
}

impl PersistenceHandle {
    /// Post a persistence request for `version` of `subgroup` and wake the worker.
    pub(crate) fn post_persist_request(&self, subgroup: SubgroupId, version: Version) {
        self.shared
            .queue
            .with(|queue| queue.push_back((subgroup, version)));
        self.shared.wakeup.post();
    }

    /// Mark `subgroup`'s log as transferred from a donor: the chain this process signs starts
    /// fresh rather than continuing over the donor's signatures.
    pub(crate) fn mark_chain_reset(&self, subgroup: SubgroupId) {
        self.shared.chain_reset.lock().unwrap().insert(subgroup);
    }

    /// Re-post every parked failure. Called at view install: versions that never persisted are
    /// tried again in the new view.
    pub(crate) fn retry_failed(&self) {
        let requests: Vec<(SubgroupId, Version)> = {
            let failed = self.shared.failed.lock().unwrap();
            failed
                .iter()
                .map(|(subgroup, staged)| (*subgroup, staged.version))
                .collect()
        };
        for (subgroup, version) in requests {
            self.post_persist_request(subgroup, version);
        }
    }
}

/// The worker thread plus the shared queue. Owned by the group; dropped last among the
/// persistence-facing pieces.
pub(crate) struct PersistenceManager {
    shared: Arc<PersistenceShared>,
    worker: Option<JoinHandle<()>>,
}

impl PersistenceManager {
    /// Start the persistence worker.
    pub(crate) fn start<T: Transport>(
        registry: Arc<Mutex<ObjectRegistry>>,
        log_store: Arc<Mutex<Box<dyn LogStore>>>,
        signer: Option<Keypair>,
        current: SharedCurrentView,
        mut pusher: StatusPusher<T>,
        callbacks: Arc<UserMessageCallbacks>,
        event_publisher: Option<Sender<Event>>,
    ) -> PersistenceManager {
        let shared = Arc::new(PersistenceShared {
            queue: SpinLock::new(VecDeque::new()),
            wakeup: Semaphore::new(),
            shutdown: AtomicBool::new(false),
            failed: Mutex::new(Vec::new()),
            chain_reset: Mutex::new(HashSet::new()),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("persist".to_string())
            .spawn(move || {
                // The previous signature of each subgroup's chain, recovered lazily from the
                // log tail.
                let mut chain_prev: HashMap<SubgroupId, Vec<u8>> = HashMap::new();

                loop {
                    worker_shared.wakeup.wait();
                    let request = worker_shared.queue.with(|queue| queue.pop_front());
                    let Some((subgroup, version)) = request else {
                        if worker_shared.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        continue;
                    };

                    persist_one(
                        subgroup,
                        version,
                        &worker_shared,
                        &registry,
                        &log_store,
                        &signer,
                        &mut chain_prev,
                        &current,
                        &mut pusher,
                        &callbacks,
                        &event_publisher,
                    );

                    if worker_shared.shutdown.load(Ordering::Acquire) {
                        let drained = worker_shared.queue.with(|queue| queue.is_empty());
                        if drained {
                            break;
                        }
                        // More requests arrived before shutdown: keep draining.
                        worker_shared.wakeup.post();
                    }
                }
            })
            .expect("the persist thread can be spawned");

        PersistenceManager {
            shared,
            worker: Some(worker),
        }
    }

    pub(crate) fn handle(&self) -> PersistenceHandle {
        PersistenceHandle {
            shared: self.shared.clone(),
        }
    }

    /// Set the shutdown flag and kick the worker in case it is sleeping; the worker drains the
    /// queue, then exits. If `wait`, block until its thread has joined.
    pub(crate) fn shutdown(&mut self, wait: bool) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.post();
        if wait {
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for PersistenceManager {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

/// Process one persistence request: write every staged snapshot at or below `version` to the
/// log (signing into the chain when enabled), then publish the new persisted watermark.
fn persist_one<T: Transport>(
    subgroup: SubgroupId,
    version: Version,
    shared: &PersistenceShared,
    registry: &Arc<Mutex<ObjectRegistry>>,
    log_store: &Arc<Mutex<Box<dyn LogStore>>>,
    signer: &Option<Keypair>,
    chain_prev: &mut HashMap<SubgroupId, Vec<u8>>,
    current: &SharedCurrentView,
    pusher: &mut StatusPusher<T>,
    callbacks: &Arc<UserMessageCallbacks>,
    event_publisher: &Option<Sender<Event>>,
) {
    // Collect the snapshots to write: parked failures first, then fresh stages.
    let mut staged: Vec<(SubgroupId, StagedVersion)> = {
        let mut failed = shared.failed.lock().unwrap();
        let mut taken = Vec::new();
        let mut index = 0;
        while index < failed.len() {
            if failed[index].0 == subgroup && failed[index].1.version <= version {
                taken.push(failed.remove(index));
            } else {
                index += 1;
            }
        }
        taken
    };
    {
        let mut registry = registry.lock().unwrap();
        if let Some(entry) = registry.objects.get_mut(&subgroup) {
            staged.extend(
                entry
                    .take_staged(version)
                    .into_iter()
                    .map(|snapshot| (subgroup, snapshot)),
            );
        }
    }
    staged.sort_by_key(|(_, snapshot)| snapshot.version);

    for (_, snapshot) in staged {
        let StagedVersion {
            version: snapshot_version,
            hlc,
            state,
        } = snapshot;
        let mut record = LogRecord {
            version: snapshot_version,
            hlc,
            payload: state,
            signature: Vec::new(),
        };

        // Sign into a local buffer first; the signature reaches the table only under the view
        // read lock below, which stays short this way.
        let signature = match signer {
            Some(keypair) => {
                let prev = match chain_prev.get(&subgroup) {
                    Some(prev) => prev.clone(),
                    None => {
                        let recovered = if shared.chain_reset.lock().unwrap().remove(&subgroup) {
                            Vec::new()
                        } else {
                            recover_chain_prev(log_store, subgroup)
                        };
                        chain_prev.insert(subgroup, recovered.clone());
                        recovered
                    }
                };
                let signature = keypair.sign(&chain_input(&record, &prev));
                record.signature = signature.bytes().to_vec();
                Some(signature)
            }
            None => None,
        };

        let appended = log_store.lock().unwrap().append(subgroup, &record);
        match appended {
            Ok(()) => {
                chain_prev.insert(subgroup, record.signature.clone());
                {
                    let current = current.read().unwrap();
                    current.table.set_persisted(subgroup, snapshot_version, signature);
                }
                pusher.push(&ColumnSet::persistence(subgroup), PushDest::ShardPeers(subgroup));

                if let Some(callback) = &callbacks.local_persistence {
                    callback(subgroup, snapshot_version);
                }
                Event::LocalPersist(LocalPersistEvent {
                    timestamp: SystemTime::now(),
                    subgroup_id: subgroup,
                    version: snapshot_version,
                })
                .publish(event_publisher);
            }
            Err(err) => {
                log::error!(
                    "persist failed for subgroup {subgroup} version {snapshot_version}: {err:?}; \
                     will retry at the next view install"
                );
                shared.failed.lock().unwrap().push((
                    subgroup,
                    StagedVersion {
                        version: snapshot_version,
                        hlc,
                        state: record.payload,
                    },
                ));
            }
        }
    }
}

/// The bytes a signature over `record` covers: the record's digest chained with the previous
/// version's signature.
pub(crate) fn chain_input(record: &LogRecord, prev_signature: &[u8]) -> Vec<u8> {
    let digest: [u8; 32] = Sha256::digest(record.signed_prefix()).into();
    let mut input = Vec::with_capacity(32 + prev_signature.len());
    input.extend_from_slice(&digest);
    input.extend_from_slice(prev_signature);
    input
}

fn recover_chain_prev(
    log_store: &Arc<Mutex<Box<dyn LogStore>>>,
    subgroup: SubgroupId,
) -> Vec<u8> {
    let mut store = log_store.lock().unwrap();
    match store.last_version(subgroup) {
        Ok(last) if !last.is_none() => match store.read(subgroup, last) {
            Ok(Some(record)) => record.signature,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Per-peer progress of sequential signature-chain verification in one subgroup.
struct PeerChain {
    verified_up_to: Version,
    /// The peer's signature at `verified_up_to`: the chain input for the next version.
    prev_signature: Vec<u8>,
    /// Observed but not yet verified signatures, by version.
    pending: BTreeMap<Version, SignatureBytes>,
    /// Whether anything has been verified (or skipped) yet. A virgin chain may fast-forward to
    /// the peer's first observed signature: versions before a peer joined were signed by its
    /// state-transfer donor, and the peer's own chain starts fresh above them.
    started: bool,
    /// Set once a signature fails, so the failure is reported exactly once.
    reported_invalid: bool,
}

impl PeerChain {
    fn new() -> PeerChain {
        PeerChain {
            verified_up_to: Version::NONE,
            prev_signature: Vec::new(),
            pending: BTreeMap::new(),
            started: false,
            reported_invalid: false,
        }
    }
}

struct SubgroupWatermarks {
    persist_fired: Version,
    verify_fired: Version,
    own_verified_pushed: Version,
    peers: HashMap<NodeId, PeerChain>,
}

impl SubgroupWatermarks {
    fn new() -> SubgroupWatermarks {
        SubgroupWatermarks {
            persist_fired: Version::NONE,
            verify_fired: Version::NONE,
            own_verified_pushed: Version::NONE,
            peers: HashMap::new(),
        }
    }
}

/// Observes the table's persisted and signature columns and advances the two global watermarks,
/// firing the corresponding callbacks once per version.
pub(crate) struct WatermarkTracker {
    local_id: NodeId,
    subgroups: HashMap<SubgroupId, SubgroupWatermarks>,
}

impl WatermarkTracker {
    pub(crate) fn new(local_id: NodeId) -> WatermarkTracker {
        WatermarkTracker {
            local_id,
            subgroups: HashMap::new(),
        }
    }

    /// Feed a signature observation that arrived out of band (signature catch-up after a view
    /// change) rather than through the table.
    pub(crate) fn note_signature(
        &mut self,
        subgroup: SubgroupId,
        peer: NodeId,
        version: Version,
        signature: SignatureBytes,
    ) {
        let chains = self.subgroups.entry(subgroup).or_insert_with(SubgroupWatermarks::new);
        let chain = chains.peers.entry(peer).or_insert_with(PeerChain::new);
        if version > chain.verified_up_to {
            chain.pending.insert(version, signature);
        }
    }

    /// One pass of the predicate task: advance `global_persisted` and `global_verified` for
    /// every locally sharded subgroup, firing callbacks and events for each newly covered
    /// version.
    pub(crate) fn poll<T: Transport>(
        &mut self,
        current: &SharedCurrentView,
        log_store: &Arc<Mutex<Box<dyn LogStore>>>,
        keys: Option<&PublicKeyStore>,
        pusher: &mut StatusPusher<T>,
        callbacks: &Arc<UserMessageCallbacks>,
        event_publisher: &Option<Sender<Event>>,
    ) {
        // Snapshot what we need from the table under the read lock, then verify and read logs
        // outside it.
        struct SubgroupSnapshot {
            subgroup: SubgroupId,
            shard_members: Vec<NodeId>,
            global_persisted: Version,
            own_persisted: Version,
            observations: Vec<(NodeId, Vec<(Version, SignatureBytes)>)>,
        }

        let snapshots: Vec<SubgroupSnapshot> = {
            let current = current.read().unwrap();
            let local_id = self.local_id;
            current
                .view
                .subgroups
                .iter()
                .filter_map(|info| {
                    let shard = info.shard_of(local_id)?;
                    let ranks: Vec<usize> = shard
                        .members
                        .iter()
                        .map(|member| current.view.rank_of(*member).expect("shards contain members"))
                        .collect();
                    let observations = shard
                        .members
                        .iter()
                        .zip(ranks.iter())
                        .filter(|(member, _)| **member != local_id)
                        .map(|(member, rank)| {
                            (*member, current.table.row(*rank).drain_sig_inbox(info.subgroup_id))
                        })
                        .collect();
                    Some(SubgroupSnapshot {
                        subgroup: info.subgroup_id,
                        shard_members: shard.members.clone(),
                        global_persisted: current.table.min_persisted(info.subgroup_id, &ranks),
                        own_persisted: current.table.local_row().persisted_num(info.subgroup_id),
                        observations,
                    })
                })
                .collect()
        };

        for snapshot in snapshots {
            let watermarks = self
                .subgroups
                .entry(snapshot.subgroup)
                .or_insert_with(SubgroupWatermarks::new);

            // Global persistence: every shard member persisted these versions.
            if snapshot.global_persisted > watermarks.persist_fired {
                let newly_covered = read_versions_between(
                    log_store,
                    snapshot.subgroup,
                    watermarks.persist_fired,
                    snapshot.global_persisted,
                );
                for version in newly_covered {
                    if let Some(callback) = &callbacks.global_persistence {
                        callback(snapshot.subgroup, version);
                    }
                    Event::GlobalPersist(GlobalPersistEvent {
                        timestamp: SystemTime::now(),
                        subgroup_id: snapshot.subgroup,
                        version,
                    })
                    .publish(event_publisher);
                }
                watermarks.persist_fired = snapshot.global_persisted;
            }

            // Global verification: sequential per-peer chain checks against the local log.
            let Some(keys) = keys else { continue };
            for (peer, observations) in snapshot.observations {
                let chain = watermarks.peers.entry(peer).or_insert_with(PeerChain::new);
                for (version, signature) in observations {
                    if version > chain.verified_up_to {
                        chain.pending.insert(version, signature);
                    }
                }
                advance_peer_chain(
                    snapshot.subgroup,
                    peer,
                    chain,
                    log_store,
                    keys,
                    event_publisher,
                );
            }

            // This member's own verification progress: the lowest point to which it has checked
            // every peer's chain (its own log is trivially verified up to what it persisted).
            let own_verified = snapshot
                .shard_members
                .iter()
                .map(|member| {
                    if *member == self.local_id {
                        snapshot.own_persisted
                    } else {
                        watermarks
                            .peers
                            .get(member)
                            .map(|chain| chain.verified_up_to)
                            .unwrap_or(Version::NONE)
                    }
                })
                .min()
                .unwrap_or(Version::NONE);

            // The global watermark is the minimum of the verified columns across the shard: a
            // replica whose own log disagrees with the group pins it for everyone.
            let row_min_verified = {
                let current = current.read().unwrap();
                current.table.set_verified_num(snapshot.subgroup, own_verified);
                let ranks: Vec<usize> = snapshot
                    .shard_members
                    .iter()
                    .filter_map(|member| current.view.rank_of(*member))
                    .collect();
                ranks
                    .iter()
                    .map(|rank| current.table.row(*rank).verified_num(snapshot.subgroup))
                    .min()
                    .unwrap_or(Version::NONE)
            };
            if own_verified > watermarks.own_verified_pushed {
                pusher.push(
                    &ColumnSet::persistence(snapshot.subgroup),
                    PushDest::ShardPeers(snapshot.subgroup),
                );
                watermarks.own_verified_pushed = own_verified;
            }

            if row_min_verified > watermarks.verify_fired {
                let newly_covered = read_versions_between(
                    log_store,
                    snapshot.subgroup,
                    watermarks.verify_fired,
                    row_min_verified,
                );
                for version in newly_covered {
                    if let Some(callback) = &callbacks.global_verified {
                        callback(snapshot.subgroup, version);
                    }
                    Event::GlobalVerify(GlobalVerifyEvent {
                        timestamp: SystemTime::now(),
                        subgroup_id: snapshot.subgroup,
                        version,
                    })
                    .publish(event_publisher);
                }
                watermarks.verify_fired = row_min_verified;
            }
        }
    }
}

/// Verify as much of `peer`'s pending signature chain as the local log allows.
fn advance_peer_chain(
    subgroup: SubgroupId,
    peer: NodeId,
    chain: &mut PeerChain,
    log_store: &Arc<Mutex<Box<dyn LogStore>>>,
    keys: &PublicKeyStore,
    event_publisher: &Option<Sender<Event>>,
) {
    if chain.reported_invalid {
        return;
    }
    // Fast-forward a virgin chain to the peer's first observed signature: everything below it
    // predates the peer's chain (donor-signed history shipped by state transfer).
    if !chain.started {
        if let Some((&first, _)) = chain.pending.first_key_value() {
            chain.verified_up_to = Version::from_int(first.int() - 1);
            chain.started = true;
        } else {
            return;
        }
    }
    while let Some((&target, _)) = chain.pending.first_key_value() {
        if target <= chain.verified_up_to {
            chain.pending.remove(&target);
            continue;
        }
        let records = {
            let mut store = log_store.lock().unwrap();
            match store.read_range(subgroup, chain.verified_up_to, target) {
                Ok(records) => records,
                Err(err) => {
                    log::error!("cannot read log for verification of subgroup {subgroup}: {err:?}");
                    return;
                }
            }
        };
        if records.is_empty() {
            // The local log has not caught up to the observed signature yet.
            return;
        }
        for record in records {
            let Some(signature) = chain.pending.get(&record.version).copied() else {
                // Gap in observations; wait for catch-up.
                return;
            };
            let input = chain_input(&record, &chain.prev_signature);
            if keys.verify(peer, &input, &signature) {
                chain.verified_up_to = record.version;
                chain.prev_signature = signature.bytes().to_vec();
                chain.pending.remove(&record.version);
            } else {
                chain.reported_invalid = true;
                log::warn!(
                    "signature from {peer} for subgroup {subgroup} version {} is invalid; \
                     the verified watermark will not advance past {}",
                    record.version,
                    chain.verified_up_to
                );
                Event::SignatureInvalid(SignatureInvalidEvent {
                    timestamp: SystemTime::now(),
                    subgroup_id: subgroup,
                    peer,
                    version: record.version,
                })
                .publish(event_publisher);
                return;
            }
        }
    }
}

/// The versions recorded in the local log in `(from, to]`, in order.
fn read_versions_between(
    log_store: &Arc<Mutex<Box<dyn LogStore>>>,
    subgroup: SubgroupId,
    from: Version,
    to: Version,
) -> Vec<Version> {
    let mut store = log_store.lock().unwrap();
    match store.read_range(subgroup, from, to) {
        Ok(records) => records.into_iter().map(|record| record.version).collect(),
        Err(err) => {
            log::error!("cannot enumerate log versions for subgroup {subgroup}: {err:?}");
            Vec::new()
        }
    }
}

/// Spawn the predicate poller thread, which repeatedly advances the global watermarks until
/// shutdown.
pub(crate) fn start_predicate_poller<T: Transport>(
    tracker: Arc<Mutex<WatermarkTracker>>,
    current: SharedCurrentView,
    log_store: Arc<Mutex<Box<dyn LogStore>>>,
    keys: Option<Arc<PublicKeyStore>>,
    mut pusher: StatusPusher<T>,
    callbacks: Arc<UserMessageCallbacks>,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("predicates".to_string())
        .spawn(move || loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("predicates thread disconnected from main thread")
                }
            }

            tracker.lock().unwrap().poll(
                &current,
                &log_store,
                keys.as_deref(),
                &mut pusher,
                &callbacks,
                &event_publisher,
            );
            thread::sleep(std::time::Duration::from_millis(1));
        })
        .expect("the predicates thread can be spawned")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_lock_serializes_concurrent_pushes() {
        let lock = Arc::new(SpinLock::new(Vec::new()));
        let mut handles = Vec::new();
        for worker in 0..4 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for item in 0..100 {
                    lock.with(|values: &mut Vec<u64>| values.push(worker * 100 + item));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.with(|values| values.len()), 400);
    }

    #[test]
    fn semaphore_counts_posts() {
        let semaphore = Arc::new(Semaphore::new());
        for _ in 0..3 {
            semaphore.post();
        }
        // All three permits must be consumable without blocking.
        for _ in 0..3 {
            semaphore.wait();
        }
    }

    #[test]
    fn chain_input_binds_record_to_previous_signature() {
        let record = LogRecord {
            version: Version::from_int(3),
            hlc: crate::types::basic::Hlc::new(5, 0),
            payload: b"state".to_vec(),
            signature: Vec::new(),
        };
        let first = chain_input(&record, &[1u8; 64]);
        let second = chain_input(&record, &[2u8; 64]);
        assert_ne!(first, second);
        assert_eq!(first[..32], second[..32]);
    }
}
