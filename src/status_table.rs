/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replicated status table: one row per member of the current view, columns of monotone
//! progress counters, and the delta messages that replicate the local row to peers.
//!
//! Every agreement predicate in the library (delivery stability, durability watermarks, ragged
//! trim, membership-change commit, failure suspicion) is a statement of the form "all rows
//! satisfy P" over this table, evaluated locally without further messaging. Two disciplines make
//! that sound without locks around the counters:
//!
//! 1. **Single writer per row.** Only the owning process writes its own row; everything a peer
//!    learns about that row arrives through [`StatusDelta`] messages folded into the local cache
//!    of the peer's row.
//! 2. **Column monotonicity.** Every counter column is nondecreasing for a given (row, view), and
//!    deltas are folded with monotone-max semantics, so a stale read is always a lower bound and
//!    never inconsistent.
//!
//! The table is sized for one view. At view install a new table is constructed, the columns
//! whose values outlive views (persisted, verified, signatures) are migrated, and the current
//! table pointer is swapped under the install barrier.

use borsh::{BorshDeserialize, BorshSerialize};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Mutex,
    },
};

use crate::types::{
    basic::{MessageId, NodeId, SignatureBytes, SubgroupId, Version, ViewId},
    view::{MembershipChange, View},
};

/// One member's full set of status columns.
pub struct StatusRow {
    heartbeat: AtomicU64,
    num_changes: AtomicU64,
    num_committed: AtomicU64,
    num_installed: AtomicU64,
    /// Set when the row's owner has stopped sending and delivering in the current view, in
    /// preparation for a view change.
    wedged: AtomicBool,
    /// One bit per member of the current view.
    suspicion: Vec<AtomicBool>,
    changes: Mutex<ChangeRing>,
    /// Published by the leader of a view change; copied by every survivor.
    ragged_trim: Mutex<Option<RaggedTrim>>,
    subgroups: Vec<SubgroupColumns>,
}

/// Per-subgroup progress columns of one row. All counters start at −1 ("none yet").
pub struct SubgroupColumns {
    /// Highest message id the row's owner has published in this subgroup this view, nulls
    /// included.
    seq_num: AtomicI64,
    /// Per shard-sender rank: highest message id received contiguously from that sender. This
    /// vector is the ragged edge consulted by the trim step.
    received_num: Vec<AtomicI64>,
    /// Version of the latest message the row's owner has delivered.
    delivered_num: AtomicI64,
    /// Stable-version watermark as computed by the row's owner.
    stable_num: AtomicI64,
    /// Version watermark the row's owner has persisted to its local log.
    persisted_num: AtomicI64,
    /// Version watermark up to which the row's owner has verified every shard peer's signature.
    verified_num: AtomicI64,
    /// The owner's chained signature over the version in `persisted_num`.
    signature: Mutex<Option<(Version, SignatureBytes)>>,
    /// Every signature observation folded into this cached row, in arrival order, awaiting the
    /// verification task. The transport is in-order and the owner pushes once per persisted
    /// version, so draining this inbox sees the owner's whole signature chain.
    sig_inbox: Mutex<VecDeque<(Version, SignatureBytes)>>,
}

/// Verification stalls when a peer's chain goes bad; beyond this many parked observations the
/// oldest are dropped, since the watermark can no longer advance through them anyway.
const SIG_INBOX_CAPACITY: usize = 4096;

impl SubgroupColumns {
    fn new(shard_size: usize) -> SubgroupColumns {
        SubgroupColumns {
            seq_num: AtomicI64::new(-1),
            received_num: (0..shard_size).map(|_| AtomicI64::new(-1)).collect(),
            delivered_num: AtomicI64::new(Version::NONE.int()),
            stable_num: AtomicI64::new(Version::NONE.int()),
            persisted_num: AtomicI64::new(Version::NONE.int()),
            verified_num: AtomicI64::new(Version::NONE.int()),
            signature: Mutex::new(None),
            sig_inbox: Mutex::new(VecDeque::new()),
        }
    }
}

impl StatusRow {
    fn new(num_members: usize, shard_sizes: &[usize], changes_capacity: usize) -> StatusRow {
        StatusRow {
            heartbeat: AtomicU64::new(0),
            num_changes: AtomicU64::new(0),
            num_committed: AtomicU64::new(0),
            num_installed: AtomicU64::new(0),
            wedged: AtomicBool::new(false),
            suspicion: (0..num_members).map(|_| AtomicBool::new(false)).collect(),
            changes: Mutex::new(ChangeRing::new(changes_capacity)),
            ragged_trim: Mutex::new(None),
            subgroups: shard_sizes
                .iter()
                .map(|size| SubgroupColumns::new(*size))
                .collect(),
        }
    }

    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Acquire)
    }

    pub fn num_changes(&self) -> u64 {
        self.num_changes.load(Ordering::Acquire)
    }

    pub fn num_committed(&self) -> u64 {
        self.num_committed.load(Ordering::Acquire)
    }

    pub fn num_installed(&self) -> u64 {
        self.num_installed.load(Ordering::Acquire)
    }

    pub fn wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }

    pub fn suspects(&self, rank: usize) -> bool {
        self.suspicion
            .get(rank)
            .map(|bit| bit.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn change(&self, index: u64) -> Result<MembershipChange, ChangeRingError> {
        self.changes.lock().unwrap().get(index)
    }

    pub fn ragged_trim(&self) -> Option<RaggedTrim> {
        self.ragged_trim.lock().unwrap().clone()
    }

    pub fn seq_num(&self, subgroup: SubgroupId) -> MessageId {
        MessageId::new(self.subgroups[subgroup.index()].seq_num.load(Ordering::Acquire) as i32)
    }

    pub fn received_num(&self, subgroup: SubgroupId, sender_rank: usize) -> MessageId {
        MessageId::new(
            self.subgroups[subgroup.index()].received_num[sender_rank].load(Ordering::Acquire)
                as i32,
        )
    }

    pub fn delivered_num(&self, subgroup: SubgroupId) -> Version {
        Version::from_int(self.subgroups[subgroup.index()].delivered_num.load(Ordering::Acquire))
    }

    pub fn stable_num(&self, subgroup: SubgroupId) -> Version {
        Version::from_int(self.subgroups[subgroup.index()].stable_num.load(Ordering::Acquire))
    }

    pub fn persisted_num(&self, subgroup: SubgroupId) -> Version {
        Version::from_int(self.subgroups[subgroup.index()].persisted_num.load(Ordering::Acquire))
    }

    pub fn verified_num(&self, subgroup: SubgroupId) -> Version {
        Version::from_int(self.subgroups[subgroup.index()].verified_num.load(Ordering::Acquire))
    }

    pub fn signature(&self, subgroup: SubgroupId) -> Option<(Version, SignatureBytes)> {
        *self.subgroups[subgroup.index()].signature.lock().unwrap()
    }

    /// Take every signature observation parked on this row since the last drain.
    pub fn drain_sig_inbox(&self, subgroup: SubgroupId) -> Vec<(Version, SignatureBytes)> {
        self.subgroups[subgroup.index()]
            .sig_inbox
            .lock()
            .unwrap()
            .drain(..)
            .collect()
    }
}

/// Bounded ring of proposed membership changes. Entries are identified by a monotone index that
/// never wraps; only the most recent `capacity` entries remain readable.
pub struct ChangeRing {
    capacity: usize,
    first_index: u64,
    entries: VecDeque<MembershipChange>,
}

impl ChangeRing {
    pub fn new(capacity: usize) -> ChangeRing {
        ChangeRing {
            capacity,
            first_index: 0,
            entries: VecDeque::new(),
        }
    }

    /// Append a change, evicting the oldest entry when full. Returns the new entry's index.
    pub fn append(&mut self, change: MembershipChange) -> u64 {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.first_index += 1;
        }
        self.entries.push_back(change);
        self.first_index + self.entries.len() as u64 - 1
    }

    /// Total number of changes ever appended (including evicted ones).
    pub fn len(&self) -> u64 {
        self.first_index + self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u64) -> Result<MembershipChange, ChangeRingError> {
        if index < self.first_index {
            return Err(ChangeRingError::Truncated {
                requested: index,
                oldest_retained: self.first_index,
            });
        }
        self.entries
            .get((index - self.first_index) as usize)
            .copied()
            .ok_or(ChangeRingError::NotYetProposed { requested: index })
    }

    /// The retained tail starting at `from`, for replication to peers.
    fn tail(&self, from: u64) -> (u64, Vec<MembershipChange>) {
        let start = from.max(self.first_index);
        let skip = (start - self.first_index) as usize;
        (start, self.entries.iter().skip(skip).copied().collect())
    }

    fn fold(&mut self, base: u64, tail: &[MembershipChange]) {
        for (offset, change) in tail.iter().enumerate() {
            let index = base + offset as u64;
            if index == self.len() {
                self.append(*change);
            }
        }
    }

    /// Fold into a fresh ring whose history may start beyond index 0 (migration from a prior
    /// view's ring that has already evicted early entries).
    fn fold_from(&mut self, base: u64, tail: &[MembershipChange]) {
        if self.entries.is_empty() && self.first_index == 0 && base > 0 {
            self.first_index = base;
        }
        self.fold(base, tail);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChangeRingError {
    /// The entry was evicted from the ring; the requester must fall back to full state transfer.
    Truncated { requested: u64, oldest_retained: u64 },
    NotYetProposed { requested: u64 },
}

/// The per-sender delivery cutoffs the view-change leader publishes before a new view installs:
/// `trims[subgroup][shard][sender_rank]` is the highest message id every survivor of that shard
/// must deliver from that sender in the dying view. Every survivor copies its shard's vector
/// and truncates to it, which is what makes the delivery sets of the dying view identical
/// across survivors.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct RaggedTrim {
    /// The view being closed out.
    pub view_id: ViewId,
    pub trims: Vec<Vec<Vec<MessageId>>>,
}

/// Selects which column groups of the local row a [`StatusDelta`] carries. Mirrors the put
/// operation of a remote-write table: the writer names a column range instead of shipping the
/// whole row.
#[derive(Clone, Default)]
pub struct ColumnSet {
    pub heartbeat: bool,
    pub membership: bool,
    pub suspicion: bool,
    pub ragged_trim: bool,
    pub subgroups: Vec<(SubgroupId, SubgroupColumnSet)>,
}

#[derive(Clone, Copy, Default)]
pub struct SubgroupColumnSet {
    pub seq: bool,
    pub received: bool,
    pub delivered: bool,
    pub stable: bool,
    pub persisted: bool,
    pub verified: bool,
}

impl ColumnSet {
    pub fn heartbeat() -> ColumnSet {
        ColumnSet {
            heartbeat: true,
            ..ColumnSet::default()
        }
    }

    pub fn membership() -> ColumnSet {
        ColumnSet {
            membership: true,
            ..ColumnSet::default()
        }
    }

    pub fn suspicion() -> ColumnSet {
        ColumnSet {
            suspicion: true,
            ..ColumnSet::default()
        }
    }

    pub fn ragged_trim() -> ColumnSet {
        ColumnSet {
            ragged_trim: true,
            ..ColumnSet::default()
        }
    }

    /// The columns the multicast group writes on send and delivery.
    pub fn multicast(subgroup: SubgroupId) -> ColumnSet {
        ColumnSet {
            subgroups: vec![(
                subgroup,
                SubgroupColumnSet {
                    seq: true,
                    received: true,
                    delivered: true,
                    stable: true,
                    ..SubgroupColumnSet::default()
                },
            )],
            ..ColumnSet::default()
        }
    }

    /// The columns the persistence manager writes when a version finishes persisting.
    pub fn persistence(subgroup: SubgroupId) -> ColumnSet {
        ColumnSet {
            subgroups: vec![(
                subgroup,
                SubgroupColumnSet {
                    persisted: true,
                    verified: true,
                    ..SubgroupColumnSet::default()
                },
            )],
            ..ColumnSet::default()
        }
    }

    /// Every column. Pushed once right after a view installs so peers start the view from a
    /// complete snapshot.
    pub fn all(subgroups: impl Iterator<Item = SubgroupId>) -> ColumnSet {
        ColumnSet {
            heartbeat: true,
            membership: true,
            suspicion: true,
            ragged_trim: true,
            subgroups: subgroups
                .map(|subgroup| {
                    (
                        subgroup,
                        SubgroupColumnSet {
                            seq: true,
                            received: true,
                            delivered: true,
                            stable: true,
                            persisted: true,
                            verified: true,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// A snapshot of selected columns of one row, shipped to peers and folded into their cached copy
/// of that row. Fields left `None` were not selected by the sender's [`ColumnSet`].
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct StatusDelta {
    pub view_id: ViewId,
    pub heartbeat: Option<u64>,
    pub membership: Option<MembershipColumns>,
    pub suspicion: Option<Vec<bool>>,
    pub ragged_trim: Option<RaggedTrim>,
    pub subgroups: Vec<(SubgroupId, SubgroupDelta)>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct MembershipColumns {
    pub num_changes: u64,
    pub num_committed: u64,
    pub num_installed: u64,
    pub wedged: bool,
    /// Index of the first entry in `changes_tail`.
    pub changes_base: u64,
    pub changes_tail: Vec<MembershipChange>,
}

#[derive(Clone, Debug, Default, BorshDeserialize, BorshSerialize)]
pub struct SubgroupDelta {
    pub seq_num: Option<i64>,
    pub received_num: Option<Vec<i64>>,
    pub delivered_num: Option<i64>,
    pub stable_num: Option<i64>,
    pub persisted_num: Option<i64>,
    pub verified_num: Option<i64>,
    pub signature: Option<(Version, SignatureBytes)>,
}

/// The table itself: the local row plus locally cached copies of every peer's row, all sized for
/// one view.
pub struct StatusTable {
    view_id: ViewId,
    members: Vec<NodeId>,
    my_rank: usize,
    rows: Vec<StatusRow>,
}

impl StatusTable {
    /// Build a table sized for `view`. Each row's per-subgroup receive vector is sized to the
    /// shard of the subgroup that the row's *owner* belongs to (empty where the owner is not a
    /// shard member), so every cached row can hold what its owner publishes. Subgroup columns
    /// are indexed directly by subgroup id; a dropped subgroup leaves an unused slot.
    pub fn new(view: &View, local_id: NodeId, changes_capacity: usize) -> StatusTable {
        let my_rank = view
            .rank_of(local_id)
            .expect("a status table is only constructed for view members");
        let columns_len = view
            .subgroups
            .iter()
            .map(|info| info.subgroup_id.index() + 1)
            .max()
            .unwrap_or(0);
        let rows = view
            .members
            .iter()
            .map(|owner| {
                let mut shard_sizes = vec![0; columns_len];
                for info in &view.subgroups {
                    if let Some(shard) = info.shard_of(*owner) {
                        shard_sizes[info.subgroup_id.index()] = shard.members.len();
                    }
                }
                StatusRow::new(view.num_members(), &shard_sizes, changes_capacity)
            })
            .collect();
        StatusTable {
            view_id: view.view_id,
            members: view.members.clone(),
            my_rank,
            rows,
        }
    }

    /// Carry the columns whose values outlive views (persisted, verified, signatures, and the
    /// membership-change log with its counters) from the table of the prior view into this
    /// one. Matching is by subgroup id, which is stable across views for as long as the layout
    /// keeps the subgroup.
    pub fn migrate_from(&self, old: &StatusTable) {
        for (old_rank, old_member) in old.members.iter().enumerate() {
            let Some(new_rank) = self.members.iter().position(|m| m == old_member) else {
                continue;
            };
            let old_row = &old.rows[old_rank];
            let new_row = &self.rows[new_rank];
            new_row
                .num_changes
                .fetch_max(old_row.num_changes(), Ordering::AcqRel);
            new_row
                .num_committed
                .fetch_max(old_row.num_committed(), Ordering::AcqRel);
            new_row
                .num_installed
                .fetch_max(old_row.num_installed(), Ordering::AcqRel);
            {
                let old_changes = old_row.changes.lock().unwrap();
                let (base, tail) = old_changes.tail(0);
                new_row.changes.lock().unwrap().fold_from(base, &tail);
            }
            for (index, old_columns) in old_row.subgroups.iter().enumerate() {
                let Some(new_columns) = new_row.subgroups.get(index) else {
                    continue;
                };
                new_columns.persisted_num.fetch_max(
                    old_columns.persisted_num.load(Ordering::Acquire),
                    Ordering::AcqRel,
                );
                new_columns.verified_num.fetch_max(
                    old_columns.verified_num.load(Ordering::Acquire),
                    Ordering::AcqRel,
                );
                *new_columns.signature.lock().unwrap() = *old_columns.signature.lock().unwrap();
            }
        }
    }

    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn row(&self, rank: usize) -> &StatusRow {
        &self.rows[rank]
    }

    pub fn local_row(&self) -> &StatusRow {
        &self.rows[self.my_rank]
    }

    /* ↓↓↓ Local-row writes (single-writer discipline: called only by the owning process) ↓↓↓ */

    pub fn bump_heartbeat(&self) -> u64 {
        self.local_row().heartbeat.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_seq_num(&self, subgroup: SubgroupId, msg_id: MessageId) {
        self.local_row().subgroups[subgroup.index()]
            .seq_num
            .fetch_max(msg_id.int() as i64, Ordering::AcqRel);
    }

    pub fn set_received_num(&self, subgroup: SubgroupId, sender_rank: usize, msg_id: MessageId) {
        self.local_row().subgroups[subgroup.index()].received_num[sender_rank]
            .fetch_max(msg_id.int() as i64, Ordering::AcqRel);
    }

    pub fn set_delivered_num(&self, subgroup: SubgroupId, version: Version) {
        self.local_row().subgroups[subgroup.index()]
            .delivered_num
            .fetch_max(version.int(), Ordering::AcqRel);
    }

    pub fn set_stable_num(&self, subgroup: SubgroupId, version: Version) {
        self.local_row().subgroups[subgroup.index()]
            .stable_num
            .fetch_max(version.int(), Ordering::AcqRel);
    }

    pub fn set_persisted(
        &self,
        subgroup: SubgroupId,
        version: Version,
        signature: Option<SignatureBytes>,
    ) {
        let columns = &self.local_row().subgroups[subgroup.index()];
        if let Some(signature) = signature {
            *columns.signature.lock().unwrap() = Some((version, signature));
        }
        columns.persisted_num.fetch_max(version.int(), Ordering::AcqRel);
    }

    pub fn set_verified_num(&self, subgroup: SubgroupId, version: Version) {
        self.local_row().subgroups[subgroup.index()]
            .verified_num
            .fetch_max(version.int(), Ordering::AcqRel);
    }

    pub fn set_suspected(&self, rank: usize) {
        self.local_row().suspicion[rank].store(true, Ordering::Release);
    }

    pub fn set_wedged(&self) {
        self.local_row().wedged.store(true, Ordering::Release);
    }

    pub fn append_change(&self, change: MembershipChange) -> u64 {
        let index = self.local_row().changes.lock().unwrap().append(change);
        self.local_row().num_changes.fetch_max(index + 1, Ordering::AcqRel);
        index
    }

    /// Echo the leader's proposals into the local row: adopt any changes beyond our own count.
    pub fn adopt_changes(&self, leader_rank: usize) {
        if leader_rank == self.my_rank {
            return;
        }
        let (base, tail) = {
            let leader_changes = self.rows[leader_rank].changes.lock().unwrap();
            leader_changes.tail(self.local_row().changes.lock().unwrap().len())
        };
        let mut local_changes = self.local_row().changes.lock().unwrap();
        // A ring that starts empty (a joiner's) may pick up the leader's history mid-stream.
        local_changes.fold_from(base, &tail);
        let len = local_changes.len();
        drop(local_changes);
        self.local_row().num_changes.fetch_max(len, Ordering::AcqRel);
    }

    pub fn set_num_committed(&self, value: u64) {
        self.local_row().num_committed.fetch_max(value, Ordering::AcqRel);
    }

    pub fn set_num_installed(&self, value: u64) {
        self.local_row().num_installed.fetch_max(value, Ordering::AcqRel);
    }

    pub fn publish_ragged_trim(&self, trim: RaggedTrim) {
        *self.local_row().ragged_trim.lock().unwrap() = Some(trim);
    }

    /* ↓↓↓ Delta construction and folding ↓↓↓ */

    /// Snapshot the selected columns of the local row for shipment to peers.
    pub fn delta(&self, columns: &ColumnSet) -> StatusDelta {
        let row = self.local_row();
        StatusDelta {
            view_id: self.view_id,
            heartbeat: columns.heartbeat.then(|| row.heartbeat()),
            membership: columns.membership.then(|| {
                let changes = row.changes.lock().unwrap();
                let (changes_base, changes_tail) = changes.tail(0);
                MembershipColumns {
                    num_changes: row.num_changes(),
                    num_committed: row.num_committed(),
                    num_installed: row.num_installed(),
                    wedged: row.wedged(),
                    changes_base,
                    changes_tail,
                }
            }),
            suspicion: columns.suspicion.then(|| {
                row.suspicion
                    .iter()
                    .map(|bit| bit.load(Ordering::Acquire))
                    .collect()
            }),
            ragged_trim: if columns.ragged_trim {
                row.ragged_trim()
            } else {
                None
            },
            subgroups: columns
                .subgroups
                .iter()
                .map(|(subgroup, set)| {
                    let subgroup_row = &row.subgroups[subgroup.index()];
                    (
                        *subgroup,
                        SubgroupDelta {
                            seq_num: set.seq.then(|| subgroup_row.seq_num.load(Ordering::Acquire)),
                            received_num: set.received.then(|| {
                                subgroup_row
                                    .received_num
                                    .iter()
                                    .map(|cell| cell.load(Ordering::Acquire))
                                    .collect()
                            }),
                            delivered_num: set
                                .delivered
                                .then(|| subgroup_row.delivered_num.load(Ordering::Acquire)),
                            stable_num: set
                                .stable
                                .then(|| subgroup_row.stable_num.load(Ordering::Acquire)),
                            persisted_num: set
                                .persisted
                                .then(|| subgroup_row.persisted_num.load(Ordering::Acquire)),
                            verified_num: set
                                .verified
                                .then(|| subgroup_row.verified_num.load(Ordering::Acquire)),
                            signature: if set.persisted {
                                *subgroup_row.signature.lock().unwrap()
                            } else {
                                None
                            },
                        },
                    )
                })
                .collect(),
        }
    }

    /// Fold a delta from `origin` into the local cache of its row. Counters fold with
    /// monotone-max; suspicion and wedged fold with OR; change entries append-only. Deltas from
    /// other views are dropped: every member re-pushes a full snapshot right after install.
    pub fn apply(&self, origin: NodeId, delta: &StatusDelta) {
        if delta.view_id != self.view_id {
            return;
        }
        let Some(rank) = self.members.iter().position(|member| *member == origin) else {
            return;
        };
        let row = &self.rows[rank];

        if let Some(heartbeat) = delta.heartbeat {
            row.heartbeat.fetch_max(heartbeat, Ordering::AcqRel);
        }
        if let Some(membership) = &delta.membership {
            row.num_changes.fetch_max(membership.num_changes, Ordering::AcqRel);
            row.num_committed.fetch_max(membership.num_committed, Ordering::AcqRel);
            row.num_installed.fetch_max(membership.num_installed, Ordering::AcqRel);
            if membership.wedged {
                row.wedged.store(true, Ordering::Release);
            }
            row.changes
                .lock()
                .unwrap()
                .fold(membership.changes_base, &membership.changes_tail);
        }
        if let Some(suspicion) = &delta.suspicion {
            for (bit, suspected) in row.suspicion.iter().zip(suspicion.iter()) {
                if *suspected {
                    bit.store(true, Ordering::Release);
                }
            }
        }
        if let Some(trim) = &delta.ragged_trim {
            let mut slot = row.ragged_trim.lock().unwrap();
            if slot.as_ref().map(|t| t.view_id < trim.view_id).unwrap_or(true) {
                *slot = Some(trim.clone());
            }
        }
        for (subgroup, subgroup_delta) in &delta.subgroups {
            let Some(subgroup_row) = row.subgroups.get(subgroup.index()) else {
                continue;
            };
            if let Some(seq_num) = subgroup_delta.seq_num {
                subgroup_row.seq_num.fetch_max(seq_num, Ordering::AcqRel);
            }
            if let Some(received_num) = &subgroup_delta.received_num {
                for (cell, value) in subgroup_row.received_num.iter().zip(received_num.iter()) {
                    cell.fetch_max(*value, Ordering::AcqRel);
                }
            }
            if let Some(delivered_num) = subgroup_delta.delivered_num {
                subgroup_row.delivered_num.fetch_max(delivered_num, Ordering::AcqRel);
            }
            if let Some(stable_num) = subgroup_delta.stable_num {
                subgroup_row.stable_num.fetch_max(stable_num, Ordering::AcqRel);
            }
            if let Some((version, signature)) = subgroup_delta.signature {
                let mut slot = subgroup_row.signature.lock().unwrap();
                if slot.map(|(held, _)| held < version).unwrap_or(true) {
                    *slot = Some((version, signature));
                    let mut inbox = subgroup_row.sig_inbox.lock().unwrap();
                    if inbox.len() == SIG_INBOX_CAPACITY {
                        inbox.pop_front();
                    }
                    inbox.push_back((version, signature));
                }
            }
            if let Some(persisted_num) = subgroup_delta.persisted_num {
                subgroup_row.persisted_num.fetch_max(persisted_num, Ordering::AcqRel);
            }
            if let Some(verified_num) = subgroup_delta.verified_num {
                subgroup_row.verified_num.fetch_max(verified_num, Ordering::AcqRel);
            }
        }
    }

    /* ↓↓↓ Predicates ↓↓↓ */

    /// Lowest delivered version across `rows` for `subgroup`: the stable watermark.
    pub fn min_delivered(&self, subgroup: SubgroupId, rows: &[usize]) -> Version {
        rows.iter()
            .map(|rank| self.rows[*rank].delivered_num(subgroup))
            .min()
            .unwrap_or(Version::NONE)
    }

    /// Lowest persisted version across `rows` for `subgroup`: the global durability watermark.
    pub fn min_persisted(&self, subgroup: SubgroupId, rows: &[usize]) -> Version {
        rows.iter()
            .map(|rank| self.rows[*rank].persisted_num(subgroup))
            .min()
            .unwrap_or(Version::NONE)
    }

    /// Lowest contiguously received message id from `sender_rank` across `rows`: the sender's
    /// entry in the ragged edge.
    pub fn min_received(
        &self,
        subgroup: SubgroupId,
        sender_rank: usize,
        rows: &[usize],
    ) -> MessageId {
        rows.iter()
            .map(|rank| self.rows[*rank].received_num(subgroup, sender_rank))
            .min()
            .unwrap_or(MessageId::NONE)
    }

    /// Effective suspicion set: rank r is suspected if any non-suspected row suspects it.
    /// Computed as a fixpoint starting from the local row's own column.
    pub fn effective_suspicion(&self) -> Vec<bool> {
        let n = self.rows.len();
        let mut suspected: Vec<bool> = (0..n).map(|rank| self.local_row().suspects(rank)).collect();
        loop {
            let mut changed = false;
            for observer in 0..n {
                if suspected[observer] {
                    continue;
                }
                for target in 0..n {
                    if !suspected[target] && self.rows[observer].suspects(target) {
                        suspected[target] = true;
                        changed = true;
                    }
                }
            }
            if !changed {
                return suspected;
            }
        }
    }
}
