/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-view totally ordered reliable multicast within one subgroup shard.
//!
//! ## Delivery order
//!
//! Let S₀ … S₍k₋₁₎ be the shard members in view order. The *round-robin schedule* delivers, in
//! round r and position i, the message with id r from sender Sᵢ. Delivery is strictly in
//! schedule order: a slot is delivered only when its bytes are parked locally and every earlier
//! slot has been delivered. A sender with nothing to contribute to a round the schedule is
//! blocked on publishes a *null token* for its slot; nulls advance the schedule but carry no
//! data and receive no version. This yields one global order without any per-message
//! coordination.
//!
//! ## Stability
//!
//! Delivering a message advances the local row's `delivered_num` column to the message's
//! version. The *stable* watermark is the minimum of `delivered_num` across the shard's rows;
//! a delivered message whose version is at or below the watermark has been delivered by every
//! shard member, is totally ordered for good, and is handed to the dispatcher.
//!
//! ## Failure
//!
//! When any shard member becomes suspected, the group wedges: sends are rejected and the
//! delivery edge freezes. Undelivered parked messages stay in their slots until the view
//! manager's ragged trim decides, identically at every survivor, which of them are delivered in
//! the dying view and which are discarded.

use std::{
    collections::BTreeMap,
    sync::{
        mpsc::{Receiver, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use crate::dispatcher::Dispatcher;
use crate::messages::{MulticastPayload, PayloadKind};
use crate::status_table::{ColumnSet, StatusTable};
use crate::transport::{PushDest, SenderHandle, StatusPusher, Transport};
use crate::types::{
    basic::{Hlc, MessageId, NodeId, PayloadSize, SubgroupId, Version, ViewId, WindowSize},
    view::ShardView,
};
use crate::view_manager::{ActiveGroups, SharedCurrentView};

/// Why a send was not accepted.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The sender's window is full: `window_size` messages are outstanding and the slowest
    /// shard member has not caught up. Retry after the stable watermark advances.
    Backpressure,
    /// The group is wedged for a view change. Re-issue in the next view.
    ViewChanged,
    /// The layout could not provision this subgroup in the current view.
    SubgroupInactive,
    /// This replica is not a member of the subgroup's shard.
    NotAShardMember,
    /// The payload exceeds the configured maximum.
    PayloadTooLarge { size: usize, max: usize },
}

/// A message that has reached stability: delivered by every shard member, totally ordered, and
/// carrying its assigned version.
pub struct StableMessage {
    pub subgroup_id: SubgroupId,
    pub sender: NodeId,
    pub msg_id: MessageId,
    pub version: Version,
    pub hlc: Hlc,
    pub kind: PayloadKind,
    pub body: Vec<u8>,
}

struct ParkedMessage {
    null: bool,
    kind: PayloadKind,
    hlc: Hlc,
    body: Vec<u8>,
}

/// A message delivered locally in schedule order, awaiting shard-wide stability.
struct DeliveredMessage {
    sender: NodeId,
    msg_id: MessageId,
    version: Version,
    hlc: Hlc,
    kind: PayloadKind,
    body: Vec<u8>,
}

/// One subgroup shard's multicast state for one view.
pub(crate) struct MulticastGroup {
    subgroup_id: SubgroupId,
    view_id: ViewId,
    shard: ShardView,
    /// This replica's position in the shard's delivery order.
    my_shard_rank: usize,
    /// View ranks of the shard members, indexed by shard rank, for status-table row access.
    member_view_ranks: Vec<usize>,
    window: WindowSize,
    max_payload: PayloadSize,
    active: bool,
    wedged: bool,
    /// Parked inbound messages per shard rank, keyed by message id.
    slots: Vec<BTreeMap<i32, ParkedMessage>>,
    /// The delivery edge: next round and position of the schedule to deliver.
    next_round: i32,
    next_position: usize,
    /// Count of non-null messages delivered this view; the low bits of the next version.
    next_version_index: u64,
    /// Delivered locally, not yet stable shard-wide.
    awaiting_stability: Vec<DeliveredMessage>,
}

impl MulticastGroup {
    /// Build the group for one view. Returns `None` when `local_id` is not in the shard: only
    /// shard members run multicast state.
    pub(crate) fn new(
        view_id: ViewId,
        shard: ShardView,
        local_id: NodeId,
        member_view_ranks: Vec<usize>,
        window: WindowSize,
        max_payload: PayloadSize,
        active: bool,
    ) -> Option<MulticastGroup> {
        let my_shard_rank = shard.rank_of(local_id)?;
        let num_members = shard.members.len();
        Some(MulticastGroup {
            subgroup_id: shard.subgroup_id,
            view_id,
            shard,
            my_shard_rank,
            member_view_ranks,
            window,
            max_payload,
            active,
            wedged: false,
            slots: (0..num_members).map(|_| BTreeMap::new()).collect(),
            next_round: 0,
            next_position: 0,
            next_version_index: 0,
            awaiting_stability: Vec::new(),
        })
    }

    pub(crate) fn subgroup_id(&self) -> SubgroupId {
        self.subgroup_id
    }

    pub(crate) fn view_id(&self) -> ViewId {
        self.view_id
    }

    pub(crate) fn shard(&self) -> &ShardView {
        &self.shard
    }

    pub(crate) fn member_view_ranks(&self) -> &[usize] {
        &self.member_view_ranks
    }

    pub(crate) fn is_wedged(&self) -> bool {
        self.wedged
    }

    /// Stop accepting sends and freeze the delivery edge, in preparation for a view change.
    pub(crate) fn wedge(&mut self) {
        self.wedged = true;
    }

    /// Accept a send of exactly `size` bytes, exposing the buffer to `fill` before publishing.
    /// On success the message is parked locally (the sender is also a receiver of its own
    /// message) and the payload to publish to shard peers is returned; the caller ships it and
    /// pushes the multicast columns.
    pub(crate) fn send(
        &mut self,
        table: &StatusTable,
        hlc: Hlc,
        kind: PayloadKind,
        size: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<MulticastPayload, SendError> {
        if !self.active {
            return Err(SendError::SubgroupInactive);
        }
        if self.wedged {
            return Err(SendError::ViewChanged);
        }
        if size > self.max_payload.int() as usize {
            return Err(SendError::PayloadTooLarge {
                size,
                max: self.max_payload.int() as usize,
            });
        }

        let my_seq = table.local_row().seq_num(self.subgroup_id);
        let slowest = table.min_received(self.subgroup_id, self.my_shard_rank, &self.member_view_ranks);
        let outstanding = (my_seq.int() - slowest.int()) as u32;
        if outstanding >= self.window.int() {
            return Err(SendError::Backpressure);
        }

        let mut body = vec![0u8; size];
        fill(&mut body);

        let msg_id = my_seq.next();
        table.set_seq_num(self.subgroup_id, msg_id);

        let payload = MulticastPayload {
            view_id: self.view_id,
            subgroup_id: self.subgroup_id,
            msg_id,
            null: false,
            kind,
            hlc,
            body,
        };
        self.park(table, self.shard.members[self.my_shard_rank], payload.clone());
        Ok(payload)
    }

    /// Park an inbound payload in its sender's receive slot and advance the contiguous
    /// received-message counter.
    pub(crate) fn park(&mut self, table: &StatusTable, sender: NodeId, payload: MulticastPayload) {
        if payload.view_id != self.view_id {
            return;
        }
        let Some(sender_rank) = self.shard.rank_of(sender) else {
            return;
        };
        self.slots[sender_rank].insert(
            payload.msg_id.int(),
            ParkedMessage {
                null: payload.null,
                kind: payload.kind,
                hlc: payload.hlc,
                body: payload.body,
            },
        );

        let mut received = table.local_row().received_num(self.subgroup_id, sender_rank);
        while self.slots[sender_rank].contains_key(&received.next().int()) {
            received = received.next();
        }
        table.set_received_num(self.subgroup_id, sender_rank, received);
    }

    /// Advance the delivery edge as far as parked messages allow. When the edge is blocked on
    /// this replica's own slot and later traffic is waiting behind it, a null token for the
    /// blocked round is produced; the caller publishes it to shard peers. Returns
    /// `(made_progress, null_to_publish)`.
    pub(crate) fn deliver_pass(
        &mut self,
        table: &StatusTable,
    ) -> (bool, Option<MulticastPayload>) {
        if self.wedged {
            return (false, None);
        }

        let mut progressed = false;
        loop {
            let round = self.next_round;
            let position = self.next_position;

            match self.slots[position].remove(&round) {
                Some(parked) => {
                    if !parked.null {
                        let version = Version::new(self.view_id, self.next_version_index);
                        self.next_version_index += 1;
                        table.set_delivered_num(self.subgroup_id, version);
                        self.awaiting_stability.push(DeliveredMessage {
                            sender: self.shard.members[position],
                            msg_id: MessageId::new(round),
                            version,
                            hlc: parked.hlc,
                            kind: parked.kind,
                            body: parked.body,
                        });
                    }
                    self.advance_edge();
                    progressed = true;
                }
                None => {
                    // Blocked. If the hole is our own slot and traffic is waiting behind it,
                    // fill it with a null token; otherwise wait for the missing bytes.
                    if position == self.my_shard_rank && self.traffic_beyond_edge() {
                        let msg_id = MessageId::new(round);
                        table.set_seq_num(self.subgroup_id, msg_id);
                        let null = MulticastPayload {
                            view_id: self.view_id,
                            subgroup_id: self.subgroup_id,
                            msg_id,
                            null: true,
                            kind: PayloadKind::Raw,
                            hlc: Hlc::default(),
                            body: Vec::new(),
                        };
                        // Parking it lets the very next iteration consume the slot.
                        self.park(table, self.shard.members[position], null.clone());
                        return (true, Some(null));
                    }
                    return (progressed, None);
                }
            }
        }
    }

    fn advance_edge(&mut self) {
        self.next_position += 1;
        if self.next_position == self.shard.members.len() {
            self.next_position = 0;
            self.next_round += 1;
        }
    }

    /// Whether any parked message sits at or beyond the current edge, i.e., the schedule would
    /// advance if the edge's hole were filled.
    fn traffic_beyond_edge(&self) -> bool {
        self.slots.iter().enumerate().any(|(rank, slot)| {
            rank != self.my_shard_rank
                && slot.keys().any(|msg_id| *msg_id >= self.next_round)
        }) || table_ahead(&self.slots[self.my_shard_rank], self.next_round)
    }

    /// Hand over every delivered message whose version the whole shard has now delivered.
    /// Advances the local stable column to the new watermark.
    pub(crate) fn collect_stable(&mut self, table: &StatusTable) -> Vec<StableMessage> {
        let watermark = table.min_delivered(self.subgroup_id, &self.member_view_ranks);
        if watermark.is_none() {
            return Vec::new();
        }
        table.set_stable_num(self.subgroup_id, watermark);

        let mut stable = Vec::new();
        let mut remaining = Vec::with_capacity(self.awaiting_stability.len());
        for delivered in self.awaiting_stability.drain(..) {
            if delivered.version <= watermark {
                stable.push(StableMessage {
                    subgroup_id: self.subgroup_id,
                    sender: delivered.sender,
                    msg_id: delivered.msg_id,
                    version: delivered.version,
                    hlc: delivered.hlc,
                    kind: delivered.kind,
                    body: delivered.body,
                });
            } else {
                remaining.push(delivered);
            }
        }
        self.awaiting_stability = remaining;
        stable
    }

    /// The highest message id this replica holds contiguously from each shard member: its
    /// contribution to the ragged edge the view-change leader aggregates.
    pub(crate) fn ragged_edge(&self, table: &StatusTable) -> Vec<MessageId> {
        (0..self.shard.members.len())
            .map(|rank| table.local_row().received_num(self.subgroup_id, rank))
            .collect()
    }

    /// Close out the view by the leader's ragged trim: deliver, in schedule order, exactly the
    /// messages with `msg_id ≤ trims[sender]`, treating everything else as a skipped slot, and
    /// discard the rest. Every survivor applies the same vector and therefore delivers the same
    /// set in the same order. The returned messages are final deliveries of this view: stable by
    /// construction, versioned in delivery order.
    /// The rollback point: versions at or above this index were assigned optimistically at
    /// local delivery but never reached stability, so [`finish_view`](Self::finish_view) may
    /// reassign them.
    pub(crate) fn unstable_version_floor(&self) -> u64 {
        self.awaiting_stability
            .first()
            .map(|delivered| delivered.version.index())
            .unwrap_or(self.next_version_index)
    }

    pub(crate) fn finish_view(
        &mut self,
        table: &StatusTable,
        trims: &[MessageId],
    ) -> Vec<StableMessage> {
        self.wedged = true;

        // Versions assigned at local delivery but never collected as stable are rolled back and
        // reassigned below: a kept message can follow a discarded one in the schedule, so the
        // optimistic numbering of survivors that delivered further ahead would otherwise
        // diverge from survivors that did not. (The persistence log never contains unstable
        // versions, so the rollback is purely in-memory.)
        self.next_version_index = self.unstable_version_floor();

        // Re-judge locally delivered but unstable messages against the trim: at or below it,
        // every survivor delivers the message too; above it, some survivor never received the
        // bytes, and it is discarded.
        let mut finals: Vec<StableMessage> = Vec::new();
        for delivered in self.awaiting_stability.drain(..) {
            let sender_rank = self
                .shard
                .rank_of(delivered.sender)
                .expect("delivered messages come from shard members");
            let trim = trims.get(sender_rank).copied().unwrap_or(MessageId::NONE);
            if delivered.msg_id <= trim {
                let version = Version::new(self.view_id, self.next_version_index);
                self.next_version_index += 1;
                finals.push(StableMessage {
                    subgroup_id: self.subgroup_id,
                    sender: delivered.sender,
                    msg_id: delivered.msg_id,
                    version,
                    hlc: delivered.hlc,
                    kind: delivered.kind,
                    body: delivered.body,
                });
            }
        }

        // Then deliver, in schedule order, the parked messages the trim proves every survivor
        // holds. Slots above their sender's trim are skipped like nulls.
        let max_trim = trims.iter().map(|trim| trim.int()).max().unwrap_or(-1);
        let mut round = self.next_round;
        let mut position = self.next_position;
        while round <= max_trim {
            let trim = trims.get(position).copied().unwrap_or(MessageId::NONE);
            if round <= trim.int() {
                if let Some(parked) = self.slots[position].remove(&round) {
                    if !parked.null {
                        let version = Version::new(self.view_id, self.next_version_index);
                        self.next_version_index += 1;
                        finals.push(StableMessage {
                            subgroup_id: self.subgroup_id,
                            sender: self.shard.members[position],
                            msg_id: MessageId::new(round),
                            version,
                            hlc: parked.hlc,
                            kind: parked.kind,
                            body: parked.body,
                        });
                    }
                }
            }
            position += 1;
            if position == self.shard.members.len() {
                position = 0;
                round += 1;
            }
        }

        if let Some(last) = finals.last() {
            table.set_delivered_num(self.subgroup_id, last.version);
            table.set_stable_num(self.subgroup_id, last.version);
        }
        for slot in &mut self.slots {
            slot.clear();
        }
        finals
    }
}

/// How often the delivery loop re-pushes its multicast columns even without local progress, so
/// a peer that dropped a delta during its own install still converges.
const REFRESH_PASSES: u32 = 64;

/// Spawn the delivery-loop thread: parks inbound payloads into their groups, advances every
/// group's delivery edge, publishes null tokens, collects newly stable messages, and hands them
/// to the dispatcher.
///
/// Payloads for views this replica has not installed yet are buffered and re-examined after
/// install; payloads for superseded views are dropped (their fate was settled by ragged trim).
pub(crate) fn start_delivery_loop<T: Transport>(
    transport: T,
    local_id: NodeId,
    current: SharedCurrentView,
    groups: Arc<Mutex<ActiveGroups>>,
    dispatcher: Arc<Mutex<Dispatcher<T>>>,
    payload_receiver: Receiver<(NodeId, MulticastPayload)>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("delivery".to_string())
        .spawn(move || {
            let mut sender = SenderHandle::new(transport.clone());
            let mut pusher = StatusPusher::new(transport, current.clone(), local_id);
            let mut future_payloads: Vec<(NodeId, MulticastPayload)> = Vec::new();
            let mut passes_since_refresh: u32 = 0;

            loop {
                match shutdown_signal.try_recv() {
                    Ok(()) => return,
                    Err(TryRecvError::Empty) => (),
                    Err(TryRecvError::Disconnected) => {
                        panic!("delivery thread disconnected from main thread")
                    }
                }

                let (view, table) = {
                    let current = current.read().unwrap();
                    (current.view.clone(), current.table.clone())
                };

                // Revisit payloads that were ahead of us, then drain the inbound channel.
                let mut to_park: Vec<(NodeId, MulticastPayload)> = Vec::new();
                future_payloads.retain(|(origin, payload)| {
                    if payload.view_id == view.view_id {
                        to_park.push((*origin, payload.clone()));
                        false
                    } else {
                        payload.view_id > view.view_id
                    }
                });
                loop {
                    match payload_receiver.try_recv() {
                        Ok((origin, payload)) => {
                            if payload.view_id == view.view_id {
                                to_park.push((origin, payload));
                            } else if payload.view_id > view.view_id {
                                future_payloads.push((origin, payload));
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return,
                    }
                }

                let mut stable_batch: Vec<StableMessage> = Vec::new();
                let mut nulls: Vec<(MulticastPayload, Vec<NodeId>)> = Vec::new();
                let mut touched: Vec<SubgroupId> = Vec::new();
                {
                    let mut groups = groups.lock().unwrap();
                    for (origin, payload) in to_park {
                        let subgroup_id = payload.subgroup_id;
                        if let Some(group) = groups.groups.get_mut(&subgroup_id) {
                            group.park(&table, origin, payload);
                            if !touched.contains(&subgroup_id) {
                                touched.push(subgroup_id);
                            }
                        }
                    }

                    for group in groups.groups.values_mut() {
                        let mut progressed_any = false;
                        loop {
                            let (progressed, null) = group.deliver_pass(&table);
                            if let Some(null) = null {
                                let peers: Vec<NodeId> = group
                                    .shard()
                                    .members
                                    .iter()
                                    .copied()
                                    .filter(|member| *member != local_id)
                                    .collect();
                                nulls.push((null, peers));
                            }
                            if !progressed {
                                break;
                            }
                            progressed_any = true;
                        }
                        let stable = group.collect_stable(&table);
                        if progressed_any || !stable.is_empty() {
                            let subgroup_id = group.subgroup_id();
                            if !touched.contains(&subgroup_id) {
                                touched.push(subgroup_id);
                            }
                        }
                        stable_batch.extend(stable);
                    }

                }

                passes_since_refresh += 1;
                let refresh = passes_since_refresh >= REFRESH_PASSES;
                if refresh {
                    passes_since_refresh = 0;
                }

                for (null, peers) in nulls {
                    sender.send_to(&peers, null);
                }
                if refresh {
                    // A full-row refresh: peers that dropped a delta while installing (or that
                    // joined after our columns last changed) converge from this.
                    pusher.push(
                        &ColumnSet::all(view.subgroups.iter().map(|info| info.subgroup_id)),
                        PushDest::AllPeers,
                    );
                } else {
                    for subgroup_id in touched {
                        pusher.push(
                            &ColumnSet::multicast(subgroup_id),
                            PushDest::ShardPeers(subgroup_id),
                        );
                    }
                }
                if !stable_batch.is_empty() {
                    let mut dispatcher = dispatcher.lock().unwrap();
                    for stable in stable_batch {
                        dispatcher.on_stable(stable);
                    }
                } else {
                    thread::yield_now();
                }
            }
        })
        .expect("the delivery thread can be spawned")
}

fn table_ahead(own_slot: &BTreeMap<i32, ParkedMessage>, round: i32) -> bool {
    own_slot.keys().any(|msg_id| *msg_id > round)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_table::StatusTable;
    use crate::types::{
        basic::ShardId,
        basic::SubgroupTypeId,
        view::{SubgroupInfo, View},
    };

    const SUBGROUP: SubgroupId = SubgroupId::new(0);

    fn shard(members: &[u64]) -> ShardView {
        ShardView {
            subgroup_id: SUBGROUP,
            shard_id: ShardId::new(0),
            members: members.iter().map(|id| NodeId::new(*id)).collect(),
        }
    }

    fn view(members: &[u64]) -> View {
        View {
            view_id: ViewId::new(1),
            members: members.iter().map(|id| NodeId::new(*id)).collect(),
            suspected_at_install: vec![false; members.len()],
            subgroups: vec![SubgroupInfo {
                subgroup_id: SUBGROUP,
                type_id: SubgroupTypeId::new(0),
                subgroup_index: 0,
                shards: vec![shard(members)],
                active: true,
            }],
            prior_view_id: None,
        }
    }

    fn group(members: &[u64], local: u64, table_for: &View) -> (MulticastGroup, StatusTable) {
        let table = StatusTable::new(table_for, NodeId::new(local), 8);
        let group = MulticastGroup::new(
            ViewId::new(1),
            shard(members),
            NodeId::new(local),
            (0..members.len()).collect(),
            WindowSize::new(4),
            PayloadSize::new(64),
            true,
        )
        .unwrap();
        (group, table)
    }

    fn payload(msg_id: i32, body: &[u8]) -> MulticastPayload {
        MulticastPayload {
            view_id: ViewId::new(1),
            subgroup_id: SUBGROUP,
            msg_id: MessageId::new(msg_id),
            null: false,
            kind: PayloadKind::Raw,
            hlc: Hlc::default(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn delivery_follows_the_round_robin_schedule() {
        let view = view(&[10, 20, 30]);
        let (mut group, table) = group(&[10, 20, 30], 10, &view);

        // Receive round 0 from everyone, out of arrival order.
        group.park(&table, NodeId::new(30), payload(0, b"from 30"));
        group.park(&table, NodeId::new(20), payload(0, b"from 20"));
        group
            .send(&table, Hlc::default(), PayloadKind::Raw, 7, |buf| {
                buf.copy_from_slice(b"from 10")
            })
            .unwrap();

        let (progressed, null) = group.deliver_pass(&table);
        assert!(progressed);
        assert!(null.is_none());

        // All three rows must deliver before anything is stable; simulate the peers' columns.
        let delivered = table.local_row().delivered_num(SUBGROUP);
        assert_eq!(delivered, Version::new(ViewId::new(1), 2));

        let stable = group.collect_stable(&table);
        assert!(stable.is_empty());

        for peer_rank in [1usize, 2] {
            let peer_table = StatusTable::new(&view, view.members[peer_rank], 8);
            peer_table.set_delivered_num(SUBGROUP, delivered);
            table.apply(
                view.members[peer_rank],
                &peer_table.delta(&crate::status_table::ColumnSet::multicast(SUBGROUP)),
            );
        }

        let stable = group.collect_stable(&table);
        let senders: Vec<NodeId> = stable.iter().map(|msg| msg.sender).collect();
        assert_eq!(senders, vec![NodeId::new(10), NodeId::new(20), NodeId::new(30)]);
        let versions: Vec<u64> = stable.iter().map(|msg| msg.version.index()).collect();
        assert_eq!(versions, vec![0, 1, 2]);
    }

    #[test]
    fn blocked_own_slot_emits_a_null_token() {
        let view = view(&[10, 20]);
        let (mut group, table) = group(&[10, 20], 10, &view);

        // Sender 20 has published round 0 but we have nothing to say.
        group.park(&table, NodeId::new(20), payload(0, b"data"));

        let (progressed, null) = group.deliver_pass(&table);
        assert!(progressed);
        let null = null.expect("our own slot blocks the schedule");
        assert!(null.null);
        assert_eq!(null.msg_id, MessageId::new(0));

        // The null fills our slot; the next pass delivers 20's message.
        let (progressed, _) = group.deliver_pass(&table);
        assert!(progressed);
        assert_eq!(
            table.local_row().delivered_num(SUBGROUP),
            Version::new(ViewId::new(1), 0)
        );
        // Nulls occupy schedule slots but never receive versions.
        assert_eq!(table.local_row().seq_num(SUBGROUP), MessageId::new(0));
    }

    #[test]
    fn idle_groups_emit_no_nulls() {
        let view = view(&[10, 20]);
        let (mut group, table) = group(&[10, 20], 10, &view);
        let (progressed, null) = group.deliver_pass(&table);
        assert!(!progressed);
        assert!(null.is_none());
    }

    #[test]
    fn window_exhaustion_is_backpressure() {
        let view = view(&[10, 20]);
        let (mut group, table) = group(&[10, 20], 10, &view);

        for _ in 0..4 {
            group
                .send(&table, Hlc::default(), PayloadKind::Raw, 1, |buf| buf[0] = 1)
                .unwrap();
        }
        // Four outstanding relative to the slowest receiver (rank 1, which has nothing).
        assert_eq!(
            group.send(&table, Hlc::default(), PayloadKind::Raw, 1, |buf| buf[0] = 1),
            Err(SendError::Backpressure)
        );
    }

    #[test]
    fn wedged_groups_reject_sends() {
        let view = view(&[10, 20]);
        let (mut group, table) = group(&[10, 20], 10, &view);
        group.wedge();
        assert_eq!(
            group.send(&table, Hlc::default(), PayloadKind::Raw, 1, |buf| buf[0] = 1),
            Err(SendError::ViewChanged)
        );
    }

    #[test]
    fn ragged_trim_delivers_exactly_the_agreed_prefix() {
        let view = view(&[10, 20, 30]);
        let (mut group, table) = group(&[10, 20, 30], 10, &view);

        // Sender 20 published 0..=2; we hold all three, but the trim says every survivor holds
        // only 0..=1. Senders 10 and 30 contributed nothing.
        for msg_id in 0..3 {
            group.park(&table, NodeId::new(20), payload(msg_id, b"m"));
        }
        group.wedge();

        let finals = group.finish_view(
            &table,
            &[MessageId::NONE, MessageId::new(1), MessageId::NONE],
        );
        let ids: Vec<i32> = finals.iter().map(|msg| msg.msg_id.int()).collect();
        assert_eq!(ids, vec![0, 1]);
        assert!(finals.iter().all(|msg| msg.sender == NodeId::new(20)));
        let versions: Vec<u64> = finals.iter().map(|msg| msg.version.index()).collect();
        assert_eq!(versions, vec![0, 1]);
    }
}
