/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! View management: proposing, committing, and installing membership views; the ragged trim
//! that aligns delivery sets across the survivors of a dying view; and state transfer to
//! joiners.
//!
//! ## Change protocol
//!
//! Membership agreement runs entirely through the status table. The leader, the lowest-ranked
//! non-suspected member, appends [`MembershipChange`]s to the change ring in its row when a
//! node asks to join or leave, or when the failure detector convicts a member. Every
//! non-suspected member echoes the leader's ring into its own row; a change is *committed* once
//! every non-suspected row's `num_changes` covers it, and committed-but-uninstalled changes are
//! installed in one batch. Views may only commit while a majority of the current view survives:
//! a minority partition wedges and stays wedged, and its members rejoin as fresh nodes after
//! reunification.
//!
//! ## Install
//!
//! Installing a view proceeds in fixed phases, each gated by a monotone table predicate: wedge
//! everything and wait for every surviving row to wedge; the leader publishes the ragged trim;
//! every survivor applies the trim (delivering exactly the agreed prefix of the dying view);
//! the next view is constructed deterministically from the current view plus the committed
//! batch; joiners receive state transfer; and finally the view, status table, and multicast
//! groups are swapped under the write lock, with every outstanding query handle completed as
//! `ViewChanged`.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender, TryRecvError},
        Arc, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crate::dispatcher::{Dispatcher, ObjectRegistry};
use crate::events::{
    CommitChangesEvent, EndStateTransferEvent, Event, InstallViewEvent, JoinRequestEvent,
    ProposeChangeEvent, RaggedTrimEvent, StartStateTransferEvent,
};
use crate::log_store::LogStore;
use crate::messages::{StateTransferPacket, ViewMessage};
use crate::multicast::MulticastGroup;
use crate::persistence::{PersistenceHandle, WatermarkTracker};
use crate::replicated::ObjectType;
use crate::rpc::ReplyRouter;
use crate::status_table::{ColumnSet, RaggedTrim, StatusTable};
use crate::transport::{PushDest, SenderHandle, StatusPusher, Transport};
use crate::types::{
    basic::{MessageId, NodeId, PayloadSize, ShardId, SubgroupId, SubgroupTypeId, Version, ViewId, WindowSize},
    view::{LayoutFn, MembershipChange, ShardLayout, ShardView, SubgroupInfo, View},
};

/// The view that is current on this replica, paired with the status table sized for it. Swapped
/// as one under the write lock at install.
pub(crate) struct CurrentView {
    pub(crate) view: Arc<View>,
    pub(crate) table: Arc<StatusTable>,
}

pub(crate) type SharedCurrentView = Arc<RwLock<CurrentView>>;

/// The multicast groups of the current view, one per locally sharded subgroup. Rebuilt at
/// install.
pub(crate) struct ActiveGroups {
    pub(crate) groups: HashMap<SubgroupId, MulticastGroup>,
}

impl ActiveGroups {
    pub(crate) fn new() -> ActiveGroups {
        ActiveGroups {
            groups: HashMap::new(),
        }
    }
}

/// The founding view of a brand-new group: the founding members in sorted order, with the
/// layout applied to them.
pub(crate) fn founding_view(members: &[NodeId], layout: &LayoutFn) -> View {
    let mut members: Vec<NodeId> = members.to_vec();
    members.sort();
    members.dedup();
    let subgroups = assign_subgroups(None, &members, layout);
    View {
        view_id: ViewId::init(),
        suspected_at_install: vec![false; members.len()],
        members,
        subgroups,
        prior_view_id: None,
    }
}

/// The placeholder view a joining process starts with: itself alone, no subgroups. Replaced by
/// the view shipped in its state transfer.
pub(crate) fn placeholder_view(local_id: NodeId) -> View {
    View {
        view_id: ViewId::init(),
        members: vec![local_id],
        suspected_at_install: vec![false],
        subgroups: Vec::new(),
        prior_view_id: None,
    }
}

/// Construct the successor view deterministically from the current view plus one committed
/// batch of changes. Every member runs this independently and must get the same result.
pub(crate) fn build_next_view(
    prior: &View,
    batch: &[MembershipChange],
    suspicion: &[bool],
    layout: &LayoutFn,
) -> View {
    let mut members = prior.members.clone();
    for change in batch {
        match change {
            MembershipChange::Join(node) => {
                if !members.contains(node) {
                    members.push(*node);
                }
            }
            MembershipChange::Leave(node) => {
                members.retain(|member| member != node);
            }
        }
    }

    let suspected_at_install = members
        .iter()
        .map(|member| {
            prior
                .rank_of(*member)
                .map(|rank| suspicion.get(rank).copied().unwrap_or(false))
                .unwrap_or(false)
        })
        .collect();

    let subgroups = assign_subgroups(Some(prior), &members, layout);

    View {
        view_id: prior.view_id + 1,
        members,
        suspected_at_install,
        subgroups,
        prior_view_id: Some(prior.view_id),
    }
}

/// Run the layout function and assign subgroup ids: ids carry over from the prior view for
/// subgroups the layout keeps producing, and fresh ids continue after the highest ever used.
fn assign_subgroups(
    prior: Option<&View>,
    members: &[NodeId],
    layout: &LayoutFn,
) -> Vec<SubgroupInfo> {
    let assignments = layout(members);
    let mut next_id: u32 = prior
        .map(|view| {
            view.subgroups
                .iter()
                .map(|info| info.subgroup_id.int() + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);

    let mut subgroups = Vec::new();
    for (type_index, type_layout) in assignments.iter().enumerate() {
        let type_id = SubgroupTypeId::new(type_index as u32);
        for (subgroup_index, shard_layout) in type_layout.iter().enumerate() {
            let subgroup_id = prior
                .and_then(|view| view.subgroup_by_type(type_id, subgroup_index as u32))
                .map(|info| info.subgroup_id)
                .unwrap_or_else(|| {
                    let id = SubgroupId::new(next_id);
                    next_id += 1;
                    id
                });
            let (shards, active) = match shard_layout {
                ShardLayout::Active(shards) => (
                    shards
                        .iter()
                        .enumerate()
                        .map(|(shard_index, shard_members)| ShardView {
                            subgroup_id,
                            shard_id: ShardId::new(shard_index as u32),
                            members: shard_members.clone(),
                        })
                        .collect(),
                    true,
                ),
                ShardLayout::UnderProvisioned => (Vec::new(), false),
            };
            subgroups.push(SubgroupInfo {
                subgroup_id,
                type_id,
                subgroup_index: subgroup_index as u32,
                shards,
                active,
            });
        }
    }
    subgroups
}

/// The leader's trim computation: for every shard of every subgroup, the per-sender minimum of
/// what the surviving members hold contiguously.
pub(crate) fn compute_ragged_trim(view: &View, table: &StatusTable, suspicion: &[bool]) -> RaggedTrim {
    let columns_len = view
        .subgroups
        .iter()
        .map(|info| info.subgroup_id.index() + 1)
        .max()
        .unwrap_or(0);
    let mut trims = vec![Vec::new(); columns_len];

    for info in &view.subgroups {
        let mut shard_trims = Vec::with_capacity(info.shards.len());
        for shard in &info.shards {
            let survivor_ranks: Vec<usize> = shard
                .members
                .iter()
                .filter_map(|member| view.rank_of(*member))
                .filter(|rank| !suspicion.get(*rank).copied().unwrap_or(false))
                .collect();
            let trim: Vec<MessageId> = (0..shard.members.len())
                .map(|sender_rank| table.min_received(info.subgroup_id, sender_rank, &survivor_ranks))
                .collect();
            shard_trims.push(trim);
        }
        trims[info.subgroup_id.index()] = shard_trims;
    }

    RaggedTrim {
        view_id: view.view_id,
        trims,
    }
}

/// Everything the view-change driver thread works with.
pub(crate) struct ViewManagerContext<T: Transport> {
    pub(crate) local_id: NodeId,
    pub(crate) window_size: WindowSize,
    pub(crate) max_payload_size: PayloadSize,
    pub(crate) changes_ring_capacity: usize,
    pub(crate) signed_log: bool,
    pub(crate) transport: T,
    pub(crate) current: SharedCurrentView,
    pub(crate) groups: Arc<Mutex<ActiveGroups>>,
    pub(crate) registry: Arc<Mutex<ObjectRegistry>>,
    pub(crate) object_types: Arc<Vec<ObjectType>>,
    pub(crate) layout: LayoutFn,
    pub(crate) dispatcher: Arc<Mutex<Dispatcher<T>>>,
    pub(crate) persistence: PersistenceHandle,
    pub(crate) tracker: Arc<Mutex<WatermarkTracker>>,
    pub(crate) reply_router: Arc<ReplyRouter>,
    pub(crate) log_store: Arc<Mutex<Box<dyn LogStore>>>,
    pub(crate) event_publisher: Option<Sender<Event>>,
    /// Set while this process is a joiner waiting for its state transfer.
    pub(crate) awaiting_transfer: Arc<AtomicBool>,
    /// Raised when a view installs that excludes this process (graceful leave or eviction).
    pub(crate) left: Arc<AtomicBool>,
}

/// Spawn the view-change driver thread.
pub(crate) fn start_view_manager<T: Transport>(
    ctx: ViewManagerContext<T>,
    view_receiver: Receiver<(NodeId, ViewMessage)>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("view_manager".to_string())
        .spawn(move || {
            let mut driver = Driver {
                sender: SenderHandle::new(ctx.transport.clone()),
                pusher: StatusPusher::new(ctx.transport.clone(), ctx.current.clone(), ctx.local_id),
                ctx,
                pending_joiners: BTreeSet::new(),
                pending_leavers: BTreeSet::new(),
                own_chain_floor: HashMap::new(),
                reported_partition: false,
            };

            loop {
                match shutdown_signal.try_recv() {
                    Ok(()) => return,
                    Err(TryRecvError::Empty) => (),
                    Err(TryRecvError::Disconnected) => {
                        panic!("view_manager thread disconnected from main thread")
                    }
                }

                driver.drain_protocol_messages(&view_receiver);
                if !driver.ctx.awaiting_transfer.load(Ordering::Acquire)
                    && !driver.ctx.left.load(Ordering::Acquire)
                {
                    driver.step();
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
        .expect("the view_manager thread can be spawned")
}

struct Driver<T: Transport> {
    ctx: ViewManagerContext<T>,
    sender: SenderHandle<T>,
    pusher: StatusPusher<T>,
    pending_joiners: BTreeSet<NodeId>,
    pending_leavers: BTreeSet<NodeId>,
    /// Versions below this floor in the local log carry a state-transfer donor's signatures,
    /// not ours; signature catch-up only vouches for entries above it.
    own_chain_floor: HashMap<SubgroupId, Version>,
    reported_partition: bool,
}

impl<T: Transport> Driver<T> {
    fn drain_protocol_messages(&mut self, view_receiver: &Receiver<(NodeId, ViewMessage)>) {
        while let Ok((origin, message)) = view_receiver.try_recv() {
            match message {
                ViewMessage::JoinRequest { joiner } => {
                    Event::JoinRequest(JoinRequestEvent {
                        timestamp: SystemTime::now(),
                        joiner,
                    })
                    .publish(&self.ctx.event_publisher);
                    self.pending_joiners.insert(joiner);
                }
                ViewMessage::LeaveRequest { leaver } => {
                    self.pending_leavers.insert(leaver);
                }
                ViewMessage::StateTransfer(packet) => {
                    if self.ctx.awaiting_transfer.load(Ordering::Acquire) {
                        self.install_from_transfer(origin, *packet);
                    }
                }
                ViewMessage::SignatureCatchUp {
                    subgroup_id,
                    entries,
                } => {
                    let mut tracker = self.ctx.tracker.lock().unwrap();
                    for (version, signature) in entries {
                        tracker.note_signature(subgroup_id, origin, version, signature);
                    }
                }
            }
        }
    }

    /// One pass of the membership state machine over the current table.
    fn step(&mut self) {
        let (view, table) = {
            let current = self.ctx.current.read().unwrap();
            (current.view.clone(), current.table.clone())
        };
        let suspicion = table.effective_suspicion();
        let any_suspected = suspicion.iter().any(|suspected| *suspected);

        // A minority partition must not reconfigure: it wedges and waits to be rescued by a
        // rejoin through the surviving majority.
        let live: Vec<bool> = suspicion.iter().map(|suspected| !suspected).collect();
        if any_suspected && !view.has_majority(&live) {
            if !self.reported_partition {
                self.reported_partition = true;
                log::error!(
                    "view {}: a majority of members are suspected; this partition cannot \
                     reconfigure and is wedged until its members rejoin elsewhere",
                    view.view_id
                );
            }
            self.wedge_all(&table);
            return;
        }

        let Some(leader_rank) = view.leader_rank(&suspicion) else {
            return;
        };
        let my_rank = table.my_rank();
        let is_leader = leader_rank == my_rank;

        if any_suspected {
            self.wedge_all(&table);
        }

        // Leader: turn suspicions, join requests, and leave requests into proposed changes.
        if is_leader {
            let pending_batch = pending_change_nodes(&table);
            let mut proposed_any = false;

            for (rank, member) in view.members.iter().enumerate() {
                if suspicion[rank] && !pending_batch.contains(member) {
                    self.propose(&table, MembershipChange::Leave(*member));
                    proposed_any = true;
                }
            }
            let joiners: Vec<NodeId> = self.pending_joiners.iter().copied().collect();
            for joiner in joiners {
                if view.is_member(joiner) || pending_batch.contains(&joiner) {
                    self.pending_joiners.remove(&joiner);
                } else {
                    self.propose(&table, MembershipChange::Join(joiner));
                    self.pending_joiners.remove(&joiner);
                    proposed_any = true;
                }
            }
            let leavers: Vec<NodeId> = self.pending_leavers.iter().copied().collect();
            for leaver in leavers {
                if !view.is_member(leaver) || pending_batch.contains(&leaver) {
                    self.pending_leavers.remove(&leaver);
                } else {
                    self.propose(&table, MembershipChange::Leave(leaver));
                    self.pending_leavers.remove(&leaver);
                    proposed_any = true;
                }
            }
            if proposed_any {
                self.pusher.push(&ColumnSet::membership(), PushDest::AllPeers);
            }
        } else {
            // Echo the leader's proposals, and forward join requests a non-leader received.
            let before = table.local_row().num_changes();
            table.adopt_changes(leader_rank);
            if table.local_row().num_changes() > before {
                self.pusher.push(&ColumnSet::membership(), PushDest::AllPeers);
            }
            if !self.pending_joiners.is_empty() {
                let leader = view.members[leader_rank];
                for joiner in std::mem::take(&mut self.pending_joiners) {
                    self.sender.send(leader, ViewMessage::JoinRequest { joiner });
                }
            }
        }

        // Commit: a change is agreed once every non-suspected row has echoed it.
        let committed = view
            .members
            .iter()
            .enumerate()
            .filter(|(rank, _)| !suspicion[*rank])
            .map(|(rank, _)| table.row(rank).num_changes())
            .min()
            .unwrap_or(0);
        if committed > table.local_row().num_committed() {
            table.set_num_committed(committed);
            self.pusher.push(&ColumnSet::membership(), PushDest::AllPeers);
            Event::CommitChanges(CommitChangesEvent {
                timestamp: SystemTime::now(),
                num_committed: committed,
            })
            .publish(&self.ctx.event_publisher);
        }

        // Install: committed-but-uninstalled changes drive a view transition.
        let installed = table.local_row().num_installed();
        if committed > installed {
            self.try_install(&view, &table, &suspicion, leader_rank, installed, committed);
        }
    }

    fn propose(&mut self, table: &StatusTable, change: MembershipChange) {
        let index = table.append_change(change);
        log::info!("proposing membership change {change:?} at index {index}");
        Event::ProposeChange(ProposeChangeEvent {
            timestamp: SystemTime::now(),
            change,
            index,
        })
        .publish(&self.ctx.event_publisher);
    }

    fn wedge_all(&mut self, table: &StatusTable) {
        let newly_wedged = {
            let mut groups = self.ctx.groups.lock().unwrap();
            let mut newly_wedged = false;
            for group in groups.groups.values_mut() {
                if !group.is_wedged() {
                    group.wedge();
                    newly_wedged = true;
                }
            }
            newly_wedged
        };
        if !table.local_row().wedged() {
            table.set_wedged();
            self.pusher.push(&ColumnSet::membership(), PushDest::AllPeers);
        } else if newly_wedged {
            self.pusher.push(&ColumnSet::membership(), PushDest::AllPeers);
        }
    }

    /// Drive the install phases as far as the table's predicates allow. Each call makes
    /// progress or returns to let the next pass retry.
    fn try_install(
        &mut self,
        view: &Arc<View>,
        table: &Arc<StatusTable>,
        suspicion: &[bool],
        leader_rank: usize,
        installed: u64,
        committed: u64,
    ) {
        // Phase 1: everyone wedges.
        self.wedge_all(table);
        let all_wedged = view
            .members
            .iter()
            .enumerate()
            .filter(|(rank, _)| !suspicion[*rank])
            .all(|(rank, _)| table.row(rank).wedged());
        if !all_wedged {
            return;
        }

        // Phase 2: the leader publishes the ragged trim for this view.
        let is_leader = leader_rank == table.my_rank();
        if is_leader {
            let already_published = table
                .local_row()
                .ragged_trim()
                .map(|trim| trim.view_id == view.view_id)
                .unwrap_or(false);
            if !already_published {
                // Messages in flight from surviving senders still arrive after the wedge (the
                // transport is reliable); trimming before they land would discard accepted
                // messages of live members. Only dead senders may leave a ragged tail.
                if !live_messages_all_received(view, table, suspicion) {
                    return;
                }
                let trim = compute_ragged_trim(view, table, suspicion);
                table.publish_ragged_trim(trim);
                self.pusher.push(&ColumnSet::ragged_trim(), PushDest::AllPeers);
                Event::RaggedTrim(RaggedTrimEvent {
                    timestamp: SystemTime::now(),
                    view_id: view.view_id,
                })
                .publish(&self.ctx.event_publisher);
            }
        }

        // Phase 3: every survivor applies the leader's trim, closing out delivery in this view.
        let Some(trim) = table.row(leader_rank).ragged_trim() else {
            return;
        };
        if trim.view_id != view.view_id {
            return;
        }
        {
            let mut groups = self.ctx.groups.lock().unwrap();
            let mut dispatcher = self.ctx.dispatcher.lock().unwrap();
            for group in groups.groups.values_mut() {
                let subgroup_trims = trim
                    .trims
                    .get(group.subgroup_id().index())
                    .cloned()
                    .unwrap_or_default();
                let shard_index = group.shard().shard_id.int() as usize;
                let Some(sender_trims) = subgroup_trims.get(shard_index) else {
                    continue;
                };
                for stable in group.finish_view(table, sender_trims) {
                    dispatcher.on_stable(stable);
                }
            }
        }

        // Phase 4: construct the successor and hand state to joiners before switching over.
        let batch = match read_batch(table, installed, committed) {
            Ok(batch) => batch,
            Err(err) => {
                log::error!(
                    "committed change batch is unreadable ({err}); the change ring capacity is \
                     too small for this install"
                );
                return;
            }
        };
        let next_view = build_next_view(view, &batch, suspicion, &self.ctx.layout);

        if !next_view.is_member(self.ctx.local_id) {
            log::info!(
                "view {} excludes this process; leaving the group",
                next_view.view_id
            );
            self.ctx.left.store(true, Ordering::Release);
            return;
        }

        let joiners: Vec<NodeId> = next_view
            .members
            .iter()
            .copied()
            .filter(|member| !view.is_member(*member))
            .collect();
        if is_leader {
            self.wait_for_local_persistence(table, view);
            for joiner in &joiners {
                self.ship_state(*joiner, &next_view, committed);
            }
        }

        // Phase 5: swap the view, table, groups, and registry under the write lock.
        self.install(view, table, &next_view, committed, &joiners);
    }

    /// Give the persistence worker a moment to drain the final deliveries of the dying view, so
    /// the log tails shipped to joiners are complete. Bounded: persistence failures must not
    /// stall the view change forever.
    fn wait_for_local_persistence(&self, table: &StatusTable, view: &View) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let drained = view.subgroups.iter().all(|info| {
                info.shard_of(self.ctx.local_id).is_none() || {
                    let stable = table.local_row().stable_num(info.subgroup_id);
                    stable.is_none() || table.local_row().persisted_num(info.subgroup_id) >= stable
                }
            });
            if drained {
                return;
            }
            thread::yield_now();
        }
        log::warn!("persistence did not drain before state transfer; shipping what is on disk");
    }

    fn ship_state(&mut self, joiner: NodeId, next_view: &View, changes_installed: u64) {
        Event::StartStateTransfer(StartStateTransferEvent {
            timestamp: SystemTime::now(),
            joiner,
        })
        .publish(&self.ctx.event_publisher);

        let objects: Vec<(SubgroupId, Vec<u8>)> = {
            let registry = self.ctx.registry.lock().unwrap();
            registry
                .objects
                .iter()
                .map(|(subgroup_id, entry)| (*subgroup_id, entry.state_bytes()))
                .collect()
        };
        let log_tails: Vec<(SubgroupId, _)> = {
            let mut store = self.ctx.log_store.lock().unwrap();
            objects
                .iter()
                .map(|(subgroup_id, _)| {
                    let records = store
                        .read_range(*subgroup_id, Version::NONE, Version::from_int(i64::MAX))
                        .unwrap_or_default();
                    (*subgroup_id, records)
                })
                .collect()
        };

        self.sender.send(
            joiner,
            ViewMessage::StateTransfer(Box::new(StateTransferPacket {
                view: next_view.clone(),
                objects,
                log_tails,
                changes_installed,
            })),
        );

        Event::EndStateTransfer(EndStateTransferEvent {
            timestamp: SystemTime::now(),
            joiner,
        })
        .publish(&self.ctx.event_publisher);
    }

    /// Swap in `next_view` as current: new status table (with durable columns migrated), fresh
    /// multicast groups, registry adjusted to the new shard assignment, outstanding queries
    /// completed as view-changed, unpersisted versions re-posted.
    fn install(
        &mut self,
        prior_view: &Arc<View>,
        prior_table: &Arc<StatusTable>,
        next_view: &View,
        committed: u64,
        joiners: &[NodeId],
    ) {
        // View ids advance strictly or the whole edifice of monotone predicates is void.
        if next_view.view_id <= prior_view.view_id {
            log::error!(
                "fatal: view id would not advance ({} -> {}); aborting",
                prior_view.view_id,
                next_view.view_id
            );
            std::process::abort();
        }
        let next_view = Arc::new(next_view.clone());
        let next_table = Arc::new(StatusTable::new(
            &next_view,
            self.ctx.local_id,
            self.ctx.changes_ring_capacity,
        ));
        next_table.migrate_from(prior_table);
        next_table.set_num_installed(committed);

        {
            let mut current = self.ctx.current.write().unwrap();
            current.view = next_view.clone();
            current.table = next_table.clone();
        }
        self.ctx.transport.update_members(&next_view.members);

        rebuild_groups_and_registry(
            &next_view,
            self.ctx.local_id,
            self.ctx.window_size,
            self.ctx.max_payload_size,
            &self.ctx.groups,
            &self.ctx.registry,
            &self.ctx.object_types,
        );

        self.ctx.reply_router.complete_all_view_changed();
        self.ctx.persistence.retry_failed();

        if self.ctx.signed_log {
            self.send_signature_catch_up(&next_view, joiners, prior_view);
        }

        self.pusher.push(
            &ColumnSet::all(next_view.subgroups.iter().map(|info| info.subgroup_id)),
            PushDest::AllPeers,
        );
        log::info!(
            "installed view {} with {} members",
            next_view.view_id,
            next_view.num_members()
        );
        Event::InstallView(InstallViewEvent {
            timestamp: SystemTime::now(),
            view_id: next_view.view_id,
            num_members: next_view.num_members(),
        })
        .publish(&self.ctx.event_publisher);
    }

    /// Send the signatures this process can vouch for (entries above its chain floor) to every
    /// peer that is new to it, so their sequential verification of our chain can proceed.
    fn send_signature_catch_up(&mut self, next_view: &View, joiners: &[NodeId], prior_view: &View) {
        let new_to_me: Vec<NodeId> = next_view
            .members
            .iter()
            .copied()
            .filter(|member| *member != self.ctx.local_id)
            .filter(|member| joiners.contains(member) || !prior_view.is_member(*member))
            .collect();
        if new_to_me.is_empty() {
            return;
        }
        for info in &next_view.subgroups {
            if info.shard_of(self.ctx.local_id).is_none() {
                continue;
            }
            let floor = self
                .own_chain_floor
                .get(&info.subgroup_id)
                .copied()
                .unwrap_or(Version::NONE);
            let entries: Vec<_> = {
                let mut store = self.ctx.log_store.lock().unwrap();
                store
                    .read_range(info.subgroup_id, floor, Version::from_int(i64::MAX))
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|record| {
                        let bytes: [u8; 64] = record.signature.as_slice().try_into().ok()?;
                        Some((record.version, crate::types::basic::SignatureBytes::new(bytes)))
                    })
                    .collect()
            };
            if entries.is_empty() {
                continue;
            }
            for peer in &new_to_me {
                self.sender.send(
                    *peer,
                    ViewMessage::SignatureCatchUp {
                        subgroup_id: info.subgroup_id,
                        entries: entries.clone(),
                    },
                );
            }
        }
    }

    /// A joiner's install path: write the shipped log tails, construct the shipped objects and
    /// load their state, and switch from the placeholder view to the shipped one.
    fn install_from_transfer(&mut self, donor: NodeId, packet: StateTransferPacket) {
        log::info!(
            "received state transfer from {donor} for view {}",
            packet.view.view_id
        );
        let next_view = Arc::new(packet.view);
        if !next_view.is_member(self.ctx.local_id) {
            log::error!("state transfer for a view that does not include this process; ignoring");
            return;
        }
        {
            let current = self.ctx.current.read().unwrap();
            if next_view.view_id <= current.view.view_id && current.view.num_subgroups() > 0 {
                log::error!(
                    "fatal: transferred view {} does not advance past {}; aborting",
                    next_view.view_id,
                    current.view.view_id
                );
                std::process::abort();
            }
        }

        {
            let mut store = self.ctx.log_store.lock().unwrap();
            for (subgroup_id, records) in &packet.log_tails {
                for record in records {
                    if let Err(err) = store.append(*subgroup_id, record) {
                        log::error!("cannot write transferred log for {subgroup_id}: {err:?}");
                    }
                }
                let tail = records.last().map(|record| record.version);
                if let Some(tail) = tail {
                    self.own_chain_floor.insert(*subgroup_id, tail);
                }
                self.ctx.persistence.mark_chain_reset(*subgroup_id);
            }
        }

        let next_table = Arc::new(StatusTable::new(
            &next_view,
            self.ctx.local_id,
            self.ctx.changes_ring_capacity,
        ));
        next_table.set_num_installed(packet.changes_installed);
        next_table.set_num_committed(packet.changes_installed);
        for (subgroup_id, records) in &packet.log_tails {
            if let Some(record) = records.last() {
                let signature = record
                    .signature
                    .as_slice()
                    .try_into()
                    .ok()
                    .map(crate::types::basic::SignatureBytes::new);
                next_table.set_persisted(*subgroup_id, record.version, signature);
            }
        }

        {
            let mut registry = self.ctx.registry.lock().unwrap();
            registry.objects.clear();
            for info in &next_view.subgroups {
                if info.shard_of(self.ctx.local_id).is_none() {
                    continue;
                }
                let Some(object_type) = self.ctx.object_types.get(info.type_id.int() as usize)
                else {
                    continue;
                };
                let mut entry = (object_type.make)(info.subgroup_id);
                if let Some((_, state)) = packet
                    .objects
                    .iter()
                    .find(|(subgroup_id, _)| *subgroup_id == info.subgroup_id)
                {
                    if let Err(err) = entry.load_state(state) {
                        log::error!(
                            "transferred state for {} does not load: {}",
                            info.subgroup_id,
                            err.reason
                        );
                    }
                }
                registry.objects.insert(info.subgroup_id, entry);
            }
        }

        {
            let mut current = self.ctx.current.write().unwrap();
            current.view = next_view.clone();
            current.table = next_table;
        }
        self.ctx.transport.update_members(&next_view.members);

        {
            let mut groups = self.ctx.groups.lock().unwrap();
            groups.groups.clear();
            build_groups(
                &next_view,
                self.ctx.local_id,
                self.ctx.window_size,
                self.ctx.max_payload_size,
                &mut groups,
            );
        }

        self.ctx.awaiting_transfer.store(false, Ordering::Release);
        self.pusher.push(
            &ColumnSet::all(next_view.subgroups.iter().map(|info| info.subgroup_id)),
            PushDest::AllPeers,
        );
        log::info!(
            "installed transferred view {} with {} members",
            next_view.view_id,
            next_view.num_members()
        );
        Event::InstallView(InstallViewEvent {
            timestamp: SystemTime::now(),
            view_id: next_view.view_id,
            num_members: next_view.num_members(),
        })
        .publish(&self.ctx.event_publisher);
    }
}

/// Whether every live shard member's ragged edge covers everything every live sender has
/// published (nulls included).
fn live_messages_all_received(view: &View, table: &StatusTable, suspicion: &[bool]) -> bool {
    view.subgroups.iter().all(|info| {
        info.shards.iter().all(|shard| {
            let live: Vec<(usize, usize)> = shard
                .members
                .iter()
                .enumerate()
                .filter_map(|(shard_rank, member)| {
                    view.rank_of(*member).map(|view_rank| (shard_rank, view_rank))
                })
                .filter(|(_, view_rank)| !suspicion.get(*view_rank).copied().unwrap_or(false))
                .collect();
            live.iter().all(|(sender_shard_rank, sender_view_rank)| {
                let sent = table.row(*sender_view_rank).seq_num(info.subgroup_id);
                live.iter().all(|(_, receiver_view_rank)| {
                    table
                        .row(*receiver_view_rank)
                        .received_num(info.subgroup_id, *sender_shard_rank)
                        >= sent
                })
            })
        })
    })
}

/// The nodes named by changes that are proposed but not yet installed, per the local ring.
fn pending_change_nodes(table: &StatusTable) -> BTreeSet<NodeId> {
    let row = table.local_row();
    let mut nodes = BTreeSet::new();
    for index in row.num_installed()..row.num_changes() {
        if let Ok(change) = row.change(index) {
            nodes.insert(change.node());
        }
    }
    nodes
}

/// Read the committed batch `[installed, committed)` from the local ring.
fn read_batch(
    table: &StatusTable,
    installed: u64,
    committed: u64,
) -> Result<Vec<MembershipChange>, String> {
    let row = table.local_row();
    (installed..committed)
        .map(|index| row.change(index).map_err(|err| format!("{err:?}")))
        .collect()
}

fn build_groups(
    view: &View,
    local_id: NodeId,
    window_size: WindowSize,
    max_payload_size: PayloadSize,
    groups: &mut ActiveGroups,
) {
    for info in &view.subgroups {
        let Some(shard) = info.shard_of(local_id) else {
            continue;
        };
        let member_view_ranks: Vec<usize> = shard
            .members
            .iter()
            .map(|member| view.rank_of(*member).expect("shards contain view members"))
            .collect();
        if let Some(group) = MulticastGroup::new(
            view.view_id,
            shard.clone(),
            local_id,
            member_view_ranks,
            window_size,
            max_payload_size,
            info.active,
        ) {
            groups.groups.insert(info.subgroup_id, group);
        }
    }
}

/// Rebuild multicast groups for the new view and adjust the registry: objects for subgroups no
/// longer sharded here are dropped, and subgroups newly sharded here get fresh instances from
/// their factories. (Members that were in the prior view keep their objects, whose state
/// already reflects every delivery of the prior view.)
pub(crate) fn rebuild_groups_and_registry(
    view: &View,
    local_id: NodeId,
    window_size: WindowSize,
    max_payload_size: PayloadSize,
    groups: &Arc<Mutex<ActiveGroups>>,
    registry: &Arc<Mutex<ObjectRegistry>>,
    object_types: &Arc<Vec<ObjectType>>,
) {
    {
        let mut groups = groups.lock().unwrap();
        groups.groups.clear();
        build_groups(view, local_id, window_size, max_payload_size, &mut groups);
    }

    let mut registry = registry.lock().unwrap();
    let local_subgroups: Vec<SubgroupId> = view
        .subgroups
        .iter()
        .filter(|info| info.shard_of(local_id).is_some())
        .map(|info| info.subgroup_id)
        .collect();
    registry
        .objects
        .retain(|subgroup_id, _| local_subgroups.contains(subgroup_id));
    for info in &view.subgroups {
        if info.shard_of(local_id).is_none() || registry.objects.contains_key(&info.subgroup_id) {
            continue;
        }
        if let Some(object_type) = object_types.get(info.type_id.int() as usize) {
            registry
                .objects
                .insert(info.subgroup_id, (object_type.make)(info.subgroup_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::view::one_subgroup_per_type;

    #[test]
    fn founding_views_sort_members() {
        let layout = one_subgroup_per_type(1);
        let view = founding_view(
            &[NodeId::new(30), NodeId::new(10), NodeId::new(20)],
            &layout,
        );
        assert_eq!(
            view.members,
            vec![NodeId::new(10), NodeId::new(20), NodeId::new(30)]
        );
        assert_eq!(view.view_id, ViewId::init());
        assert_eq!(view.subgroups.len(), 1);
        assert_eq!(view.subgroups[0].shards[0].members.len(), 3);
    }

    #[test]
    fn next_views_apply_batches_in_order() {
        let layout = one_subgroup_per_type(1);
        let view = founding_view(&[NodeId::new(10), NodeId::new(20), NodeId::new(30)], &layout);

        let next = build_next_view(
            &view,
            &[
                MembershipChange::Leave(NodeId::new(20)),
                MembershipChange::Join(NodeId::new(40)),
            ],
            &[false, true, false],
            &layout,
        );
        assert_eq!(next.view_id, ViewId::new(1));
        assert_eq!(
            next.members,
            vec![NodeId::new(10), NodeId::new(30), NodeId::new(40)]
        );
        assert_eq!(next.prior_view_id, Some(ViewId::init()));
        // Subgroup ids are stable across the transition.
        assert_eq!(next.subgroups[0].subgroup_id, view.subgroups[0].subgroup_id);
    }

    #[test]
    fn under_provisioned_subgroups_install_inactive() {
        let layout: LayoutFn = Arc::new(|members: &[NodeId]| {
            vec![vec![if members.len() >= 2 {
                ShardLayout::Active(vec![members.to_vec()])
            } else {
                ShardLayout::UnderProvisioned
            }]]
        });
        let view = founding_view(&[NodeId::new(10)], &layout);
        assert!(!view.subgroups[0].active);
        assert!(view.subgroups[0].shards.is_empty());

        let next = build_next_view(
            &view,
            &[MembershipChange::Join(NodeId::new(20))],
            &[false],
            &layout,
        );
        assert!(next.subgroups[0].active);
    }

    #[test]
    fn ragged_trim_takes_the_minimum_over_survivors() {
        let layout = one_subgroup_per_type(1);
        let view = founding_view(&[NodeId::new(10), NodeId::new(20), NodeId::new(30)], &layout);
        let table = StatusTable::new(&view, NodeId::new(10), 8);
        let subgroup = view.subgroups[0].subgroup_id;

        // We hold 0..=47 from sender rank 1; the (cached) row of survivor 30 shows 0..=40; the
        // failed member 20's row is ignored.
        table.set_received_num(subgroup, 1, MessageId::new(47));
        // Simulate 30's row via a delta from a second table.
        let other = StatusTable::new(&view, NodeId::new(30), 8);
        other.set_received_num(subgroup, 1, MessageId::new(40));
        table.apply(NodeId::new(30), &other.delta(&ColumnSet::multicast(subgroup)));

        let trim = compute_ragged_trim(&view, &table, &[false, true, false]);
        assert_eq!(trim.view_id, view.view_id);
        assert_eq!(trim.trims[subgroup.index()][0][1], MessageId::new(40));
        assert_eq!(trim.trims[subgroup.index()][0][0], MessageId::NONE);
    }
}
