/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`View`] type: an immutable snapshot of the group's agreed membership, together with the
//! shard-to-member assignment of every subgroup, and the membership-change and subgroup-layout
//! types that views are built from.
//!
//! Exactly one view is current at any moment on each replica. Views are installed in strictly
//! increasing order of [`ViewId`], and every view except the first records the id of the view it
//! succeeded.

use borsh::{BorshDeserialize, BorshSerialize};
use std::sync::Arc;

use crate::types::basic::{NodeId, ShardId, SubgroupId, SubgroupTypeId, ViewId};

/// A single proposed membership delta: one node joining or one node leaving the group.
///
/// Changes are appended to the proposing leader's change ring, echoed by every non-suspected
/// member, and installed in batches when committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum MembershipChange {
    Join(NodeId),
    Leave(NodeId),
}

impl MembershipChange {
    pub fn node(&self) -> NodeId {
        match self {
            MembershipChange::Join(node) => *node,
            MembershipChange::Leave(node) => *node,
        }
    }
}

/// The ordered member list of one shard of one subgroup. The order is the delivery order of the
/// round-robin schedule, so every member of a shard must agree on it; it is fixed at view
/// install.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ShardView {
    pub subgroup_id: SubgroupId,
    pub shard_id: ShardId,
    pub members: Vec<NodeId>,
}

impl ShardView {
    /// The position of `node` in this shard's delivery order, if it is a shard member.
    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|member| *member == node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.rank_of(node).is_some()
    }
}

/// Everything a view records about one subgroup: which replicated-object type it runs, its index
/// among the subgroups of that type, its shards, and whether the layout could provision it in
/// this view. Senders to an unprovisioned subgroup are rejected until a later view provisions it
/// again.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SubgroupInfo {
    pub subgroup_id: SubgroupId,
    pub type_id: SubgroupTypeId,
    pub subgroup_index: u32,
    pub shards: Vec<ShardView>,
    pub active: bool,
}

impl SubgroupInfo {
    /// The shard of this subgroup that `node` belongs to, if any. A node belongs to at most one
    /// shard of a subgroup.
    pub fn shard_of(&self, node: NodeId) -> Option<&ShardView> {
        self.shards.iter().find(|shard| shard.contains(node))
    }
}

/// An immutable snapshot of the group's agreed membership at a moment in time.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct View {
    pub view_id: ViewId,
    /// Members in view order. Ranks into the status table and the round-robin schedule follow
    /// this order.
    pub members: Vec<NodeId>,
    /// Which members were already suspected at the moment this view was installed.
    pub suspected_at_install: Vec<bool>,
    /// One entry per subgroup, indexed by `SubgroupId`.
    pub subgroups: Vec<SubgroupInfo>,
    /// The view this one succeeded. `None` only for the founding view.
    pub prior_view_id: Option<ViewId>,
}

impl View {
    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn num_subgroups(&self) -> usize {
        self.subgroups.len()
    }

    /// The position of `node` in view order, if it is a member.
    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|member| *member == node)
    }

    pub fn is_member(&self, node: NodeId) -> bool {
        self.rank_of(node).is_some()
    }

    pub fn subgroup(&self, subgroup_id: SubgroupId) -> Option<&SubgroupInfo> {
        // Ids are stable across views, so a dropped subgroup can leave a gap in the id space;
        // lookup is by id, not position.
        self.subgroups
            .iter()
            .find(|info| info.subgroup_id == subgroup_id)
    }

    /// The subgroup running the `subgroup_index`-th instance of object type `type_id`, if the
    /// layout produced one.
    pub fn subgroup_by_type(
        &self,
        type_id: SubgroupTypeId,
        subgroup_index: u32,
    ) -> Option<&SubgroupInfo> {
        self.subgroups
            .iter()
            .find(|info| info.type_id == type_id && info.subgroup_index == subgroup_index)
    }

    /// The rank of the current leader: the lowest-ranked member not suspected in `suspicion`.
    /// `suspicion` is indexed by view rank; a short slice leaves the remaining members
    /// unsuspected.
    pub fn leader_rank(&self, suspicion: &[bool]) -> Option<usize> {
        (0..self.members.len()).find(|rank| !suspicion.get(*rank).copied().unwrap_or(false))
    }

    /// Whether `live` (indexed by view rank, true = not suspected) still contains a majority of
    /// this view's members. Views may only commit while a majority of the prior view survives.
    pub fn has_majority(&self, live: &[bool]) -> bool {
        let alive = (0..self.members.len())
            .filter(|rank| live.get(*rank).copied().unwrap_or(true))
            .count();
        alive * 2 > self.members.len()
    }
}

/// Lifecycle of a member, as observed by the view manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    /// Has requested to join and is waiting for state transfer and its first installed view.
    Joining,
    /// Is a member of the current installed view.
    ActiveInView,
    /// Has announced departure; will be excluded from the next view.
    Leaving,
}

/// Lifecycle of a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewState {
    /// Constructed from committed-but-uninstalled changes; not yet agreed.
    Proposed,
    /// Agreed by every non-suspected member of the prior view.
    Committed,
    /// Current on this replica.
    Installed,
    /// Superseded by a later view.
    Retired,
}

/// The shard assignment the layout function produced for one subgroup in one view: either an
/// ordered member list per shard, or a signal that the membership cannot support the subgroup,
/// in which case the view installs with the subgroup inactive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardLayout {
    Active(Vec<Vec<NodeId>>),
    UnderProvisioned,
}

/// A user-supplied function mapping a prospective membership to the shard layout of every
/// subgroup: `result[type_id][subgroup_index]` is the layout of the `subgroup_index`-th subgroup
/// of object type `type_id`. The function must be deterministic, since every member runs it
/// independently at view install and all must agree on the result.
pub type LayoutFn = Arc<dyn Fn(&[NodeId]) -> Vec<Vec<ShardLayout>> + Send + Sync>;

/// A layout that assigns every member of the view to one shard of one subgroup per registered
/// type. The common case for small services; tests and demos use this.
pub fn one_subgroup_per_type(num_types: u32) -> LayoutFn {
    Arc::new(move |members: &[NodeId]| {
        (0..num_types)
            .map(|_| {
                vec![if members.is_empty() {
                    ShardLayout::UnderProvisioned
                } else {
                    ShardLayout::Active(vec![members.to_vec()])
                }]
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_member_view() -> View {
        View {
            view_id: ViewId::new(1),
            members: vec![NodeId::new(10), NodeId::new(20), NodeId::new(30)],
            suspected_at_install: vec![false; 3],
            subgroups: vec![SubgroupInfo {
                subgroup_id: SubgroupId::new(0),
                type_id: SubgroupTypeId::new(0),
                subgroup_index: 0,
                shards: vec![ShardView {
                    subgroup_id: SubgroupId::new(0),
                    shard_id: ShardId::new(0),
                    members: vec![NodeId::new(10), NodeId::new(20), NodeId::new(30)],
                }],
                active: true,
            }],
            prior_view_id: None,
        }
    }

    #[test]
    fn leader_is_lowest_unsuspected_rank() {
        let view = three_member_view();
        assert_eq!(view.leader_rank(&[false, false, false]), Some(0));
        assert_eq!(view.leader_rank(&[true, false, false]), Some(1));
        assert_eq!(view.leader_rank(&[true, true, false]), Some(2));
        assert_eq!(view.leader_rank(&[true, true, true]), None);
    }

    #[test]
    fn majority_requires_strictly_more_than_half() {
        let view = three_member_view();
        assert!(view.has_majority(&[true, true, false]));
        assert!(!view.has_majority(&[true, false, false]));
    }

    #[test]
    fn shard_rank_follows_view_order() {
        let view = three_member_view();
        let shard = &view.subgroups[0].shards[0];
        assert_eq!(shard.rank_of(NodeId::new(20)), Some(1));
        assert_eq!(shard.rank_of(NodeId::new(40)), None);
    }
}
