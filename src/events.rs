/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local group member.
//!
//! ## Event enum
//!
//! Significant occurrences include installing a view, proposing and committing membership
//! changes, a message reaching stability, a version finishing persistence locally or across the
//! shard, and a peer's signature failing verification.
//!
//! Each occurrence corresponds to a variant of the [event enum](Event), whose inner struct
//! stores information summarizing it, always including a timestamp taken when the event
//! occurred.
//!
//! ## Registering event handlers
//!
//! Library users can register one event handler closure per event type through the group
//! builder; the [event bus](crate::event_bus) thread runs them when events arrive. Default
//! handlers that log every event as CSV can be switched on in the
//! [configuration](crate::config::Configuration::log_events).
//!
//! ## Timing
//!
//! Events are emitted **after** the corresponding occurrence completes. The local-persist event,
//! for example, fires only after the version's record has been written and synced to the log.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::{
    basic::{MessageId, NodeId, SubgroupId, Version, ViewId},
    view::MembershipChange,
};

/// Enumerates all events the library emits.
pub enum Event {
    // View management.
    InstallView(InstallViewEvent),
    ProposeChange(ProposeChangeEvent),
    CommitChanges(CommitChangesEvent),
    Suspect(SuspectEvent),
    RaggedTrim(RaggedTrimEvent),

    // Joins and departures.
    JoinRequest(JoinRequestEvent),
    StartStateTransfer(StartStateTransferEvent),
    EndStateTransfer(EndStateTransferEvent),

    // Multicast.
    Send(SendEvent),
    Stable(StableEvent),

    // Persistence.
    LocalPersist(LocalPersistEvent),
    GlobalPersist(GlobalPersistEvent),
    GlobalVerify(GlobalVerifyEvent),
    SignatureInvalid(SignatureInvalidEvent),
}

impl Event {
    /// Publish this event on the event publisher channel, if one is defined.
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A new view was installed and is now current.
pub struct InstallViewEvent {
    pub timestamp: SystemTime,
    pub view_id: ViewId,
    pub num_members: usize,
}

/// The leader appended a membership change to its change ring.
pub struct ProposeChangeEvent {
    pub timestamp: SystemTime,
    pub change: MembershipChange,
    pub index: u64,
}

/// The committed-change counter advanced: every non-suspected member has echoed the changes.
pub struct CommitChangesEvent {
    pub timestamp: SystemTime,
    pub num_committed: u64,
}

/// The failure detector marked a peer suspected.
pub struct SuspectEvent {
    pub timestamp: SystemTime,
    pub suspect: NodeId,
}

/// The leader published the delivery cutoffs that close out the current view.
pub struct RaggedTrimEvent {
    pub timestamp: SystemTime,
    pub view_id: ViewId,
}

/// A non-member asked to join.
pub struct JoinRequestEvent {
    pub timestamp: SystemTime,
    pub joiner: NodeId,
}

/// This member began shipping state to a joiner.
pub struct StartStateTransferEvent {
    pub timestamp: SystemTime,
    pub joiner: NodeId,
}

/// State transfer to a joiner completed.
pub struct EndStateTransferEvent {
    pub timestamp: SystemTime,
    pub joiner: NodeId,
}

/// A multicast message was accepted and published to the shard.
pub struct SendEvent {
    pub timestamp: SystemTime,
    pub subgroup_id: SubgroupId,
    pub msg_id: MessageId,
    pub size: usize,
}

/// A message reached stability: every shard member delivered it, and it was handed to the
/// dispatcher under its assigned version.
pub struct StableEvent {
    pub timestamp: SystemTime,
    pub subgroup_id: SubgroupId,
    pub sender: NodeId,
    pub msg_id: MessageId,
    pub version: Version,
}

/// A version finished persisting to the local log.
pub struct LocalPersistEvent {
    pub timestamp: SystemTime,
    pub subgroup_id: SubgroupId,
    pub version: Version,
}

/// Every shard member has persisted the version.
pub struct GlobalPersistEvent {
    pub timestamp: SystemTime,
    pub subgroup_id: SubgroupId,
    pub version: Version,
}

/// Every shard peer's chained signature up to the version verified against its public key.
pub struct GlobalVerifyEvent {
    pub timestamp: SystemTime,
    pub subgroup_id: SubgroupId,
    pub version: Version,
}

/// A peer's signature failed verification. The verified watermark will not advance past the
/// offending version, but the subgroup keeps running.
pub struct SignatureInvalidEvent {
    pub timestamp: SystemTime,
    pub subgroup_id: SubgroupId,
    pub peer: NodeId,
    pub version: Version,
}
