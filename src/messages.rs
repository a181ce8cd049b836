/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the structured messages that cross the transport: status-table deltas,
//! multicast payloads, the view-protocol messages used by joins and state transfer,
//! point-to-point requests and replies, and notifications to external clients.
//!
//! The transport carries exactly one type, [`Message`]; the poller thread fans the variants out
//! to the subsystems that consume them.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::log_store::LogRecord;
use crate::notification::NotificationMessage;
use crate::status_table::StatusDelta;
use crate::types::{
    basic::{Hlc, MessageId, NodeId, RequestId, SignatureBytes, SubgroupId, Version, ViewId},
    view::View,
};

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum Message {
    Status(StatusDelta),
    Multicast(MulticastPayload),
    ViewProtocol(ViewMessage),
    P2p(P2pMessage),
    Notification(NotificationMessage),
}

/// One sender's message in one subgroup's round-robin schedule. A `null` payload occupies the
/// sender's slot of a round without carrying data; the delivery schedule advances past it
/// without assigning a version.
#[derive(Clone, Debug, PartialEq, BorshDeserialize, BorshSerialize)]
pub struct MulticastPayload {
    pub view_id: ViewId,
    pub subgroup_id: SubgroupId,
    pub msg_id: MessageId,
    pub null: bool,
    pub kind: PayloadKind,
    /// The sender's hybrid logical clock at send time. Stamped by the sender so that the
    /// version metadata, and therefore the log records, of all replicas agree byte for byte.
    pub hlc: Hlc,
    pub body: Vec<u8>,
}

/// What a multicast body contains: application bytes delivered untouched, or an [`OrderedCall`]
/// envelope that every shard member decodes and executes through the object's method table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum PayloadKind {
    Raw,
    Call,
}

/// Messages of the join and state-transfer protocol. Membership agreement itself needs no
/// messages of its own: it runs entirely through the status table's change columns.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum ViewMessage {
    /// A non-member asks to be added. Relayed to the leader, which appends a join change.
    JoinRequest { joiner: NodeId },
    /// A member announces a graceful departure, asking the leader for a leave change.
    LeaveRequest { leaver: NodeId },
    /// Everything a joiner needs to start participating: the view about to install, each
    /// replicated object's serialized state, and the durable log. Boxed: this variant dwarfs
    /// the others.
    StateTransfer(Box<StateTransferPacket>),
    /// The per-version signatures a peer missed, read back from the sender's own log. Keeps
    /// signature-chain verification sequential across view changes.
    SignatureCatchUp {
        subgroup_id: SubgroupId,
        entries: Vec<(Version, SignatureBytes)>,
    },
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct StateTransferPacket {
    pub view: View,
    pub objects: Vec<(SubgroupId, Vec<u8>)>,
    pub log_tails: Vec<(SubgroupId, Vec<LogRecord>)>,
    /// How many membership changes the sender had installed when the packet was built; seeds
    /// the joiner's change counters.
    pub changes_installed: u64,
}

/// A point-to-point query or its reply. Bypasses total order; also carries the replies to
/// ordered queries, which each shard member sends back to the caller directly.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum P2pMessage {
    Request {
        subgroup_id: SubgroupId,
        request_id: RequestId,
        opcode: u64,
        args: Vec<u8>,
    },
    Reply {
        request_id: RequestId,
        outcome: ReplyOutcome,
    },
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum ReplyOutcome {
    Ok(Vec<u8>),
    /// The responder had no handler for the opcode, or the handler rejected the arguments.
    Rejected(String),
}

/// The body of an ordered send issued through a subgroup handle's typed query interface. Raw
/// sends deliver their bytes untouched; ordered queries deliver this envelope, which every shard
/// member decodes, executes through the object's method table, and answers with a direct
/// [`P2pMessage::Reply`] to the caller.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct OrderedCall {
    pub opcode: u64,
    pub request_id: RequestId,
    pub caller: NodeId,
    pub args: Vec<u8>,
}

impl From<StatusDelta> for Message {
    fn from(delta: StatusDelta) -> Message {
        Message::Status(delta)
    }
}

impl From<MulticastPayload> for Message {
    fn from(payload: MulticastPayload) -> Message {
        Message::Multicast(payload)
    }
}

impl From<ViewMessage> for Message {
    fn from(message: ViewMessage) -> Message {
        Message::ViewProtocol(message)
    }
}

impl From<P2pMessage> for Message {
    fn from(message: P2pMessage) -> Message {
        Message::P2p(message)
    }
}

impl From<NotificationMessage> for Message {
    fn from(message: NotificationMessage) -> Message {
        Message::Notification(message)
    }
}
