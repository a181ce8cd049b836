/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Transport) for pluggable reliable point-to-point networking, and the
//! internal handles the library's threads use to interact with it.
//!
//! The library has modular networking: each peer is reachable by its [`NodeId`], and transport
//! providers interact with the library through implementations of the [`Transport`] trait. The
//! trait's contract is deliberately strong (delivery between a connected pair is reliable and
//! in order) because the multicast schedule and the signature-chain verification both lean on
//! it; a provider that can drop or reorder must layer its own recovery underneath.
//!
//! The [poller](start_polling) is the single thread that drains the transport. Status-table
//! deltas are folded into the current table as they arrive; every other message is fanned out to
//! the channel of the subsystem that consumes it.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::messages::{Message, MulticastPayload, P2pMessage, ViewMessage};
use crate::notification::NotificationMessage;
use crate::status_table::ColumnSet;
use crate::types::basic::{NodeId, SubgroupId};
use crate::view_manager::SharedCurrentView;

pub trait Transport: Clone + Send + 'static {
    /// Informs the transport of the initial peer set on wake-up.
    fn init_members(&mut self, members: &[NodeId]);

    /// Informs the transport of the peer set of a newly installed view. Connections to departed
    /// peers may be torn down; notifications in flight to them are dropped.
    fn update_members(&mut self, members: &[NodeId]);

    /// Send a message to the specified peer without blocking. Delivery is reliable and in order
    /// per (sender, receiver) pair while the peer remains reachable.
    fn send(&mut self, peer: NodeId, message: Message);

    /// Send a message to all connected peers without blocking.
    fn broadcast(&mut self, message: Message);

    /// Receive a message from any peer. Returns `None` when nothing is available now.
    fn recv(&mut self) -> Option<(NodeId, Message)>;
}

/// Spawn the poller thread, which drains the [`Transport`] and distributes messages to:
/// 1. the current status table (status deltas, folded in place),
/// 2. the delivery loop (multicast payloads),
/// 3. the view manager (join requests, state transfer, signature catch-up),
/// 4. the dispatcher (point-to-point requests and replies), and
/// 5. the notification relay.
pub(crate) fn start_polling<T: Transport>(
    mut transport: T,
    current: SharedCurrentView,
    shutdown_signal: Receiver<()>,
) -> (
    JoinHandle<()>,
    Receiver<(NodeId, MulticastPayload)>,
    Receiver<(NodeId, ViewMessage)>,
    Receiver<(NodeId, P2pMessage)>,
    Receiver<(NodeId, NotificationMessage)>,
) {
    let (to_multicast, multicast_receiver) = mpsc::channel();
    let (to_view, view_receiver) = mpsc::channel();
    let (to_p2p, p2p_receiver) = mpsc::channel();
    let (to_notification, notification_receiver) = mpsc::channel();

    let poller_thread = thread::Builder::new()
        .name("poller".to_string())
        .spawn(move || loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("poller thread disconnected from main thread")
                }
            }

            if let Some((origin, message)) = transport.recv() {
                match message {
                    Message::Status(delta) => {
                        current.read().unwrap().table.apply(origin, &delta);
                    }
                    Message::Multicast(payload) => {
                        let _ = to_multicast.send((origin, payload));
                    }
                    Message::ViewProtocol(view_message) => {
                        let _ = to_view.send((origin, view_message));
                    }
                    Message::P2p(p2p_message) => {
                        let _ = to_p2p.send((origin, p2p_message));
                    }
                    Message::Notification(notification) => {
                        let _ = to_notification.send((origin, notification));
                    }
                }
            } else {
                thread::yield_now()
            }
        })
        .expect("the poller thread can be spawned");

    (
        poller_thread,
        multicast_receiver,
        view_receiver,
        p2p_receiver,
        notification_receiver,
    )
}

/// Handle for sending and broadcasting messages of any type that converts [`Into<Message>`].
#[derive(Clone)]
pub(crate) struct SenderHandle<T: Transport> {
    transport: T,
}

impl<T: Transport> SenderHandle<T> {
    pub(crate) fn new(transport: T) -> Self {
        Self { transport }
    }

    pub(crate) fn send<M: Into<Message>>(&mut self, peer: NodeId, message: M) {
        self.transport.send(peer, message.into())
    }

    pub(crate) fn send_to<M: Into<Message> + Clone>(&mut self, peers: &[NodeId], message: M) {
        for peer in peers {
            self.transport.send(*peer, message.clone().into())
        }
    }

    pub(crate) fn broadcast<M: Into<Message>>(&mut self, message: M) {
        self.transport.broadcast(message.into())
    }
}

/// Where a status push lands: the members of one subgroup's local shard, or every member of the
/// view.
pub(crate) enum PushDest {
    ShardPeers(SubgroupId),
    AllPeers,
}

/// Couples the status table to the transport: snapshots the selected columns of the local row
/// and ships them. The remote-write half of the table.
#[derive(Clone)]
pub(crate) struct StatusPusher<T: Transport> {
    sender: SenderHandle<T>,
    current: SharedCurrentView,
    local_id: NodeId,
}

impl<T: Transport> StatusPusher<T> {
    pub(crate) fn new(transport: T, current: SharedCurrentView, local_id: NodeId) -> Self {
        Self {
            sender: SenderHandle::new(transport),
            current,
            local_id,
        }
    }

    /// Push the selected columns of the local row to `dest`. Must be called with the current
    /// view read lock *not* held by this thread.
    pub(crate) fn push(&mut self, columns: &ColumnSet, dest: PushDest) {
        let (delta, peers) = {
            let current = self.current.read().unwrap();
            let delta = current.table.delta(columns);
            let peers: Vec<NodeId> = match dest {
                PushDest::AllPeers => current
                    .view
                    .members
                    .iter()
                    .copied()
                    .filter(|member| *member != self.local_id)
                    .collect(),
                PushDest::ShardPeers(subgroup_id) => current
                    .view
                    .subgroup(subgroup_id)
                    .and_then(|info| info.shard_of(self.local_id))
                    .map(|shard| {
                        shard
                            .members
                            .iter()
                            .copied()
                            .filter(|member| *member != self.local_id)
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            (delta, peers)
        };
        self.sender.send_to(&peers, Message::Status(delta));
    }
}
