/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The subgroup dispatcher: routes stable deliveries into user callbacks and replicated-object
//! method tables, answers point-to-point queries, and relays notifications.
//!
//! The dispatcher owns the [`ObjectRegistry`]: the mapping from subgroup ids to the replicated
//! objects sharded onto this replica. A subgroup's entry exists exactly while some view shards
//! the subgroup here: the view manager creates it from the registered factory at install and
//! drops it when the layout moves the subgroup away.

use borsh::BorshDeserialize;
use std::{
    collections::HashMap,
    sync::{
        mpsc::{Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::SystemTime,
};

use crate::events::{Event, StableEvent};
use crate::messages::{OrderedCall, P2pMessage, PayloadKind, ReplyOutcome};
use crate::multicast::StableMessage;
use crate::notification::NotificationMessage;
use crate::persistence::PersistenceHandle;
use crate::replicated::RegistryEntry;
use crate::rpc::ReplyRouter;
use crate::transport::{SenderHandle, Transport};
use crate::types::basic::{MessageId, NodeId, SubgroupId, Version};

/// The function type for stable-delivery callbacks: subgroup, sender, message id, body, version.
pub type StabilityCallback = Box<dyn Fn(SubgroupId, NodeId, MessageId, &[u8], Version) + Send + Sync>;

/// The function type for persistence-progress callbacks: subgroup, version.
pub type PersistenceCallback = Box<dyn Fn(SubgroupId, Version) + Send + Sync>;

/// Bundles the callback functions through which the library hands control back to the
/// application as messages and versions progress through their lifecycle.
#[derive(Default)]
pub struct UserMessageCallbacks {
    /// Called each time a message reaches stability in the group.
    pub global_stability: Option<StabilityCallback>,
    /// Called when a new version finishes persisting locally.
    pub local_persistence: Option<PersistenceCallback>,
    /// Called when a new version has been persisted by every member of its shard.
    pub global_persistence: Option<PersistenceCallback>,
    /// Called when a new version's signatures have verified for every member of its shard.
    pub global_verified: Option<PersistenceCallback>,
}

/// The replicated objects sharded onto this replica, by subgroup id.
pub(crate) struct ObjectRegistry {
    pub(crate) objects: HashMap<SubgroupId, Box<dyn RegistryEntry>>,
}

impl ObjectRegistry {
    pub(crate) fn new() -> ObjectRegistry {
        ObjectRegistry {
            objects: HashMap::new(),
        }
    }
}

/// Routes stable deliveries and point-to-point traffic into the registry and back out to
/// callers.
pub(crate) struct Dispatcher<T: Transport> {
    local_id: NodeId,
    registry: Arc<Mutex<ObjectRegistry>>,
    callbacks: Arc<UserMessageCallbacks>,
    reply_router: Arc<ReplyRouter>,
    sender: SenderHandle<T>,
    persistence: PersistenceHandle,
    event_publisher: Option<Sender<Event>>,
}

impl<T: Transport> Dispatcher<T> {
    pub(crate) fn new(
        local_id: NodeId,
        registry: Arc<Mutex<ObjectRegistry>>,
        callbacks: Arc<UserMessageCallbacks>,
        reply_router: Arc<ReplyRouter>,
        sender: SenderHandle<T>,
        persistence: PersistenceHandle,
        event_publisher: Option<Sender<Event>>,
    ) -> Dispatcher<T> {
        Dispatcher {
            local_id,
            registry,
            callbacks,
            reply_router,
            sender,
            persistence,
            event_publisher,
        }
    }

    /// Process one message that has reached stability: fire the stability callback, run the
    /// object's method-table handler for ordered calls (answering the caller directly), stage
    /// the version snapshot, and hand the version to the persistence manager.
    pub(crate) fn on_stable(&mut self, stable: StableMessage) {
        if let Some(callback) = &self.callbacks.global_stability {
            callback(
                stable.subgroup_id,
                stable.sender,
                stable.msg_id,
                &stable.body,
                stable.version,
            );
        }
        Event::Stable(StableEvent {
            timestamp: SystemTime::now(),
            subgroup_id: stable.subgroup_id,
            sender: stable.sender,
            msg_id: stable.msg_id,
            version: stable.version,
        })
        .publish(&self.event_publisher);

        let mut registry = self.registry.lock().unwrap();
        let Some(entry) = registry.objects.get_mut(&stable.subgroup_id) else {
            return;
        };

        if stable.kind == PayloadKind::Call {
            match OrderedCall::try_from_slice(&stable.body) {
                Ok(call) => {
                    let outcome = match entry.invoke(call.opcode, &call.args) {
                        Ok(reply) => ReplyOutcome::Ok(reply),
                        Err(err) => ReplyOutcome::Rejected(format!("{err:?}")),
                    };
                    // A caller's own reply short-circuits the transport: not every provider
                    // loops a send-to-self back.
                    if call.caller == self.local_id {
                        self.reply_router.route(call.request_id, self.local_id, outcome);
                    } else {
                        self.sender.send(
                            call.caller,
                            P2pMessage::Reply {
                                request_id: call.request_id,
                                outcome,
                            },
                        );
                    }
                }
                Err(err) => {
                    log::warn!(
                        "undecodable ordered call in subgroup {} from {}: {}",
                        stable.subgroup_id,
                        stable.sender,
                        err
                    );
                }
            }
        }

        entry.make_version(stable.version, stable.hlc);
        drop(registry);
        self.persistence.post_persist_request(stable.subgroup_id, stable.version);
    }
}

/// Spawn the point-to-point server thread: answers inbound requests through the registry and
/// routes inbound replies to their waiting query handles. Each request is answered on a
/// short-lived thread so a slow handler cannot hold up reply routing.
pub(crate) fn start_p2p_server<T: Transport>(
    local_id: NodeId,
    registry: Arc<Mutex<ObjectRegistry>>,
    reply_router: Arc<ReplyRouter>,
    sender: SenderHandle<T>,
    p2p_receiver: Receiver<(NodeId, P2pMessage)>,
    notification_receiver: Receiver<(NodeId, NotificationMessage)>,
    notification_relay: Arc<Mutex<crate::notification::NotificationSupport>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("p2p_server".to_string())
        .spawn(move || loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("p2p_server thread disconnected from main thread")
                }
            }

            let mut idle = true;
            match p2p_receiver.try_recv() {
                Ok((origin, P2pMessage::Request {
                    subgroup_id,
                    request_id,
                    opcode,
                    args,
                })) => {
                    idle = false;
                    let registry = registry.clone();
                    let mut sender = sender.clone();
                    let reply_router = reply_router.clone();
                    thread::spawn(move || {
                        let outcome = {
                            let mut registry = registry.lock().unwrap();
                            match registry.objects.get_mut(&subgroup_id) {
                                Some(entry) => match entry.invoke(opcode, &args) {
                                    Ok(reply) => ReplyOutcome::Ok(reply),
                                    Err(err) => ReplyOutcome::Rejected(format!("{err:?}")),
                                },
                                None => ReplyOutcome::Rejected(format!(
                                    "subgroup {subgroup_id} is not sharded onto this replica"
                                )),
                            }
                        };
                        if origin == local_id {
                            reply_router.route(request_id, local_id, outcome);
                        } else {
                            sender.send(origin, P2pMessage::Reply { request_id, outcome });
                        }
                    });
                }
                Ok((origin, P2pMessage::Reply {
                    request_id,
                    outcome,
                })) => {
                    idle = false;
                    reply_router.route(request_id, origin, outcome);
                }
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => return,
            }

            match notification_receiver.try_recv() {
                Ok((_, notification)) => {
                    idle = false;
                    notification_relay.lock().unwrap().notify(&notification);
                }
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => return,
            }

            if idle {
                thread::yield_now()
            }
        })
        .expect("the p2p_server thread can be spawned")
}
