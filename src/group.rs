/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Group`] façade: the one type an application constructs, owning every long-lived thread
//! of the library and exposing join, leave, subgroup handles, ordered and point-to-point
//! queries, notifications, and the barrier.
//!
//! Construct a group with the builder:
//!
//! ```ignore
//! let group = GroupSpec::builder()
//!     .configuration(configuration)
//!     .transport(transport)
//!     .log_store(log_store)
//!     .membership(Membership::Founding(vec![NodeId::new(10), NodeId::new(20)]))
//!     .object_types(vec![ObjectType::new(|_| Counter::default(), counter_methods)])
//!     .layout(one_subgroup_per_type(1))
//!     .on_install_view(|event| log::debug!("installed view {}", event.view_id))
//!     .build()
//!     .join()?;
//! ```
//!
//! Dropping the group shuts it down cooperatively: each thread is signalled, then joined, in
//! dependency order (producers before the poller they feed from, the event bus last).

use borsh::{BorshDeserialize, BorshSerialize};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};
use typed_builder::TypedBuilder;

use crate::config::Configuration;
use crate::dispatcher::{start_p2p_server, Dispatcher, ObjectRegistry, UserMessageCallbacks};
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPair};
use crate::events::*;
use crate::failure_detector::start_failure_detector;
use crate::keys::{KeyLoadError, Keypair, PublicKeyStore};
use crate::log_store::LogStore;
use crate::messages::{Message, OrderedCall, P2pMessage, PayloadKind, ViewMessage};
use crate::multicast::{start_delivery_loop, SendError};
use crate::notification::{NotificationMessage, NotificationSupport};
use crate::persistence::{
    start_predicate_poller, PersistenceManager, WatermarkTracker,
};
use crate::replicated::ObjectType;
use crate::rpc::{QueryResults, ReplyRouter};
use crate::status_table::ColumnSet;
use crate::transport::{start_polling, PushDest, SenderHandle, StatusPusher, Transport};
use crate::types::{
    basic::{Hlc, NodeId, RequestId, SubgroupId, SubgroupTypeId, Version, ViewId},
    view::{LayoutFn, MemberState, View, ViewState},
};
use crate::view_manager::{
    founding_view, placeholder_view, rebuild_groups_and_registry, start_view_manager,
    ActiveGroups, CurrentView, SharedCurrentView, ViewManagerContext,
};

/// How this process enters the group.
pub enum Membership {
    /// One of the founding members: all founders start together with the listed membership as
    /// view 0.
    Founding(Vec<NodeId>),
    /// A later joiner: ask the given member to sponsor the join, then wait for state transfer.
    Joining(NodeId),
}

/// Why a join did not complete.
#[derive(Debug)]
pub enum JoinError {
    /// The configuration names this process a joiner but no view arrived in time.
    Timeout,
    /// `Membership::Founding` was used but the local id is not among the founders.
    NotAFoundingMember,
    /// Signing is enabled but the private key or the public-key directory could not be loaded.
    KeyLoad(KeyLoadError),
    /// Signing is enabled but no key source (in-process key or file path) was configured.
    MissingKeys,
}

impl From<KeyLoadError> for JoinError {
    fn from(err: KeyLoadError) -> JoinError {
        JoinError::KeyLoad(err)
    }
}

/// Everything needed to start a group member. Build one with `GroupSpec::builder()`, then call
/// [`join`](GroupSpec::join).
#[derive(TypedBuilder)]
#[builder(doc)]
pub struct GroupSpec<T: Transport> {
    pub configuration: Configuration,

    pub transport: T,

    #[builder(setter(transform = |store: impl LogStore| Arc::new(Mutex::new(Box::new(store) as Box<dyn LogStore>))))]
    pub log_store: Arc<Mutex<Box<dyn LogStore>>>,

    pub membership: Membership,

    /// Replicated-object types, in [`SubgroupTypeId`] order. Must line up with what the layout
    /// function produces.
    #[builder(default)]
    pub object_types: Vec<ObjectType>,

    pub layout: LayoutFn,

    #[builder(default)]
    pub callbacks: UserMessageCallbacks,

    /// In-process signing key; overrides `private_key_file`.
    #[builder(default, setter(strip_option))]
    pub signing_key: Option<ed25519_dalek::SigningKey>,

    /// In-process verifying keys; overrides `public_key_dir`.
    #[builder(default, setter(strip_option))]
    pub public_keys: Option<PublicKeyStore>,

    // One optional handler per event type; see [events](crate::events).
    #[builder(default, setter(transform = |h: impl Fn(&InstallViewEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&InstallViewEvent) + Send>)))]
    pub on_install_view: Option<Box<dyn Fn(&InstallViewEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&ProposeChangeEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&ProposeChangeEvent) + Send>)))]
    pub on_propose_change: Option<Box<dyn Fn(&ProposeChangeEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&CommitChangesEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&CommitChangesEvent) + Send>)))]
    pub on_commit_changes: Option<Box<dyn Fn(&CommitChangesEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&SuspectEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&SuspectEvent) + Send>)))]
    pub on_suspect: Option<Box<dyn Fn(&SuspectEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&RaggedTrimEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&RaggedTrimEvent) + Send>)))]
    pub on_ragged_trim: Option<Box<dyn Fn(&RaggedTrimEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&JoinRequestEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&JoinRequestEvent) + Send>)))]
    pub on_join_request: Option<Box<dyn Fn(&JoinRequestEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&StartStateTransferEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&StartStateTransferEvent) + Send>)))]
    pub on_start_state_transfer: Option<Box<dyn Fn(&StartStateTransferEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&EndStateTransferEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&EndStateTransferEvent) + Send>)))]
    pub on_end_state_transfer: Option<Box<dyn Fn(&EndStateTransferEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&SendEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&SendEvent) + Send>)))]
    pub on_send: Option<Box<dyn Fn(&SendEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&StableEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&StableEvent) + Send>)))]
    pub on_stable: Option<Box<dyn Fn(&StableEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&LocalPersistEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&LocalPersistEvent) + Send>)))]
    pub on_local_persist: Option<Box<dyn Fn(&LocalPersistEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&GlobalPersistEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&GlobalPersistEvent) + Send>)))]
    pub on_global_persist: Option<Box<dyn Fn(&GlobalPersistEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&GlobalVerifyEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&GlobalVerifyEvent) + Send>)))]
    pub on_global_verify: Option<Box<dyn Fn(&GlobalVerifyEvent) + Send>>,
    #[builder(default, setter(transform = |h: impl Fn(&SignatureInvalidEvent) + Send + 'static| Some(Box::new(h) as Box<dyn Fn(&SignatureInvalidEvent) + Send>)))]
    pub on_signature_invalid: Option<Box<dyn Fn(&SignatureInvalidEvent) + Send>>,
}

impl<T: Transport> GroupSpec<T> {
    /// Start every thread and enter the group. Founders return as soon as their threads are up;
    /// joiners block until their state transfer installs (or time out).
    pub fn join(self) -> Result<Group<T>, JoinError> {
        Group::join(self)
    }
}

/// A running group member. Dropping it leaves non-gracefully (peers notice through the failure
/// detector); call [`leave`](Group::leave) for a graceful departure.
pub struct Group<T: Transport> {
    local_id: NodeId,
    transport: T,
    current: SharedCurrentView,
    groups: Arc<Mutex<ActiveGroups>>,
    reply_router: Arc<ReplyRouter>,
    notification_relay: Arc<Mutex<NotificationSupport>>,
    hlc: Arc<Mutex<Hlc>>,
    next_request: Arc<AtomicU64>,
    awaiting_transfer: Arc<AtomicBool>,
    left: Arc<AtomicBool>,
    event_publisher: Option<Sender<Event>>,

    persistence: Option<PersistenceManager>,
    view_manager: Option<JoinHandle<()>>,
    view_manager_shutdown: Sender<()>,
    failure_detector: Option<JoinHandle<()>>,
    failure_detector_shutdown: Sender<()>,
    delivery: Option<JoinHandle<()>>,
    delivery_shutdown: Sender<()>,
    p2p_server: Option<JoinHandle<()>>,
    p2p_server_shutdown: Sender<()>,
    predicates: Option<JoinHandle<()>>,
    predicates_shutdown: Sender<()>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Sender<()>,
}

impl<T: Transport> Group<T> {
    fn join(spec: GroupSpec<T>) -> Result<Group<T>, JoinError> {
        let configuration = spec.configuration;
        let local_id = configuration.local_id;

        let signer = if configuration.signed_log {
            Some(match spec.signing_key {
                Some(key) => Keypair::new(key),
                None => {
                    let path = configuration
                        .private_key_file
                        .as_ref()
                        .ok_or(JoinError::MissingKeys)?;
                    Keypair::from_file(path)?
                }
            })
        } else {
            None
        };
        let public_keys = if configuration.signed_log {
            Some(Arc::new(match spec.public_keys {
                Some(store) => store,
                None => {
                    let dir = configuration
                        .public_key_dir
                        .as_ref()
                        .ok_or(JoinError::MissingKeys)?;
                    PublicKeyStore::from_dir(dir)?
                }
            }))
        } else {
            None
        };

        let layout = spec.layout;
        let (initial_view, awaiting, seed) = match spec.membership {
            Membership::Founding(founders) => {
                let view = founding_view(&founders, &layout);
                if !view.is_member(local_id) {
                    return Err(JoinError::NotAFoundingMember);
                }
                (view, false, None)
            }
            Membership::Joining(seed) => (placeholder_view(local_id), true, Some(seed)),
        };

        let mut transport = spec.transport;
        match seed {
            Some(seed) => transport.init_members(&[local_id, seed]),
            None => transport.init_members(&initial_view.members),
        }

        let table = crate::status_table::StatusTable::new(
            &initial_view,
            local_id,
            configuration.changes_ring_capacity,
        );
        let initial_view = Arc::new(initial_view);
        let current: SharedCurrentView = Arc::new(RwLock::new(CurrentView {
            view: initial_view.clone(),
            table: Arc::new(table),
        }));

        let registry = Arc::new(Mutex::new(ObjectRegistry::new()));
        let groups = Arc::new(Mutex::new(ActiveGroups::new()));
        let object_types = Arc::new(spec.object_types);
        if seed.is_none() {
            rebuild_groups_and_registry(
                &initial_view,
                local_id,
                configuration.window_size,
                configuration.max_payload_size,
                &groups,
                &registry,
                &object_types,
            );
            // A founder restarting over an existing log starts from what it already made
            // durable: seed the persisted column (and latest signature) from the log tail.
            let current = current.read().unwrap();
            let mut store = spec.log_store.lock().unwrap();
            for info in &initial_view.subgroups {
                if info.shard_of(local_id).is_none() {
                    continue;
                }
                let Ok(last) = store.last_version(info.subgroup_id) else {
                    continue;
                };
                if last.is_none() {
                    continue;
                }
                let signature = store
                    .read(info.subgroup_id, last)
                    .ok()
                    .flatten()
                    .and_then(|record| {
                        let bytes: [u8; 64] = record.signature.as_slice().try_into().ok()?;
                        Some(crate::types::basic::SignatureBytes::new(bytes))
                    });
                current.table.set_persisted(info.subgroup_id, last, signature);
            }
        }

        let event_handlers = EventHandlers {
            install_view_handlers: HandlerPair::new(configuration.log_events, spec.on_install_view),
            propose_change_handlers: HandlerPair::new(configuration.log_events, spec.on_propose_change),
            commit_changes_handlers: HandlerPair::new(configuration.log_events, spec.on_commit_changes),
            suspect_handlers: HandlerPair::new(configuration.log_events, spec.on_suspect),
            ragged_trim_handlers: HandlerPair::new(configuration.log_events, spec.on_ragged_trim),
            join_request_handlers: HandlerPair::new(configuration.log_events, spec.on_join_request),
            start_state_transfer_handlers: HandlerPair::new(
                configuration.log_events,
                spec.on_start_state_transfer,
            ),
            end_state_transfer_handlers: HandlerPair::new(
                configuration.log_events,
                spec.on_end_state_transfer,
            ),
            send_handlers: HandlerPair::new(configuration.log_events, spec.on_send),
            stable_handlers: HandlerPair::new(configuration.log_events, spec.on_stable),
            local_persist_handlers: HandlerPair::new(configuration.log_events, spec.on_local_persist),
            global_persist_handlers: HandlerPair::new(
                configuration.log_events,
                spec.on_global_persist,
            ),
            global_verify_handlers: HandlerPair::new(configuration.log_events, spec.on_global_verify),
            signature_invalid_handlers: HandlerPair::new(
                configuration.log_events,
                spec.on_signature_invalid,
            ),
        };
        let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
        let (event_publisher, event_bus) = if event_handlers.is_empty() {
            (None, None)
        } else {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let event_bus =
                start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
            (Some(event_publisher), Some(event_bus))
        };

        let callbacks = Arc::new(spec.callbacks);
        let reply_router = Arc::new(ReplyRouter::new());
        let log_store = spec.log_store;

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, payload_receiver, view_receiver, p2p_receiver, notification_receiver) =
            start_polling(transport.clone(), current.clone(), poller_shutdown_receiver);

        let persistence = PersistenceManager::start(
            registry.clone(),
            log_store.clone(),
            signer,
            current.clone(),
            StatusPusher::new(transport.clone(), current.clone(), local_id),
            callbacks.clone(),
            event_publisher.clone(),
        );
        let persistence_handle = persistence.handle();

        let dispatcher = Arc::new(Mutex::new(Dispatcher::new(
            local_id,
            registry.clone(),
            callbacks.clone(),
            reply_router.clone(),
            SenderHandle::new(transport.clone()),
            persistence_handle.clone(),
            event_publisher.clone(),
        )));

        let (delivery_shutdown, delivery_shutdown_receiver) = mpsc::channel();
        let delivery = start_delivery_loop(
            transport.clone(),
            local_id,
            current.clone(),
            groups.clone(),
            dispatcher.clone(),
            payload_receiver,
            delivery_shutdown_receiver,
        );

        let notification_relay = Arc::new(Mutex::new(NotificationSupport::new()));
        let (p2p_server_shutdown, p2p_server_shutdown_receiver) = mpsc::channel();
        let p2p_server = start_p2p_server(
            local_id,
            registry.clone(),
            reply_router.clone(),
            SenderHandle::new(transport.clone()),
            p2p_receiver,
            notification_receiver,
            notification_relay.clone(),
            p2p_server_shutdown_receiver,
        );

        let tracker = Arc::new(Mutex::new(WatermarkTracker::new(local_id)));
        let (predicates_shutdown, predicates_shutdown_receiver) = mpsc::channel();
        let predicates = start_predicate_poller(
            tracker.clone(),
            current.clone(),
            log_store.clone(),
            public_keys,
            StatusPusher::new(transport.clone(), current.clone(), local_id),
            callbacks.clone(),
            event_publisher.clone(),
            predicates_shutdown_receiver,
        );

        let (failure_detector_shutdown, failure_detector_shutdown_receiver) = mpsc::channel();
        let failure_detector = start_failure_detector(
            current.clone(),
            StatusPusher::new(transport.clone(), current.clone(), local_id),
            configuration.heartbeat_interval,
            configuration.suspicion_timeout,
            event_publisher.clone(),
            failure_detector_shutdown_receiver,
        );

        // A founder restarting over an existing signed log announces its chain so peers can
        // verify it from the start; joiners announce theirs at install instead.
        if seed.is_none() && configuration.signed_log {
            let mut sender = SenderHandle::new(transport.clone());
            let mut store = log_store.lock().unwrap();
            for info in &initial_view.subgroups {
                if info.shard_of(local_id).is_none() {
                    continue;
                }
                let entries: Vec<(Version, crate::types::basic::SignatureBytes)> = store
                    .read_range(
                        info.subgroup_id,
                        Version::NONE,
                        Version::from_int(i64::MAX),
                    )
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|record| {
                        let bytes: [u8; 64] = record.signature.as_slice().try_into().ok()?;
                        Some((record.version, crate::types::basic::SignatureBytes::new(bytes)))
                    })
                    .collect();
                if entries.is_empty() {
                    continue;
                }
                for peer in initial_view.members.iter().filter(|member| **member != local_id) {
                    sender.send(
                        *peer,
                        ViewMessage::SignatureCatchUp {
                            subgroup_id: info.subgroup_id,
                            entries: entries.clone(),
                        },
                    );
                }
            }
        }

        let awaiting_transfer = Arc::new(AtomicBool::new(awaiting));
        let left = Arc::new(AtomicBool::new(false));
        let (view_manager_shutdown, view_manager_shutdown_receiver) = mpsc::channel();
        let view_manager = start_view_manager(
            ViewManagerContext {
                local_id,
                window_size: configuration.window_size,
                max_payload_size: configuration.max_payload_size,
                changes_ring_capacity: configuration.changes_ring_capacity,
                signed_log: configuration.signed_log,
                transport: transport.clone(),
                current: current.clone(),
                groups: groups.clone(),
                registry,
                object_types,
                layout,
                dispatcher,
                persistence: persistence_handle,
                tracker,
                reply_router: reply_router.clone(),
                log_store,
                event_publisher: event_publisher.clone(),
                awaiting_transfer: awaiting_transfer.clone(),
                left: left.clone(),
            },
            view_receiver,
            view_manager_shutdown_receiver,
        );

        let group = Group {
            local_id,
            transport,
            current,
            groups,
            reply_router,
            notification_relay,
            hlc: Arc::new(Mutex::new(Hlc::default())),
            next_request: Arc::new(AtomicU64::new(0)),
            awaiting_transfer,
            left,
            event_publisher,
            persistence: Some(persistence),
            view_manager: Some(view_manager),
            view_manager_shutdown,
            failure_detector: Some(failure_detector),
            failure_detector_shutdown,
            delivery: Some(delivery),
            delivery_shutdown,
            p2p_server: Some(p2p_server),
            p2p_server_shutdown,
            predicates: Some(predicates),
            predicates_shutdown,
            poller: Some(poller),
            poller_shutdown,
            event_bus,
            event_bus_shutdown,
        };

        if let Some(seed) = seed {
            group.request_join(seed)?;
        }
        Ok(group)
    }

    /// Ask `seed` to sponsor our join and wait for the transferred view to install.
    fn request_join(&self, seed: NodeId) -> Result<(), JoinError> {
        let deadline = Instant::now() + Duration::from_secs(60);
        let mut sender = SenderHandle::new(self.transport.clone());
        let mut last_request = Instant::now() - Duration::from_secs(1);
        while self.awaiting_transfer.load(Ordering::Acquire) {
            if Instant::now() > deadline {
                return Err(JoinError::Timeout);
            }
            if last_request.elapsed() >= Duration::from_millis(500) {
                last_request = Instant::now();
                sender.send(seed, ViewMessage::JoinRequest { joiner: self.local_id });
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The currently installed view.
    pub fn current_view(&self) -> Arc<View> {
        self.current.read().unwrap().view.clone()
    }

    /// Where this process stands in the membership lifecycle.
    pub fn member_state(&self) -> MemberState {
        if self.awaiting_transfer.load(Ordering::Acquire) {
            MemberState::Joining
        } else if self.left.load(Ordering::Acquire) {
            MemberState::Leaving
        } else {
            MemberState::ActiveInView
        }
    }

    /// Where a view stands relative to this replica: already superseded, current, about to be
    /// constructed from committed changes, or merely proposed.
    pub fn view_state(&self, view_id: ViewId) -> ViewState {
        let current = self.current.read().unwrap();
        if view_id < current.view.view_id {
            ViewState::Retired
        } else if view_id == current.view.view_id {
            ViewState::Installed
        } else if view_id == current.view.view_id + 1
            && current.table.local_row().num_committed() > current.table.local_row().num_installed()
        {
            ViewState::Committed
        } else {
            ViewState::Proposed
        }
    }

    /// A handle onto the `subgroup_index`-th subgroup of object type `type_id`.
    pub fn get_subgroup(&self, type_id: SubgroupTypeId, subgroup_index: u32) -> SubgroupHandle<T> {
        SubgroupHandle {
            local_id: self.local_id,
            type_id,
            subgroup_index,
            transport: self.transport.clone(),
            current: self.current.clone(),
            groups: self.groups.clone(),
            reply_router: self.reply_router.clone(),
            hlc: self.hlc.clone(),
            next_request: self.next_request.clone(),
            left: self.left.clone(),
            event_publisher: self.event_publisher.clone(),
        }
    }

    /// Register a handler for notifications other members relay to this process.
    pub fn add_notification_handler(
        &self,
        handler: impl Fn(&NotificationMessage) + Send + 'static,
    ) {
        self.notification_relay
            .lock()
            .unwrap()
            .add_notification_handler(handler);
    }

    /// Send a one-way notification to `target`, typically an external client. Best-effort: a
    /// notification in flight while the target disconnects is dropped.
    pub fn notify(&self, target: NodeId, message: NotificationMessage) {
        SenderHandle::new(self.transport.clone()).send(target, message);
    }

    /// Block until every non-suspected member's heartbeat has been observed to advance past the
    /// point it was at when the call was made: one full round through the status table.
    pub fn barrier_sync(&self) {
        let (view_id, baseline) = {
            let current = self.current.read().unwrap();
            let baseline: Vec<u64> = (0..current.table.num_rows())
                .map(|rank| current.table.row(rank).heartbeat())
                .collect();
            (current.view.view_id, baseline)
        };
        loop {
            {
                let current = self.current.read().unwrap();
                if current.view.view_id != view_id {
                    // The barrier's epoch ended; the new view's install already implies a full
                    // exchange.
                    return;
                }
                let suspicion = current.table.effective_suspicion();
                let done = (0..current.table.num_rows()).all(|rank| {
                    suspicion[rank] || current.table.row(rank).heartbeat() > baseline[rank]
                });
                if done {
                    return;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Watermarks, mainly for tests and operator tooling: this member's stable version for a
    /// subgroup, and the shard-wide persisted/verified minima.
    pub fn stable_version(&self, subgroup_id: SubgroupId) -> Version {
        self.current
            .read()
            .unwrap()
            .table
            .local_row()
            .stable_num(subgroup_id)
    }

    pub fn global_persisted(&self, subgroup_id: SubgroupId) -> Version {
        let current = self.current.read().unwrap();
        let ranks = match shard_ranks(&current, self.local_id, subgroup_id) {
            Some(ranks) => ranks,
            None => return Version::NONE,
        };
        current.table.min_persisted(subgroup_id, &ranks)
    }

    pub fn global_verified(&self, subgroup_id: SubgroupId) -> Version {
        let current = self.current.read().unwrap();
        let ranks = match shard_ranks(&current, self.local_id, subgroup_id) {
            Some(ranks) => ranks,
            None => return Version::NONE,
        };
        ranks
            .iter()
            .map(|rank| current.table.row(*rank).verified_num(subgroup_id))
            .min()
            .unwrap_or(Version::NONE)
    }

    /// Leave the group. If `graceful`, announce the departure and wait (bounded) for the view
    /// excluding this process to install before shutting down; otherwise shut down immediately
    /// and let the failure detector do the rest.
    pub fn leave(self, graceful: bool) {
        if graceful && !self.left.load(Ordering::Acquire) {
            let leader = {
                let current = self.current.read().unwrap();
                let suspicion = current.table.effective_suspicion();
                current
                    .view
                    .leader_rank(&suspicion)
                    .map(|rank| current.view.members[rank])
            };
            if let Some(leader) = leader {
                SenderHandle::new(self.transport.clone()).send(
                    leader,
                    ViewMessage::LeaveRequest {
                        leaver: self.local_id,
                    },
                );
                let deadline = Instant::now() + Duration::from_secs(10);
                while !self.left.load(Ordering::Acquire) && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }
        drop(self);
    }
}

fn shard_ranks(current: &CurrentView, local_id: NodeId, subgroup_id: SubgroupId) -> Option<Vec<usize>> {
    let shard = current.view.subgroup(subgroup_id)?.shard_of(local_id)?;
    Some(
        shard
            .members
            .iter()
            .filter_map(|member| current.view.rank_of(*member))
            .collect(),
    )
}

impl<T: Transport> Drop for Group<T> {
    fn drop(&mut self) {
        // The order of thread shutdown is important: producers stop before the poller that
        // feeds them, and the event bus stops last so late events still find a consumer.
        let _ = self.view_manager_shutdown.send(());
        if let Some(handle) = self.view_manager.take() {
            let _ = handle.join();
        }
        let _ = self.failure_detector_shutdown.send(());
        if let Some(handle) = self.failure_detector.take() {
            let _ = handle.join();
        }
        let _ = self.delivery_shutdown.send(());
        if let Some(handle) = self.delivery.take() {
            let _ = handle.join();
        }
        let _ = self.p2p_server_shutdown.send(());
        if let Some(handle) = self.p2p_server.take() {
            let _ = handle.join();
        }
        let _ = self.predicates_shutdown.send(());
        if let Some(handle) = self.predicates.take() {
            let _ = handle.join();
        }
        if let Some(mut persistence) = self.persistence.take() {
            persistence.shutdown(true);
        }
        let _ = self.poller_shutdown.send(());
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
        let _ = self.event_bus_shutdown.send(());
        if let Some(handle) = self.event_bus.take() {
            let _ = handle.join();
        }
    }
}

/// A handle onto one subgroup, cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct SubgroupHandle<T: Transport> {
    local_id: NodeId,
    type_id: SubgroupTypeId,
    subgroup_index: u32,
    transport: T,
    current: SharedCurrentView,
    groups: Arc<Mutex<ActiveGroups>>,
    reply_router: Arc<ReplyRouter>,
    hlc: Arc<Mutex<Hlc>>,
    next_request: Arc<AtomicU64>,
    left: Arc<AtomicBool>,
    event_publisher: Option<Sender<Event>>,
}

impl<T: Transport> SubgroupHandle<T> {
    fn resolve(&self) -> Result<(SubgroupId, Vec<NodeId>, ViewId), SendError> {
        let current = self.current.read().unwrap();
        let info = current
            .view
            .subgroup_by_type(self.type_id, self.subgroup_index)
            .ok_or(SendError::SubgroupInactive)?;
        if !info.active {
            return Err(SendError::SubgroupInactive);
        }
        let shard = info
            .shard_of(self.local_id)
            .ok_or(SendError::NotAShardMember)?;
        Ok((
            info.subgroup_id,
            shard.members.clone(),
            current.view.view_id,
        ))
    }

    /// Send `size` bytes of raw payload into the subgroup's total order. The filled bytes reach
    /// every shard member's stability callback, in the same order everywhere.
    pub fn send(&self, size: usize, fill: impl FnOnce(&mut [u8])) -> Result<(), SendError> {
        self.send_kind(PayloadKind::Raw, size, fill)?;
        Ok(())
    }

    fn send_kind(
        &self,
        kind: PayloadKind,
        size: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<(), SendError> {
        if self.left.load(Ordering::Acquire) {
            return Err(SendError::ViewChanged);
        }
        let (subgroup_id, shard_members, _) = self.resolve()?;

        let payload = {
            let table = self.current.read().unwrap().table.clone();
            let hlc = {
                let mut hlc = self.hlc.lock().unwrap();
                *hlc = hlc.advance();
                *hlc
            };

            let mut groups = self.groups.lock().unwrap();
            let group = groups
                .groups
                .get_mut(&subgroup_id)
                .ok_or(SendError::NotAShardMember)?;
            group.send(&table, hlc, kind, size, fill)?
        };

        let peers: Vec<NodeId> = shard_members
            .into_iter()
            .filter(|member| *member != self.local_id)
            .collect();
        let msg_id = payload.msg_id;
        let size = payload.body.len();
        SenderHandle::new(self.transport.clone()).send_to(&peers, payload);
        StatusPusher::new(self.transport.clone(), self.current.clone(), self.local_id).push(
            &ColumnSet::multicast(subgroup_id),
            PushDest::ShardPeers(subgroup_id),
        );

        Event::Send(SendEvent {
            timestamp: SystemTime::now(),
            subgroup_id,
            msg_id,
            size,
        })
        .publish(&self.event_publisher);
        Ok(())
    }

    /// Issue an ordered query: the call is totally ordered with every other message of the
    /// subgroup, executed by every shard member through the object's method table, and each
    /// member's reply is aggregated into the returned handle.
    pub fn ordered_send<A, R>(&self, opcode: u64, args: &A) -> Result<QueryResults<R>, SendError>
    where
        A: BorshSerialize,
        R: BorshDeserialize,
    {
        let (_, shard_members, _) = self.resolve()?;
        let request_id = self.alloc_request();
        let (reply_sender, reply_receiver) = mpsc::channel();
        self.reply_router.register(request_id, reply_sender);

        let call = OrderedCall {
            opcode,
            request_id,
            caller: self.local_id,
            args: args.try_to_vec().expect("query arguments serialize"),
        };
        let body = call.try_to_vec().expect("an ordered call serializes");
        if let Err(err) = self.send_kind(PayloadKind::Call, body.len(), |buffer| {
            buffer.copy_from_slice(&body)
        }) {
            self.reply_router.deregister(request_id);
            return Err(err);
        }

        Ok(QueryResults::registered(
            reply_receiver,
            shard_members,
            self.reply_router.clone(),
            request_id,
        ))
    }

    /// Issue a point-to-point query to one shard member, bypassing the total order.
    pub fn p2p_send<A, R>(
        &self,
        target: NodeId,
        opcode: u64,
        args: &A,
    ) -> Result<QueryResults<R>, SendError>
    where
        A: BorshSerialize,
        R: BorshDeserialize,
    {
        let current = self.current.read().unwrap();
        let info = current
            .view
            .subgroup_by_type(self.type_id, self.subgroup_index)
            .ok_or(SendError::SubgroupInactive)?;
        if !info.shards.iter().any(|shard| shard.contains(target)) {
            return Err(SendError::NotAShardMember);
        }
        let subgroup_id = info.subgroup_id;
        drop(current);

        let request_id = self.alloc_request();
        let (reply_sender, reply_receiver) = mpsc::channel();
        self.reply_router.register(request_id, reply_sender);

        SenderHandle::new(self.transport.clone()).send(
            target,
            P2pMessage::Request {
                subgroup_id,
                request_id,
                opcode,
                args: args.try_to_vec().expect("query arguments serialize"),
            },
        );
        Ok(QueryResults::registered(
            reply_receiver,
            vec![target],
            self.reply_router.clone(),
            request_id,
        ))
    }

    fn alloc_request(&self) -> RequestId {
        RequestId::new(self.next_request.fetch_add(1, Ordering::AcqRel))
    }
}

/// A connection into the group from a process that is not a member: can issue point-to-point
/// queries against subgroup members and receive notifications, but cannot send into the total
/// order.
pub struct ExternalCaller<T: Transport> {
    local_id: NodeId,
    transport: T,
    reply_router: Arc<ReplyRouter>,
    notifications: Arc<Mutex<NotificationSupport>>,
    next_request: AtomicU64,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
}

impl<T: Transport> ExternalCaller<T> {
    /// Connect to the group through the given member contacts.
    pub fn connect(local_id: NodeId, mut transport: T, contacts: &[NodeId]) -> ExternalCaller<T> {
        let mut members = contacts.to_vec();
        members.push(local_id);
        transport.init_members(&members);

        let reply_router = Arc::new(ReplyRouter::new());
        let notifications = Arc::new(Mutex::new(NotificationSupport::new()));
        let (poller_shutdown, shutdown_receiver) = mpsc::channel();

        let poller = {
            let reply_router = reply_router.clone();
            let notifications = notifications.clone();
            let mut transport = transport.clone();
            thread::Builder::new()
                .name("external_poller".to_string())
                .spawn(move || loop {
                    match shutdown_receiver.try_recv() {
                        Ok(()) => return,
                        Err(mpsc::TryRecvError::Empty) => (),
                        Err(mpsc::TryRecvError::Disconnected) => return,
                    }
                    match transport.recv() {
                        Some((origin, Message::P2p(P2pMessage::Reply { request_id, outcome }))) => {
                            reply_router.route(request_id, origin, outcome);
                        }
                        Some((_, Message::Notification(notification))) => {
                            notifications.lock().unwrap().notify(&notification);
                        }
                        Some(_) => (),
                        None => thread::yield_now(),
                    }
                })
                .expect("the external_poller thread can be spawned")
        };

        ExternalCaller {
            local_id,
            transport,
            reply_router,
            notifications,
            next_request: AtomicU64::new(0),
            poller: Some(poller),
            poller_shutdown,
        }
    }

    /// Issue a point-to-point query against a member known to run the subgroup.
    pub fn p2p_query<A, R>(
        &self,
        target: NodeId,
        subgroup_id: SubgroupId,
        opcode: u64,
        args: &A,
    ) -> QueryResults<R>
    where
        A: BorshSerialize,
        R: BorshDeserialize,
    {
        let request_id = RequestId::new(self.next_request.fetch_add(1, Ordering::AcqRel));
        let (reply_sender, reply_receiver) = mpsc::channel();
        self.reply_router.register(request_id, reply_sender);
        SenderHandle::new(self.transport.clone()).send(
            target,
            P2pMessage::Request {
                subgroup_id,
                request_id,
                opcode,
                args: args.try_to_vec().expect("query arguments serialize"),
            },
        );
        QueryResults::registered(reply_receiver, vec![target], self.reply_router.clone(), request_id)
    }

    pub fn add_notification_handler(
        &self,
        handler: impl Fn(&NotificationMessage) + Send + 'static,
    ) {
        self.notifications
            .lock()
            .unwrap()
            .add_notification_handler(handler);
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }
}

impl<T: Transport> Drop for ExternalCaller<T> {
    fn drop(&mut self) {
        let _ = self.poller_shutdown.send(());
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
    }
}
