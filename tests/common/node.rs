//! One test node: a running [`Group`] over the mock transport, with a recorder wired into
//! every user callback.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use ed25519_dalek::SigningKey;
use flock_rs::{
    config::Configuration,
    dispatcher::UserMessageCallbacks,
    group::{Group, GroupSpec, JoinError, Membership, SubgroupHandle},
    keys::PublicKeyStore,
    log_store::LogStore,
    multicast::SendError,
    rpc::QueryError,
    types::{
        basic::{MessageId, NodeId, PayloadSize, SubgroupId, SubgroupTypeId, Version, WindowSize},
        view::{one_subgroup_per_type, LayoutFn},
    },
};

use crate::common::{
    counter::{counter_type, ADD, READ},
    transport::TransportStub,
    wait_until,
};

/// Everything the user callbacks observed on one node.
#[derive(Default)]
pub(crate) struct Recorder {
    pub stable: Mutex<Vec<(SubgroupId, NodeId, MessageId, Version)>>,
    pub local_persists: AtomicU64,
    pub global_persists: AtomicU64,
    pub global_verifies: AtomicU64,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    fn callbacks(self: &Arc<Recorder>) -> UserMessageCallbacks {
        let on_stable = self.clone();
        let on_local = self.clone();
        let on_global = self.clone();
        let on_verified = self.clone();
        UserMessageCallbacks {
            global_stability: Some(Box::new(move |subgroup, sender, msg_id, _body, version| {
                on_stable
                    .stable
                    .lock()
                    .unwrap()
                    .push((subgroup, sender, msg_id, version));
            })),
            local_persistence: Some(Box::new(move |_, _| {
                on_local.local_persists.fetch_add(1, Ordering::SeqCst);
            })),
            global_persistence: Some(Box::new(move |_, _| {
                on_global.global_persists.fetch_add(1, Ordering::SeqCst);
            })),
            global_verified: Some(Box::new(move |_, _| {
                on_verified.global_verifies.fetch_add(1, Ordering::SeqCst);
            })),
        }
    }

    /// The stable delivery order of one subgroup, as (sender, msg_id) pairs.
    pub(crate) fn deliveries(&self, subgroup: SubgroupId) -> Vec<(NodeId, MessageId)> {
        self.stable
            .lock()
            .unwrap()
            .iter()
            .filter(|(delivered_subgroup, _, _, _)| *delivered_subgroup == subgroup)
            .map(|(_, sender, msg_id, _)| (*sender, *msg_id))
            .collect()
    }
}

pub(crate) struct NodeOptions {
    pub suspicion_timeout: Duration,
    pub window: u32,
    pub num_counter_types: u32,
    pub layout: Option<LayoutFn>,
    pub signing: Option<(SigningKey, PublicKeyStore)>,
}

impl Default for NodeOptions {
    fn default() -> NodeOptions {
        NodeOptions {
            suspicion_timeout: Duration::from_millis(600),
            window: 64,
            num_counter_types: 1,
            layout: None,
            signing: None,
        }
    }
}

pub(crate) struct Node {
    pub id: NodeId,
    pub group: Group<TransportStub>,
    pub recorder: Arc<Recorder>,
}

impl Node {
    pub(crate) fn start(
        id: u64,
        transport: TransportStub,
        membership: Membership,
        log_store: impl LogStore,
        options: NodeOptions,
    ) -> Result<Node, JoinError> {
        let configuration = Configuration::builder()
            .local_id(NodeId::new(id))
            .max_payload_size(PayloadSize::new(8192))
            .window_size(WindowSize::new(options.window))
            .heartbeat_interval(Duration::from_millis(20))
            .suspicion_timeout(options.suspicion_timeout)
            .signed_log(options.signing.is_some())
            .build();
        let recorder = Recorder::new();
        let layout = options
            .layout
            .unwrap_or_else(|| one_subgroup_per_type(options.num_counter_types));
        let object_types = (0..options.num_counter_types)
            .map(|_| counter_type())
            .collect();

        let builder = GroupSpec::builder()
            .configuration(configuration)
            .transport(transport)
            .log_store(log_store)
            .membership(membership)
            .object_types(object_types)
            .layout(layout)
            .callbacks(recorder.callbacks());
        let group = match options.signing {
            Some((signing_key, public_keys)) => builder
                .signing_key(signing_key)
                .public_keys(public_keys)
                .build()
                .join()?,
            None => builder.build().join()?,
        };

        Ok(Node {
            id: NodeId::new(id),
            group,
            recorder,
        })
    }

    /// A handle onto the first subgroup of counter type 0.
    pub(crate) fn handle(&self) -> SubgroupHandle<TransportStub> {
        self.group.get_subgroup(SubgroupTypeId::new(0), 0)
    }

    pub(crate) fn subgroup_id(&self) -> SubgroupId {
        self.group
            .current_view()
            .subgroup_by_type(SubgroupTypeId::new(0), 0)
            .expect("the counter subgroup exists")
            .subgroup_id
    }

    /// Submit an increment through the total order and wait for every shard member's reply.
    pub(crate) fn add(&self, amount: u64) {
        let results = self
            .handle()
            .ordered_send::<u64, u64>(ADD, &amount)
            .expect("the ordered send is accepted");
        results
            .wait_timeout(Duration::from_secs(20))
            .expect("every shard member answers the increment");
    }

    /// Read the counter value on this node, bypassing the total order.
    pub(crate) fn read_counter(&self) -> u64 {
        let results = self
            .handle()
            .p2p_send::<(), u64>(self.id, READ, &())
            .expect("the local read is accepted");
        let replies = results
            .wait_timeout(Duration::from_secs(10))
            .expect("the local replica answers the read");
        replies[&self.id]
    }

    /// Read the counter value on a specific shard member.
    #[allow(dead_code)]
    pub(crate) fn read_counter_on(&self, target: NodeId) -> u64 {
        let results = self
            .handle()
            .p2p_send::<(), u64>(target, READ, &())
            .expect("the read is accepted");
        let replies = results
            .wait_timeout(Duration::from_secs(10))
            .expect("the target answers the read");
        replies[&target]
    }

    /// Send a raw payload of `size` bytes filled with `pattern`, retrying through backpressure.
    pub(crate) fn send_raw(&self, size: usize, pattern: u8) {
        wait_until(Duration::from_secs(20), "a raw send is accepted", || {
            match self.handle().send(size, |buffer| buffer.fill(pattern)) {
                Ok(()) => true,
                Err(SendError::Backpressure) => false,
                Err(err) => panic!("raw send failed: {err:?}"),
            }
        });
    }
}

/// Ignore `QueryError::ViewChanged`-shaped failures while asserting everything else, for calls
/// issued concurrently with reconfiguration.
#[allow(dead_code)]
pub(crate) fn tolerate_view_change<R: std::fmt::Debug>(
    result: Result<R, QueryError<R>>,
) -> Option<R> {
    match result {
        Ok(value) => Some(value),
        Err(QueryError::ViewChanged { .. }) => None,
        Err(err) => panic!("query failed: {err:?}"),
    }
}
