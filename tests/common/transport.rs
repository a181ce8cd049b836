//! A "mock" (totally local) transport for passing messages between group members in one
//! process, with a shared fault plan for failure and partition tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use flock_rs::messages::Message;
use flock_rs::transport::Transport;
use flock_rs::types::basic::NodeId;

/// Faults injected into a mock network. Shared by every stub of the network.
#[derive(Default)]
pub(crate) struct FaultPlan {
    /// Fully severed ordered pairs: nothing flows from `.0` to `.1`.
    cut: HashSet<(NodeId, NodeId)>,
    /// Ordered pairs with a bounded multicast budget: once `0`, further multicast payloads
    /// from `.0` to `.1` are dropped (status deltas and protocol messages still flow, the way
    /// a crashed sender's already-pushed columns remain visible).
    multicast_budget: HashMap<(NodeId, NodeId), usize>,
}

impl FaultPlan {
    /// Sever both directions between every pair drawn from `left` × `right`.
    pub(crate) fn partition(&mut self, left: &[NodeId], right: &[NodeId]) {
        for a in left {
            for b in right {
                self.cut.insert((*a, *b));
                self.cut.insert((*b, *a));
            }
        }
    }

    pub(crate) fn heal_all(&mut self) {
        self.cut.clear();
        self.multicast_budget.clear();
    }

    /// Allow only `budget` more multicast payloads from `from` to `to`.
    pub(crate) fn limit_multicast(&mut self, from: NodeId, to: NodeId, budget: usize) {
        self.multicast_budget.insert((from, to), budget);
    }

    fn allows(&mut self, from: NodeId, to: NodeId, message: &Message) -> bool {
        if self.cut.contains(&(from, to)) {
            return false;
        }
        if let Message::Multicast(_) = message {
            if let Some(budget) = self.multicast_budget.get_mut(&(from, to)) {
                if *budget == 0 {
                    return false;
                }
                *budget -= 1;
            }
        }
        true
    }
}

/// A transport stub that passes messages to and from nodes using channels.
///
/// ## Limitations
///
/// `TransportStub`'s implementations of `init_members` and `update_members` are no-ops: the set
/// of reachable peers is fixed when [`mock_transport`] builds the network. Tests that
/// dynamically add members (joins, external callers) must plan ahead and create the network
/// with every `NodeId` that will ever participate.
#[derive(Clone)]
pub(crate) struct TransportStub {
    my_id: NodeId,
    all_peers: HashMap<NodeId, Sender<(NodeId, Message)>>,
    inbox: Arc<Mutex<Receiver<(NodeId, Message)>>>,
    faults: Arc<Mutex<FaultPlan>>,
}

impl Transport for TransportStub {
    fn init_members(&mut self, _: &[NodeId]) {}

    fn update_members(&mut self, _: &[NodeId]) {}

    fn send(&mut self, peer: NodeId, message: Message) {
        if !self.faults.lock().unwrap().allows(self.my_id, peer, &message) {
            return;
        }
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send((self.my_id, message));
        }
    }

    fn broadcast(&mut self, message: Message) {
        let peers: Vec<NodeId> = self.all_peers.keys().copied().collect();
        for peer in peers {
            self.send(peer, message.clone());
        }
    }

    fn recv(&mut self) -> Option<(NodeId, Message)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(origin_message) => Some(origin_message),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Create a vector of `TransportStub`s connecting the provided peers (in order), plus the
/// shared fault plan.
pub(crate) fn mock_transport(peers: &[NodeId]) -> (Vec<TransportStub>, Arc<Mutex<FaultPlan>>) {
    let faults = Arc::new(Mutex::new(FaultPlan::default()));
    let mut all_peers = HashMap::new();
    let peers_and_inboxes: Vec<(NodeId, Receiver<(NodeId, Message)>)> = peers
        .iter()
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(*peer, sender);
            (*peer, receiver)
        })
        .collect();

    let stubs = peers_and_inboxes
        .into_iter()
        .map(|(my_id, inbox)| TransportStub {
            my_id,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            faults: faults.clone(),
        })
        .collect();
    (stubs, faults)
}
