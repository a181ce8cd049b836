/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reply plumbing for ordered and point-to-point queries: the [`QueryResults`] handle a caller
//! holds while replies trickle in, and the [`ReplyRouter`] that matches inbound replies to
//! outstanding handles.
//!
//! An ordered query is answered once by every member of the target shard; a point-to-point
//! query is answered once by its single target. Either way the caller may block for the full
//! reply set or poll reply by reply. Cancellation is view-scoped: when the view a query was
//! issued in is superseded, every outstanding handle completes immediately with
//! [`QueryError::ViewChanged`] carrying whatever replies had arrived.

use borsh::BorshDeserialize;
use std::{
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
    sync::{
        mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::messages::ReplyOutcome;
use crate::types::basic::{NodeId, RequestId};

/// Why a query completed without its full reply set.
#[derive(Debug)]
pub enum QueryError<R> {
    /// The view the query was issued in was superseded. Carries the replies that had arrived;
    /// the caller re-issues in the new view if it still wants the rest.
    ViewChanged { partial: BTreeMap<NodeId, R> },
    /// The target did not answer within the caller's deadline (or was already unreachable at
    /// send time).
    PeerUnreachable,
    /// A responder had no handler for the opcode or rejected the arguments.
    Rejected { responder: NodeId, reason: String },
    /// A reply arrived but did not decode as `R`.
    MalformedReply { responder: NodeId },
}

pub(crate) enum ReplyEvent {
    Reply(NodeId, ReplyOutcome),
    ViewChanged,
}

/// A future-like handle over the replies to one query.
pub struct QueryResults<R> {
    receiver: Receiver<ReplyEvent>,
    expected: Vec<NodeId>,
    replies: BTreeMap<NodeId, R>,
    /// Deregistered on drop, so the router does not accumulate entries for handles whose
    /// callers lost interest.
    registration: Option<(Arc<ReplyRouter>, RequestId)>,
    _marker: PhantomData<R>,
}

impl<R> Drop for QueryResults<R> {
    fn drop(&mut self) {
        if let Some((router, request_id)) = self.registration.take() {
            router.deregister(request_id);
        }
    }
}

impl<R: BorshDeserialize> QueryResults<R> {
    pub(crate) fn new(receiver: Receiver<ReplyEvent>, expected: Vec<NodeId>) -> QueryResults<R> {
        QueryResults {
            receiver,
            expected,
            replies: BTreeMap::new(),
            registration: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn registered(
        receiver: Receiver<ReplyEvent>,
        expected: Vec<NodeId>,
        router: Arc<ReplyRouter>,
        request_id: RequestId,
    ) -> QueryResults<R> {
        let mut results = QueryResults::new(receiver, expected);
        results.registration = Some((router, request_id));
        results
    }

    /// The responders this handle is still waiting on.
    pub fn outstanding(&self) -> Vec<NodeId> {
        self.expected
            .iter()
            .copied()
            .filter(|peer| !self.replies.contains_key(peer))
            .collect()
    }

    /// The replies that have arrived so far.
    pub fn partial(&self) -> &BTreeMap<NodeId, R> {
        &self.replies
    }

    fn absorb(&mut self, event: ReplyEvent) -> Result<(), QueryError<R>> {
        match event {
            ReplyEvent::Reply(responder, ReplyOutcome::Ok(bytes)) => {
                let reply = R::try_from_slice(&bytes)
                    .map_err(|_| QueryError::MalformedReply { responder })?;
                self.replies.insert(responder, reply);
                Ok(())
            }
            ReplyEvent::Reply(responder, ReplyOutcome::Rejected(reason)) => {
                Err(QueryError::Rejected { responder, reason })
            }
            ReplyEvent::ViewChanged => Err(QueryError::ViewChanged {
                partial: std::mem::take(&mut self.replies),
            }),
        }
    }

    /// Block until every expected responder has answered, or the view changes.
    pub fn wait(mut self) -> Result<BTreeMap<NodeId, R>, QueryError<R>> {
        while self.replies.len() < self.expected.len() {
            match self.receiver.recv() {
                Ok(event) => self.absorb(event)?,
                // The router dropped us without a view change: the group is shutting down.
                Err(_) => {
                    return Err(QueryError::ViewChanged {
                        partial: std::mem::take(&mut self.replies),
                    })
                }
            }
        }
        Ok(std::mem::take(&mut self.replies))
    }

    /// Like [`wait`](Self::wait), but gives up with [`QueryError::PeerUnreachable`] if the full
    /// reply set has not arrived within `timeout`.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<BTreeMap<NodeId, R>, QueryError<R>> {
        let deadline = Instant::now() + timeout;
        while self.replies.len() < self.expected.len() {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(QueryError::PeerUnreachable)?;
            match self.receiver.recv_timeout(remaining) {
                Ok(event) => self.absorb(event)?,
                Err(RecvTimeoutError::Timeout) => return Err(QueryError::PeerUnreachable),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(QueryError::ViewChanged {
                        partial: std::mem::take(&mut self.replies),
                    })
                }
            }
        }
        Ok(std::mem::take(&mut self.replies))
    }

    /// Absorb any replies that have already arrived without blocking. Returns whether the full
    /// reply set is now present.
    pub fn try_poll(&mut self) -> Result<bool, QueryError<R>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => self.absorb(event)?,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    return Ok(self.replies.len() == self.expected.len())
                }
            }
        }
    }
}

/// Matches inbound replies to the outstanding query handles that are waiting for them.
pub(crate) struct ReplyRouter {
    outstanding: Mutex<HashMap<RequestId, Sender<ReplyEvent>>>,
}

impl ReplyRouter {
    pub(crate) fn new() -> ReplyRouter {
        ReplyRouter {
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, request_id: RequestId, sender: Sender<ReplyEvent>) {
        self.outstanding.lock().unwrap().insert(request_id, sender);
    }

    pub(crate) fn deregister(&self, request_id: RequestId) {
        self.outstanding.lock().unwrap().remove(&request_id);
    }

    /// Route one inbound reply. A reply for a handle the caller has already dropped is
    /// discarded, and the dead registration is removed.
    pub(crate) fn route(&self, request_id: RequestId, responder: NodeId, outcome: ReplyOutcome) {
        let mut outstanding = self.outstanding.lock().unwrap();
        if let Some(sender) = outstanding.get(&request_id) {
            if sender.send(ReplyEvent::Reply(responder, outcome)).is_err() {
                outstanding.remove(&request_id);
            }
        }
    }

    /// Complete every outstanding handle with `ViewChanged`. Called under the view-install
    /// barrier.
    pub(crate) fn complete_all_view_changed(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        for (_, sender) in outstanding.drain() {
            let _ = sender.send(ReplyEvent::ViewChanged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use borsh::BorshSerialize;
    use std::sync::mpsc;

    #[test]
    fn wait_collects_all_expected_replies() {
        let (sender, receiver) = mpsc::channel();
        let results: QueryResults<u64> =
            QueryResults::new(receiver, vec![NodeId::new(1), NodeId::new(2)]);

        sender
            .send(ReplyEvent::Reply(
                NodeId::new(2),
                ReplyOutcome::Ok(7u64.try_to_vec().unwrap()),
            ))
            .unwrap();
        sender
            .send(ReplyEvent::Reply(
                NodeId::new(1),
                ReplyOutcome::Ok(7u64.try_to_vec().unwrap()),
            ))
            .unwrap();

        let replies = results.wait().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[&NodeId::new(1)], 7);
    }

    #[test]
    fn view_change_completes_with_partial_replies() {
        let (sender, receiver) = mpsc::channel();
        let results: QueryResults<u64> =
            QueryResults::new(receiver, vec![NodeId::new(1), NodeId::new(2)]);

        sender
            .send(ReplyEvent::Reply(
                NodeId::new(1),
                ReplyOutcome::Ok(3u64.try_to_vec().unwrap()),
            ))
            .unwrap();
        sender.send(ReplyEvent::ViewChanged).unwrap();

        match results.wait() {
            Err(QueryError::ViewChanged { partial }) => {
                assert_eq!(partial.len(), 1);
                assert_eq!(partial[&NodeId::new(1)], 3);
            }
            other => panic!("expected ViewChanged, got {other:?}"),
        }
    }

    #[test]
    fn router_discards_replies_for_dropped_handles() {
        let router = ReplyRouter::new();
        let (sender, receiver) = mpsc::channel();
        router.register(RequestId::new(9), sender);
        drop(receiver);

        router.route(
            RequestId::new(9),
            NodeId::new(1),
            ReplyOutcome::Ok(Vec::new()),
        );
        assert!(router.outstanding.lock().unwrap().is_empty());
    }
}
