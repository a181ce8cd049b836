/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Heartbeat-driven failure suspicion.
//!
//! Each member bumps its own heartbeat column every `heartbeat_interval` and pushes it to all
//! peers. The detector thread remembers, per peer row, when it last observed the heartbeat
//! change; a peer whose heartbeat has not moved within `suspicion_timeout` gets its bit set in
//! the local row's suspicion column, which is pushed so the view manager (on every member) sees
//! it. Suspicion is monotone within a view: bits set are never cleared, and a suspected member
//! that is in fact alive rejoins as a new member after the view excluding it installs.

use std::{
    collections::HashMap,
    sync::mpsc::{Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crate::events::{Event, SuspectEvent};
use crate::status_table::ColumnSet;
use crate::transport::{PushDest, StatusPusher, Transport};
use crate::types::basic::{NodeId, ViewId};
use crate::view_manager::SharedCurrentView;

struct ObservedHeartbeat {
    value: u64,
    changed_at: Instant,
}

/// Spawn the failure detector thread.
pub(crate) fn start_failure_detector<T: Transport>(
    current: SharedCurrentView,
    mut pusher: StatusPusher<T>,
    heartbeat_interval: Duration,
    suspicion_timeout: Duration,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("failure_detector".to_string())
        .spawn(move || {
            let mut observed: HashMap<NodeId, ObservedHeartbeat> = HashMap::new();
            let mut observed_view = ViewId::init();
            let mut last_beat = Instant::now() - heartbeat_interval;

            loop {
                match shutdown_signal.try_recv() {
                    Ok(()) => return,
                    Err(TryRecvError::Empty) => (),
                    Err(TryRecvError::Disconnected) => {
                        panic!("failure_detector thread disconnected from main thread")
                    }
                }

                if last_beat.elapsed() >= heartbeat_interval {
                    last_beat = Instant::now();

                    let mut newly_suspected = Vec::new();
                    {
                        let current = current.read().unwrap();
                        // A fresh view resets observation ages: peers get a full timeout to
                        // produce their first heartbeat of the view.
                        if current.view.view_id != observed_view {
                            observed_view = current.view.view_id;
                            observed.clear();
                        }

                        current.table.bump_heartbeat();

                        let my_rank = current.table.my_rank();
                        for (rank, member) in current.view.members.iter().enumerate() {
                            if rank == my_rank {
                                continue;
                            }
                            let heartbeat = current.table.row(rank).heartbeat();
                            let entry =
                                observed.entry(*member).or_insert_with(|| ObservedHeartbeat {
                                    value: heartbeat,
                                    changed_at: Instant::now(),
                                });
                            if heartbeat != entry.value {
                                entry.value = heartbeat;
                                entry.changed_at = Instant::now();
                            } else if entry.changed_at.elapsed() >= suspicion_timeout
                                && !current.table.local_row().suspects(rank)
                            {
                                current.table.set_suspected(rank);
                                newly_suspected.push(*member);
                            }
                        }
                    }

                    pusher.push(&ColumnSet::heartbeat(), PushDest::AllPeers);
                    if !newly_suspected.is_empty() {
                        pusher.push(&ColumnSet::suspicion(), PushDest::AllPeers);
                        for suspect in newly_suspected {
                            log::warn!("suspecting {suspect}: heartbeat stale");
                            Event::Suspect(SuspectEvent {
                                timestamp: SystemTime::now(),
                                suspect,
                            })
                            .publish(&event_publisher);
                        }
                    }
                }

                thread::sleep(heartbeat_interval.min(Duration::from_millis(10)));
            }
        })
        .expect("the failure_detector thread can be spawned")
}
