/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust library for building reliable, totally ordered, virtually synchronous process groups
//! whose subgroups replicate state machines with optionally signed durable logs.
//!
//! ## Overview
//!
//! A [`Group`](group::Group) is a set of processes that agree, at all times, on an installed
//! membership *view*, and within a view exchange multicast messages that every member delivers
//! in the same total order. The group is partitioned into overlapping *subgroups*, each running
//! a user-defined [replicated object](replicated::ReplicatedObject); a message that every shard
//! member has delivered becomes *stable*, is assigned a monotone *version*, is applied to the
//! object through its [method table](replicated::MethodTable), and is persisted (and, when
//! signing is enabled, chained into a per-subgroup signature chain that members verify against
//! each other).
//!
//! Three subsystems carry these guarantees, coupled through one
//! [status table](status_table::StatusTable) of monotone progress columns:
//!
//! - the [view manager](view_manager) agrees on memberships and hands pending messages across
//!   view boundaries virtually synchronously,
//! - the [multicast group](multicast) orders and delivers messages within a view, and
//! - the [persistence manager](persistence) makes stable versions durable and propagates the
//!   persisted/verified watermarks back through the table.
//!
//! The transport under all of this is pluggable: implement [`Transport`](transport::Transport)
//! over any reliable, in-order point-to-point byte channel. The durable log backend is
//! pluggable the same way through [`LogStore`](log_store::LogStore).

pub mod config;

pub mod dispatcher;

pub(crate) mod event_bus;

pub mod events;

pub(crate) mod failure_detector;

pub mod group;

pub mod keys;

pub mod log_store;

pub mod logging;

pub mod messages;

pub mod multicast;

pub mod notification;

pub(crate) mod persistence;

pub mod replicated;

pub mod rpc;

pub mod status_table;

pub mod transport;

pub mod types;

pub(crate) mod view_manager;

// Re-exports of the types that appear in almost every program built on the library.
pub use config::Configuration;
pub use dispatcher::UserMessageCallbacks;
pub use group::{ExternalCaller, Group, GroupSpec, JoinError, Membership, SubgroupHandle};
pub use multicast::SendError;
pub use notification::{NotificationMessage, NotificationSupport};
pub use replicated::{MethodTable, ObjectType, ReplicatedObject};
pub use rpc::{QueryError, QueryResults};
pub use transport::Transport;
