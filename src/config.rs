/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration of a group member.
//!
//! [`Configuration`] collects every tunable of the library. Construct it with the builder:
//!
//! ```
//! use std::time::Duration;
//! use flock_rs::config::Configuration;
//! use flock_rs::types::basic::{NodeId, PayloadSize, WindowSize};
//!
//! let configuration = Configuration::builder()
//!     .local_id(NodeId::new(10))
//!     .max_payload_size(PayloadSize::new(4096))
//!     .window_size(WindowSize::new(16))
//!     .heartbeat_interval(Duration::from_millis(50))
//!     .suspicion_timeout(Duration::from_millis(1500))
//!     .build();
//! ```

use std::{path::PathBuf, time::Duration};
use typed_builder::TypedBuilder;

use crate::types::basic::{NodeId, PayloadSize, WindowSize};

#[derive(Clone, TypedBuilder)]
pub struct Configuration {
    /// This process's node id. Must be unique across the lifetime of the cluster.
    pub local_id: NodeId,

    /// Upper bound on the payload of one multicast message.
    pub max_payload_size: PayloadSize,

    /// Messages a sender may have outstanding before sends fail with backpressure.
    pub window_size: WindowSize,

    /// How often this member bumps its heartbeat column.
    pub heartbeat_interval: Duration,

    /// How stale a peer's heartbeat may look before this member suspects it.
    pub suspicion_timeout: Duration,

    /// Sign every persisted version, chaining each signature over the previous one.
    #[builder(default = false)]
    pub signed_log: bool,

    /// Raw 32-byte Ed25519 seed file. Required when `signed_log` is set and no in-process
    /// signing key is supplied at join.
    #[builder(default, setter(strip_option))]
    pub private_key_file: Option<PathBuf>,

    /// Directory of `<node_id>.pub` verifying-key files for every node in the cluster.
    #[builder(default, setter(strip_option))]
    pub public_key_dir: Option<PathBuf>,

    /// Capacity of the membership-change ring in each member's status row. A joiner that needs
    /// an entry the ring has overwritten must fall back to full state transfer.
    #[builder(default = 1024)]
    pub changes_ring_capacity: usize,

    /// Emit the built-in CSV logging handler for every event, in addition to any user handlers.
    #[builder(default = false)]
    pub log_events: bool,
}
