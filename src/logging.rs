/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via
//! [`Configuration::log_events`](crate::config::Configuration::log_events).
//!
//! The library logs through the [log](https://docs.rs/log/latest/log/) crate. To get these
//! messages printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two
//! values are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as
//!    constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ by event kind. For example, a stable delivery prints as:
//!
//! ```text
//! Stable, 1701329264, 0, 20, 47, 1:47
//! ```
//!
//! where the values after the timestamp are the subgroup id, the sender's node id, the message
//! id, and the assigned version.

use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const INSTALL_VIEW: &str = "InstallView";
pub const PROPOSE_CHANGE: &str = "ProposeChange";
pub const COMMIT_CHANGES: &str = "CommitChanges";
pub const SUSPECT: &str = "Suspect";
pub const RAGGED_TRIM: &str = "RaggedTrim";

pub const JOIN_REQUEST: &str = "JoinRequest";
pub const START_STATE_TRANSFER: &str = "StartStateTransfer";
pub const END_STATE_TRANSFER: &str = "EndStateTransfer";

pub const SEND: &str = "Send";
pub const STABLE: &str = "Stable";

pub const LOCAL_PERSIST: &str = "LocalPersist";
pub const GLOBAL_PERSIST: &str = "GlobalPersist";
pub const GLOBAL_VERIFY: &str = "GlobalVerify";
pub const SIGNATURE_INVALID: &str = "SignatureInvalid";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for InstallViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &InstallViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                INSTALL_VIEW,
                secs_since_unix_epoch(event.timestamp),
                event.view_id,
                event.num_members
            )
        })
    }
}

impl Logger for ProposeChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ProposeChangeEvent| {
            log::info!(
                "{}, {}, {:?}, {}",
                PROPOSE_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                event.change,
                event.index
            )
        })
    }
}

impl Logger for CommitChangesEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CommitChangesEvent| {
            log::info!(
                "{}, {}, {}",
                COMMIT_CHANGES,
                secs_since_unix_epoch(event.timestamp),
                event.num_committed
            )
        })
    }
}

impl Logger for SuspectEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &SuspectEvent| {
            log::info!(
                "{}, {}, {}",
                SUSPECT,
                secs_since_unix_epoch(event.timestamp),
                event.suspect
            )
        })
    }
}

impl Logger for RaggedTrimEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &RaggedTrimEvent| {
            log::info!(
                "{}, {}, {}",
                RAGGED_TRIM,
                secs_since_unix_epoch(event.timestamp),
                event.view_id
            )
        })
    }
}

impl Logger for JoinRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &JoinRequestEvent| {
            log::info!(
                "{}, {}, {}",
                JOIN_REQUEST,
                secs_since_unix_epoch(event.timestamp),
                event.joiner
            )
        })
    }
}

impl Logger for StartStateTransferEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartStateTransferEvent| {
            log::info!(
                "{}, {}, {}",
                START_STATE_TRANSFER,
                secs_since_unix_epoch(event.timestamp),
                event.joiner
            )
        })
    }
}

impl Logger for EndStateTransferEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &EndStateTransferEvent| {
            log::info!(
                "{}, {}, {}",
                END_STATE_TRANSFER,
                secs_since_unix_epoch(event.timestamp),
                event.joiner
            )
        })
    }
}

impl Logger for SendEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &SendEvent| {
            log::debug!(
                "{}, {}, {}, {}, {}",
                SEND,
                secs_since_unix_epoch(event.timestamp),
                event.subgroup_id,
                event.msg_id,
                event.size
            )
        })
    }
}

impl Logger for StableEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StableEvent| {
            log::debug!(
                "{}, {}, {}, {}, {}, {}",
                STABLE,
                secs_since_unix_epoch(event.timestamp),
                event.subgroup_id,
                event.sender,
                event.msg_id,
                event.version
            )
        })
    }
}

impl Logger for LocalPersistEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &LocalPersistEvent| {
            log::debug!(
                "{}, {}, {}, {}",
                LOCAL_PERSIST,
                secs_since_unix_epoch(event.timestamp),
                event.subgroup_id,
                event.version
            )
        })
    }
}

impl Logger for GlobalPersistEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &GlobalPersistEvent| {
            log::debug!(
                "{}, {}, {}, {}",
                GLOBAL_PERSIST,
                secs_since_unix_epoch(event.timestamp),
                event.subgroup_id,
                event.version
            )
        })
    }
}

impl Logger for GlobalVerifyEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &GlobalVerifyEvent| {
            log::debug!(
                "{}, {}, {}, {}",
                GLOBAL_VERIFY,
                secs_since_unix_epoch(event.timestamp),
                event.subgroup_id,
                event.version
            )
        })
    }
}

impl Logger for SignatureInvalidEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &SignatureInvalidEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                SIGNATURE_INVALID,
                secs_since_unix_epoch(event.timestamp),
                event.subgroup_id,
                event.peer,
                event.version
            )
        })
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
