/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! One-way notifications from group members to external clients.
//!
//! A subgroup member can [`notify`](NotificationSupport::notify) an external client that has
//! connected through the transport; the client's registered handlers run on arrival. The
//! `message_type` field is opaque to the library: applications define and interpret it however
//! they want.
//!
//! Delivery is best-effort point-to-point: a notification in flight while the target client
//! disconnects is dropped, and the drop is visible only in the sender's debug logs.

use borsh::{BorshDeserialize, BorshSerialize};

/// A notification body, tagged with an application-defined type number.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct NotificationMessage {
    /// A number identifying the kind of notification. Defined and interpreted by the
    /// application.
    pub message_type: u64,
    pub body: Vec<u8>,
}

impl NotificationMessage {
    pub fn new(message_type: u64, body: Vec<u8>) -> NotificationMessage {
        NotificationMessage { message_type, body }
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// A registry of notification handlers, held by external callers (and by members that want to
/// observe the notifications they relay).
#[derive(Default)]
pub struct NotificationSupport {
    handlers: Vec<Box<dyn Fn(&NotificationMessage) + Send>>,
}

impl NotificationSupport {
    pub fn new() -> NotificationSupport {
        NotificationSupport::default()
    }

    pub fn add_notification_handler(
        &mut self,
        handler: impl Fn(&NotificationMessage) + Send + 'static,
    ) {
        self.handlers.push(Box::new(handler));
    }

    /// Run every registered handler on `message`, in registration order.
    pub fn notify(&self, message: &NotificationMessage) {
        for handler in &self.handlers {
            handler(message);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    #[test]
    fn handlers_run_in_registration_order() {
        let seen = Arc::new(AtomicU64::new(0));
        let mut support = NotificationSupport::new();

        let first = seen.clone();
        support.add_notification_handler(move |_| {
            first.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).ok();
        });
        let second = seen.clone();
        support.add_notification_handler(move |msg| {
            second
                .compare_exchange(1, msg.message_type, Ordering::SeqCst, Ordering::SeqCst)
                .ok();
        });

        support.notify(&NotificationMessage::new(7, vec![1, 2, 3]));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
