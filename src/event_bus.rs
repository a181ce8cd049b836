/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the other threads and passes them to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it triggers
//! the execution of the handlers defined for the contained event type, where the handlers for
//! each event type are stored in [`EventHandlers`].
//!
//! When no handlers are present in a member's instance of `EventHandlers`, this thread is not
//! started.
//!
//! ## Event handlers
//!
//! A member's instance of `EventHandlers` contains:
//! 1. The handlers provided when building the group, and
//! 2. If event logging is enabled in the [configuration](crate::config::Configuration), the
//!    default logging handlers defined in [logging](crate::logging).

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the event type.
pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the two optional handlers enabled for an event type: one user-defined handler, and
/// one logging handler from [`logging`](crate::logging) when logging is enabled.
pub(crate) struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    pub(crate) fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        if let Some(handler) = &self.user_defined_handler {
            handler(event)
        }
        if let Some(handler) = &self.logging_handler {
            handler(event)
        }
    }
}

/// The `HandlerPair` of user-defined and optional logging handlers for each event type from
/// [events](crate::events).
pub(crate) struct EventHandlers {
    pub(crate) install_view_handlers: HandlerPair<InstallViewEvent>,
    pub(crate) propose_change_handlers: HandlerPair<ProposeChangeEvent>,
    pub(crate) commit_changes_handlers: HandlerPair<CommitChangesEvent>,
    pub(crate) suspect_handlers: HandlerPair<SuspectEvent>,
    pub(crate) ragged_trim_handlers: HandlerPair<RaggedTrimEvent>,
    pub(crate) join_request_handlers: HandlerPair<JoinRequestEvent>,
    pub(crate) start_state_transfer_handlers: HandlerPair<StartStateTransferEvent>,
    pub(crate) end_state_transfer_handlers: HandlerPair<EndStateTransferEvent>,
    pub(crate) send_handlers: HandlerPair<SendEvent>,
    pub(crate) stable_handlers: HandlerPair<StableEvent>,
    pub(crate) local_persist_handlers: HandlerPair<LocalPersistEvent>,
    pub(crate) global_persist_handlers: HandlerPair<GlobalPersistEvent>,
    pub(crate) global_verify_handlers: HandlerPair<GlobalVerifyEvent>,
    pub(crate) signature_invalid_handlers: HandlerPair<SignatureInvalidEvent>,
}

impl EventHandlers {
    /// Checks whether no handlers are defined, i.e., no user handlers were registered and
    /// logging is disabled.
    pub(crate) fn is_empty(&self) -> bool {
        self.install_view_handlers.is_empty()
            && self.propose_change_handlers.is_empty()
            && self.commit_changes_handlers.is_empty()
            && self.suspect_handlers.is_empty()
            && self.ragged_trim_handlers.is_empty()
            && self.join_request_handlers.is_empty()
            && self.start_state_transfer_handlers.is_empty()
            && self.end_state_transfer_handlers.is_empty()
            && self.send_handlers.is_empty()
            && self.stable_handlers.is_empty()
            && self.local_persist_handlers.is_empty()
            && self.global_persist_handlers.is_empty()
            && self.global_verify_handlers.is_empty()
            && self.signature_invalid_handlers.is_empty()
    }

    /// Triggers the execution of both handlers (user-defined and logging, where defined) for
    /// the event.
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::InstallView(event) => self.install_view_handlers.fire(&event),
            Event::ProposeChange(event) => self.propose_change_handlers.fire(&event),
            Event::CommitChanges(event) => self.commit_changes_handlers.fire(&event),
            Event::Suspect(event) => self.suspect_handlers.fire(&event),
            Event::RaggedTrim(event) => self.ragged_trim_handlers.fire(&event),
            Event::JoinRequest(event) => self.join_request_handlers.fire(&event),
            Event::StartStateTransfer(event) => self.start_state_transfer_handlers.fire(&event),
            Event::EndStateTransfer(event) => self.end_state_transfer_handlers.fire(&event),
            Event::Send(event) => self.send_handlers.fire(&event),
            Event::Stable(event) => self.stable_handlers.fire(&event),
            Event::LocalPersist(event) => self.local_persist_handlers.fire(&event),
            Event::GlobalPersist(event) => self.global_persist_handlers.fire(&event),
            Event::GlobalVerify(event) => self.global_verify_handlers.fire(&event),
            Event::SignatureInvalid(event) => self.signature_invalid_handlers.fire(&event),
        }
    }
}

/// Starts the event bus thread, which loops until a shutdown signal arrives from the parent
/// thread, firing the defined handlers for every event notification received.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("event_bus".to_string())
        .spawn(move || loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("event_bus thread disconnected from main thread")
                }
            }

            match event_subscriber.try_recv() {
                Ok(event) => event_handlers.fire_handlers(event),
                Err(TryRecvError::Empty) => thread::yield_now(),
                // Publishers are gone; drain nothing further and wait for shutdown.
                Err(TryRecvError::Disconnected) => thread::yield_now(),
            }
        })
        .expect("the event_bus thread can be spawned")
}
