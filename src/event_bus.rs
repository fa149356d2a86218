/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the [algorithm](crate::algorithm) thread and passes them
//! to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it triggers the
//! execution of all handlers defined for the contained event type, where the handlers for each
//! event type are stored in [`EventHandlers`].
//!
//! When no handlers are present in a replica's instance of `EventHandlers` this thread is not
//! started.
//!
//! ## Event Handlers
//!
//! A replica's instance of `EventHandlers` contains:
//! 1. The handlers provided upon building the replica via
//!    [`ReplicaSpec`](crate::replica::ReplicaSpec), and
//! 2. If logging is enabled via the replica's [config](crate::configuration::Configuration) then
//!    also the default logging handlers defined in [logging](crate::logging).

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the argument (for our use case, event) type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the two optional handlers enabled for an event type that implements the [`Logger`]
/// trait, namely one logging handler, defined in [`logging`](crate::logging), and one user-defined
/// handler, passed to [`ReplicaSpec`](crate::replica::ReplicaSpec).
pub(crate) struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    // Checks if no event handlers are defined for this event.
    fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    /// Creates a new `HandlerPair` with the user-defined handler, and the default logging handler
    /// if logging is enabled.
    fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        self.user_defined_handler.iter().for_each(|handler| handler(event));
        self.logging_handler.iter().for_each(|handler| handler(event));
    }
}

/// Stores the `HandlerPair` of user-defined and optional logging handlers for each pre-defined
/// event type from [events](crate::events).
pub(crate) struct EventHandlers {
    pub(crate) pre_prepare_handlers: HandlerPair<PrePrepareEvent>,
    pub(crate) prepare_handlers: HandlerPair<PrepareEvent>,
    pub(crate) commit_handlers: HandlerPair<CommitEvent>,
    pub(crate) checkpoint_handlers: HandlerPair<CheckpointEvent>,
    pub(crate) view_change_handlers: HandlerPair<ViewChangeEvent>,
    pub(crate) new_view_handlers: HandlerPair<NewViewEvent>,

    pub(crate) receive_request_handlers: HandlerPair<ReceiveRequestEvent>,
    pub(crate) receive_pre_prepare_handlers: HandlerPair<ReceivePrePrepareEvent>,
    pub(crate) receive_prepare_handlers: HandlerPair<ReceivePrepareEvent>,
    pub(crate) receive_commit_handlers: HandlerPair<ReceiveCommitEvent>,
    pub(crate) receive_checkpoint_handlers: HandlerPair<ReceiveCheckpointEvent>,
    pub(crate) receive_view_change_handlers: HandlerPair<ReceiveViewChangeEvent>,
    pub(crate) receive_new_view_handlers: HandlerPair<ReceiveNewViewEvent>,

    pub(crate) execute_handlers: HandlerPair<ExecuteEvent>,
    pub(crate) stabilize_checkpoint_handlers: HandlerPair<StabilizeCheckpointEvent>,
    pub(crate) enter_view_handlers: HandlerPair<EnterViewEvent>,
    pub(crate) view_timeout_handlers: HandlerPair<ViewTimeoutEvent>,

    pub(crate) start_catch_up_handlers: HandlerPair<StartCatchUpEvent>,
    pub(crate) end_catch_up_handlers: HandlerPair<EndCatchUpEvent>,
}

/// The user-defined handlers passed to [`ReplicaSpec`](crate::replica::ReplicaSpec), before being
/// paired with logging handlers.
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) on_pre_prepare: Option<HandlerPtr<PrePrepareEvent>>,
    pub(crate) on_prepare: Option<HandlerPtr<PrepareEvent>>,
    pub(crate) on_commit: Option<HandlerPtr<CommitEvent>>,
    pub(crate) on_checkpoint: Option<HandlerPtr<CheckpointEvent>>,
    pub(crate) on_view_change: Option<HandlerPtr<ViewChangeEvent>>,
    pub(crate) on_new_view: Option<HandlerPtr<NewViewEvent>>,
    pub(crate) on_receive_request: Option<HandlerPtr<ReceiveRequestEvent>>,
    pub(crate) on_receive_pre_prepare: Option<HandlerPtr<ReceivePrePrepareEvent>>,
    pub(crate) on_receive_prepare: Option<HandlerPtr<ReceivePrepareEvent>>,
    pub(crate) on_receive_commit: Option<HandlerPtr<ReceiveCommitEvent>>,
    pub(crate) on_receive_checkpoint: Option<HandlerPtr<ReceiveCheckpointEvent>>,
    pub(crate) on_receive_view_change: Option<HandlerPtr<ReceiveViewChangeEvent>>,
    pub(crate) on_receive_new_view: Option<HandlerPtr<ReceiveNewViewEvent>>,
    pub(crate) on_execute: Option<HandlerPtr<ExecuteEvent>>,
    pub(crate) on_stabilize_checkpoint: Option<HandlerPtr<StabilizeCheckpointEvent>>,
    pub(crate) on_enter_view: Option<HandlerPtr<EnterViewEvent>>,
    pub(crate) on_view_timeout: Option<HandlerPtr<ViewTimeoutEvent>>,
    pub(crate) on_start_catch_up: Option<HandlerPtr<StartCatchUpEvent>>,
    pub(crate) on_end_catch_up: Option<HandlerPtr<EndCatchUpEvent>>,
}

impl EventHandlers {
    /// Creates the [handler pairs](HandlerPair) for all pre-defined event types from
    /// [events](crate::events) given the user-defined handlers, and information on whether logging
    /// is enabled.
    pub(crate) fn new(log: bool, user: UserHandlers) -> EventHandlers {
        EventHandlers {
            pre_prepare_handlers: HandlerPair::new(log, user.on_pre_prepare),
            prepare_handlers: HandlerPair::new(log, user.on_prepare),
            commit_handlers: HandlerPair::new(log, user.on_commit),
            checkpoint_handlers: HandlerPair::new(log, user.on_checkpoint),
            view_change_handlers: HandlerPair::new(log, user.on_view_change),
            new_view_handlers: HandlerPair::new(log, user.on_new_view),
            receive_request_handlers: HandlerPair::new(log, user.on_receive_request),
            receive_pre_prepare_handlers: HandlerPair::new(log, user.on_receive_pre_prepare),
            receive_prepare_handlers: HandlerPair::new(log, user.on_receive_prepare),
            receive_commit_handlers: HandlerPair::new(log, user.on_receive_commit),
            receive_checkpoint_handlers: HandlerPair::new(log, user.on_receive_checkpoint),
            receive_view_change_handlers: HandlerPair::new(log, user.on_receive_view_change),
            receive_new_view_handlers: HandlerPair::new(log, user.on_receive_new_view),
            execute_handlers: HandlerPair::new(log, user.on_execute),
            stabilize_checkpoint_handlers: HandlerPair::new(log, user.on_stabilize_checkpoint),
            enter_view_handlers: HandlerPair::new(log, user.on_enter_view),
            view_timeout_handlers: HandlerPair::new(log, user.on_view_timeout),
            start_catch_up_handlers: HandlerPair::new(log, user.on_start_catch_up),
            end_catch_up_handlers: HandlerPair::new(log, user.on_end_catch_up),
        }
    }

    /// Checks if no handlers are defined, i.e., neither user-defined handlers were defined nor
    /// logging is enabled.
    pub(crate) fn is_empty(&self) -> bool {
        self.pre_prepare_handlers.is_empty()
            && self.prepare_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.checkpoint_handlers.is_empty()
            && self.view_change_handlers.is_empty()
            && self.new_view_handlers.is_empty()
            && self.receive_request_handlers.is_empty()
            && self.receive_pre_prepare_handlers.is_empty()
            && self.receive_prepare_handlers.is_empty()
            && self.receive_commit_handlers.is_empty()
            && self.receive_checkpoint_handlers.is_empty()
            && self.receive_view_change_handlers.is_empty()
            && self.receive_new_view_handlers.is_empty()
            && self.execute_handlers.is_empty()
            && self.stabilize_checkpoint_handlers.is_empty()
            && self.enter_view_handlers.is_empty()
            && self.view_timeout_handlers.is_empty()
            && self.start_catch_up_handlers.is_empty()
            && self.end_catch_up_handlers.is_empty()
    }

    /// Triggers the execution of each of the two handlers - the user-defined and the logging
    /// handler, if defined - for a given event type from [events](crate::events).
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::PrePrepare(event) => self.pre_prepare_handlers.fire(&event),
            Event::Prepare(event) => self.prepare_handlers.fire(&event),
            Event::Commit(event) => self.commit_handlers.fire(&event),
            Event::Checkpoint(event) => self.checkpoint_handlers.fire(&event),
            Event::ViewChange(event) => self.view_change_handlers.fire(&event),
            Event::NewView(event) => self.new_view_handlers.fire(&event),
            Event::ReceiveRequest(event) => self.receive_request_handlers.fire(&event),
            Event::ReceivePrePrepare(event) => self.receive_pre_prepare_handlers.fire(&event),
            Event::ReceivePrepare(event) => self.receive_prepare_handlers.fire(&event),
            Event::ReceiveCommit(event) => self.receive_commit_handlers.fire(&event),
            Event::ReceiveCheckpoint(event) => self.receive_checkpoint_handlers.fire(&event),
            Event::ReceiveViewChange(event) => self.receive_view_change_handlers.fire(&event),
            Event::ReceiveNewView(event) => self.receive_new_view_handlers.fire(&event),
            Event::Execute(event) => self.execute_handlers.fire(&event),
            Event::StabilizeCheckpoint(event) => self.stabilize_checkpoint_handlers.fire(&event),
            Event::EnterView(event) => self.enter_view_handlers.fire(&event),
            Event::ViewTimeout(event) => self.view_timeout_handlers.fire(&event),
            Event::StartCatchUp(event) => self.start_catch_up_handlers.fire(&event),
            Event::EndCatchUp(event) => self.end_catch_up_handlers.fire(&event),
        }
    }
}

/// Starts the event bus thread, which runs an infinite loop until a shutdown signal is received
/// from the parent thread. In each iteration of the loop, the thread checks if it received any
/// event notifications, and if so, then triggers the execution of the handlers defined for the
/// event.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
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
            // The algorithm thread is allowed to exit (and drop its publisher) before the event
            // bus is told to shut down.
            Err(TryRecvError::Disconnected) => thread::yield_now(),
        }
    })
}
