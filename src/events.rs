/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local PBFT-rs replica.
//!
//! ## Event enum
//!
//! Significant occurences in the replica include executing a batch, broadcasting or receiving one
//! of the protocol messages, a checkpoint stabilizing, or a view change running its course.
//!
//! Each of these corresponds to a variant of the [event enum](Event). Each variant tuple contains
//! an inner struct type storing information that summarizes the particular kind of event,
//! including a timestamp corresponding to the exact time when the event occured.
//!
//! ## Registering event handlers
//!
//! Library users can register event handler closures via the
//! [replica builder](crate::replica::ReplicaSpec), which are then called by the library's
//! [event bus](crate::event_bus::start_event_bus) thread when the handler's particular event
//! variant happens. Default handlers that log out events can be enabled in the
//! [configuration](crate::configuration::Configuration).
//!
//! ## Timing
//!
//! Events are always emitted **after** the corresponding occurence is completed. For example, the
//! [execute event](ExecuteEvent) is only emitted after the batch's replies have been handed to the
//! network.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::checkpointing::messages::Checkpoint;
use crate::ordering::messages::{Commit, PrePrepare, Prepare};
use crate::types::basic::{Digest, PrincipalId, SeqNumber, ViewNumber};
use crate::view_change::messages::{NewView, ViewChange};

/// Enumerates all events defined for PBFT-rs.
pub enum Event {
    // Events that involve broadcasting a protocol message.
    PrePrepare(PrePrepareEvent),
    Prepare(PrepareEvent),
    Commit(CommitEvent),
    Checkpoint(CheckpointEvent),
    ViewChange(ViewChangeEvent),
    NewView(NewViewEvent),

    // Events that involve receiving a message.
    ReceiveRequest(ReceiveRequestEvent),
    ReceivePrePrepare(ReceivePrePrepareEvent),
    ReceivePrepare(ReceivePrepareEvent),
    ReceiveCommit(ReceiveCommitEvent),
    ReceiveCheckpoint(ReceiveCheckpointEvent),
    ReceiveViewChange(ReceiveViewChangeEvent),
    ReceiveNewView(ReceiveNewViewEvent),

    // Events that mark state transitions.
    Execute(ExecuteEvent),
    StabilizeCheckpoint(StabilizeCheckpointEvent),
    EnterView(EnterViewEvent),
    ViewTimeout(ViewTimeoutEvent),

    // Catch-up events.
    StartCatchUp(StartCatchUpEvent),
    EndCatchUp(EndCatchUpEvent),
}

impl Event {
    /// Publishes a given instance of the [Event] enum on the event publisher channel (if the
    /// channel is defined).
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// This replica, as primary, bound a batch to a seqno and broadcast the Pre-Prepare.
pub struct PrePrepareEvent {
    pub timestamp: SystemTime,
    pub pre_prepare: PrePrepare,
}

/// This replica endorsed a Pre-Prepare by broadcasting a Prepare.
pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub prepare: Prepare,
}

/// This replica's slot reached the prepared state and it broadcast a Commit.
pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub commit: Commit,
}

/// This replica crossed a checkpoint interval boundary and broadcast a Checkpoint.
pub struct CheckpointEvent {
    pub timestamp: SystemTime,
    pub checkpoint: Checkpoint,
}

/// This replica gave up on the current primary and broadcast a View-Change.
pub struct ViewChangeEvent {
    pub timestamp: SystemTime,
    pub view_change: ViewChange,
}

/// This replica, as the new primary, assembled and broadcast a New-View.
pub struct NewViewEvent {
    pub timestamp: SystemTime,
    pub new_view: NewView,
}

/// A client request arrived, directly or forwarded.
pub struct ReceiveRequestEvent {
    pub timestamp: SystemTime,
    pub origin: PrincipalId,
    pub client: PrincipalId,
    pub digest: Digest,
}

/// A Pre-Prepare was received and accepted.
pub struct ReceivePrePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: PrincipalId,
    pub pre_prepare: PrePrepare,
}

/// A Prepare was received and collected.
pub struct ReceivePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: PrincipalId,
    pub prepare: Prepare,
}

/// A Commit was received and collected.
pub struct ReceiveCommitEvent {
    pub timestamp: SystemTime,
    pub origin: PrincipalId,
    pub commit: Commit,
}

/// A Checkpoint was received and collected.
pub struct ReceiveCheckpointEvent {
    pub timestamp: SystemTime,
    pub origin: PrincipalId,
    pub checkpoint: Checkpoint,
}

/// A View-Change was received and collected.
pub struct ReceiveViewChangeEvent {
    pub timestamp: SystemTime,
    pub origin: PrincipalId,
    pub view_change: ViewChange,
}

/// A New-View was received.
pub struct ReceiveNewViewEvent {
    pub timestamp: SystemTime,
    pub origin: PrincipalId,
    pub new_view: NewView,
}

/// A committed batch was delivered to the host state machine and its replies were sent.
pub struct ExecuteEvent {
    pub timestamp: SystemTime,
    pub seqno: SeqNumber,
    pub batch_digest: Digest,
    pub num_requests: usize,
}

/// A checkpoint collected a quorum and the log window advanced past it.
pub struct StabilizeCheckpointEvent {
    pub timestamp: SystemTime,
    pub seqno: SeqNumber,
    pub state_digest: Digest,
}

/// The replica entered a view (either the next one, or a later one it fast-forwarded to).
pub struct EnterViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
}

/// The view timer expired without the awaited request executing.
pub struct ViewTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
}

/// The replica fell behind and requested entries from a peer.
pub struct StartCatchUpEvent {
    pub timestamp: SystemTime,
    pub peer: PrincipalId,
    pub from_seqno: SeqNumber,
}

/// A catch-up round completed.
pub struct EndCatchUpEvent {
    pub timestamp: SystemTime,
    pub peer: PrincipalId,
    pub entries_applied: usize,
}
