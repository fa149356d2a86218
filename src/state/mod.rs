/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The mutable ordering state of one replica.
//!
//! [`ReplicaState`] gathers everything the subprotocol handlers read and write: the current view
//! and whether the replica is participating in it or changing away from it, the
//! [log window](window::LogWindow), the [request table](crate::requests::table::RequestTable), the
//! execution watermark, and the latest stable checkpoint certificate. Exactly one thread (the
//! [algorithm](crate::algorithm) thread) owns a `ReplicaState` and passes it into handlers by
//! mutable reference; nothing here is synchronized.

pub mod window;

use std::collections::HashMap;

use crate::checkpointing::types::CheckpointCertificate;
use crate::ordering::messages::PrePrepare;
use crate::requests::table::RequestTable;
use crate::types::basic::{PrincipalId, SeqNumber, ViewNumber};
use crate::view_change::messages::NewView;
use window::LogWindow;

/// Where a replica stands with respect to views.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaPhase {
    /// Participating in the current view's ordering.
    Normal,
    /// The current view's primary is suspected; ordering messages are ignored until a New-View
    /// installs the next view. Checkpoints, fetches, status summaries, and view-change traffic are
    /// still processed.
    ViewChanging,
}

/// Counters for dropped and suspicious traffic, incremented on the dispatch path. Accumulated
/// suspicion never triggers a view change by itself; timers and equivocation proofs do.
#[derive(Default, Clone)]
pub struct Counters {
    pub dropped_bad_auth: u64,
    pub dropped_out_of_window: u64,
    pub dropped_stale_view: u64,
    /// Per-sender count of failed authenticators and protocol violations. Malformed buffers never
    /// reach this far: they die at the [codec boundary](crate::messages::decode) inside the
    /// network adapter.
    pub suspicion: HashMap<PrincipalId, u64>,
}

impl Counters {
    pub(crate) fn suspect(&mut self, id: PrincipalId) {
        *self.suspicion.entry(id).or_insert(0) += 1;
    }
}

/// The ordering state of one replica. Mutated only by the dispatch thread.
pub(crate) struct ReplicaState {
    pub(crate) view: ViewNumber,
    pub(crate) phase: ReplicaPhase,
    pub(crate) window: LogWindow,
    pub(crate) requests: RequestTable,
    /// The highest seqno whose batch has been delivered to the host state machine. Execution is
    /// gapless: seqno `s` executes only after `s - 1`.
    pub(crate) last_executed: SeqNumber,
    pub(crate) stable_checkpoint: CheckpointCertificate,
    /// The certificate that justifies the current view. `None` only in the initial view.
    pub(crate) new_view: Option<NewView>,
    /// Proof of primary equivocation observed in the current view: two Pre-Prepares for the same
    /// seqno with different digests. While set, no further Pre-Prepares are accepted in this view.
    pub(crate) equivocation_evidence: Option<Box<(PrePrepare, PrePrepare)>>,
    pub(crate) counters: Counters,
}

impl ReplicaState {
    pub(crate) fn initialize(
        stable_checkpoint: CheckpointCertificate,
        log_size: u64,
        request_table_capacity: usize,
    ) -> ReplicaState {
        let low = stable_checkpoint.seqno;
        ReplicaState {
            view: ViewNumber::init(),
            phase: ReplicaPhase::Normal,
            window: LogWindow::new(low, log_size),
            requests: RequestTable::new(request_table_capacity),
            last_executed: low,
            stable_checkpoint,
            new_view: None,
            equivocation_evidence: None,
            counters: Counters::default(),
        }
    }
}
