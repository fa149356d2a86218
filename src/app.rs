/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The interface between PBFT-rs and the replicated state machine it keeps consistent.
//!
//! Implementors of [`App`] are expected to be **deterministic**: every method must evaluate to the
//! same value on every replica when called with the same arguments in the same order. The core
//! guarantees that [`apply`](App::apply) is invoked in strict seqno order with identical batches
//! on every correct replica; determinism of the host is what turns that into identical state.

use crate::requests::messages::Request;
use crate::types::basic::{Digest, SeqNumber};
use crate::types::principals::{Principal, SessionKey};

/// The host state machine failed to apply a batch. Non-determinism of the host breaks the
/// replication invariant, so the core treats this as fatal and halts the replica.
#[derive(Debug)]
pub struct HostFailure(pub String);

/// What applying a batch produced.
pub struct ApplyOutcome {
    /// One reply payload per request in the batch, in batch order.
    pub replies: Vec<Vec<u8>>,
    /// Principals admitted by reconfiguration requests in this batch, if any. The core registers
    /// them and informs the network provider; because the admission was itself an ordered
    /// request, every correct replica registers the same principals at the same seqno.
    pub new_principals: Vec<(Principal, Option<SessionKey>)>,
}

pub trait App: Send + 'static {
    /// Execute a batch of requests at the given seqno.
    ///
    /// Called exactly once per seqno, in strictly increasing gapless order, except during catch-up
    /// after a crash or a long partition, when previously missed batches are replayed through the
    /// same method.
    fn apply(&mut self, seqno: SeqNumber, batch: &[Request]) -> Result<ApplyOutcome, HostFailure>;

    /// A digest of the externally observable state after executing everything up to and including
    /// `seqno`. Called at checkpoint interval boundaries; two correct replicas that executed the
    /// same prefix must produce the same digest.
    fn snapshot(&mut self, seqno: SeqNumber) -> Digest;

    /// Discard all effects of seqnos above `seqno`. Called when a catch-up transfer turns out to
    /// be inconsistent and must be undone before retrying against a different peer.
    fn rollback(&mut self, seqno: SeqNumber);

    /// The seqno of the last applied batch.
    fn current_version(&self) -> SeqNumber;

    /// The state at or below `seqno` has become stable; the host may discard whatever it retained
    /// to support [`rollback`](App::rollback) below that point.
    fn compact(&mut self, seqno: SeqNumber);
}
