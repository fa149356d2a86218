/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The interface between PBFT-rs and the sink that persists the replicated log of executed
//! batches.
//!
//! Entries are dense: the entry appended by the n-th call to [`append`](Ledger::append) is the
//! batch of seqno n. The ledger is the source the [log sync server](crate::log_sync::server)
//! serves catch-up from, so implementations must allow reads of any retained entry, and clones
//! must share the same backing store (the algorithm thread appends while the sync server thread
//! reads).

use crate::types::basic::SeqNumber;

pub trait Ledger: Clone + Send + 'static {
    /// Append the serialized batch of the next seqno.
    fn append(&mut self, entry: &[u8]);

    /// Drop all entries with seqnos above `seqno`. Used to undo a catch-up transfer that failed
    /// verification.
    fn truncate(&mut self, seqno: SeqNumber);

    /// Read the entry at `seqno`, if retained.
    fn get_entry(&self, seqno: SeqNumber) -> Option<Vec<u8>>;

    /// The seqno of the newest entry, or zero if the ledger is empty.
    fn latest(&self) -> SeqNumber;
}
