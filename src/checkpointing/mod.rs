/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subprotocol for cutting the ordering log.
//!
//! Every K executed sequence numbers (the checkpoint interval), each replica computes a digest of
//! the externally observable state at that seqno and broadcasts it in a [`Checkpoint`]
//! (messages::Checkpoint) message. Once 2f + 1 replicas are seen to agree on the same (seqno, state
//! digest) pair, the checkpoint is **stable**: the collected signatures form a
//! [`CheckpointCertificate`](types::CheckpointCertificate), the log window advances past the seqno,
//! and everything at or below it is garbage collected.
//!
//! Stability is what bounds the state a view change has to carry: a new primary only has to
//! reconstruct ordering decisions above the highest stable checkpoint, because any two quorums
//! intersect in an honest replica that vouches for everything below it.

pub mod messages;

pub mod types;

pub(crate) mod protocol;
