/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Client requests, replies, and the table that tracks request bodies across the replica group.
//!
//! # Big requests
//!
//! Ordering messages never carry request bodies above a configured threshold. Instead, a
//! [`PrePrepare`](crate::ordering::messages::PrePrepare) references such "big" requests by digest,
//! and the body travels separately: either directly from the client (which multicasts its request
//! to all replicas), or on demand via the [`Fetch`](messages::Fetch) /
//! [`Data`](messages::Data) exchange. The [`RequestTable`](table::RequestTable) is the per-replica
//! store that makes this work: it maps request digests to bodies, remembers which digests the
//! ordering state machine is still waiting for, and suppresses re-execution of requests a client
//! retransmitted.

pub mod messages;

pub(crate) mod table;
