/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subprotocol for replacing a suspected-faulty primary while preserving agreement.
//!
//! # Introduction
//!
//! The ordering subprotocol makes progress only while its primary behaves. The view-change
//! subprotocol is the recovery path: it detects a primary that stopped ordering (by timer) or
//! provably misbehaved (by equivocation evidence), moves the replica group to the next view with
//! the next primary, and carries across exactly the ordering decisions that must survive.
//!
//! # Why safety holds across the boundary
//!
//! The protocol leans on one fact: a slot that **committed** anywhere was **prepared** by at least
//! 2f + 1 replicas, so any quorum of [`ViewChange`](messages::ViewChange) messages contains at
//! least one correct replica whose P-set proves that slot's binding. The new primary's
//! deterministic reconstruction (see [`reconstruct`](types::reconstruct)) therefore cannot lose a
//! committed decision; at worst it re-proposes batches that never committed, or fills gaps with
//! no-ops. Because the reconstruction is a pure function of the embedded V set, every correct
//! replica checks the [`NewView`](messages::NewView) by recomputing it, and a faulty candidate
//! primary cannot smuggle in anything else.
//!
//! # Liveness
//!
//! View timers double on each successive view change without progress, so during any sufficiently
//! synchronous period all correct replicas eventually overlap in a view whose primary is correct
//! for long enough to order requests. Two accelerators avoid waiting out full timeouts: a replica
//! that sees f + 1 view-changes for higher views joins the smallest of them (at least one correct
//! replica timed out, so its own timer is only a matter of time), and a replica observed via
//! status broadcasts to be in an older view is handed the [`ViewInfo`](messages::ViewInfo)
//! certificate directly.

pub mod messages;

pub mod types;

pub(crate) mod protocol;
