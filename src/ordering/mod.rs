/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subprotocol for totally ordering client requests.
//!
//! # Introduction
//!
//! The ordering subprotocol is the core of PBFT-rs. It is the classic three-phase exchange of the
//! PBFT algorithm described in the
//! [OSDI '99 paper](https://www.usenix.org/conference/osdi-99/practical-byzantine-fault-tolerance)
//! by Castro and Liskov: within a view, the primary assigns consecutive sequence numbers to
//! batches of client requests ([`PrePrepare`](messages::PrePrepare)), backups endorse the
//! assignment ([`Prepare`](messages::Prepare)), and all replicas commit it
//! ([`Commit`](messages::Commit)). A batch whose slot commits on a correct replica has the same
//! digest at the same seqno on every correct replica that ever commits it, in every view: that is
//! the agreement invariant everything else leans on.
//!
//! # Slots and quorum predicates
//!
//! Each sequence number in the active [log window](crate::state::window::LogWindow) owns a
//! [`Slot`](crate::state::window::Slot), which advances through a monotonic sequence of phases:
//!
//! - **pre-prepared**: the slot holds a Pre-Prepare from the view's primary, and every request
//!   body the batch references is locally present. A Pre-Prepare referencing unknown digests
//!   parks the slot (*awaiting requests*) while the bodies are fetched out-of-band.
//! - **prepared**: the slot additionally holds 2f matching Prepares from distinct replicas other
//!   than the primary. Together with the Pre-Prepare these form a *prepared certificate*: proof
//!   that no other digest can prepare at this (view, seqno).
//! - **committed**: 2f + 1 distinct replicas (this one's own Commit counted) are known to have
//!   prepared the binding. Any two such quorums intersect in a correct replica, which is what
//!   makes commitment irrevocable across view changes.
//! - **executed**: the batch was delivered to the host state machine. Execution is strictly
//!   gapless and in seqno order, so the host observes one identical command stream on every
//!   correct replica.
//!
//! Endorsements arriving before their Pre-Prepare are buffered in the slot's collectors and
//! counted retroactively once the digest is bound.
//!
//! # Misbehaving primaries
//!
//! A second Pre-Prepare for an occupied (view, seqno) with a different digest is proof of primary
//! equivocation: both messages carry the primary's transferable signature. The replica stores the
//! pair as evidence, refuses all further Pre-Prepares in the view, and the
//! [view-change subprotocol](crate::view_change) takes it from there. Endorsements that fail
//! authentication are dropped silently with a per-sender suspicion bump; suspicion alone never
//! triggers a view change, only timers and proof do.

pub mod messages;

pub(crate) mod types;

pub(crate) mod protocol;
