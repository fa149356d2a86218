/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of the PBFT (Practical Byzantine Fault Tolerance) state machine
//! replication protocol.
//!
//! PBFT-rs totally orders client requests across a group of n = 3f + 1 replicas of which up to f
//! may fail arbitrarily. The library provides the replication core: the three-phase
//! [ordering](crate::ordering) exchange, [checkpoint-based garbage collection](crate::checkpointing),
//! [view changes](crate::view_change) to replace a faulty primary,
//! [status-driven retransmission](crate::status), and [bulk catch-up](crate::log_sync). The
//! pieces that differ between deployments plug in through traits: the replicated
//! [state machine](crate::app::App), the [ledger sink](crate::ledger::Ledger), and the
//! [network](crate::networking::network::Network).
//!
//! To run a replica, implement the three traits, then build and start a
//! [`ReplicaSpec`](crate::replica::ReplicaSpec). Clients submit requests through the
//! [`ClientProxy`](crate::client::ClientProxy).

pub mod app;

pub mod checkpointing;

pub mod client;

pub mod configuration;

pub mod events;

pub mod ledger;

pub mod log_sync;

pub mod messages;

pub mod networking;

pub mod ordering;

pub mod replica;

pub mod requests;

pub mod state;

pub mod status;

pub mod types;

pub mod view_change;

pub(crate) mod algorithm;

pub(crate) mod event_bus;

pub(crate) mod logging;

pub(crate) mod timers;

// Re-exports
pub use app::App;
pub use ledger::Ledger;
pub use networking::network::Network;
pub use replica::{Replica, ReplicaSpec};
