/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subprotocol for bulk catch-up on executed batches.
//!
//! A replica that was down or partitioned can fall arbitrarily far behind; the retransmissions of
//! the [status subprotocol](crate::status) only cover the active window. Log sync is the bulk
//! path: the lagging replica requests consecutive [`Ledger`](crate::ledger::Ledger) entries from a
//! peer, starting at its own last-acknowledged seqno, and the serving peer answers with a bounded
//! batch plus its latest stable checkpoint certificate. The certificate is what makes the transfer
//! trustworthy: after replaying the entries, the client checks its host state digest against the
//! certified one, and rolls everything back if they disagree (one faulty server can waste the
//! client's time, but never corrupt it).
//!
//! The serving side runs on its own thread (the
//! [log sync server](server::start_log_sync_server)), reading the shared ledger; the requesting
//! side lives on the dispatch thread as the [`LogSyncClient`](client::LogSyncClient).

pub mod messages;

pub(crate) mod client;

pub(crate) mod server;
