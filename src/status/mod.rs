/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subprotocol for recovering from message loss.
//!
//! The three-phase exchange assumes messages eventually arrive, but not that any particular send
//! does. Each replica therefore periodically broadcasts a [`Status`](messages::Status) summary of
//! its progress; peers compare it against their own state and retransmit exactly what the sender
//! is missing: the stored Pre-Prepare (forwardable thanks to the primary's embedded signature),
//! their own Prepare or Commit, a [`ViewInfo`](crate::view_change::messages::ViewInfo) certificate
//! when the sender is stuck in an old view, or a
//! [`MetaDataDigest`](crate::log_sync::messages::MetaDataDigest) advertisement when the sender's
//! stable checkpoint is behind.

pub mod messages;

pub(crate) mod protocol;
