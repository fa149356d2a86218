/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [config](crate::configuration::Configuration).
//!
//! PBFT-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following
//! snippet is how a [ReceivePrePrepare](crate::events::ReceivePrePrepareEvent) is printed:
//!
//! ```text
//! ReceivePrePrepare, 1701329264, 0, 3, 17, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the id of the replica the Pre-Prepare came from.
//! - The fourth and fifth values are the view and seqno it binds.
//! - The sixth value is the first seven characters of the Base64 encoding of the batch digest.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const PRE_PREPARE: &str = "PrePrepare";
pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";
pub const CHECKPOINT: &str = "Checkpoint";
pub const VIEW_CHANGE: &str = "ViewChange";
pub const NEW_VIEW: &str = "NewView";

pub const RECEIVE_REQUEST: &str = "ReceiveRequest";
pub const RECEIVE_PRE_PREPARE: &str = "ReceivePrePrepare";
pub const RECEIVE_PREPARE: &str = "ReceivePrepare";
pub const RECEIVE_COMMIT: &str = "ReceiveCommit";
pub const RECEIVE_CHECKPOINT: &str = "ReceiveCheckpoint";
pub const RECEIVE_VIEW_CHANGE: &str = "ReceiveViewChange";
pub const RECEIVE_NEW_VIEW: &str = "ReceiveNewView";

pub const EXECUTE: &str = "Execute";
pub const STABILIZE_CHECKPOINT: &str = "StabilizeCheckpoint";
pub const ENTER_VIEW: &str = "EnterView";
pub const VIEW_TIMEOUT: &str = "ViewTimeout";

pub const START_CATCH_UP: &str = "StartCatchUp";
pub const END_CATCH_UP: &str = "EndCatchUp";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for PrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &PrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                PRE_PREPARE,
                secs_since_unix_epoch(event.timestamp),
                event.pre_prepare.view,
                event.pre_prepare.seqno,
                event.pre_prepare.requests.len(),
                first_seven_base64_chars(&event.pre_prepare.batch_digest.bytes()),
            )
        })
    }
}

impl Logger for PrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &PrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PREPARE,
                secs_since_unix_epoch(event.timestamp),
                event.prepare.view,
                event.prepare.seqno,
                first_seven_base64_chars(&event.prepare.digest.bytes()),
            )
        })
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(event.timestamp),
                event.commit.view,
                event.commit.seqno,
                first_seven_base64_chars(&event.commit.digest.bytes()),
            )
        })
    }
}

impl Logger for CheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                CHECKPOINT,
                secs_since_unix_epoch(event.timestamp),
                event.checkpoint.seqno,
                first_seven_base64_chars(&event.checkpoint.state_digest.bytes()),
            )
        })
    }
}

impl Logger for ViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                VIEW_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                event.view_change.view,
                event.view_change.stable_checkpoint.seqno,
                event.view_change.prepared.len(),
                event.view_change.pre_prepared.len(),
            )
        })
    }
}

impl Logger for NewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &NewViewEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_VIEW,
                secs_since_unix_epoch(event.timestamp),
                event.new_view.view,
                event.new_view.view_changes.len(),
                event.new_view.pre_prepares.len(),
            )
        })
    }
}

impl Logger for ReceiveRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveRequestEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_REQUEST,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.client,
                first_seven_base64_chars(&event.digest.bytes()),
            )
        })
    }
}

impl Logger for ReceivePrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceivePrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PRE_PREPARE,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.pre_prepare.view,
                event.pre_prepare.seqno,
                first_seven_base64_chars(&event.pre_prepare.batch_digest.bytes()),
            )
        })
    }
}

impl Logger for ReceivePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceivePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_PREPARE,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.prepare.view,
                event.prepare.seqno,
            )
        })
    }
}

impl Logger for ReceiveCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveCommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_COMMIT,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.commit.view,
                event.commit.seqno,
            )
        })
    }
}

impl Logger for ReceiveCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveCheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_CHECKPOINT,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.checkpoint.seqno,
            )
        })
    }
}

impl Logger for ReceiveViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_VIEW_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.view_change.view,
            )
        })
    }
}

impl Logger for ReceiveNewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveNewViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_NEW_VIEW,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.new_view.view,
            )
        })
    }
}

impl Logger for ExecuteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ExecuteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                EXECUTE,
                secs_since_unix_epoch(event.timestamp),
                event.seqno,
                event.num_requests,
                first_seven_base64_chars(&event.batch_digest.bytes()),
            )
        })
    }
}

impl Logger for StabilizeCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StabilizeCheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                STABILIZE_CHECKPOINT,
                secs_since_unix_epoch(event.timestamp),
                event.seqno,
                first_seven_base64_chars(&event.state_digest.bytes()),
            )
        })
    }
}

impl Logger for EnterViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &EnterViewEvent| {
            log::info!(
                "{}, {}, {}",
                ENTER_VIEW,
                secs_since_unix_epoch(event.timestamp),
                event.view,
            )
        })
    }
}

impl Logger for ViewTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ViewTimeoutEvent| {
            log::info!(
                "{}, {}, {}",
                VIEW_TIMEOUT,
                secs_since_unix_epoch(event.timestamp),
                event.view,
            )
        })
    }
}

impl Logger for StartCatchUpEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartCatchUpEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_CATCH_UP,
                secs_since_unix_epoch(event.timestamp),
                event.peer,
                event.from_seqno,
            )
        })
    }
}

impl Logger for EndCatchUpEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &EndCatchUpEvent| {
            log::info!(
                "{}, {}, {}, {}",
                END_CATCH_UP,
                secs_since_unix_epoch(event.timestamp),
                event.peer,
                event.entries_applied,
            )
        })
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first
// 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
