/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Status`] message: a periodic broadcast summarizing how far the sender has progressed, so
//! that peers can retransmit whatever it is missing.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::{AuthenticatedMessage, ProtocolMessage};
use crate::types::basic::{PrincipalId, SeqNumber, ViewNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::{Authenticator, PrincipalRegistry};

/// How far one slot of the sender's log window has progressed, as reported in a [`Status`]
/// broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub enum SummaryPhase {
    Empty,
    PrePrepared,
    Prepared,
    Committed,
}

/// One entry of [`Status::slots`].
#[derive(Clone, Debug, PartialEq, Copy, BorshSerialize, BorshDeserialize)]
pub struct SlotSummary {
    pub seqno: SeqNumber,
    pub phase: SummaryPhase,
}

/// Periodic broadcast of the sender's progress. Receivers compare the summary against their own
/// state and retransmit messages the sender appears to lack; see
/// [`StatusExchange`](super::protocol::StatusExchange).
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Status {
    pub view: ViewNumber,
    pub from: PrincipalId,
    /// True iff the sender has abandoned `view`'s ordering and is waiting for a New-View.
    pub view_changing: bool,
    pub last_stable: SeqNumber,
    pub last_executed: SeqNumber,
    /// Summaries for the slots between `last_executed` and the sender's high watermark that have
    /// not reached the committed state, lowest seqno first.
    pub slots: Vec<SlotSummary>,
    pub authenticator: Authenticator,
}

impl Status {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        view: ViewNumber,
        view_changing: bool,
        last_stable: SeqNumber,
        last_executed: SeqNumber,
        slots: Vec<SlotSummary>,
    ) -> Status {
        let from = registry.me();
        let auth_bytes = Self::bytes_to_authenticate(
            view,
            from,
            view_changing,
            last_stable,
            last_executed,
            &slots,
        );
        let authenticator = registry.authenticate(keypair, &auth_bytes);
        Status {
            view,
            from,
            view_changing,
            last_stable,
            last_executed,
            slots,
            authenticator,
        }
    }

    fn bytes_to_authenticate(
        view: ViewNumber,
        from: PrincipalId,
        view_changing: bool,
        last_stable: SeqNumber,
        last_executed: SeqNumber,
        slots: &Vec<SlotSummary>,
    ) -> Vec<u8> {
        (view, from, view_changing, last_stable, last_executed, slots)
            .try_to_vec()
            .unwrap()
    }
}

impl AuthenticatedMessage for Status {
    fn auth_bytes(&self) -> Vec<u8> {
        Self::bytes_to_authenticate(
            self.view,
            self.from,
            self.view_changing,
            self.last_stable,
            self.last_executed,
            &self.slots,
        )
    }

    fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    fn sender(&self) -> PrincipalId {
        self.from
    }
}

impl From<Status> for ProtocolMessage {
    fn from(status: Status) -> Self {
        ProtocolMessage::Status(status)
    }
}
