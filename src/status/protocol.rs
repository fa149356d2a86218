/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Implementation of the status exchange.

use crate::log_sync::messages::MetaDataDigest;
use crate::messages::{AuthenticatedMessage, Message};
use crate::networking::network::Network;
use crate::networking::sending::SenderHandle;
use crate::ordering::messages::OrderingMessage;
use crate::state::window::SlotPhase;
use crate::state::{ReplicaPhase, ReplicaState};
use crate::types::basic::PrincipalId;
use crate::types::keypair::Keypair;
use crate::types::principals::PrincipalRegistry;
use crate::view_change::messages::{ViewChangeMessage, ViewInfo};

use super::messages::{SlotSummary, Status, SummaryPhase};

/// Immutable parameters that define the behaviour of the [`StatusExchange`] and should never
/// change.
pub(crate) struct StatusConfiguration {
    pub(crate) me: PrincipalId,
    pub(crate) keypair: Keypair,
}

pub(crate) struct StatusExchange<N: Network> {
    config: StatusConfiguration,
    sender: SenderHandle<N>,
}

impl<N: Network> StatusExchange<N> {
    pub(crate) fn new(config: StatusConfiguration, sender: SenderHandle<N>) -> StatusExchange<N> {
        StatusExchange { config, sender }
    }

    /// Broadcast this replica's progress summary. Called on every status timer fire.
    pub(crate) fn broadcast_status(&mut self, state: &ReplicaState, registry: &PrincipalRegistry) {
        let slots: Vec<SlotSummary> = state
            .window
            .slots()
            .filter(|slot| slot.seqno > state.last_executed)
            .filter(|slot| slot.summary_phase() != SummaryPhase::Committed)
            .map(|slot| SlotSummary {
                seqno: slot.seqno,
                phase: slot.summary_phase(),
            })
            .collect();

        let status = Status::new(
            registry,
            &self.config.keypair,
            state.view,
            state.phase == ReplicaPhase::ViewChanging,
            state.window.low(),
            state.last_executed,
            slots,
        );
        self.sender.broadcast_protocol(status);
    }

    /// Compare a peer's summary against local state and retransmit whatever it lacks.
    ///
    /// Returns true iff the peer's stable checkpoint is ahead of ours, which is the cue for the
    /// caller to consider catching up.
    pub(crate) fn on_receive_status(
        &mut self,
        status: Status,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) -> bool {
        if status.from == self.config.me {
            return false;
        }
        if !registry.is_replica(status.from) || status.verify_against(registry).is_err() {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return false;
        }

        let peer = status.from;

        // A peer whose stable checkpoint trails ours gets an advertisement; verifying the
        // certificate and requesting entries is its log sync client's business.
        if status.last_stable < state.window.low() {
            let advertisement = MetaDataDigest::new(
                registry,
                &self.config.keypair,
                state.stable_checkpoint.seqno,
                state.stable_checkpoint.state_digest,
            );
            self.sender.send_message(peer, Message::from(advertisement));
        }

        // A peer stuck in an older view gets the certificate that justifies ours.
        if status.view < state.view {
            if let Some(new_view) = &state.new_view {
                let view_info = ViewInfo {
                    from: self.config.me,
                    new_view: new_view.clone(),
                };
                self.sender
                    .send_protocol(peer, ViewChangeMessage::from(view_info));
            }
        }

        // Ordering retransmissions only make sense while both sides are working the same view.
        if status.view == state.view
            && !status.view_changing
            && state.phase == ReplicaPhase::Normal
        {
            for summary in &status.slots {
                let Ok(slot) = state.window.slot(summary.seqno) else {
                    continue;
                };

                // The peer lacks the Pre-Prepare: forward the stored one (its embedded signature
                // is the primary's, so it proves itself regardless of who relays it).
                if summary.phase == SummaryPhase::Empty {
                    if let Some(pre_prepare) = &slot.pre_prepare {
                        self.sender
                            .send_protocol(peer, OrderingMessage::from(pre_prepare.clone()));
                    }
                }

                let Some(digest) = slot.digest() else {
                    continue;
                };

                // The peer is short of prepares: re-issue our own as proof material.
                if summary.phase <= SummaryPhase::PrePrepared
                    && slot.phase >= SlotPhase::Prepared
                {
                    if let Some(own_prepare) = slot.prepares.own(&digest, self.config.me) {
                        let proof =
                            own_prepare.proof_copy(registry, &self.config.keypair, peer);
                        self.sender.send_protocol(peer, OrderingMessage::from(proof));
                    }
                }

                // The peer is short of commits: re-send ours.
                if summary.phase <= SummaryPhase::Prepared && slot.phase >= SlotPhase::Committed {
                    if let Some(own_commit) = slot.commits.own(&digest, self.config.me) {
                        self.sender
                            .send_protocol(peer, OrderingMessage::from(own_commit.clone()));
                    }
                }
            }
        }

        status.last_stable > state.window.low()
    }
}
