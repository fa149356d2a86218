/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Implementation of the checkpointing subprotocol.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::app::App;
use crate::events::*;
use crate::messages::SignedMessage;
use crate::networking::network::Network;
use crate::networking::sending::SenderHandle;
use crate::state::ReplicaState;
use crate::types::basic::{PrincipalId, SeqNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::PrincipalRegistry;

use super::messages::Checkpoint;
use super::types::{CheckpointCertificate, CheckpointCollector};

/// Immutable parameters that define the behaviour of the [`Checkpointing`] subprotocol and should
/// never change.
pub(crate) struct CheckpointingConfiguration {
    pub(crate) keypair: Keypair,
    /// K: a checkpoint is taken every K executed seqnos.
    pub(crate) interval: u64,
}

pub(crate) struct Checkpointing<N: Network> {
    config: CheckpointingConfiguration,
    sender: SenderHandle<N>,
    collector: CheckpointCollector,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network> Checkpointing<N> {
    pub(crate) fn new(
        config: CheckpointingConfiguration,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> Checkpointing<N> {
        Checkpointing {
            config,
            sender,
            collector: CheckpointCollector::new(),
            event_publisher,
        }
    }

    /// Called after every executed seqno. On interval boundaries, digest the observable state and
    /// broadcast a Checkpoint; this replica's own message comes back through the loopback and is
    /// collected like everyone else's.
    pub(crate) fn on_executed(
        &mut self,
        seqno: SeqNumber,
        registry: &PrincipalRegistry,
        app: &mut impl App,
    ) {
        if seqno.int() % self.config.interval != 0 {
            return;
        }

        let state_digest = app.snapshot(seqno);
        let checkpoint = Checkpoint::new(registry, &self.config.keypair, seqno, state_digest, false);

        Event::Checkpoint(CheckpointEvent {
            timestamp: SystemTime::now(),
            checkpoint: checkpoint.clone(),
        })
        .publish(&self.event_publisher);

        self.sender.broadcast_protocol(checkpoint);
    }

    /// Collect a peer's (or our own looped-back) Checkpoint. Returns the certificate if this
    /// message completed a quorum; the caller then runs [`stabilize`](Checkpointing::stabilize).
    pub(crate) fn on_receive_checkpoint(
        &mut self,
        checkpoint: Checkpoint,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) -> Option<CheckpointCertificate> {
        // Checkpoints at or below the watermark already stabilized.
        if checkpoint.seqno <= state.window.low() {
            return None;
        }
        if !checkpoint.is_correct(registry) {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return None;
        }

        Event::ReceiveCheckpoint(ReceiveCheckpointEvent {
            timestamp: SystemTime::now(),
            origin,
            checkpoint: checkpoint.clone(),
        })
        .publish(&self.event_publisher);

        self.collector.collect(registry, &checkpoint)
    }

    /// Install a stable checkpoint: advance the watermark, release everything at or below it, and
    /// let the host compact.
    ///
    /// This is also the adoption path for certificates learned from peers (view changes and
    /// catch-up), which is why it tolerates certificates well above the previous watermark.
    pub(crate) fn stabilize(
        &mut self,
        certificate: CheckpointCertificate,
        state: &mut ReplicaState,
        app: &mut impl App,
    ) {
        let seqno = certificate.seqno;
        if seqno <= state.window.low() {
            return;
        }

        state.stable_checkpoint = certificate;
        state.window.advance(seqno);
        let referenced = state.window.referenced_digests();
        state.requests.garbage_collect(seqno, &referenced);
        self.collector.garbage_collect(seqno);
        app.compact(seqno);

        Event::StabilizeCheckpoint(StabilizeCheckpointEvent {
            timestamp: SystemTime::now(),
            seqno,
            state_digest: state.stable_checkpoint.state_digest,
        })
        .publish(&self.event_publisher);
    }
}
