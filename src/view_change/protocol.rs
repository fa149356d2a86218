/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Implementation of the view-change engine.
//!
//! [`ViewChangeEngine`] owns the view timer, accumulates view-change traffic in its
//! [collector](super::types::ViewChangeCollector), assembles New-View certificates when this
//! replica is the candidate primary, and verifies and installs the ones it receives. Installing a
//! view only rewrites view-level state; resuming the ordering slots the New-View reconstructed is
//! the ordering subprotocol's job, which the [algorithm](crate::algorithm) invokes right after a
//! successful install.

use std::collections::HashSet;
use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::events::*;
use crate::messages::SignedMessage;
use crate::networking::network::Network;
use crate::networking::sending::SenderHandle;
use crate::state::window::SlotPhase;
use crate::state::{ReplicaPhase, ReplicaState};
use crate::timers::{TimerHandle, TimerKind, TimerWheel};
use crate::types::basic::{Digest, PrincipalId, ViewNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::{AuthenticationScheme, PrincipalRegistry};

use super::messages::{NewView, ViewChange, ViewChangeAck, ViewChangeMessage, ViewInfo};
use super::types::{
    o_set_matches, reconstruct, PrePreparedInfo, PreparedProof, ViewChangeCollector,
};

/// Immutable parameters that define the behaviour of the [`ViewChangeEngine`] and should never
/// change.
pub(crate) struct ViewChangeConfiguration {
    pub(crate) me: PrincipalId,
    pub(crate) keypair: Keypair,
    /// Base duration of the view timer. Doubles on each successive view change without progress,
    /// so that views eventually outlast any bounded network delay.
    pub(crate) base_timeout: Duration,
}

/// What handling a view-change message amounted to.
pub(crate) enum ViewChangeOutcome {
    Handled,
    Dropped,
    /// A New-View was verified and installed. The caller must resume the ordering subprotocol on
    /// the installed slots, and start catch-up if the new watermark ran ahead of execution.
    Installed { catch_up_needed: bool },
}

pub(crate) struct ViewChangeEngine<N: Network> {
    config: ViewChangeConfiguration,
    sender: SenderHandle<N>,
    collector: ViewChangeCollector,
    event_publisher: Option<Sender<Event>>,
    /// Digests of requests this replica has admitted but not yet seen execute. The view timer
    /// runs while this is non-empty.
    awaited: HashSet<Digest>,
    view_timer: Option<TimerHandle>,
    /// Number of view changes since the last executed request; exponent of the timeout backoff.
    retry_exponent: u32,
    /// The highest view this replica has assembled and broadcast a New-View for.
    last_assembled: Option<ViewNumber>,
}

impl<N: Network> ViewChangeEngine<N> {
    pub(crate) fn new(
        config: ViewChangeConfiguration,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> ViewChangeEngine<N> {
        ViewChangeEngine {
            config,
            sender,
            collector: ViewChangeCollector::new(),
            event_publisher,
            awaited: HashSet::new(),
            view_timer: None,
            retry_exponent: 0,
            last_assembled: None,
        }
    }

    fn timeout_ms(&self) -> u64 {
        let base = self.config.base_timeout.as_millis() as u64;
        base.saturating_mul(1u64 << self.retry_exponent.min(16))
    }

    /// A request was admitted: hold the current primary accountable for executing it.
    pub(crate) fn note_request(
        &mut self,
        digest: Digest,
        state: &ReplicaState,
        timers: &mut TimerWheel,
    ) {
        self.awaited.insert(digest);
        if self.view_timer.is_none() && state.phase == ReplicaPhase::Normal {
            self.view_timer = Some(timers.set(
                self.timeout_ms(),
                TimerKind::View { view: state.view },
            ));
        }
    }

    /// Requests executed: the primary delivered. Progress resets the timeout backoff, and the view
    /// timer is re-armed only if something is still outstanding.
    pub(crate) fn note_executed(
        &mut self,
        digests: &[Digest],
        state: &ReplicaState,
        timers: &mut TimerWheel,
    ) {
        for digest in digests {
            self.awaited.remove(digest);
        }
        self.retry_exponent = 0;

        if let Some(handle) = self.view_timer.take() {
            timers.cancel(handle);
        }
        if !self.awaited.is_empty() && state.phase == ReplicaPhase::Normal {
            self.view_timer = Some(timers.set(
                self.timeout_ms(),
                TimerKind::View { view: state.view },
            ));
        }
    }

    /// The view timer fired. In the normal phase this starts a view change; while already
    /// view-changing it escalates to the next candidate view (the candidate primary was too slow
    /// or faulty as well).
    pub(crate) fn on_view_timeout(
        &mut self,
        handle: TimerHandle,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
        timers: &mut TimerWheel,
    ) {
        if self.view_timer != Some(handle) {
            // A stale fire from a timer superseded by view progress.
            return;
        }
        self.view_timer = None;

        Event::ViewTimeout(ViewTimeoutEvent {
            timestamp: SystemTime::now(),
            view: state.view,
        })
        .publish(&self.event_publisher);

        self.start_view_change(state.view + 1, state, registry, timers);
    }

    /// Move to the candidate view `target`: stop participating in the current view's ordering and
    /// broadcast a View-Change carrying this replica's stable checkpoint and P/Q sets.
    pub(crate) fn start_view_change(
        &mut self,
        target: ViewNumber,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
        timers: &mut TimerWheel,
    ) {
        let mut prepared: Vec<PreparedProof> = Vec::new();
        let mut pre_prepared: Vec<PrePreparedInfo> = Vec::new();
        for slot in state.window.slots() {
            let Some(pre_prepare) = &slot.pre_prepare else {
                continue;
            };
            match slot.phase {
                SlotPhase::Prepared | SlotPhase::Committed | SlotPhase::Executed => {
                    prepared.push(PreparedProof {
                        pre_prepare: pre_prepare.clone(),
                        prepares: slot.prepares.signatures(&pre_prepare.batch_digest),
                    });
                }
                SlotPhase::AwaitingRequests | SlotPhase::PrePrepared => {
                    pre_prepared.push(PrePreparedInfo {
                        pre_prepare: pre_prepare.clone(),
                    });
                }
                SlotPhase::Empty => (),
            }
        }

        let view_change = ViewChange::new(
            registry,
            &self.config.keypair,
            target,
            state.stable_checkpoint.clone(),
            prepared,
            pre_prepared,
        );

        state.view = target;
        state.phase = ReplicaPhase::ViewChanging;
        self.retry_exponent += 1;

        Event::ViewChange(ViewChangeEvent {
            timestamp: SystemTime::now(),
            view_change: view_change.clone(),
        })
        .publish(&self.event_publisher);

        self.sender
            .broadcast_protocol(ViewChangeMessage::from(view_change));

        // If the candidate primary is faulty too, this fires and escalates further.
        if let Some(handle) = self.view_timer.take() {
            timers.cancel(handle);
        }
        self.view_timer = Some(timers.set(self.timeout_ms(), TimerKind::View { view: target }));
    }

    pub(crate) fn on_receive_view_change(
        &mut self,
        view_change: ViewChange,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
        timers: &mut TimerWheel,
    ) -> ViewChangeOutcome {
        // A view-change for a view at or below ours, while we are participating normally, marks
        // the sender as lagging: hand it the certificate that justifies where we are.
        if view_change.view <= state.view && state.phase == ReplicaPhase::Normal {
            if let Some(new_view) = &state.new_view {
                if view_change.view <= new_view.view {
                    let view_info = ViewInfo {
                        from: self.config.me,
                        new_view: new_view.clone(),
                    };
                    self.sender
                        .send_protocol(view_change.from, ViewChangeMessage::from(view_info));
                }
            }
            return ViewChangeOutcome::Handled;
        }

        if self.collector.contains(view_change.view, view_change.from) {
            return ViewChangeOutcome::Handled;
        }
        if !view_change.is_correct(registry) {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return ViewChangeOutcome::Dropped;
        }

        Event::ReceiveViewChange(ReceiveViewChangeEvent {
            timestamp: SystemTime::now(),
            origin,
            view_change: view_change.clone(),
        })
        .publish(&self.event_publisher);

        let target = view_change.view;
        let vc_from = view_change.from;
        let vc_digest = view_change.digest();
        self.collector.collect(view_change);

        // Acknowledge the message toward the candidate primary; in the session-MAC scheme, acks
        // are what corroborate view-changes the primary cannot prove authentic to itself.
        let candidate_primary = registry.primary(target);
        if self.config.me != candidate_primary && vc_from != self.config.me {
            let ack = ViewChangeAck::new(
                registry,
                &self.config.keypair,
                target,
                vc_from,
                vc_digest,
            );
            self.sender
                .send_protocol(candidate_primary, ViewChangeMessage::from(ack));
        }

        // Join rule: f + 1 distinct replicas moving to views above ours means at least one correct
        // replica timed out; join the smallest such view rather than waiting for our own timer.
        let join_threshold = registry.max_faulty() + 1;
        if let Some(join) = self
            .collector
            .smallest_view_above_with(state.view, join_threshold)
        {
            self.start_view_change(join, state, registry, timers);
        }

        self.try_assemble_new_view(state, registry);
        ViewChangeOutcome::Handled
    }

    pub(crate) fn on_receive_view_change_ack(
        &mut self,
        ack: ViewChangeAck,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) {
        if registry.primary(ack.view) != self.config.me {
            return;
        }
        if !SignedMessage::is_correct(&ack, registry) || !registry.is_replica(ack.from) {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return;
        }
        self.collector.collect_ack(&ack);
        self.try_assemble_new_view(state, registry);
    }

    /// If this replica is the primary of a candidate view for which a quorum of (sufficiently
    /// corroborated) view-changes has been collected, reconstruct the O set and broadcast the
    /// New-View. The certificate is installed locally when it comes back through the loopback.
    fn try_assemble_new_view(&mut self, state: &ReplicaState, registry: &PrincipalRegistry) {
        let candidates: Vec<ViewNumber> = {
            let mut views = Vec::new();
            let mut candidate = state.view;
            // Candidate views at or above ours for which traffic exists. The collector is keyed
            // sparsely, so probing by count is enough.
            for _ in 0..2 {
                if self.collector.count(candidate) > 0 {
                    views.push(candidate);
                }
                candidate = candidate + 1;
            }
            views
        };

        for candidate in candidates {
            if registry.primary(candidate) != self.config.me {
                continue;
            }
            if self.last_assembled.is_some_and(|assembled| assembled >= candidate) {
                continue;
            }

            let view_changes: Vec<ViewChange> = self
                .collector
                .view_changes(candidate)
                .into_iter()
                .filter(|vc| self.is_corroborated(vc, candidate, registry))
                .collect();
            if (view_changes.len() as u32) < registry.quorum() {
                continue;
            }

            let reconstruction = reconstruct(&view_changes);
            let pre_prepares = reconstruction
                .decisions
                .iter()
                .map(|(seqno, decision)| {
                    let requests = match decision {
                        super::types::ReconstructedBatch::Prepared { requests, .. } => {
                            requests.clone()
                        }
                        super::types::ReconstructedBatch::Null => Vec::new(),
                    };
                    crate::ordering::messages::PrePrepare::new(
                        registry,
                        &self.config.keypair,
                        candidate,
                        *seqno,
                        requests,
                    )
                })
                .collect();

            let new_view = NewView::new(
                registry,
                &self.config.keypair,
                candidate,
                view_changes,
                pre_prepares,
            );
            self.last_assembled = Some(candidate);

            Event::NewView(NewViewEvent {
                timestamp: SystemTime::now(),
                new_view: new_view.clone(),
            })
            .publish(&self.event_publisher);

            self.sender
                .broadcast_protocol(ViewChangeMessage::from(new_view));
        }
    }

    /// Whether a collected view-change message may be embedded into a New-View certificate. With
    /// signatures the message vouches for itself; with session MACs it needs 2f - 1 acks (or to be
    /// this replica's own).
    fn is_corroborated(
        &self,
        view_change: &ViewChange,
        candidate: ViewNumber,
        registry: &PrincipalRegistry,
    ) -> bool {
        match registry.scheme() {
            AuthenticationScheme::Signatures => true,
            AuthenticationScheme::SessionMacs => {
                view_change.from == self.config.me
                    || self.collector.ack_count(candidate, view_change.from, view_change.digest())
                        >= (2 * registry.max_faulty()).saturating_sub(1)
            }
        }
    }

    pub(crate) fn on_receive_new_view(
        &mut self,
        new_view: NewView,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
        timers: &mut TimerWheel,
    ) -> ViewChangeOutcome {
        if new_view.view < state.view
            || (new_view.view == state.view && state.phase == ReplicaPhase::Normal)
        {
            state.counters.dropped_stale_view += 1;
            return ViewChangeOutcome::Dropped;
        }
        if !new_view.is_correct(registry) {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return ViewChangeOutcome::Dropped;
        }

        // Invariant: a New-View is accepted iff its O set is exactly what this replica computes
        // from its V set.
        let reconstruction = reconstruct(&new_view.view_changes);
        if !o_set_matches(registry, new_view.view, &reconstruction, &new_view.pre_prepares) {
            state.counters.suspect(origin);
            return ViewChangeOutcome::Dropped;
        }

        Event::ReceiveNewView(ReceiveNewViewEvent {
            timestamp: SystemTime::now(),
            origin,
            new_view: new_view.clone(),
        })
        .publish(&self.event_publisher);

        self.install(new_view, state, registry, timers)
    }

    /// A laggard was handed the certificate for a newer view; adopt it through the same
    /// verification as a directly received New-View.
    pub(crate) fn on_receive_view_info(
        &mut self,
        view_info: ViewInfo,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
        timers: &mut TimerWheel,
    ) -> ViewChangeOutcome {
        if view_info.new_view.view <= state.view {
            return ViewChangeOutcome::Handled;
        }
        self.on_receive_new_view(view_info.new_view, origin, state, registry, timers)
    }

    fn install(
        &mut self,
        new_view: NewView,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
        timers: &mut TimerWheel,
    ) -> ViewChangeOutcome {
        // Adopt the newest stable checkpoint proven in the V set: the window must cover the
        // reconstructed seqnos, which start right above it.
        let best_checkpoint = new_view
            .view_changes
            .iter()
            .map(|vc| &vc.stable_checkpoint)
            .max_by_key(|certificate| certificate.seqno)
            .cloned()
            .expect("a correct New-View carries a quorum of view-changes");
        if best_checkpoint.seqno > state.window.low() {
            state.window.advance(best_checkpoint.seqno);
            let referenced = state.window.referenced_digests();
            state
                .requests
                .garbage_collect(best_checkpoint.seqno, &referenced);
            state.stable_checkpoint = best_checkpoint;
        }

        // Every unexecuted slot is re-initialized: ordering state from the dead view is void.
        // Slots this replica already executed are left alone; agreement guarantees the
        // reconstruction bound the same digests there.
        let unexecuted: Vec<_> = state
            .window
            .slots()
            .map(|slot| slot.seqno)
            .filter(|seqno| *seqno > state.last_executed)
            .collect();
        for seqno in unexecuted {
            let _ = state.window.reset_slot(seqno);
        }

        // Then the reconstructed Pre-Prepares are bound to their slots.
        for pre_prepare in &new_view.pre_prepares {
            if pre_prepare.seqno <= state.last_executed {
                continue;
            }
            let Ok(slot) = state.window.reset_slot(pre_prepare.seqno) else {
                continue;
            };
            slot.pre_prepare = Some(pre_prepare.clone());
        }

        state.view = new_view.view;
        state.phase = ReplicaPhase::Normal;
        state.equivocation_evidence = None;
        state.new_view = Some(new_view);
        self.collector.garbage_collect(state.view);
        self.last_assembled = Some(
            self.last_assembled
                .map_or(state.view, |assembled| assembled.max(state.view)),
        );

        // Fresh view, fresh accountability: the timer restarts if requests are still outstanding.
        if let Some(handle) = self.view_timer.take() {
            timers.cancel(handle);
        }
        if !self.awaited.is_empty() {
            self.view_timer = Some(timers.set(
                self.timeout_ms(),
                TimerKind::View { view: state.view },
            ));
        }

        Event::EnterView(EnterViewEvent {
            timestamp: SystemTime::now(),
            view: state.view,
        })
        .publish(&self.event_publisher);

        ViewChangeOutcome::Installed {
            catch_up_needed: state.last_executed < state.window.low(),
        }
    }
}
