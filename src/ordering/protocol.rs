/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Implementation of the three-phase ordering subprotocol.
//!
//! [`Ordering`] holds the per-replica side of the Pre-Prepare/Prepare/Commit exchange: the
//! primary's batching queue and seqno counter, and the handlers that admit inbound messages into
//! the [log window](crate::state::window::LogWindow), advance slot phases on quorum, and deliver
//! committed batches to the host in strict seqno order.
//!
//! Handlers run to completion on the dispatch thread and never call back into the network except
//! through the [`SenderHandle`](crate::networking::sending::SenderHandle); effects that belong to
//! other subprotocols (arming the view timer, starting a view change on equivocation, fetch timer
//! management) are reported outward through [`RequestOutcome`] and [`OrderingOutcome`] for the
//! [algorithm](crate::algorithm) to act on.

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::Sender;
use std::time::SystemTime;

use borsh::BorshSerialize;

use crate::app::{App, HostFailure};
use crate::events::*;
use crate::ledger::Ledger;
use crate::log_sync::messages::LedgerEntry;
use crate::messages::{AuthenticatedMessage, Message, SignedMessage};
use crate::networking::network::Network;
use crate::networking::sending::SenderHandle;
use crate::ordering::messages::{Commit, OrderingMessage, PrePrepare, Prepare, RequestRef};
use crate::requests::messages::{Fetch, Reply, Request};
use crate::requests::table::InsertOutcome;
use crate::state::window::SlotPhase;
use crate::state::{ReplicaPhase, ReplicaState};
use crate::types::basic::{Digest, PrincipalId, SeqNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::{Principal, PrincipalRegistry, Role, SessionKey};

/// Immutable parameters that define the behaviour of the [`Ordering`] subprotocol and should never
/// change.
pub(crate) struct OrderingConfiguration {
    pub(crate) me: PrincipalId,
    pub(crate) keypair: Keypair,
    pub(crate) max_batch_size: usize,
    pub(crate) big_request_threshold: usize,
}

/// What handling a client request amounted to.
pub(crate) enum RequestOutcome {
    /// The request was admitted. The caller should arm the view timer for `digest`; if
    /// `resumed_slot` is set, the body filled a digest a slot was parked on and the caller should
    /// cancel the corresponding fetch timer.
    Accepted {
        digest: Digest,
        resumed_slot: Option<SeqNumber>,
    },
    /// The request already executed; its cached reply was resent.
    AlreadyExecuted,
    Dropped,
}

/// What handling an ordering message amounted to.
pub(crate) enum OrderingOutcome {
    Handled,
    Dropped,
    /// The primary equivocated; the evidence is stored in
    /// [`ReplicaState::equivocation_evidence`] and the caller must arm a view change.
    Equivocation,
    /// A Pre-Prepare was admitted with missing request bodies; fetches were broadcast and the
    /// caller should arm fetch timers for the digests.
    FetchesNeeded(Vec<Digest>),
}

/// One batch delivered to the host, as reported to the algorithm for post-execution bookkeeping.
pub(crate) struct ExecutedBatch {
    pub(crate) seqno: SeqNumber,
    pub(crate) request_digests: Vec<Digest>,
    pub(crate) new_principals: Vec<(Principal, Option<SessionKey>)>,
}

pub(crate) struct Ordering<N: Network> {
    config: OrderingConfiguration,
    sender: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
    // Primary-only state: requests awaiting a batch, and the next seqno to bind.
    pending: VecDeque<Digest>,
    next_seqno: SeqNumber,
}

impl<N: Network> Ordering<N> {
    pub(crate) fn new(
        config: OrderingConfiguration,
        sender: SenderHandle<N>,
        init_next_seqno: SeqNumber,
        event_publisher: Option<Sender<Event>>,
    ) -> Ordering<N> {
        Ordering {
            config,
            sender,
            event_publisher,
            pending: VecDeque::new(),
            next_seqno: init_next_seqno,
        }
    }

    /// Recompute the primary-side seqno counter on entering a view: one past the highest slot with
    /// an accepted Pre-Prepare, or one past the execution watermark, whichever is higher.
    pub(crate) fn on_enter_view(&mut self, state: &ReplicaState) {
        let highest_bound = state
            .window
            .slots()
            .filter(|slot| slot.pre_prepare.is_some())
            .map(|slot| slot.seqno)
            .max()
            .unwrap_or(state.last_executed);
        self.next_seqno = highest_bound.max(state.last_executed) + 1;
    }

    /// Handle a request arriving from a client, a forwarding backup, or a fetch.
    pub(crate) fn on_receive_request(
        &mut self,
        request: Request,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) -> RequestOutcome {
        if !request.is_correct(registry) {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return RequestOutcome::Dropped;
        }
        match registry.principal(request.client) {
            Some(principal) if principal.role == Role::Client => (),
            _ => {
                state.counters.dropped_bad_auth += 1;
                return RequestOutcome::Dropped;
            }
        }

        let digest = request.digest();
        Event::ReceiveRequest(ReceiveRequestEvent {
            timestamp: SystemTime::now(),
            origin,
            client: request.client,
            digest,
        })
        .publish(&self.event_publisher);

        // At-most-once: a request at or below the client's executed watermark is answered from the
        // reply cache, never re-executed.
        if let Some(last_executed_id) = state.requests.last_executed_id(request.client) {
            if request.request_id <= last_executed_id {
                if let Some(reply) = state.requests.cached_reply(request.client, request.request_id)
                {
                    let reply = reply.clone();
                    self.sender
                        .send_message(request.client, Message::from(reply));
                }
                return RequestOutcome::AlreadyExecuted;
            }
        }

        let insert_outcome = state.requests.insert(request.clone());
        let resumed_slot = match insert_outcome {
            InsertOutcome::FilledWanted { seqno } => Some(seqno),
            _ => None,
        };

        // Every replica queues the request, not just the primary: if a view change puts this
        // replica in charge, whatever is still unexecuted in the queue gets ordered then.
        if insert_outcome != InsertOutcome::Duplicate {
            self.pending.push_back(digest);
        }

        if state.phase == ReplicaPhase::Normal {
            if self.config.me == registry.primary(state.view) {
                self.try_issue_pre_prepares(state, registry);
            } else if insert_outcome == InsertOutcome::New {
                // Backups relay the request to the primary, then hold it accountable for ordering
                // it (the caller arms the view timer).
                self.sender.send_message(
                    registry.primary(state.view),
                    Message::from(crate::requests::messages::RequestMessage::Request(request)),
                );
            }
        }

        RequestOutcome::Accepted {
            digest,
            resumed_slot,
        }
    }

    /// The low watermark advanced: seqnos that were outside the window are now available, so a
    /// primary with queued requests picks up where it left off.
    pub(crate) fn on_window_advanced(
        &mut self,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) {
        if state.phase == ReplicaPhase::Normal && self.config.me == registry.primary(state.view) {
            self.try_issue_pre_prepares(state, registry);
        }
    }

    /// Bind as many pending batches to seqnos as the window admits.
    fn try_issue_pre_prepares(&mut self, state: &mut ReplicaState, registry: &PrincipalRegistry) {
        loop {
            if self.pending.is_empty() || !state.window.contains(self.next_seqno) {
                return;
            }

            let mut batch: Vec<RequestRef> = Vec::new();
            while batch.len() < self.config.max_batch_size {
                let Some(digest) = self.pending.pop_front() else {
                    break;
                };
                let Some(request) = state.requests.get(&digest) else {
                    // Evicted or executed since it was queued.
                    continue;
                };
                if state
                    .requests
                    .last_executed_id(request.client)
                    .is_some_and(|last| request.request_id <= last)
                {
                    continue;
                }
                if request.payload.len() >= self.config.big_request_threshold {
                    batch.push(RequestRef::ByDigest(digest));
                } else {
                    batch.push(RequestRef::Inline(request.clone()));
                }
            }
            if batch.is_empty() {
                return;
            }

            let pre_prepare = PrePrepare::new(
                registry,
                &self.config.keypair,
                state.view,
                self.next_seqno,
                batch,
            );
            self.next_seqno += 1;

            Event::PrePrepare(PrePrepareEvent {
                timestamp: SystemTime::now(),
                pre_prepare: pre_prepare.clone(),
            })
            .publish(&self.event_publisher);

            // The loopback delivery admits the primary's own Pre-Prepare through the regular
            // handler, so the slot state is built the same way on every replica.
            self.sender
                .broadcast_protocol(OrderingMessage::from(pre_prepare));
        }
    }

    pub(crate) fn on_receive_pre_prepare(
        &mut self,
        pre_prepare: PrePrepare,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) -> OrderingOutcome {
        if state.phase != ReplicaPhase::Normal {
            return OrderingOutcome::Dropped;
        }
        if pre_prepare.view != state.view {
            state.counters.dropped_stale_view += 1;
            return OrderingOutcome::Dropped;
        }

        let primary = registry.primary(state.view);
        if pre_prepare.from != primary
            || pre_prepare.verify_against(registry).is_err()
            || pre_prepare.is_well_formed(registry, primary).is_err()
        {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return OrderingOutcome::Dropped;
        }
        for request_ref in &pre_prepare.requests {
            if let RequestRef::Inline(request) = request_ref {
                if !request.is_correct(registry) {
                    state.counters.dropped_bad_auth += 1;
                    state.counters.suspect(origin);
                    return OrderingOutcome::Dropped;
                }
            }
        }

        if state.equivocation_evidence.is_some() {
            // The primary already proved itself faulty in this view; nothing more is accepted from
            // it.
            return OrderingOutcome::Dropped;
        }

        if !state.window.contains(pre_prepare.seqno) {
            state.counters.dropped_out_of_window += 1;
            return OrderingOutcome::Dropped;
        }

        let seqno = pre_prepare.seqno;
        let existing = state
            .window
            .slot(seqno)
            .expect("containment was just checked")
            .pre_prepare
            .clone();
        if let Some(existing) = existing {
            if existing.batch_digest == pre_prepare.batch_digest {
                // Re-delivery of a known Pre-Prepare (e.g. via status retransmission) is a no-op
                // beyond re-checking quorums, and a no-op outright for committed slots.
                self.check_prepared(seqno, state, registry);
                return OrderingOutcome::Handled;
            } else {
                // Two Pre-Prepares for the same (view, seqno) with different digests, both
                // correctly signed by the primary: proof of equivocation.
                state.equivocation_evidence = Some(Box::new((existing, pre_prepare)));
                return OrderingOutcome::Equivocation;
            }
        }

        // Pull inline bodies into the table and fetch the missing referenced ones.
        let mut missing: Vec<Digest> = Vec::new();
        for request_ref in &pre_prepare.requests {
            match request_ref {
                RequestRef::Inline(request) => {
                    state.requests.insert(request.clone());
                }
                RequestRef::ByDigest(digest) => {
                    if state.requests.mark_wanted(*digest, seqno) {
                        missing.push(*digest);
                        let fetch = Fetch::new(registry, &self.config.keypair, *digest);
                        self.sender.broadcast_request(fetch);
                    }
                }
            }
        }

        Event::ReceivePrePrepare(ReceivePrePrepareEvent {
            timestamp: SystemTime::now(),
            origin,
            pre_prepare: pre_prepare.clone(),
        })
        .publish(&self.event_publisher);

        let slot = state
            .window
            .slot_mut(seqno)
            .expect("containment was just checked");
        slot.pre_prepare = Some(pre_prepare);

        if missing.is_empty() {
            self.become_pre_prepared(seqno, state, registry);
            OrderingOutcome::Handled
        } else {
            slot.missing_requests = missing.iter().copied().collect();
            slot.advance_phase(SlotPhase::AwaitingRequests);
            OrderingOutcome::FetchesNeeded(missing)
        }
    }

    /// After a New-View installed reconstructed Pre-Prepares, resume the ordering state machine:
    /// re-derive the primary-side seqno counter, then walk every slot holding a fresh Pre-Prepare,
    /// fetching missing bodies and endorsing the complete ones. Returns the digests whose fetch
    /// timers the caller must arm.
    pub(crate) fn resume_after_view_change(
        &mut self,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) -> Vec<Digest> {
        self.on_enter_view(state);

        let installed: Vec<SeqNumber> = state
            .window
            .slots()
            .filter(|slot| slot.phase == SlotPhase::Empty && slot.pre_prepare.is_some())
            .map(|slot| slot.seqno)
            .collect();

        let mut fetches = Vec::new();
        for seqno in installed {
            let pre_prepare = state
                .window
                .slot(seqno)
                .expect("the slot was just enumerated")
                .pre_prepare
                .clone()
                .expect("the slot was just enumerated with a Pre-Prepare");

            let mut missing: Vec<Digest> = Vec::new();
            for request_ref in &pre_prepare.requests {
                match request_ref {
                    RequestRef::Inline(request) => {
                        state.requests.insert(request.clone());
                    }
                    RequestRef::ByDigest(digest) => {
                        if state.requests.mark_wanted(*digest, seqno) {
                            missing.push(*digest);
                            let fetch = Fetch::new(registry, &self.config.keypair, *digest);
                            self.sender.broadcast_request(fetch);
                        }
                    }
                }
            }

            if missing.is_empty() {
                self.become_pre_prepared(seqno, state, registry);
            } else {
                let slot = state
                    .window
                    .slot_mut(seqno)
                    .expect("the slot was just enumerated");
                slot.missing_requests = missing.iter().copied().collect();
                slot.advance_phase(SlotPhase::AwaitingRequests);
                fetches.extend(missing);
            }
        }

        // If this replica is the new primary, requests queued before the view change get batched
        // under the new view.
        if self.config.me == registry.primary(state.view) && state.phase == ReplicaPhase::Normal {
            self.try_issue_pre_prepares(state, registry);
        }

        fetches
    }

    /// Called when a previously missing request body arrived (via a Data response, or directly
    /// from the client).
    pub(crate) fn on_request_arrived(
        &mut self,
        digest: Digest,
        seqno: SeqNumber,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) {
        let Ok(slot) = state.window.slot_mut(seqno) else {
            return;
        };
        slot.missing_requests.remove(&digest);
        if slot.phase == SlotPhase::AwaitingRequests && slot.missing_requests.is_empty() {
            self.become_pre_prepared(seqno, state, registry);
        }
    }

    /// The slot has its Pre-Prepare and all request bodies: mark it pre-prepared, endorse it if
    /// this replica is a backup, and re-check the quorums that buffered endorsements may already
    /// satisfy.
    fn become_pre_prepared(
        &mut self,
        seqno: SeqNumber,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) {
        let digest = {
            let slot = state
                .window
                .slot_mut(seqno)
                .expect("the caller verified containment");
            slot.advance_phase(SlotPhase::PrePrepared);
            slot.digest()
                .expect("a pre-prepared slot holds its Pre-Prepare")
        };

        if self.config.me != registry.primary(state.view) {
            let prepare = Prepare::new(
                registry,
                &self.config.keypair,
                state.view,
                seqno,
                digest,
            );
            Event::Prepare(PrepareEvent {
                timestamp: SystemTime::now(),
                prepare: prepare.clone(),
            })
            .publish(&self.event_publisher);
            self.sender.broadcast_protocol(OrderingMessage::from(prepare));
        }

        self.check_prepared(seqno, state, registry);
    }

    pub(crate) fn on_receive_prepare(
        &mut self,
        prepare: Prepare,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) -> OrderingOutcome {
        if state.phase != ReplicaPhase::Normal {
            return OrderingOutcome::Dropped;
        }
        if prepare.view != state.view {
            state.counters.dropped_stale_view += 1;
            return OrderingOutcome::Dropped;
        }
        // The primary's endorsement of its own Pre-Prepare is implicit; an explicit Prepare from
        // it is a protocol violation.
        if !registry.is_replica(prepare.from) || prepare.from == registry.primary(state.view) {
            state.counters.suspect(origin);
            return OrderingOutcome::Dropped;
        }
        if prepare.verify_against(registry).is_err()
            || prepare.verify_digest_signature(registry).is_err()
        {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return OrderingOutcome::Dropped;
        }
        if !state.window.contains(prepare.seqno) {
            state.counters.dropped_out_of_window += 1;
            return OrderingOutcome::Dropped;
        }

        let seqno = prepare.seqno;
        Event::ReceivePrepare(ReceivePrepareEvent {
            timestamp: SystemTime::now(),
            origin,
            prepare: prepare.clone(),
        })
        .publish(&self.event_publisher);

        // Prepares may arrive before the Pre-Prepare; they are buffered in the collector and
        // count once the digest is bound.
        state
            .window
            .slot_mut(seqno)
            .expect("containment was just checked")
            .prepares
            .collect(prepare);

        self.check_prepared(seqno, state, registry);
        OrderingOutcome::Handled
    }

    pub(crate) fn on_receive_commit(
        &mut self,
        commit: Commit,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) -> OrderingOutcome {
        if state.phase != ReplicaPhase::Normal {
            return OrderingOutcome::Dropped;
        }
        if commit.view != state.view {
            state.counters.dropped_stale_view += 1;
            return OrderingOutcome::Dropped;
        }
        if !registry.is_replica(commit.from) {
            state.counters.suspect(origin);
            return OrderingOutcome::Dropped;
        }
        if commit.verify_against(registry).is_err()
            || commit.verify_digest_signature(registry).is_err()
        {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return OrderingOutcome::Dropped;
        }
        if !state.window.contains(commit.seqno) {
            state.counters.dropped_out_of_window += 1;
            return OrderingOutcome::Dropped;
        }

        let seqno = commit.seqno;
        Event::ReceiveCommit(ReceiveCommitEvent {
            timestamp: SystemTime::now(),
            origin,
            commit: commit.clone(),
        })
        .publish(&self.event_publisher);

        state
            .window
            .slot_mut(seqno)
            .expect("containment was just checked")
            .commits
            .collect(commit);

        self.check_committed(seqno, state, registry);
        OrderingOutcome::Handled
    }

    /// Transition the slot to prepared once it holds its Pre-Prepare plus 2f matching Prepares
    /// from replicas other than the primary, and broadcast this replica's Commit.
    fn check_prepared(
        &mut self,
        seqno: SeqNumber,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) {
        let digest = {
            let Ok(slot) = state.window.slot_mut(seqno) else {
                return;
            };
            if slot.phase != SlotPhase::PrePrepared {
                return;
            }
            let Some(digest) = slot.digest() else {
                return;
            };
            if slot.prepares.count(&digest) < 2 * registry.max_faulty() {
                return;
            }
            slot.advance_phase(SlotPhase::Prepared);
            digest
        };

        let commit = Commit::new(registry, &self.config.keypair, state.view, seqno, digest);
        Event::Commit(CommitEvent {
            timestamp: SystemTime::now(),
            commit: commit.clone(),
        })
        .publish(&self.event_publisher);
        self.sender.broadcast_protocol(OrderingMessage::from(commit));

        self.check_committed(seqno, state, registry);
    }

    /// Transition the slot to committed once it is prepared and 2f + 1 matching Commits (this
    /// replica's own counted) have been collected.
    fn check_committed(
        &mut self,
        seqno: SeqNumber,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
    ) {
        let Ok(slot) = state.window.slot_mut(seqno) else {
            return;
        };
        if slot.phase != SlotPhase::Prepared {
            return;
        }
        let Some(digest) = slot.digest() else {
            return;
        };
        if slot.commits.count(&digest) >= registry.quorum() {
            slot.advance_phase(SlotPhase::Committed);
        }
    }

    /// Deliver committed batches to the host in strict seqno order, starting right above the
    /// execution watermark, and send a reply per executed request.
    ///
    /// Returns the executed batches for post-execution bookkeeping (view timer, checkpoints,
    /// reconfiguration), or the host's failure, which the caller treats as fatal.
    pub(crate) fn try_execute(
        &mut self,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
        app: &mut impl App,
        ledger: &mut impl Ledger,
    ) -> Result<Vec<ExecutedBatch>, HostFailure> {
        let mut executed = Vec::new();

        loop {
            let next = state.last_executed + 1;
            match state.window.slot(next) {
                Ok(slot) if slot.phase == SlotPhase::Committed => (),
                _ => break,
            }

            let pre_prepare = state
                .window
                .slot(next)
                .expect("the slot was just read")
                .pre_prepare
                .clone()
                .expect("a committed slot holds its Pre-Prepare");

            let batch: Vec<Request> = pre_prepare
                .requests
                .iter()
                .map(|request_ref| match request_ref {
                    RequestRef::Inline(request) => request.clone(),
                    RequestRef::ByDigest(digest) => state
                        .requests
                        .get(digest)
                        .expect("a committed slot's referenced requests are present")
                        .clone(),
                })
                .collect();

            // At-most-once, applied deterministically: duplicates (by the client's executed
            // watermark, or within the batch itself) are excluded from delivery on every correct
            // replica alike.
            let mut seen_in_batch: HashSet<Digest> = HashSet::new();
            let to_execute: Vec<Request> = batch
                .iter()
                .filter(|request| {
                    seen_in_batch.insert(request.digest())
                        && !state
                            .requests
                            .last_executed_id(request.client)
                            .is_some_and(|last| request.request_id <= last)
                })
                .cloned()
                .collect();

            let outcome = app.apply(next, &to_execute)?;
            if outcome.replies.len() != to_execute.len() {
                return Err(HostFailure(format!(
                    "the host returned {} replies for a batch of {}",
                    outcome.replies.len(),
                    to_execute.len()
                )));
            }

            ledger.append(
                &LedgerEntry {
                    seqno: next,
                    requests: batch.clone(),
                }
                .try_to_vec()
                .unwrap(),
            );

            for (request, payload) in to_execute.iter().zip(outcome.replies) {
                let reply = Reply::new(
                    registry,
                    &self.config.keypair,
                    state.view,
                    request.request_id,
                    request.client,
                    payload,
                );
                self.sender
                    .send_message(request.client, Message::from(reply.clone()));
                state.requests.mark_executed(request, reply);
            }

            state
                .window
                .slot_mut(next)
                .expect("the slot was just read")
                .advance_phase(SlotPhase::Executed);
            state.last_executed = next;

            Event::Execute(ExecuteEvent {
                timestamp: SystemTime::now(),
                seqno: next,
                batch_digest: pre_prepare.batch_digest,
                num_requests: batch.len(),
            })
            .publish(&self.event_publisher);

            executed.push(ExecutedBatch {
                seqno: next,
                request_digests: batch.iter().map(|request| request.digest()).collect(),
                new_principals: outcome.new_principals,
            });
        }

        if !executed.is_empty() {
            let executed_digests: HashSet<Digest> = executed
                .iter()
                .flat_map(|batch| batch.request_digests.iter().copied())
                .collect();
            self.pending
                .retain(|digest| !executed_digests.contains(digest));
        }

        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::{Arc, Mutex};

    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;
    use crate::app::ApplyOutcome;
    use crate::messages::ProtocolMessage;
    use crate::networking::receiving::Inbound;
    use crate::types::basic::{RequestId, ViewNumber};
    use crate::types::principals::AuthenticationScheme;

    /// A network that records everything handed to it instead of delivering anything.
    #[derive(Clone)]
    struct RecordingNetwork {
        sent: Arc<Mutex<Vec<(Option<PrincipalId>, Message)>>>,
    }

    impl RecordingNetwork {
        fn new() -> RecordingNetwork {
            RecordingNetwork {
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn broadcasts(&self) -> Vec<Message> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(peer, _)| peer.is_none())
                .map(|(_, msg)| msg.clone())
                .collect()
        }

        fn unicasts_to(&self, peer: PrincipalId) -> Vec<Message> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| *to == Some(peer))
                .map(|(_, msg)| msg.clone())
                .collect()
        }
    }

    impl Network for RecordingNetwork {
        fn init_principals(&mut self, _: Vec<Principal>) {}

        fn add_principal(&mut self, _: Principal) {}

        fn broadcast(&mut self, message: Message) {
            self.sent.lock().unwrap().push((None, message));
        }

        fn send(&mut self, peer: PrincipalId, message: Message) {
            self.sent.lock().unwrap().push((Some(peer), message));
        }

        fn recv(&mut self) -> Option<(PrincipalId, Message)> {
            None
        }
    }

    /// A counter state machine good enough to observe executions.
    struct CounterApp {
        counter: u64,
        version: SeqNumber,
    }

    impl App for CounterApp {
        fn apply(
            &mut self,
            seqno: SeqNumber,
            batch: &[Request],
        ) -> Result<ApplyOutcome, HostFailure> {
            let mut replies = Vec::new();
            for request in batch {
                self.counter += request.payload.len() as u64;
                replies.push(self.counter.to_le_bytes().to_vec());
            }
            self.version = seqno;
            Ok(ApplyOutcome {
                replies,
                new_principals: Vec::new(),
            })
        }

        fn snapshot(&mut self, seqno: SeqNumber) -> Digest {
            Digest::of_bytes(&(seqno, self.counter).try_to_vec().unwrap())
        }

        fn rollback(&mut self, _seqno: SeqNumber) {}

        fn current_version(&self) -> SeqNumber {
            self.version
        }

        fn compact(&mut self, _seqno: SeqNumber) {}
    }

    #[derive(Clone)]
    struct VecLedger {
        entries: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl crate::ledger::Ledger for VecLedger {
        fn append(&mut self, entry: &[u8]) {
            self.entries.lock().unwrap().push(entry.to_vec());
        }

        fn truncate(&mut self, seqno: SeqNumber) {
            self.entries.lock().unwrap().truncate(seqno.int() as usize);
        }

        fn get_entry(&self, seqno: SeqNumber) -> Option<Vec<u8>> {
            self.entries
                .lock()
                .unwrap()
                .get(seqno.int() as usize - 1)
                .cloned()
        }

        fn latest(&self) -> SeqNumber {
            SeqNumber::new(self.entries.lock().unwrap().len() as u64)
        }
    }

    fn keypairs(n: u32) -> Vec<Keypair> {
        (0..n)
            .map(|_| Keypair::new(SigningKey::generate(&mut OsRng)))
            .collect()
    }

    fn registry_for(me: u32, keypairs: &[Keypair]) -> PrincipalRegistry {
        let principals = keypairs
            .iter()
            .enumerate()
            .map(|(id, keypair)| Principal {
                id: PrincipalId::new(id as u32),
                role: if id < 4 { Role::Replica } else { Role::Client },
                verifying_key: keypair.public(),
                address: None,
            })
            .collect();
        PrincipalRegistry::new(
            principals,
            4,
            1,
            AuthenticationScheme::Signatures,
            PrincipalId::new(me),
            HashMap::new(),
        )
    }

    struct Harness {
        ordering: Ordering<RecordingNetwork>,
        state: ReplicaState,
        keypairs: Vec<Keypair>,
        registry: PrincipalRegistry,
        network: RecordingNetwork,
        loopback: Receiver<(PrincipalId, Inbound)>,
    }

    /// Build the ordering subprotocol of replica `me` in a 4-replica group with one client (id 4).
    fn harness(me: u32) -> Harness {
        let keypairs = keypairs(5);
        let registry = registry_for(me, &keypairs);
        let network = RecordingNetwork::new();
        let (loopback_sender, loopback) = mpsc::channel();
        let sender = SenderHandle::new(
            PrincipalId::new(me),
            network.clone(),
            loopback_sender,
        );
        let ordering = Ordering::new(
            OrderingConfiguration {
                me: PrincipalId::new(me),
                keypair: keypairs[me as usize].clone(),
                max_batch_size: 4,
                big_request_threshold: 1024,
            },
            sender,
            SeqNumber::new(1),
            None,
        );
        let state = ReplicaState::initialize(
            crate::checkpointing::types::CheckpointCertificate::genesis(Digest::of_bytes(
                b"genesis",
            )),
            8,
            64,
        );
        Harness {
            ordering,
            state,
            keypairs,
            registry,
            network,
            loopback,
        }
    }

    fn client_request(harness: &Harness, request_id: u64, payload: &[u8]) -> Request {
        Request::new(
            &harness.keypairs[4],
            PrincipalId::new(4),
            RequestId::new(request_id),
            payload.to_vec(),
        )
    }

    fn pre_prepare_from_primary(
        harness: &Harness,
        view: u64,
        seqno: u64,
        requests: Vec<RequestRef>,
    ) -> PrePrepare {
        let primary = (view % 4) as u32;
        PrePrepare::new(
            &registry_for(primary, &harness.keypairs),
            &harness.keypairs[primary as usize],
            ViewNumber::new(view),
            SeqNumber::new(seqno),
            requests,
        )
    }

    fn prepare_from(harness: &Harness, from: u32, view: u64, seqno: u64, digest: Digest) -> Prepare {
        Prepare::new(
            &registry_for(from, &harness.keypairs),
            &harness.keypairs[from as usize],
            ViewNumber::new(view),
            SeqNumber::new(seqno),
            digest,
        )
    }

    fn commit_from(harness: &Harness, from: u32, view: u64, seqno: u64, digest: Digest) -> Commit {
        Commit::new(
            &registry_for(from, &harness.keypairs),
            &harness.keypairs[from as usize],
            ViewNumber::new(view),
            SeqNumber::new(seqno),
            digest,
        )
    }

    #[test]
    fn slot_advances_through_quorums_and_executes() {
        // Replica 1 is a backup in view 0 (primary is replica 0).
        let mut h = harness(1);
        let request = client_request(&h, 1, b"op");
        let pre_prepare =
            pre_prepare_from_primary(&h, 0, 1, vec![RequestRef::Inline(request.clone())]);
        let digest = pre_prepare.batch_digest;

        let outcome = h.ordering.on_receive_pre_prepare(
            pre_prepare,
            PrincipalId::new(0),
            &mut h.state,
            &h.registry,
        );
        assert!(matches!(outcome, OrderingOutcome::Handled));
        assert_eq!(
            h.state.window.slot(SeqNumber::new(1)).unwrap().phase,
            SlotPhase::PrePrepared
        );

        // Accepting the Pre-Prepare made the backup broadcast its Prepare.
        let broadcasts = h.network.broadcasts();
        assert!(broadcasts.iter().any(|msg| matches!(
            msg,
            Message::ProtocolMessage(ProtocolMessage::OrderingMessage(OrderingMessage::Prepare(
                prepare
            ))) if prepare.digest == digest
        )));

        // Its own Prepare (via loopback) plus one more is 2f; the slot prepares and a Commit goes
        // out.
        let own_prepare = prepare_from(&h, 1, 0, 1, digest);
        h.ordering
            .on_receive_prepare(own_prepare, PrincipalId::new(1), &mut h.state, &h.registry);
        assert_eq!(
            h.state.window.slot(SeqNumber::new(1)).unwrap().phase,
            SlotPhase::PrePrepared
        );
        let second_prepare = prepare_from(&h, 2, 0, 1, digest);
        h.ordering
            .on_receive_prepare(second_prepare, PrincipalId::new(2), &mut h.state, &h.registry);
        assert_eq!(
            h.state.window.slot(SeqNumber::new(1)).unwrap().phase,
            SlotPhase::Prepared
        );
        assert!(h.network.broadcasts().iter().any(|msg| matches!(
            msg,
            Message::ProtocolMessage(ProtocolMessage::OrderingMessage(OrderingMessage::Commit(
                commit
            ))) if commit.digest == digest
        )));

        // 2f + 1 commits (own included) commit the slot; execution delivers the batch and
        // replies to the client.
        for from in [1u32, 2, 3] {
            let commit = commit_from(&h, from, 0, 1, digest);
            h.ordering.on_receive_commit(
                commit,
                PrincipalId::new(from),
                &mut h.state,
                &h.registry,
            );
        }
        assert_eq!(
            h.state.window.slot(SeqNumber::new(1)).unwrap().phase,
            SlotPhase::Committed
        );

        let mut app = CounterApp {
            counter: 0,
            version: SeqNumber::init(),
        };
        let mut ledger = VecLedger {
            entries: Arc::new(Mutex::new(Vec::new())),
        };
        let executed = h
            .ordering
            .try_execute(&mut h.state, &h.registry, &mut app, &mut ledger)
            .unwrap();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].seqno, SeqNumber::new(1));
        assert_eq!(h.state.last_executed, SeqNumber::new(1));
        assert_eq!(app.counter, 2);
        assert_eq!(ledger.latest(), SeqNumber::new(1));
        assert!(!h.network.unicasts_to(PrincipalId::new(4)).is_empty());

        // Re-delivering the Pre-Prepare for the committed (and now executed) slot is a no-op.
        let replay =
            pre_prepare_from_primary(&h, 0, 1, vec![RequestRef::Inline(request)]);
        let outcome = h.ordering.on_receive_pre_prepare(
            replay,
            PrincipalId::new(0),
            &mut h.state,
            &h.registry,
        );
        assert!(matches!(outcome, OrderingOutcome::Handled));
        assert_eq!(
            h.state.window.slot(SeqNumber::new(1)).unwrap().phase,
            SlotPhase::Executed
        );
    }

    #[test]
    fn equivocating_primary_is_detected_and_frozen_out() {
        let mut h = harness(1);
        let first = pre_prepare_from_primary(
            &h,
            0,
            1,
            vec![RequestRef::Inline(client_request(&h, 1, b"one"))],
        );
        let second = pre_prepare_from_primary(
            &h,
            0,
            1,
            vec![RequestRef::Inline(client_request(&h, 2, b"two"))],
        );

        let outcome =
            h.ordering
                .on_receive_pre_prepare(first, PrincipalId::new(0), &mut h.state, &h.registry);
        assert!(matches!(outcome, OrderingOutcome::Handled));

        let outcome =
            h.ordering
                .on_receive_pre_prepare(second, PrincipalId::new(0), &mut h.state, &h.registry);
        assert!(matches!(outcome, OrderingOutcome::Equivocation));
        let evidence = h.state.equivocation_evidence.as_ref().unwrap();
        assert_eq!(evidence.0.seqno, evidence.1.seqno);
        assert_ne!(evidence.0.batch_digest, evidence.1.batch_digest);

        // Nothing further is accepted from the equivocating primary in this view.
        let third = pre_prepare_from_primary(
            &h,
            0,
            2,
            vec![RequestRef::Inline(client_request(&h, 3, b"three"))],
        );
        let outcome =
            h.ordering
                .on_receive_pre_prepare(third, PrincipalId::new(0), &mut h.state, &h.registry);
        assert!(matches!(outcome, OrderingOutcome::Dropped));
    }

    #[test]
    fn prepares_from_the_primary_and_forged_prepares_are_rejected() {
        let mut h = harness(1);
        let pre_prepare = pre_prepare_from_primary(
            &h,
            0,
            1,
            vec![RequestRef::Inline(client_request(&h, 1, b"op"))],
        );
        let digest = pre_prepare.batch_digest;
        h.ordering.on_receive_pre_prepare(
            pre_prepare,
            PrincipalId::new(0),
            &mut h.state,
            &h.registry,
        );

        // The primary's endorsement is implicit; an explicit Prepare from it is dropped.
        let from_primary = prepare_from(&h, 0, 0, 1, digest);
        let outcome = h.ordering.on_receive_prepare(
            from_primary,
            PrincipalId::new(0),
            &mut h.state,
            &h.registry,
        );
        assert!(matches!(outcome, OrderingOutcome::Dropped));

        // A prepare whose embedded signature does not belong to its claimed sender is dropped
        // and bumps the forwarder's suspicion.
        let mut forged = prepare_from(&h, 2, 0, 1, digest);
        forged.from = PrincipalId::new(3);
        let outcome = h.ordering.on_receive_prepare(
            forged,
            PrincipalId::new(2),
            &mut h.state,
            &h.registry,
        );
        assert!(matches!(outcome, OrderingOutcome::Dropped));
        assert_eq!(h.state.counters.dropped_bad_auth, 1);
        assert!(h.state.counters.suspicion.contains_key(&PrincipalId::new(2)));

        assert_eq!(
            h.state
                .window
                .slot(SeqNumber::new(1))
                .unwrap()
                .prepares
                .count(&digest),
            0
        );
    }

    #[test]
    fn pre_prepare_referencing_unknown_digest_parks_and_fetches() {
        let mut h = harness(1);
        let request = client_request(&h, 1, b"a big request body");
        let digest = request.digest();
        let pre_prepare = pre_prepare_from_primary(&h, 0, 1, vec![RequestRef::ByDigest(digest)]);

        let outcome = h.ordering.on_receive_pre_prepare(
            pre_prepare,
            PrincipalId::new(0),
            &mut h.state,
            &h.registry,
        );
        match outcome {
            OrderingOutcome::FetchesNeeded(digests) => assert_eq!(digests, vec![digest]),
            _ => panic!("expected the slot to park on the missing body"),
        }
        assert_eq!(
            h.state.window.slot(SeqNumber::new(1)).unwrap().phase,
            SlotPhase::AwaitingRequests
        );
        // A Fetch went out.
        assert!(h.network.broadcasts().iter().any(|msg| matches!(
            msg,
            Message::RequestMessage(crate::requests::messages::RequestMessage::Fetch(fetch))
                if fetch.digest == digest
        )));

        // The body arrives (as a forwarded request); the slot resumes and the backup endorses it.
        let outcome = h.ordering.on_receive_request(
            request,
            PrincipalId::new(3),
            &mut h.state,
            &h.registry,
        );
        let resumed = match outcome {
            RequestOutcome::Accepted { resumed_slot, .. } => resumed_slot,
            _ => panic!("the body should have been accepted"),
        };
        assert_eq!(resumed, Some(SeqNumber::new(1)));
        h.ordering
            .on_request_arrived(digest, SeqNumber::new(1), &mut h.state, &h.registry);
        assert_eq!(
            h.state.window.slot(SeqNumber::new(1)).unwrap().phase,
            SlotPhase::PrePrepared
        );
        drop(h.loopback);
    }

    #[test]
    fn primary_batches_and_issues_pre_prepares_in_order() {
        // Replica 0 is the primary of view 0.
        let mut h = harness(0);

        for id in 1..=3u64 {
            let request = client_request(&h, id, &[id as u8]);
            h.ordering
                .on_receive_request(request, PrincipalId::new(4), &mut h.state, &h.registry);
        }

        // Requests arriving one at a time are bound to consecutive seqnos as they come.
        let pre_prepares: Vec<PrePrepare> = h
            .network
            .broadcasts()
            .into_iter()
            .filter_map(|msg| match msg {
                Message::ProtocolMessage(ProtocolMessage::OrderingMessage(
                    OrderingMessage::PrePrepare(pre_prepare),
                )) => Some(pre_prepare),
                _ => None,
            })
            .collect();
        assert_eq!(pre_prepares.len(), 3);
        for (index, pre_prepare) in pre_prepares.iter().enumerate() {
            assert_eq!(pre_prepare.seqno, SeqNumber::new(index as u64 + 1));
            assert_eq!(pre_prepare.view, ViewNumber::init());
        }
    }
}
