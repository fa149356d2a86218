/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The requesting side of the log sync protocol.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Sender;
use std::time::SystemTime;

use borsh::BorshSerialize;
use rand::seq::SliceRandom;

use crate::app::{App, HostFailure};
use crate::checkpointing::types::CheckpointCertificate;
use crate::events::*;
use crate::ledger::Ledger;
use crate::messages::{AuthenticatedMessage, Message};
use crate::networking::network::Network;
use crate::networking::sending::SenderHandle;
use crate::requests::messages::{Reply, Request};
use crate::state::ReplicaState;
use crate::timers::{TimerHandle, TimerKind, TimerWheel};
use crate::types::basic::{Digest, PrincipalId, RequestId, SeqNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::PrincipalRegistry;

use super::messages::{AppendEntriesRequest, AppendEntriesResponse, MetaDataDigest};

/// Immutable parameters that define the behaviour of the [`LogSyncClient`] and should never
/// change.
pub(crate) struct LogSyncConfiguration {
    pub(crate) me: PrincipalId,
    pub(crate) keypair: Keypair,
    pub(crate) request_limit: u32,
    pub(crate) recovery_timeout_ms: u64,
}

struct InFlight {
    peer: PrincipalId,
    timer: TimerHandle,
}

/// State of one catch-up round: everything applied since the round began, held back from the
/// request table until the transfer verifies against a stable checkpoint digest.
struct SyncRound {
    /// The execution watermark when the round began; where a failed round rolls back to.
    base: SeqNumber,
    /// Per-client executed watermarks advanced by this round. The request table is only updated
    /// after verification, so the watermark the live path would have had is carried here.
    replayed_ids: HashMap<PrincipalId, RequestId>,
    /// Executions awaiting verification before they reach the reply cache.
    executed: Vec<(Request, Reply)>,
}

pub(crate) struct LogSyncClient<N: Network> {
    config: LogSyncConfiguration,
    sender: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
    in_flight: Option<InFlight>,
    round: Option<SyncRound>,
    // Peers whose response failed verification or never came, excluded until a round succeeds.
    excluded: HashSet<PrincipalId>,
}

impl<N: Network> LogSyncClient<N> {
    pub(crate) fn new(
        config: LogSyncConfiguration,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> LogSyncClient<N> {
        LogSyncClient {
            config,
            sender,
            event_publisher,
            in_flight: None,
            round: None,
            excluded: HashSet::new(),
        }
    }

    /// A peer advertised a stable checkpoint. If it proves we are behind, start syncing with that
    /// peer.
    pub(crate) fn on_receive_advertisement(
        &mut self,
        advertisement: MetaDataDigest,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
        timers: &mut TimerWheel,
    ) {
        if advertisement.verify_against(registry).is_err() {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return;
        }
        if advertisement.seqno <= state.window.low() {
            return;
        }
        self.start(Some(advertisement.from), state, registry, timers);
    }

    /// Begin (or continue) catching up: request entries starting right above the execution
    /// watermark. No-op while a request is already in flight.
    pub(crate) fn start(
        &mut self,
        preferred_peer: Option<PrincipalId>,
        state: &ReplicaState,
        registry: &PrincipalRegistry,
        timers: &mut TimerWheel,
    ) {
        if self.in_flight.is_some() {
            return;
        }

        let peer = match preferred_peer.filter(|peer| !self.excluded.contains(peer)) {
            Some(peer) => peer,
            None => {
                let eligible: Vec<PrincipalId> = registry
                    .replicas()
                    .filter(|id| *id != self.config.me && !self.excluded.contains(id))
                    .collect();
                match eligible.choose(&mut rand::thread_rng()) {
                    Some(peer) => *peer,
                    None => {
                        // Every peer failed this round; forgive and start over.
                        self.excluded.clear();
                        return;
                    }
                }
            }
        };

        if self.round.is_none() {
            self.round = Some(SyncRound {
                base: state.last_executed,
                replayed_ids: HashMap::new(),
                executed: Vec::new(),
            });
        }

        let from_seqno = state.last_executed + 1;
        let request = AppendEntriesRequest::new(
            registry,
            &self.config.keypair,
            peer,
            from_seqno,
            self.config.request_limit,
        );
        self.sender.send_message(peer, Message::from(request));

        let timer = timers.set(self.config.recovery_timeout_ms, TimerKind::Recovery);
        self.in_flight = Some(InFlight { peer, timer });

        Event::StartCatchUp(StartCatchUpEvent {
            timestamp: SystemTime::now(),
            peer,
            from_seqno,
        })
        .publish(&self.event_publisher);
    }

    /// The recovery timer fired: the in-flight peer never answered. Exclude it and retry against
    /// another.
    pub(crate) fn on_timeout(
        &mut self,
        state: &ReplicaState,
        registry: &PrincipalRegistry,
        timers: &mut TimerWheel,
    ) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        self.excluded.insert(in_flight.peer);
        if state.last_executed < state.window.low() {
            self.start(None, state, registry, timers);
        }
    }

    /// Handle a batch of entries. Entries are replayed through the host up to the seqno certified
    /// by the embedded stable checkpoint, then the host's state digest is checked against the
    /// certificate; a mismatch rolls the whole transfer back and blacklists the peer.
    ///
    /// Returns the certificate once the replica has caught up to it, for the caller to stabilize.
    pub(crate) fn on_receive_response(
        &mut self,
        response: AppendEntriesResponse,
        origin: PrincipalId,
        state: &mut ReplicaState,
        registry: &PrincipalRegistry,
        timers: &mut TimerWheel,
        app: &mut impl App,
        ledger: &mut impl Ledger,
    ) -> Result<Option<CheckpointCertificate>, HostFailure> {
        let Some(in_flight) = &self.in_flight else {
            return Ok(None);
        };
        if in_flight.peer != response.from || origin != response.from {
            return Ok(None);
        }
        if response.verify_against(registry).is_err()
            || !response.meta_data.stable_checkpoint.is_correct(registry)
        {
            state.counters.dropped_bad_auth += 1;
            state.counters.suspect(origin);
            return Ok(None);
        }

        let in_flight = self.in_flight.take().expect("checked above");
        timers.cancel(in_flight.timer);
        let peer = in_flight.peer;

        let certificate = response.meta_data.stable_checkpoint.clone();
        let mut round = self.round.take().unwrap_or(SyncRound {
            base: state.last_executed,
            replayed_ids: HashMap::new(),
            executed: Vec::new(),
        });
        let mut entries_applied = 0usize;

        for entry in &response.entries {
            // Entries must continue the local prefix densely and stay within the certified range.
            if entry.seqno != state.last_executed + 1 || entry.seqno > certificate.seqno {
                break;
            }

            // The same at-most-once filtering the live execution path applies, replayed over the
            // same evolving per-client watermarks, picks out the same sub-batch.
            let mut seen_in_batch: HashSet<Digest> = HashSet::new();
            let to_execute: Vec<Request> = entry
                .requests
                .iter()
                .filter(|request| {
                    let watermark = round
                        .replayed_ids
                        .get(&request.client)
                        .copied()
                        .or_else(|| state.requests.last_executed_id(request.client));
                    seen_in_batch.insert(request.digest())
                        && !watermark.is_some_and(|last| request.request_id <= last)
                })
                .cloned()
                .collect();

            let outcome = app.apply(entry.seqno, &to_execute)?;
            if outcome.replies.len() != to_execute.len() {
                return Err(HostFailure(format!(
                    "the host returned {} replies for a batch of {}",
                    outcome.replies.len(),
                    to_execute.len()
                )));
            }

            if ledger.latest() < entry.seqno {
                ledger.append(&entry.try_to_vec().unwrap());
            }

            for (request, payload) in to_execute.into_iter().zip(outcome.replies) {
                let watermark = round
                    .replayed_ids
                    .entry(request.client)
                    .or_insert(request.request_id);
                if request.request_id > *watermark {
                    *watermark = request.request_id;
                }
                let reply = Reply::new(
                    registry,
                    &self.config.keypair,
                    state.view,
                    request.request_id,
                    request.client,
                    payload,
                );
                round.executed.push((request, reply));
            }

            state.last_executed = entry.seqno;
            entries_applied += 1;
        }

        // The certificate is the only trust anchor for the replayed entries; if the host's state
        // does not hash to the certified digest, the whole round was corrupt and is undone. A
        // certificate at or below the round's base verifies nothing the round applied, so that
        // case falls through to the retry path instead.
        if certificate.seqno > round.base && state.last_executed >= certificate.seqno {
            if app.snapshot(certificate.seqno) != certificate.state_digest {
                app.rollback(round.base);
                ledger.truncate(round.base);
                state.last_executed = round.base;
                state.counters.suspect(peer);
                self.excluded.insert(peer);
                self.start(None, state, registry, timers);
                return Ok(None);
            }

            // Only a verified round's executions reach the reply cache. No replies are sent from
            // here: the replicas that executed these batches live already answered their clients.
            for (request, reply) in round.executed.drain(..) {
                state.requests.insert(request.clone());
                state.requests.mark_executed(&request, reply);
            }

            Event::EndCatchUp(EndCatchUpEvent {
                timestamp: SystemTime::now(),
                peer,
                entries_applied,
            })
            .publish(&self.event_publisher);
            self.excluded.clear();

            return if certificate.seqno > state.window.low() {
                Ok(Some(certificate))
            } else {
                Ok(None)
            };
        }

        // Either the batch limit cut the transfer short, or this peer's checkpoint is too old to
        // certify what the round has applied; the round continues, preferring the same peer only
        // if it actually made progress.
        self.round = Some(round);
        if entries_applied > 0 {
            self.start(Some(peer), state, registry, timers);
        } else {
            self.excluded.insert(peer);
            self.start(None, state, registry, timers);
        }
        Ok(None)
    }
}
