/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The client-side proxy that submits requests to the replica group and collates replies.
//!
//! A client cannot trust any single replica: up to f of them lie. The proxy therefore delivers a
//! result only once f + 1 replicas (at least one of them honest) sent matching replies for the
//! same request id.
//!
//! The proxy is driven by its host: [`submit`](ClientProxy::submit) sends a request, and
//! [`poll`](ClientProxy::poll) (called periodically) drains the network, retransmits overdue
//! requests with exponential backoff, and returns completed results. A fresh request is unicast to
//! the believed primary (learned from the view numbers on replies); once a retransmission becomes
//! necessary the proxy multicasts instead, which both reaches a live primary directly and, through
//! request forwarding, starts the view timers that dislodge a dead one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::configuration::Configuration;
use crate::messages::{AuthenticatedMessage, Message};
use crate::networking::network::Network;
use crate::requests::messages::{Request, RequestMessage};
use crate::types::basic::{PrincipalId, RequestId, ViewNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::{Principal, PrincipalRegistry, SessionKey};

/// Number of doublings after which the retransmission backoff stops growing.
const MAX_BACKOFF_EXPONENT: u32 = 10;

struct PendingRequest {
    request: Request,
    // Reply payloads per responding replica.
    replies: HashMap<PrincipalId, Vec<u8>>,
    last_sent: Instant,
    retransmissions: u32,
}

pub struct ClientProxy<N: Network> {
    registry: PrincipalRegistry,
    keypair: Keypair,
    network: N,
    retry_timeout: Duration,
    me: PrincipalId,
    next_request_id: RequestId,
    believed_primary: PrincipalId,
    highest_view_seen: ViewNumber,
    pending: HashMap<RequestId, PendingRequest>,
}

impl<N: Network> ClientProxy<N> {
    /// Create a proxy for the client identified by `keypair`, which must belong to one of the
    /// registered `principals`.
    ///
    /// # Panics
    ///
    /// Panics if the keypair does not belong to any registered principal.
    pub fn new(
        configuration: &Configuration,
        keypair: Keypair,
        principals: Vec<Principal>,
        session_keys: HashMap<PrincipalId, SessionKey>,
        mut network: N,
    ) -> ClientProxy<N> {
        let public_key = keypair.public();
        let me = principals
            .iter()
            .find(|principal| principal.verifying_key == public_key)
            .map(|principal| principal.id)
            .expect("the keypair does not belong to any registered principal");

        let registry = PrincipalRegistry::new(
            principals.clone(),
            configuration.num_replicas,
            configuration.max_faulty,
            configuration.authentication_scheme,
            me,
            session_keys,
        );
        network.init_principals(principals);

        let believed_primary = registry.primary(ViewNumber::init());
        ClientProxy {
            registry,
            keypair,
            network,
            retry_timeout: configuration.view_timeout,
            me,
            next_request_id: RequestId::init(),
            believed_primary,
            highest_view_seen: ViewNumber::init(),
            pending: HashMap::new(),
        }
    }

    /// Sign and submit an operation for ordering. Returns the request id under which the result
    /// will be delivered by [`poll`](ClientProxy::poll).
    pub fn submit(&mut self, payload: Vec<u8>) -> RequestId {
        self.next_request_id = self.next_request_id + 1;
        let request_id = self.next_request_id;

        let request = Request::new(&self.keypair, self.me, request_id, payload);
        self.network.send(
            self.believed_primary,
            Message::from(RequestMessage::Request(request.clone())),
        );

        self.pending.insert(
            request_id,
            PendingRequest {
                request,
                replies: HashMap::new(),
                last_sent: Instant::now(),
                retransmissions: 0,
            },
        );
        request_id
    }

    /// Withdraw a pending request. This stops retransmissions and reply collection; it cannot
    /// stop replicas from executing a request that was already ordered (their request tables
    /// suppress re-execution, not execution).
    pub fn cancel(&mut self, request_id: RequestId) {
        self.pending.remove(&request_id);
    }

    /// Drain the network, retransmit overdue requests, and return every request that has gathered
    /// f + 1 matching replies since the last call.
    pub fn poll(&mut self) -> Vec<(RequestId, Vec<u8>)> {
        while let Some((_origin, message)) = self.network.recv() {
            let Message::ReplyMessage(reply) = message else {
                continue;
            };
            if reply.client != self.me || !self.registry.is_replica(reply.from) {
                continue;
            }
            if reply.verify_against(&self.registry).is_err() {
                continue;
            }

            if reply.view > self.highest_view_seen {
                self.highest_view_seen = reply.view;
                self.believed_primary = self.registry.primary(reply.view);
            }

            if let Some(pending) = self.pending.get_mut(&reply.request_id) {
                pending.replies.insert(reply.from, reply.payload);
            }
        }

        let mut completed: Vec<(RequestId, Vec<u8>)> = Vec::new();
        let acceptance_threshold = self.registry.max_faulty() + 1;
        let completed_ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter_map(|(request_id, pending)| {
                matching_payload(&pending.replies, acceptance_threshold)
                    .map(|payload| (*request_id, payload))
            })
            .map(|(request_id, payload)| {
                completed.push((request_id, payload));
                request_id
            })
            .collect();
        for request_id in completed_ids {
            self.pending.remove(&request_id);
        }

        self.retransmit_overdue();
        completed
    }

    /// Multicast every request whose backoff deadline passed. The first deadline miss already
    /// abandons the primary-only path: the believed primary may be exactly what is broken.
    fn retransmit_overdue(&mut self) {
        for pending in self.pending.values_mut() {
            let backoff = self
                .retry_timeout
                .saturating_mul(1 << pending.retransmissions.min(MAX_BACKOFF_EXPONENT));
            if pending.last_sent.elapsed() >= backoff {
                self.network.broadcast(Message::from(RequestMessage::Request(
                    pending.request.clone(),
                )));
                pending.retransmissions += 1;
                pending.last_sent = Instant::now();
            }
        }
    }
}

/// The payload that at least `threshold` distinct replicas agree on, if any.
fn matching_payload(
    replies: &HashMap<PrincipalId, Vec<u8>>,
    threshold: u32,
) -> Option<Vec<u8>> {
    let mut counts: HashMap<&Vec<u8>, u32> = HashMap::new();
    for payload in replies.values() {
        let count = counts.entry(payload).or_insert(0);
        *count += 1;
        if *count >= threshold {
            return Some(payload.clone());
        }
    }
    None
}
