/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages that carry client requests and replies, and fetch missing request bodies.
//!
//! ## Messages
//!
//! 1. [`Request`]: sent by a client to order an operation, and forwarded between replicas. Signed
//!    by the client; the signature makes a request body self-certifying, so replicas can relay
//!    bodies on each other's behalf.
//! 2. [`Reply`]: sent by each replica back to the client after executing its request. A client
//!    accepts a result once f + 1 replicas sent matching replies.
//! 3. [`Fetch`]: sent by a replica that received a Pre-Prepare referencing a request digest it does
//!    not hold.
//! 4. [`Data`]: answers a `Fetch` with the full request body.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::{AuthenticatedMessage, SignedMessage};
use crate::types::basic::{Digest, PrincipalId, RequestId, SignatureBytes, ViewNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::{Authenticator, PrincipalRegistry};

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum RequestMessage {
    Request(Request),
    Fetch(Fetch),
    Data(Data),
}

impl From<Request> for RequestMessage {
    fn from(request: Request) -> Self {
        RequestMessage::Request(request)
    }
}

impl From<Fetch> for RequestMessage {
    fn from(fetch: Fetch) -> Self {
        RequestMessage::Fetch(fetch)
    }
}

impl From<Data> for RequestMessage {
    fn from(data: Data) -> Self {
        RequestMessage::Data(data)
    }
}

/// An operation submitted by a client for ordering.
///
/// The pair (`client`, `request_id`) identifies the request uniquely; request ids are issued
/// monotonically by each client, which is what lets replicas suppress duplicate execution.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Request {
    pub client: PrincipalId,
    pub request_id: RequestId,
    pub payload: Vec<u8>,
    pub signature: SignatureBytes,
}

impl Request {
    /// Create a request signed with the client's `keypair`.
    pub fn new(
        keypair: &Keypair,
        client: PrincipalId,
        request_id: RequestId,
        payload: Vec<u8>,
    ) -> Request {
        let message_bytes = (client, request_id, &payload).try_to_vec().unwrap();
        let signature = keypair.sign(&message_bytes);
        Request {
            client,
            request_id,
            payload,
            signature,
        }
    }

    /// The content digest of this request: a hash over client id, request id, and payload. The
    /// signature is deliberately excluded so that the digest is deterministic across
    /// retransmissions.
    pub fn digest(&self) -> Digest {
        Digest::of_bytes(
            &(self.client, self.request_id, &self.payload)
                .try_to_vec()
                .unwrap(),
        )
    }
}

impl SignedMessage for Request {
    fn message_bytes(&self) -> Vec<u8> {
        (self.client, self.request_id, &self.payload)
            .try_to_vec()
            .unwrap()
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }

    fn signer(&self) -> PrincipalId {
        self.client
    }
}

/// The outcome of executing one request, sent by a replica to the requesting client.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Reply {
    /// The view in which the request executed. Clients use this to track the current primary.
    pub view: ViewNumber,
    pub request_id: RequestId,
    pub client: PrincipalId,
    pub from: PrincipalId,
    pub payload: Vec<u8>,
    pub authenticator: Authenticator,
}

impl Reply {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        view: ViewNumber,
        request_id: RequestId,
        client: PrincipalId,
        payload: Vec<u8>,
    ) -> Reply {
        let from = registry.me();
        let auth_bytes = (view, request_id, client, from, &payload)
            .try_to_vec()
            .unwrap();
        let authenticator = registry.authenticate_to(client, keypair, &auth_bytes);
        Reply {
            view,
            request_id,
            client,
            from,
            payload,
            authenticator,
        }
    }
}

impl AuthenticatedMessage for Reply {
    fn auth_bytes(&self) -> Vec<u8> {
        (self.view, self.request_id, self.client, self.from, &self.payload)
            .try_to_vec()
            .unwrap()
    }

    fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    fn sender(&self) -> PrincipalId {
        self.from
    }
}

/// Asks a peer for the body of the request with the given digest.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Fetch {
    pub digest: Digest,
    pub from: PrincipalId,
    pub authenticator: Authenticator,
}

impl Fetch {
    pub(crate) fn new(registry: &PrincipalRegistry, keypair: &Keypair, digest: Digest) -> Fetch {
        let from = registry.me();
        let auth_bytes = (digest, from).try_to_vec().unwrap();
        let authenticator = registry.authenticate(keypair, &auth_bytes);
        Fetch {
            digest,
            from,
            authenticator,
        }
    }
}

impl AuthenticatedMessage for Fetch {
    fn auth_bytes(&self) -> Vec<u8> {
        (self.digest, self.from).try_to_vec().unwrap()
    }

    fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    fn sender(&self) -> PrincipalId {
        self.from
    }
}

/// Answers a [`Fetch`] with a full request body. Carries no authenticator of its own: the request
/// inside is already signed by its client, which is the proof that matters.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Data {
    pub request: Request,
}
