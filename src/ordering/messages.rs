/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages that are sent between replicas as part of the three-phase ordering
//! subprotocol.
//!
//! ## Messages
//!
//! 1. [`PrePrepare`]: broadcasted by the primary of a view, assigns a sequence number to a batch of
//!    requests.
//! 2. [`Prepare`]: broadcasted by each backup that accepted a Pre-Prepare, endorses the (view,
//!    seqno, digest) binding.
//! 3. [`Commit`]: broadcasted by each replica whose slot reached the prepared state, commits the
//!    binding.
//!
//! ## Embedded digest signatures
//!
//! Each of the three messages embeds an ed25519 signature over (view, seqno, digest) in addition to
//! its outer [`Authenticator`]. In the session-MAC authentication scheme the outer authenticator is
//! cheap but not transferable; the embedded signatures are what make prepared certificates provable
//! to third parties, which the view-change subprotocol depends on. A Pre-Prepare's embedded
//! signature also lets any replica forward a stored Pre-Prepare on the primary's behalf during
//! retransmission.

use std::mem;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::{AuthenticatedMessage, Cacheable, ProtocolMessage};
use crate::requests::messages::Request;
use crate::types::basic::{Digest, PrincipalId, SeqNumber, SignatureBytes, ViewNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::{AuthError, Authenticator, PrincipalRegistry};

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum OrderingMessage {
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
}

impl OrderingMessage {
    /// Returns the view number associated with a given [`OrderingMessage`].
    pub fn view(&self) -> ViewNumber {
        match self {
            OrderingMessage::PrePrepare(PrePrepare { view, .. }) => *view,
            OrderingMessage::Prepare(Prepare { view, .. }) => *view,
            OrderingMessage::Commit(Commit { view, .. }) => *view,
        }
    }

    /// Returns the sequence number associated with a given [`OrderingMessage`].
    pub fn seqno(&self) -> SeqNumber {
        match self {
            OrderingMessage::PrePrepare(PrePrepare { seqno, .. }) => *seqno,
            OrderingMessage::Prepare(Prepare { seqno, .. }) => *seqno,
            OrderingMessage::Commit(Commit { seqno, .. }) => *seqno,
        }
    }

    /// Returns the number of bytes required to store a given instance of the [`OrderingMessage`]
    /// enum.
    pub fn size(&self) -> u64 {
        match self {
            OrderingMessage::PrePrepare(pre_prepare) => {
                mem::size_of::<PrePrepare>() as u64
                    + pre_prepare
                        .requests
                        .iter()
                        .map(|r| r.size())
                        .sum::<u64>()
            }
            OrderingMessage::Prepare(_) => mem::size_of::<Prepare>() as u64,
            OrderingMessage::Commit(_) => mem::size_of::<Commit>() as u64,
        }
    }
}

impl Cacheable for OrderingMessage {
    fn size(&self) -> u64 {
        self.size()
    }

    fn view(&self) -> ViewNumber {
        self.view()
    }
}

impl From<PrePrepare> for OrderingMessage {
    fn from(pre_prepare: PrePrepare) -> Self {
        OrderingMessage::PrePrepare(pre_prepare)
    }
}

impl From<Prepare> for OrderingMessage {
    fn from(prepare: Prepare) -> Self {
        OrderingMessage::Prepare(prepare)
    }
}

impl From<Commit> for OrderingMessage {
    fn from(commit: Commit) -> Self {
        OrderingMessage::Commit(commit)
    }
}

impl From<OrderingMessage> for ProtocolMessage {
    fn from(msg: OrderingMessage) -> Self {
        ProtocolMessage::OrderingMessage(msg)
    }
}

/// Reference to one request inside a Pre-Prepare's batch: small requests travel inline, big
/// requests by digest with the body delivered out-of-band.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RequestRef {
    Inline(Request),
    ByDigest(Digest),
}

impl RequestRef {
    pub fn digest(&self) -> Digest {
        match self {
            RequestRef::Inline(request) => request.digest(),
            RequestRef::ByDigest(digest) => *digest,
        }
    }

    fn size(&self) -> u64 {
        match self {
            RequestRef::Inline(request) => request.payload.len() as u64,
            RequestRef::ByDigest(_) => mem::size_of::<Digest>() as u64,
        }
    }
}

/// Broadcasted by the primary of a view to bind a batch of requests to a sequence number.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct PrePrepare {
    pub view: ViewNumber,
    pub seqno: SeqNumber,
    pub from: PrincipalId,
    pub requests: Vec<RequestRef>,
    pub batch_digest: Digest,
    /// The primary's signature over (view, seqno, batch digest). Transferable: it survives in
    /// view-change certificates and lets non-primaries forward the message.
    pub digest_signature: SignatureBytes,
    pub authenticator: Authenticator,
}

impl PrePrepare {
    /// Create a Pre-Prepare for the given batch, signed and authenticated by the calling primary.
    ///
    /// A batch with no requests is a valid Pre-Prepare: it orders a no-op, which the view-change
    /// subprotocol uses to fill sequence numbers it could not recover a request batch for.
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        view: ViewNumber,
        seqno: SeqNumber,
        requests: Vec<RequestRef>,
    ) -> PrePrepare {
        let batch_digest = Self::batch_digest(&requests);
        let digest_signature = keypair.sign(&signed_bytes(view, seqno, batch_digest));
        let from = registry.me();
        let auth_bytes = (view, seqno, batch_digest, from).try_to_vec().unwrap();
        let authenticator = registry.authenticate(keypair, &auth_bytes);
        PrePrepare {
            view,
            seqno,
            from,
            requests,
            batch_digest,
            digest_signature,
            authenticator,
        }
    }

    /// The digest of a batch of request references: a hash over the member request digests, in
    /// batch order.
    pub fn batch_digest(requests: &[RequestRef]) -> Digest {
        let member_digests: Vec<Digest> = requests.iter().map(|r| r.digest()).collect();
        Digest::of_batch(&member_digests)
    }

    /// Whether the batch digest matches the referenced requests, and the embedded digest signature
    /// was made by `signer` (the primary of `self.view`, or of a later view if this Pre-Prepare was
    /// reconstructed during a view change).
    pub(crate) fn is_well_formed(
        &self,
        registry: &PrincipalRegistry,
        signer: PrincipalId,
    ) -> Result<(), AuthError> {
        if Self::batch_digest(&self.requests) != self.batch_digest {
            return Err(AuthError::BadAuth);
        }
        registry.verify_signature(
            signer,
            &signed_bytes(self.view, self.seqno, self.batch_digest),
            &self.digest_signature,
        )
    }
}

impl AuthenticatedMessage for PrePrepare {
    fn auth_bytes(&self) -> Vec<u8> {
        (self.view, self.seqno, self.batch_digest, self.from)
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

/// Broadcasted by a backup that accepted a Pre-Prepare.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub seqno: SeqNumber,
    pub digest: Digest,
    pub from: PrincipalId,
    /// Set when this Prepare is re-sent to a single replica as proof material rather than as part
    /// of the regular broadcast.
    pub proof: bool,
    /// The sender's signature over (view, seqno, digest); the building block of prepared
    /// certificates.
    pub digest_signature: SignatureBytes,
    pub authenticator: Authenticator,
}

impl Prepare {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        view: ViewNumber,
        seqno: SeqNumber,
        digest: Digest,
    ) -> Prepare {
        let digest_signature = keypair.sign(&signed_bytes(view, seqno, digest));
        let from = registry.me();
        let auth_bytes = (view, seqno, digest, from, false).try_to_vec().unwrap();
        let authenticator = registry.authenticate(keypair, &auth_bytes);
        Prepare {
            view,
            seqno,
            digest,
            from,
            proof: false,
            digest_signature,
            authenticator,
        }
    }

    /// Returns true iff `other` endorses the same (view, seqno, digest) binding.
    pub fn matches(&self, other: &Prepare) -> bool {
        self.view == other.view && self.seqno == other.seqno && self.digest == other.digest
    }

    /// Re-issue this replica's own Prepare as proof material for a single peer: same binding and
    /// digest signature, fresh unicast authenticator, `proof` flag set.
    pub(crate) fn proof_copy(
        &self,
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        peer: PrincipalId,
    ) -> Prepare {
        let auth_bytes = (self.view, self.seqno, self.digest, self.from, true)
            .try_to_vec()
            .unwrap();
        let authenticator = registry.authenticate_to(peer, keypair, &auth_bytes);
        Prepare {
            proof: true,
            authenticator,
            ..self.clone()
        }
    }

    pub(crate) fn verify_digest_signature(
        &self,
        registry: &PrincipalRegistry,
    ) -> Result<(), AuthError> {
        registry.verify_signature(
            self.from,
            &signed_bytes(self.view, self.seqno, self.digest),
            &self.digest_signature,
        )
    }
}

impl AuthenticatedMessage for Prepare {
    fn auth_bytes(&self) -> Vec<u8> {
        (self.view, self.seqno, self.digest, self.from, self.proof)
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

/// Broadcasted by a replica whose slot reached the prepared state.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub seqno: SeqNumber,
    pub digest: Digest,
    pub from: PrincipalId,
    pub digest_signature: SignatureBytes,
    pub authenticator: Authenticator,
}

impl Commit {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        view: ViewNumber,
        seqno: SeqNumber,
        digest: Digest,
    ) -> Commit {
        let digest_signature = keypair.sign(&signed_bytes(view, seqno, digest));
        let from = registry.me();
        let auth_bytes = (view, seqno, digest, from).try_to_vec().unwrap();
        let authenticator = registry.authenticate(keypair, &auth_bytes);
        Commit {
            view,
            seqno,
            digest,
            from,
            digest_signature,
            authenticator,
        }
    }

    pub(crate) fn verify_digest_signature(
        &self,
        registry: &PrincipalRegistry,
    ) -> Result<(), AuthError> {
        registry.verify_signature(
            self.from,
            &signed_bytes(self.view, self.seqno, self.digest),
            &self.digest_signature,
        )
    }
}

impl AuthenticatedMessage for Commit {
    fn auth_bytes(&self) -> Vec<u8> {
        (self.view, self.seqno, self.digest, self.from)
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

/// The bytes covered by the embedded digest signature of each ordering message.
pub(crate) fn signed_bytes(view: ViewNumber, seqno: SeqNumber, digest: Digest) -> Vec<u8> {
    (view, seqno, digest).try_to_vec().unwrap()
}
