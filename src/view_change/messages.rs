/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages that are sent between replicas as part of the view-change subprotocol.
//!
//! ## Messages
//!
//! 1. [`ViewChange`]: broadcasted by a replica whose view timer expired, carries its latest stable
//!    checkpoint certificate and its prepared (P-set) and pre-prepared (Q-set) proofs.
//! 2. [`ViewChangeAck`]: sent to the candidate view's primary to confirm having seen a particular
//!    view-change message. In the session-MAC authentication scheme, acks are what let the new
//!    primary treat a view-change message it cannot otherwise prove authentic as corroborated.
//! 3. [`NewView`]: broadcasted by the new primary once it holds 2f + 1 view-change messages; embeds
//!    the V set (the view-change messages themselves) and the O set (the deterministically
//!    reconstructed Pre-Prepares).
//! 4. [`ViewInfo`]: sent to a replica observed to be in an older view, carrying the New-View
//!    certificate that justifies the sender's current view so the laggard can adopt it.
//!
//! All view-change traffic is signed regardless of the configured authentication scheme: these
//! messages are proofs that get embedded into other messages and re-checked by third parties.

use borsh::{BorshDeserialize, BorshSerialize};

use super::types::{PrePreparedInfo, PreparedProof};
use crate::checkpointing::types::CheckpointCertificate;
use crate::messages::{ProtocolMessage, SignedMessage};
use crate::ordering::messages::PrePrepare;
use crate::types::basic::{Digest, PrincipalId, SignatureBytes, ViewNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::PrincipalRegistry;

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum ViewChangeMessage {
    ViewChange(ViewChange),
    ViewChangeAck(ViewChangeAck),
    NewView(NewView),
    ViewInfo(ViewInfo),
}

impl ViewChangeMessage {
    /// Returns the candidate view associated with a given [`ViewChangeMessage`].
    pub fn view(&self) -> ViewNumber {
        match self {
            ViewChangeMessage::ViewChange(ViewChange { view, .. }) => *view,
            ViewChangeMessage::ViewChangeAck(ViewChangeAck { view, .. }) => *view,
            ViewChangeMessage::NewView(NewView { view, .. }) => *view,
            ViewChangeMessage::ViewInfo(ViewInfo { new_view, .. }) => new_view.view,
        }
    }
}

impl From<ViewChange> for ViewChangeMessage {
    fn from(view_change: ViewChange) -> Self {
        ViewChangeMessage::ViewChange(view_change)
    }
}

impl From<ViewChangeAck> for ViewChangeMessage {
    fn from(ack: ViewChangeAck) -> Self {
        ViewChangeMessage::ViewChangeAck(ack)
    }
}

impl From<NewView> for ViewChangeMessage {
    fn from(new_view: NewView) -> Self {
        ViewChangeMessage::NewView(new_view)
    }
}

impl From<ViewInfo> for ViewChangeMessage {
    fn from(view_info: ViewInfo) -> Self {
        ViewChangeMessage::ViewInfo(view_info)
    }
}

impl From<ViewChangeMessage> for ProtocolMessage {
    fn from(msg: ViewChangeMessage) -> Self {
        ProtocolMessage::ViewChangeMessage(msg)
    }
}

/// Broadcasted by a replica that moved to the candidate view `view` after suspecting the primary of
/// the previous view.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ViewChange {
    /// The view being moved to.
    pub view: ViewNumber,
    pub from: PrincipalId,
    pub stable_checkpoint: CheckpointCertificate,
    /// P-set: one proof per slot in the sender's window that reached the prepared state.
    pub prepared: Vec<PreparedProof>,
    /// Q-set: one record per slot that reached only the pre-prepared state.
    pub pre_prepared: Vec<PrePreparedInfo>,
    pub signature: SignatureBytes,
}

impl ViewChange {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        view: ViewNumber,
        stable_checkpoint: CheckpointCertificate,
        prepared: Vec<PreparedProof>,
        pre_prepared: Vec<PrePreparedInfo>,
    ) -> ViewChange {
        let from = registry.me();
        let message_bytes = (view, from, &stable_checkpoint, &prepared, &pre_prepared)
            .try_to_vec()
            .unwrap();
        let signature = keypair.sign(&message_bytes);
        ViewChange {
            view,
            from,
            stable_checkpoint,
            prepared,
            pre_prepared,
            signature,
        }
    }

    /// The content digest of this view-change message, which is what
    /// [acks](ViewChangeAck::view_change_digest) refer to.
    pub fn digest(&self) -> Digest {
        Digest::of_bytes(&self.message_bytes())
    }

    /// Full verification: the sender's signature, the stable checkpoint certificate, and every
    /// P-set and Q-set entry.
    pub(crate) fn is_correct(&self, registry: &PrincipalRegistry) -> bool {
        registry.is_replica(self.from)
            && SignedMessage::is_correct(self, registry)
            && self.stable_checkpoint.is_correct(registry)
            && self.prepared.iter().all(|proof| proof.is_correct(registry))
            && self.pre_prepared.iter().all(|info| info.is_correct(registry))
    }
}

impl SignedMessage for ViewChange {
    fn message_bytes(&self) -> Vec<u8> {
        (
            self.view,
            self.from,
            &self.stable_checkpoint,
            &self.prepared,
            &self.pre_prepared,
        )
            .try_to_vec()
            .unwrap()
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }

    fn signer(&self) -> PrincipalId {
        self.from
    }
}

/// Sent by a replica to the primary of the candidate view to confirm it has seen the view-change
/// message from `view_change_from` with content digest `view_change_digest`.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ViewChangeAck {
    pub view: ViewNumber,
    pub from: PrincipalId,
    pub view_change_from: PrincipalId,
    pub view_change_digest: Digest,
    pub signature: SignatureBytes,
}

impl ViewChangeAck {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        view: ViewNumber,
        view_change_from: PrincipalId,
        view_change_digest: Digest,
    ) -> ViewChangeAck {
        let from = registry.me();
        let message_bytes = (view, from, view_change_from, view_change_digest)
            .try_to_vec()
            .unwrap();
        let signature = keypair.sign(&message_bytes);
        ViewChangeAck {
            view,
            from,
            view_change_from,
            view_change_digest,
            signature,
        }
    }
}

impl SignedMessage for ViewChangeAck {
    fn message_bytes(&self) -> Vec<u8> {
        (self.view, self.from, self.view_change_from, self.view_change_digest)
            .try_to_vec()
            .unwrap()
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }

    fn signer(&self) -> PrincipalId {
        self.from
    }
}

/// Broadcasted by the primary of the candidate view once it holds a quorum of view-change
/// messages.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct NewView {
    pub view: ViewNumber,
    pub from: PrincipalId,
    /// V set: 2f + 1 view-change messages from distinct replicas, each individually verifiable.
    pub view_changes: Vec<ViewChange>,
    /// O set: the Pre-Prepares for the new view, reconstructed deterministically from the V set.
    pub pre_prepares: Vec<PrePrepare>,
    pub signature: SignatureBytes,
}

impl NewView {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        view: ViewNumber,
        view_changes: Vec<ViewChange>,
        pre_prepares: Vec<PrePrepare>,
    ) -> NewView {
        let from = registry.me();
        let message_bytes = (view, from, &view_changes, &pre_prepares)
            .try_to_vec()
            .unwrap();
        let signature = keypair.sign(&message_bytes);
        NewView {
            view,
            from,
            view_changes,
            pre_prepares,
            signature,
        }
    }

    /// Structural verification: the signature is the claimed primary's, the V set holds a quorum
    /// of correct view-change messages for this view from distinct senders. Whether the O set is
    /// the right reconstruction is checked separately against the local recomputation.
    pub(crate) fn is_correct(&self, registry: &PrincipalRegistry) -> bool {
        if self.from != registry.primary(self.view) {
            return false;
        }
        if !SignedMessage::is_correct(self, registry) {
            return false;
        }

        let mut senders = Vec::new();
        for view_change in &self.view_changes {
            if view_change.view != self.view
                || senders.contains(&view_change.from)
                || !view_change.is_correct(registry)
            {
                return false;
            }
            senders.push(view_change.from);
        }

        senders.len() as u32 >= registry.quorum()
    }
}

impl SignedMessage for NewView {
    fn message_bytes(&self) -> Vec<u8> {
        (self.view, self.from, &self.view_changes, &self.pre_prepares)
            .try_to_vec()
            .unwrap()
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }

    fn signer(&self) -> PrincipalId {
        self.from
    }
}

/// Sent to a replica observed (via its status broadcasts) to be in an older view. The embedded
/// New-View certificate is all the receiver needs to verify and adopt the sender's view.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ViewInfo {
    pub from: PrincipalId,
    pub new_view: NewView,
}
