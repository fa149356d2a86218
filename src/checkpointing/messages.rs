/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Checkpoint`] message, broadcasted whenever a replica's execution crosses a checkpoint
//! interval boundary.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::{ProtocolMessage, SignedMessage};
use crate::types::basic::{Digest, PrincipalId, SeqNumber, SignatureBytes};
use crate::types::keypair::Keypair;
use crate::types::principals::PrincipalRegistry;

/// Attests that the sender's externally observable state at `seqno` hashes to `state_digest`.
///
/// Always signed, never MAC-authenticated: the collected signatures become a transferable
/// [`CheckpointCertificate`](super::types::CheckpointCertificate) that is embedded in view-change
/// messages and catch-up responses.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Checkpoint {
    pub seqno: SeqNumber,
    pub state_digest: Digest,
    pub from: PrincipalId,
    /// True iff the sender already knows this checkpoint to be stable. The flag is not covered by
    /// the signature, so a certificate can be assembled from a mix of stable and non-stable
    /// messages.
    pub stable: bool,
    pub signature: SignatureBytes,
}

impl Checkpoint {
    pub(crate) fn new(
        registry: &PrincipalRegistry,
        keypair: &Keypair,
        seqno: SeqNumber,
        state_digest: Digest,
        stable: bool,
    ) -> Checkpoint {
        let message_bytes = (seqno, state_digest).try_to_vec().unwrap();
        let signature = keypair.sign(&message_bytes);
        Checkpoint {
            seqno,
            state_digest,
            from: registry.me(),
            stable,
            signature,
        }
    }

    /// Returns true iff `other` attests to the same state at the same seqno.
    pub fn matches(&self, other: &Checkpoint) -> bool {
        self.seqno == other.seqno && self.state_digest == other.state_digest
    }
}

impl SignedMessage for Checkpoint {
    fn message_bytes(&self) -> Vec<u8> {
        (self.seqno, self.state_digest).try_to_vec().unwrap()
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }

    fn signer(&self) -> PrincipalId {
        self.from
    }
}

impl From<Checkpoint> for ProtocolMessage {
    fn from(checkpoint: Checkpoint) -> Self {
        ProtocolMessage::Checkpoint(checkpoint)
    }
}
