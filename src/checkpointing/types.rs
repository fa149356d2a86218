/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of types specific to the checkpointing subprotocol: the
//! [`CheckpointCertificate`] and the collector that incrementally forms one.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use super::messages::Checkpoint;
use crate::types::basic::{Digest, PrincipalId, SeqNumber, SignatureBytes};
use crate::types::principals::PrincipalRegistry;

/// Proof that a quorum of replicas agreed on the observable state at a sequence number. The
/// evidence comes in the form of 2f + 1 checkpoint signatures from distinct replicas.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CheckpointCertificate {
    pub seqno: SeqNumber,
    pub state_digest: Digest,
    pub signatures: Vec<(PrincipalId, SignatureBytes)>,
}

impl CheckpointCertificate {
    /// The certificate for the agreed-upon initial state, before any request has executed. It
    /// carries no signatures and is accepted as a special case, since every party can reconstruct
    /// it from the initial configuration.
    pub fn genesis(state_digest: Digest) -> CheckpointCertificate {
        CheckpointCertificate {
            seqno: SeqNumber::init(),
            state_digest,
            signatures: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.seqno == SeqNumber::init() && self.signatures.is_empty()
    }

    /// Checks if all of the signatures in the certificate are correct, distinct, from replicas,
    /// and together form a quorum.
    pub(crate) fn is_correct(&self, registry: &PrincipalRegistry) -> bool {
        if self.is_genesis() {
            return true;
        }

        let message_bytes = (self.seqno, self.state_digest).try_to_vec().unwrap();

        let mut signers = Vec::new();
        for (signer, signature) in &self.signatures {
            if !registry.is_replica(*signer) || signers.contains(signer) {
                return false;
            }
            if registry
                .verify_signature(*signer, &message_bytes, signature)
                .is_err()
            {
                return false;
            }
            signers.push(*signer);
        }

        signers.len() as u32 >= registry.quorum()
    }
}

/// Serves to incrementally form [`CheckpointCertificate`]s by combining checkpoint messages for the
/// same (seqno, state digest) pair from distinct replicas.
///
/// The collector retains messages for every seqno above the last stable checkpoint, because
/// replicas cross interval boundaries at different times and a quorum assembles gradually.
pub(crate) struct CheckpointCollector {
    // Outer key: checkpoint seqno. Inner key: claimed state digest (honest replicas agree, but
    // faulty ones may claim anything, so signature sets are segregated by digest).
    collected: BTreeMap<SeqNumber, BTreeMap<Digest, Vec<(PrincipalId, SignatureBytes)>>>,
}

impl CheckpointCollector {
    pub(crate) fn new() -> CheckpointCollector {
        CheckpointCollector {
            collected: BTreeMap::new(),
        }
    }

    /// Adds the checkpoint message to the signature set for its (seqno, digest) pair, returning a
    /// certificate if adding it completes a quorum.
    ///
    /// Duplicates from the same replica are no-ops.
    ///
    /// # Preconditions
    ///
    /// `checkpoint.is_correct(registry)`.
    pub(crate) fn collect(
        &mut self,
        registry: &PrincipalRegistry,
        checkpoint: &Checkpoint,
    ) -> Option<CheckpointCertificate> {
        if !registry.is_replica(checkpoint.from) {
            return None;
        }

        let signatures = self
            .collected
            .entry(checkpoint.seqno)
            .or_default()
            .entry(checkpoint.state_digest)
            .or_default();

        if signatures.iter().any(|(id, _)| *id == checkpoint.from) {
            return None;
        }
        signatures.push((checkpoint.from, checkpoint.signature));

        if signatures.len() as u32 >= registry.quorum() {
            Some(CheckpointCertificate {
                seqno: checkpoint.seqno,
                state_digest: checkpoint.state_digest,
                signatures: signatures.clone(),
            })
        } else {
            None
        }
    }

    /// Drop everything at or below `seqno`. Called when a checkpoint stabilizes: earlier seqnos can
    /// never stabilize again.
    pub(crate) fn garbage_collect(&mut self, seqno: SeqNumber) {
        self.collected = self.collected.split_off(&(seqno + 1));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;
    use crate::types::keypair::Keypair;
    use crate::types::principals::{AuthenticationScheme, Principal, Role};

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
                role: Role::Replica,
                verifying_key: keypair.public(),
                address: None,
            })
            .collect();
        PrincipalRegistry::new(
            principals,
            keypairs.len() as u32,
            (keypairs.len() as u32 - 1) / 3,
            AuthenticationScheme::Signatures,
            PrincipalId::new(me),
            HashMap::new(),
        )
    }

    #[test]
    fn certificate_forms_at_quorum() {
        let keypairs = keypairs(4);
        let registry = registry_for(0, &keypairs);
        let mut collector = CheckpointCollector::new();
        let seqno = SeqNumber::new(128);
        let state_digest = Digest::of_bytes(b"state at 128");

        for id in 0..2 {
            let sender_registry = registry_for(id, &keypairs);
            let checkpoint = Checkpoint::new(
                &sender_registry,
                &keypairs[id as usize],
                seqno,
                state_digest,
                false,
            );
            assert!(collector.collect(&registry, &checkpoint).is_none());
            // A duplicate from the same replica never completes a quorum.
            assert!(collector.collect(&registry, &checkpoint).is_none());
        }

        let sender_registry = registry_for(2, &keypairs);
        let checkpoint = Checkpoint::new(&sender_registry, &keypairs[2], seqno, state_digest, false);
        let certificate = collector
            .collect(&registry, &checkpoint)
            .expect("third distinct signer completes the quorum");
        assert_eq!(certificate.seqno, seqno);
        assert_eq!(certificate.signatures.len(), 3);
        assert!(certificate.is_correct(&registry));
    }

    #[test]
    fn diverging_digests_do_not_pool() {
        let keypairs = keypairs(4);
        let registry = registry_for(0, &keypairs);
        let mut collector = CheckpointCollector::new();
        let seqno = SeqNumber::new(128);

        for id in 0..3 {
            let sender_registry = registry_for(id, &keypairs);
            let divergent_digest = Digest::of_bytes(&[id as u8]);
            let checkpoint = Checkpoint::new(
                &sender_registry,
                &keypairs[id as usize],
                seqno,
                divergent_digest,
                false,
            );
            assert!(collector.collect(&registry, &checkpoint).is_none());
        }
    }

    #[test]
    fn certificate_verification() {
        let keypairs = keypairs(4);
        let registry = registry_for(0, &keypairs);
        let seqno = SeqNumber::new(4);
        let state_digest = Digest::of_bytes(b"state");
        let message_bytes = (seqno, state_digest).try_to_vec().unwrap();

        let signatures: Vec<(PrincipalId, SignatureBytes)> = keypairs
            .iter()
            .enumerate()
            .take(3)
            .map(|(id, keypair)| (PrincipalId::new(id as u32), keypair.sign(&message_bytes)))
            .collect();

        let certificate = CheckpointCertificate {
            seqno,
            state_digest,
            signatures: signatures.clone(),
        };
        assert!(certificate.is_correct(&registry));

        // Too few signatures.
        let undersized = CheckpointCertificate {
            seqno,
            state_digest,
            signatures: signatures[..2].to_vec(),
        };
        assert!(!undersized.is_correct(&registry));

        // A repeated signer does not count twice.
        let mut padded = signatures[..2].to_vec();
        padded.push(signatures[0]);
        let duplicated = CheckpointCertificate {
            seqno,
            state_digest,
            signatures: padded,
        };
        assert!(!duplicated.is_correct(&registry));

        assert!(CheckpointCertificate::genesis(state_digest).is_correct(&registry));
    }
}
