/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of types specific to the view-change subprotocol: prepared and pre-prepared proofs,
//! the collectors that accumulate view-change traffic for a candidate view, and the deterministic
//! reconstruction of the new view's Pre-Prepare set.

use std::collections::{BTreeMap, HashMap, HashSet};

use borsh::{BorshDeserialize, BorshSerialize};

use super::messages::{ViewChange, ViewChangeAck};
use crate::ordering::messages::{PrePrepare, RequestRef};
use crate::types::basic::{Digest, PrincipalId, SeqNumber, SignatureBytes, ViewNumber};
use crate::types::principals::PrincipalRegistry;

/// Proof that a slot reached the prepared state on the sender: the Pre-Prepare that bound the
/// batch, plus the digest signatures of 2f replicas other than the issuing primary.
///
/// The Pre-Prepare travels whole (request bodies by digest, so the proof stays small) so that the
/// new primary can reissue the same batch without holding it locally.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct PreparedProof {
    pub pre_prepare: PrePrepare,
    pub prepares: Vec<(PrincipalId, SignatureBytes)>,
}

impl PreparedProof {
    /// Checks that the embedded Pre-Prepare is well-formed and signed by the primary of its view,
    /// and that the prepare signatures are correct, distinct, from replicas other than that
    /// primary, and at least 2f in number.
    pub(crate) fn is_correct(&self, registry: &PrincipalRegistry) -> bool {
        let pre_prepare = &self.pre_prepare;
        let primary = registry.primary(pre_prepare.view);
        if pre_prepare.is_well_formed(registry, primary).is_err() {
            return false;
        }

        let prepare_bytes = crate::ordering::messages::signed_bytes(
            pre_prepare.view,
            pre_prepare.seqno,
            pre_prepare.batch_digest,
        );

        let mut signers = HashSet::new();
        for (signer, signature) in &self.prepares {
            if !registry.is_replica(*signer) || *signer == primary || !signers.insert(*signer) {
                return false;
            }
            if registry
                .verify_signature(*signer, &prepare_bytes, signature)
                .is_err()
            {
                return false;
            }
        }

        signers.len() as u32 >= 2 * registry.max_faulty()
    }
}

/// Record that a slot reached the pre-prepared state on the sender. Unlike a [`PreparedProof`]
/// this carries no endorsements beyond the issuing primary's own signature.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct PrePreparedInfo {
    pub pre_prepare: PrePrepare,
}

impl PrePreparedInfo {
    pub(crate) fn is_correct(&self, registry: &PrincipalRegistry) -> bool {
        let primary = registry.primary(self.pre_prepare.view);
        self.pre_prepare.is_well_formed(registry, primary).is_ok()
    }
}

/// Accumulates verified [`ViewChange`] messages per candidate view, and the
/// [`ViewChangeAck`]s that corroborate them.
///
/// The collector spans multiple candidate views at once because replicas time out at different
/// moments and cascading view changes skip views entirely.
pub(crate) struct ViewChangeCollector {
    // Outer key: the candidate view. Inner key: the sender of the view-change message.
    collected: BTreeMap<ViewNumber, HashMap<PrincipalId, ViewChange>>,
    // Acks keyed by (candidate view, view-change sender, view-change digest); the value is the set
    // of replicas that acknowledged seeing that exact view-change message.
    acks: HashMap<(ViewNumber, PrincipalId, Digest), HashSet<PrincipalId>>,
}

impl ViewChangeCollector {
    pub(crate) fn new() -> ViewChangeCollector {
        ViewChangeCollector {
            collected: BTreeMap::new(),
            acks: HashMap::new(),
        }
    }

    /// Store a verified view-change message. The first message from a given replica for a given
    /// view wins; a faulty replica gains nothing by sending several.
    ///
    /// Returns the number of distinct senders collected for the message's candidate view.
    ///
    /// # Preconditions
    ///
    /// `view_change.is_correct(registry)`.
    pub(crate) fn collect(&mut self, view_change: ViewChange) -> u32 {
        let for_view = self.collected.entry(view_change.view).or_default();
        for_view.entry(view_change.from).or_insert(view_change);
        for_view.len() as u32
    }

    pub(crate) fn collect_ack(&mut self, ack: &ViewChangeAck) {
        self.acks
            .entry((ack.view, ack.view_change_from, ack.view_change_digest))
            .or_default()
            .insert(ack.from);
    }

    /// The number of distinct replicas that acknowledged the view-change message from
    /// `view_change_from` with the given digest.
    pub(crate) fn ack_count(
        &self,
        view: ViewNumber,
        view_change_from: PrincipalId,
        view_change_digest: Digest,
    ) -> u32 {
        self.acks
            .get(&(view, view_change_from, view_change_digest))
            .map(|ackers| ackers.len() as u32)
            .unwrap_or(0)
    }

    pub(crate) fn view_changes(&self, view: ViewNumber) -> Vec<ViewChange> {
        self.collected
            .get(&view)
            .map(|for_view| for_view.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, view: ViewNumber) -> u32 {
        self.collected
            .get(&view)
            .map(|for_view| for_view.len() as u32)
            .unwrap_or(0)
    }

    pub(crate) fn contains(&self, view: ViewNumber, from: PrincipalId) -> bool {
        self.collected
            .get(&view)
            .is_some_and(|for_view| for_view.contains_key(&from))
    }

    /// The smallest candidate view above `view` for which at least `threshold` distinct senders
    /// have been collected, if any.
    pub(crate) fn smallest_view_above_with(
        &self,
        view: ViewNumber,
        threshold: u32,
    ) -> Option<ViewNumber> {
        self.collected
            .iter()
            .find(|(candidate, for_view)| **candidate > view && for_view.len() as u32 >= threshold)
            .map(|(candidate, _)| *candidate)
    }

    /// Drop state for candidate views at or below `view`. Called on entering a view; earlier
    /// candidates can no longer be installed.
    pub(crate) fn garbage_collect(&mut self, view: ViewNumber) {
        self.collected = self.collected.split_off(&(view + 1));
        self.acks.retain(|(ack_view, _, _), _| *ack_view > view);
    }
}

/// What the deterministic reconstruction decided for one sequence number of the new view.
#[derive(Clone, PartialEq, Eq)]
pub(crate) enum ReconstructedBatch {
    /// Some view-change message proved this seqno prepared with this digest; the new view must
    /// re-issue the same batch.
    Prepared {
        digest: Digest,
        requests: Vec<RequestRef>,
    },
    /// No prepared proof covers this seqno; the new view fills it with a no-op batch.
    Null,
}

/// The outcome of deterministically reconstructing the new view's Pre-Prepare set from a set of
/// view-change messages: the watermark the new view starts from, and one decision per seqno in
/// `(max_stable, max_stable + decisions.len()]`.
pub(crate) struct Reconstruction {
    pub(crate) max_stable: SeqNumber,
    pub(crate) decisions: Vec<(SeqNumber, ReconstructedBatch)>,
}

/// Compute, per seqno in the union of the windows reported by `view_changes`, either the digest
/// that some replica proved prepared, or a no-op placeholder.
///
/// Every replica runs this same function over the V set of a New-View message; the primary's O set
/// is accepted iff it matches the local result, so the iteration order here must not depend on map
/// iteration or message arrival order. View-change messages are visited in ascending sender id, and
/// a prepared proof displaces a previous candidate for the same seqno only if it was created in a
/// strictly higher view, or in the same view with a smaller digest.
pub(crate) fn reconstruct(view_changes: &[ViewChange]) -> Reconstruction {
    let max_stable = view_changes
        .iter()
        .map(|vc| vc.stable_checkpoint.seqno)
        .max()
        .unwrap_or(SeqNumber::init());

    let mut sorted: Vec<&ViewChange> = view_changes.iter().collect();
    sorted.sort_by_key(|vc| vc.from);

    let mut chosen: BTreeMap<SeqNumber, (ViewNumber, Digest, Vec<RequestRef>)> = BTreeMap::new();
    let mut max_seqno = max_stable;

    for view_change in sorted {
        for proof in &view_change.prepared {
            let pre_prepare = &proof.pre_prepare;
            if pre_prepare.seqno <= max_stable {
                continue;
            }
            max_seqno = max_seqno.max(pre_prepare.seqno);

            let candidate = (
                pre_prepare.view,
                pre_prepare.batch_digest,
                pre_prepare.requests.clone(),
            );
            match chosen.get(&pre_prepare.seqno) {
                None => {
                    chosen.insert(pre_prepare.seqno, candidate);
                }
                Some((view, digest, _)) => {
                    let replaces = pre_prepare.view > *view
                        || (pre_prepare.view == *view
                            && pre_prepare.batch_digest.bytes() < digest.bytes());
                    if replaces {
                        chosen.insert(pre_prepare.seqno, candidate);
                    }
                }
            }
        }

        // Q-set entries extend the reconstructed range but never choose a digest on their own: a
        // pre-prepared batch that never prepared anywhere may be replaced by a no-op.
        for info in &view_change.pre_prepared {
            if info.pre_prepare.seqno > max_stable {
                max_seqno = max_seqno.max(info.pre_prepare.seqno);
            }
        }
    }

    let mut decisions = Vec::new();
    let mut seqno = max_stable;
    while seqno < max_seqno {
        seqno += 1;
        let decision = match chosen.remove(&seqno) {
            Some((_, digest, requests)) => ReconstructedBatch::Prepared { digest, requests },
            None => ReconstructedBatch::Null,
        };
        decisions.push((seqno, decision));
    }

    Reconstruction {
        max_stable,
        decisions,
    }
}

/// Checks whether a New-View's O set matches the local reconstruction from its V set: one
/// Pre-Prepare per reconstructed seqno, in order, stamped with the new view, carrying the expected
/// batch digest (the null batch digest for no-op fills), and correctly signed by the new primary.
pub(crate) fn o_set_matches(
    registry: &PrincipalRegistry,
    view: ViewNumber,
    reconstruction: &Reconstruction,
    pre_prepares: &[PrePrepare],
) -> bool {
    if pre_prepares.len() != reconstruction.decisions.len() {
        return false;
    }

    let new_primary = registry.primary(view);
    for ((seqno, decision), pre_prepare) in reconstruction.decisions.iter().zip(pre_prepares) {
        if pre_prepare.view != view || pre_prepare.seqno != *seqno {
            return false;
        }
        if pre_prepare.is_well_formed(registry, new_primary).is_err() {
            return false;
        }
        let expected_digest = match decision {
            ReconstructedBatch::Prepared { digest, .. } => *digest,
            ReconstructedBatch::Null => PrePrepare::batch_digest(&[]),
        };
        if pre_prepare.batch_digest != expected_digest {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;
    use crate::checkpointing::types::CheckpointCertificate;
    use crate::requests::messages::Request;
    use crate::types::basic::RequestId;
    use crate::types::keypair::Keypair;
    use crate::types::principals::{AuthenticationScheme, Principal, Role};
    use crate::view_change::messages::ViewChange;

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

    /// A prepared proof for (view, seqno) over a one-request batch, built the way a real prepared
    /// slot would: the primary's Pre-Prepare plus prepare signatures from 2f other replicas.
    fn prepared_proof(
        keypairs: &[Keypair],
        view: ViewNumber,
        seqno: SeqNumber,
        payload: &[u8],
    ) -> PreparedProof {
        let primary = (view.int() % 4) as u32;
        let request = Request::new(
            &keypairs[4],
            PrincipalId::new(4),
            RequestId::new(seqno.int()),
            payload.to_vec(),
        );
        let pre_prepare = PrePrepare::new(
            &registry_for(primary, keypairs),
            &keypairs[primary as usize],
            view,
            seqno,
            vec![RequestRef::Inline(request)],
        );
        let prepare_bytes = crate::ordering::messages::signed_bytes(
            view,
            seqno,
            pre_prepare.batch_digest,
        );
        let prepares = (0..4u32)
            .filter(|id| *id != primary)
            .take(2)
            .map(|id| (PrincipalId::new(id), keypairs[id as usize].sign(&prepare_bytes)))
            .collect();
        PreparedProof {
            pre_prepare,
            prepares,
        }
    }

    fn view_change(
        keypairs: &[Keypair],
        from: u32,
        view: ViewNumber,
        prepared: Vec<PreparedProof>,
    ) -> ViewChange {
        ViewChange::new(
            &registry_for(from, keypairs),
            &keypairs[from as usize],
            view,
            CheckpointCertificate::genesis(Digest::of_bytes(b"genesis")),
            prepared,
            Vec::new(),
        )
    }

    #[test]
    fn prepared_proofs_verify() {
        let keypairs = keypairs(5);
        let registry = registry_for(3, &keypairs);
        let proof = prepared_proof(&keypairs, ViewNumber::new(0), SeqNumber::new(2), b"op");
        assert!(proof.is_correct(&registry));

        // A proof with too few prepares does not verify.
        let mut undersized = proof.clone();
        undersized.prepares.truncate(1);
        assert!(!undersized.is_correct(&registry));

        // Nor does one whose prepares include the issuing primary.
        let mut with_primary = proof.clone();
        let prepare_bytes = crate::ordering::messages::signed_bytes(
            ViewNumber::new(0),
            SeqNumber::new(2),
            proof.pre_prepare.batch_digest,
        );
        with_primary.prepares[0] = (PrincipalId::new(0), keypairs[0].sign(&prepare_bytes));
        assert!(!with_primary.is_correct(&registry));
    }

    #[test]
    fn reconstruction_chooses_prepared_digests_and_fills_gaps() {
        let keypairs = keypairs(5);
        let view = ViewNumber::new(0);

        // Replica 1 proved seqno 1 prepared, replica 2 proved seqno 3; nobody proved seqno 2.
        let proof_1 = prepared_proof(&keypairs, view, SeqNumber::new(1), b"one");
        let proof_3 = prepared_proof(&keypairs, view, SeqNumber::new(3), b"three");
        let view_changes = vec![
            view_change(&keypairs, 1, ViewNumber::new(1), vec![proof_1.clone()]),
            view_change(&keypairs, 2, ViewNumber::new(1), vec![proof_3.clone()]),
            view_change(&keypairs, 3, ViewNumber::new(1), Vec::new()),
        ];

        let reconstruction = reconstruct(&view_changes);
        assert_eq!(reconstruction.max_stable, SeqNumber::new(0));
        assert_eq!(reconstruction.decisions.len(), 3);
        assert!(
            reconstruction.decisions[0].1
                == ReconstructedBatch::Prepared {
                    digest: proof_1.pre_prepare.batch_digest,
                    requests: proof_1.pre_prepare.requests.clone(),
                }
        );
        assert!(reconstruction.decisions[1].1 == ReconstructedBatch::Null);
        assert!(
            reconstruction.decisions[2].1
                == ReconstructedBatch::Prepared {
                    digest: proof_3.pre_prepare.batch_digest,
                    requests: proof_3.pre_prepare.requests.clone(),
                }
        );

        // The same V set in any order reconstructs the same decisions.
        let mut reversed = view_changes.clone();
        reversed.reverse();
        let again = reconstruct(&reversed);
        assert_eq!(again.decisions.len(), reconstruction.decisions.len());
        for (a, b) in again.decisions.iter().zip(&reconstruction.decisions) {
            assert_eq!(a.0, b.0);
            assert!(a.1 == b.1);
        }
    }

    #[test]
    fn higher_viewed_proofs_displace_lower_viewed_ones() {
        let keypairs = keypairs(5);
        let old = prepared_proof(&keypairs, ViewNumber::new(0), SeqNumber::new(1), b"old");
        let newer = prepared_proof(&keypairs, ViewNumber::new(1), SeqNumber::new(1), b"newer");

        let view_changes = vec![
            view_change(&keypairs, 0, ViewNumber::new(2), vec![old]),
            view_change(&keypairs, 1, ViewNumber::new(2), vec![newer.clone()]),
            view_change(&keypairs, 3, ViewNumber::new(2), Vec::new()),
        ];
        let reconstruction = reconstruct(&view_changes);
        assert!(
            reconstruction.decisions[0].1
                == ReconstructedBatch::Prepared {
                    digest: newer.pre_prepare.batch_digest,
                    requests: newer.pre_prepare.requests.clone(),
                }
        );
    }

    #[test]
    fn o_set_verification_rejects_substitutions() {
        let keypairs = keypairs(5);
        let target = ViewNumber::new(1);
        let registry = registry_for(2, &keypairs);
        let new_primary_registry = registry_for(1, &keypairs);

        let proof = prepared_proof(&keypairs, ViewNumber::new(0), SeqNumber::new(1), b"op");
        let view_changes = vec![
            view_change(&keypairs, 0, target, vec![proof.clone()]),
            view_change(&keypairs, 1, target, Vec::new()),
            view_change(&keypairs, 2, target, Vec::new()),
        ];
        let reconstruction = reconstruct(&view_changes);

        let honest_o_set = vec![PrePrepare::new(
            &new_primary_registry,
            &keypairs[1],
            target,
            SeqNumber::new(1),
            proof.pre_prepare.requests.clone(),
        )];
        assert!(o_set_matches(&registry, target, &reconstruction, &honest_o_set));

        // A primary that substitutes its own batch for the prepared one is caught.
        let substituted_o_set = vec![PrePrepare::new(
            &new_primary_registry,
            &keypairs[1],
            target,
            SeqNumber::new(1),
            Vec::new(),
        )];
        assert!(!o_set_matches(&registry, target, &reconstruction, &substituted_o_set));

        // So is one that omits a seqno entirely.
        assert!(!o_set_matches(&registry, target, &reconstruction, &[]));
    }
}
