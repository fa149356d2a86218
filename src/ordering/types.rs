/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of types specific to the ordering subprotocol: the collectors that accumulate
//! Prepare and Commit endorsements for one slot.
//!
//! Endorsements are segregated by digest: a faulty replica may endorse a digest that differs from
//! the Pre-Prepare's, and such endorsements must not count toward the quorum for the real one.
//! Within a digest, each sender is counted once; a replacement from the same sender is accepted
//! only if it re-verified upstream (the collector itself never sees unverified messages).

use std::collections::{BTreeMap, HashMap};

use super::messages::{Commit, Prepare};
use crate::types::basic::{Digest, PrincipalId, SignatureBytes};

/// Collects [`Prepare`] messages for one slot, keyed by the digest they endorse.
pub(crate) struct PrepareCollector {
    collected: HashMap<Digest, BTreeMap<PrincipalId, Prepare>>,
}

impl PrepareCollector {
    pub(crate) fn new() -> PrepareCollector {
        PrepareCollector {
            collected: HashMap::new(),
        }
    }

    /// Insert a verified Prepare, replacing any previous one from the same sender for the same
    /// digest. Returns the number of distinct senders now endorsing that digest.
    pub(crate) fn collect(&mut self, prepare: Prepare) -> u32 {
        let for_digest = self.collected.entry(prepare.digest).or_default();
        for_digest.insert(prepare.from, prepare);
        for_digest.len() as u32
    }

    pub(crate) fn count(&self, digest: &Digest) -> u32 {
        self.collected
            .get(digest)
            .map(|for_digest| for_digest.len() as u32)
            .unwrap_or(0)
    }

    pub(crate) fn contains(&self, digest: &Digest, from: PrincipalId) -> bool {
        self.collected
            .get(digest)
            .is_some_and(|for_digest| for_digest.contains_key(&from))
    }

    /// The collected endorsement signatures for `digest`, in ascending sender order. These are the
    /// raw material of [prepared proofs](crate::view_change::types::PreparedProof).
    pub(crate) fn signatures(&self, digest: &Digest) -> Vec<(PrincipalId, SignatureBytes)> {
        self.collected
            .get(digest)
            .map(|for_digest| {
                for_digest
                    .iter()
                    .map(|(from, prepare)| (*from, prepare.digest_signature))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The Prepare this replica itself broadcast, if it is among the collected ones.
    pub(crate) fn own(&self, digest: &Digest, me: PrincipalId) -> Option<&Prepare> {
        self.collected
            .get(digest)
            .and_then(|for_digest| for_digest.get(&me))
    }
}

/// Collects [`Commit`] messages for one slot, keyed by the digest they endorse.
pub(crate) struct CommitCollector {
    collected: HashMap<Digest, BTreeMap<PrincipalId, Commit>>,
}

impl CommitCollector {
    pub(crate) fn new() -> CommitCollector {
        CommitCollector {
            collected: HashMap::new(),
        }
    }

    /// Insert a verified Commit, replacing any previous one from the same sender for the same
    /// digest. Returns the number of distinct senders now endorsing that digest.
    pub(crate) fn collect(&mut self, commit: Commit) -> u32 {
        let for_digest = self.collected.entry(commit.digest).or_default();
        for_digest.insert(commit.from, commit);
        for_digest.len() as u32
    }

    pub(crate) fn count(&self, digest: &Digest) -> u32 {
        self.collected
            .get(digest)
            .map(|for_digest| for_digest.len() as u32)
            .unwrap_or(0)
    }

    pub(crate) fn own(&self, digest: &Digest, me: PrincipalId) -> Option<&Commit> {
        self.collected
            .get(digest)
            .and_then(|for_digest| for_digest.get(&me))
    }
}
