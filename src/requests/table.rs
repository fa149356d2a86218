/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-replica store of request bodies, keyed by digest.
//!
//! The table serves three masters:
//! 1. The ordering state machine, which parks a slot whose Pre-Prepare references a digest the
//!    table does not hold ([`RequestState::Wanted`]), and resumes it when the body arrives.
//! 2. The execution path, which records the last executed request id and reply per client, so a
//!    retransmitted request is answered from cache instead of being executed twice.
//! 3. Memory bounds: bodies that are no longer referenced by the active window are evictable,
//!    oldest first, once the table grows past its configured capacity.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use super::messages::{Reply, Request};
use crate::types::basic::{Digest, PrincipalId, RequestId, SeqNumber};

/// Where a known request digest stands.
pub(crate) enum RequestState {
    /// Referenced by an accepted Pre-Prepare at `seqno`, body not yet held; a fetch is
    /// outstanding.
    Wanted { seqno: SeqNumber },
    /// Body held, not yet executed.
    Present(Request),
    /// Executed; the body has been dropped.
    Executed,
}

/// What [`RequestTable::insert`] did with an arriving request body.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    /// The body was new to the table.
    New,
    /// The body fills a digest that a slot was parked on; the slot can resume.
    FilledWanted { seqno: SeqNumber },
    /// The table already held (or already executed) this request.
    Duplicate,
}

pub(crate) struct RequestTable {
    entries: IndexMap<Digest, RequestState>,
    /// Entry count above which unreferenced entries are evicted.
    capacity: usize,
    /// Per client: the id of its latest executed request and the reply it got. Request ids are
    /// monotonic per client, so one entry per client suffices for at-most-once execution.
    last_replies: HashMap<PrincipalId, (RequestId, Reply)>,
}

impl RequestTable {
    pub(crate) fn new(capacity: usize) -> RequestTable {
        RequestTable {
            entries: IndexMap::new(),
            capacity,
            last_replies: HashMap::new(),
        }
    }

    /// Store an arriving request body.
    pub(crate) fn insert(&mut self, request: Request) -> InsertOutcome {
        let digest = request.digest();
        match self.entries.get(&digest) {
            None => {
                self.entries.insert(digest, RequestState::Present(request));
                InsertOutcome::New
            }
            Some(RequestState::Wanted { seqno }) => {
                let seqno = *seqno;
                self.entries.insert(digest, RequestState::Present(request));
                InsertOutcome::FilledWanted { seqno }
            }
            Some(RequestState::Present(_)) | Some(RequestState::Executed) => {
                InsertOutcome::Duplicate
            }
        }
    }

    pub(crate) fn get(&self, digest: &Digest) -> Option<&Request> {
        match self.entries.get(digest) {
            Some(RequestState::Present(request)) => Some(request),
            _ => None,
        }
    }

    /// Record that the slot at `seqno` references `digest` and the body is missing. Returns false
    /// if the body is in fact held (no fetch needed).
    pub(crate) fn mark_wanted(&mut self, digest: Digest, seqno: SeqNumber) -> bool {
        match self.entries.get(&digest) {
            Some(RequestState::Present(_)) | Some(RequestState::Executed) => false,
            _ => {
                self.entries.insert(digest, RequestState::Wanted { seqno });
                true
            }
        }
    }

    /// The digests with an outstanding fetch.
    pub(crate) fn wanted(&self) -> Vec<Digest> {
        self.entries
            .iter()
            .filter_map(|(digest, state)| match state {
                RequestState::Wanted { .. } => Some(*digest),
                _ => None,
            })
            .collect()
    }

    /// Record the execution of `request` and cache its reply. The body is dropped; the digest is
    /// retained (as [`RequestState::Executed`]) until eviction so that late duplicate bodies are
    /// recognized.
    pub(crate) fn mark_executed(&mut self, request: &Request, reply: Reply) {
        self.entries
            .insert(request.digest(), RequestState::Executed);
        let latest = self
            .last_replies
            .entry(request.client)
            .or_insert_with(|| (request.request_id, reply.clone()));
        if request.request_id >= latest.0 {
            *latest = (request.request_id, reply);
        }
    }

    /// The id of the latest executed request of `client`, if any.
    pub(crate) fn last_executed_id(&self, client: PrincipalId) -> Option<RequestId> {
        self.last_replies.get(&client).map(|(id, _)| *id)
    }

    /// The cached reply for (`client`, `request_id`), if that exact request was the client's
    /// latest execution. Earlier request ids return `None`: the client has moved on and the reply
    /// is gone.
    pub(crate) fn cached_reply(&self, client: PrincipalId, request_id: RequestId) -> Option<&Reply> {
        self.last_replies
            .get(&client)
            .filter(|(id, _)| *id == request_id)
            .map(|(_, reply)| reply)
    }

    /// Drop state the active window no longer needs:
    /// 1. Outstanding fetches for slots at or below the new low watermark are cancelled.
    /// 2. If the table is over capacity, the oldest entries not in `referenced` are evicted.
    ///
    /// `referenced` must be the digest set currently referenced by the window's Pre-Prepares.
    pub(crate) fn garbage_collect(&mut self, low: SeqNumber, referenced: &HashSet<Digest>) {
        self.entries.retain(|_, state| match state {
            RequestState::Wanted { seqno } => *seqno > low,
            _ => true,
        });

        while self.entries.len() > self.capacity {
            let oldest_unreferenced = self
                .entries
                .keys()
                .find(|digest| !referenced.contains(*digest))
                .copied();
            match oldest_unreferenced {
                Some(digest) => {
                    self.entries.shift_remove(&digest);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;
    use crate::types::basic::ViewNumber;
    use crate::types::keypair::Keypair;
    use crate::types::principals::Authenticator;
    use crate::types::basic::SignatureBytes;

    fn request(client: u32, id: u64, payload: &[u8]) -> Request {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng));
        Request::new(
            &keypair,
            PrincipalId::new(client),
            RequestId::new(id),
            payload.to_vec(),
        )
    }

    fn reply_to(request: &Request, payload: &[u8]) -> Reply {
        Reply {
            view: ViewNumber::init(),
            request_id: request.request_id,
            client: request.client,
            from: PrincipalId::new(0),
            payload: payload.to_vec(),
            authenticator: Authenticator::Signature(SignatureBytes::new([0u8; 64])),
        }
    }

    #[test]
    fn fills_wanted_entries() {
        let mut table = RequestTable::new(16);
        let request = request(4, 1, b"op");
        let digest = request.digest();

        assert!(table.mark_wanted(digest, SeqNumber::new(3)));
        assert_eq!(table.wanted(), vec![digest]);
        assert_eq!(
            table.insert(request.clone()),
            InsertOutcome::FilledWanted {
                seqno: SeqNumber::new(3)
            }
        );
        assert!(table.wanted().is_empty());
        assert!(table.get(&digest).is_some());

        // A body that is already present needs no fetch, and re-arriving bodies are duplicates.
        assert!(!table.mark_wanted(digest, SeqNumber::new(3)));
        assert_eq!(table.insert(request), InsertOutcome::Duplicate);
    }

    #[test]
    fn at_most_once_reply_cache() {
        let mut table = RequestTable::new(16);
        let first = request(4, 1, b"first");
        let second = request(4, 2, b"second");

        table.insert(first.clone());
        table.mark_executed(&first, reply_to(&first, b"r1"));
        assert_eq!(table.last_executed_id(PrincipalId::new(4)), Some(RequestId::new(1)));
        assert_eq!(
            table
                .cached_reply(PrincipalId::new(4), RequestId::new(1))
                .map(|r| r.payload.clone()),
            Some(b"r1".to_vec())
        );

        table.insert(second.clone());
        table.mark_executed(&second, reply_to(&second, b"r2"));
        assert_eq!(table.last_executed_id(PrincipalId::new(4)), Some(RequestId::new(2)));
        // Only the latest reply stays cached.
        assert!(table.cached_reply(PrincipalId::new(4), RequestId::new(1)).is_none());

        // A re-inserted executed request is recognized as a duplicate.
        assert_eq!(table.insert(first), InsertOutcome::Duplicate);
    }

    #[test]
    fn eviction_spares_referenced_entries() {
        let mut table = RequestTable::new(2);
        let requests: Vec<Request> = (0..4).map(|i| request(4, i, &[i as u8])).collect();
        for r in &requests {
            table.insert(r.clone());
        }

        let referenced: HashSet<Digest> = [requests[0].digest()].into_iter().collect();
        table.garbage_collect(SeqNumber::init(), &referenced);

        // The oldest unreferenced entries were evicted down to capacity; the referenced one
        // survives despite being oldest.
        assert!(table.get(&requests[0].digest()).is_some());
        assert!(table.get(&requests[1].digest()).is_none());
        assert!(table.get(&requests[2].digest()).is_none());
        assert!(table.get(&requests[3].digest()).is_some());
    }

    #[test]
    fn window_advance_cancels_stale_fetches() {
        let mut table = RequestTable::new(16);
        let d1 = Digest::of_bytes(b"one");
        let d2 = Digest::of_bytes(b"two");
        table.mark_wanted(d1, SeqNumber::new(2));
        table.mark_wanted(d2, SeqNumber::new(9));

        table.garbage_collect(SeqNumber::new(4), &HashSet::new());
        assert_eq!(table.wanted(), vec![d2]);
    }
}
