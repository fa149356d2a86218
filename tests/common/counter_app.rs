//! A minimal replicated state machine for tests: a counter that each request adds to.
//!
//! Request payloads are a little-endian u64 addend; replies carry the counter value after the
//! addition. Clones share the same backing state, which is how tests observe a replica's progress
//! from outside.

use std::sync::{Arc, Mutex};

use borsh::BorshSerialize;
use pbft_rs::app::{App, ApplyOutcome, HostFailure};
use pbft_rs::requests::messages::Request;
use pbft_rs::types::basic::{Digest, SeqNumber};

struct Inner {
    counter: u64,
    version: SeqNumber,
    // (version, counter) history retained for snapshots and rollback.
    history: Vec<(SeqNumber, u64)>,
}

#[derive(Clone)]
pub(crate) struct CounterApp {
    inner: Arc<Mutex<Inner>>,
}

impl CounterApp {
    pub(crate) fn new() -> CounterApp {
        CounterApp {
            inner: Arc::new(Mutex::new(Inner {
                counter: 0,
                version: SeqNumber::init(),
                history: vec![(SeqNumber::init(), 0)],
            })),
        }
    }

    pub(crate) fn counter(&self) -> u64 {
        self.inner.lock().unwrap().counter
    }
}

impl App for CounterApp {
    fn apply(&mut self, seqno: SeqNumber, batch: &[Request]) -> Result<ApplyOutcome, HostFailure> {
        let mut inner = self.inner.lock().unwrap();
        let mut replies = Vec::new();
        for request in batch {
            let addend_bytes: [u8; 8] = request
                .payload
                .get(..8)
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| HostFailure(String::from("payload is not a u64 addend")))?;
            inner.counter += u64::from_le_bytes(addend_bytes);
            replies.push(inner.counter.to_le_bytes().to_vec());
        }
        inner.version = seqno;
        let counter = inner.counter;
        inner.history.push((seqno, counter));
        Ok(ApplyOutcome {
            replies,
            new_principals: Vec::new(),
        })
    }

    fn snapshot(&mut self, seqno: SeqNumber) -> Digest {
        let inner = self.inner.lock().unwrap();
        let counter = inner
            .history
            .iter()
            .rev()
            .find(|(version, _)| *version <= seqno)
            .map(|(_, counter)| *counter)
            .expect("no state retained at or below the requested seqno");
        Digest::of_bytes(&(seqno, counter).try_to_vec().unwrap())
    }

    fn rollback(&mut self, seqno: SeqNumber) {
        let mut inner = self.inner.lock().unwrap();
        inner.history.retain(|(version, _)| *version <= seqno);
        let (version, counter) = *inner
            .history
            .last()
            .expect("rollback cannot undo the initial state");
        inner.version = version;
        inner.counter = counter;
    }

    fn current_version(&self) -> SeqNumber {
        self.inner.lock().unwrap().version
    }

    fn compact(&mut self, seqno: SeqNumber) {
        let mut inner = self.inner.lock().unwrap();
        let keep_from = inner
            .history
            .iter()
            .rev()
            .find(|(version, _)| *version <= seqno)
            .map(|(version, _)| *version)
            .unwrap_or(SeqNumber::init());
        inner.history.retain(|(version, _)| *version >= keep_from);
    }
}
