//! An in-memory [`Ledger`] whose clones share the same backing store.

use std::sync::{Arc, Mutex};

use pbft_rs::ledger::Ledger;
use pbft_rs::types::basic::SeqNumber;

#[derive(Clone)]
pub(crate) struct MemLedger {
    entries: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemLedger {
    pub(crate) fn new() -> MemLedger {
        MemLedger {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Ledger for MemLedger {
    fn append(&mut self, entry: &[u8]) {
        self.entries.lock().unwrap().push(entry.to_vec());
    }

    fn truncate(&mut self, seqno: SeqNumber) {
        self.entries.lock().unwrap().truncate(seqno.int() as usize);
    }

    fn get_entry(&self, seqno: SeqNumber) -> Option<Vec<u8>> {
        if seqno == SeqNumber::init() {
            return None;
        }
        self.entries
            .lock()
            .unwrap()
            .get(seqno.int() as usize - 1)
            .cloned()
    }

    fn latest(&self) -> SeqNumber {
        SeqNumber::new(self.entries.lock().unwrap().len() as u64)
    }
}
