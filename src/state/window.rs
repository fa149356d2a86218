/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The sliding window of ordering slots.
//!
//! A [`LogWindow`] holds one [`Slot`] per sequence number in `(low, low + L]`, where `low` is the
//! seqno of the last stable checkpoint and `L` is the configured window size. The two invariants
//! the window maintains are that `high - low == L` at all times, and that `low` only ever
//! increases; both are what bound the state a view change has to carry.

use std::collections::{HashSet, VecDeque};

use crate::ordering::messages::PrePrepare;
use crate::ordering::types::{CommitCollector, PrepareCollector};
use crate::status::messages::SummaryPhase;
use crate::types::basic::{Digest, SeqNumber};

/// How far a slot has progressed. Phases only ever advance within a view; a view change is the one
/// event that may re-initialize a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotPhase {
    /// No Pre-Prepare accepted yet.
    Empty,
    /// A Pre-Prepare was accepted, but some referenced request bodies are still being fetched.
    AwaitingRequests,
    PrePrepared,
    Prepared,
    Committed,
    Executed,
}

/// One in-progress ordering decision.
pub(crate) struct Slot {
    pub(crate) seqno: SeqNumber,
    pub(crate) phase: SlotPhase,
    pub(crate) pre_prepare: Option<PrePrepare>,
    pub(crate) prepares: PrepareCollector,
    pub(crate) commits: CommitCollector,
    /// Digests referenced by the accepted Pre-Prepare whose bodies have not arrived yet.
    pub(crate) missing_requests: HashSet<Digest>,
}

impl Slot {
    fn new(seqno: SeqNumber) -> Slot {
        Slot {
            seqno,
            phase: SlotPhase::Empty,
            pre_prepare: None,
            prepares: PrepareCollector::new(),
            commits: CommitCollector::new(),
            missing_requests: HashSet::new(),
        }
    }

    /// Advance the phase to `phase` if it is higher than the current one. Phases never move
    /// backwards within a view.
    pub(crate) fn advance_phase(&mut self, phase: SlotPhase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }

    /// The digest bound to this slot, once a Pre-Prepare was accepted.
    pub(crate) fn digest(&self) -> Option<Digest> {
        self.pre_prepare.as_ref().map(|pp| pp.batch_digest)
    }

    pub(crate) fn summary_phase(&self) -> SummaryPhase {
        match self.phase {
            SlotPhase::Empty => SummaryPhase::Empty,
            SlotPhase::AwaitingRequests | SlotPhase::PrePrepared => SummaryPhase::PrePrepared,
            SlotPhase::Prepared => SummaryPhase::Prepared,
            SlotPhase::Committed | SlotPhase::Executed => SummaryPhase::Committed,
        }
    }
}

/// Ways in which addressing a slot can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    /// The seqno lies outside `(low, high]`.
    OutOfWindow {
        seqno: SeqNumber,
        low: SeqNumber,
        high: SeqNumber,
    },
}

/// The sliding window of [`Slot`]s for seqnos in `(low, low + L]`.
pub(crate) struct LogWindow {
    low: SeqNumber,
    size: u64,
    // slots[i] holds the slot for seqno `low + 1 + i`; the deque always holds exactly `size`
    // slots.
    slots: VecDeque<Slot>,
}

impl LogWindow {
    pub(crate) fn new(low: SeqNumber, size: u64) -> LogWindow {
        let slots = (1..=size).map(|offset| Slot::new(low + offset)).collect();
        LogWindow { low, size, slots }
    }

    /// The low watermark: the seqno of the last stable checkpoint.
    pub(crate) fn low(&self) -> SeqNumber {
        self.low
    }

    /// The high watermark. `high() - low()` equals the window size at all times.
    pub(crate) fn high(&self) -> SeqNumber {
        self.low + self.size
    }

    pub(crate) fn contains(&self, seqno: SeqNumber) -> bool {
        seqno > self.low && seqno <= self.high()
    }

    pub(crate) fn slot(&self, seqno: SeqNumber) -> Result<&Slot, WindowError> {
        if !self.contains(seqno) {
            return Err(self.out_of_window(seqno));
        }
        Ok(&self.slots[(seqno - self.low - 1) as usize])
    }

    pub(crate) fn slot_mut(&mut self, seqno: SeqNumber) -> Result<&mut Slot, WindowError> {
        if !self.contains(seqno) {
            return Err(self.out_of_window(seqno));
        }
        let index = (seqno - self.low - 1) as usize;
        Ok(&mut self.slots[index])
    }

    /// Raise the low watermark to `new_low`, freeing every slot at or below it and admitting fresh
    /// empty slots at the top. A `new_low` at or below the current watermark is a no-op: the
    /// watermark is monotone.
    pub(crate) fn advance(&mut self, new_low: SeqNumber) {
        while self.low < new_low {
            self.slots.pop_front();
            self.low += 1;
            self.slots.push_back(Slot::new(self.low + self.size));
        }
    }

    /// Replace the slot for `seqno` with a fresh empty one. Used when a view change re-initializes
    /// the window above the stable checkpoint.
    pub(crate) fn reset_slot(&mut self, seqno: SeqNumber) -> Result<&mut Slot, WindowError> {
        if !self.contains(seqno) {
            return Err(self.out_of_window(seqno));
        }
        let index = (seqno - self.low - 1) as usize;
        self.slots[index] = Slot::new(seqno);
        Ok(&mut self.slots[index])
    }

    /// Iterate over all slots, lowest seqno first.
    pub(crate) fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// The request digests referenced by any Pre-Prepare currently in the window. The request
    /// table must keep these bodies resident.
    pub(crate) fn referenced_digests(&self) -> HashSet<Digest> {
        self.slots
            .iter()
            .filter_map(|slot| slot.pre_prepare.as_ref())
            .flat_map(|pp| pp.requests.iter().map(|r| r.digest()))
            .collect()
    }

    fn out_of_window(&self, seqno: SeqNumber) -> WindowError {
        WindowError::OutOfWindow {
            seqno,
            low: self.low,
            high: self.high(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermarks_are_invariant_under_advance() {
        let mut window = LogWindow::new(SeqNumber::init(), 8);
        assert_eq!(window.low(), SeqNumber::new(0));
        assert_eq!(window.high(), SeqNumber::new(8));

        window.advance(SeqNumber::new(3));
        assert_eq!(window.low(), SeqNumber::new(3));
        assert_eq!(window.high(), SeqNumber::new(11));
        assert_eq!(window.high() - window.low(), 8);
        assert_eq!(window.slots().count(), 8);

        // The watermark is monotone: advancing backwards is a no-op.
        window.advance(SeqNumber::new(1));
        assert_eq!(window.low(), SeqNumber::new(3));
    }

    #[test]
    fn slots_outside_the_window_are_rejected() {
        let mut window = LogWindow::new(SeqNumber::init(), 8);

        assert!(window.slot(SeqNumber::new(1)).is_ok());
        assert!(window.slot(SeqNumber::new(8)).is_ok());

        // The low watermark itself is below the window.
        assert_eq!(
            window.slot(SeqNumber::new(0)).err(),
            Some(WindowError::OutOfWindow {
                seqno: SeqNumber::new(0),
                low: SeqNumber::new(0),
                high: SeqNumber::new(8),
            })
        );
        assert!(window.slot(SeqNumber::new(9)).is_err());

        window.advance(SeqNumber::new(4));
        assert!(window.slot(SeqNumber::new(4)).is_err());
        assert!(window.slot(SeqNumber::new(12)).is_ok());
    }

    #[test]
    fn advancing_frees_slot_state() {
        let mut window = LogWindow::new(SeqNumber::init(), 4);
        window
            .slot_mut(SeqNumber::new(1))
            .unwrap()
            .advance_phase(SlotPhase::Prepared);

        window.advance(SeqNumber::new(4));
        // Seqno 5 reuses the deque position that seqno 1 occupied; it must come up empty.
        assert_eq!(window.slot(SeqNumber::new(5)).unwrap().phase, SlotPhase::Empty);
    }

    #[test]
    fn phases_do_not_move_backwards() {
        let mut window = LogWindow::new(SeqNumber::init(), 4);
        let slot = window.slot_mut(SeqNumber::new(2)).unwrap();
        slot.advance_phase(SlotPhase::Committed);
        slot.advance_phase(SlotPhase::Prepared);
        assert_eq!(slot.phase, SlotPhase::Committed);
    }
}
