/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A coarse-grained monotonic timer wheel for the protocol's view, status, fetch, and recovery
//! timers.
//!
//! The wheel does not read the clock. It is advanced explicitly by [`tick`](TimerWheel::tick) from
//! the dispatch loop, which measures elapsed wall time itself; everything the wheel does is
//! relative to the milliseconds it has been fed. This keeps expiry deterministic under test, where
//! ticks can be fabricated.
//!
//! Cancellation is by [`TimerHandle`] and idempotent: a cancelled or already-fired timer's handle
//! can be cancelled again without effect, and a cancelled timer never fires.

use std::collections::{BTreeMap, HashMap};

use crate::types::basic::{Digest, ViewNumber};

/// What a timer firing means to the dispatch loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// The primary of `view` failed to execute a request in time.
    View { view: ViewNumber },
    /// Time to broadcast a status summary.
    Status,
    /// A fetched request body has not arrived; re-issue the fetch.
    Fetch { digest: Digest },
    /// A log sync request went unanswered; pick another peer.
    Recovery,
}

/// Identifies one armed timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TimerHandle(u64);

pub(crate) struct TimerWheel {
    now_ms: u64,
    next_handle: u64,
    // Keyed by (absolute deadline, handle); the handle disambiguates timers sharing a deadline.
    deadlines: BTreeMap<(u64, u64), TimerKind>,
    by_handle: HashMap<u64, u64>,
}

impl TimerWheel {
    pub(crate) fn new() -> TimerWheel {
        TimerWheel {
            now_ms: 0,
            next_handle: 0,
            deadlines: BTreeMap::new(),
            by_handle: HashMap::new(),
        }
    }

    /// Arm a timer to fire once `delay_ms` milliseconds of tick time from now.
    pub(crate) fn set(&mut self, delay_ms: u64, kind: TimerKind) -> TimerHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        let deadline = self.now_ms + delay_ms;
        self.deadlines.insert((deadline, handle), kind);
        self.by_handle.insert(handle, deadline);
        TimerHandle(handle)
    }

    /// Disarm a timer. Cancelling a handle that already fired or was already cancelled is a no-op.
    pub(crate) fn cancel(&mut self, handle: TimerHandle) {
        if let Some(deadline) = self.by_handle.remove(&handle.0) {
            self.deadlines.remove(&(deadline, handle.0));
        }
    }

    /// Advance the wheel by `elapsed_ms` and collect every timer whose deadline passed, in
    /// deadline order.
    pub(crate) fn tick(&mut self, elapsed_ms: u64) -> Vec<(TimerHandle, TimerKind)> {
        self.now_ms += elapsed_ms;

        let mut fired = Vec::new();
        while let Some((&(deadline, handle), _)) = self.deadlines.iter().next() {
            if deadline > self.now_ms {
                break;
            }
            let kind = self
                .deadlines
                .remove(&(deadline, handle))
                .expect("the entry was just observed");
            self.by_handle.remove(&handle);
            fired.push((TimerHandle(handle), kind));
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        wheel.set(30, TimerKind::Status);
        wheel.set(
            10,
            TimerKind::View {
                view: ViewNumber::new(0),
            },
        );

        assert!(wheel.tick(5).is_empty());

        let fired = wheel.tick(30);
        assert_eq!(fired.len(), 2);
        assert_eq!(
            fired[0].1,
            TimerKind::View {
                view: ViewNumber::new(0)
            }
        );
        assert_eq!(fired[1].1, TimerKind::Status);

        assert!(wheel.tick(1000).is_empty());
    }

    #[test]
    fn cancelled_timers_do_not_fire() {
        let mut wheel = TimerWheel::new();
        let handle = wheel.set(10, TimerKind::Recovery);
        let kept = wheel.set(10, TimerKind::Status);
        wheel.cancel(handle);
        // Cancellation is idempotent.
        wheel.cancel(handle);

        let fired = wheel.tick(10);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, kept);

        // Cancelling a fired handle is also a no-op.
        wheel.cancel(kept);
    }

    #[test]
    fn same_deadline_timers_all_fire() {
        let mut wheel = TimerWheel::new();
        let digest = Digest::of_bytes(b"request");
        wheel.set(5, TimerKind::Fetch { digest });
        wheel.set(5, TimerKind::Fetch { digest });
        assert_eq!(wheel.tick(5).len(), 2);
    }
}
