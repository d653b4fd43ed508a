//! Process-wide Lamport logical clock.
//!
//! Every send or receive advances the clock according to `max(mine, peer) + 1`.
//! Because that update rule is a pure function of the current value, the
//! clock is modeled as a single `AtomicU64` with a compare-and-swap retry
//! loop rather than a mutex-guarded counter.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically non-decreasing logical clock shared by one process.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        LamportClock {
            value: AtomicU64::new(0),
        }
    }

    /// Current value without advancing it.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Advance the clock for a local event: `clock := clock + 1`.
    pub fn tick(&self) -> u64 {
        self.observe(0)
    }

    /// Advance the clock on send/receive of a message carrying `peer_clock`:
    /// `clock := max(clock, peer_clock) + 1`. Returns the new value.
    pub fn observe(&self, peer_clock: u64) -> u64 {
        let mut current = self.value.load(Ordering::SeqCst);
        loop {
            let next = current.max(peer_clock) + 1;
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let clock = LamportClock::new();
        assert_eq!(clock.get(), 0);
    }

    #[test]
    fn tick_is_monotonic() {
        let clock = LamportClock::new();
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
    }

    #[test]
    fn observe_takes_the_max() {
        let clock = LamportClock::new();
        clock.tick(); // clock = 1
        let observed = clock.observe(100);
        assert_eq!(observed, 101);
    }

    #[test]
    fn observe_of_a_stale_peer_still_advances() {
        let clock = LamportClock::new();
        for _ in 0..10 {
            clock.tick();
        }
        let before = clock.get();
        let observed = clock.observe(0);
        assert_eq!(observed, before + 1);
    }

    #[test]
    fn never_decreases_under_interleaving() {
        let clock = LamportClock::new();
        let mut last = clock.get();
        for peer in [5, 2, 9, 1, 50, 3] {
            let next = clock.observe(peer);
            assert!(next >= last);
            last = next;
        }
    }
}
