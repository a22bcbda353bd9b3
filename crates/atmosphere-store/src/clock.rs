use atmosphere_types::{LogicalTimestamp, PeerId};
use std::sync::atomic::{AtomicU64, Ordering};

/// The local half of every document's `_ts`: a monotone per-peer counter,
/// advanced on every local write and on every remote counter observed
/// (Lamport's clock rule, §3 invariant 1).
pub struct LocalClock {
    peer_id: PeerId,
    counter: AtomicU64,
}

impl LocalClock {
    pub fn new(peer_id: PeerId) -> Self {
        Self { peer_id, counter: AtomicU64::new(0) }
    }

    /// Assigns the timestamp for a fresh local write.
    pub fn tick(&self) -> LogicalTimestamp {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        LogicalTimestamp { counter, peer_id: self.peer_id }
    }

    /// Folds in a counter observed on an incoming document so the local clock
    /// never falls behind a peer's.
    pub fn observe(&self, observed: u64) {
        self.counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
            Some(LogicalTimestamp::advance(local, observed) - 1)
        }).ok();
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_strictly_monotone() {
        let clock = LocalClock::new(PeerId::generate());
        let a = clock.tick();
        let b = clock.tick();
        assert!(b.counter > a.counter);
    }

    #[test]
    fn observing_a_higher_counter_advances_local_clock() {
        let clock = LocalClock::new(PeerId::generate());
        clock.tick();
        clock.observe(100);
        let next = clock.tick();
        assert_eq!(next.counter, 101);
    }

    #[test]
    fn observing_a_lower_counter_does_not_regress() {
        let clock = LocalClock::new(PeerId::generate());
        for _ in 0..5 {
            clock.tick();
        }
        clock.observe(1);
        let next = clock.tick();
        assert_eq!(next.counter, 6);
    }
}
