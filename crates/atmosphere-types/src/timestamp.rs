use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A Lamport-style logical timestamp: `(counter, peer_id)`. Per-peer counters
/// are monotone; the global merge order is the lexicographic pair, which is
/// exactly what `Ord` below implements, so `BTreeMap`/`sort` give the right
/// answer for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalTimestamp {
    pub counter: u64,
    pub peer_id: PeerId,
}

impl LogicalTimestamp {
    pub fn zero(peer_id: PeerId) -> Self {
        Self { counter: 0, peer_id }
    }

    /// Advance a counter to strictly exceed both the local clock and any
    /// observed remote counter, as required on every local write and on every
    /// remote write observed (Lamport's clock rule).
    pub fn advance(local: u64, observed: u64) -> u64 {
        local.max(observed) + 1
    }
}

impl PartialOrd for LogicalTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogicalTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter.cmp(&other.counter).then_with(|| self.peer_id.cmp(&other.peer_id))
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.peer_id)
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for LogicalTimestamp {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        Self { counter: u64::arbitrary(g), peer_id: PeerId::arbitrary(g) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn orders_by_counter_then_peer() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let t1 = LogicalTimestamp { counter: 1, peer_id: hi };
        let t2 = LogicalTimestamp { counter: 1, peer_id: lo };
        let t3 = LogicalTimestamp { counter: 2, peer_id: lo };
        assert!(t2 < t1, "equal counter ties break on peer_id");
        assert!(t1 < t3, "higher counter always wins");
    }

    #[test]
    fn advance_is_strictly_monotone() {
        let mut local = 0;
        local = LogicalTimestamp::advance(local, 0);
        assert_eq!(local, 1);
        local = LogicalTimestamp::advance(local, 5);
        assert_eq!(local, 6);
        local = LogicalTimestamp::advance(local, 2);
        assert_eq!(local, 7);
    }

    #[quickcheck]
    fn advance_always_exceeds_both_inputs(local: u64, observed: u64) -> bool {
        let next = LogicalTimestamp::advance(local, observed);
        next > local && next > observed
    }

    #[quickcheck]
    fn ord_is_total(a: LogicalTimestamp, b: LogicalTimestamp) -> bool {
        a.cmp(&b) != std::cmp::Ordering::Equal || a == b
    }
}
