//! The tombstone GC sweep (§4.2): tombstones older than `TOMB_GRACE` are
//! physically removed once every known peer's watermark for that collection
//! has advanced past them -- i.e. everyone has already seen the deletion.
//!
//! `_ts` orders writes relative to each other but isn't a wall-clock time, so
//! the store separately tracks when each tombstone was first observed
//! (`TombstoneAges`) purely to drive this grace period.

use crate::collection::CollectionMap;
use crate::watermark::Watermarks;
use atmosphere_types::{PeerId, TOMB_GRACE};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Wall-clock time each tombstone was first observed, keyed by
/// `(collection, id)`. Entries are dropped once the tombstone is purged.
#[derive(Debug, Default)]
pub struct TombstoneAges {
    first_seen: HashMap<(String, String), DateTime<Utc>>,
}

impl TombstoneAges {
    pub fn record(&mut self, collection: &str, id: &str, now: DateTime<Utc>) {
        self.first_seen.entry((collection.to_string(), id.to_string())).or_insert(now);
    }

    pub fn forget(&mut self, collection: &str, id: &str) {
        self.first_seen.remove(&(collection.to_string(), id.to_string()));
    }

    fn age_of(&self, collection: &str, id: &str) -> Option<DateTime<Utc>> {
        self.first_seen.get(&(collection.to_string(), id.to_string())).copied()
    }
}

/// Returns the ids of tombstones in `collection` eligible for physical
/// removal at `now`, given the current watermark state, set of known peers,
/// and recorded tombstone ages. Does not mutate anything; callers purge via
/// `CollectionMap::purge` and `TombstoneAges::forget`.
pub fn sweep(
    collection_name: &str,
    collection: &CollectionMap,
    ages: &TombstoneAges,
    watermarks: &Watermarks,
    known_peers: &[PeerId],
    now: DateTime<Utc>,
) -> Vec<String> {
    let min_watermark = watermarks.min_for_collection(collection_name, known_peers);
    let seen_by_everyone = |ts| known_peers.is_empty() || min_watermark.is_some_and(|w| ts <= w);

    collection
        .tombstones()
        .filter(|tomb| {
            ages.age_of(collection_name, &tomb.id)
                .is_some_and(|first_seen| now.signed_duration_since(first_seen).to_std().is_ok_and(|age| age >= TOMB_GRACE))
        })
        .filter(|tomb| seen_by_everyone(tomb.ts))
        .map(|tomb| tomb.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_types::{Document, LogicalTimestamp};
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn tombstoned(peer: PeerId) -> (CollectionMap, TombstoneAges) {
        let mut map = CollectionMap::default();
        map.apply(Document::new("x", LogicalTimestamp { counter: 1, peer_id: peer }, BTreeMap::new()));
        map.apply(Document::tombstone("x", LogicalTimestamp { counter: 2, peer_id: peer }));
        (map, TombstoneAges::default())
    }

    #[test]
    fn fresh_tombstone_is_not_eligible() {
        let peer = PeerId::generate();
        let (map, mut ages) = tombstoned(peer);
        ages.record("demo", "x", Utc::now());
        let eligible = sweep("demo", &map, &ages, &Watermarks::default(), &[], Utc::now());
        assert!(eligible.is_empty());
    }

    #[test]
    fn old_tombstone_with_no_known_peers_is_eligible() {
        let peer = PeerId::generate();
        let (map, mut ages) = tombstoned(peer);
        ages.record("demo", "x", Utc::now() - Duration::days(8));
        let eligible = sweep("demo", &map, &ages, &Watermarks::default(), &[], Utc::now());
        assert_eq!(eligible, vec!["x".to_string()]);
    }

    #[test]
    fn old_tombstone_waits_for_every_peer_watermark() {
        let peer = PeerId::generate();
        let (map, mut ages) = tombstoned(peer);
        ages.record("demo", "x", Utc::now() - Duration::days(8));
        let other = PeerId::generate();
        let watermarks = Watermarks::default();
        assert!(sweep("demo", &map, &ages, &watermarks, &[other], Utc::now()).is_empty());
    }
}
