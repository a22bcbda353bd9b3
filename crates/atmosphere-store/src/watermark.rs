use atmosphere_types::{LogicalTimestamp, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How much of a given peer's writes, per collection, this node has already
/// sent (outbound) or absorbed (inbound). Persisted to `watermarks.json` so a
/// restarted peer doesn't replay its whole history at every reconnect (§4.2).
#[derive(Debug, Default, Clone)]
pub struct Watermarks {
    sent: HashMap<(PeerId, String), LogicalTimestamp>,
}

// `HashMap` needs its key to implement `Hash`; `(PeerId, String)` does, but
// serde_json can't serialize a map with a tuple key directly, so we go
// through a flat `Vec` on the wire and rebuild the map on load.
#[derive(Serialize, Deserialize)]
struct WireEntry {
    peer_id: PeerId,
    collection: String,
    ts: LogicalTimestamp,
}

impl Watermarks {
    pub fn sent_watermark(&self, peer_id: PeerId, collection: &str) -> Option<LogicalTimestamp> {
        self.sent.get(&(peer_id, collection.to_string())).copied()
    }

    /// Advances the watermark after a `Sync` batch is handed to a transport;
    /// never regresses, matching "advanced on every remote write observed".
    pub fn advance_sent(&mut self, peer_id: PeerId, collection: &str, ts: LogicalTimestamp) {
        let key = (peer_id, collection.to_string());
        let entry = self.sent.entry(key).or_insert(ts);
        if ts > *entry {
            *entry = ts;
        }
    }

    /// The minimum watermark across all known peers for a collection, used by
    /// the GC sweep to decide a tombstone has been seen by everyone.
    pub fn min_for_collection(&self, collection: &str, known_peers: &[PeerId]) -> Option<LogicalTimestamp> {
        known_peers
            .iter()
            .map(|peer| self.sent_watermark(*peer, collection))
            .collect::<Option<Vec<_>>>()
            .and_then(|ts| ts.into_iter().min())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let entries: Vec<WireEntry> = self
            .sent
            .iter()
            .map(|((peer_id, collection), ts)| WireEntry { peer_id: *peer_id, collection: collection.clone(), ts: *ts })
            .collect();
        serde_json::to_string_pretty(&entries)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let entries: Vec<WireEntry> = serde_json::from_str(json)?;
        let sent = entries.into_iter().map(|e| ((e.peer_id, e.collection), e.ts)).collect();
        Ok(Self { sent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_never_regresses() {
        let mut wm = Watermarks::default();
        let peer = PeerId::generate();
        let low = LogicalTimestamp { counter: 1, peer_id: peer };
        let high = LogicalTimestamp { counter: 5, peer_id: peer };
        wm.advance_sent(peer, "demo", high);
        wm.advance_sent(peer, "demo", low);
        assert_eq!(wm.sent_watermark(peer, "demo"), Some(high));
    }

    #[test]
    fn min_requires_every_peer_to_have_advanced() {
        let mut wm = Watermarks::default();
        let a = PeerId::generate();
        let b = PeerId::generate();
        wm.advance_sent(a, "demo", LogicalTimestamp { counter: 10, peer_id: a });
        assert!(wm.min_for_collection("demo", &[a, b]).is_none());
        wm.advance_sent(b, "demo", LogicalTimestamp { counter: 3, peer_id: b });
        assert_eq!(wm.min_for_collection("demo", &[a, b]).unwrap().counter, 3);
    }

    #[test]
    fn json_roundtrip() {
        let mut wm = Watermarks::default();
        let peer = PeerId::generate();
        wm.advance_sent(peer, "demo", LogicalTimestamp { counter: 7, peer_id: peer });
        let json = wm.to_json().unwrap();
        let back = Watermarks::from_json(&json).unwrap();
        assert_eq!(back.sent_watermark(peer, "demo"), wm.sent_watermark(peer, "demo"));
    }
}
