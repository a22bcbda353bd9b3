use crate::peer::PeerId;
use crate::timestamp::LogicalTimestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A document in a CRDT collection. `fields` is deliberately `serde_json::Value`
/// rather than a hand-rolled enum: the spec's data model is "JSON-like", and
/// values are only ever inspected by the router/gossip layers, never executed,
/// so there is no benefit in a bespoke representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(rename = "_ts")]
    pub ts: LogicalTimestamp,
    #[serde(rename = "_tomb", default)]
    pub tomb: bool,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, ts: LogicalTimestamp, fields: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            ts,
            tomb: false,
            fields,
        }
    }

    pub fn tombstone(id: impl Into<String>, ts: LogicalTimestamp) -> Self {
        Self {
            id: id.into(),
            ts,
            tomb: true,
            fields: BTreeMap::new(),
        }
    }

    /// Approximate wire size used to enforce `MAX_DOCUMENT_BYTES` at insert.
    pub fn approx_size(&self) -> usize {
        serde_json::to_vec(&self.fields).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// Last-writer-wins merge rule: the incoming document replaces the
    /// existing one only if its timestamp is strictly greater. Tombstones
    /// participate in the same ordering, so an older write can never
    /// resurrect a tombstoned document (invariant 2).
    pub fn should_replace(existing: Option<&Document>, incoming: &Document) -> bool {
        match existing {
            None => true,
            Some(e) => incoming.ts > e.ts,
        }
    }
}

/// The kind of change an observer is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Delivered to every registered observer of a collection. `origin` is `None`
/// for a locally-originated write and `Some((peer, frame_hops))` for a write
/// that arrived from the mesh, where `peer` is the directly-connected
/// neighbor that delivered it (not necessarily the document's own `node_id`)
/// and `frame_hops` is how many times the carrying frame had already been
/// relayed (`Frame::hops`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverEvent {
    pub collection: String,
    pub id: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub origin: Option<(PeerId, u8)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;

    fn ts(counter: u64, peer: PeerId) -> LogicalTimestamp {
        LogicalTimestamp { counter, peer_id: peer }
    }

    #[test]
    fn newer_timestamp_replaces() {
        let peer = PeerId::generate();
        let old = Document::new("x", ts(1, peer), BTreeMap::new());
        let new = Document::new("x", ts(2, peer), BTreeMap::new());
        assert!(Document::should_replace(Some(&old), &new));
        assert!(!Document::should_replace(Some(&new), &old));
    }

    #[test]
    fn tombstone_is_not_resurrected_by_older_write() {
        let peer = PeerId::generate();
        let tomb = Document::tombstone("x", ts(5, peer));
        let stale_write = Document::new("x", ts(3, peer), BTreeMap::new());
        assert!(!Document::should_replace(Some(&tomb), &stale_write));
    }

    #[test]
    fn missing_document_is_always_replaced() {
        let peer = PeerId::generate();
        let doc = Document::new("x", ts(1, peer), BTreeMap::new());
        assert!(Document::should_replace(None, &doc));
    }
}
