use atmosphere_types::{ChangeKind, Document, LogicalTimestamp};
use std::collections::BTreeMap;

/// One named collection's documents, keyed by `_id`. Tombstones stay in the
/// map (invariant 2 needs somewhere to keep winning over late writes) and are
/// only physically removed by the GC sweep once every known peer has caught up.
#[derive(Debug, Default)]
pub struct CollectionMap {
    documents: BTreeMap<String, Document>,
}

/// What applying a document to a collection did, if anything -- `None` means
/// the incoming document lost to LWW and was dropped.
pub struct Applied {
    pub kind: ChangeKind,
    pub id: String,
}

impl CollectionMap {
    pub fn get(&self, id: &str) -> Option<&Document> {
        self.documents.get(id)
    }

    /// Non-tombstoned documents only, per `query()`'s contract.
    pub fn live(&self) -> impl Iterator<Item = &Document> {
        self.documents.values().filter(|d| !d.tomb)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// `since_ts`-filtered documents, in `_ts` order, for an anti-entropy `Sync`.
    pub fn since(&self, since: Option<LogicalTimestamp>) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .documents
            .values()
            .filter(|d| since.map_or(true, |watermark| d.ts > watermark))
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.ts);
        docs
    }

    /// Applies the last-writer-wins merge rule (§4.2). Returns `Some` with the
    /// change kind when the document actually replaced what was there.
    pub fn apply(&mut self, incoming: Document) -> Option<Applied> {
        let existing = self.documents.get(&incoming.id);
        if !Document::should_replace(existing, &incoming) {
            return None;
        }
        let kind = match (existing, incoming.tomb) {
            (_, true) => ChangeKind::Delete,
            (None, false) => ChangeKind::Insert,
            (Some(_), false) => ChangeKind::Update,
        };
        let id = incoming.id.clone();
        self.documents.insert(incoming.id.clone(), incoming);
        Some(Applied { kind, id })
    }

    /// Physically removes a tombstone once the GC sweep has decided it is safe.
    pub fn purge(&mut self, id: &str) {
        if self.documents.get(id).is_some_and(|d| d.tomb) {
            self.documents.remove(id);
        }
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &Document> {
        self.documents.values().filter(|d| d.tomb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_types::PeerId;
    use std::collections::BTreeMap as Map;

    fn ts(counter: u64, peer: PeerId) -> LogicalTimestamp {
        LogicalTimestamp { counter, peer_id: peer }
    }

    #[test]
    fn newer_write_wins_and_reports_update() {
        let peer = PeerId::generate();
        let mut map = CollectionMap::default();
        assert!(matches!(map.apply(Document::new("x", ts(1, peer), Map::new())), Some(Applied { kind: ChangeKind::Insert, .. })));
        let applied = map.apply(Document::new("x", ts(2, peer), Map::new()));
        assert!(matches!(applied, Some(Applied { kind: ChangeKind::Update, .. })));
    }

    #[test]
    fn older_write_is_dropped() {
        let peer = PeerId::generate();
        let mut map = CollectionMap::default();
        map.apply(Document::new("x", ts(5, peer), Map::new()));
        assert!(map.apply(Document::new("x", ts(1, peer), Map::new())).is_none());
    }

    #[test]
    fn delete_then_query_excludes_document() {
        let peer = PeerId::generate();
        let mut map = CollectionMap::default();
        map.apply(Document::new("x", ts(1, peer), Map::new()));
        map.apply(Document::tombstone("x", ts(2, peer)));
        assert_eq!(map.live().count(), 0);
        assert!(map.get("x").unwrap().tomb);
    }

    #[test]
    fn since_filters_and_orders_by_ts() {
        let peer = PeerId::generate();
        let mut map = CollectionMap::default();
        map.apply(Document::new("a", ts(3, peer), Map::new()));
        map.apply(Document::new("b", ts(1, peer), Map::new()));
        map.apply(Document::new("c", ts(2, peer), Map::new()));
        let docs = map.since(Some(ts(1, peer)));
        let ids: Vec<_> = docs.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }
}
