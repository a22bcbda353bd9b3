use crate::clock::LocalClock;
use crate::collection::CollectionMap;
use crate::gc::{self, TombstoneAges};
use crate::observer::{ObserverId, ObserverReceiver, ObserverRegistry};
use crate::persistence::{LogRecord, PersistentLog, Snapshot};
use crate::sync::{chunk_sync_batch, HelloSummary, SyncMessage};
use crate::watermark::Watermarks;
use atmosphere_types::{Document, LogicalTimestamp, ObserverEvent, PeerEntry, PeerId, TransportKind, MAX_DOCUMENT_BYTES};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document exceeds MAX_DOCUMENT_BYTES ({0} > {MAX_DOCUMENT_BYTES})")]
    DocumentTooLarge(usize),
    #[error("store failed to open: {0}")]
    FatalStorage(#[from] crate::persistence::PersistenceError),
    #[error("tombstoned document {0}/{1} cannot be re-tombstoned by an older write")]
    TombstoneOverwrite(String, String),
}

struct Inner {
    collections: HashMap<String, CollectionMap>,
    tombstone_ages: TombstoneAges,
    watermarks: Watermarks,
    peers: HashMap<PeerId, PeerEntry>,
}

/// The CRDT-replicated key/value store (§4.2). Guarded by a single
/// read/write lock as specified in §5: queries and router scoring take a
/// read lock, writes take the write lock only around the insert/merge
/// itself. The observer registry and gradient table live outside this lock
/// entirely.
pub struct Store {
    local_peer_id: PeerId,
    data_dir: std::path::PathBuf,
    clock: LocalClock,
    inner: RwLock<Inner>,
    observers: ObserverRegistry,
    log: tokio::sync::Mutex<PersistentLog>,
    patch_tx: mpsc::Sender<(String, Document)>,
    patch_rx: tokio::sync::Mutex<Option<mpsc::Receiver<(String, Document)>>>,
}

impl Store {
    pub fn open(data_dir: &Path, local_peer_id: PeerId) -> Result<Arc<Self>, StoreError> {
        let (log, snapshot, replay) = PersistentLog::open(data_dir)?;
        let mut collections: HashMap<String, CollectionMap> = HashMap::new();
        let mut tombstone_ages = TombstoneAges::default();
        let now = Utc::now();

        for (name, docs) in snapshot.collections {
            let map = collections.entry(name.clone()).or_default();
            for doc in docs {
                let is_tomb = doc.tomb;
                let id = doc.id.clone();
                map.apply(doc);
                if is_tomb {
                    tombstone_ages.record(&name, &id, now);
                }
            }
        }
        for record in replay {
            let map = collections.entry(record.collection.clone()).or_default();
            let is_tomb = record.document.tomb;
            let id = record.document.id.clone();
            map.apply(record.document);
            if is_tomb {
                tombstone_ages.record(&record.collection, &id, now);
            }
        }

        let watermarks = Self::load_watermarks(data_dir);

        let (patch_tx, patch_rx) = mpsc::channel(1024);
        Ok(Arc::new(Self {
            local_peer_id,
            data_dir: data_dir.to_path_buf(),
            clock: LocalClock::new(local_peer_id),
            inner: RwLock::new(Inner {
                collections,
                tombstone_ages,
                watermarks,
                peers: HashMap::new(),
            }),
            observers: ObserverRegistry::default(),
            log: tokio::sync::Mutex::new(log),
            patch_tx,
            patch_rx: tokio::sync::Mutex::new(Some(patch_rx)),
        }))
    }

    fn watermarks_path(data_dir: &Path) -> std::path::PathBuf {
        data_dir.join("watermarks.json")
    }

    /// Loads `{data_dir}/watermarks.json` per §6's persisted layout. A
    /// missing or corrupt file just starts from empty watermarks -- losing
    /// them only costs a redundant resend on the next anti-entropy round,
    /// never correctness.
    fn load_watermarks(data_dir: &Path) -> Watermarks {
        match std::fs::read_to_string(Self::watermarks_path(data_dir)) {
            Ok(json) => Watermarks::from_json(&json).unwrap_or_else(|err| {
                tracing::warn!(%err, "watermarks.json is corrupt, starting from empty watermarks");
                Watermarks::default()
            }),
            Err(_) => Watermarks::default(),
        }
    }

    /// Flushes the current watermark state to disk. Called by the supervisor
    /// on every TTL sweep tick and on clean shutdown (§4.8).
    pub fn flush_watermarks(&self) -> Result<(), StoreError> {
        let json = self.inner.read().watermarks.to_json().map_err(|err| StoreError::FatalStorage(crate::persistence::PersistenceError::Io {
            path: Self::watermarks_path(&self.data_dir),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        }))?;
        std::fs::write(Self::watermarks_path(&self.data_dir), json).map_err(|source| {
            StoreError::FatalStorage(crate::persistence::PersistenceError::Io { path: Self::watermarks_path(&self.data_dir), source })
        })?;
        Ok(())
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Local write entry point. Assigns `_ts`, merges it into the in-memory
    /// collection, appends it to the log, fires observers, and returns the
    /// `Patch` to fan out to every connected peer.
    pub async fn insert(&self, collection: &str, id: impl Into<String>, fields: BTreeMap<String, serde_json::Value>) -> Result<Document, StoreError> {
        let ts = self.clock.tick();
        let doc = Document::new(id, ts, fields);
        let size = doc.approx_size();
        if size > MAX_DOCUMENT_BYTES {
            return Err(StoreError::DocumentTooLarge(size));
        }
        self.apply_local(collection, doc).await
    }

    pub fn delete(&self, collection: &str, id: &str) -> DeleteFuture<'_> {
        DeleteFuture { store: self, collection: collection.to_string(), id: id.to_string() }
    }

    async fn apply_local(&self, collection: &str, doc: Document) -> Result<Document, StoreError> {
        let applied = {
            let mut inner = self.inner.write();
            inner.collections.entry(collection.to_string()).or_default().apply(doc.clone())
        };
        if let Some(applied) = applied {
            if doc.tomb {
                self.inner.write().tombstone_ages.record(collection, &doc.id, Utc::now());
            }
            self.persist(collection, &doc).await?;
            self.observers.emit(ObserverEvent { collection: collection.to_string(), id: applied.id, kind: applied.kind, origin: None });
            let _ = self.patch_tx.try_send((collection.to_string(), doc.clone()));
        }
        Ok(doc)
    }

    async fn persist(&self, collection: &str, doc: &Document) -> Result<(), StoreError> {
        let record = LogRecord { collection: collection.to_string(), document: doc.clone() };
        let mut log = self.log.lock().await;
        log.append(&record, || self.snapshot_now())?;
        Ok(())
    }

    fn snapshot_now(&self) -> Snapshot {
        let inner = self.inner.read();
        let collections = inner
            .collections
            .iter()
            .map(|(name, map)| (name.clone(), map.iter().cloned().collect()))
            .collect();
        Snapshot { log_offset: 0, collections }
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.inner.read().collections.get(collection).and_then(|c| c.get(id)).cloned()
    }

    pub fn query(&self, collection: &str) -> Vec<Document> {
        self.inner
            .read()
            .collections
            .get(collection)
            .map(|c| c.live().cloned().collect())
            .unwrap_or_default()
    }

    pub fn observe(&self, collection: &str) -> (ObserverId, ObserverReceiver) {
        self.observers.register(collection)
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.observers.remove(id);
    }

    pub fn connected_peers(&self) -> Vec<PeerEntry> {
        self.inner.read().peers.values().cloned().collect()
    }

    pub fn record_peer_seen(&self, peer_id: PeerId, transport: TransportKind) {
        let mut inner = self.inner.write();
        let entry = inner.peers.entry(peer_id).or_insert_with(|| PeerEntry {
            peer_id,
            transport,
            last_seen: Utc::now(),
            rtt_hint: None,
        });
        entry.transport = transport;
        entry.last_seen = Utc::now();
    }

    pub fn peer_gone(&self, peer_id: PeerId) {
        self.inner.write().peers.remove(&peer_id);
    }

    pub fn known_peer_ids(&self) -> Vec<PeerId> {
        self.inner.read().peers.keys().copied().collect()
    }

    /// Every collection name this node currently holds documents for; used by
    /// the supervisor's periodic GC sweep, which has no other way to learn
    /// what collections exist.
    pub fn known_collections(&self) -> Vec<String> {
        self.inner.read().collections.keys().cloned().collect()
    }

    /// A channel of every locally-applied write, consumed once by the
    /// supervisor to fan `Patch` messages out over every transport. Calling
    /// this a second time returns `None` -- there is exactly one consumer.
    pub async fn take_patch_receiver(&self) -> Option<mpsc::Receiver<(String, Document)>> {
        self.patch_rx.lock().await.take()
    }

    /// Applies an incoming `Patch`/`Sync` document from a remote peer,
    /// observing its counter on the local clock and firing observers exactly
    /// like a local write (merge is the same in both directions). `sender` is
    /// the directly-connected peer the carrying frame arrived from and
    /// `frame_hops` is that frame's `Frame::hops` -- neither is part of the
    /// document itself, so observers that care about mesh provenance (the
    /// gradient table, §4.4) can only learn it here.
    pub async fn apply_remote(&self, collection: &str, doc: Document, sender: PeerId, frame_hops: u8) -> Result<(), StoreError> {
        self.clock.observe(doc.ts.counter);
        let is_tomb = doc.tomb;
        let id = doc.id.clone();
        let ts = doc.ts;
        let applied = {
            let mut inner = self.inner.write();
            inner.collections.entry(collection.to_string()).or_default().apply(doc.clone())
        };
        if let Some(applied) = applied {
            if is_tomb {
                self.inner.write().tombstone_ages.record(collection, &id, Utc::now());
            }
            self.persist(collection, &doc).await?;
            self.observers.emit(ObserverEvent {
                collection: collection.to_string(),
                id: applied.id,
                kind: applied.kind,
                origin: Some((sender, frame_hops)),
            });
        }
        let _ = ts;
        Ok(())
    }

    /// Produces the `Hello` this peer sends on connect: the highest `_ts` it
    /// already has, per collection, so the other side knows what not to resend.
    pub fn hello_summary(&self) -> HelloSummary {
        let inner = self.inner.read();
        let known = inner
            .collections
            .iter()
            .filter_map(|(name, map)| map.iter().map(|d| d.ts).max().map(|ts| (name.clone(), ts)))
            .collect();
        HelloSummary { known }
    }

    /// Answers a peer's `Hello`: one `Sync` (possibly chunked) per collection
    /// this node has documents for, holding back anything the peer already
    /// claims to have.
    pub fn answer_hello(&self, peer_id: PeerId, their_summary: &HelloSummary) -> Vec<SyncMessage> {
        let inner = self.inner.read();
        let mut messages = Vec::new();
        for (name, map) in inner.collections.iter() {
            let stored_watermark = inner.watermarks.sent_watermark(peer_id, name);
            let claimed: Option<LogicalTimestamp> = their_summary.known.get(name).copied();
            let since = match (stored_watermark, claimed) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };
            let docs = map.since(since);
            if docs.is_empty() {
                continue;
            }
            messages.extend(chunk_sync_batch(name, since, docs));
        }
        messages
    }

    /// Records that a `Sync` batch was handed off to a transport so the next
    /// `Hello` from this peer doesn't resend it.
    pub fn advance_sent_watermark(&self, peer_id: PeerId, collection: &str, ts: LogicalTimestamp) {
        self.inner.write().watermarks.advance_sent(peer_id, collection, ts);
    }

    /// The periodic tombstone GC sweep (§4.2), run by the supervisor.
    pub fn gc_sweep(&self, collection: &str) -> Vec<String> {
        let mut inner = self.inner.write();
        let known_peers: Vec<PeerId> = inner.peers.keys().copied().collect();
        let eligible = match inner.collections.get(collection) {
            Some(map) => gc::sweep(collection, map, &inner.tombstone_ages, &inner.watermarks, &known_peers, Utc::now()),
            None => Vec::new(),
        };
        if let Some(map) = inner.collections.get_mut(collection) {
            for id in &eligible {
                map.purge(id);
            }
        }
        for id in &eligible {
            inner.tombstone_ages.forget(collection, id);
        }
        eligible
    }
}

pub struct DeleteFuture<'a> {
    store: &'a Store,
    collection: String,
    id: String,
}

impl<'a> std::future::IntoFuture for DeleteFuture<'a> {
    type Output = Result<Document, StoreError>;
    type IntoFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let existing = self.store.get(&self.collection, &self.id);
            let ts = self.store.clock.tick();
            if let Some(existing) = &existing {
                if existing.tomb && existing.ts > ts {
                    return Err(StoreError::TombstoneOverwrite(self.collection, self.id));
                }
            }
            let tomb = Document::tombstone(self.id.clone(), ts);
            self.store.apply_local(&self.collection, tomb).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), PeerId::generate()).unwrap();
        store.insert("demo", "x", BTreeMap::new()).await.unwrap();
        let doc = store.get("demo", "x").unwrap();
        assert_eq!(doc.id, "x");
        assert!(!doc.tomb);
    }

    #[tokio::test]
    async fn insert_then_delete_excludes_from_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), PeerId::generate()).unwrap();
        store.insert("demo", "x", BTreeMap::new()).await.unwrap();
        store.delete("demo", "x").await.unwrap();
        assert!(store.query("demo").is_empty());
        assert!(store.get("demo", "x").unwrap().tomb);
    }

    #[tokio::test]
    async fn observer_sees_insert_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), PeerId::generate()).unwrap();
        let (_id, mut rx) = store.observe("demo");
        store.insert("demo", "x", BTreeMap::new()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
    }

    #[tokio::test]
    async fn reopening_replays_persisted_writes() {
        let dir = tempfile::tempdir().unwrap();
        let peer = PeerId::generate();
        {
            let store = Store::open(dir.path(), peer).unwrap();
            store.insert("demo", "x", BTreeMap::new()).await.unwrap();
        }
        let store = Store::open(dir.path(), peer).unwrap();
        assert!(store.get("demo", "x").is_some());
    }

    #[tokio::test]
    async fn remote_document_with_higher_ts_wins() {
        let dir = tempfile::tempdir().unwrap();
        let local = PeerId::generate();
        let remote = PeerId::generate();
        let store = Store::open(dir.path(), local).unwrap();
        store.insert("demo", "x", BTreeMap::new()).await.unwrap();
        let incoming = Document::new("x", LogicalTimestamp { counter: 1_000_000, peer_id: remote }, BTreeMap::new());
        store.apply_remote("demo", incoming.clone(), remote, 0).await.unwrap();
        assert_eq!(store.get("demo", "x").unwrap().ts, incoming.ts);
    }

    #[tokio::test]
    async fn watermarks_survive_a_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let local = PeerId::generate();
        let peer = PeerId::generate();
        let ts = LogicalTimestamp { counter: 42, peer_id: local };
        {
            let store = Store::open(dir.path(), local).unwrap();
            store.advance_sent_watermark(peer, "demo", ts);
            store.flush_watermarks().unwrap();
        }
        assert!(dir.path().join("watermarks.json").exists());
        let store = Store::open(dir.path(), local).unwrap();
        assert_eq!(store.inner.read().watermarks.sent_watermark(peer, "demo"), Some(ts));
    }
}
