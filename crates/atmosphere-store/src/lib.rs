//! The CRDT-replicated mesh store (§4.2): per-collection, last-writer-wins
//! documents, anti-entropy sync messages, append-only persistence, and the
//! tombstone GC sweep. Everything above this crate -- gossip, routing,
//! dispatch -- is built as reads, writes, and observers against [`Store`].

pub mod clock;
pub mod collection;
pub mod gc;
pub mod observer;
pub mod persistence;
pub mod store;
pub mod sync;
pub mod watermark;

pub use observer::{ObserverId, ObserverReceiver};
pub use store::{Store, StoreError};
pub use sync::{HelloSummary, SyncError, SyncMessage};
