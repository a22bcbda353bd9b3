//! Wires the store's `_capabilities` change feed into the gradient table
//! (§4.4) and runs its periodic expiry sweep.

use crate::gradient::GradientTable;
use atmosphere_store::Store;
use atmosphere_types::{CapabilityAnnouncement, ChangeKind, EXPIRY_SWEEP_INTERVAL};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct GossipEngine {
    store: Arc<Store>,
    pub table: Arc<GradientTable>,
}

impl GossipEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, table: Arc::new(GradientTable::default()) }
    }

    /// Consumes `_capabilities` change events and the expiry sweep ticker
    /// until cancelled. Intended to run as one long-lived supervisor task.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let (_observer_id, mut changes) = self.store.observe("_capabilities");
        let mut sweep_interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        let local_peer = self.store.local_peer_id();

        loop {
            tokio::select! {
                Some(event) = changes.recv() => self.handle_change(event),
                _ = sweep_interval.tick() => {
                    let removed = self.table.expiry_sweep(local_peer, Utc::now());
                    if !removed.is_empty() {
                        tracing::debug!(count = removed.len(), "gradient table expiry sweep removed entries");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    fn handle_change(&self, event: atmosphere_types::ObserverEvent) {
        if event.kind == ChangeKind::Delete {
            return;
        }
        let Some(doc) = self.store.get("_capabilities", &event.id) else { return };
        if doc.tomb {
            return;
        }
        let Ok(announcement) = serde_json::from_value::<CapabilityAnnouncement>(document_to_value(&doc)) else {
            tracing::debug!(id = %event.id, "dropping malformed capability announcement");
            return;
        };
        // `origin` is the directly-connected peer the frame carrying this
        // write arrived from; `None` for a local write, in which case the
        // announcement is its own owner.
        let sender = event.origin.map(|(peer, _)| peer).unwrap_or(announcement.node_id);
        self.table.ingest(announcement, sender, Utc::now());
    }
}

fn document_to_value(doc: &atmosphere_types::Document) -> serde_json::Value {
    serde_json::to_value(&doc.fields).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_types::PeerId;

    #[tokio::test]
    async fn local_capability_insert_is_ingested() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), PeerId::generate()).unwrap();
        let engine = Arc::new(GossipEngine::new(store.clone()));
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let table = engine.table.clone();
        let handle = tokio::spawn(engine.clone().run(task_cancel));

        let announcer = crate::announce::LocalAnnouncer::new(store.clone());
        announcer.register(crate::announce::CapabilitySpec {
            capability_id: "llm.chat@x".into(),
            capability: atmosphere_types::Capability::LlmChat,
            label: "x".into(),
            description: "".into(),
            keywords: vec![],
            good_for: vec![],
            specializations: vec![],
            model: None,
            features: atmosphere_types::FeatureFlags::default(),
            project_path: None,
        });
        announcer.announce_all(None).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = handle.await;
        assert!(table.get("llm.chat@x").is_some());
    }
}
