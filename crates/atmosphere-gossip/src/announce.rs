//! Local capability registration and the re-announce ticker (§4.4).

use atmosphere_store::Store;
use atmosphere_types::{Capability, CapabilityAnnouncement, FeatureFlags, ModelInfo, NodeCostFactors, ANNOUNCE_INTERVAL, CAP_TTL, MAX_HOPS};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// What a caller supplies when registering a capability; everything the
/// gossip layer needs to build and keep refreshing a `CapabilityAnnouncement`.
#[derive(Debug, Clone)]
pub struct CapabilitySpec {
    pub capability_id: String,
    pub capability: Capability,
    pub label: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub good_for: Vec<String>,
    pub specializations: Vec<String>,
    pub model: Option<ModelInfo>,
    pub features: FeatureFlags,
    pub project_path: Option<String>,
}

/// Owns the set of capabilities this node has registered and re-announces
/// them into `_capabilities` every `ANNOUNCE_INTERVAL` while registered.
pub struct LocalAnnouncer {
    store: Arc<Store>,
    registered: RwLock<HashMap<String, CapabilitySpec>>,
}

impl LocalAnnouncer {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, registered: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, spec: CapabilitySpec) {
        self.registered.write().insert(spec.capability_id.clone(), spec);
    }

    pub fn unregister(&self, capability_id: &str) {
        self.registered.write().remove(capability_id);
    }

    pub fn is_registered(&self, capability_id: &str) -> bool {
        self.registered.read().contains_key(capability_id)
    }

    /// Writes (or rewrites) every registered capability's announcement with a
    /// fresh `timestamp`/`expires_at`, `hops = 0`, `ttl = MAX_HOPS`.
    pub async fn announce_all(&self, cost_factors: Option<NodeCostFactors>) {
        let specs: Vec<CapabilitySpec> = self.registered.read().values().cloned().collect();
        let node_id = self.store.local_peer_id();
        let now = Utc::now();
        for spec in specs {
            let announcement = CapabilityAnnouncement {
                node_id,
                capability_id: spec.capability_id.clone(),
                capability: spec.capability,
                label: spec.label,
                description: spec.description,
                keywords: spec.keywords,
                good_for: spec.good_for,
                specializations: spec.specializations,
                model: spec.model,
                features: spec.features,
                hops: 0,
                ttl: MAX_HOPS,
                timestamp: now,
                expires_at: now + chrono::Duration::from_std(CAP_TTL).unwrap_or_default(),
                cost_factors,
                project_path: spec.project_path,
            };
            let Ok(value) = serde_json::to_value(&announcement) else { continue };
            let Some(fields) = value.as_object().cloned() else { continue };
            if let Err(err) = self.store.insert("_capabilities", spec.capability_id, fields.into_iter().collect()).await {
                tracing::warn!("failed to write capability announcement: {err}");
            }
        }
    }

    /// Runs `announce_all` immediately and then every `ANNOUNCE_INTERVAL`
    /// until cancelled.
    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        self.announce_all(None).await;
        let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
        interval.tick().await; // first tick fires immediately; already handled above
        loop {
            tokio::select! {
                _ = interval.tick() => self.announce_all(None).await,
                _ = cancel.cancelled() => break,
            }
        }
    }
}
