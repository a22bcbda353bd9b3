use crate::cost::NodeCostFactors;
use crate::peer::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a capability actually serves. Modeled as a tagged variant per the
/// spec's design notes rather than a single "is this a tool" boolean, so the
/// router stays polymorphic over the capability set without needing every
/// capability to carry every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Capability {
    LlmChat,
    Tool { name: String },
    Sensor { name: String },
    Vision,
    Custom { name: String },
}

/// Identifying details for an `LlmChat` capability. Absent on non-model
/// capabilities (tools, sensors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub family: String,
    pub tier: String,
    pub params_b: f64,
    pub quantization: String,
}

/// Optional feature flags. The spec's open question about two differing
/// `MeshCapabilityHandler`/`AtmosphereBinderService` variants is resolved here:
/// vision and tools are optional capabilities a capability either has or
/// doesn't, never a required part of every announcement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub has_rag: bool,
    #[serde(default)]
    pub has_tools: bool,
    #[serde(default)]
    pub has_vision: bool,
    #[serde(default)]
    pub has_streaming: bool,
}

/// A capability advertisement, as stored in `_capabilities`. `node_id` is the
/// capability's owner; `hops`/`via_node` describe how the *local* peer learned
/// about it and are rewritten on every rebroadcast, never by the owner's own
/// refresh (invariant 3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityAnnouncement {
    pub node_id: PeerId,
    pub capability_id: String,
    pub capability: Capability,
    pub label: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub good_for: Vec<String>,
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(default)]
    pub model: Option<ModelInfo>,
    #[serde(default)]
    pub features: FeatureFlags,
    pub hops: u32,
    pub ttl: u32,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub cost_factors: Option<NodeCostFactors>,
    #[serde(default)]
    pub project_path: Option<String>,
}

impl CapabilityAnnouncement {
    /// Invariant 4: an announcement with `ttl <= 0`, `hops >= MAX_HOPS`, or an
    /// already-passed `expires_at` is dropped rather than stored.
    pub fn is_admissible(&self, now: DateTime<Utc>) -> bool {
        self.ttl > 0 && self.hops < crate::constants::MAX_HOPS && self.expires_at > now
    }

    pub fn owned_by(&self, peer: PeerId) -> bool {
        self.node_id == peer
    }
}
