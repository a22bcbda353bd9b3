//! Shared data model for the Atmosphere mesh: the types that cross the wire
//! between peers and the types persisted in the CRDT store. Kept dependency-light
//! so every other crate in the workspace can depend on it without dragging in
//! transport or storage machinery.

pub mod capability;
pub mod constants;
pub mod cost;
pub mod document;
pub mod invite;
pub mod mesh;
pub mod peer;
pub mod request;
pub mod timestamp;

pub use capability::{Capability, CapabilityAnnouncement, FeatureFlags, ModelInfo};
pub use constants::*;
pub use cost::{NodeCostFactors, ThermalState};
pub use document::{ChangeKind, Document, ObserverEvent};
pub use invite::{InviteError, InviteToken};
pub use mesh::{MeshCredentials, MeshId};
pub use peer::{PeerEntry, PeerId, TransportKind};
pub use request::{RequestBody, RequestDoc, RequestStatus, ResponseDoc, ResponseStatus, ToolRequestDoc, ToolResponseDoc};
pub use timestamp::LogicalTimestamp;
