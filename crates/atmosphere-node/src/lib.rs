//! Wires every mesh crate into one running node and exposes the surface an
//! embedding application or the CLI binary talks to.

pub mod api;
pub mod config;
pub mod error;
pub mod supervisor;

pub use api::Node;
pub use config::{ConfigError, NodeConfig};
pub use error::NodeError;
pub use supervisor::{HealthView, NodeState};

pub use atmosphere_gossip::CapabilitySpec;
pub use atmosphere_router::{Constraints, MatchMethod, RequiredFeature, RouteDecision, ScoreBreakdown};
pub use atmosphere_types::{InviteToken, MeshId, PeerId};
