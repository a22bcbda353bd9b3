//! Gossip layer (§4.4, §4.5): turns `_capabilities`/`_cost` documents flowing
//! through the CRDT store into an in-memory gradient table, and generates the
//! local announcements and cost snapshots that feed it.

pub mod announce;
pub mod cost;
pub mod engine;
pub mod gradient;

pub use announce::{CapabilitySpec, LocalAnnouncer};
pub use cost::{CostCollector, CostSource};
pub use engine::GossipEngine;
pub use gradient::{GradientEntry, GradientTable, IngestOutcome};
