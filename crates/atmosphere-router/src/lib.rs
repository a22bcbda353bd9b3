//! Semantic router (§4.6) and request/response dispatch (§4.7): turns a
//! natural-language query plus constraints into a routing decision over the
//! gossip layer's gradient table, then carries a request through the CRDT
//! store to a responder and back.

pub mod dispatch;
pub mod scoring;

pub use dispatch::{DispatchError, Dispatcher, Responder};
pub use scoring::{Constraints, MatchMethod, RequiredFeature, RouteDecision, ScoreBreakdown, ScoredCapability};
