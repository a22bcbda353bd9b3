//! Node identity persistence and the mesh handshake proof.
//!
//! Deliberately narrow: Atmosphere peer ids are plain random identifiers, not
//! public keys, so unlike the system this crate is modeled on there is no
//! asymmetric keypair to manage. What remains is (a) reading/writing
//! `identity.json` and (b) the HMAC-SHA256 handshake that proves knowledge of
//! a mesh's shared secret without ever putting the secret on the wire.

pub mod handshake;
pub mod identity;
pub mod mesh_store;

pub use handshake::{verify_proof, HandshakeError, HandshakeProof};
pub use identity::{IdentityError, NodeIdentity};
pub use mesh_store::MeshStoreError;
