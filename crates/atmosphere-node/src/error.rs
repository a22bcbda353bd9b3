//! The top-level error aggregator (§7): one `thiserror` enum per subsystem
//! boundary feeds into `NodeError` through a `From` impl, so a caller
//! matching on `start()`/`stop()` failures sees a flat set of variants
//! without needing to know which crate produced them.

use atmosphere_crypto::{HandshakeError, IdentityError, MeshStoreError};
use atmosphere_router::DispatchError;
use atmosphere_store::StoreError;
use atmosphere_transport::TransportError;
use atmosphere_types::InviteError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node is not running")]
    NotRunning,
    #[error("node is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Invite(#[from] InviteError),
    #[error(transparent)]
    Mesh(#[from] MeshStoreError),
    #[error("mesh secret mismatch: {0}")]
    MeshMismatch(#[from] HandshakeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("no running transport is available to carry this operation")]
    TransportUnavailable,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl NodeError {
    /// Maps an error to the CLI exit code it should produce (§6).
    pub fn exit_code(&self) -> i32 {
        match self {
            NodeError::Store(StoreError::FatalStorage(_)) => 2,
            NodeError::MeshMismatch(_) => 3,
            NodeError::Mesh(MeshStoreError::Invite(_)) => 3,
            NodeError::Transport(_) | NodeError::TransportUnavailable => 4,
            _ => 1,
        }
    }
}
