//! Pluggable byte-stream transports.
//!
//! A transport is a named, start/stop capability that emits inbound frames
//! tagged with the sending peer and accepts `send`/`broadcast` commands. Three
//! are recognized: LAN TCP with mDNS discovery, an optional wide-area relay,
//! and a BLE stub. All three speak the same [`TransportEvent`]/[`TransportCommand`]
//! protocol upward so the supervisor never needs to know which one it's
//! talking to.

pub mod ble;
pub mod frame;
pub mod lan;
pub mod relay;

use atmosphere_types::{MeshId, PeerId, TransportKind};
use std::time::Duration;
use tokio::sync::mpsc;

pub use frame::{Frame, FrameError, SeenNonces};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {peer} timed out after {timeout:?}")]
    ConnectTimeout { peer: PeerId, timeout: Duration },
    #[error("transport {0} is not running")]
    Unavailable(&'static str),
    #[error("peer {0} is not connected")]
    PeerGone(PeerId),
    #[error("mesh secret mismatch with peer {0}")]
    AuthRejected(PeerId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Emitted by a transport as connections come and go and frames arrive.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PeerUp { peer_id: PeerId, kind: TransportKind },
    PeerDown { peer_id: PeerId, kind: TransportKind },
    Inbound { peer_id: PeerId, kind: TransportKind, frame: Frame },
    /// A handshake was attempted and rejected; surfaced for logging/health,
    /// never fatal to the node (§4.8).
    AuthRejected { peer_id: Option<PeerId> },
}

/// Commands the supervisor issues to a running transport.
#[derive(Debug, Clone)]
pub enum TransportCommand {
    Send { peer_id: PeerId, frame: Frame },
    Broadcast { frame: Frame },
    Stop,
}

/// A transport's handle as seen by the supervisor: where to send commands and
/// where events arrive from. Constructed by each transport's `spawn`.
pub struct TransportHandle {
    pub name: &'static str,
    pub kind: TransportKind,
    pub commands: mpsc::Sender<TransportCommand>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Shared identity context every transport needs to run the handshake and tag
/// its frames correctly.
#[derive(Debug, Clone)]
pub struct TransportContext {
    pub local_peer_id: PeerId,
    pub mesh_id: MeshId,
    pub shared_secret: [u8; 32],
}
