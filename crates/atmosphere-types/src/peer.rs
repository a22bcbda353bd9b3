use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// A device-stable peer identity: the first 16 bytes of a UUID generated once
/// and persisted forever in `identity.json`. Opaque outside this crate except
/// for its hex encoding, which is what travels on the wire and shows up in logs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        Self(*uuid.as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("invalid peer id: expected 32 lowercase hex digits")]
pub struct ParsePeerIdError;

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| ParsePeerIdError)?;
        let array: [u8; 16] = bytes.try_into().map_err(|_| ParsePeerIdError)?;
        Ok(Self(array))
    }
}

/// Which transport last carried traffic from a peer. Used both in `PeerEntry`
/// and by the router when it falls back to a per-transport latency estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[display(fmt = "lan-tcp")]
    LanTcp,
    #[display(fmt = "relay")]
    Relay,
    #[display(fmt = "ble")]
    Ble,
}

/// A live peer known to the supervisor, created on first message and expired
/// after `TTL_PEER` of idleness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub transport: TransportKind,
    pub last_seen: DateTime<Utc>,
    pub rtt_hint: Option<f64>,
}

#[cfg(test)]
impl quickcheck::Arbitrary for PeerId {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        Self(std::array::from_fn(|_| u8::arbitrary(g)))
    }
}
