use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroize;

/// Identifies a mesh (a named group of peers sharing a secret). All peers of a
/// mesh replicate the same store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeshId(pub Uuid);

impl MeshId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MeshId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted, process-wide mesh membership: `mesh.json`. Created by "create
/// mesh", imported via an invite token, and rotated wholesale by "leave mesh".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshCredentials {
    pub mesh_id: MeshId,
    #[serde(with = "secret_hex")]
    pub shared_secret: [u8; 32],
    pub expires_at: Option<DateTime<Utc>>,
}

impl MeshCredentials {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            mesh_id: MeshId::generate(),
            shared_secret: secret,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

impl Drop for MeshCredentials {
    fn drop(&mut self) {
        // The shared secret grants full mesh membership; don't leave a copy
        // of it sitting in freed heap memory longer than necessary.
        self.shared_secret.zeroize();
    }
}

mod secret_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(secret))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(text).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("shared secret must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_preserves_secret() {
        let creds = MeshCredentials::generate();
        let json = serde_json::to_string(&creds).unwrap();
        let back: MeshCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(creds.mesh_id, back.mesh_id);
        assert_eq!(creds.shared_secret, back.shared_secret);
    }

    #[test]
    fn not_expired_without_an_expiry() {
        let creds = MeshCredentials::generate();
        assert!(!creds.is_expired(Utc::now()));
    }
}
