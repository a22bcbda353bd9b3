use atmosphere_types::PeerId;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// The stable per-device identity persisted at `{data_dir}/identity.json`.
/// Generated once on first start and never regenerated thereafter -- losing
/// this file means losing the device's identity in every mesh it has joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentity {
    peer_id: PeerId,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeIdentityIo {
    /// Tagged so the on-disk format can evolve if a future version adds a
    /// signing keypair without breaking peers still on plain ids.
    kind: IdentityKind,
    peer_id: PeerId,
}

#[derive(Debug, Serialize, Deserialize)]
enum IdentityKind {
    PlainPeerId,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read identity file at {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write identity file at {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("identity file at {path} is corrupt: {source}")]
    Corrupt { path: PathBuf, source: serde_json::Error },
}

impl NodeIdentity {
    pub fn generate() -> Self {
        Self {
            peer_id: PeerId::generate(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Loads `{data_dir}/identity.json`, creating and persisting a fresh
    /// identity if the file does not exist yet. This is the "load/create
    /// identity" step of the node's start-up order (§6).
    pub fn load_or_create(data_dir: &Path) -> Result<Self, IdentityError> {
        let path = data_dir.join("identity.json");
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let io: NodeIdentityIo = serde_json::from_str(&contents).map_err(|source| IdentityError::Corrupt {
                    path: path.clone(),
                    source,
                })?;
                Ok(Self { peer_id: io.peer_id })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.persist(&path)?;
                Ok(identity)
            }
            Err(source) => Err(IdentityError::Read { path, source }),
        }
    }

    fn persist(&self, path: &Path) -> Result<(), IdentityError> {
        let io = NodeIdentityIo {
            kind: IdentityKind::PlainPeerId,
            peer_id: self.peer_id,
        };
        let json = serde_json::to_string_pretty(&io).expect("NodeIdentityIo always serializes");
        fs::write(path, json).map_err(|source| IdentityError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_load_creates_and_persists() {
        let dir = TempDir::new().unwrap();
        let identity = NodeIdentity::load_or_create(dir.path()).unwrap();
        assert!(dir.path().join("identity.json").exists());

        let reloaded = NodeIdentity::load_or_create(dir.path()).unwrap();
        assert_eq!(identity.peer_id(), reloaded.peer_id());
    }

    #[test]
    fn corrupt_file_is_reported_not_panicked() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("identity.json"), "not json").unwrap();
        assert!(matches!(
            NodeIdentity::load_or_create(dir.path()),
            Err(IdentityError::Corrupt { .. })
        ));
    }
}
