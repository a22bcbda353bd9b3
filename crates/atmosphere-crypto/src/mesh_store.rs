//! Persistence for `{data_dir}/mesh.json` (§6): the mesh a node currently
//! belongs to. Created fresh by "create mesh", overwritten wholesale by
//! "join mesh" (applying an invite), same on-disk shape either way since
//! `MeshCredentials` already round-trips through serde.

use atmosphere_types::{InviteError, InviteToken, MeshCredentials};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum MeshStoreError {
    #[error("failed to read mesh file at {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write mesh file at {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("mesh file at {path} is corrupt: {source}")]
    Corrupt { path: PathBuf, source: serde_json::Error },
    #[error(transparent)]
    Invite(#[from] InviteError),
}

fn mesh_path(data_dir: &Path) -> PathBuf {
    data_dir.join("mesh.json")
}

/// Loads `mesh.json`, creating and persisting a fresh single-peer mesh if it
/// does not exist yet -- the "create mesh" path.
pub fn load_or_create(data_dir: &Path) -> Result<MeshCredentials, MeshStoreError> {
    let path = mesh_path(data_dir);
    match fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).map_err(|source| MeshStoreError::Corrupt { path, source }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let credentials = MeshCredentials::generate();
            persist(data_dir, &credentials)?;
            Ok(credentials)
        }
        Err(source) => Err(MeshStoreError::Read { path, source }),
    }
}

/// Applies an invite token: validates it isn't expired, then overwrites
/// `mesh.json` wholesale with the mesh it names -- the "join mesh" path.
pub fn join_from_invite(data_dir: &Path, token: &InviteToken, now: chrono::DateTime<chrono::Utc>) -> Result<MeshCredentials, MeshStoreError> {
    token.check_not_expired(now)?;
    let credentials = MeshCredentials {
        mesh_id: token.mesh_id,
        shared_secret: token.shared_secret()?,
        expires_at: token.expires,
    };
    persist(data_dir, &credentials)?;
    Ok(credentials)
}

fn persist(data_dir: &Path, credentials: &MeshCredentials) -> Result<(), MeshStoreError> {
    let path = mesh_path(data_dir);
    let json = serde_json::to_string_pretty(credentials).expect("MeshCredentials always serializes");
    fs::write(&path, json).map_err(|source| MeshStoreError::Write { path, source })
}
