use atmosphere_types::{MeshId, MAX_FRAME};
use lru::LruCache;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;

/// The envelope every frame travels in, regardless of which transport carried
/// it. `nonce` lets the supervisor de-duplicate a frame that arrives twice
/// over two transports; `ttl`/`hops` implement the flood-limit in §4.1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub nonce: [u8; 16],
    pub ttl: u8,
    pub hops: u8,
    pub mesh_id: MeshId,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds MAX_FRAME ({0} > {MAX_FRAME})")]
    TooLarge(usize),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] serde_cbor::Error),
}

impl Frame {
    pub fn new(mesh_id: MeshId, ttl: u8, payload: Vec<u8>) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            nonce,
            ttl,
            hops: 0,
            mesh_id,
            payload,
        }
    }

    /// Produces the frame this node would rebroadcast: hops incremented, ttl
    /// decremented. Callers must drop the result once `ttl` reaches zero.
    pub fn for_rebroadcast(&self) -> Self {
        Self {
            nonce: self.nonce,
            ttl: self.ttl.saturating_sub(1),
            hops: self.hops.saturating_add(1),
            mesh_id: self.mesh_id,
            payload: self.payload.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let bytes = serde_cbor::to_vec(self)?;
        if bytes.len() > MAX_FRAME {
            return Err(FrameError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() > MAX_FRAME {
            return Err(FrameError::TooLarge(bytes.len()));
        }
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

/// Bounded de-duplication cache for frame nonces, shared by the supervisor
/// across every transport so a frame relayed through two paths is only
/// processed once.
pub struct SeenNonces {
    cache: LruCache<[u8; 16], ()>,
}

impl SeenNonces {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }

    /// Returns `true` the first time a nonce is seen, `false` on every
    /// subsequent sighting (a duplicate to be dropped).
    pub fn insert_is_new(&mut self, nonce: [u8; 16]) -> bool {
        if self.cache.contains(&nonce) {
            false
        } else {
            self.cache.put(nonce, ());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let frame = Frame::new(MeshId::generate(), 10, vec![1, 2, 3]);
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = Frame::new(MeshId::generate(), 10, vec![0u8; MAX_FRAME + 1]);
        assert!(matches!(frame.encode(), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn rebroadcast_decrements_ttl_and_increments_hops() {
        let frame = Frame::new(MeshId::generate(), 5, vec![]);
        let next = frame.for_rebroadcast();
        assert_eq!(next.ttl, 4);
        assert_eq!(next.hops, 1);
        assert_eq!(next.nonce, frame.nonce);
    }

    #[test]
    fn seen_nonces_deduplicates_and_evicts() {
        let mut seen = SeenNonces::with_capacity(2);
        let a = [1u8; 16];
        let b = [2u8; 16];
        let c = [3u8; 16];
        assert!(seen.insert_is_new(a));
        assert!(!seen.insert_is_new(a));
        assert!(seen.insert_is_new(b));
        assert!(seen.insert_is_new(c)); // evicts `a`
        assert!(seen.insert_is_new(a));
    }
}
