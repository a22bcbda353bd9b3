//! The anti-entropy wire protocol (§4.2): `Hello` on connect, `Sync` batches
//! in reply, `Patch` for every local write as it happens, `Bye` on graceful
//! disconnect. These are the payloads carried inside a transport [`Frame`]'s
//! opaque bytes -- this module only knows how to serialize/chunk them.

use atmosphere_types::{Document, LogicalTimestamp, MAX_FRAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a peer advertises about itself on connect: the highest `_ts` it has
/// already seen from the *other* side, per collection, so the other side
/// doesn't have to resend everything every round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloSummary {
    pub known: BTreeMap<String, LogicalTimestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    Hello(HelloSummary),
    Sync { collection: String, since_ts: Option<LogicalTimestamp>, documents: Vec<Document> },
    Patch { collection: String, document: Document },
    Bye,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to encode sync message: {0}")]
    Encode(#[from] serde_cbor::Error),
}

impl SyncMessage {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

/// Splits a `Sync` batch so no single encoded `SyncMessage` exceeds
/// `MAX_FRAME`, per §4.2 and §5's resource limits. Greedy: documents are
/// added to the current chunk until the next one would overflow, then a new
/// chunk starts. A single document that alone exceeds `MAX_FRAME` is placed
/// in its own chunk and will fail to encode downstream -- this can only
/// happen if `MAX_DOCUMENT_BYTES` was misconfigured above `MAX_FRAME`.
pub fn chunk_sync_batch(collection: &str, since_ts: Option<LogicalTimestamp>, documents: Vec<Document>) -> Vec<SyncMessage> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0usize;

    for doc in documents {
        let doc_size = serde_json::to_vec(&doc).map(|v| v.len()).unwrap_or(0);
        if !current.is_empty() && current_size + doc_size > MAX_FRAME {
            chunks.push(SyncMessage::Sync {
                collection: collection.to_string(),
                since_ts,
                documents: std::mem::take(&mut current),
            });
            current_size = 0;
        }
        current_size += doc_size;
        current.push(doc);
    }
    if !current.is_empty() {
        chunks.push(SyncMessage::Sync { collection: collection.to_string(), since_ts, documents: current });
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_types::PeerId;
    use std::collections::BTreeMap as Map;

    #[test]
    fn encode_decode_roundtrip() {
        let msg = SyncMessage::Hello(HelloSummary { known: BTreeMap::new() });
        let bytes = msg.encode().unwrap();
        assert_eq!(SyncMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn large_batch_is_chunked() {
        let peer = PeerId::generate();
        let mut fields = Map::new();
        fields.insert("blob".to_string(), serde_json::Value::String("x".repeat(40_000)));
        let docs: Vec<Document> = (0..5)
            .map(|i| Document::new(format!("doc-{i}"), LogicalTimestamp { counter: i, peer_id: peer }, fields.clone()))
            .collect();
        let chunks = chunk_sync_batch("demo", None, docs);
        assert!(chunks.len() > 1, "expected more than one chunk, got {}", chunks.len());
        for chunk in &chunks {
            let bytes = chunk.encode().unwrap();
            assert!(bytes.len() <= MAX_FRAME + 4096, "chunk serialized to {} bytes", bytes.len());
        }
    }

    #[test]
    fn small_batch_is_one_chunk() {
        let peer = PeerId::generate();
        let docs = vec![Document::new("a", LogicalTimestamp { counter: 1, peer_id: peer }, Map::new())];
        assert_eq!(chunk_sync_batch("demo", None, docs).len(), 1);
    }
}
