//! The in-memory gradient table (§4.4): `capability_id -> GradientEntry`,
//! rebuilt incrementally from `_capabilities` documents as they're observed.
//! Guarded by its own lock, never the store's -- updating the table must
//! never block a store read or write (§5).

use atmosphere_types::{CapabilityAnnouncement, PeerId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct GradientEntry {
    pub announcement: CapabilityAnnouncement,
    pub hops: u32,
    pub via_peer: PeerId,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Dropped,
    Inserted,
    Replaced,
    Ignored,
}

#[derive(Default)]
pub struct GradientTable {
    entries: RwLock<HashMap<String, GradientEntry>>,
}

impl GradientTable {
    /// The six-step ingestion rule. `sender` is whoever this node received
    /// the announcement from most recently (itself, for a hop-0 local
    /// registration).
    pub fn ingest(&self, announcement: CapabilityAnnouncement, sender: PeerId, now: DateTime<Utc>) -> IngestOutcome {
        if !announcement.is_admissible(now) {
            return IngestOutcome::Dropped;
        }
        let candidate_hops = announcement.hops + 1;
        let mut entries = self.entries.write();
        match entries.get(&announcement.capability_id) {
            None => {
                entries.insert(
                    announcement.capability_id.clone(),
                    GradientEntry { announcement, hops: candidate_hops, via_peer: sender, last_update: now },
                );
                IngestOutcome::Inserted
            }
            Some(existing) => {
                if candidate_hops < existing.hops {
                    entries.insert(
                        announcement.capability_id.clone(),
                        GradientEntry { announcement, hops: candidate_hops, via_peer: sender, last_update: now },
                    );
                    IngestOutcome::Replaced
                } else if announcement.timestamp > existing.announcement.timestamp {
                    entries.insert(
                        announcement.capability_id.clone(),
                        GradientEntry { announcement, hops: candidate_hops, via_peer: sender, last_update: now },
                    );
                    IngestOutcome::Replaced
                } else {
                    IngestOutcome::Ignored
                }
            }
        }
    }

    pub fn get(&self, capability_id: &str) -> Option<GradientEntry> {
        self.entries.read().get(capability_id).cloned()
    }

    pub fn entries(&self) -> Vec<GradientEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Every 30s per §4.4: drop entries whose `expires_at <= now`, except
    /// ones this node owns (those are refreshed by the announce ticker, not
    /// expired out from under it).
    pub fn expiry_sweep(&self, local_peer: PeerId, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.entries.write();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.announcement.expires_at <= now && !e.announcement.owned_by(local_peer))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_types::{Capability, FeatureFlags};

    fn announcement(capability_id: &str, node_id: PeerId, hops: u32, timestamp: DateTime<Utc>) -> CapabilityAnnouncement {
        CapabilityAnnouncement {
            node_id,
            capability_id: capability_id.into(),
            capability: Capability::LlmChat,
            label: "chat".into(),
            description: "".into(),
            keywords: vec![],
            good_for: vec![],
            specializations: vec![],
            model: None,
            features: FeatureFlags::default(),
            hops,
            ttl: 10,
            timestamp,
            expires_at: timestamp + chrono::Duration::seconds(300),
            cost_factors: None,
            project_path: None,
        }
    }

    #[test]
    fn first_sighting_inserts_with_hop_plus_one() {
        let table = GradientTable::default();
        let owner = PeerId::generate();
        let sender = PeerId::generate();
        let now = Utc::now();
        let outcome = table.ingest(announcement("llm.chat@a", owner, 0, now), sender, now);
        assert_eq!(outcome, IngestOutcome::Inserted);
        assert_eq!(table.get("llm.chat@a").unwrap().hops, 1);
    }

    #[test]
    fn shorter_route_replaces() {
        let table = GradientTable::default();
        let owner = PeerId::generate();
        let now = Utc::now();
        table.ingest(announcement("llm.chat@a", owner, 3, now), PeerId::generate(), now);
        let outcome = table.ingest(announcement("llm.chat@a", owner, 0, now), PeerId::generate(), now);
        assert_eq!(outcome, IngestOutcome::Replaced);
        assert_eq!(table.get("llm.chat@a").unwrap().hops, 1);
    }

    #[test]
    fn stale_same_length_update_is_ignored() {
        let table = GradientTable::default();
        let owner = PeerId::generate();
        let now = Utc::now();
        table.ingest(announcement("llm.chat@a", owner, 1, now), PeerId::generate(), now);
        let older = now - chrono::Duration::seconds(5);
        let outcome = table.ingest(announcement("llm.chat@a", owner, 1, older), PeerId::generate(), now);
        assert_eq!(outcome, IngestOutcome::Ignored);
    }

    #[test]
    fn max_hops_is_dropped() {
        let table = GradientTable::default();
        let now = Utc::now();
        let outcome = table.ingest(announcement("llm.chat@a", PeerId::generate(), atmosphere_types::MAX_HOPS, now), PeerId::generate(), now);
        assert_eq!(outcome, IngestOutcome::Dropped);
    }

    #[test]
    fn expiry_sweep_spares_local_ownership() {
        let table = GradientTable::default();
        let local = PeerId::generate();
        let past = Utc::now() - chrono::Duration::seconds(600);
        table.ingest(announcement("mine", local, 0, past), local, past);
        assert_eq!(table.len(), 1);
        let removed = table.expiry_sweep(local, Utc::now());
        assert!(removed.is_empty());
        assert_eq!(table.len(), 1);
    }
}
