//! The semantic router's scoring algorithm (§4.6).

use atmosphere_gossip::GradientEntry;
use atmosphere_types::{
    NodeCostFactors, PeerId, TransportKind, BLE_DEFAULT_LATENCY_MS, LAN_DEFAULT_LATENCY_MS, LATENCY_CEILING_MS, MAX_HOPS, RELAY_DEFAULT_LATENCY_MS,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredFeature {
    Rag,
    Tools,
    Vision,
    Streaming,
}

#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub max_latency_ms: Option<f64>,
    pub prefer_local: bool,
    pub required_features: Vec<RequiredFeature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchMethod {
    ExactCapability,
    Keyword,
    /// Reserved for a future embedding-based matcher; this scorer never
    /// produces it, only `Keyword`/`ExactCapability`/`Fallback`.
    Semantic,
    Fallback,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub s_sem: f64,
    pub s_lat: f64,
    pub s_hop: f64,
    pub s_cost: f64,
    pub total: f64,
}

#[derive(Debug, Clone)]
pub struct ScoredCapability {
    pub capability_id: String,
    pub peer_id: PeerId,
    pub score: ScoreBreakdown,
    pub match_method: MatchMethod,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub capability_id: String,
    pub peer_id: PeerId,
    pub score: ScoreBreakdown,
    pub match_method: MatchMethod,
    pub explanation: String,
    pub alternatives: Vec<(String, f64)>,
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

fn semantic_score(query: &str, entry: &GradientEntry) -> (f64, MatchMethod) {
    let announcement = &entry.announcement;
    let query_norm = query.trim().to_lowercase();
    let is_exact = query_norm == announcement.capability_id.to_lowercase()
        || announcement.project_path.as_deref().map(|p| p.to_lowercase()) == Some(query_norm.clone());
    if is_exact {
        return (1.0, MatchMethod::ExactCapability);
    }

    let query_words: HashSet<String> = query_norm.split_whitespace().map(String::from).collect();
    let capability_words: HashSet<String> = announcement
        .keywords
        .iter()
        .chain(announcement.good_for.iter())
        .chain(announcement.specializations.iter())
        .map(|s| s.to_lowercase())
        .collect();

    if query_words.is_empty() || capability_words.is_empty() {
        return (0.1, MatchMethod::Fallback);
    }
    let overlap = query_words.intersection(&capability_words).count();
    if overlap == 0 {
        return (0.1, MatchMethod::Fallback);
    }
    let union = query_words.union(&capability_words).count().max(1);
    let score = clamp01((overlap as f64 + 1.0) / union as f64);
    (score, MatchMethod::Keyword)
}

fn default_latency_for(transport: Option<TransportKind>) -> f64 {
    match transport {
        Some(TransportKind::LanTcp) | None => LAN_DEFAULT_LATENCY_MS,
        Some(TransportKind::Relay) => RELAY_DEFAULT_LATENCY_MS,
        Some(TransportKind::Ble) => BLE_DEFAULT_LATENCY_MS,
    }
}

fn estimated_latency_ms(entry: &GradientEntry, cost_by_peer: &HashMap<PeerId, NodeCostFactors>, peer_transports: &HashMap<PeerId, TransportKind>) -> f64 {
    let from_cost = cost_by_peer.get(&entry.announcement.node_id).and_then(|c| c.latency_ms);
    let from_announcement = entry.announcement.cost_factors.as_ref().and_then(|c| c.latency_ms);
    from_cost
        .or(from_announcement)
        .unwrap_or_else(|| default_latency_for(peer_transports.get(&entry.announcement.node_id).copied()))
}

fn overall_cost_for(entry: &GradientEntry, cost_by_peer: &HashMap<PeerId, NodeCostFactors>) -> f64 {
    cost_by_peer
        .get(&entry.announcement.node_id)
        .or(entry.announcement.cost_factors.as_ref())
        .map(|c| c.overall_cost())
        .unwrap_or(0.5)
}

fn has_required_features(entry: &GradientEntry, required: &[RequiredFeature]) -> bool {
    required.iter().all(|feature| match feature {
        RequiredFeature::Rag => entry.announcement.features.has_rag,
        RequiredFeature::Tools => entry.announcement.features.has_tools,
        RequiredFeature::Vision => entry.announcement.features.has_vision,
        RequiredFeature::Streaming => entry.announcement.features.has_streaming,
    })
}

fn score_one(query: &str, constraints: &Constraints, entry: &GradientEntry, cost_by_peer: &HashMap<PeerId, NodeCostFactors>, peer_transports: &HashMap<PeerId, TransportKind>) -> ScoredCapability {
    let (s_sem, match_method) = semantic_score(query, entry);
    let latency = estimated_latency_ms(entry, cost_by_peer, peer_transports);
    let s_lat = clamp01(1.0 - latency / LATENCY_CEILING_MS);
    let s_hop = 1.0 - (entry.hops.min(MAX_HOPS) as f64 / MAX_HOPS as f64);
    let s_cost = clamp01(1.0 - overall_cost_for(entry, cost_by_peer));

    let mut total = 0.50 * s_sem + 0.20 * s_lat + 0.15 * s_hop + 0.15 * s_cost;
    if constraints.prefer_local && entry.hops == 0 {
        total += 0.10;
    }

    ScoredCapability {
        capability_id: entry.announcement.capability_id.clone(),
        peer_id: entry.announcement.node_id,
        score: ScoreBreakdown { s_sem, s_lat, s_hop, s_cost, total: clamp01(total) },
        match_method,
    }
}

/// The full eight-step algorithm. Returns `None` if every entry fails the
/// hard filter in step 1.
pub fn route(
    query: &str,
    constraints: &Constraints,
    entries: &[GradientEntry],
    cost_by_peer: &HashMap<PeerId, NodeCostFactors>,
    peer_transports: &HashMap<PeerId, TransportKind>,
    now: DateTime<Utc>,
) -> Option<RouteDecision> {
    let mut scored: Vec<ScoredCapability> = entries
        .iter()
        .filter(|e| e.announcement.is_admissible(now))
        .filter(|e| has_required_features(e, &constraints.required_features))
        .filter(|e| {
            constraints
                .max_latency_ms
                .map(|ceiling| estimated_latency_ms(e, cost_by_peer, peer_transports) <= ceiling)
                .unwrap_or(true)
        })
        .map(|e| score_one(query, constraints, e, cost_by_peer, peer_transports))
        .collect();

    if scored.is_empty() {
        return None;
    }

    let hops_of = |capability_id: &str, peer_id: PeerId| -> u32 {
        entries
            .iter()
            .find(|e| e.announcement.capability_id == capability_id && e.announcement.node_id == peer_id)
            .map(|e| e.hops)
            .unwrap_or(MAX_HOPS)
    };

    scored.sort_by(|a, b| {
        b.score
            .total
            .partial_cmp(&a.score.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.score.s_sem.partial_cmp(&a.score.s_sem).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| hops_of(&a.capability_id, a.peer_id).cmp(&hops_of(&b.capability_id, b.peer_id)))
            .then_with(|| (a.peer_id, a.capability_id.clone()).cmp(&(b.peer_id, b.capability_id.clone())))
    });

    let winner = scored[0].clone();
    let alternatives = scored.iter().skip(1).take(3).map(|s| (s.capability_id.clone(), s.score.total)).collect();

    Some(RouteDecision {
        capability_id: winner.capability_id,
        peer_id: winner.peer_id,
        score: winner.score,
        match_method: winner.match_method,
        explanation: explain(&winner.match_method, winner.score),
        alternatives,
    })
}

fn explain(method: &MatchMethod, score: ScoreBreakdown) -> String {
    match method {
        MatchMethod::ExactCapability => format!("exact capability match (score {:.2})", score.total),
        MatchMethod::Keyword => format!("keyword overlap match (sem {:.2}, total {:.2})", score.s_sem, score.total),
        MatchMethod::Semantic => format!("semantic match (sem {:.2}, total {:.2})", score.s_sem, score.total),
        MatchMethod::Fallback => format!("no strong match, falling back to best available (total {:.2})", score.total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_types::{Capability, CapabilityAnnouncement, FeatureFlags};

    fn entry(node_id: PeerId, hops: u32, battery_percent: f64, plugged_in: bool, on_battery: bool) -> GradientEntry {
        let now = Utc::now();
        GradientEntry {
            announcement: CapabilityAnnouncement {
                node_id,
                capability_id: format!("llm.chat@{node_id}"),
                capability: Capability::LlmChat,
                label: "chat".into(),
                description: "a chat model".into(),
                keywords: vec!["chat".into(), "hello".into()],
                good_for: vec![],
                specializations: vec![],
                model: None,
                features: FeatureFlags::default(),
                hops,
                ttl: 10,
                timestamp: now,
                expires_at: now + chrono::Duration::seconds(300),
                cost_factors: Some(NodeCostFactors {
                    node_id,
                    timestamp: now,
                    on_battery,
                    battery_percent,
                    plugged_in,
                    cpu_load: 0.1,
                    gpu_load: 0.0,
                    memory_percent: 10.0,
                    memory_available_gb: 8.0,
                    bandwidth_mbps: None,
                    is_metered: false,
                    latency_ms: Some(10.0),
                    thermal: atmosphere_types::ThermalState::Nominal,
                }),
                project_path: None,
            },
            hops,
            via_peer: node_id,
            last_update: now,
        }
    }

    #[test]
    fn exact_capability_id_match_wins() {
        let a = entry(PeerId::generate(), 0, 100.0, true, false);
        let query = a.announcement.capability_id.clone();
        let decision = route(&query, &Constraints::default(), &[a.clone()], &HashMap::new(), &HashMap::new(), Utc::now()).unwrap();
        assert_eq!(decision.match_method, MatchMethod::ExactCapability);
        assert_eq!(decision.capability_id, a.announcement.capability_id);
    }

    #[test]
    fn lower_cost_peer_wins_a_neutral_query() {
        let cheap = entry(PeerId::generate(), 1, 100.0, true, false);
        let expensive = entry(PeerId::generate(), 0, 20.0, false, true);
        let entries = vec![cheap.clone(), expensive];
        let decision = route("hello", &Constraints::default(), &entries, &HashMap::new(), &HashMap::new(), Utc::now()).unwrap();
        assert_eq!(decision.peer_id, cheap.announcement.node_id);
    }

    #[test]
    fn missing_required_feature_is_filtered_out() {
        let e = entry(PeerId::generate(), 0, 100.0, true, false);
        let constraints = Constraints { required_features: vec![RequiredFeature::Vision], ..Default::default() };
        assert!(route("hello", &constraints, &[e], &HashMap::new(), &HashMap::new(), Utc::now()).is_none());
    }

    #[test]
    fn routing_is_deterministic_for_identical_inputs() {
        let entries = vec![entry(PeerId::generate(), 0, 50.0, true, false), entry(PeerId::generate(), 0, 50.0, true, false)];
        let d1 = route("hello", &Constraints::default(), &entries, &HashMap::new(), &HashMap::new(), Utc::now()).unwrap();
        let d2 = route("hello", &Constraints::default(), &entries, &HashMap::new(), &HashMap::new(), Utc::now()).unwrap();
        assert_eq!(d1.peer_id, d2.peer_id);
        assert_eq!(d1.capability_id, d2.capability_id);
    }

    #[test]
    fn no_entries_returns_none() {
        assert!(route("hello", &Constraints::default(), &[], &HashMap::new(), &HashMap::new(), Utc::now()).is_none());
    }
}
