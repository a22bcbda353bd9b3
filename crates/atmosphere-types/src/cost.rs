use crate::peer::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device signals folded into a single `overall_cost`, rewritten into `_cost`
/// every `COST_TICK_INTERVAL`. Higher `overall_cost` means more expensive to
/// route to; see [`NodeCostFactors::overall_cost`] for the weighted formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeCostFactors {
    pub node_id: PeerId,
    pub timestamp: DateTime<Utc>,
    pub on_battery: bool,
    pub battery_percent: f64,
    pub plugged_in: bool,
    pub cpu_load: f64,
    pub gpu_load: f64,
    pub memory_percent: f64,
    pub memory_available_gb: f64,
    #[serde(default)]
    pub bandwidth_mbps: Option<f64>,
    pub is_metered: bool,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    pub thermal: ThermalState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    Nominal,
    Warm,
    Hot,
}

impl ThermalState {
    fn score(self) -> f64 {
        match self {
            Self::Nominal => 1.0,
            Self::Warm => 0.6,
            Self::Hot => 0.2,
        }
    }
}

/// Default weights from §4.5, kept as named constants so the router and the
/// cost collector can't drift apart.
pub const WEIGHT_BATTERY: f64 = 0.30;
pub const WEIGHT_MEMORY: f64 = 0.15;
pub const WEIGHT_CPU: f64 = 0.20;
pub const WEIGHT_NETWORK: f64 = 0.15;
pub const WEIGHT_THERMAL: f64 = 0.20;

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

impl NodeCostFactors {
    fn battery_score(&self) -> f64 {
        if self.plugged_in {
            1.0
        } else {
            (self.battery_percent / 100.0).max(0.0)
        }
    }

    fn memory_score(&self) -> f64 {
        clamp01(1.0 - self.memory_percent / 100.0)
    }

    fn cpu_score(&self) -> f64 {
        clamp01(1.0 - self.cpu_load)
    }

    fn network_score(&self) -> f64 {
        if self.is_metered {
            0.4
        } else {
            1.0
        }
    }

    fn thermal_score(&self) -> f64 {
        self.thermal.score()
    }

    /// `overall_cost = 1 - Σ wᵢ·sᵢ`. Any individual score that comes out NaN
    /// (e.g. `memory_percent` read as `NaN` on a platform quirk) is treated as
    /// 0, per the numeric note in §4.6 — never propagated into the composite.
    pub fn overall_cost(&self) -> f64 {
        let weighted = WEIGHT_BATTERY * clamp01(self.battery_score())
            + WEIGHT_MEMORY * clamp01(self.memory_score())
            + WEIGHT_CPU * clamp01(self.cpu_score())
            + WEIGHT_NETWORK * clamp01(self.network_score())
            + WEIGHT_THERMAL * clamp01(self.thermal_score());
        clamp01(1.0 - weighted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> NodeCostFactors {
        NodeCostFactors {
            node_id: PeerId::generate(),
            timestamp: Utc::now(),
            on_battery: false,
            battery_percent: 100.0,
            plugged_in: true,
            cpu_load: 0.0,
            gpu_load: 0.0,
            memory_percent: 0.0,
            memory_available_gb: 16.0,
            bandwidth_mbps: Some(1000.0),
            is_metered: false,
            latency_ms: None,
            thermal: ThermalState::Nominal,
        }
    }

    #[test]
    fn best_case_is_near_zero_cost() {
        let cost = base().overall_cost();
        assert!(cost < 0.01, "expected near-zero cost, got {cost}");
    }

    #[test]
    fn on_battery_and_hot_is_expensive() {
        let mut factors = base();
        factors.plugged_in = false;
        factors.on_battery = true;
        factors.battery_percent = 20.0;
        factors.thermal = ThermalState::Hot;
        factors.is_metered = true;
        factors.cpu_load = 0.9;
        factors.memory_percent = 90.0;
        let cost = factors.overall_cost();
        assert!(cost > 0.6, "expected high cost, got {cost}");
    }

    #[test]
    fn cost_is_always_in_unit_range() {
        let mut factors = base();
        factors.battery_percent = -500.0; // defensively malformed input
        factors.cpu_load = 50.0;
        let cost = factors.overall_cost();
        assert!((0.0..=1.0).contains(&cost));
    }
}
