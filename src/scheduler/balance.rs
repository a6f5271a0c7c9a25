use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::state::PlacementState;
use crate::config::balancing::{BalancingConfig, Method, Mode};

/// Load distribution across eligible nodes and the balance-gate verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    pub method: Method,
    pub mode: Mode,
    pub node_loads: BTreeMap<String, f64>,
    pub max_load: f64,
    pub min_load: f64,
    pub spread: f64,
    pub balanciness: f64,
    pub max_memory_load: f64,
    /// True when rebalancing is not needed.
    pub balanced: bool,
    pub reason: String,
}

pub fn report(state: &PlacementState, config: &BalancingConfig) -> BalanceReport {
    let node_loads: BTreeMap<String, f64> = state
        .eligible_nodes()
        .map(|n| (n.name.clone(), state.load(&n.name)))
        .collect();
    let (max_load, min_load) = state.extremes().unwrap_or((0.0, 0.0));
    let spread = max_load - min_load;
    let max_memory_load = state
        .eligible_nodes()
        .map(|n| state.memory_load(&n.name))
        .fold(0.0, f64::max);

    let threshold = match (config.method, config.memory_threshold) {
        (Method::Memory, Some(threshold)) => Some(threshold),
        _ => None,
    };

    let (balanced, reason) = if node_loads.len() < 2 {
        (true, "fewer than two eligible nodes".to_string())
    } else if spread <= config.balanciness {
        (
            true,
            format!("spread {:.1}% within balanciness {:.1}%", spread, config.balanciness),
        )
    } else if let Some(threshold) = threshold.filter(|t| max_memory_load < *t) {
        (
            true,
            format!(
                "highest memory load {:.1}% below threshold {:.1}%",
                max_memory_load, threshold
            ),
        )
    } else {
        (
            false,
            format!("spread {:.1}% exceeds balanciness {:.1}%", spread, config.balanciness),
        )
    };

    BalanceReport {
        method: config.method,
        mode: config.mode,
        node_loads,
        max_load,
        min_load,
        spread,
        balanciness: config.balanciness,
        max_memory_load,
        balanced,
        reason,
    }
}
