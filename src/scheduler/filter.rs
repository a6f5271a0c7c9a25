use std::collections::BTreeSet;

use super::state::{Footprint, PlacementState};
use crate::config::balancing::{BalancingConfig, Mode};
use crate::constraints::Resolution;
use crate::core::guest::{Guest, GuestId};

/// Configuration and resolved groups shared by the filter and ranking stages.
#[derive(Debug, Clone, Copy)]
pub struct PlacementRules<'a> {
    pub config: &'a BalancingConfig,
    pub resolution: &'a Resolution,
}

/// Guests that move together: one guest, or the colocated members of an affinity group.
#[derive(Debug, Clone)]
pub struct Unit<'a> {
    pub members: Vec<&'a Guest>,
    pub footprint: Footprint,
    /// Node all members currently share, if any.
    pub source: Option<String>,
}

impl<'a> Unit<'a> {
    pub fn new(members: Vec<&'a Guest>, rules: &PlacementRules<'_>, state: &PlacementState) -> Self {
        let footprint = members
            .iter()
            .map(|g| Footprint::of(g, rules.config.method, rules.config.mode))
            .fold(Footprint::default(), |acc, fp| acc + fp);
        let mut sources: BTreeSet<&str> = members.iter().filter_map(|g| state.location(g.id)).collect();
        let source = if sources.len() == 1 {
            sources.pop_first().map(str::to_string)
        } else {
            None
        };
        Self {
            members,
            footprint,
            source,
        }
    }

    /// A hypothetical unit with no guests behind it.
    pub fn sized(footprint: Footprint) -> Self {
        Self {
            members: Vec::new(),
            footprint,
            source: None,
        }
    }

    pub fn ids(&self) -> BTreeSet<GuestId> {
        self.members.iter().map(|g| g.id).collect()
    }
}

/// Why a node cannot take a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnknownNode,
    NotEligible,
    CurrentNode,
    PinnedElsewhere,
    AntiAffinityPeer,
    Capacity,
    Hot,
}

/// Checks a single node against every hard rule.
pub fn admits(
    state: &PlacementState,
    rules: &PlacementRules<'_>,
    unit: &Unit<'_>,
    node: &str,
) -> Result<(), Rejection> {
    let Some(target) = state.node(node) else {
        return Err(Rejection::UnknownNode);
    };
    if !target.eligible {
        return Err(Rejection::NotEligible);
    }
    if unit.source.as_deref() == Some(node) {
        return Err(Rejection::CurrentNode);
    }
    if unit.members.iter().any(|g| g.forbids(node)) {
        return Err(Rejection::PinnedElsewhere);
    }
    let ids = unit.ids();
    let peer_present = unit
        .members
        .iter()
        .filter_map(|g| g.anti_affinity_group())
        .filter_map(|group| rules.resolution.anti_affinity_groups.get(group))
        .any(|peers| state.hosts_any(node, peers, &ids));
    if peer_present {
        return Err(Rejection::AntiAffinityPeer);
    }
    if !state.fits(node, &unit.footprint) {
        return Err(Rejection::Capacity);
    }
    if rules.config.mode == Mode::Pressure && target.hot {
        return Err(Rejection::Hot);
    }
    Ok(())
}

/// Every node that may receive `unit`, in name order.
pub fn candidates(state: &PlacementState, rules: &PlacementRules<'_>, unit: &Unit<'_>) -> Vec<String> {
    state
        .nodes()
        .filter(|n| admits(state, rules, unit, &n.name).is_ok())
        .map(|n| n.name.clone())
        .collect()
}
