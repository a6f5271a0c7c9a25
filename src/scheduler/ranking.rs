use std::cmp::Ordering;

use super::filter::{PlacementRules, Unit};
use super::state::PlacementState;

/// Ordering key for one candidate node; earlier keys win.
#[derive(Debug, Clone, PartialEq)]
pub struct RankKey {
    pub node: String,
    pub affinity_peer: bool,
    pub preferred: bool,
    /// Headroom left after placement, in percent of the balanced dimension.
    pub free_margin: f64,
    pub guests: usize,
}

pub fn rank_key(state: &PlacementState, rules: &PlacementRules<'_>, unit: &Unit<'_>, node: &str) -> RankKey {
    let ids = unit.ids();
    let affinity_peer = unit
        .members
        .iter()
        .filter_map(|g| g.affinity_group())
        .filter_map(|group| rules.resolution.affinity_groups.get(group))
        .any(|peers| state.hosts_any(node, peers, &ids));
    let preferred = unit.members.iter().any(|g| g.prefers(node));
    RankKey {
        node: node.to_string(),
        affinity_peer,
        preferred,
        free_margin: 100.0 - state.load_after(node, &unit.footprint, true),
        guests: state.guest_count(node),
    }
}

fn compare(a: &RankKey, b: &RankKey, by_guest_count: bool) -> Ordering {
    b.affinity_peer
        .cmp(&a.affinity_peer)
        .then_with(|| b.preferred.cmp(&a.preferred))
        .then_with(|| b.free_margin.total_cmp(&a.free_margin))
        .then_with(|| {
            if by_guest_count {
                a.guests.cmp(&b.guests)
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| a.node.cmp(&b.node))
}

/// Orders filtered candidates, best first.
pub fn rank(
    state: &PlacementState,
    rules: &PlacementRules<'_>,
    unit: &Unit<'_>,
    candidates: Vec<String>,
) -> Vec<RankKey> {
    let mut keys: Vec<RankKey> = candidates
        .iter()
        .map(|node| rank_key(state, rules, unit, node))
        .collect();
    keys.sort_by(|a, b| compare(a, b, rules.config.tie_break_by_guest_count));
    keys
}
