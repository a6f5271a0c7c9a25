/*
* Placement planning
* ------------------
* One plan is built in phases against a projected copy of the cluster:
*
* 1. evacuate    every running guest leaves maintenance and ignored nodes
* 2. constraints strict pins honoured, affinity groups colocated, anti-affinity peers split
* 3. gate        stop here when the collected snapshot is balanced enough
* 4. rebalance   shed one placement unit at a time from the most loaded node
* 5. validate    revert moves that broke a group or overfilled a node
*
* Target choice is always filter (state::fits, filter::admits) then rank
* (ranking::rank). A unit moves at most once per pass.
*/

pub mod balance;
pub mod filter;
pub mod ranking;
pub mod state;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::balancing::BalancingConfig;
use crate::constraints::Resolution;
use crate::core::guest::{Guest, GuestId, GuestKind};
use crate::core::resources::Resources;
use crate::core::snapshot::ClusterSnapshot;
use crate::errors::BalancerError;

pub use balance::BalanceReport;
use filter::{PlacementRules, Unit};
use state::{Footprint, PlacementState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveReason {
    Maintenance,
    Constraint,
    Rebalance,
}

impl fmt::Display for MoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveReason::Maintenance => write!(f, "maintenance"),
            MoveReason::Constraint => write!(f, "constraint"),
            MoveReason::Rebalance => write!(f, "rebalance"),
        }
    }
}

/// Numbers behind a move decision, loads in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveMetrics {
    pub guest_demand: Resources,
    pub source_load_before: f64,
    pub source_load_after: f64,
    pub target_load_before: f64,
    pub target_load_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedMove {
    pub guest: GuestId,
    pub guest_name: String,
    pub kind: GuestKind,
    pub source: String,
    pub target: String,
    pub reason: MoveReason,
    pub metrics: MoveMetrics,
}

/// A guest the planner had to leave where it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unplaceable {
    pub guest: GuestId,
    pub guest_name: String,
    pub node: String,
    pub reason: String,
}

impl Unplaceable {
    pub fn to_error(&self) -> BalancerError {
        BalancerError::PlacementInfeasible {
            guest: self.guest_name.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub moves: Vec<ProposedMove>,
    pub unplaceable: Vec<Unplaceable>,
    /// Balance of the collected snapshot; drives the gate.
    pub balance: BalanceReport,
    /// Balance once every move has landed.
    pub projected: BalanceReport,
}

impl Plan {
    pub fn count(&self, reason: MoveReason) -> usize {
        self.moves.iter().filter(|m| m.reason == reason).count()
    }
}

pub struct Planner<'a> {
    config: &'a BalancingConfig,
}

impl<'a> Planner<'a> {
    pub fn new(config: &'a BalancingConfig) -> Self {
        Self { config }
    }

    /// Plans one pass and writes `node_target` / `processed` on the snapshot's guests.
    pub fn plan(&self, snapshot: &mut ClusterSnapshot, resolution: &Resolution) -> Plan {
        for guest in snapshot.guests.values_mut() {
            guest.node_target = guest.node_current.clone();
            guest.processed = false;
        }

        let plan = PlanBuilder::new(self.config, snapshot, resolution).run();

        for m in &plan.moves {
            if let Some(guest) = snapshot.guests.get_mut(&m.guest) {
                guest.node_target = m.target.clone();
                guest.processed = true;
            }
        }

        info!(
            cluster = %snapshot.cluster,
            maintenance = plan.count(MoveReason::Maintenance),
            constraint = plan.count(MoveReason::Constraint),
            rebalance = plan.count(MoveReason::Rebalance),
            unplaceable = plan.unplaceable.len(),
            spread_before = plan.balance.spread,
            spread_after = plan.projected.spread,
            "Placement plan ready"
        );
        plan
    }

    /// Highest-ranked node for a new guest of the given size.
    pub fn best_node(&self, snapshot: &ClusterSnapshot, demand: Resources) -> Option<String> {
        let resolution = Resolution::default();
        let rules = PlacementRules {
            config: self.config,
            resolution: &resolution,
        };
        let state = PlacementState::new(snapshot, self.config);
        let unit = Unit::sized(Footprint {
            demand,
            pressure: 0.0,
        });
        let candidates = filter::candidates(&state, &rules, &unit);
        ranking::rank(&state, &rules, &unit, candidates)
            .into_iter()
            .next()
            .map(|key| key.node)
    }
}

struct PlanBuilder<'a> {
    config: &'a BalancingConfig,
    snapshot: &'a ClusterSnapshot,
    rules: PlacementRules<'a>,
    state: PlacementState,
    moves: Vec<ProposedMove>,
    processed: BTreeSet<GuestId>,
    unplaceable: Vec<Unplaceable>,
}

impl<'a> PlanBuilder<'a> {
    fn new(config: &'a BalancingConfig, snapshot: &'a ClusterSnapshot, resolution: &'a Resolution) -> Self {
        Self {
            config,
            snapshot,
            rules: PlacementRules { config, resolution },
            state: PlacementState::new(snapshot, config),
            moves: Vec::new(),
            processed: BTreeSet::new(),
            unplaceable: Vec::new(),
        }
    }

    fn run(mut self) -> Plan {
        let balance = balance::report(&self.state, self.config);

        self.evacuate();
        if self.config.enforce_affinity {
            self.enforce_pins();
            self.colocate_affinity_groups();
            self.separate_anti_affinity_groups();
        }
        if balance.balanced {
            debug!(reason = %balance.reason, "Balance gate closed, skipping rebalance");
        } else {
            self.rebalance();
        }
        self.validate();

        if self.config.balance_larger_guests_first {
            let resource = self.config.method.resource();
            self.moves.sort_by(|a, b| {
                a.reason.cmp(&b.reason).then_with(|| {
                    b.metrics
                        .guest_demand
                        .get(resource)
                        .total_cmp(&a.metrics.guest_demand.get(resource))
                })
            });
        }

        let projected = balance::report(&self.state, self.config);
        Plan {
            moves: self.moves,
            unplaceable: self.unplaceable,
            balance,
            projected,
        }
    }

    fn guest(&self, id: GuestId) -> Option<&'a Guest> {
        let snapshot: &'a ClusterSnapshot = self.snapshot;
        snapshot.guests.get(&id)
    }

    /// Movable and not yet moved in this pass.
    fn is_free(&self, guest: &Guest) -> bool {
        self.snapshot.is_movable(guest, self.config) && !self.processed.contains(&guest.id)
    }

    /// Maintenance and ignored nodes are emptied of every running guest, whatever its kind.
    fn must_leave(&self, guest: &Guest) -> bool {
        guest.is_running() && !guest.is_ignored() && !self.processed.contains(&guest.id)
    }

    fn location(&self, id: GuestId) -> String {
        self.state.location(id).unwrap_or_default().to_string()
    }

    fn order_by_size(&self, guests: &mut [&'a Guest]) {
        if self.config.balance_larger_guests_first {
            let resource = self.config.method.resource();
            let mode = self.config.mode;
            guests.sort_by(|a, b| b.demand(mode).get(resource).total_cmp(&a.demand(mode).get(resource)));
        }
    }

    fn unit(&self, members: Vec<&'a Guest>) -> Unit<'a> {
        Unit::new(members, &self.rules, &self.state)
    }

    fn best_target(&self, unit: &Unit<'_>) -> Option<String> {
        let candidates = filter::candidates(&self.state, &self.rules, unit);
        ranking::rank(&self.state, &self.rules, unit, candidates)
            .into_iter()
            .next()
            .map(|key| key.node)
    }

    fn report_unplaceable(&mut self, guest: &Guest, reason: impl Into<String>) {
        let reason = reason.into();
        let node = self.location(guest.id);
        warn!(guest = %guest.name, node = %node, reason = %reason, "Guest left in place");
        self.unplaceable.push(Unplaceable {
            guest: guest.id,
            guest_name: guest.name.clone(),
            node,
            reason,
        });
    }

    fn apply(&mut self, unit: &Unit<'a>, target: &str, reason: MoveReason) {
        for guest in &unit.members {
            let source = self.location(guest.id);
            if source == target {
                continue;
            }
            let footprint = Footprint::of(guest, self.config.method, self.config.mode);
            let metrics = MoveMetrics {
                guest_demand: footprint.demand,
                source_load_before: self.state.load(&source),
                source_load_after: self.state.load_after(&source, &footprint, false),
                target_load_before: self.state.load(target),
                target_load_after: self.state.load_after(target, &footprint, true),
            };
            self.state.relocate(guest.id, target, &footprint);
            self.processed.insert(guest.id);
            debug!(
                guest = %guest.name,
                source = %source,
                target = %target,
                reason = %reason,
                "Planned move"
            );
            self.moves.push(ProposedMove {
                guest: guest.id,
                guest_name: guest.name.clone(),
                kind: guest.kind,
                source,
                target: target.to_string(),
                reason,
                metrics,
            });
        }
    }

    fn evacuate(&mut self) {
        let snapshot = self.snapshot;
        let mut leaving: Vec<&'a Guest> = snapshot
            .guests
            .values()
            .filter(|g| self.must_leave(g))
            .filter(|g| {
                snapshot
                    .node(&g.node_current)
                    .map(|n| n.excluded())
                    .unwrap_or(false)
            })
            .collect();
        self.order_by_size(&mut leaving);

        for guest in leaving {
            let online = snapshot
                .node(&guest.node_current)
                .map(|n| n.online)
                .unwrap_or(false);
            if !online {
                self.report_unplaceable(guest, "maintenance node is offline");
                continue;
            }
            let unit = self.unit(vec![guest]);
            match self.best_target(&unit) {
                Some(target) => self.apply(&unit, &target, MoveReason::Maintenance),
                None => self.report_unplaceable(guest, "no eligible node can take it off a maintenance node"),
            }
        }
    }

    fn enforce_pins(&mut self) {
        let snapshot = self.snapshot;
        let violating: Vec<&'a Guest> = snapshot
            .guests
            .values()
            .filter(|g| self.is_free(g))
            .filter(|g| g.forbids(&self.location(g.id)))
            .collect();
        for guest in violating {
            let unit = self.unit(vec![guest]);
            match self.best_target(&unit) {
                Some(target) => self.apply(&unit, &target, MoveReason::Constraint),
                None => self.report_unplaceable(guest, "no allowed node has room for its strict pin"),
            }
        }
    }

    fn colocate_affinity_groups(&mut self) {
        let resolution = self.rules.resolution;
        for (group, ids) in &resolution.affinity_groups {
            let members: Vec<&'a Guest> = ids.iter().filter_map(|id| self.guest(*id)).collect();
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for guest in &members {
                *counts.entry(self.location(guest.id)).or_default() += 1;
            }
            if counts.len() <= 1 {
                continue;
            }

            let (moving, fixed): (Vec<&'a Guest>, Vec<&'a Guest>) =
                members.iter().copied().partition(|g| self.is_free(g));
            let fixed_nodes: BTreeSet<String> = fixed.iter().map(|g| self.location(g.id)).collect();

            let anchors: Vec<String> = match fixed_nodes.len() {
                0 => {
                    let mut hosting: Vec<(usize, String)> =
                        counts.iter().map(|(node, n)| (*n, node.clone())).collect();
                    hosting.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
                    let whole = self.unit(moving.clone());
                    let others = filter::candidates(&self.state, &self.rules, &whole);
                    let ranked = ranking::rank(&self.state, &self.rules, &whole, others);
                    hosting
                        .into_iter()
                        .map(|(_, node)| node)
                        .chain(ranked.into_iter().map(|key| key.node))
                        .collect()
                }
                1 => fixed_nodes.into_iter().collect(),
                _ => {
                    for guest in moving {
                        self.report_unplaceable(
                            guest,
                            format!("affinity group {} is held on several nodes", group),
                        );
                    }
                    continue;
                }
            };

            let mut placed = false;
            for anchor in anchors {
                let movers: Vec<&'a Guest> = moving
                    .iter()
                    .copied()
                    .filter(|g| self.location(g.id) != anchor)
                    .collect();
                if movers.is_empty() {
                    placed = true;
                    break;
                }
                let unit = self.unit(movers);
                if filter::admits(&self.state, &self.rules, &unit, &anchor).is_ok() {
                    self.apply(&unit, &anchor, MoveReason::Constraint);
                    placed = true;
                    break;
                }
            }
            if !placed {
                for guest in moving {
                    self.report_unplaceable(guest, format!("affinity group {} cannot be colocated", group));
                }
            }
        }
    }

    fn separate_anti_affinity_groups(&mut self) {
        let resolution = self.rules.resolution;
        for (group, ids) in &resolution.anti_affinity_groups {
            let mut by_node: BTreeMap<String, Vec<&'a Guest>> = BTreeMap::new();
            for guest in ids.iter().filter_map(|id| self.guest(*id)) {
                by_node.entry(self.location(guest.id)).or_default().push(guest);
            }
            for (_, mut sharing) in by_node {
                if sharing.len() < 2 {
                    continue;
                }
                // keep a member that cannot move, otherwise the lowest id
                sharing.sort_by_key(|g| (self.is_free(g), g.id));
                for guest in sharing.into_iter().skip(1) {
                    if !self.is_free(guest) {
                        continue;
                    }
                    let unit = self.unit(vec![guest]);
                    match self.best_target(&unit) {
                        Some(target) => self.apply(&unit, &target, MoveReason::Constraint),
                        None => self.report_unplaceable(
                            guest,
                            format!("no node free of anti-affinity group {}", group),
                        ),
                    }
                }
            }
        }
    }

    /// Units on `node` that may move: single guests, or an affinity group wholly movable from here.
    fn units_on(&self, node: &str) -> Vec<Unit<'a>> {
        let mut seen = BTreeSet::new();
        let mut units = Vec::new();
        let hosted: Vec<&'a Guest> = self
            .state
            .node(node)
            .map(|n| n.guests.iter().filter_map(|id| self.guest(*id)).collect())
            .unwrap_or_default();

        for guest in &hosted {
            if seen.contains(&guest.id) {
                continue;
            }
            let members: Vec<&'a Guest> = match guest
                .affinity_group()
                .and_then(|group| self.rules.resolution.affinity_groups.get(group))
            {
                Some(ids) => hosted
                    .iter()
                    .copied()
                    .filter(|g| ids.contains(&g.id))
                    .collect(),
                None => vec![*guest],
            };
            seen.extend(members.iter().map(|g| g.id));
            if members.iter().all(|g| self.is_free(g)) {
                units.push(self.unit(members));
            }
        }

        let resource = self.config.method.resource();
        if self.config.balance_larger_guests_first {
            units.sort_by(|a, b| {
                b.footprint
                    .demand
                    .get(resource)
                    .total_cmp(&a.footprint.demand.get(resource))
            });
        }
        units
    }

    fn rebalance(&mut self) {
        let mut exhausted: BTreeSet<String> = BTreeSet::new();
        loop {
            if self.state.spread() <= self.config.balanciness {
                break;
            }
            let Some(source) = self
                .state
                .by_load_desc()
                .into_iter()
                .find(|n| !exhausted.contains(n))
            else {
                break;
            };

            let before = self.state.load(&source);
            let mut moved = false;
            for unit in self.units_on(&source) {
                let Some(target) = self.best_target(&unit) else {
                    continue;
                };
                let source_after = self.state.load_after(&source, &unit.footprint, false);
                let target_after = self.state.load_after(&target, &unit.footprint, true);
                if source_after.max(target_after) < before {
                    self.apply(&unit, &target, MoveReason::Rebalance);
                    moved = true;
                    break;
                }
            }
            if !moved {
                debug!(node = %source, "No improving move left on node");
                exhausted.insert(source);
            }
        }
    }

    fn revert(&mut self, id: GuestId, reason: &str) {
        let Some(index) = self.moves.iter().rposition(|m| m.guest == id) else {
            return;
        };
        let m = self.moves.remove(index);
        if let Some(guest) = self.guest(id) {
            let footprint = Footprint::of(guest, self.config.method, self.config.mode);
            self.state.relocate(id, &m.source, &footprint);
            self.processed.remove(&id);
            self.report_unplaceable(guest, format!("move to {} reverted: {}", m.target, reason));
        }
    }

    /// Moves that may still be undone, latest first.
    fn revertible(&self, filter: impl Fn(&ProposedMove) -> bool) -> Vec<GuestId> {
        self.moves
            .iter()
            .rev()
            .filter(|m| m.reason != MoveReason::Maintenance)
            .filter(|m| filter(m))
            .map(|m| m.guest)
            .collect()
    }

    fn validate(&mut self) {
        loop {
            let mut reverted = 0;

            let resolution = self.rules.resolution;
            for (group, ids) in &resolution.affinity_groups {
                let initial: BTreeSet<&str> = ids
                    .iter()
                    .filter_map(|id| self.guest(*id))
                    .map(|g| g.node_current.as_str())
                    .collect();
                let projected: BTreeSet<String> = ids.iter().map(|id| self.location(*id)).collect();
                if projected.len() <= initial.len() {
                    continue;
                }
                for id in self.revertible(|m| ids.contains(&m.guest)) {
                    self.revert(id, &format!("affinity group {} would be split", group));
                    reverted += 1;
                }
            }

            for (group, ids) in &resolution.anti_affinity_groups {
                let mut sharing: BTreeMap<String, usize> = BTreeMap::new();
                for id in ids {
                    *sharing.entry(self.location(*id)).or_default() += 1;
                }
                for (node, mut count) in sharing.into_iter().filter(|(_, c)| *c > 1) {
                    for id in self.revertible(|m| ids.contains(&m.guest) && m.target == node) {
                        if count <= 1 {
                            break;
                        }
                        self.revert(id, &format!("anti-affinity group {} would share {}", group, node));
                        count -= 1;
                        reverted += 1;
                    }
                }
            }

            let receiving: BTreeSet<String> = self.moves.iter().map(|m| m.target.clone()).collect();
            for node in receiving {
                for id in self.revertible(|m| m.target == node) {
                    if self.state.within_limit(&node) {
                        break;
                    }
                    self.revert(id, &format!("{} would exceed capacity minus reserve", node));
                    reverted += 1;
                }
            }

            if reverted == 0 {
                break;
            }
        }
    }
}
