use std::collections::{BTreeMap, BTreeSet};
use std::ops::Add;

use crate::config::balancing::{BalancingConfig, Method, Mode};
use crate::core::guest::{Guest, GuestId};
use crate::core::resources::{Resource, Resources};
use crate::core::snapshot::ClusterSnapshot;

/// What a placement unit adds to, or takes from, a node.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Footprint {
    pub demand: Resources,
    pub pressure: f64,
}

impl Footprint {
    pub fn of(guest: &Guest, method: Method, mode: Mode) -> Self {
        Self {
            demand: guest.demand(mode),
            pressure: guest.pressure.load(method.resource()),
        }
    }
}

impl Add for Footprint {
    type Output = Footprint;

    fn add(self, rhs: Footprint) -> Footprint {
        Footprint {
            demand: self.demand + rhs.demand,
            pressure: self.pressure + rhs.pressure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeState {
    pub name: String,
    pub eligible: bool,
    pub hot: bool,
    pub capacity: Resources,
    pub limit: Resources,
    pub usage: Resources,
    pub pressure: f64,
    pub guests: BTreeSet<GuestId>,
}

/// Projected cluster state while a plan is being built.
#[derive(Debug, Clone)]
pub struct PlacementState {
    method: Method,
    mode: Mode,
    nodes: BTreeMap<String, NodeState>,
    location: BTreeMap<GuestId, String>,
}

impl PlacementState {
    pub fn new(snapshot: &ClusterSnapshot, config: &BalancingConfig) -> Self {
        let mut nodes: BTreeMap<String, NodeState> = snapshot
            .nodes
            .values()
            .map(|n| {
                (
                    n.name.clone(),
                    NodeState {
                        name: n.name.clone(),
                        eligible: n.eligible(),
                        hot: n.hot(),
                        capacity: n.capacity,
                        limit: n.limit(),
                        usage: n.usage(config.mode),
                        pressure: n.pressure.load(config.method.resource()),
                        guests: BTreeSet::new(),
                    },
                )
            })
            .collect();

        let mut location = BTreeMap::new();
        for guest in snapshot.guests.values() {
            if !guest.is_running() {
                continue;
            }
            if let Some(node) = nodes.get_mut(&guest.node_current) {
                node.guests.insert(guest.id);
            }
            location.insert(guest.id, guest.node_current.clone());
        }

        Self {
            method: config.method,
            mode: config.mode,
            nodes,
            location,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values()
    }

    pub fn eligible_nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values().filter(|n| n.eligible)
    }

    pub fn location(&self, id: GuestId) -> Option<&str> {
        self.location.get(&id).map(String::as_str)
    }

    pub fn guest_count(&self, name: &str) -> usize {
        self.nodes.get(name).map(|n| n.guests.len()).unwrap_or(0)
    }

    fn load_from(&self, capacity: &Resources, usage: &Resources, pressure: f64) -> f64 {
        match self.mode {
            Mode::Pressure => pressure,
            _ => usage.percent_of(capacity, self.method.resource()),
        }
    }

    /// Current load of `name` in percent; unknown nodes read as fully loaded.
    pub fn load(&self, name: &str) -> f64 {
        match self.nodes.get(name) {
            Some(n) => self.load_from(&n.capacity, &n.usage, n.pressure),
            None => 100.0,
        }
    }

    pub fn memory_load(&self, name: &str) -> f64 {
        self.nodes
            .get(name)
            .map(|n| n.usage.percent_of(&n.capacity, Resource::Memory))
            .unwrap_or(100.0)
    }

    /// Load of `name` once `footprint` is added (or removed).
    pub fn load_after(&self, name: &str, footprint: &Footprint, adding: bool) -> f64 {
        let Some(n) = self.nodes.get(name) else {
            return 100.0;
        };
        let (usage, pressure) = if adding {
            (n.usage + footprint.demand, n.pressure + footprint.pressure)
        } else {
            (
                (n.usage - footprint.demand).saturating(),
                (n.pressure - footprint.pressure).max(0.0),
            )
        };
        self.load_from(&n.capacity, &usage, pressure)
    }

    /// True when `footprint` fits under the node's capacity minus reserve, in every dimension.
    pub fn fits(&self, name: &str, footprint: &Footprint) -> bool {
        let Some(n) = self.nodes.get(name) else {
            return false;
        };
        let projected = n.usage + footprint.demand;
        Resource::ALL
            .iter()
            .all(|r| projected.get(*r) <= n.limit.get(*r))
    }

    pub fn within_limit(&self, name: &str) -> bool {
        self.fits(name, &Footprint::default())
    }

    /// Moves a guest's footprint from its current node to `target`.
    pub fn relocate(&mut self, id: GuestId, target: &str, footprint: &Footprint) {
        if let Some(source) = self.location.get(&id).cloned() {
            if let Some(n) = self.nodes.get_mut(&source) {
                n.usage = (n.usage - footprint.demand).saturating();
                n.pressure = (n.pressure - footprint.pressure).max(0.0);
                n.guests.remove(&id);
            }
        }
        if let Some(n) = self.nodes.get_mut(target) {
            n.usage += footprint.demand;
            n.pressure += footprint.pressure;
            n.guests.insert(id);
        }
        self.location.insert(id, target.to_string());
    }

    /// Highest and lowest load among eligible nodes.
    pub fn extremes(&self) -> Option<(f64, f64)> {
        let loads: Vec<f64> = self.eligible_nodes().map(|n| self.load(&n.name)).collect();
        if loads.is_empty() {
            return None;
        }
        let max = loads.iter().copied().fold(f64::MIN, f64::max);
        let min = loads.iter().copied().fold(f64::MAX, f64::min);
        Some((max, min))
    }

    pub fn spread(&self) -> f64 {
        self.extremes().map(|(max, min)| max - min).unwrap_or(0.0)
    }

    /// Eligible nodes, most loaded first.
    pub fn by_load_desc(&self) -> Vec<String> {
        let mut names: Vec<(f64, String)> = self
            .eligible_nodes()
            .map(|n| (self.load(&n.name), n.name.clone()))
            .collect();
        names.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        names.into_iter().map(|(_, name)| name).collect()
    }

    /// True when any guest of `ids`, other than those in `except`, sits on `node`.
    pub fn hosts_any(&self, node: &str, ids: &BTreeSet<GuestId>, except: &BTreeSet<GuestId>) -> bool {
        ids.iter()
            .filter(|id| !except.contains(id))
            .any(|id| self.location(*id) == Some(node))
    }
}
