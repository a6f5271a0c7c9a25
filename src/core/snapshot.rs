use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::config::balancing::BalancingConfig;
use crate::core::guest::{Guest, GuestId, GuestKind, GuestState};
use crate::core::node::Node;
use crate::core::resources::Resources;
use crate::errors::CollectionError;
use crate::monitoring::metrics::PressureSample;
use crate::monitoring::pressure::PressureEvaluator;

/// Raw cluster state as returned by a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInventory {
    pub cluster: String,
    pub collected_at: DateTime<Utc>,
    pub nodes: Vec<NodeInventory>,
    #[serde(default)]
    pub guests: Vec<GuestInventory>,
    #[serde(default)]
    pub ha_rules: Vec<HaRule>,
}

fn online_default() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInventory {
    pub name: String,
    #[serde(default = "online_default")]
    pub online: bool,
    pub capacity: Resources,
    pub used: Resources,
    #[serde(default)]
    pub samples: Vec<PressureSample>,
    /// Set by the collector when the node could not be queried.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestInventory {
    pub id: GuestId,
    pub name: String,
    pub kind: GuestKind,
    pub state: GuestState,
    pub node: String,
    pub total: Resources,
    pub used: Resources,
    #[serde(default)]
    pub samples: Vec<PressureSample>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pools: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaAffinity {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HaRuleKind {
    ResourceAffinity {
        affinity: HaAffinity,
    },
    NodeAffinity {
        nodes: Vec<String>,
        #[serde(default)]
        strict: bool,
    },
}

/// High-availability rule as exported by the cluster manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaRule {
    pub id: String,
    #[serde(flatten)]
    pub kind: HaRuleKind,
    pub resources: Vec<GuestId>,
    #[serde(default)]
    pub disabled: bool,
}

impl ClusterInventory {
    /// Rejects inventories a pass cannot be planned against.
    pub fn check(&self) -> Result<(), CollectionError> {
        let mut nodes = BTreeSet::new();
        for node in &self.nodes {
            if let Some(reason) = &node.error {
                return Err(CollectionError::NodeUnreachable {
                    node: node.name.clone(),
                    reason: reason.clone(),
                });
            }
            if !nodes.insert(node.name.as_str()) {
                return Err(CollectionError::Malformed(format!(
                    "duplicate node {}",
                    node.name
                )));
            }
        }
        let mut guests = BTreeSet::new();
        for guest in &self.guests {
            if !guests.insert(guest.id) {
                return Err(CollectionError::Malformed(format!(
                    "duplicate guest id {}",
                    guest.id
                )));
            }
            if !nodes.contains(guest.node.as_str()) {
                return Err(CollectionError::Malformed(format!(
                    "guest {} runs on unknown node {}",
                    guest.id, guest.node
                )));
            }
        }
        Ok(())
    }
}

/// Immutable view of the cluster for one pass; the planner only writes targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub cluster: String,
    pub collected_at: DateTime<Utc>,
    pub nodes: BTreeMap<String, Node>,
    pub guests: BTreeMap<GuestId, Guest>,
    #[serde(default)]
    pub ha_rules: Vec<HaRule>,
}

impl ClusterSnapshot {
    pub fn from_inventory(
        inventory: ClusterInventory,
        config: &BalancingConfig,
        evaluator: &PressureEvaluator,
    ) -> Result<Self, CollectionError> {
        inventory.check()?;
        let now = inventory.collected_at;

        let mut assigned: BTreeMap<&str, Resources> = BTreeMap::new();
        for guest in inventory.guests.iter().filter(|g| g.state == GuestState::Running) {
            *assigned.entry(guest.node.as_str()).or_default() += guest.total;
        }

        let mut nodes = BTreeMap::new();
        for node in &inventory.nodes {
            let maintenance = config.maintenance_nodes.contains(&node.name);
            let ignored = config.ignore_nodes.contains(&node.name);
            if !node.online {
                warn!(node = %node.name, "Node offline, it will not receive guests");
            }
            nodes.insert(
                node.name.clone(),
                Node {
                    name: node.name.clone(),
                    online: node.online,
                    capacity: node.capacity,
                    used: node.used,
                    assigned: assigned.get(node.name.as_str()).copied().unwrap_or_default(),
                    reserve: config.node_resource_reserve.for_node(&node.name),
                    pressure: evaluator.evaluate(&node.samples, now),
                    maintenance,
                    ignored,
                },
            );
        }

        let mut guests = BTreeMap::new();
        for guest in inventory.guests {
            let ha_rules = inventory
                .ha_rules
                .iter()
                .filter(|r| !r.disabled && r.resources.contains(&guest.id))
                .map(|r| r.id.clone())
                .collect();
            let pressure = evaluator.evaluate(&guest.samples, now);
            guests.insert(
                guest.id,
                Guest {
                    id: guest.id,
                    name: guest.name,
                    kind: guest.kind,
                    state: guest.state,
                    node_target: guest.node.clone(),
                    node_current: guest.node,
                    total: guest.total,
                    used: guest.used,
                    pressure,
                    tags: guest.tags,
                    pools: guest.pools,
                    ha_rules,
                    constraints: Vec::new(),
                    processed: false,
                },
            );
        }

        debug!(
            cluster = %inventory.cluster,
            nodes = nodes.len(),
            guests = guests.len(),
            "Built cluster snapshot"
        );

        Ok(Self {
            cluster: inventory.cluster,
            collected_at: now,
            nodes,
            guests,
            ha_rules: inventory.ha_rules,
        })
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn guest(&self, id: GuestId) -> Option<&Guest> {
        self.guests.get(&id)
    }

    /// Running guests that the configured balance types allow to move.
    pub fn is_movable(&self, guest: &Guest, config: &BalancingConfig) -> bool {
        guest.is_running() && !guest.is_ignored() && config.balance_types.contains(&guest.kind)
    }

    /// Records a finished relocation: the guest now lives on `target`.
    pub fn apply_completed(&mut self, id: GuestId, target: &str) {
        let Some(guest) = self.guests.get_mut(&id) else {
            return;
        };
        let source = std::mem::replace(&mut guest.node_current, target.to_string());
        guest.node_target = target.to_string();
        let (total, used) = (guest.total, guest.used);
        if source == target {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&source) {
            node.assigned = (node.assigned - total).saturating();
            node.used = (node.used - used).saturating();
        }
        if let Some(node) = self.nodes.get_mut(target) {
            node.assigned += total;
            node.used += used;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::PressureSettings;
    use crate::core::resources::GIB;

    fn inventory() -> ClusterInventory {
        serde_json::from_value(serde_json::json!({
            "cluster": "lab",
            "collected_at": "2026-01-01T00:00:00Z",
            "nodes": [
                {"name": "pve1", "capacity": {"cpu": 8.0, "memory": 34359738368.0, "disk": 0.0},
                 "used": {"cpu": 2.0, "memory": 8589934592.0}},
                {"name": "pve2", "capacity": {"cpu": 8.0, "memory": 34359738368.0},
                 "used": {"cpu": 1.0, "memory": 4294967296.0}}
            ],
            "guests": [
                {"id": 100, "name": "web01", "kind": "vm", "state": "running", "node": "pve1",
                 "total": {"cpu": 2.0, "memory": 4294967296.0}, "used": {"cpu": 1.0, "memory": 2147483648.0},
                 "tags": ["plb_affinity_web"]},
                {"id": 101, "name": "cache", "kind": "ct", "state": "stopped", "node": "pve2",
                 "total": {"cpu": 1.0, "memory": 1073741824.0}, "used": {}}
            ],
            "ha_rules": [
                {"id": "keep-apart", "type": "resource-affinity", "affinity": "negative", "resources": [100, 101]}
            ]
        }))
        .unwrap()
    }

    fn snapshot(inventory: ClusterInventory) -> Result<ClusterSnapshot, CollectionError> {
        let config = BalancingConfig {
            maintenance_nodes: ["pve2".to_string()].into_iter().collect(),
            ..BalancingConfig::default()
        };
        ClusterSnapshot::from_inventory(
            inventory,
            &config,
            &PressureEvaluator::new(&PressureSettings::default()),
        )
    }

    #[test]
    fn builds_nodes_and_guests() {
        let snapshot = snapshot(inventory()).unwrap();
        let pve1 = snapshot.node("pve1").unwrap();
        assert_eq!(pve1.assigned.memory, 4.0 * GIB);
        assert!(snapshot.node("pve2").unwrap().maintenance);
        // stopped guests are not counted as assigned
        assert_eq!(snapshot.node("pve2").unwrap().assigned.memory, 0.0);
        let web = snapshot.guest(GuestId(100)).unwrap();
        assert_eq!(web.ha_rules, vec!["keep-apart".to_string()]);
        assert_eq!(web.node_target, "pve1");
    }

    #[test]
    fn unreachable_node_fails_collection() {
        let mut inv = inventory();
        inv.nodes[1].error = Some("connection refused".into());
        let err = snapshot(inv).unwrap_err();
        assert!(matches!(err, CollectionError::NodeUnreachable { ref node, .. } if node == "pve2"));
    }

    #[test]
    fn guest_on_unknown_node_is_malformed() {
        let mut inv = inventory();
        inv.guests[0].node = "pve9".into();
        assert!(matches!(snapshot(inv), Err(CollectionError::Malformed(_))));
    }

    #[test]
    fn completed_move_shifts_usage() {
        let mut snapshot = snapshot(inventory()).unwrap();
        snapshot.apply_completed(GuestId(100), "pve2");
        assert_eq!(snapshot.guest(GuestId(100)).unwrap().node_current, "pve2");
        assert_eq!(snapshot.node("pve1").unwrap().used.memory, 6.0 * GIB);
        assert_eq!(snapshot.node("pve2").unwrap().used.memory, 6.0 * GIB);
    }
}
