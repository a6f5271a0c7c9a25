use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::config::balancing::Mode;
use crate::core::resources::Resources;
use crate::monitoring::pressure::PressureMetrics;

/// Numeric guest id as assigned by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuestId(pub u32);

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GuestKind {
    #[serde(rename = "vm")]
    Vm,
    #[serde(rename = "ct")]
    Container,
}

impl fmt::Display for GuestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestKind::Vm => write!(f, "vm"),
            GuestKind::Container => write!(f, "ct"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestState {
    Running,
    Stopped,
    Paused,
    #[serde(other)]
    Unknown,
}

/// Namespaced group key, e.g. `tag:web` or `ha:rule-1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(source: &str, key: &str) -> Self {
        GroupId(format!("{}:{}", source, key))
    }

    /// Key without its source namespace.
    pub fn key(&self) -> &str {
        self.0.split_once(':').map(|(_, k)| k).unwrap_or(&self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A placement constraint resolved for one guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    Affinity { group: GroupId },
    AntiAffinity { group: GroupId },
    NodePinned { nodes: BTreeSet<String>, strict: bool },
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guest {
    pub id: GuestId,
    pub name: String,
    pub kind: GuestKind,
    pub state: GuestState,
    pub node_current: String,
    pub node_target: String,
    pub total: Resources,
    pub used: Resources,
    #[serde(default)]
    pub pressure: PressureMetrics,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pools: Vec<String>,
    #[serde(default)]
    pub ha_rules: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub processed: bool,
}

impl Guest {
    pub fn affinity_group(&self) -> Option<&GroupId> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::Affinity { group } => Some(group),
            _ => None,
        })
    }

    pub fn anti_affinity_group(&self) -> Option<&GroupId> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::AntiAffinity { group } => Some(group),
            _ => None,
        })
    }

    /// Allowed node set and its strictness, if the guest is pinned.
    pub fn node_pin(&self) -> Option<(&BTreeSet<String>, bool)> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::NodePinned { nodes, strict } => Some((nodes, *strict)),
            _ => None,
        })
    }

    pub fn is_ignored(&self) -> bool {
        self.constraints.iter().any(|c| matches!(c, Constraint::Ignored))
    }

    pub fn is_running(&self) -> bool {
        self.state == GuestState::Running
    }

    /// True when a strict pin forbids `node`.
    pub fn forbids(&self, node: &str) -> bool {
        match self.node_pin() {
            Some((nodes, true)) => !nodes.contains(node),
            _ => false,
        }
    }

    /// True when a soft or strict pin lists `node`.
    pub fn prefers(&self, node: &str) -> bool {
        self.node_pin().map(|(nodes, _)| nodes.contains(node)).unwrap_or(false)
    }

    /// Amount this guest adds to a node under the given accounting mode.
    pub fn demand(&self, mode: Mode) -> Resources {
        match mode {
            Mode::Assigned => self.total,
            Mode::Used | Mode::Pressure => self.used,
        }
    }
}
