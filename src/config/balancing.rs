use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::core::guest::GuestKind;
use crate::core::resources::{Resource, Resources, GIB};
use crate::errors::ConfigurationError;

/// Resource dimension the balancer equalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Cpu,
    Memory,
}

impl Method {
    pub fn resource(self) -> Resource {
        match self {
            Method::Cpu => Resource::Cpu,
            Method::Memory => Resource::Memory,
        }
    }
}

/// How node load is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Sum of the configured sizes of the guests on a node.
    Assigned,
    /// Measured usage.
    Used,
    /// Contention (pressure) load; hot nodes never receive guests.
    #[serde(alias = "psi")]
    Pressure,
}

/// Headroom kept free on a node. Cpu in cores, memory and disk in GiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReserveSpec {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub disk: f64,
}

impl ReserveSpec {
    pub fn to_resources(self) -> Resources {
        Resources::new(self.cpu, self.memory * GIB, self.disk * GIB)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResourceReserve {
    #[serde(default)]
    pub defaults: ReserveSpec,
    #[serde(flatten)]
    pub nodes: BTreeMap<String, ReserveSpec>,
}

impl Default for NodeResourceReserve {
    fn default() -> Self {
        Self {
            defaults: ReserveSpec {
                memory: 2.0,
                ..ReserveSpec::default()
            },
            nodes: BTreeMap::new(),
        }
    }
}

impl NodeResourceReserve {
    pub fn for_node(&self, node: &str) -> Resources {
        self.nodes
            .get(node)
            .copied()
            .unwrap_or(self.defaults)
            .to_resources()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolGroupKind {
    #[serde(rename = "affinity")]
    Affinity,
    #[serde(rename = "anti-affinity", alias = "anti_affinity")]
    AntiAffinity,
}

/// Balancing policy attached to a resource pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolPolicy {
    #[serde(rename = "type", default)]
    pub kind: Option<PoolGroupKind>,
    #[serde(default)]
    pub pin: Vec<String>,
    #[serde(default)]
    pub strict: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancingConfig {
    pub enable: bool,
    pub method: Method,
    pub mode: Mode,
    /// Tolerated spread between the most and least loaded node, in percent.
    pub balanciness: f64,
    /// Memory load (percent) the busiest node must reach before rebalancing by memory.
    pub memory_threshold: Option<f64>,
    pub balance_types: BTreeSet<GuestKind>,
    pub parallel: bool,
    pub parallel_jobs: usize,
    pub parallel_jobs_per_node: usize,
    pub live: bool,
    /// Seconds a dispatched relocation may take before it counts as failed.
    pub max_job_validation: u64,
    pub node_resource_reserve: NodeResourceReserve,
    pub maintenance_nodes: BTreeSet<String>,
    pub ignore_nodes: BTreeSet<String>,
    pub balance_larger_guests_first: bool,
    pub tie_break_by_guest_count: bool,
    pub enforce_affinity: bool,
    pub enforce_pinning: bool,
    pub pools: BTreeMap<String, PoolPolicy>,
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            enable: false,
            method: Method::Memory,
            mode: Mode::Used,
            balanciness: 5.0,
            memory_threshold: Some(75.0),
            balance_types: [GuestKind::Vm, GuestKind::Container].into_iter().collect(),
            parallel: false,
            parallel_jobs: 1,
            parallel_jobs_per_node: 1,
            live: true,
            max_job_validation: 1800,
            node_resource_reserve: NodeResourceReserve::default(),
            maintenance_nodes: BTreeSet::new(),
            ignore_nodes: BTreeSet::new(),
            balance_larger_guests_first: false,
            tie_break_by_guest_count: false,
            enforce_affinity: true,
            enforce_pinning: false,
            pools: BTreeMap::new(),
        }
    }
}

impl BalancingConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=100.0).contains(&self.balanciness) {
            return Err(ConfigurationError::invalid(
                "balancing.balanciness",
                format!("{} is outside 0..=100", self.balanciness),
            ));
        }
        if let Some(threshold) = self.memory_threshold {
            if !(0.0..=100.0).contains(&threshold) {
                return Err(ConfigurationError::invalid(
                    "balancing.memory_threshold",
                    format!("{} is outside 0..=100", threshold),
                ));
            }
        }
        if self.balance_types.is_empty() {
            return Err(ConfigurationError::invalid(
                "balancing.balance_types",
                "at least one guest kind is required",
            ));
        }
        if self.parallel_jobs == 0 {
            return Err(ConfigurationError::invalid("balancing.parallel_jobs", "must be at least 1"));
        }
        if self.parallel_jobs_per_node == 0 {
            return Err(ConfigurationError::invalid(
                "balancing.parallel_jobs_per_node",
                "must be at least 1",
            ));
        }
        if self.max_job_validation == 0 {
            return Err(ConfigurationError::invalid(
                "balancing.max_job_validation",
                "must be at least one second",
            ));
        }
        let reserves = std::iter::once(("defaults", &self.node_resource_reserve.defaults)).chain(
            self.node_resource_reserve
                .nodes
                .iter()
                .map(|(name, spec)| (name.as_str(), spec)),
        );
        for (node, spec) in reserves {
            if spec.cpu < 0.0 || spec.memory < 0.0 || spec.disk < 0.0 {
                return Err(ConfigurationError::invalid(
                    "balancing.node_resource_reserve",
                    format!("negative reserve for {}", node),
                ));
            }
        }
        for (pool, policy) in &self.pools {
            if policy.pin.iter().any(|n| n.trim().is_empty()) {
                return Err(ConfigurationError::invalid(
                    "balancing.pools",
                    format!("pool {} pins an empty node name", pool),
                ));
            }
        }
        Ok(())
    }

    /// Number of relocations allowed to run at once.
    pub fn concurrency(&self) -> usize {
        if self.parallel {
            self.parallel_jobs.max(1)
        } else {
            1
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.max_job_validation)
    }
}

/// Partial balancing configuration, as persisted by the API or sent with a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BalancingOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balanciness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_types: Option<BTreeSet<GuestKind>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_jobs: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_jobs_per_node: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_job_validation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_resource_reserve: Option<NodeResourceReserve>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_nodes: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_nodes: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_larger_guests_first: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tie_break_by_guest_count: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce_affinity: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce_pinning: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pools: Option<BTreeMap<String, PoolPolicy>>,
}

macro_rules! overlay {
    ($target:expr, $source:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $source.$field.clone() {
                $target.$field = value;
            }
        )+
    };
    ($target:expr, $source:expr, $($field:ident),+; optional) => {
        $(
            if $source.$field.is_some() {
                $target.$field = $source.$field.clone();
            }
        )+
    };
}

impl BalancingOverrides {
    /// Returns `base` with every field set here replacing the base value.
    pub fn apply(&self, base: &BalancingConfig) -> BalancingConfig {
        let mut config = base.clone();
        overlay!(
            config,
            self,
            enable,
            method,
            mode,
            balanciness,
            balance_types,
            parallel,
            parallel_jobs,
            parallel_jobs_per_node,
            live,
            max_job_validation,
            node_resource_reserve,
            maintenance_nodes,
            ignore_nodes,
            balance_larger_guests_first,
            tie_break_by_guest_count,
            enforce_affinity,
            enforce_pinning,
            pools,
        );
        if self.memory_threshold.is_some() {
            config.memory_threshold = self.memory_threshold;
        }
        config
    }

    /// Layers `higher` on top of `self`; fields set in `higher` win.
    pub fn merge(&self, higher: &BalancingOverrides) -> BalancingOverrides {
        let mut merged = self.clone();
        overlay!(
            merged,
            higher,
            enable,
            method,
            mode,
            balanciness,
            memory_threshold,
            balance_types,
            parallel,
            parallel_jobs,
            parallel_jobs_per_node,
            live,
            max_job_validation,
            node_resource_reserve,
            maintenance_nodes,
            ignore_nodes,
            balance_larger_guests_first,
            tie_break_by_guest_count,
            enforce_affinity,
            enforce_pinning,
            pools;
            optional
        );
        merged
    }
}
