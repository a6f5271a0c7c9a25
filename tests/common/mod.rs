// Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use vm_balancer::cluster::SnapshotCollector;
use vm_balancer::config::BalancingConfig;
use vm_balancer::config::settings::PressureSettings;
use vm_balancer::constraints::{ConstraintResolver, Resolution};
use vm_balancer::core::guest::{GuestId, GuestKind, GuestState};
use vm_balancer::core::resources::{Resources, GIB};
use vm_balancer::core::snapshot::{ClusterInventory, ClusterSnapshot, GuestInventory, NodeInventory};
use vm_balancer::errors::{CollectionError, RelocationError};
use vm_balancer::migration::{PollStatus, Preflight, RelocationHandle, RelocationPrimitive, RelocationRequest, RelocationStatus};
use vm_balancer::monitoring::metrics::{PressureSample, ResourceSample};
use vm_balancer::monitoring::pressure::PressureEvaluator;
use vm_balancer::scheduler::{Plan, Planner};

pub const NODE_CPU: f64 = 32.0;

/// Builds inventories in GiB; node usage is the baseline plus every running guest on it.
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    nodes: Vec<NodeInventory>,
    guests: Vec<GuestInventory>,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            guests: Vec::new(),
        }
    }

    pub fn node(mut self, name: &str, memory_gib: f64, baseline_gib: f64) -> Self {
        self.nodes.push(NodeInventory {
            name: name.to_string(),
            online: true,
            capacity: Resources::new(NODE_CPU, memory_gib * GIB, 1000.0 * GIB),
            used: Resources::new(1.0, baseline_gib * GIB, 10.0 * GIB),
            samples: Vec::new(),
            error: None,
        });
        self
    }

    /// Disk capacity and baseline usage of a node; call before adding its guests.
    pub fn disk(mut self, name: &str, capacity_gib: f64, used_gib: f64) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.name == name) {
            node.capacity.disk = capacity_gib * GIB;
            node.used.disk = used_gib * GIB;
        }
        self
    }

    /// Memory pressure history, oldest first, five minutes apart and ending at collection time.
    pub fn node_pressure(mut self, name: &str, full: &[f64]) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.name == name) {
            node.samples = memory_samples(full);
        }
        self
    }

    pub fn guest_pressure(mut self, id: u32, full: &[f64]) -> Self {
        if let Some(guest) = self.guests.iter_mut().find(|g| g.id == GuestId(id)) {
            guest.samples = memory_samples(full);
        }
        self
    }

    pub fn kind(mut self, id: u32, kind: GuestKind) -> Self {
        if let Some(guest) = self.guests.iter_mut().find(|g| g.id == GuestId(id)) {
            guest.kind = kind;
        }
        self
    }

    /// Replaces a guest's size, keeping its node's usage in step.
    pub fn resize(mut self, id: u32, cpu: f64, memory_gib: f64, disk_gib: f64) -> Self {
        let size = Resources::new(cpu, memory_gib * GIB, disk_gib * GIB);
        if let Some(guest) = self.guests.iter_mut().find(|g| g.id == GuestId(id)) {
            let old = guest.total;
            guest.total = size;
            guest.used = size;
            if guest.state == GuestState::Running {
                if let Some(host) = self.nodes.iter_mut().find(|n| n.name == guest.node) {
                    host.used = host.used - old + size;
                }
            }
        }
        self
    }

    pub fn offline(mut self, name: &str) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.name == name) {
            node.online = false;
        }
        self
    }

    pub fn guest(self, id: u32, name: &str, node: &str, memory_gib: f64, tags: &[&str]) -> Self {
        self.guest_with_state(id, name, node, memory_gib, tags, GuestState::Running)
    }

    pub fn guest_with_state(
        mut self,
        id: u32,
        name: &str,
        node: &str,
        memory_gib: f64,
        tags: &[&str],
        state: GuestState,
    ) -> Self {
        let size = Resources::new(1.0, memory_gib * GIB, 0.0);
        if state == GuestState::Running {
            if let Some(host) = self.nodes.iter_mut().find(|n| n.name == node) {
                host.used += size;
            }
        }
        self.guests.push(GuestInventory {
            id: GuestId(id),
            name: name.to_string(),
            kind: GuestKind::Vm,
            state,
            node: node.to_string(),
            total: size,
            used: size,
            samples: Vec::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            pools: Vec::new(),
        });
        self
    }

    pub fn inventory(&self) -> ClusterInventory {
        ClusterInventory {
            cluster: "lab".to_string(),
            collected_at: collected_at(),
            nodes: self.nodes.clone(),
            guests: self.guests.clone(),
            ha_rules: Vec::new(),
        }
    }

    pub fn snapshot(&self, config: &BalancingConfig) -> ClusterSnapshot {
        ClusterSnapshot::from_inventory(
            self.inventory(),
            config,
            &PressureEvaluator::new(&PressureSettings::default()),
        )
        .unwrap()
    }
}

pub fn collected_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn memory_samples(full: &[f64]) -> Vec<PressureSample> {
    let last = full.len() as i64 - 1;
    full.iter()
        .enumerate()
        .map(|(i, value)| PressureSample {
            timestamp: collected_at() - chrono::Duration::minutes(5 * (last - i as i64)),
            cpu: ResourceSample::default(),
            memory: ResourceSample::new(0.0, 0.0, *value),
            disk: ResourceSample::default(),
        })
        .collect()
}

/// Memory balancing with the memory-threshold gate off, so only spread decides.
pub fn memory_config(balanciness: f64) -> BalancingConfig {
    BalancingConfig {
        balanciness,
        memory_threshold: None,
        ..BalancingConfig::default()
    }
}

pub fn plan(config: &BalancingConfig, snapshot: &mut ClusterSnapshot) -> (Plan, Resolution) {
    let resolution = ConstraintResolver::new(config).resolve(snapshot);
    let plan = Planner::new(config).plan(snapshot, &resolution);
    (plan, resolution)
}

/// Serves the same inventory on every call.
pub struct StaticCollector {
    pub inventory: ClusterInventory,
    pub calls: AtomicUsize,
}

impl StaticCollector {
    pub fn new(inventory: ClusterInventory) -> Self {
        Self {
            inventory,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SnapshotCollector for StaticCollector {
    async fn collect(&self, cluster: &str) -> Result<ClusterInventory, CollectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if cluster != self.inventory.cluster {
            return Err(CollectionError::Unavailable {
                cluster: cluster.to_string(),
                message: "unknown cluster".to_string(),
                retryable: false,
            });
        }
        Ok(self.inventory.clone())
    }
}

#[derive(Debug, Default)]
pub struct Activity {
    running: usize,
    peak: usize,
    per_node: std::collections::BTreeMap<String, usize>,
    per_node_peak: std::collections::BTreeMap<String, usize>,
}

/// Relocation primitive that records concurrency and can be told to misbehave.
#[derive(Default)]
pub struct MockRelocator {
    pub delay: Duration,
    pub stale: BTreeSet<GuestId>,
    pub failing: BTreeSet<GuestId>,
    pub panicking: BTreeSet<GuestId>,
    /// Targets that fail the preflight node check.
    pub unreachable: BTreeSet<String>,
    /// Relocations stay pending and every poll reports them running.
    pub never_finishes: bool,
    /// Cancelled from inside the first relocation.
    pub cancel_on_first: Option<CancellationToken>,
    pub relocations: AtomicUsize,
    pub abandoned: Mutex<Vec<RelocationHandle>>,
    pub activity: Mutex<Activity>,
}

impl MockRelocator {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn peak(&self) -> usize {
        self.activity.lock().unwrap().peak
    }

    pub fn node_peak(&self, node: &str) -> usize {
        self.activity
            .lock()
            .unwrap()
            .per_node_peak
            .get(node)
            .copied()
            .unwrap_or(0)
    }

    pub fn relocation_count(&self) -> usize {
        self.relocations.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> Vec<RelocationHandle> {
        self.abandoned.lock().unwrap().clone()
    }

    fn enter(&self, request: &RelocationRequest) {
        let mut activity = self.activity.lock().unwrap();
        activity.running += 1;
        activity.peak = activity.peak.max(activity.running);
        for node in [&request.source, &request.target] {
            let count = activity.per_node.entry(node.clone()).or_default();
            *count += 1;
            let count = *count;
            let peak = activity.per_node_peak.entry(node.clone()).or_default();
            *peak = (*peak).max(count);
        }
    }

    fn leave(&self, request: &RelocationRequest) {
        let mut activity = self.activity.lock().unwrap();
        activity.running -= 1;
        for node in [&request.source, &request.target] {
            if let Some(count) = activity.per_node.get_mut(node) {
                *count -= 1;
            }
        }
    }
}

#[async_trait]
impl RelocationPrimitive for MockRelocator {
    async fn preflight(&self, request: &RelocationRequest) -> Result<Preflight, RelocationError> {
        if self.stale.contains(&request.guest) {
            return Ok(Preflight::Stale(format!("guest {} is no longer on {}", request.guest, request.source)));
        }
        if self.unreachable.contains(&request.target) {
            return Ok(Preflight::Stale(format!("target {} is not reachable", request.target)));
        }
        Ok(Preflight::Ready)
    }

    async fn relocate(&self, request: &RelocationRequest) -> Result<RelocationStatus, RelocationError> {
        let call = self.relocations.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            if let Some(token) = &self.cancel_on_first {
                token.cancel();
            }
        }
        if self.panicking.contains(&request.guest) {
            panic!("relocation of {} blew up", request.guest_name);
        }
        if self.never_finishes {
            return Ok(RelocationStatus::Pending(RelocationHandle(request.guest.to_string())));
        }
        self.enter(request);
        tokio::time::sleep(self.delay).await;
        self.leave(request);
        if self.failing.contains(&request.guest) {
            return Err(RelocationError::Failed {
                guest: request.guest_name.clone(),
                message: "target storage not available".to_string(),
            });
        }
        Ok(RelocationStatus::Completed)
    }

    async fn poll(
        &self,
        _request: &RelocationRequest,
        _handle: &RelocationHandle,
    ) -> Result<PollStatus, RelocationError> {
        if self.never_finishes {
            return Ok(PollStatus::Running);
        }
        Ok(PollStatus::Completed)
    }

    async fn abandon(&self, _request: &RelocationRequest, handle: &RelocationHandle) {
        self.abandoned.lock().unwrap().push(handle.clone());
    }
}
