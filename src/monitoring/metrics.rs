/*
* Pressure samples
* ----------------
* Raw time series handed to us by the snapshot collector. Every sample carries
* utilization plus the kernel-style "some" and "full" stall percentages for
* cpu, memory and disk. A value the collector could not read stays `None`; the
* evaluator counts it as zero.
*/

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::resources::Resource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    #[serde(default)]
    pub utilization: Option<f64>,
    #[serde(default)]
    pub some: Option<f64>,
    #[serde(default)]
    pub full: Option<f64>,
}

impl ResourceSample {
    pub fn new(utilization: f64, some: f64, full: f64) -> Self {
        Self {
            utilization: Some(utilization),
            some: Some(some),
            full: Some(full),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureSample {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cpu: ResourceSample,
    #[serde(default)]
    pub memory: ResourceSample,
    #[serde(default)]
    pub disk: ResourceSample,
}

impl PressureSample {
    pub fn get(&self, resource: Resource) -> &ResourceSample {
        match resource {
            Resource::Cpu => &self.cpu,
            Resource::Memory => &self.memory,
            Resource::Disk => &self.disk,
        }
    }
}

/// Samples inside `(now - window, now]`, oldest first.
pub fn samples_in_window(
    samples: &[PressureSample],
    now: DateTime<Utc>,
    window: Duration,
) -> Vec<&PressureSample> {
    let start = now - window;
    let mut recent: Vec<&PressureSample> = samples
        .iter()
        .filter(|s| s.timestamp > start && s.timestamp <= now)
        .collect();
    recent.sort_by_key(|s| s.timestamp);
    recent
}
