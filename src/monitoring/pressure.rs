use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::metrics::{samples_in_window, PressureSample, ResourceSample};
use crate::config::settings::{PressureSettings, PressureThresholds};
use crate::core::resources::Resource;

/// Weight of "some" pressure relative to "full" in the pressure load.
pub const SOME_WEIGHT: f64 = 0.5;
pub const FULL_WEIGHT: f64 = 1.0;

/// Longest sample window accepted, thirty days.
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcePressure {
    pub avg_utilization: f64,
    pub avg_some: f64,
    pub avg_full: f64,
    /// Highest "full" value among the most recent samples.
    pub spike_full: f64,
    pub hot: bool,
}

impl ResourcePressure {
    pub fn load(&self) -> f64 {
        self.avg_full * FULL_WEIGHT + self.avg_some * SOME_WEIGHT
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureMetrics {
    pub cpu: ResourcePressure,
    pub memory: ResourcePressure,
    pub disk: ResourcePressure,
    pub hot: bool,
    pub samples: usize,
}

impl PressureMetrics {
    pub fn get(&self, resource: Resource) -> &ResourcePressure {
        match resource {
            Resource::Cpu => &self.cpu,
            Resource::Memory => &self.memory,
            Resource::Disk => &self.disk,
        }
    }

    fn get_mut(&mut self, resource: Resource) -> &mut ResourcePressure {
        match resource {
            Resource::Cpu => &mut self.cpu,
            Resource::Memory => &mut self.memory,
            Resource::Disk => &mut self.disk,
        }
    }

    pub fn load(&self, resource: Resource) -> f64 {
        self.get(resource).load()
    }
}

/// Turns raw samples into averages, spikes and hot flags.
#[derive(Debug, Clone)]
pub struct PressureEvaluator {
    window: Duration,
    spike_samples: usize,
    thresholds: PressureThresholds,
}

impl PressureEvaluator {
    pub fn new(settings: &PressureSettings) -> Self {
        Self {
            window: Duration::seconds(settings.window_secs.min(MAX_WINDOW_SECS) as i64),
            spike_samples: settings.spike_samples.max(1),
            thresholds: settings.thresholds,
        }
    }

    pub fn evaluate(&self, samples: &[PressureSample], now: DateTime<Utc>) -> PressureMetrics {
        let recent = samples_in_window(samples, now, self.window);
        let mut metrics = PressureMetrics {
            samples: recent.len(),
            ..PressureMetrics::default()
        };
        if recent.is_empty() {
            return metrics;
        }

        let count = recent.len() as f64;
        let spike_from = recent.len().saturating_sub(self.spike_samples);
        for resource in Resource::ALL {
            let values: Vec<&ResourceSample> = recent.iter().map(|s| s.get(resource)).collect();
            let sum = |pick: fn(&ResourceSample) -> Option<f64>| -> f64 {
                values.iter().map(|v| pick(*v).unwrap_or(0.0)).sum()
            };

            let threshold = self.thresholds.get(resource);
            let entry = metrics.get_mut(resource);
            entry.avg_utilization = sum(|v| v.utilization) / count;
            entry.avg_some = sum(|v| v.some) / count;
            entry.avg_full = sum(|v| v.full) / count;
            entry.spike_full = values[spike_from..]
                .iter()
                .map(|v| v.full.unwrap_or(0.0))
                .fold(0.0, f64::max);
            entry.hot = entry.avg_some > threshold.some
                || entry.avg_full > threshold.full
                || entry.spike_full > threshold.spike;
        }
        metrics.hot = Resource::ALL.iter().any(|r| metrics.get(*r).hot);

        if metrics.hot {
            debug!(
                cpu_full = metrics.cpu.avg_full,
                memory_full = metrics.memory.avg_full,
                disk_full = metrics.disk.avg_full,
                "Entity flagged hot"
            );
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(now: DateTime<Utc>, minutes_ago: i64, memory: ResourceSample) -> PressureSample {
        PressureSample {
            timestamp: now - Duration::minutes(minutes_ago),
            cpu: ResourceSample::default(),
            memory,
            disk: ResourceSample::default(),
        }
    }

    fn evaluator() -> PressureEvaluator {
        PressureEvaluator::new(&PressureSettings::default())
    }

    #[test]
    fn no_samples_is_cold() {
        let metrics = evaluator().evaluate(&[], Utc::now());
        assert!(!metrics.hot);
        assert_eq!(metrics.samples, 0);
    }

    #[test]
    fn missing_values_count_as_zero() {
        let now = Utc::now();
        let samples = vec![
            at(now, 20, ResourceSample::new(60.0, 12.0, 4.0)),
            at(
                now,
                10,
                ResourceSample {
                    utilization: Some(40.0),
                    some: None,
                    full: None,
                },
            ),
        ];
        let metrics = evaluator().evaluate(&samples, now);
        assert_eq!(metrics.memory.avg_utilization, 50.0);
        assert_eq!(metrics.memory.avg_some, 6.0);
        assert_eq!(metrics.memory.avg_full, 2.0);
    }

    #[test]
    fn recent_spike_marks_hot() {
        let now = Utc::now();
        let mut samples: Vec<PressureSample> = (1..=10)
            .map(|i| at(now, i * 5, ResourceSample::new(30.0, 1.0, 0.0)))
            .collect();
        samples.push(at(now, 1, ResourceSample::new(30.0, 1.0, 45.0)));
        let metrics = evaluator().evaluate(&samples, now);
        assert_eq!(metrics.memory.spike_full, 45.0);
        assert!(metrics.memory.hot);
        assert!(metrics.hot);
        assert!(!metrics.cpu.hot);
    }

    #[test]
    fn spike_outside_recent_samples_is_ignored() {
        let now = Utc::now();
        let mut samples: Vec<PressureSample> = (1..=6)
            .map(|i| at(now, i, ResourceSample::new(30.0, 1.0, 0.0)))
            .collect();
        samples.push(at(now, 50, ResourceSample::new(30.0, 1.0, 45.0)));
        let metrics = evaluator().evaluate(&samples, now);
        assert_eq!(metrics.memory.spike_full, 0.0);
        assert!(!metrics.memory.hot);
    }

    #[test]
    fn oversized_window_is_clamped() {
        let settings = PressureSettings {
            window_secs: u64::MAX / 2,
            ..PressureSettings::default()
        };
        let now = Utc::now();
        let samples = vec![at(now, 60 * 24 * 40, ResourceSample::new(10.0, 5.0, 5.0))];
        let metrics = PressureEvaluator::new(&settings).evaluate(&samples, now);
        assert_eq!(metrics.samples, 0);
    }

    #[test]
    fn full_pressure_outweighs_some() {
        let pressure = ResourcePressure {
            avg_some: 10.0,
            avg_full: 10.0,
            ..ResourcePressure::default()
        };
        assert_eq!(pressure.load(), 15.0);
    }
}
