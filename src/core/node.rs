use serde::{Deserialize, Serialize};

use crate::config::balancing::Mode;
use crate::core::resources::Resources;
use crate::monitoring::pressure::PressureMetrics;

/// A cluster member as seen at collection time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub online: bool,
    pub capacity: Resources,
    /// Measured usage.
    pub used: Resources,
    /// Sum of the configured sizes of the running guests on this node.
    pub assigned: Resources,
    pub reserve: Resources,
    #[serde(default)]
    pub pressure: PressureMetrics,
    pub maintenance: bool,
    pub ignored: bool,
}

impl Node {
    pub fn hot(&self) -> bool {
        self.pressure.hot
    }

    pub fn excluded(&self) -> bool {
        self.maintenance || self.ignored
    }

    /// Online and not excluded; only eligible nodes receive guests or count toward spread.
    pub fn eligible(&self) -> bool {
        self.online && !self.excluded()
    }

    /// Capacity minus reserved headroom.
    pub fn limit(&self) -> Resources {
        (self.capacity - self.reserve).saturating()
    }

    pub fn usage(&self, mode: Mode) -> Resources {
        match mode {
            Mode::Assigned => self.assigned,
            Mode::Used | Mode::Pressure => self.used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resources::{Resource, GIB};

    fn node() -> Node {
        Node {
            name: "pve1".into(),
            online: true,
            capacity: Resources::new(16.0, 64.0 * GIB, 1000.0 * GIB),
            used: Resources::new(4.0, 32.0 * GIB, 100.0 * GIB),
            assigned: Resources::new(8.0, 48.0 * GIB, 200.0 * GIB),
            reserve: Resources::new(0.0, 2.0 * GIB, 0.0),
            pressure: PressureMetrics::default(),
            maintenance: false,
            ignored: false,
        }
    }

    #[test]
    fn usage_follows_mode() {
        let n = node();
        assert_eq!(n.usage(Mode::Used).percent_of(&n.capacity, Resource::Memory), 50.0);
        assert_eq!(n.usage(Mode::Assigned).percent_of(&n.capacity, Resource::Memory), 75.0);
        assert_eq!(n.usage(Mode::Pressure), n.used);
        assert_eq!(n.usage(Mode::Used).percent_of(&n.capacity, Resource::Cpu), 25.0);
    }

    #[test]
    fn limit_subtracts_reserve() {
        assert_eq!(node().limit().memory, 62.0 * GIB);
    }

    #[test]
    fn maintenance_node_is_not_eligible() {
        let mut n = node();
        assert!(n.eligible());
        n.maintenance = true;
        assert!(!n.eligible());
    }
}
