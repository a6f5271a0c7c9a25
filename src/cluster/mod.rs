pub mod balancer;
pub mod collector;

pub use balancer::{Analysis, Balancer, Drift, ExecutionOutcome, ExecutionSummary};
pub use collector::{FileCollector, SnapshotCollector};
