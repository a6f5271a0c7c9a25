pub mod api;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod constraints;
pub mod core;
pub mod errors;
pub mod migration;
pub mod monitoring;
pub mod scheduler;

// Re-exports
pub use api::routes::{create_router, AppState};
pub use cluster::{Analysis, Balancer, ExecutionOutcome};
pub use config::Settings;
pub use errors::{BalancerError, BalancerResult};
