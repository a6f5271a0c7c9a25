pub mod balancing;
pub mod settings;

pub use balancing::{BalancingConfig, BalancingOverrides, Method, Mode};
pub use settings::{generate_default_config, OverrideStore, Settings};
