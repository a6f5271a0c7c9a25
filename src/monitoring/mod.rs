pub mod metrics;
pub mod pressure;

pub use metrics::{PressureSample, ResourceSample};
pub use pressure::{PressureEvaluator, PressureMetrics, ResourcePressure};
