use once_cell::sync::Lazy;
use std::sync::Arc;

pub mod collector;

pub use collector::{EndpointSnapshot, MetricsCollector, MetricsSnapshot};

/// Global metrics instance for the application
static GLOBAL_METRICS: Lazy<Arc<MetricsCollector>> =
    Lazy::new(|| Arc::new(MetricsCollector::new()));

/// Get the global metrics collector
pub fn global() -> Arc<MetricsCollector> {
    GLOBAL_METRICS.clone()
}
