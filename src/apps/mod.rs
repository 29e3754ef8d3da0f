//! Reference applications shipped with the engine.

use std::sync::Arc;

use crate::analysis::ApplicationRegistry;

pub mod daily_summary;
pub mod timeseries_export;

pub use daily_summary::DailySummary;
pub use timeseries_export::TimeseriesExport;

/// Registry holding every built-in application.
pub fn registry() -> ApplicationRegistry {
    let mut registry = ApplicationRegistry::new();
    registry.register(Arc::new(DailySummary));
    registry.register(Arc::new(TimeseriesExport));
    registry
}
