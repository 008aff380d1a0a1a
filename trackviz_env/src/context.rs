//! Core environment context trait for TrackViz tasks.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};

/// The central interface for time.
///
/// Fetchers pace themselves with `sleep()` and the consumer stamps rounds with
/// `system_time()`, so swapping the context swaps the clock for the whole
/// pipeline.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the system clock
/// - **Simulation**: `SimContext` - virtual clock advanced by `sleep()`
#[async_trait]
pub trait TrackVizContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for round timestamps and log file names.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock and yields
    async fn sleep(&self, duration: Duration);
}
