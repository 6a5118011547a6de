//! Core environment context trait for TrackView components.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the host run-loop so the scheduler and session can
/// run in both production (tokio) and simulation (virtual clock).
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `tokio::task`
/// - **Simulation**: `SimContext` - a manually advanced virtual clock
#[async_trait]
pub trait TrackViewContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for the scheduler's yield budget, the session's staleness
    /// watchdog and the heartbeat timer.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// Used to compute the server clock offset from a timestamp echo.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Gives control back to the host run-loop for one turn.
    ///
    /// The scheduler calls this after its time budget is spent.
    async fn yield_now(&self);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
