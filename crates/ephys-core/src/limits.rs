//! Shared timing constants.
//!
//! This module centralizes:
//! - Poll intervals used by cooperative waits (`Future::sleep`, `Future::wait`)
//! - Stage poller bounds
//! - Timeouts used when tearing down background threads
//!
//! Keeping them in one place makes tuning a rig's responsiveness easier.

use std::time::Duration;

// =============================================================================
// Cooperative waits
// =============================================================================

/// Default slice used by `Future::sleep` and `Future::check_stop_within`.
///
/// Bounds how long a stopped task may keep running before it observes the stop.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default slice used by `Future::wait_for` while the caller watches its own stop flag.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// Stage poller
// =============================================================================

/// Fastest position poll, used while a move is in flight (30 ms).
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Slowest position poll, reached by doubling while the stage is idle (300 ms).
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Interval at which a `MoveFuture` monitor thread checks the driver.
pub const MOVE_MONITOR_INTERVAL: Duration = Duration::from_millis(5);

// =============================================================================
// Shutdown
// =============================================================================

/// Timeout for joining worker threads during shutdown (2 seconds).
///
/// Used when stopping pollers, state workers and mock hardware loops to allow
/// cleanup before giving up on the join.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Clamp a requested poll interval to the stage poller bounds.
pub fn clamp_poll_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}
