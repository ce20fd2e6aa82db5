//! Fixed-period ticks for the background tasks.

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior, interval};

/// Shortest period a background task ticks at. Smaller periods, zero
/// included, are raised to this.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Builds an interval that fires immediately, then every `period`, delaying
/// rather than bursting after a stall.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut ticks = interval(period.max(MIN_TICK_INTERVAL));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks
}
