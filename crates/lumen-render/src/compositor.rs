// SPDX-License-Identifier: CEPL-1.0
//! Waiting for the desktop compositor's next composition pass.
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Below this distance to the target the wait busy-polls instead of sleeping.
pub const BUSY_WAIT_WINDOW: Duration = Duration::from_millis(1);

/// Targets further out than this are treated as stale timing data. A
/// compositor interval is at most ~42 ms even at 24 Hz.
pub const MAX_COMPOSITION_WAIT: Duration = Duration::from_millis(250);

/// Source of compositor timing.
pub trait CompositorClock {
    /// Blocks on the OS compositor-clock primitive if the OS has one.
    /// Returns `false` when unavailable so the caller falls back to timing.
    fn wait_for_compositor_clock(&self) -> bool;

    /// When the compositor will next start composing, if known.
    fn next_composition(&self) -> Option<Instant>;

    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Coarse sleep, as precise as the platform's best timer allows.
    fn sleep(&self, duration: Duration);

    /// One iteration of the final busy-poll.
    fn relax(&self) {
        std::thread::yield_now();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositionWait {
    /// Returned from the compositor-clock primitive.
    CompositorClock,
    /// Slept and polled until the scheduled composition time.
    Timed,
    /// Nothing to wait for: no timing data, or the target is past or stale.
    Skipped,
}

/// Blocks until the compositor starts its next composition.
///
/// Never waits longer than [`MAX_COMPOSITION_WAIT`].
pub fn wait_for_next_composition(clock: &dyn CompositorClock) -> CompositionWait {
    if clock.wait_for_compositor_clock() {
        trace!("compositor clock fired");
        return CompositionWait::CompositorClock;
    }

    let Some(target) = clock.next_composition() else {
        return CompositionWait::Skipped;
    };

    let now = clock.now();
    if target <= now {
        return CompositionWait::Skipped;
    }

    let remaining = target - now;
    if remaining > MAX_COMPOSITION_WAIT {
        debug!(?remaining, "next composition too far out; not waiting");
        return CompositionWait::Skipped;
    }

    if remaining > BUSY_WAIT_WINDOW {
        clock.sleep(remaining - BUSY_WAIT_WINDOW);
    }

    while clock.now() < target {
        clock.relax();
    }

    trace!(?remaining, "waited for composition");
    CompositionWait::Timed
}

/// Clock with no compositor information: every wait is skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullCompositorClock;

impl CompositorClock for NullCompositorClock {
    fn wait_for_compositor_clock(&self) -> bool {
        false
    }

    fn next_composition(&self) -> Option<Instant> {
        None
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ManualCompositorClock;

    #[test]
    fn prefers_the_compositor_clock_primitive() {
        let clock = ManualCompositorClock::new();
        clock.set_compositor_clock(true);
        clock.schedule_in(Duration::from_millis(10));

        assert_eq!(wait_for_next_composition(&clock), CompositionWait::CompositorClock);
        assert!(clock.sleeps().is_empty());
        assert_eq!(clock.relax_count(), 0);
    }

    #[test]
    fn sleeps_until_one_millisecond_before_then_polls() {
        let clock = ManualCompositorClock::new();
        clock.schedule_in(Duration::from_millis(10));

        assert_eq!(wait_for_next_composition(&clock), CompositionWait::Timed);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(9)]);
        // 1 ms of polling at the clock's 100 us step.
        assert_eq!(clock.relax_count(), 10);
        assert!(clock.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn short_waits_only_poll() {
        let clock = ManualCompositorClock::new();
        clock.schedule_in(Duration::from_micros(500));

        assert_eq!(wait_for_next_composition(&clock), CompositionWait::Timed);
        assert!(clock.sleeps().is_empty());
        assert_eq!(clock.relax_count(), 5);
    }

    #[test]
    fn past_or_missing_targets_return_immediately() {
        let clock = ManualCompositorClock::new();
        assert_eq!(wait_for_next_composition(&clock), CompositionWait::Skipped);

        clock.schedule_in(Duration::from_millis(5));
        clock.advance(Duration::from_millis(6));
        assert_eq!(wait_for_next_composition(&clock), CompositionWait::Skipped);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn stale_targets_are_not_waited_for() {
        let clock = ManualCompositorClock::new();
        clock.schedule_in(Duration::from_secs(3));

        assert_eq!(wait_for_next_composition(&clock), CompositionWait::Skipped);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn null_clock_skips() {
        assert_eq!(
            wait_for_next_composition(&NullCompositorClock),
            CompositionWait::Skipped
        );
    }
}
