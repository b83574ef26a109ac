// SPDX-License-Identifier: CEPL-1.0
//! Tick arithmetic for performance-counter based compositor timing.
use std::time::{Duration, Instant};

/// How far `target` lies ahead of `now` on a counter running at
/// `frequency` ticks per second. `None` if it is not ahead.
pub fn ticks_until(now: u64, target: u64, frequency: u64) -> Option<Duration> {
    if frequency == 0 || target <= now {
        return None;
    }
    let ticks = target - now;
    let secs = ticks / frequency;
    let nanos = (ticks % frequency) * 1_000_000_000 / frequency;
    Some(Duration::new(secs, nanos as u32))
}

/// Maps a counter timestamp onto the `Instant` timeline. Timestamps at or
/// before `now` map to `instant_now`.
pub fn counter_to_instant(instant_now: Instant, now: u64, target: u64, frequency: u64) -> Instant {
    match ticks_until(now, target, frequency) {
        Some(ahead) => instant_now + ahead,
        None => instant_now,
    }
}
