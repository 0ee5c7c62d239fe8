//! Monotonic timed waits.
//!
//! The original POSIX implementation configures its condition variables
//! with `CLOCK_MONOTONIC` via `pthread_condattr_setclock` (see
//! `pthread_cond_waitforabit` in the original source) specifically so a
//! wall-clock jump — an NTP step, a user changing the system clock —
//! cannot stall or fire a timed wait early. `std::sync::Condvar::wait_timeout`
//! computes its deadline from `std::time::Instant`, which every platform
//! Rust supports guarantees is monotonic, so this wrapper needs no platform
//! specific clock plumbing; it exists to give the millis-or-forever
//! convention (`-1` means block indefinitely) a single, well named home.

use std::sync::{Condvar, MutexGuard};
use std::time::Duration;

/// `millis < 0` blocks forever on `cond`. `millis >= 0` is a bounded wait of
/// that many milliseconds. Returns the reacquired guard and whether the
/// wait timed out (`true` if the predicate's condition variable was never
/// signaled in time).
pub fn wait<'a, T>(
    cond: &Condvar,
    mut guard: MutexGuard<'a, T>,
    millis: i64,
) -> (MutexGuard<'a, T>, bool) {
    if millis < 0 {
        guard = cond.wait(guard).expect("condvar mutex poisoned");
        (guard, false)
    } else {
        let (guard, timeout) = cond
            .wait_timeout(guard, Duration::from_millis(millis as u64))
            .expect("condvar mutex poisoned");
        (guard, timeout.timed_out())
    }
}

/// Waits on `cond` while `predicate(&*guard)` holds, honoring the same
/// `millis < 0` ⇒ forever convention. Returns the final guard; the caller
/// re-checks the predicate to see whether it was satisfied or the deadline
/// passed first.
pub fn wait_while<'a, T>(
    cond: &Condvar,
    mut guard: MutexGuard<'a, T>,
    millis: i64,
    mut predicate: impl FnMut(&T) -> bool,
) -> MutexGuard<'a, T> {
    if millis < 0 {
        while predicate(&guard) {
            guard = cond.wait(guard).expect("condvar mutex poisoned");
        }
        return guard;
    }

    let deadline = std::time::Instant::now() + Duration::from_millis(millis as u64);
    while predicate(&guard) {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let (next, timeout) = cond
            .wait_timeout(guard, remaining)
            .expect("condvar mutex poisoned");
        guard = next;
        if timeout.timed_out() {
            break;
        }
    }
    guard
}
