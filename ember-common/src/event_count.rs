//! Fiber-style wait primitive for coordinator/shard-thread handoff.
//!
//! Waiters block until a caller-supplied predicate over shared state becomes true. Notifiers
//! bump a generation counter under the mutex before waking, so any store sequenced before
//! `notify` is visible to every woken waiter re-checking its predicate.

use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// Condition-variable wrapper with predicate re-check semantics.
#[derive(Debug, Default)]
pub struct EventCount {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl EventCount {
    /// Creates an event count with generation zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes all current waiters.
    pub fn notify(&self) {
        let mut generation = self.generation.lock().expect("event count mutex poisoned");
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.cond.notify_all();
    }

    /// Blocks the calling thread until `pred` returns true.
    pub fn wait<P: FnMut() -> bool>(&self, mut pred: P) {
        let mut guard = self.generation.lock().expect("event count mutex poisoned");
        while !pred() {
            guard = self.cond.wait(guard).expect("event count mutex poisoned");
        }
    }

    /// Blocks until `pred` returns true or `deadline` passes.
    ///
    /// Returns `true` when the predicate was satisfied, `false` on timeout. A deadline at or
    /// before the current instant returns immediately with the predicate's current value.
    pub fn wait_deadline<P: FnMut() -> bool>(&self, mut pred: P, deadline: Instant) -> bool {
        let mut guard = self.generation.lock().expect("event count mutex poisoned");
        loop {
            if pred() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _timeout) = self
                .cond
                .wait_timeout(guard, deadline - now)
                .expect("event count mutex poisoned");
            guard = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EventCount;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    #[rstest]
    fn notify_wakes_blocked_waiter() {
        let ec = Arc::new(EventCount::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let ec = Arc::clone(&ec);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || ec.wait(|| flag.load(Ordering::Acquire)))
        };

        std::thread::sleep(Duration::from_millis(10));
        flag.store(true, Ordering::Release);
        ec.notify();
        waiter.join().expect("waiter thread must finish");
    }

    #[rstest]
    fn wait_deadline_times_out_without_notification() {
        let ec = EventCount::new();
        let satisfied = ec.wait_deadline(|| false, Instant::now() + Duration::from_millis(20));
        assert_that!(satisfied, eq(false));
    }

    #[rstest]
    fn wait_deadline_in_the_past_returns_predicate_value() {
        let ec = EventCount::new();
        assert_that!(ec.wait_deadline(|| true, Instant::now()), eq(true));
        assert_that!(ec.wait_deadline(|| false, Instant::now()), eq(false));
    }
}
