//! Count-based shared/exclusive intent locks.

/// Lock acquisition mode, derived from command flags by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple readers may hold the key concurrently.
    Shared,
    /// Single writer; conflicts with every other holder.
    Exclusive,
}

/// Non-blocking counting lock over one key or one whole shard.
///
/// `acquire` records intent unconditionally and only reports whether the acquisition was
/// uncontended: every member of a shard's tx queue must have its intent registered, even when
/// it cannot run yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntentLock {
    shared: u32,
    exclusive: u32,
}

impl IntentLock {
    /// Whether an acquisition in `mode` would be granted without contention.
    #[must_use]
    pub const fn check(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive == 0,
            LockMode::Exclusive => self.shared == 0 && self.exclusive == 0,
        }
    }

    /// Records one intent in `mode`; returns whether it was granted without contention.
    pub fn acquire(&mut self, mode: LockMode) -> bool {
        let granted = self.check(mode);
        match mode {
            LockMode::Shared => self.shared += 1,
            LockMode::Exclusive => self.exclusive += 1,
        }
        granted
    }

    /// Releases one intent in `mode`.
    pub fn release(&mut self, mode: LockMode) {
        self.release_count(mode, 1);
    }

    /// Releases `count` intents in `mode`.
    pub fn release_count(&mut self, mode: LockMode, count: u32) {
        match mode {
            LockMode::Shared => self.shared = self.shared.saturating_sub(count),
            LockMode::Exclusive => self.exclusive = self.exclusive.saturating_sub(count),
        }
    }

    /// Whether no intent of any mode is held.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }

    /// Current shared intent count.
    #[must_use]
    pub const fn shared_count(&self) -> u32 {
        self.shared
    }

    /// Current exclusive intent count.
    #[must_use]
    pub const fn exclusive_count(&self) -> u32 {
        self.exclusive
    }
}

#[cfg(test)]
mod tests {
    use super::{IntentLock, LockMode};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn shared_holders_coexist() {
        let mut lock = IntentLock::default();
        assert_that!(lock.acquire(LockMode::Shared), eq(true));
        assert_that!(lock.acquire(LockMode::Shared), eq(true));
        assert_that!(lock.shared_count(), eq(2_u32));
    }

    #[rstest]
    fn exclusive_conflicts_with_shared_but_still_records() {
        let mut lock = IntentLock::default();
        assert_that!(lock.acquire(LockMode::Shared), eq(true));
        assert_that!(lock.acquire(LockMode::Exclusive), eq(false));
        assert_that!(lock.exclusive_count(), eq(1_u32));

        lock.release(LockMode::Shared);
        lock.release(LockMode::Exclusive);
        assert_that!(lock.is_free(), eq(true));
    }

    #[rstest]
    fn check_does_not_mutate_counts() {
        let mut lock = IntentLock::default();
        assert_that!(IntentLock::check(&lock, LockMode::Exclusive), eq(true));
        assert_that!(lock.is_free(), eq(true));

        let _ = lock.acquire(LockMode::Exclusive);
        assert_that!(IntentLock::check(&lock, LockMode::Shared), eq(false));
        assert_that!(IntentLock::check(&lock, LockMode::Exclusive), eq(false));
    }

    #[rstest]
    fn release_count_drops_multiple_intents() {
        let mut lock = IntentLock::default();
        let _ = lock.acquire(LockMode::Exclusive);
        let _ = lock.acquire(LockMode::Exclusive);
        lock.release_count(LockMode::Exclusive, 2);
        assert_that!(lock.is_free(), eq(true));
    }
}
