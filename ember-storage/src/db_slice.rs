//! Shard-owned keyspace slice: per-db intent lock table plus a minimal data plane.
//!
//! The coordinator only depends on the lock surface (`check_lock`/`acquire`/`release`). The
//! string and list operations are the small data plane that shard callbacks drive; full
//! command semantics live outside this crate.

use std::collections::VecDeque;

use ember_common::ids::DbIndex;
use ember_core::args::ShardArgs;
use ember_core::containers::{HotMap, HotSet};

use crate::intent_lock::{IntentLock, LockMode};

/// Key set a transaction locks on one shard.
///
/// `args` is the transaction's shard-grouped argument span; `key_step` tells how to walk it
/// (step 2 skips the value that accompanies each key in pair-style commands).
#[derive(Debug, Clone)]
pub struct KeyLockArgs {
    /// Target database.
    pub db: DbIndex,
    /// Distance between consecutive key positions inside `args`.
    pub key_step: u32,
    /// Shard-grouped argument span holding the keys.
    pub args: ShardArgs,
}

impl KeyLockArgs {
    /// Iterates the key positions of the span, honoring `key_step`.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        let step = usize::try_from(self.key_step.max(1)).unwrap_or(1);
        (0..self.args.len())
            .step_by(step)
            .map(|index| self.args.get(index))
    }
}

#[derive(Debug, Default)]
struct DbTable {
    locks: HotMap<Vec<u8>, IntentLock>,
    strings: HotMap<Vec<u8>, Vec<u8>>,
    lists: HotMap<Vec<u8>, VecDeque<Vec<u8>>>,
}

/// Keyspace partition owned by exactly one shard thread.
#[derive(Debug, Default)]
pub struct DbSlice {
    tables: HotMap<DbIndex, DbTable>,
}

impl DbSlice {
    /// Creates an empty slice.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every key in `lock_args` could be acquired in `mode` without contention.
    #[must_use]
    pub fn check_lock(&self, mode: LockMode, lock_args: &KeyLockArgs) -> bool {
        let Some(table) = self.tables.get(&lock_args.db) else {
            return true;
        };
        lock_args
            .keys()
            .all(|key| table.locks.get(key).is_none_or(|lock| lock.check(mode)))
    }

    /// Records intent on every distinct key in `lock_args`.
    ///
    /// Returns whether all acquisitions were granted without contention. Intent is recorded
    /// even on contention because every tx-queue member must have its locks registered.
    pub fn acquire(&mut self, mode: LockMode, lock_args: &KeyLockArgs) -> bool {
        let table = self.tables.entry(lock_args.db).or_default();
        let mut seen = HotSet::new();
        let mut granted = true;
        for key in lock_args.keys() {
            if !seen.insert(key.to_vec()) {
                continue;
            }
            granted &= table.locks.entry(key.to_vec()).or_default().acquire(mode);
        }
        granted
    }

    /// Releases one intent in `mode` for every distinct key in `lock_args`.
    pub fn release(&mut self, mode: LockMode, lock_args: &KeyLockArgs) {
        let mut seen = HotSet::new();
        let keys = lock_args
            .keys()
            .filter(|key| seen.insert(key.to_vec()))
            .map(<[u8]>::to_vec)
            .collect::<Vec<_>>();
        for key in keys {
            self.release_key(mode, lock_args.db, &key, 1);
        }
    }

    /// Releases `count` intents in `mode` for a single key.
    pub fn release_key(&mut self, mode: LockMode, db: DbIndex, key: &[u8], count: u32) {
        let Some(table) = self.tables.get_mut(&db) else {
            return;
        };
        let mut drop_entry = false;
        if let Some(lock) = table.locks.get_mut(key) {
            lock.release_count(mode, count);
            drop_entry = lock.is_free();
        }
        if drop_entry {
            let _ = table.locks.remove(key);
        }
    }

    /// Current lock state of one key, when any intent is held.
    #[must_use]
    pub fn lock_state(&self, db: DbIndex, key: &[u8]) -> Option<IntentLock> {
        self.tables.get(&db)?.locks.get(key).copied()
    }

    /// Whether the lock table of `db` holds no intents at all.
    #[must_use]
    pub fn is_lock_table_empty(&self, db: DbIndex) -> bool {
        self.tables
            .get(&db)
            .is_none_or(|table| table.locks.is_empty())
    }

    /// Stores a string value.
    pub fn set_string(&mut self, db: DbIndex, key: Vec<u8>, value: Vec<u8>) {
        let _ = self
            .tables
            .entry(db)
            .or_default()
            .strings
            .insert(key, value);
    }

    /// Reads a string value.
    #[must_use]
    pub fn get_string(&self, db: DbIndex, key: &[u8]) -> Option<Vec<u8>> {
        self.tables.get(&db)?.strings.get(key).cloned()
    }

    /// Appends one element to the tail of a list, returning the new length.
    pub fn list_push_back(&mut self, db: DbIndex, key: Vec<u8>, value: Vec<u8>) -> usize {
        let list = self.tables.entry(db).or_default().lists.entry(key).or_default();
        list.push_back(value);
        list.len()
    }

    /// Pops the head of a list; empty lists are removed.
    pub fn list_pop_front(&mut self, db: DbIndex, key: &[u8]) -> Option<Vec<u8>> {
        let table = self.tables.get_mut(&db)?;
        let list = table.lists.get_mut(key)?;
        let value = list.pop_front();
        if list.is_empty() {
            let _ = table.lists.remove(key);
        }
        value
    }

    /// Current length of a list.
    #[must_use]
    pub fn list_len(&self, db: DbIndex, key: &[u8]) -> usize {
        self.tables
            .get(&db)
            .and_then(|table| table.lists.get(key))
            .map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::{DbSlice, KeyLockArgs};
    use crate::intent_lock::LockMode;
    use ember_core::args::ShardArgs;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn lock_args(db: u16, step: u32, items: &[&[u8]]) -> KeyLockArgs {
        let seq = Arc::new(items.iter().map(|item| item.to_vec()).collect::<Vec<_>>());
        KeyLockArgs {
            db,
            key_step: step,
            args: ShardArgs::full(seq),
        }
    }

    #[rstest]
    fn step_two_locks_only_key_positions() {
        let mut slice = DbSlice::new();
        let largs = lock_args(0, 2, &[b"k1", b"v1", b"k2", b"v2"]);

        assert_that!(slice.acquire(LockMode::Exclusive, &largs), eq(true));
        assert_that!(slice.lock_state(0, b"k1").is_some(), eq(true));
        assert_that!(slice.lock_state(0, b"k2").is_some(), eq(true));
        assert_that!(slice.lock_state(0, b"v1").is_none(), eq(true));

        slice.release(LockMode::Exclusive, &largs);
        assert_that!(slice.is_lock_table_empty(0), eq(true));
    }

    #[rstest]
    fn duplicate_keys_record_one_intent_per_acquire() {
        let mut slice = DbSlice::new();
        let largs = lock_args(0, 1, &[b"k", b"k"]);

        assert_that!(slice.acquire(LockMode::Exclusive, &largs), eq(true));
        let state = slice.lock_state(0, b"k").expect("intent must be recorded");
        assert_that!(state.exclusive_count(), eq(1_u32));

        slice.release(LockMode::Exclusive, &largs);
        assert_that!(slice.is_lock_table_empty(0), eq(true));
    }

    #[rstest]
    fn contended_acquire_records_intent_and_reports_conflict() {
        let mut slice = DbSlice::new();
        let first = lock_args(0, 1, &[b"x"]);
        let second = lock_args(0, 1, &[b"x", b"y"]);

        assert_that!(slice.acquire(LockMode::Exclusive, &first), eq(true));
        assert_that!(slice.check_lock(LockMode::Exclusive, &second), eq(false));
        assert_that!(slice.acquire(LockMode::Exclusive, &second), eq(false));

        let state = slice.lock_state(0, b"x").expect("both intents recorded");
        assert_that!(state.exclusive_count(), eq(2_u32));
        assert_that!(slice.lock_state(0, b"y").is_some(), eq(true));
    }

    #[rstest]
    fn release_key_is_noop_for_unknown_keys() {
        let mut slice = DbSlice::new();
        slice.release_key(LockMode::Shared, 0, b"missing", 3);
        assert_that!(slice.is_lock_table_empty(0), eq(true));
    }

    #[rstest]
    fn string_and_list_plane_round_trip() {
        let mut slice = DbSlice::new();
        slice.set_string(0, b"k".to_vec(), b"v".to_vec());
        assert_that!(slice.get_string(0, b"k"), eq(&Some(b"v".to_vec())));
        assert_that!(slice.get_string(1, b"k"), eq(&None::<Vec<u8>>));

        assert_that!(slice.list_push_back(0, b"q".to_vec(), b"1".to_vec()), eq(1_usize));
        assert_that!(slice.list_push_back(0, b"q".to_vec(), b"2".to_vec()), eq(2_usize));
        assert_that!(slice.list_pop_front(0, b"q"), eq(&Some(b"1".to_vec())));
        assert_that!(slice.list_len(0, b"q"), eq(1_usize));
        assert_that!(slice.list_pop_front(0, b"q"), eq(&Some(b"2".to_vec())));
        assert_that!(slice.list_pop_front(0, b"q"), eq(&None::<Vec<u8>>));
    }
}
