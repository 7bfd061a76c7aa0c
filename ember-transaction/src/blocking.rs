//! Per-shard waiter bookkeeping for blocking commands.
//!
//! The controller tracks which transactions wait on which keys, records keys that became
//! ready, and promotes the first eligible waiter per ready key. While a promoted waiter has
//! not yet finalized its watched keys, the shard halts its tx queue so the wake-up stays
//! atomic relative to later arrivals.

use std::collections::VecDeque;
use std::sync::Arc;

use ember_common::ids::{DbIndex, ShardId, TxId};
use ember_core::containers::{HotMap, HotSet};

use crate::transaction::{Transaction, slot_flags};

type WatchKey = (DbIndex, Vec<u8>);

fn tx_addr(tx: &Transaction) -> usize {
    std::ptr::from_ref(tx) as usize
}

/// Waiter sets of one shard.
#[derive(Debug, Default)]
pub struct BlockingController {
    watch_queues: HotMap<WatchKey, VecDeque<Arc<Transaction>>>,
    pending_keys: Vec<WatchKey>,
    awakened: HotSet<usize>,
}

impl BlockingController {
    /// Creates an empty controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tx` as a waiter for every key.
    pub fn add_watched<'a>(
        &mut self,
        db: DbIndex,
        keys: impl IntoIterator<Item = &'a [u8]>,
        tx: &Arc<Transaction>,
    ) {
        for key in keys {
            let queue = self.watch_queues.entry((db, key.to_vec())).or_default();
            if !queue.iter().any(|waiter| Arc::ptr_eq(waiter, tx)) {
                queue.push_back(Arc::clone(tx));
            }
        }
    }

    /// Marks a watched key as ready; the next [`Self::notify_pending`] sweep promotes a waiter.
    pub fn awake_watched(&mut self, db: DbIndex, key: &[u8]) {
        let watch_key = (db, key.to_vec());
        let has_waiters = self
            .watch_queues
            .get(&watch_key)
            .is_some_and(|queue| !queue.is_empty());
        if has_waiters && !self.pending_keys.contains(&watch_key) {
            self.pending_keys.push(watch_key);
        }
    }

    /// Promotes the first suspended waiter of every ready key.
    ///
    /// One ready key wakes at most one waiter; an already-awakened head consumes the wake.
    pub fn notify_pending(&mut self, committed_txid: TxId, sid: ShardId) {
        let pending = std::mem::take(&mut self.pending_keys);
        for watch_key in pending {
            let mut drop_queue = false;
            if let Some(queue) = self.watch_queues.get_mut(&watch_key) {
                while let Some(front) = queue.front() {
                    if front.local_mask(sid) & slot_flags::EXPIRED_Q != 0 {
                        let _ = queue.pop_front();
                        continue;
                    }
                    let front = Arc::clone(front);
                    if front.notify_suspended(committed_txid, sid) {
                        let _ = self.awakened.insert(tx_addr(&front));
                    }
                    break;
                }
                drop_queue = queue.is_empty();
            }
            if drop_queue {
                let _ = self.watch_queues.remove(&watch_key);
            }
        }
    }

    /// Drops `tx` from the watch queues of `keys` and from the awakened set.
    pub fn finalize_watched<'a>(
        &mut self,
        db: DbIndex,
        keys: impl IntoIterator<Item = &'a [u8]>,
        tx: &Transaction,
    ) {
        for key in keys {
            let watch_key = (db, key.to_vec());
            let mut drop_queue = false;
            if let Some(queue) = self.watch_queues.get_mut(&watch_key) {
                queue.retain(|waiter| tx_addr(waiter) != tx_addr(tx));
                drop_queue = queue.is_empty();
            }
            if drop_queue {
                let _ = self.watch_queues.remove(&watch_key);
            }
        }
        let _ = self.awakened.remove(&tx_addr(tx));
    }

    /// Whether any promoted waiter has not yet finalized; halts the shard's tx queue.
    #[must_use]
    pub fn has_awaked_transaction(&self) -> bool {
        !self.awakened.is_empty()
    }

    /// Whether `tx` is currently promoted.
    #[must_use]
    pub fn is_awaked(&self, tx: &Transaction) -> bool {
        self.awakened.contains(&tx_addr(tx))
    }

    /// Number of waiters currently registered for one key.
    #[must_use]
    pub fn watcher_count(&self, db: DbIndex, key: &[u8]) -> usize {
        self.watch_queues
            .get(&(db, key.to_vec()))
            .map_or(0, VecDeque::len)
    }
}
