//! Per-shard ordered queue of scheduled transactions.

use std::collections::BTreeMap;
use std::sync::Arc;

use ember_common::ids::TxId;

use crate::transaction::Transaction;

/// Position token of a queued entry. The queue is keyed by txid, so the score doubles as the
/// token; a slot stores `None` as its END sentinel.
pub type QueuePos = TxId;

/// Ordered collection of scheduled transactions keyed by txid ascending.
///
/// Generic over the stored value so queue mechanics stay testable with plain scores; shard
/// engines instantiate it with transaction handles.
#[derive(Debug)]
pub struct TxQueue<T = Arc<Transaction>> {
    entries: BTreeMap<TxId, T>,
}

impl<T> Default for TxQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TxQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Inserts a value under `score` and returns its position token.
    pub fn insert(&mut self, score: TxId, value: T) -> QueuePos {
        let _previous = self.entries.insert(score, value);
        debug_assert!(_previous.is_none(), "txid must be unique per shard queue");
        score
    }

    /// Removes and returns the entry at `pos`.
    pub fn remove(&mut self, pos: QueuePos) -> Option<T> {
        self.entries.remove(&pos)
    }

    /// Entry with the smallest txid.
    #[must_use]
    pub fn head(&self) -> Option<&T> {
        self.entries.values().next()
    }

    /// Smallest queued txid.
    #[must_use]
    pub fn head_score(&self) -> Option<TxId> {
        self.entries.keys().next().copied()
    }

    /// Largest queued txid.
    #[must_use]
    pub fn tail_score(&self) -> Option<TxId> {
        self.entries.keys().next_back().copied()
    }

    /// Entry at `pos`, when present.
    #[must_use]
    pub fn at(&self, pos: QueuePos) -> Option<&T> {
        self.entries.get(&pos)
    }

    /// Whether the queue holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::TxQueue;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn queue_orders_entries_by_txid() {
        let mut queue = TxQueue::<u64>::new();
        let _ = queue.insert(30, 300);
        let _ = queue.insert(10, 100);
        let _ = queue.insert(20, 200);

        assert_that!(queue.len(), eq(3_usize));
        assert_that!(queue.head_score(), eq(Some(10_u64)));
        assert_that!(queue.tail_score(), eq(Some(30_u64)));
        assert_that!(queue.head(), eq(Some(&100_u64)));
    }

    #[rstest]
    fn remove_by_token_keeps_remaining_order() {
        let mut queue = TxQueue::<u64>::new();
        let first = queue.insert(1, 11);
        let second = queue.insert(2, 22);

        assert_that!(queue.remove(first), eq(Some(11_u64)));
        assert_that!(queue.head_score(), eq(Some(2_u64)));
        assert_that!(queue.at(second), eq(Some(&22_u64)));
        assert_that!(queue.remove(second), eq(Some(22_u64)));
        assert_that!(queue.is_empty(), eq(true));
    }

    #[rstest]
    fn remove_of_unknown_token_is_noop() {
        let mut queue = TxQueue::<u64>::new();
        let _ = queue.insert(5, 55);
        assert_that!(queue.remove(6), eq(None::<u64>));
        assert_that!(queue.len(), eq(1_usize));
    }
}
