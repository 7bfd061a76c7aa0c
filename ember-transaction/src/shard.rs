//! Single-threaded shard engine: tx queue, intent locks, blocking control, journal access.
//!
//! An `EngineShard` is owned by exactly one thread of the [`crate::shard_set::ShardSet`]; all
//! of its state is accessed without synchronization. Transactions reach it only through posted
//! closures, and queue progress happens exclusively inside [`EngineShard::poll_execution`].

use std::sync::{Arc, Mutex};

use ember_common::ids::{DbIndex, ShardId, TxId};
use ember_replication::InMemoryJournal;
use ember_storage::{DbSlice, IntentLock};
use tracing::trace;

use crate::blocking::BlockingController;
use crate::transaction::{Transaction, slot_flags};
use crate::tx_queue::TxQueue;

/// Execution counters kept per shard.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShardStats {
    /// Fast-path executions that bypassed the tx queue entirely.
    pub quick_runs: u64,
    /// Executions that ran ahead of older queue entries.
    pub ooo_runs: u64,
}

/// One shard's execution state, owned by its shard thread.
#[derive(Debug)]
pub struct EngineShard {
    shard_id: ShardId,
    txq: TxQueue,
    db_slice: DbSlice,
    shard_lock: IntentLock,
    committed_txid: TxId,
    continuation_trans: Option<Arc<Transaction>>,
    blocking_controller: Option<Box<BlockingController>>,
    journal: Option<Arc<Mutex<InMemoryJournal>>>,
    stats: ShardStats,
}

impl EngineShard {
    /// Creates the shard engine for `shard_id`.
    #[must_use]
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            txq: TxQueue::new(),
            db_slice: DbSlice::new(),
            shard_lock: IntentLock::default(),
            committed_txid: 0,
            continuation_trans: None,
            blocking_controller: None,
            journal: None,
            stats: ShardStats::default(),
        }
    }

    /// Owning shard id.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Transaction queue of this shard.
    #[must_use]
    pub fn txq(&self) -> &TxQueue {
        &self.txq
    }

    /// Mutable transaction queue access.
    pub fn txq_mut(&mut self) -> &mut TxQueue {
        &mut self.txq
    }

    /// Keyspace slice owned by this shard.
    #[must_use]
    pub fn db_slice(&self) -> &DbSlice {
        &self.db_slice
    }

    /// Mutable keyspace slice access.
    pub fn db_slice_mut(&mut self) -> &mut DbSlice {
        &mut self.db_slice
    }

    /// Shard-wide intent lock used by global transactions.
    #[must_use]
    pub fn shard_lock(&self) -> &IntentLock {
        &self.shard_lock
    }

    /// Mutable shard-wide lock access.
    pub fn shard_lock_mut(&mut self) -> &mut IntentLock {
        &mut self.shard_lock
    }

    /// High-water mark: no transaction with a smaller txid may be scheduled here anymore.
    #[must_use]
    pub fn committed_txid(&self) -> TxId {
        self.committed_txid
    }

    /// Execution counters.
    #[must_use]
    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    /// Counts one fast-path execution.
    pub fn inc_quick_run(&mut self) {
        self.stats.quick_runs += 1;
    }

    /// Installs the journal collaborator for this shard.
    pub fn install_journal(&mut self, journal: Arc<Mutex<InMemoryJournal>>) {
        self.journal = Some(journal);
    }

    /// Journal collaborator, when installed.
    #[must_use]
    pub fn journal(&self) -> Option<&Arc<Mutex<InMemoryJournal>>> {
        self.journal.as_ref()
    }

    /// Blocking controller, when any transaction ever watched a key here.
    #[must_use]
    pub fn blocking_controller(&self) -> Option<&BlockingController> {
        self.blocking_controller.as_deref()
    }

    /// Returns the blocking controller, creating it on first use.
    pub fn ensure_blocking_controller(&mut self) -> &mut BlockingController {
        self.blocking_controller.get_or_insert_default()
    }

    /// Marks a watched key as ready for the next notification sweep.
    pub fn awake_watched(&mut self, db: DbIndex, key: &[u8]) {
        if let Some(controller) = self.blocking_controller.as_deref_mut() {
            controller.awake_watched(db, key);
        }
    }

    /// Promotes suspended waiters of keys that became ready.
    pub fn notify_pending(&mut self) {
        let committed_txid = self.committed_txid;
        let sid = self.shard_id;
        if let Some(controller) = self.blocking_controller.as_deref_mut() {
            controller.notify_pending(committed_txid, sid);
        }
    }

    /// Drops `tx` from the watch bookkeeping of `keys`.
    pub fn finalize_watched<'a>(
        &mut self,
        db: DbIndex,
        keys: impl IntoIterator<Item = &'a [u8]>,
        tx: &Transaction,
    ) {
        if let Some(controller) = self.blocking_controller.as_deref_mut() {
            controller.finalize_watched(db, keys, tx);
        }
    }

    /// Whether an awakened waiter is in flight; the tx queue is halted while one is.
    #[must_use]
    pub fn has_awaked_transaction(&self) -> bool {
        self.blocking_controller
            .as_deref()
            .is_some_and(BlockingController::has_awaked_transaction)
    }

    /// Transitions the shard out of multi-transaction mode for `tx`.
    pub fn shutdown_multi(&mut self, tx: &Transaction) {
        let is_tx = self
            .continuation_trans
            .as_ref()
            .is_some_and(|cont| std::ptr::eq(Arc::as_ptr(cont), std::ptr::from_ref(tx)));
        if is_tx {
            self.continuation_trans = None;
        }
    }

    /// Progresses this shard's transaction queue.
    ///
    /// Runs, in order of precedence: an awakened blocker passed as `trans`, the continuation
    /// transaction of a multi-hop in flight, armed queue heads in txid order, and finally
    /// `trans` itself when it is tagged for out-of-order bypass.
    pub fn poll_execution(&mut self, context: &'static str, trans: Option<&Arc<Transaction>>) {
        let sid = self.shard_id;
        trace!(context, shard = sid, "poll execution");
        let mut trans = trans.map(Arc::clone);

        // An awakened blocker runs before anything else so its wake-up stays atomic; the
        // queue below stays halted until it finalizes its watched keys.
        if let Some(candidate) = trans.clone()
            && candidate.local_mask(sid) & slot_flags::AWAKED_Q != 0
            && candidate.is_armed_in_shard(sid)
        {
            trans = None;
            let _keep = candidate.run_in_shard(self);
        }

        if let Some(continuation) = self.continuation_trans.clone() {
            if trans
                .as_ref()
                .is_some_and(|candidate| Arc::ptr_eq(candidate, &continuation))
            {
                trans = None;
            }
            if continuation.is_armed_in_shard(sid) {
                let keep = continuation.run_in_shard(self);
                if !keep {
                    self.continuation_trans = None;
                }
            }
            // Once a multi-hop transaction starts here, nothing else runs until it concludes.
            if self.continuation_trans.is_some() {
                return;
            }
        }

        while !self.has_awaked_transaction() && !self.txq.is_empty() {
            let head = self
                .txq
                .head()
                .map(Arc::clone)
                .expect("non-empty queue has a head");
            if !head.is_armed_in_shard(sid) {
                break;
            }

            let txid = head.txid();
            debug_assert!(
                self.committed_txid < txid,
                "queue order violates the committed watermark"
            );
            self.committed_txid = txid;

            if trans
                .as_ref()
                .is_some_and(|candidate| Arc::ptr_eq(candidate, &head))
            {
                trans = None;
            }

            let keep = head.run_in_shard(self);
            if keep {
                self.continuation_trans = Some(head);
                break;
            }
        }

        // Out-of-order bypass: the caller acquired all of its locks at schedule time, so it
        // cannot observe or disturb the older queue entries it jumps over.
        if let Some(candidate) = trans
            && candidate.is_armed_in_shard(sid)
            && candidate.local_mask(sid) & slot_flags::OUT_OF_ORDER != 0
        {
            let _keep = candidate.run_in_shard(self);
            self.stats.ooo_runs += 1;
        }
    }
}
