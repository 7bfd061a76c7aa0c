//! The transaction coordinator state machine.
//!
//! One `Transaction` is created per client command and shared between the coordinator fiber
//! and the shard threads it fans out to. The coordinator holds one strong handle and every
//! posted shard closure holds one more, so a shard task may outlive the coordinator call that
//! armed it.
//!
//! Cross-thread publication contract: the coordinator mutates per-shard slots only while no
//! slot is armed, then publishes a hop by storing `run_count` with release ordering and
//! posting closures (posting itself crosses the channel barrier). Shard tasks first check
//! `is_armed_in_shard` (acquire on `run_count`), then the hop generation in `seqlock`, and
//! only then touch slot state.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ember_common::error::{OpResult, OpStatus};
use ember_common::event_count::EventCount;
use ember_common::ids::{DbIndex, ShardId, TxId};
use ember_core::args::{ArgSeq, ShardArgs};
use ember_core::command::{CmdFlags, CommandId};
use ember_core::containers::{HotMap, HotSet};
use ember_core::sharding::shard_of;
use ember_replication::{JournalOp, JournalPayload};
use ember_storage::{KeyLockArgs, LockMode};
use tracing::{debug, error, trace};

use crate::key_index::{KeyIndex, determine_keys};
use crate::shard::EngineShard;
use crate::shard_set::ShardSet;
use crate::tx_queue::QueuePos;

/// Process-wide monotonic transaction id source.
static OP_SEQ: AtomicU64 = AtomicU64::new(1);

const MUTEX_POISONED: &str = "transaction mutex poisoned";

/// Per-shard slot state bits (`local_mask`).
pub mod slot_flags {
    /// The shard participates in the current hop.
    pub const ACTIVE: u16 = 1;
    /// Key intent locks of this shard are recorded for the transaction.
    pub const KEYLOCK_ACQUIRED: u16 = 1 << 1;
    /// The transaction is suspended on watched keys of this shard.
    pub const SUSPENDED_Q: u16 = 1 << 2;
    /// A shard-side notification promoted the transaction out of suspension.
    pub const AWAKED_Q: u16 = 1 << 3;
    /// The blocking wait expired before a notification arrived.
    pub const EXPIRED_Q: u16 = 1 << 4;
    /// All locks were granted at schedule time; the transaction may bypass queue order.
    pub const OUT_OF_ORDER: u16 = 1 << 5;
}

/// Coordinator state bits.
mod coord_flags {
    pub const SCHED: u8 = 1;
    pub const EXEC: u8 = 1 << 1;
    pub const EXEC_CONCLUDING: u8 = 1 << 2;
    pub const BLOCKED: u8 = 1 << 3;
    pub const CANCELLED: u8 = 1 << 4;
    pub const OOO: u8 = 1 << 5;
}

/// Callback invoked on every participating shard thread during one hop.
pub type RunnableFn = Arc<dyn Fn(&Transaction, &mut EngineShard) -> OpStatus + Send + Sync>;

/// Produces the watched key set of a blocking transaction on one shard.
pub type WaitKeysProvider = Arc<dyn Fn(&Transaction, &EngineShard) -> Vec<Vec<u8>> + Send + Sync>;

/// Locking regime of a multi-command transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiMode {
    /// Mode not yet chosen; set by one of the `start_multi_*` entry points.
    NotDetermined,
    /// Take every shard-wide lock up front; hops skip per-key locks.
    Global,
    /// Lock the full key set at start; hops run without further lock traffic.
    LockAhead,
    /// Each hop locks its own keys on entry; everything unlocks together at the end.
    LockIncremental,
    /// No cross-hop atomicity; every hop schedules like an independent transaction.
    NonAtomic,
}

/// Intent counts accumulated per key across the hops of a multi transaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LockCounts {
    /// Shared intents held.
    pub shared: u32,
    /// Exclusive intents held.
    pub exclusive: u32,
}

impl LockCounts {
    fn bump(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared += 1,
            LockMode::Exclusive => self.exclusive += 1,
        }
    }
}

/// State carried only by `MULTI`/`EXEC` and scripting transactions.
#[derive(Debug)]
struct MultiData {
    mode: MultiMode,
    /// Keys locked for the whole transaction, released together by `unlock_multi`.
    lock_counts: HotMap<Vec<u8>, LockCounts>,
    /// Scratch list of keys collected per hop under incremental locking.
    keys: Vec<Vec<u8>>,
    /// Per shard: whether a journal record was written during this multi.
    shard_journal_write: Vec<bool>,
    /// Once set, key collection stops repeating across hops.
    locks_recorded: bool,
    /// Guards `unlock_multi` against re-issue.
    unlocked: bool,
}

/// Slot state owned logically by one shard thread while the slot is armed.
#[derive(Debug, Default)]
struct SlotState {
    local_mask: u16,
    pq_pos: Option<QueuePos>,
    /// `(start, count)` into the shard-grouped args; `None` means the entire sequence.
    args: Option<(u32, u32)>,
}

/// Per-shard slot of a transaction.
#[derive(Debug, Default)]
struct PerShardData {
    is_armed: AtomicBool,
    state: Mutex<SlotState>,
}

/// Scratch bucket used while distributing arguments to shards.
#[derive(Debug, Default)]
struct PerShardCache {
    args: Vec<Vec<u8>>,
    original_index: Vec<u32>,
    requested_active: bool,
}

impl PerShardCache {
    fn clear(&mut self) {
        self.args.clear();
        self.original_index.clear();
        self.requested_active = false;
    }
}

thread_local! {
    static TMP_SHARD_INDEX: RefCell<Vec<PerShardCache>> = RefCell::new(Vec::new());
}

fn with_shard_index<R>(len: usize, f: impl FnOnce(&mut [PerShardCache]) -> R) -> R {
    TMP_SHARD_INDEX.with(|cell| {
        let mut cache = cell.borrow_mut();
        cache.resize_with(len, PerShardCache::default);
        for bucket in cache.iter_mut() {
            bucket.clear();
        }
        f(&mut cache[..len])
    })
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

fn log_out_of_memory_throttled() {
    static OOM_EVENTS: AtomicU64 = AtomicU64::new(0);
    static LAST_LOGGED_SEC: AtomicU64 = AtomicU64::new(0);

    let event = OOM_EVENTS.fetch_add(1, Ordering::Relaxed);
    let now_sec = unix_now_ms() / 1000;
    if event % 16 == 0 && LAST_LOGGED_SEC.swap(now_sec, Ordering::Relaxed) != now_sec {
        error!("out of memory during shard callback");
    }
}

/// A unit of work touching one or more keys across one or more shards.
pub struct Transaction {
    cid: Mutex<CommandId>,
    shard_set: Arc<ShardSet>,

    db_index: AtomicU16,
    global: AtomicBool,

    /// Original argument sequence, read-only once init returns.
    full_args: Mutex<ArgSeq>,
    /// Concatenated, shard-grouped argument sequence used during execution.
    args: Mutex<ArgSeq>,
    /// Maps positions in `args` back to positions in `full_args` minus one.
    reverse_index: Mutex<Vec<u32>>,

    shard_data: RwLock<Vec<PerShardData>>,
    unique_shard_cnt: AtomicU32,
    unique_shard_id: AtomicU16,

    txid: AtomicU64,
    time_now_ms: AtomicU64,
    coordinator_state: AtomicU8,

    run_count: AtomicU32,
    run_ec: EventCount,
    /// Hop generation; lets late-arriving shard tasks detect they belong to a prior hop.
    seqlock: AtomicU32,

    local_result: Mutex<OpStatus>,
    cb: Mutex<Option<RunnableFn>>,

    multi: Option<Mutex<MultiData>>,

    notify_txid: AtomicU64,
    blocking_ec: EventCount,

    reenabled_auto_journal: AtomicBool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name())
            .field("txid", &self.txid())
            .field("unique_shard_cnt", &self.unique_shard_cnt())
            .finish_non_exhaustive()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        trace!("transaction {} destroyed", self.debug_id());
    }
}

impl Transaction {
    /// Creates a transaction for one command.
    ///
    /// `EXEC`, `EVAL` and `EVALSHA` transactions carry multi-command state; everything else
    /// is single-command.
    #[must_use]
    pub fn new(cid: CommandId, shard_set: Arc<ShardSet>) -> Arc<Self> {
        let multi = matches!(cid.name(), "EXEC" | "EVAL" | "EVALSHA").then(|| {
            Mutex::new(MultiData {
                mode: MultiMode::NotDetermined,
                lock_counts: HotMap::new(),
                keys: Vec::new(),
                shard_journal_write: vec![false; shard_set.size()],
                locks_recorded: false,
                unlocked: false,
            })
        });
        Arc::new(Self {
            cid: Mutex::new(cid),
            shard_set,
            db_index: AtomicU16::new(0),
            global: AtomicBool::new(false),
            full_args: Mutex::new(Arc::new(Vec::new())),
            args: Mutex::new(Arc::new(Vec::new())),
            reverse_index: Mutex::new(Vec::new()),
            shard_data: RwLock::new(Vec::new()),
            unique_shard_cnt: AtomicU32::new(0),
            unique_shard_id: AtomicU16::new(0),
            txid: AtomicU64::new(0),
            time_now_ms: AtomicU64::new(0),
            coordinator_state: AtomicU8::new(0),
            run_count: AtomicU32::new(0),
            run_ec: EventCount::new(),
            seqlock: AtomicU32::new(0),
            local_result: Mutex::new(OpStatus::Ok),
            cb: Mutex::new(None),
            multi,
            notify_txid: AtomicU64::new(u64::MAX),
            blocking_ec: EventCount::new(),
            reenabled_auto_journal: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Command name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.cid_snapshot().name()
    }

    /// Transaction id; zero while unscheduled.
    #[must_use]
    pub fn txid(&self) -> TxId {
        self.txid.load(Ordering::Relaxed)
    }

    /// Target database.
    #[must_use]
    pub fn db_index(&self) -> DbIndex {
        self.db_index.load(Ordering::Relaxed)
    }

    /// Lock mode derived from the command's readonly flag.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        if self.cid_snapshot().flags().contains(CmdFlags::READONLY) {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }

    /// Whether the transaction takes the shard-wide barrier on every shard.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.global.load(Ordering::Relaxed)
    }

    /// Whether the transaction carries multi-command state.
    #[must_use]
    pub fn is_multi(&self) -> bool {
        self.multi.is_some()
    }

    /// Whether the transaction is a multi with cross-hop atomicity.
    #[must_use]
    pub fn is_atomic_multi(&self) -> bool {
        self.multi_mode()
            .is_some_and(|mode| mode != MultiMode::NonAtomic)
    }

    /// Locking regime of the multi state, when present.
    #[must_use]
    pub fn multi_mode(&self) -> Option<MultiMode> {
        self.multi
            .as_ref()
            .map(|multi| multi.lock().expect(MUTEX_POISONED).mode)
    }

    /// Whether the last scheduling attempt allowed out-of-order execution.
    #[must_use]
    pub fn is_ooo(&self) -> bool {
        self.coordinator_state.load(Ordering::Relaxed) & coord_flags::OOO != 0
    }

    /// Whether the transaction is scheduled on its participating shards.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.coordinator_state.load(Ordering::Relaxed) & coord_flags::SCHED != 0
    }

    /// Whether the coordinator is parked in a blocking wait.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.coordinator_state.load(Ordering::Relaxed) & coord_flags::BLOCKED != 0
    }

    /// Number of shards participating in the current hop.
    #[must_use]
    pub fn unique_shard_cnt(&self) -> u32 {
        self.unique_shard_cnt.load(Ordering::Relaxed)
    }

    /// Participating shard id; meaningful when `unique_shard_cnt` is one.
    #[must_use]
    pub fn unique_shard_id(&self) -> ShardId {
        self.unique_shard_id.load(Ordering::Relaxed)
    }

    /// Aggregated status of the most recent hop.
    #[must_use]
    pub fn local_result(&self) -> OpStatus {
        *self.local_result.lock().expect(MUTEX_POISONED)
    }

    /// Wall-clock milliseconds captured at the last scheduling attempt.
    #[must_use]
    pub fn time_now_ms(&self) -> u64 {
        self.time_now_ms.load(Ordering::Relaxed)
    }

    /// Awakening txid of a blocking transaction; `u64::MAX` until notified.
    #[must_use]
    pub fn notify_txid(&self) -> TxId {
        self.notify_txid.load(Ordering::Relaxed)
    }

    /// Slot state bits of this transaction on `sid`.
    #[must_use]
    pub fn local_mask(&self, sid: ShardId) -> u16 {
        self.with_slot_state(sid, |state| state.local_mask)
    }

    /// Whether the slot of `sid` is armed for the current hop.
    ///
    /// The acquire load on `run_count` pairs with the coordinator's release store and guards
    /// every non-atomic slot field read that follows.
    #[must_use]
    pub fn is_armed_in_shard(&self, sid: ShardId) -> bool {
        if self.run_count.load(Ordering::Acquire) == 0 {
            return false;
        }
        let data = self.shard_data.read().expect(MUTEX_POISONED);
        let index = Self::slot_of(data.len(), sid);
        data.get(index)
            .is_some_and(|slot| slot.is_armed.load(Ordering::Relaxed))
    }

    /// Renders `name@txid/unique_shard_cnt (ptr)` for log lines.
    #[must_use]
    pub fn debug_id(&self) -> String {
        format!(
            "{}@{}/{} ({:p})",
            self.name(),
            self.txid(),
            self.unique_shard_cnt(),
            std::ptr::from_ref(self),
        )
    }

    /// Re-enables automatic journaling for commands flagged `NO_AUTOJOURNAL`.
    pub fn reenable_auto_journal(&self) {
        self.reenabled_auto_journal.store(true, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Initialization (C4/C5)
    // ------------------------------------------------------------------

    /// One-shot initialization for non-multi commands.
    ///
    /// # Errors
    ///
    /// Propagates `SyntaxError`/`InvalidInt` from key-index extraction.
    pub fn init_by_args(&self, db: DbIndex, args: Vec<Vec<u8>>) -> OpResult<()> {
        self.init_base(db, args);

        let cid = self.cid_snapshot();
        if cid.flags().contains(CmdFlags::GLOBAL_TRANS) {
            self.init_global();
            return Ok(());
        }

        let full = self.full_args.lock().expect(MUTEX_POISONED).clone();
        debug_assert!(full.len() > 1, "first entry is the command name");
        debug_assert_eq!(self.unique_shard_cnt(), 0);
        debug_assert!(self.args.lock().expect(MUTEX_POISONED).is_empty());

        let key_index = determine_keys(&cid, &full)?;
        self.init_by_keys(key_index);
        Ok(())
    }

    fn init_base(&self, db: DbIndex, args: Vec<Vec<u8>>) {
        self.global.store(false, Ordering::Relaxed);
        self.db_index.store(db, Ordering::Relaxed);
        *self.full_args.lock().expect(MUTEX_POISONED) = Arc::new(args);
        *self.local_result.lock().expect(MUTEX_POISONED) = OpStatus::Ok;
    }

    fn init_global(&self) {
        debug_assert!(
            self.multi.is_none()
                || matches!(
                    self.multi_mode(),
                    Some(MultiMode::Global | MultiMode::NonAtomic)
                )
        );
        self.global.store(true, Ordering::Relaxed);
        let shard_count = self.shard_set.size();
        self.unique_shard_cnt
            .store(shard_count as u32, Ordering::Relaxed);
        self.resize_shard_data(shard_count);
        let data = self.shard_data.read().expect(MUTEX_POISONED);
        for slot in data.iter() {
            slot.state.lock().expect(MUTEX_POISONED).local_mask = slot_flags::ACTIVE;
        }
    }

    fn init_by_keys(&self, key_index: KeyIndex) {
        let full = self.full_args.lock().expect(MUTEX_POISONED).clone();

        if key_index.start == full.len() {
            // EVAL with zero keys.
            debug_assert!(self.name().starts_with("EVAL"));
            return;
        }
        debug_assert!(key_index.start < full.len());

        let cid = self.cid_snapshot();
        let needs_reverse_mapping = cid.flags().contains(CmdFlags::REVERSE_MAPPING);
        let shard_count = self.shard_set.shard_count();

        if key_index.has_single_key() && !self.is_atomic_multi() {
            debug_assert!(key_index.step > 0);

            // No sharding needed; copy the key-related args directly.
            self.store_keys_in_args(&full, key_index, needs_reverse_mapping);

            let slot_len = if self.is_multi() {
                shard_count.as_usize()
            } else {
                1
            };
            self.resize_shard_data(slot_len);

            let args = self.args.lock().expect(MUTEX_POISONED).clone();
            let unique_sid = shard_of(&args[0], shard_count);
            self.unique_shard_cnt.store(1, Ordering::Relaxed);
            self.unique_shard_id.store(unique_sid, Ordering::Relaxed);
            self.with_slot_state(unique_sid, |state| state.local_mask |= slot_flags::ACTIVE);
            return;
        }

        // shard_data is not sparse, so every shard gets a slot.
        self.resize_shard_data(shard_count.as_usize());
        debug_assert!(key_index.step == 1 || key_index.step == 2);
        debug_assert!(key_index.step == 1 || full.len() % 2 == 1);

        with_shard_index(shard_count.as_usize(), |shard_index| {
            self.build_shard_index(&full, key_index, needs_reverse_mapping, shard_index);
            self.init_shard_data(shard_index, key_index.num_args(), needs_reverse_mapping);
        });

        if self.multi.is_some() {
            self.init_multi_data(&full, key_index);
        }

        trace!("init_by_keys {}", self.debug_id());

        // Compress shard data when only one shard participates.
        if self.unique_shard_cnt() == 1 {
            let unique_sid = self.unique_shard_id();
            if !self.is_multi() {
                self.resize_shard_data(1);
            }
            self.with_slot_state(unique_sid, |state| {
                state.local_mask |= slot_flags::ACTIVE;
                state.args = None;
            });
        }

        #[cfg(debug_assertions)]
        {
            if needs_reverse_mapping {
                let args = self.args.lock().expect(MUTEX_POISONED).clone();
                let reverse = self.reverse_index.lock().expect(MUTEX_POISONED);
                for (index, arg) in args.iter().enumerate() {
                    debug_assert_eq!(arg, &full[1 + reverse[index] as usize]);
                }
            }
            let data = self.shard_data.read().expect(MUTEX_POISONED);
            for slot in data.iter() {
                debug_assert!(!slot.is_armed.load(Ordering::Relaxed));
                if self.multi.is_none() {
                    debug_assert!(slot.state.lock().expect(MUTEX_POISONED).pq_pos.is_none());
                }
            }
        }
    }

    fn store_keys_in_args(&self, full: &ArgSeq, key_index: KeyIndex, rev_mapping: bool) {
        debug_assert!(key_index.bonus.is_none());

        // Even a single key may span multiple arguments (key plus value).
        let mut out = Vec::with_capacity(key_index.step);
        for position in key_index.start..key_index.start + key_index.step {
            out.push(full[position].clone());
        }

        if rev_mapping {
            let mut reverse = self.reverse_index.lock().expect(MUTEX_POISONED);
            reverse.clear();
            reverse.extend((0..out.len()).map(|offset| (offset + key_index.start - 1) as u32));
        }
        *self.args.lock().expect(MUTEX_POISONED) = Arc::new(out);
    }

    fn build_shard_index(
        &self,
        full: &ArgSeq,
        key_index: KeyIndex,
        rev_mapping: bool,
        out: &mut [PerShardCache],
    ) {
        let shard_count = self.shard_set.shard_count();
        let mut add = |sid: ShardId, position: usize| {
            let bucket = &mut out[usize::from(sid)];
            bucket.args.push(full[position].clone());
            if rev_mapping {
                bucket.original_index.push((position - 1) as u32);
            }
        };

        if let Some(bonus) = key_index.bonus {
            debug_assert_eq!(key_index.step, 1);
            let sid = shard_of(&full[bonus], shard_count);
            add(sid, bonus);
        }

        let mut position = key_index.start;
        while position < key_index.end {
            let sid = shard_of(&full[position], shard_count);
            add(sid, position);
            debug_assert!(key_index.step <= 2);
            if key_index.step == 2 {
                // The value accompanies its preceding key.
                position += 1;
                add(sid, position);
            }
            position += 1;
        }
    }

    fn init_shard_data(&self, shard_index: &[PerShardCache], num_args: usize, rev_mapping: bool) {
        let mut out_args: Vec<Vec<u8>> = Vec::with_capacity(num_args);
        let mut out_reverse: Vec<u32> = Vec::new();

        let (is_multi, incremental_locks) = match &self.multi {
            Some(multi) => {
                let data = multi.lock().expect(MUTEX_POISONED);
                (true, data.mode == MultiMode::LockIncremental)
            }
            None => (false, false),
        };

        let mut unique_cnt: u32 = 0;
        let mut unique_sid: ShardId = 0;
        {
            let data = self.shard_data.read().expect(MUTEX_POISONED);
            debug_assert_eq!(data.len(), shard_index.len());
            for (index, slot) in data.iter().enumerate() {
                let bucket = &shard_index[index];
                debug_assert!(bucket.args.len() < (1 << 15));

                let mut state = slot.state.lock().expect(MUTEX_POISONED);
                state.args = Some((out_args.len() as u32, bucket.args.len() as u32));

                if is_multi {
                    // Multi transactions re-initialize on different shards between commands.
                    state.local_mask &= !slot_flags::ACTIVE;
                    if incremental_locks {
                        state.local_mask &= !slot_flags::KEYLOCK_ACQUIRED;
                    }
                }

                if bucket.args.is_empty() && !bucket.requested_active {
                    continue;
                }

                state.local_mask |= slot_flags::ACTIVE;
                unique_cnt += 1;
                unique_sid = index as ShardId;

                for (offset, arg) in bucket.args.iter().enumerate() {
                    out_args.push(arg.clone());
                    if rev_mapping {
                        out_reverse.push(bucket.original_index[offset]);
                    }
                }
            }
        }
        debug_assert_eq!(out_args.len(), num_args);

        *self.args.lock().expect(MUTEX_POISONED) = Arc::new(out_args);
        if rev_mapping {
            *self.reverse_index.lock().expect(MUTEX_POISONED) = out_reverse;
        }
        self.unique_shard_cnt.store(unique_cnt, Ordering::Relaxed);
        self.unique_shard_id.store(unique_sid, Ordering::Relaxed);
    }

    fn init_multi_data(&self, full: &ArgSeq, key_index: KeyIndex) {
        let multi = self.multi.as_ref().expect("multi state must be present");
        let lock_mode = self.mode();
        let mut data = multi.lock().expect(MUTEX_POISONED);

        if data.mode == MultiMode::NonAtomic {
            return;
        }

        data.keys.clear();
        let mut uniq: HotSet<&[u8]> = HotSet::new();

        // EVAL records its key set once for the whole script; incremental multis collect the
        // keys of every hop.
        if data.mode == MultiMode::LockIncremental || !data.locks_recorded {
            let mut positions = (key_index.start..key_index.end)
                .step_by(key_index.step)
                .collect::<Vec<_>>();
            if let Some(bonus) = key_index.bonus {
                positions.push(bonus);
            }
            for position in positions {
                let key = full[position].as_slice();
                if !uniq.insert(key) {
                    continue;
                }
                if data.mode == MultiMode::LockIncremental {
                    data.keys.push(key.to_vec());
                } else {
                    data.lock_counts
                        .entry(key.to_vec())
                        .or_default()
                        .bump(lock_mode);
                }
            }
        }

        data.locks_recorded = true;
        debug_assert!(data.mode != MultiMode::NonAtomic);
        debug_assert!(
            data.mode == MultiMode::Global || !data.keys.is_empty() || !data.lock_counts.is_empty()
        );
    }

    // ------------------------------------------------------------------
    // Multi-mode manager (C8)
    // ------------------------------------------------------------------

    /// Starts a multi transaction that takes every shard-wide lock up front.
    pub fn start_multi_global(self: &Arc<Self>, db: DbIndex) {
        let multi = self.multi.as_ref().expect("multi state must be present");
        debug_assert!(self.shard_data.read().expect(MUTEX_POISONED).is_empty());

        multi.lock().expect(MUTEX_POISONED).mode = MultiMode::Global;
        self.init_base(db, Vec::new());
        self.init_global();
        multi.lock().expect(MUTEX_POISONED).locks_recorded = true;

        self.schedule_internal();
    }

    /// Starts a multi transaction that locks the full key set before the first hop.
    pub fn start_multi_locked_ahead(self: &Arc<Self>, db: DbIndex, keys: Vec<Vec<u8>>) {
        let multi = self.multi.as_ref().expect("multi state must be present");
        debug_assert!(self.shard_data.read().expect(MUTEX_POISONED).is_empty());

        let key_count = keys.len();
        multi.lock().expect(MUTEX_POISONED).mode = MultiMode::LockAhead;
        self.init_base(db, keys);
        self.init_by_keys(KeyIndex::range(0, key_count));

        self.schedule_internal();
    }

    /// Starts a multi transaction that locks incrementally on the given shard set.
    pub fn start_multi_locked_incr(self: &Arc<Self>, db: DbIndex, shards: &[bool]) {
        let multi = self.multi.as_ref().expect("multi state must be present");
        debug_assert!(self.shard_data.read().expect(MUTEX_POISONED).is_empty());
        debug_assert!(shards.iter().any(|requested| *requested));

        multi.lock().expect(MUTEX_POISONED).mode = MultiMode::LockIncremental;
        self.init_base(db, Vec::new());

        let shard_count = self.shard_set.size();
        debug_assert_eq!(shards.len(), shard_count);
        self.resize_shard_data(shard_count);
        with_shard_index(shard_count, |shard_index| {
            for (index, requested) in shards.iter().enumerate() {
                shard_index[index].requested_active = *requested;
            }
            self.init_shard_data(shard_index, 0, false);
        });

        self.schedule_internal();
    }

    /// Starts a multi transaction without cross-hop atomicity.
    pub fn start_multi_non_atomic(&self) {
        let multi = self.multi.as_ref().expect("multi state must be present");
        multi.lock().expect(MUTEX_POISONED).mode = MultiMode::NonAtomic;
    }

    /// Resets per-hop state between the queued commands of a multi transaction.
    pub fn multi_switch_cmd(&self, cid: CommandId) {
        debug_assert!(self.multi.is_some());
        debug_assert!(self.cb.lock().expect(MUTEX_POISONED).is_none());

        self.unique_shard_id.store(0, Ordering::Relaxed);
        self.unique_shard_cnt.store(0, Ordering::Relaxed);
        *self.args.lock().expect(MUTEX_POISONED) = Arc::new(Vec::new());
        *self.cid.lock().expect(MUTEX_POISONED) = cid;

        if self.multi_mode() == Some(MultiMode::NonAtomic) {
            {
                let data = self.shard_data.read().expect(MUTEX_POISONED);
                for slot in data.iter() {
                    debug_assert!(!slot.is_armed.load(Ordering::Relaxed));
                    let mut state = slot.state.lock().expect(MUTEX_POISONED);
                    state.local_mask = 0;
                    state.pq_pos = None;
                    state.args = Some((0, 0));
                }
            }
            self.txid.store(0, Ordering::Relaxed);
            self.coordinator_state.store(0, Ordering::Relaxed);
        }
    }

    /// Releases every lock held across the hops of a multi transaction.
    ///
    /// Fans out one callback per shard and returns without waiting for them; the shard tasks
    /// hold their own transaction handles. Re-issuing on an already-unlocked transaction is a
    /// no-op.
    pub fn unlock_multi(self: &Arc<Self>) {
        debug!("unlock_multi {}", self.debug_id());
        let multi = self.multi.as_ref().expect("multi state must be present");

        let shard_count = self.shard_set.size();
        let (sharded_keys, shard_journals_cnt) = {
            let mut data = multi.lock().expect(MUTEX_POISONED);
            if data.mode == MultiMode::NonAtomic || data.unlocked {
                return;
            }
            data.unlocked = true;

            let mut sharded: Vec<Vec<(Vec<u8>, LockCounts)>> = vec![Vec::new(); shard_count];
            let lock_counts = std::mem::take(&mut data.lock_counts);
            for (key, counts) in lock_counts {
                let sid = shard_of(&key, self.shard_set.shard_count());
                sharded[usize::from(sid)].push((key, counts));
            }
            let journals = data
                .shard_journal_write
                .iter()
                .filter(|wrote| **wrote)
                .count() as u32;
            (Arc::new(sharded), journals)
        };

        let previous = self
            .run_count
            .fetch_add(shard_count as u32, Ordering::Relaxed);
        debug_assert_eq!(previous, 0);

        for sid in 0..self.shard_set.shard_count().get() {
            let me = Arc::clone(self);
            let sharded_keys = Arc::clone(&sharded_keys);
            self.shard_set.add(sid, move |shard| {
                me.unlock_multi_shard_cb(&sharded_keys, shard, shard_journals_cnt);
            });
        }
    }

    fn unlock_multi_shard_cb(
        &self,
        sharded_keys: &[Vec<(Vec<u8>, LockCounts)>],
        shard: &mut EngineShard,
        shard_journals_cnt: u32,
    ) {
        let sid = shard.shard_id();
        let multi = self.multi.as_ref().expect("multi state must be present");
        let (is_global_mode, should_journal) = {
            let mut data = multi.lock().expect(MUTEX_POISONED);
            let should =
                std::mem::replace(&mut data.shard_journal_write[usize::from(sid)], false);
            (data.mode == MultiMode::Global, should)
        };

        if should_journal && let Some(journal) = shard.journal() {
            journal.lock().expect(MUTEX_POISONED).record_entry(
                self.txid(),
                JournalOp::Exec,
                self.db_index(),
                shard_journals_cnt,
                JournalPayload::Empty,
                true,
            );
        }

        if is_global_mode {
            shard.shard_lock_mut().release(LockMode::Exclusive);
        } else {
            let db = self.db_index();
            for (key, counts) in &sharded_keys[usize::from(sid)] {
                if counts.shared > 0 {
                    shard
                        .db_slice_mut()
                        .release_key(LockMode::Shared, db, key, counts.shared);
                }
                if counts.exclusive > 0 {
                    shard
                        .db_slice_mut()
                        .release_key(LockMode::Exclusive, db, key, counts.exclusive);
                }
            }
        }

        // Not every shard of a multi necessarily executed it; the slot may still sit in the
        // tx queue and not at its front.
        if let Some(pos) = self.with_slot_state(sid, |state| state.pq_pos.take()) {
            debug!("unlock_multi removes {} from queue", self.debug_id());
            let _removed = shard.txq_mut().remove(pos);
            debug_assert!(_removed.is_some());
        }

        shard.shutdown_multi(self);

        if shard.blocking_controller().is_some() {
            shard.notify_pending();
        }
        shard.poll_execution("unlockmulti", None);

        let _ = self.decrease_run_cnt();
    }

    // ------------------------------------------------------------------
    // Scheduler (C6)
    // ------------------------------------------------------------------

    /// Schedules the transaction on every participating shard.
    pub fn schedule(self: &Arc<Self>) {
        if let Some(multi) = &self.multi {
            let lock_mode = self.mode();
            let mut data = multi.lock().expect(MUTEX_POISONED);
            if data.mode == MultiMode::LockIncremental {
                data.add_locks(lock_mode);
            }
        }
        if !self.is_atomic_multi() {
            self.schedule_internal();
        }
    }

    /// Combined schedule-and-execute for single-hop commands.
    ///
    /// Single-shard non-multi transactions skip scheduling entirely when their locks are
    /// uncontended and run directly on the target shard.
    pub fn schedule_single_hop(self: &Arc<Self>, cb: RunnableFn) -> OpStatus {
        {
            let mut slot = self.cb.lock().expect(MUTEX_POISONED);
            debug_assert!(slot.is_none());
            *slot = Some(cb);
        }

        // Multi transactions schedule in advance.
        debug_assert!(
            self.is_atomic_multi()
                || self.coordinator_state.load(Ordering::Relaxed) & coord_flags::SCHED == 0
        );
        self.coordinator_state.fetch_or(
            coord_flags::EXEC | coord_flags::EXEC_CONCLUDING,
            Ordering::Relaxed,
        );

        let schedule_fast =
            self.unique_shard_cnt() == 1 && !self.is_global() && !self.is_atomic_multi();
        let was_ooo = Arc::new(AtomicBool::new(false));

        if schedule_fast {
            let unique_sid = self.unique_shard_id();
            self.with_slot(unique_sid, |slot| {
                slot.is_armed.store(true, Ordering::Relaxed);
            });
            self.run_count.store(1, Ordering::Release);
            self.time_now_ms.store(unix_now_ms(), Ordering::Relaxed);

            let me = Arc::clone(self);
            let ooo_flag = Arc::clone(&was_ooo);
            self.shard_set.add(unique_sid, move |shard| {
                if me.schedule_unique_shard(shard) {
                    ooo_flag.store(true, Ordering::Relaxed);
                    let remaining = me.decrease_run_cnt();
                    debug_assert!(remaining >= 1);
                }
            });
        } else {
            if !self.is_atomic_multi() {
                self.schedule_internal();
            }
            if let Some(multi) = &self.multi {
                let lock_mode = self.mode();
                let mut data = multi.lock().expect(MUTEX_POISONED);
                if data.mode == MultiMode::LockIncremental {
                    data.add_locks(lock_mode);
                }
            }
            self.execute_async();
        }

        trace!("schedule_single_hop waits on {}", self.debug_id());
        self.wait_for_shard_callbacks();

        if was_ooo.load(Ordering::Relaxed) {
            self.coordinator_state
                .fetch_or(coord_flags::OOO, Ordering::Relaxed);
        }

        *self.cb.lock().expect(MUTEX_POISONED) = None;
        self.local_result()
    }

    fn schedule_internal(self: &Arc<Self>) {
        debug_assert!(!self.shard_data.read().expect(MUTEX_POISONED).is_empty());
        debug_assert_eq!(self.txid(), 0);
        debug_assert_eq!(
            self.coordinator_state.load(Ordering::Relaxed)
                & (coord_flags::SCHED | coord_flags::OOO),
            0
        );

        let span_all = self.is_global();
        let lock_mode = self.mode();
        let num_shards = if span_all {
            self.shard_set.size() as u32
        } else {
            self.unique_shard_cnt()
        };
        debug_assert!(num_shards > 0);

        let is_active = |sid: ShardId| -> bool {
            if span_all {
                return true;
            }
            if num_shards == 1 {
                return sid == self.unique_shard_id();
            }
            self.local_mask(sid) & slot_flags::ACTIVE != 0
        };

        if span_all {
            // Global transactions take the shard-wide barrier before entering the queues.
            self.shard_set.run_brief_in_parallel(
                move |shard| {
                    let _ = shard.shard_lock_mut().acquire(lock_mode);
                },
                |_| true,
            );
        }

        let ooo_disabled = span_all
            || (self.is_atomic_multi() && self.multi_mode() != Some(MultiMode::LockAhead));

        // Loop until scheduled on all participating shards.
        loop {
            let txid = OP_SEQ.fetch_add(1, Ordering::Relaxed);
            self.txid.store(txid, Ordering::Relaxed);
            self.time_now_ms.store(unix_now_ms(), Ordering::Relaxed);

            let success = Arc::new(AtomicU32::new(0));
            let lock_granted_cnt = Arc::new(AtomicU32::new(0));
            {
                let me = Arc::clone(self);
                let success = Arc::clone(&success);
                let granted = Arc::clone(&lock_granted_cnt);
                self.shard_set.run_brief_in_parallel(
                    move |shard| {
                        let (scheduled, lock_granted) = me.schedule_in_shard(shard);
                        let _ = success.fetch_add(u32::from(scheduled), Ordering::Relaxed);
                        let _ = granted.fetch_add(u32::from(lock_granted), Ordering::Relaxed);
                    },
                    &is_active,
                );
            }

            if success.load(Ordering::Acquire) == num_shards {
                self.coordinator_state
                    .fetch_or(coord_flags::SCHED, Ordering::Relaxed);
                // With every lock granted nothing contends with us, so we may run ahead of
                // queue predecessors.
                if !ooo_disabled && lock_granted_cnt.load(Ordering::Relaxed) == num_shards {
                    self.coordinator_state
                        .fetch_or(coord_flags::OOO, Ordering::Relaxed);
                }
                debug!(
                    ooo = self.is_ooo(),
                    num_shards,
                    "scheduled {}",
                    self.debug_id()
                );
                break;
            }

            debug!("cancelling {}", self.debug_id());
            let should_poll = Arc::new(AtomicBool::new(false));
            {
                let me = Arc::clone(self);
                let should_poll = Arc::clone(&should_poll);
                self.shard_set.run_brief_in_parallel(
                    move |shard| {
                        if me.cancel_in_shard(shard) {
                            should_poll.store(true, Ordering::Relaxed);
                        }
                    },
                    &is_active,
                );
            }

            // A removed queue entry may have exposed a ready head. Nudge those shards with a
            // deferred poll instead of waiting here: a chained multi predecessor that nobody
            // polls would otherwise never run.
            if should_poll.load(Ordering::Relaxed) {
                for sid in 0..self.shard_set.shard_count().get() {
                    if !is_active(sid) {
                        continue;
                    }
                    self.shard_set.add(sid, |shard| {
                        shard.poll_execution("cancel_cleanup", None);
                    });
                }
            }

            self.txid.store(0, Ordering::Relaxed);
        }

        if self.is_ooo() {
            let data = self.shard_data.read().expect(MUTEX_POISONED);
            for slot in data.iter() {
                slot.state.lock().expect(MUTEX_POISONED).local_mask |= slot_flags::OUT_OF_ORDER;
            }
        }
    }

    /// Brief non-blocking scheduling attempt; runs on the shard thread.
    ///
    /// Returns `(scheduled, lock_granted)`.
    fn schedule_in_shard(self: &Arc<Self>, shard: &mut EngineShard) -> (bool, bool) {
        let sid = shard.shard_id();
        debug_assert!(self.local_mask(sid) & slot_flags::ACTIVE != 0);

        let txid = self.txid();
        if shard.committed_txid() >= txid {
            // Someone already advanced past us; retry with a fresh id.
            return (false, false);
        }

        let lock_mode = self.mode();
        let spans_all = self.is_global();
        let mut lock_granted = false;
        let mut lock_args = None;

        if !spans_all {
            let shard_unlocked = shard.shard_lock().check(lock_mode);
            let args = self.get_lock_args(sid);
            // Intent is recorded regardless of contention; every queue member must be visible
            // in the lock table.
            lock_granted = shard.db_slice_mut().acquire(lock_mode, &args) && shard_unlocked;
            self.with_slot_state(sid, |state| {
                state.local_mask |= slot_flags::KEYLOCK_ACQUIRED;
            });
            trace!(lock_granted, "lock attempt for {}", self.debug_id());
            lock_args = Some(args);
        }

        if !shard.txq().is_empty() {
            // Inserting before the tail behind a lock holder is unsafe: that holder may have
            // already decided to run out of order.
            let to_proceed =
                lock_granted || shard.txq().tail_score().is_some_and(|tail| tail < txid);
            if !to_proceed {
                if self.local_mask(sid) & slot_flags::KEYLOCK_ACQUIRED != 0
                    && let Some(args) = &lock_args
                {
                    shard.db_slice_mut().release(lock_mode, args);
                    self.with_slot_state(sid, |state| {
                        state.local_mask &= !slot_flags::KEYLOCK_ACQUIRED;
                    });
                }
                return (false, false);
            }
        }

        let pos = shard.txq_mut().insert(txid, Arc::clone(self));
        self.with_slot_state(sid, |state| {
            debug_assert!(state.pq_pos.is_none());
            state.pq_pos = Some(pos);
        });
        trace!(
            queue_len = shard.txq().len(),
            "inserted {} into tx queue of shard {sid}",
            self.debug_id()
        );
        (true, lock_granted)
    }

    /// Undoes one shard's successful scheduling attempt.
    ///
    /// Returns whether the removal exposed a ready queue head that needs polling.
    fn cancel_in_shard(&self, shard: &mut EngineShard) -> bool {
        let sid = shard.shard_id();
        let Some(pos) = self.with_slot_state(sid, |state| state.pq_pos.take()) else {
            return false;
        };

        let head = shard.txq().head_score();
        let _removed = shard.txq_mut().remove(pos);
        debug_assert!(
            _removed.is_some_and(|tx| std::ptr::eq(Arc::as_ptr(&tx), std::ptr::from_ref(self)))
        );

        if self.local_mask(sid) & slot_flags::KEYLOCK_ACQUIRED != 0 {
            let lock_mode = self.mode();
            let lock_args = self.get_lock_args(sid);
            debug_assert!(
                !lock_args.args.is_empty()
                    || self.multi_mode() == Some(MultiMode::LockIncremental)
            );
            shard.db_slice_mut().release(lock_mode, &lock_args);
            self.with_slot_state(sid, |state| {
                state.local_mask &= !slot_flags::KEYLOCK_ACQUIRED;
            });
        }

        head == Some(pos) && !shard.txq().is_empty()
    }

    /// Optimized schedule path on the unique target shard.
    ///
    /// Returns `true` when the callback ran eagerly, `false` when the transaction entered the
    /// tx queue.
    pub(crate) fn schedule_unique_shard(self: &Arc<Self>, shard: &mut EngineShard) -> bool {
        debug_assert!(!self.is_atomic_multi());
        debug_assert_eq!(self.txid(), 0);
        debug_assert!(
            self.shard_data.read().expect(MUTEX_POISONED).len() == 1
                || self.multi_mode() == Some(MultiMode::NonAtomic)
        );

        let sid = shard.shard_id();
        let lock_mode = self.mode();
        let lock_args = self.get_lock_args(sid);
        debug_assert!(self.with_slot_state(sid, |state| state.pq_pos.is_none()));

        // Fast path: uncontended keys run without ever entering the queue.
        if shard.db_slice().check_lock(lock_mode, &lock_args) && shard.shard_lock().check(lock_mode)
        {
            self.run_quickie(shard);
            return true;
        }

        let txid = OP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.txid.store(txid, Ordering::Relaxed);
        let pos = shard.txq_mut().insert(txid, Arc::clone(self));
        self.with_slot_state(sid, |state| {
            debug_assert_eq!(state.local_mask & slot_flags::KEYLOCK_ACQUIRED, 0);
            state.pq_pos = Some(pos);
        });

        let _ = shard.db_slice_mut().acquire(lock_mode, &lock_args);
        self.with_slot_state(sid, |state| {
            state.local_mask |= slot_flags::KEYLOCK_ACQUIRED;
        });

        debug!("rescheduling {} into the tx queue", self.debug_id());
        shard.poll_execution("schedule_unique", None);
        false
    }

    fn run_quickie(&self, shard: &mut EngineShard) {
        debug_assert!(!self.is_atomic_multi());
        debug_assert_eq!(self.txid(), 0);

        shard.inc_quick_run();
        let sid = shard.shard_id();
        debug_assert_eq!(
            self.local_mask(sid) & (slot_flags::KEYLOCK_ACQUIRED | slot_flags::OUT_OF_ORDER),
            0
        );
        trace!("quick run {} on shard {sid}", self.debug_id());

        let cb = self
            .cb
            .lock()
            .expect(MUTEX_POISONED)
            .clone()
            .expect("quick run requires an armed callback");
        let status = cb(self, shard);
        if status == OpStatus::OutOfMemory {
            log_out_of_memory_throttled();
        }
        *self.local_result.lock().expect(MUTEX_POISONED) = status;

        if self.log_auto_journal_on_shard(shard) && !self.is_multi() {
            self.finish_log_journal_on_shard(shard, 1);
        }

        self.with_slot(sid, |slot| slot.is_armed.store(false, Ordering::Relaxed));
        // Only this single shard runs the callback, so clearing is safe here.
        *self.cb.lock().expect(MUTEX_POISONED) = None;
    }

    // ------------------------------------------------------------------
    // Executor (C7)
    // ------------------------------------------------------------------

    /// Runs one hop on every participating shard and waits for completion.
    pub fn execute(self: &Arc<Self>, cb: RunnableFn, conclude: bool) {
        debug_assert!(self.is_scheduled());
        *self.cb.lock().expect(MUTEX_POISONED) = Some(cb);

        self.coordinator_state
            .fetch_or(coord_flags::EXEC, Ordering::Relaxed);
        if conclude {
            self.coordinator_state
                .fetch_or(coord_flags::EXEC_CONCLUDING, Ordering::Relaxed);
        } else {
            self.coordinator_state
                .fetch_and(!coord_flags::EXEC_CONCLUDING, Ordering::Relaxed);
        }

        self.execute_async();

        trace!("wait on exec {}", self.debug_id());
        self.wait_for_shard_callbacks();

        *self.cb.lock().expect(MUTEX_POISONED) = None;
    }

    fn execute_async(self: &Arc<Self>) {
        debug_assert!(self.unique_shard_cnt() > 0);
        debug_assert!(
            !self.is_atomic_multi()
                || self
                    .multi
                    .as_ref()
                    .is_some_and(|multi| multi.lock().expect(MUTEX_POISONED).locks_recorded)
        );

        // New hop generation; a stale task comparing against an older snapshot backs off.
        let seq = self
            .seqlock
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);

        let targets = self.active_shard_ids();
        let run_cnt = self.unique_shard_cnt();
        debug_assert_eq!(targets.len() as u32, run_cnt);

        for sid in &targets {
            self.with_slot(*sid, |slot| slot.is_armed.store(true, Ordering::Relaxed));
        }

        // Publication fence: the slot arming and hop state above become visible to any shard
        // task that observes a non-zero run count.
        self.run_count.store(run_cnt, Ordering::Release);

        for sid in targets {
            let me = Arc::clone(self);
            self.shard_set.add(sid, move |shard| {
                // The armed check must come first: it proves the coordinator crossed the
                // release store, which makes the generation below meaningful.
                if !me.is_armed_in_shard(shard.shard_id()) {
                    return;
                }
                if me.seqlock.load(Ordering::Relaxed) == seq {
                    shard.poll_execution("exec_cb", Some(&me));
                } else {
                    debug!("skipping stale hop task for {}", me.debug_id());
                }
            });
        }
    }

    /// Runs the hop callback on this shard; returns whether the queue entry must be kept.
    pub(crate) fn run_in_shard(&self, shard: &mut EngineShard) -> bool {
        debug_assert!(self.run_count.load(Ordering::Relaxed) > 0);
        debug_assert!(self.txid() > 0);
        let cb = self
            .cb
            .lock()
            .expect(MUTEX_POISONED)
            .clone()
            .expect("armed transaction must carry a callback");

        let sid = shard.shard_id();
        let (was_suspended, awaked_prerun) = {
            let data = self.shard_data.read().expect(MUTEX_POISONED);
            let slot = &data[Self::slot_of(data.len(), sid)];
            debug_assert!(slot.is_armed.load(Ordering::Relaxed));
            slot.is_armed.store(false, Ordering::Relaxed);
            let state = slot.state.lock().expect(MUTEX_POISONED);
            (
                state.local_mask & slot_flags::SUSPENDED_Q != 0,
                state.local_mask & slot_flags::AWAKED_Q != 0,
            )
        };
        trace!(shard = sid, "run_in_shard {}", self.debug_id());

        let incremental_lock = self.multi_mode() == Some(MultiMode::LockIncremental);

        // `conclude` says this runnable finishes the current operation; locks are released
        // only when the transaction is not an atomic multi, whose keys unlock together in
        // `unlock_multi`.
        let is_concluding =
            self.coordinator_state.load(Ordering::Relaxed) & coord_flags::EXEC_CONCLUDING != 0;
        let should_release = is_concluding && !self.is_atomic_multi();
        let lock_mode = self.mode();

        // Incremental multis lock exactly once per shard, right before the first statement
        // that touches it.
        if !self.is_global()
            && incremental_lock
            && self.local_mask(sid) & slot_flags::KEYLOCK_ACQUIRED == 0
        {
            debug_assert!(!awaked_prerun);
            self.with_slot_state(sid, |state| {
                state.local_mask |= slot_flags::KEYLOCK_ACQUIRED;
            });
            let lock_args = self.get_lock_args(sid);
            let _ = shard.db_slice_mut().acquire(lock_mode, &lock_args);
        }

        debug_assert!(
            self.is_global()
                || self.local_mask(sid) & slot_flags::KEYLOCK_ACQUIRED != 0
                || self.multi_mode() == Some(MultiMode::Global)
        );

        // A suspended transaction still runs here: moves like BRPOPLPUSH must execute their
        // push on the suspended shard.
        let status = cb(self, shard);
        if status == OpStatus::OutOfMemory {
            log_out_of_memory_throttled();
        }
        if self.unique_shard_cnt() == 1 {
            // Only a single thread runs the callback, so clearing is safe.
            *self.cb.lock().expect(MUTEX_POISONED) = None;
            *self.local_result.lock().expect(MUTEX_POISONED) = status;
        } else {
            match status {
                OpStatus::Ok => {}
                OpStatus::OutOfMemory => {
                    *self.local_result.lock().expect(MUTEX_POISONED) = status;
                }
                other => panic!(
                    "unexpected status {other} from a multi-shard hop of {}",
                    self.debug_id()
                ),
            }
        }

        if is_concluding && self.log_auto_journal_on_shard(shard) && !self.is_multi() {
            self.finish_log_journal_on_shard(shard, self.unique_shard_cnt());
        }

        // The queue entry is consumed on first invocation; follow-up hops run through the
        // shard's continuation slot.
        if let Some(pos) = self.with_slot_state(sid, |state| state.pq_pos.take()) {
            let _removed = shard.txq_mut().remove(pos);
            debug_assert!(_removed.is_some());
        }

        if should_release {
            let became_suspended = self.local_mask(sid) & slot_flags::SUSPENDED_Q != 0;

            if self.is_global() {
                debug_assert!(!awaked_prerun && !became_suspended);
                shard.shard_lock_mut().release(lock_mode);
            } else {
                debug_assert!(self.local_mask(sid) & slot_flags::KEYLOCK_ACQUIRED != 0);
                // A newly suspended transaction keeps its locks so that later touchers of the
                // same keys are ordered through the tx queue; that preserves the atomicity of
                // awakened transactions.
                if was_suspended || !became_suspended {
                    let lock_args = self.get_lock_args(sid);
                    shard.db_slice_mut().release(lock_mode, &lock_args);
                    self.with_slot_state(sid, |state| {
                        state.local_mask &= !slot_flags::KEYLOCK_ACQUIRED;
                    });
                }
                self.with_slot_state(sid, |state| {
                    state.local_mask &= !slot_flags::OUT_OF_ORDER;
                });
            }

            if shard.blocking_controller().is_some() {
                if awaked_prerun || was_suspended {
                    let lock_args = self.get_lock_args(sid);
                    let keys = lock_args.keys().map(<[u8]>::to_vec).collect::<Vec<_>>();
                    shard.finalize_watched(self.db_index(), keys.iter().map(Vec::as_slice), self);
                }
                shard.notify_pending();
            }
        }

        let remaining = self.decrease_run_cnt();
        debug_assert!(remaining >= 1);
        // From this point on the coordinator may already be past its wait.

        !should_release
    }

    fn wait_for_shard_callbacks(&self) {
        self.run_ec
            .wait(|| self.run_count.load(Ordering::Acquire) == 0);
    }

    pub(crate) fn decrease_run_cnt(&self) -> u32 {
        // Release so no store of ours is reordered after the count reaches zero.
        let previous = self.run_count.fetch_sub(1, Ordering::Release);
        if previous == 1 {
            self.run_ec.notify();
        }
        previous
    }

    // ------------------------------------------------------------------
    // Blocking path (C9)
    // ------------------------------------------------------------------

    /// Suspends the transaction on the keys produced by `keys_provider`.
    ///
    /// Returns `true` when a notification arrived before `deadline` (or the shutdown break),
    /// `false` when the wait expired.
    pub fn wait_on_watch(
        self: &Arc<Self>,
        deadline: Option<Instant>,
        keys_provider: WaitKeysProvider,
    ) -> bool {
        debug!("wait_on_watch {}", self.debug_id());

        let me = Arc::clone(self);
        let provider = Arc::clone(&keys_provider);
        let cb: RunnableFn = Arc::new(move |tx, shard| {
            let keys = provider(tx, &*shard);
            me.watch_in_shard(&keys, shard)
        });
        self.execute(cb, true);

        self.coordinator_state
            .fetch_or(coord_flags::BLOCKED, Ordering::Relaxed);

        let wake = || {
            self.coordinator_state.load(Ordering::Relaxed) & coord_flags::CANCELLED != 0
                || self.notify_txid.load(Ordering::Relaxed) != u64::MAX
        };
        let satisfied = match deadline {
            Some(deadline) => self.blocking_ec.wait_deadline(wake, deadline),
            None => {
                self.blocking_ec.wait(wake);
                true
            }
        };

        let is_expired = !satisfied
            || self.coordinator_state.load(Ordering::Relaxed) & coord_flags::CANCELLED != 0;
        self.unwatch_blocking(is_expired, &keys_provider);
        self.coordinator_state
            .fetch_and(!coord_flags::BLOCKED, Ordering::Relaxed);

        !is_expired
    }

    fn watch_in_shard(self: &Arc<Self>, keys: &[Vec<u8>], shard: &mut EngineShard) -> OpStatus {
        let sid = shard.shard_id();
        debug_assert_eq!(self.local_mask(sid) & slot_flags::SUSPENDED_Q, 0);

        let db = self.db_index();
        shard
            .ensure_blocking_controller()
            .add_watched(db, keys.iter().map(Vec::as_slice), self);
        self.with_slot_state(sid, |state| {
            state.local_mask |= slot_flags::SUSPENDED_Q;
        });
        trace!("watch registered for {}", self.debug_id());
        OpStatus::Ok
    }

    fn unwatch_blocking(self: &Arc<Self>, should_expire: bool, keys_provider: &WaitKeysProvider) {
        debug!(
            should_expire,
            "unwatch_blocking {}",
            self.debug_id()
        );
        debug_assert!(!self.is_global());

        self.run_count
            .store(self.unique_shard_cnt(), Ordering::Release);

        for sid in self.active_shard_ids() {
            let me = Arc::clone(self);
            let provider = Arc::clone(keys_provider);
            self.shard_set.add(sid, move |shard| {
                let keys = provider(&me, &*shard);
                me.unwatch_shard_cb(&keys, should_expire, shard);
            });
        }

        self.wait_for_shard_callbacks();
    }

    fn unwatch_shard_cb(&self, keys: &[Vec<u8>], should_expire: bool, shard: &mut EngineShard) {
        let sid = shard.shard_id();
        if should_expire {
            let lock_mode = self.mode();
            let lock_args = self.get_lock_args(sid);
            shard.db_slice_mut().release(lock_mode, &lock_args);

            self.with_slot_state(sid, |state| {
                state.local_mask |= slot_flags::EXPIRED_Q;
                state.local_mask &= !slot_flags::KEYLOCK_ACQUIRED;
            });
            shard.finalize_watched(self.db_index(), keys.iter().map(Vec::as_slice), self);
            debug_assert!(
                shard
                    .blocking_controller()
                    .is_none_or(|controller| !controller.is_awaked(self))
            );
            shard.notify_pending();
        }

        // This shard may have awakened us concurrently and halted its queue; nudge it.
        shard.poll_execution("unwatchcb", None);

        let _ = self.decrease_run_cnt();
    }

    /// Called from a shard thread when a watched key becomes available.
    ///
    /// Returns `true` when the transaction transitioned from suspended to awakened.
    pub fn notify_suspended(&self, committed_txid: TxId, sid: ShardId) -> bool {
        let mask = self.local_mask(sid);
        if mask & slot_flags::EXPIRED_Q != 0 {
            return false;
        }
        debug!(
            mask,
            committed_txid,
            "notify_suspended {}",
            self.debug_id()
        );

        // The slot may already be awakened: another key of the same transaction fired, or the
        // same key fired more than once.
        if mask & slot_flags::SUSPENDED_Q != 0 {
            debug_assert_eq!(mask & slot_flags::AWAKED_Q, 0);
            self.with_slot_state(sid, |state| {
                state.local_mask &= !slot_flags::SUSPENDED_Q;
                state.local_mask |= slot_flags::AWAKED_Q;
            });

            // Take the minimum across concurrent notifications.
            let mut current = self.notify_txid.load(Ordering::Relaxed);
            while committed_txid < current {
                match self.notify_txid.compare_exchange_weak(
                    current,
                    committed_txid,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.blocking_ec.notify();
                        break;
                    }
                    Err(observed) => current = observed,
                }
            }
            return true;
        }

        debug_assert!(mask & slot_flags::AWAKED_Q != 0);
        false
    }

    /// Cancels a parked blocking wait during shutdown.
    pub fn break_on_shutdown(&self) {
        if self.coordinator_state.load(Ordering::Relaxed) & coord_flags::BLOCKED != 0 {
            self.coordinator_state
                .fetch_or(coord_flags::CANCELLED, Ordering::Relaxed);
            self.blocking_ec.notify();
        }
    }

    // ------------------------------------------------------------------
    // Argument access
    // ------------------------------------------------------------------

    /// Shard-grouped argument span owned by `sid` during the current hop.
    #[must_use]
    pub fn get_shard_args(&self, sid: ShardId) -> ShardArgs {
        let args = self.args.lock().expect(MUTEX_POISONED).clone();
        debug_assert!(
            !args.is_empty() || self.multi_mode() == Some(MultiMode::LockIncremental)
        );

        // unique_shard_cnt is readable here because shard code runs behind the armed barrier.
        if self.unique_shard_cnt() == 1 {
            return ShardArgs::full(args);
        }
        match self.with_slot_state(sid, |state| state.args) {
            Some((start, count)) => ShardArgs::new(args, start as usize, count as usize),
            None => ShardArgs::full(args),
        }
    }

    /// Maps a shard-local argument position back to its position in the original argument
    /// sequence minus one (skipping the command name).
    #[must_use]
    pub fn reverse_arg_index(&self, sid: ShardId, arg_index: usize) -> usize {
        let reverse = self.reverse_index.lock().expect(MUTEX_POISONED);
        if self.unique_shard_cnt() == 1 {
            return reverse[arg_index] as usize;
        }
        let (start, _) = self
            .with_slot_state(sid, |state| state.args)
            .unwrap_or((0, 0));
        reverse[start as usize + arg_index] as usize
    }

    fn get_lock_args(&self, sid: ShardId) -> KeyLockArgs {
        KeyLockArgs {
            db: self.db_index(),
            key_step: self.cid_snapshot().key_arg_step(),
            args: self.get_shard_args(sid),
        }
    }

    // ------------------------------------------------------------------
    // Auto-journal hook (C10)
    // ------------------------------------------------------------------

    /// Records the command into the shard's journal when auto-journaling applies.
    ///
    /// Returns whether a record was written.
    fn log_auto_journal_on_shard(&self, shard: &mut EngineShard) -> bool {
        let cid = self.cid_snapshot();
        if !cid.flags().contains(CmdFlags::WRITE) {
            return false;
        }
        if cid.flags().contains(CmdFlags::NO_AUTOJOURNAL)
            && !self.reenabled_auto_journal.load(Ordering::Relaxed)
        {
            return false;
        }
        if shard.journal().is_none() {
            return false;
        }

        let args = self.args.lock().expect(MUTEX_POISONED).clone();
        let full = self.full_args.lock().expect(MUTEX_POISONED).clone();
        let payload = if self.unique_shard_cnt() <= 1 || args.is_empty() {
            debug_assert!(!full.is_empty());
            JournalPayload::Full(full.as_ref().clone())
        } else {
            JournalPayload::PerShard {
                cmd: full[0].clone(),
                args: self.get_shard_args(shard.shard_id()).to_vec(),
            }
        };
        self.log_journal_on_shard(shard, payload, self.unique_shard_cnt().max(1), false, true);
        true
    }

    fn log_journal_on_shard(
        &self,
        shard: &mut EngineShard,
        payload: JournalPayload,
        shard_cnt: u32,
        multi_commands: bool,
        allow_await: bool,
    ) {
        let sid = shard.shard_id();
        let Some(journal) = shard.journal() else {
            return;
        };
        let journal = Arc::clone(journal);

        if let Some(multi) = &self.multi {
            multi.lock().expect(MUTEX_POISONED).shard_journal_write[usize::from(sid)] = true;
        }

        let grouped = multi_commands || self.is_atomic_multi();
        let op = if grouped {
            JournalOp::MultiCommand
        } else {
            JournalOp::Command
        };
        journal.lock().expect(MUTEX_POISONED).record_entry(
            self.txid(),
            op,
            self.db_index(),
            shard_cnt,
            payload,
            allow_await,
        );
    }

    /// Seals the records of a non-multi transaction with an `Exec` terminator.
    fn finish_log_journal_on_shard(&self, shard: &mut EngineShard, shard_cnt: u32) {
        if self.is_multi() {
            return;
        }
        let Some(journal) = shard.journal() else {
            return;
        };
        journal.lock().expect(MUTEX_POISONED).record_entry(
            self.txid(),
            JournalOp::Exec,
            self.db_index(),
            shard_cnt,
            JournalPayload::Empty,
            false,
        );
    }

    // ------------------------------------------------------------------
    // Slot plumbing
    // ------------------------------------------------------------------

    fn cid_snapshot(&self) -> CommandId {
        *self.cid.lock().expect(MUTEX_POISONED)
    }

    /// Single-shard transactions compress their slot vector to one element; every other
    /// layout indexes slots by shard id directly.
    fn slot_of(len: usize, sid: ShardId) -> usize {
        if usize::from(sid) < len {
            usize::from(sid)
        } else {
            0
        }
    }

    fn with_slot<R>(&self, sid: ShardId, f: impl FnOnce(&PerShardData) -> R) -> R {
        let data = self.shard_data.read().expect(MUTEX_POISONED);
        let index = Self::slot_of(data.len(), sid);
        f(&data[index])
    }

    fn with_slot_state<R>(&self, sid: ShardId, f: impl FnOnce(&mut SlotState) -> R) -> R {
        self.with_slot(sid, |slot| f(&mut slot.state.lock().expect(MUTEX_POISONED)))
    }

    fn resize_shard_data(&self, len: usize) {
        let mut data = self.shard_data.write().expect(MUTEX_POISONED);
        if data.len() != len {
            data.clear();
            data.resize_with(len, PerShardData::default);
        }
    }

    /// Shards participating in the current hop.
    fn active_shard_ids(&self) -> Vec<ShardId> {
        if !self.is_global() && self.unique_shard_cnt() == 1 {
            return vec![self.unique_shard_id()];
        }
        let data = self.shard_data.read().expect(MUTEX_POISONED);
        data.iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.state.lock().expect(MUTEX_POISONED).local_mask & slot_flags::ACTIVE != 0
            })
            .map(|(index, _)| index as ShardId)
            .collect()
    }
}

impl MultiData {
    /// Moves the scratch key list of an incremental multi into the accumulated lock counts.
    fn add_locks(&mut self, mode: LockMode) {
        debug_assert_eq!(self.mode, MultiMode::LockIncremental);
        let keys = std::mem::take(&mut self.keys);
        for key in keys {
            self.lock_counts.entry(key).or_default().bump(mode);
        }
    }
}
