//! Journal entry model used by replication pathways.
//!
//! Shard threads record one entry per concluding write callback; a replica replays entries in
//! LSN order. Multi-command transactions group their records with an `Exec` terminator per
//! shard that wrote.

use std::collections::VecDeque;

use ember_common::ids::{DbIndex, TxId};

/// Default number of journal entries kept in partial-sync backlog.
pub const DEFAULT_BACKLOG_LEN: usize = 8192;

/// Journal operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    /// Standalone command payload.
    Command,
    /// Command that belongs to a still-open multi-command transaction.
    MultiCommand,
    /// Terminator sealing every preceding record of the same transaction.
    Exec,
}

/// Payload carried by one journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalPayload {
    /// No payload (`Exec` terminators).
    Empty,
    /// Full original argument sequence, command name included.
    Full(Vec<Vec<u8>>),
    /// Command name plus the argument sub-span owned by the recording shard.
    PerShard {
        /// Command name.
        cmd: Vec<u8>,
        /// Shard-owned arguments.
        args: Vec<Vec<u8>>,
    },
}

/// One append-only journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Transaction id associated with this record.
    pub txid: TxId,
    /// Database id associated with this record.
    pub db: DbIndex,
    /// Operation kind.
    pub op: JournalOp,
    /// Number of shards participating in the recorded operation.
    pub shard_cnt: u32,
    /// Record payload.
    pub payload: JournalPayload,
    /// Whether the writer may await replica acknowledgement for this record.
    pub await_ack: bool,
}

/// Append-only in-memory journal over a sliding LSN window.
///
/// Entries live in a ring of fixed capacity; `first_lsn` names the oldest buffered record, so
/// an entry's LSN is `first_lsn + offset` and eviction advances the window instead of stamping
/// every record. LSN 1 is the first record ever written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryJournal {
    buffer: VecDeque<JournalEntry>,
    first_lsn: u64,
    capacity: usize,
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJournal {
    /// Creates a journal with the default backlog capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG_LEN)
    }

    /// Creates a journal keeping at most `backlog_len` entries.
    ///
    /// A zero capacity would make every append unservable, so it is raised to one.
    #[must_use]
    pub fn with_backlog(backlog_len: usize) -> Self {
        let capacity = backlog_len.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            first_lsn: 1,
            capacity,
        }
    }

    /// Records one entry and returns its assigned LSN.
    pub fn record_entry(
        &mut self,
        txid: TxId,
        op: JournalOp,
        db: DbIndex,
        shard_cnt: u32,
        payload: JournalPayload,
        await_ack: bool,
    ) -> u64 {
        self.append(JournalEntry {
            txid,
            db,
            op,
            shard_cnt,
            payload,
            await_ack,
        })
    }

    /// Appends one entry, evicting the oldest when the window is full; returns its LSN.
    pub fn append(&mut self, entry: JournalEntry) -> u64 {
        if self.buffer.len() == self.capacity {
            let _ = self.buffer.pop_front();
            self.first_lsn += 1;
        }
        self.buffer.push_back(entry);
        self.first_lsn + self.buffer.len() as u64 - 1
    }

    /// LSN the next append will receive.
    #[must_use]
    pub fn current_lsn(&self) -> u64 {
        self.first_lsn + self.buffer.len() as u64
    }

    /// Whether `lsn` still falls inside the buffered window.
    #[must_use]
    pub fn is_lsn_in_buffer(&self, lsn: u64) -> bool {
        lsn >= self.first_lsn && lsn < self.current_lsn()
    }

    /// Buffered entry with the given LSN, if not yet evicted.
    #[must_use]
    pub fn entry_at_lsn(&self, lsn: u64) -> Option<JournalEntry> {
        if !self.is_lsn_in_buffer(lsn) {
            return None;
        }
        let offset = usize::try_from(lsn - self.first_lsn).ok()?;
        self.buffer.get(offset).cloned()
    }

    /// All buffered entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.buffer.iter().cloned().collect()
    }

    /// Entries with LSN ≥ `start_lsn`, for replicas resuming a partial sync.
    ///
    /// A cursor equal to [`Self::current_lsn`] yields an empty suffix (the replica is caught
    /// up). Cursors that ran ahead of the journal or fell behind the window return `None`,
    /// which forces a full resync.
    #[must_use]
    pub fn entries_from_lsn(&self, start_lsn: u64) -> Option<Vec<JournalEntry>> {
        if start_lsn == self.current_lsn() {
            return Some(Vec::new());
        }
        if !self.is_lsn_in_buffer(start_lsn) {
            return None;
        }
        let offset = usize::try_from(start_lsn - self.first_lsn).ok()?;
        Some(self.buffer.iter().skip(offset).cloned().collect())
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drops every entry and restarts LSN assignment from 1.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.first_lsn = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryJournal, JournalOp, JournalPayload};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn record_entry_assigns_monotonic_lsns() {
        let mut journal = InMemoryJournal::new();
        let lsn1 = journal.record_entry(
            7,
            JournalOp::Command,
            0,
            1,
            JournalPayload::Full(vec![b"SET".to_vec(), b"a".to_vec(), b"b".to_vec()]),
            true,
        );
        let lsn2 = journal.record_entry(7, JournalOp::Exec, 0, 1, JournalPayload::Empty, false);

        assert_that!(lsn1, eq(1_u64));
        assert_that!(lsn2, eq(2_u64));
        assert_that!(journal.current_lsn(), eq(3_u64));

        let entries = journal.entries();
        assert_that!(entries.len(), eq(2_usize));
        assert_that!(entries[0].op, eq(JournalOp::Command));
        assert_that!(entries[1].op, eq(JournalOp::Exec));
        assert_that!(entries[1].await_ack, eq(false));
    }

    #[rstest]
    fn per_shard_payload_keeps_only_shard_owned_args() {
        let mut journal = InMemoryJournal::new();
        let _ = journal.record_entry(
            3,
            JournalOp::MultiCommand,
            0,
            2,
            JournalPayload::PerShard {
                cmd: b"MSET".to_vec(),
                args: vec![b"k1".to_vec(), b"v1".to_vec()],
            },
            true,
        );

        let entry = journal.entry_at_lsn(1).expect("entry must be buffered");
        assert_that!(entry.shard_cnt, eq(2_u32));
        let JournalPayload::PerShard { cmd, args } = entry.payload else {
            panic!("expected per-shard payload");
        };
        assert_that!(&cmd, eq(&b"MSET".to_vec()));
        assert_that!(args.len(), eq(2_usize));
    }

    #[rstest]
    fn full_window_slides_over_oldest_entries() {
        let mut journal = InMemoryJournal::with_backlog(2);
        for txid in 1..=3_u64 {
            let _ = journal.record_entry(
                txid,
                JournalOp::Command,
                0,
                1,
                JournalPayload::Empty,
                false,
            );
        }

        assert_that!(journal.len(), eq(2_usize));
        assert_that!(journal.is_lsn_in_buffer(1), eq(false));
        assert_that!(journal.is_lsn_in_buffer(2), eq(true));
        assert_that!(journal.entry_at_lsn(1).is_none(), eq(true));
        assert_that!(
            journal.entry_at_lsn(3).map(|entry| entry.txid),
            eq(Some(3_u64))
        );
        // Eviction never disturbs LSN assignment.
        assert_that!(journal.current_lsn(), eq(4_u64));
    }

    #[rstest]
    fn entries_from_lsn_serves_suffix_and_caught_up_cursor() {
        let mut journal = InMemoryJournal::new();
        for txid in 1..=3_u64 {
            let _ = journal.record_entry(
                txid,
                JournalOp::Command,
                0,
                1,
                JournalPayload::Empty,
                false,
            );
        }

        let suffix = journal
            .entries_from_lsn(2)
            .expect("lsn 2 should be available");
        assert_that!(suffix.len(), eq(2_usize));
        assert_that!(suffix[0].txid, eq(2_u64));

        let caught_up = journal
            .entries_from_lsn(journal.current_lsn())
            .expect("caught-up cursor should yield an empty suffix");
        assert_that!(caught_up.is_empty(), eq(true));
    }

    #[rstest]
    fn entries_from_lsn_forces_resync_on_stale_or_future_cursor() {
        let mut journal = InMemoryJournal::with_backlog(2);
        for txid in 1..=3_u64 {
            let _ = journal.record_entry(
                txid,
                JournalOp::Command,
                0,
                1,
                JournalPayload::Empty,
                false,
            );
        }

        // LSN 1 was evicted; LSN 5 was never assigned.
        assert_that!(journal.entries_from_lsn(1).is_none(), eq(true));
        assert_that!(journal.entries_from_lsn(5).is_none(), eq(true));
    }

    #[rstest]
    fn reset_restarts_lsn_assignment() {
        let mut journal = InMemoryJournal::new();
        let _ = journal.record_entry(1, JournalOp::Command, 0, 1, JournalPayload::Empty, false);
        journal.reset();
        assert_that!(journal.is_empty(), eq(true));
        assert_that!(journal.current_lsn(), eq(1_u64));

        let lsn = journal.record_entry(2, JournalOp::Command, 0, 1, JournalPayload::Empty, false);
        assert_that!(lsn, eq(1_u64));
    }
}
