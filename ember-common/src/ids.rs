//! Identifier types shared by the coordinator, storage, and replication layers.

use std::num::NonZeroU16;

/// Index of one single-threaded execution shard.
pub type ShardId = u16;

/// Logical database number, following the Redis `SELECT` model.
pub type DbIndex = u16;

/// Process-wide monotonic transaction id; zero marks an unscheduled transaction.
pub type TxId = u64;

/// Shard count that is non-zero by construction.
///
/// Runtime APIs take this wrapper instead of a bare integer so that "how many shards" can
/// never silently be zero somewhere deep in the call graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardCount(NonZeroU16);

impl ShardCount {
    /// Validates `value` as a shard count; zero is rejected.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        NonZeroU16::new(value).map(Self)
    }

    /// Raw count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0.get()
    }

    /// Raw count widened for indexing.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0.get() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::ShardCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn zero_is_not_a_shard_count() {
        assert_that!(ShardCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(6)]
    #[case(u16::MAX)]
    fn non_zero_counts_round_trip(#[case] value: u16) {
        let count = ShardCount::new(value).expect("non-zero count is valid");
        assert_that!(count.get(), eq(value));
        assert_that!(count.as_usize(), eq(usize::from(value)));
    }
}
