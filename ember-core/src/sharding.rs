//! Key-to-shard routing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use ember_common::ids::{ShardCount, ShardId};

/// Maps key bytes to the shard that owns them.
///
/// Every thread must agree on ownership, so the hash is a fixed-seed non-cryptographic one
/// reduced modulo the shard count; the same key always lands on the same shard.
#[must_use]
pub fn shard_of(key: &[u8], shard_count: ShardCount) -> ShardId {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let reduced = hasher.finish() % u64::from(shard_count.get());
    // The modulo bounds the value below u16::MAX, so the narrowing cannot fail.
    ShardId::try_from(reduced).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::shard_of;
    use ember_common::ids::ShardCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"alpha".as_slice(), 2)]
    #[case(b"user:1001".as_slice(), 5)]
    #[case(b"".as_slice(), 12)]
    fn owner_is_always_within_shard_range(#[case] key: &[u8], #[case] count: u16) {
        let shard_count = ShardCount::new(count).expect("non-zero count is valid");
        assert_that!(shard_of(key, shard_count) < count, eq(true));
    }

    #[rstest]
    fn repeated_lookups_agree_on_the_owner() {
        let shard_count = ShardCount::new(7).expect("non-zero count is valid");
        for key in [b"k1".as_slice(), b"k2", b"some-longer-key"] {
            assert_that!(shard_of(key, shard_count), eq(shard_of(key, shard_count)));
        }
    }
}
