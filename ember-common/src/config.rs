//! Process-startup configuration.

use crate::ids::ShardCount;

/// Knobs the embedding process fixes before any shard thread spawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// How many single-threaded shards partition the keyspace.
    pub shard_count: ShardCount,
    /// TCP port the surrounding binary serves RESP on.
    pub redis_port: u16,
    /// Memory ceiling in bytes; zero disables the ceiling.
    pub max_memory_bytes: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shard_count: ShardCount::new(4).expect("4 is non-zero"),
            redis_port: 6379,
            max_memory_bytes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RuntimeConfig;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn default_config_matches_documented_values() {
        let config = RuntimeConfig::default();
        assert_that!(config.shard_count.get(), eq(4_u16));
        assert_that!(config.redis_port, eq(6379_u16));
        assert_that!(config.max_memory_bytes, eq(0_u64));
    }
}
