//! Container aliases for shard-local tables.
//!
//! Lock tables and watch queues sit on the per-command path, so their container choice is a
//! single decision made here rather than something each module picks for itself.

use hashbrown::{HashMap as HbMap, HashSet as HbSet};

/// Hash map for shard-local state tables.
pub type HotMap<K, V> = HbMap<K, V>;

/// Hash set for lock and watch secondary indexes.
pub type HotSet<T> = HbSet<T>;
