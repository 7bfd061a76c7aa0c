//! Shard-owned storage surfaces: intent lock bookkeeping and the keyspace slice.

pub mod db_slice;
pub mod intent_lock;

pub use db_slice::{DbSlice, KeyLockArgs};
pub use intent_lock::{IntentLock, LockMode};
