//! Transaction coordination across single-threaded execution shards.
//!
//! A transaction distributes its arguments to the shards owning the touched keys, schedules
//! itself into a globally consistent order, and dispatches the per-hop callback into every
//! participating shard thread. Multi-command transactions (`MULTI`/`EXEC`, scripting) reuse
//! one transaction object across hops; blocking commands suspend on watched keys and are
//! awakened by shard-side notifications.

pub mod blocking;
pub mod key_index;
pub mod shard;
pub mod shard_set;
pub mod transaction;
pub mod tx_queue;


pub use blocking::BlockingController;
pub use key_index::{KeyIndex, determine_keys};
pub use shard::{EngineShard, ShardStats};
pub use shard_set::{ShardSet, ShardTask};
pub use transaction::{MultiMode, RunnableFn, Transaction, WaitKeysProvider, slot_flags};
pub use tx_queue::TxQueue;
