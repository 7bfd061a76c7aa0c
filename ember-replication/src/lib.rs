//! Replication-facing journal model.

pub mod journal;

pub use journal::{InMemoryJournal, JournalEntry, JournalOp, JournalPayload};
