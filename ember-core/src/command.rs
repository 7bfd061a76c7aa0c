//! Static command descriptors consumed by the transaction coordinator.
//!
//! A command is described by a flag mask plus its key-position geometry. The coordinator never
//! interprets command semantics; it only needs to know which argument positions carry keys and
//! which behaviors (global barrier, variadic keys, reply-order mapping, journaling) apply.

use std::ops::BitOr;

/// Option mask over command behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmdFlags(u32);

impl CmdFlags {
    /// No behavior flags.
    pub const NONE: Self = Self(0);
    /// Command mutates the keyspace.
    pub const WRITE: Self = Self(1 << 0);
    /// Command only reads; shared intent locks suffice.
    pub const READONLY: Self = Self(1 << 1);
    /// Command takes the shard-wide barrier instead of per-key locks.
    pub const GLOBAL_TRANS: Self = Self(1 << 2);
    /// Key count is embedded in the argument list (`EVAL`, `ZUNIONSTORE`, ...).
    pub const VARIADIC_KEYS: Self = Self(1 << 3);
    /// Replies must be reported in input argument order.
    pub const REVERSE_MAPPING: Self = Self(1 << 4);
    /// Write command excluded from automatic journaling.
    pub const NO_AUTOJOURNAL: Self = Self(1 << 5);

    /// Whether every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CmdFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Descriptor for one command: name, flags, and key-position geometry.
///
/// `first_key`/`last_key` are 1-based positions inside the full argument sequence (position 0
/// is the command name). A non-positive `last_key` is relative to the end of the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandId {
    name: &'static str,
    flags: CmdFlags,
    first_key: u32,
    last_key: i32,
    key_step: u32,
}

impl CommandId {
    /// Creates a command descriptor.
    #[must_use]
    pub const fn new(
        name: &'static str,
        flags: CmdFlags,
        first_key: u32,
        last_key: i32,
        key_step: u32,
    ) -> Self {
        Self {
            name,
            flags,
            first_key,
            last_key,
            key_step,
        }
    }

    /// Canonical uppercase command name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Behavior flag mask.
    #[must_use]
    pub const fn flags(&self) -> CmdFlags {
        self.flags
    }

    /// 1-based position of the first key argument; zero means the command carries no keys.
    #[must_use]
    pub const fn first_key_pos(&self) -> u32 {
        self.first_key
    }

    /// 1-based position of the last key argument; non-positive values count from the end.
    #[must_use]
    pub const fn last_key_pos(&self) -> i32 {
        self.last_key
    }

    /// Distance between consecutive key positions (2 for key/value pair commands).
    #[must_use]
    pub const fn key_arg_step(&self) -> u32 {
        self.key_step
    }

    /// Whether the command mutates the keyspace.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.flags.contains(CmdFlags::WRITE)
    }
}

#[cfg(test)]
mod tests {
    use super::{CmdFlags, CommandId};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn flag_mask_combines_and_queries() {
        let mask = CmdFlags::WRITE | CmdFlags::NO_AUTOJOURNAL;
        assert_that!(mask.contains(CmdFlags::WRITE), eq(true));
        assert_that!(mask.contains(CmdFlags::NO_AUTOJOURNAL), eq(true));
        assert_that!(mask.contains(CmdFlags::READONLY), eq(false));
        assert_that!(mask.contains(CmdFlags::NONE), eq(true));
    }

    #[rstest]
    fn descriptor_exposes_key_geometry() {
        let mset = CommandId::new("MSET", CmdFlags::WRITE, 1, -1, 2);
        assert_that!(mset.name(), eq("MSET"));
        assert_that!(mset.first_key_pos(), eq(1_u32));
        assert_that!(mset.last_key_pos(), eq(-1_i32));
        assert_that!(mset.key_arg_step(), eq(2_u32));
        assert_that!(mset.is_write(), eq(true));
    }
}
