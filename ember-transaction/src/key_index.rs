//! Key-position extraction from command metadata.

use ember_common::error::{OpResult, OpStatus};
use ember_core::command::{CmdFlags, CommandId};

/// Span of key positions inside a full argument sequence (command name at position 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIndex {
    /// First key position, inclusive.
    pub start: usize,
    /// End of the key range, exclusive.
    pub end: usize,
    /// Distance between consecutive keys; step 2 means each key is followed by its value.
    pub step: usize,
    /// Extra key outside the range (destination of `*STORE` variants).
    pub bonus: Option<usize>,
}

impl KeyIndex {
    /// Index with no key positions, used by global transactions.
    #[must_use]
    pub const fn empty() -> Self {
        Self::range(0, 0)
    }

    /// Contiguous single-step range `[start, end)`.
    #[must_use]
    pub const fn range(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            step: 1,
            bonus: None,
        }
    }

    /// Number of arguments covered by the index, values of step-2 commands included.
    #[must_use]
    pub const fn num_args(&self) -> usize {
        self.end.saturating_sub(self.start) + if self.bonus.is_some() { 1 } else { 0 }
    }

    /// Whether the index covers exactly one key (and its accompanying value, if any).
    #[must_use]
    pub const fn has_single_key(&self) -> bool {
        self.bonus.is_none() && self.start + self.step == self.end
    }
}

/// Derives the key-position set of `args` from command metadata.
///
/// # Errors
///
/// Returns `SyntaxError` when the argument list is too short for the command shape and
/// `InvalidInt` when an argument-embedded key count fails to parse as a non-negative integer.
pub fn determine_keys(cid: &CommandId, args: &[Vec<u8>]) -> OpResult<KeyIndex> {
    if cid.flags().contains(CmdFlags::GLOBAL_TRANS) {
        return Ok(KeyIndex::empty());
    }

    let mut num_custom_keys: i64 = -1;
    let mut bonus = None;

    if cid.flags().contains(CmdFlags::VARIADIC_KEYS) {
        // ZUNIONSTORE <dest> <num_keys> <key1> ..., EVAL <script> <num_keys> <key1> ...
        if args.len() < 3 {
            return Err(OpStatus::SyntaxError);
        }

        let name = cid.name();
        if name.ends_with("STORE") {
            bonus = Some(1);
        }

        let num_keys_index = if name.starts_with("EVAL") {
            2
        } else {
            bonus.unwrap_or(0) + 1
        };

        let parsed = std::str::from_utf8(&args[num_keys_index])
            .ok()
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|count| *count >= 0);
        let Some(count) = parsed else {
            return Err(OpStatus::InvalidInt);
        };
        num_custom_keys = count;

        let required = (num_keys_index as i64).saturating_add(count).saturating_add(1);
        if (args.len() as i64) < required {
            return Err(OpStatus::SyntaxError);
        }
    }

    if cid.first_key_pos() > 0 {
        let start = cid.first_key_pos() as usize;
        let last = cid.last_key_pos();
        let end = if num_custom_keys >= 0 {
            start + num_custom_keys as usize
        } else if last > 0 {
            last as usize + 1
        } else {
            (args.len() as i64 + 1 + i64::from(last)) as usize
        };
        return Ok(KeyIndex {
            start,
            end,
            step: cid.key_arg_step() as usize,
            bonus,
        });
    }

    panic!("command {} carries no key metadata", cid.name());
}

#[cfg(test)]
mod tests {
    use super::{KeyIndex, determine_keys};
    use ember_common::error::OpStatus;
    use ember_core::command::{CmdFlags, CommandId};
    use googletest::prelude::*;
    use rstest::rstest;

    fn args(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|item| item.as_bytes().to_vec()).collect()
    }

    const GET: CommandId = CommandId::new("GET", CmdFlags::READONLY, 1, 1, 1);
    const MGET: CommandId = CommandId::new("MGET", CmdFlags::READONLY, 1, -1, 1);
    const MSET: CommandId = CommandId::new("MSET", CmdFlags::WRITE, 1, -1, 2);
    const EVAL: CommandId = CommandId::new("EVAL", CmdFlags::VARIADIC_KEYS, 3, 3, 1);
    const ZUNIONSTORE: CommandId =
        CommandId::new("ZUNIONSTORE", CmdFlags::VARIADIC_KEYS, 3, 3, 1);
    const FLUSHALL: CommandId = CommandId::new("FLUSHALL", CmdFlags::GLOBAL_TRANS, 0, 0, 0);

    #[rstest]
    fn global_command_has_empty_index() {
        let index = determine_keys(&FLUSHALL, &args(&["FLUSHALL"])).expect("must succeed");
        assert_that!(index.num_args(), eq(0_usize));
    }

    #[rstest]
    fn single_key_command_covers_one_position() {
        let index = determine_keys(&GET, &args(&["GET", "a"])).expect("must succeed");
        assert_that!(index, eq(KeyIndex::range(1, 2)));
        assert_that!(index.has_single_key(), eq(true));
    }

    #[rstest]
    fn trailing_keys_resolve_negative_last_position() {
        let index = determine_keys(&MGET, &args(&["MGET", "a", "b", "c"])).expect("must succeed");
        assert_that!(index.start, eq(1_usize));
        assert_that!(index.end, eq(4_usize));
        assert_that!(index.has_single_key(), eq(false));
    }

    #[rstest]
    fn pair_command_steps_over_values() {
        let index =
            determine_keys(&MSET, &args(&["MSET", "k1", "v1", "k2", "v2"])).expect("must succeed");
        assert_that!(index.step, eq(2_usize));
        assert_that!(index.end, eq(5_usize));
        assert_that!(index.num_args(), eq(4_usize));
    }

    #[rstest]
    fn single_pair_counts_as_single_key() {
        let index = determine_keys(&MSET, &args(&["MSET", "k", "v"])).expect("must succeed");
        assert_that!(index.has_single_key(), eq(true));
    }

    #[rstest]
    fn eval_reads_key_count_from_position_two() {
        let index = determine_keys(&EVAL, &args(&["EVAL", "script", "2", "k1", "k2"]))
            .expect("must succeed");
        assert_that!(index.start, eq(3_usize));
        assert_that!(index.end, eq(5_usize));
        assert_that!(index.bonus, eq(None::<usize>));
    }

    #[rstest]
    fn eval_with_zero_keys_has_empty_range() {
        let index = determine_keys(&EVAL, &args(&["EVAL", "script", "0"])).expect("must succeed");
        assert_that!(index.start, eq(3_usize));
        assert_that!(index.num_args(), eq(0_usize));
    }

    #[rstest]
    #[case(&["EVAL", "script", "abc"])]
    #[case(&["EVAL", "script", "-1"])]
    fn eval_rejects_malformed_key_count(#[case] input: &[&str]) {
        let result = determine_keys(&EVAL, &args(input));
        assert_that!(result, eq(Err(OpStatus::InvalidInt)));
    }

    #[rstest]
    fn eval_rejects_too_few_arguments() {
        let result = determine_keys(&EVAL, &args(&["EVAL", "script"]));
        assert_that!(result, eq(Err(OpStatus::SyntaxError)));
    }

    #[rstest]
    fn eval_rejects_key_count_exceeding_arguments() {
        let result = determine_keys(&EVAL, &args(&["EVAL", "script", "3", "k1"]));
        assert_that!(result, eq(Err(OpStatus::SyntaxError)));
    }

    #[rstest]
    fn store_variant_records_destination_as_bonus_key() {
        let index = determine_keys(&ZUNIONSTORE, &args(&["ZUNIONSTORE", "dest", "2", "k1", "k2"]))
            .expect("must succeed");
        assert_that!(index.bonus, eq(Some(1_usize)));
        assert_that!(index.start, eq(3_usize));
        assert_that!(index.end, eq(5_usize));
        assert_that!(index.num_args(), eq(3_usize));
        assert_that!(index.has_single_key(), eq(false));
    }
}
