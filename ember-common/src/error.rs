//! Shared error and status model for cross-crate APIs.

use thiserror::Error;

/// Result alias for infrastructure interfaces in `emberkv`.
pub type EmberResult<T> = Result<T, EmberError>;

/// Failures of the machinery around commands: bootstrap parameters, lifecycle misuse, and the
/// filesystem underneath.
///
/// Command-level outcomes never travel through this enum; they use [`OpStatus`] so hop
/// aggregation can treat them as plain values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmberError {
    /// A bootstrap parameter is outside its accepted range.
    #[error("config rejected: {0}")]
    Config(&'static str),

    /// The operation was issued against a component in the wrong lifecycle phase.
    #[error("runtime misuse: {0}")]
    Runtime(&'static str),

    /// The filesystem beneath a persistence surface failed.
    #[error("i/o failure: {0}")]
    Io(String),
}

/// Status domain for shard callbacks and transaction hops.
///
/// `Ok` is a first-class value rather than the absence of an error: multi-shard hops aggregate
/// one status per shard and `OutOfMemory` wins over `Ok` at aggregation time. Scheduling
/// conflicts are internal retries and never surface here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpStatus {
    /// Callback completed.
    #[default]
    Ok,
    /// Domain status: key does not exist.
    KeyNotFound,
    /// Domain status: value exists under an incompatible type.
    WrongType,
    /// Allocation failed inside a shard callback; retriable by the client.
    OutOfMemory,
    /// Malformed command shape detected during key-index extraction.
    SyntaxError,
    /// Argument-embedded integer failed to parse or was negative.
    InvalidInt,
    /// Blocking wait expired before a notification arrived.
    TimedOut,
}

/// Fallible coordinator entry points: `Err` carries a non-`Ok` [`OpStatus`].
pub type OpResult<T> = Result<T, OpStatus>;

impl OpStatus {
    /// Whether the status reports success.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Stable human-readable tag used in log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::KeyNotFound => "KEY_NOTFOUND",
            Self::WrongType => "WRONG_TYPE",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::SyntaxError => "SYNTAX_ERR",
            Self::InvalidInt => "INVALID_INT",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::OpStatus;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn ok_status_is_ok_and_default() {
        assert_that!(OpStatus::default().is_ok(), eq(true));
        assert_that!(OpStatus::OutOfMemory.is_ok(), eq(false));
    }

    #[rstest]
    #[case(OpStatus::SyntaxError, "SYNTAX_ERR")]
    #[case(OpStatus::InvalidInt, "INVALID_INT")]
    #[case(OpStatus::OutOfMemory, "OUT_OF_MEMORY")]
    fn status_renders_stable_tags(#[case] status: OpStatus, #[case] tag: &str) {
        assert_that!(status.to_string().as_str(), eq(tag));
    }
}
