//! Error taxonomy for the prioritized cache engine.

use thiserror::Error;

/// Which operation family rejected a key because its node holds the wrong kind.
///
/// One variant per operation family: a distinct tag beats a
/// single `KindMismatch(Kind)` because callers can match on "what was I
/// trying to do" instead of cross-referencing the node's actual kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchReason {
    KvCanSet,
    KvCanGet,
    KvCanGetSet,
    KvNxCanSetNx,
    ListCanLPush,
    ListCanLPop,
    SetCanSAdd,
    SetCanSRem,
    NumCanIncrBy,
    NumCanDecrBy,
    /// A counter already touched by the integer accessor (`IncrBy`/`DecrBy`)
    /// was targeted by `IncrByFloat`, or vice versa — the two accessors
    /// disagree on how the stored `i64` bits are interpreted, so mixing them
    /// on one key is rejected rather than silently corrupting the counter.
    NumReprConflict,
}

impl MismatchReason {
    const fn requires(self) -> &'static str {
        match self {
            Self::KvCanSet => "Set requires a KV node",
            Self::KvCanGet => "Get requires a KV node",
            Self::KvCanGetSet => "GetSet requires a KV node",
            Self::KvNxCanSetNx => "SetNX requires a KV-exclusive node",
            Self::ListCanLPush => "LPush requires a List node",
            Self::ListCanLPop => "LPop requires a List node",
            Self::SetCanSAdd => "SAdd requires a Set node",
            Self::SetCanSRem => "SRem requires a Set node",
            Self::NumCanIncrBy => "IncrBy requires a Counter node",
            Self::NumCanDecrBy => "DecrBy requires a Counter node",
            Self::NumReprConflict => {
                "counter is already using the other numeric representation (int vs float)"
            }
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("key not found")]
    KeyNotFound,

    #[error("{}", .0.requires())]
    KindMismatch(MismatchReason),

    #[error("wrong priority policy configuration: {0}")]
    WrongPriorityPolicy(&'static str),
}

pub type EngineResult<T> = Result<T, EngineError>;
