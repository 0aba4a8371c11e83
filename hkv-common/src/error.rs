//! Shared error type for crates that sit below the engine's own
//! `EngineError` (bound-checked byte buffers, anything that validates
//! input before it ever reaches the cache core).

use thiserror::Error;

/// Maximum key size accepted by length-bounded byte buffers in this crate.
pub const MAX_KEY_SIZE: usize = 256;

/// Maximum value size accepted by length-bounded byte buffers in this crate.
pub const MAX_VALUE_SIZE: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HkvError {
    #[error("key exceeds maximum size of {MAX_KEY_SIZE} bytes")]
    KeyTooLong,

    #[error("value exceeds maximum size of {MAX_VALUE_SIZE} bytes")]
    ValueTooLong,

    #[error("key not found")]
    NotFound,
}

pub type HkvResult<T> = Result<T, HkvError>;
