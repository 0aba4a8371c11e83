// hkv-common - Shared error types for HybridKV crates.

pub mod error;

pub use error::{HkvError, HkvResult, MAX_KEY_SIZE, MAX_VALUE_SIZE};
