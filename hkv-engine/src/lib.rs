//! Core cache engine: an ordered index of live entries coupled to an
//! eviction priority structure, with two interchangeable cores — a
//! red-black-tree-style prioritized engine and an arena-chained TTL
//! engine for typed values.

pub mod arena;
pub mod engine;
pub mod error;
pub mod index;
pub mod node;
pub mod priority;

pub use arena::{ArenaEngineConfig, ArenaTtlEngine, CleanerHandle};
pub use engine::{EngineConfig, ExpirationHandle, PrioritizedEngine, PriorityPolicy};
pub use error::{EngineError, EngineResult, MismatchReason};
pub use index::OrderedIndex;
pub use node::{CacheValue, Deadline, Kind, Payload, Value};
pub use priority::{PriorityBucket, PriorityStructure};
