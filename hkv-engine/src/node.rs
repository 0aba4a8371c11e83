//! The tagged entry type stored in the Ordered Index, plus the pluggable
//! value-shape trait it holds for KV and KV-exclusive payloads.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use hashbrown::HashSet;

/// Process-wide monotonic origin. `Instant` has no fixed epoch to measure
/// against, so every node's "last accessed at" is expressed as nanoseconds
/// since this single shared reference point instead of since the node's own
/// `created_at` — the LRU weight function needs one timeline all nodes are
/// comparable on, matching spec.md §4.D's absolute `unix_seconds()`.
fn timeline_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Pluggable value shape stored behind a KV or KV-exclusive node.
///
/// A stored value may optionally declare its own eviction weight.
/// Everything else about the value is opaque to the engine, which only
/// needs to know how big it is (for the Memory policy) and how to display
/// it for debugging.
pub trait CacheValue: fmt::Debug + Send + Sync + 'static {
    /// In-memory footprint of the value, used by the Memory priority
    /// policy. Measures the value itself, not anything it might point to
    /// Measures the value itself, not anything it contains.
    fn memory_size(&self) -> usize;

    /// Optional self-reported eviction weight, consumed by the Weight
    /// priority policy. Returning `None` means "use `default_weight`".
    fn weight(&self) -> Option<i64> {
        None
    }

    /// Content equality against another `CacheValue`, used by `SetNX`'s
    /// "present, same value → refresh deadline" branch. Referential
    /// identity (`Arc::ptr_eq`) is the wrong test here: a caller that
    /// reconstructs an equal-content value on every call (the normal
    /// pattern for an in-process client) never shares the same `Arc`, so
    /// comparing pointers would always take the "different value" branch.
    /// Types that don't override this default never refresh-without-
    /// overwrite; they fall into `SetNX`'s ordinary different-value path.
    fn value_eq(&self, _other: &dyn CacheValue) -> bool {
        false
    }

    /// Downcast hook `value_eq` implementations use to compare against a
    /// concrete type.
    fn as_any(&self) -> &dyn Any;
}

impl CacheValue for Vec<u8> {
    fn memory_size(&self) -> usize {
        self.len()
    }

    fn value_eq(&self, other: &dyn CacheValue) -> bool {
        other.as_any().downcast_ref::<Vec<u8>>().is_some_and(|o| o == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl CacheValue for String {
    fn memory_size(&self) -> usize {
        self.len()
    }

    fn value_eq(&self, other: &dyn CacheValue) -> bool {
        other.as_any().downcast_ref::<String>().is_some_and(|o| o == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl CacheValue for i64 {
    fn memory_size(&self) -> usize {
        std::mem::size_of::<i64>()
    }

    fn value_eq(&self, other: &dyn CacheValue) -> bool {
        other.as_any().downcast_ref::<i64>().is_some_and(|o| o == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A KV/KV-exclusive payload: a shared, reference-counted handle to a
/// pluggable value. `Arc` keeps reads zero-copy.
pub type Value = Arc<dyn CacheValue>;

/// Discriminant of a Value Node. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Kv,
    KvExclusive,
    List,
    Set,
    Counter,
}

/// The kind-tagged payload. A tagged variant rather than a generic `any`
/// erasure.
#[derive(Debug)]
pub enum Payload {
    Kv(Value),
    KvExclusive(Value),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<Vec<u8>>),
    Counter(i64),
}

/// Absolute expiration instant. `None` encodes "never expires" (the
/// zero-TTL convention, translated to `Option` since `Instant` has no zero).
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub const NEVER: Deadline = Deadline(None);

    /// Builds a deadline from a TTL relative to `now`. A zero TTL means
    /// never expires; a negative TTL is permitted and encodes an
    /// already-expired node (used by tests and by SetNX overwrite-on-stale).
    pub fn from_ttl(now: Instant, ttl: Duration, negative: bool) -> Self {
        if ttl.is_zero() && !negative {
            return Deadline::NEVER;
        }
        if negative {
            // now - ttl, saturating so a huge negative TTL can't panic.
            Deadline(Some(now.checked_sub(ttl).unwrap_or(now)))
        } else {
            Deadline(Some(now + ttl))
        }
    }

    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    pub fn is_never(&self) -> bool {
        self.0.is_none()
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// `alive(now) = deadline.is_zero() ∨ now < deadline`.
    pub fn alive(&self, now: Instant) -> bool {
        match self.0 {
            None => true,
            Some(deadline) => now < deadline,
        }
    }
}

/// A single entry in the Ordered Index.
///
/// `last_access`/`access_count` are atomics so `Get`'s shared-lock fast
/// path can bump them without escalating to the exclusive lock.
#[derive(Debug)]
pub struct ValueNode {
    key: Vec<u8>,
    kind: Kind,
    payload: Payload,
    deadline: Deadline,
    created_at: Instant,
    last_access_nanos: AtomicU64,
    access_count: AtomicU64,
    /// Back-reference to the owning Priority Bucket, named by weight
    /// A stable identifier rather than a shared owning pointer.
    /// Only KV nodes are ever bound.
    bucket: AtomicI64,
    /// Which accessor (`IncrBy`/`DecrBy` vs `IncrByFloat`) has interpreted
    /// this Counter node's stored `i64` bits so far. Only meaningful for
    /// `Kind::Counter` nodes; `CounterRepr::Untouched` until first use.
    counter_repr: AtomicU8,
}

/// Sentinel stored in `bucket` meaning "not currently bound to a bucket".
const UNBOUND: i64 = i64::MIN;

const REPR_UNTOUCHED: u8 = 0;
const REPR_INT: u8 = 1;
const REPR_FLOAT: u8 = 2;

impl ValueNode {
    fn new(key: Vec<u8>, kind: Kind, payload: Payload, deadline: Deadline, now: Instant) -> Self {
        ValueNode {
            key,
            kind,
            payload,
            deadline,
            created_at: now,
            last_access_nanos: AtomicU64::new(0),
            access_count: AtomicU64::new(0),
            bucket: AtomicI64::new(UNBOUND),
            counter_repr: AtomicU8::new(REPR_UNTOUCHED),
        }
    }

    pub fn new_kv(key: Vec<u8>, val: Value, deadline: Deadline, now: Instant) -> Self {
        Self::new(key, Kind::Kv, Payload::Kv(val), deadline, now)
    }

    pub fn new_kv_exclusive(key: Vec<u8>, val: Value, deadline: Deadline, now: Instant) -> Self {
        Self::new(key, Kind::KvExclusive, Payload::KvExclusive(val), deadline, now)
    }

    pub fn new_list(key: Vec<u8>, now: Instant) -> Self {
        Self::new(key, Kind::List, Payload::List(VecDeque::new()), Deadline::NEVER, now)
    }

    pub fn new_set(key: Vec<u8>, init_capacity: usize, now: Instant) -> Self {
        Self::new(
            key,
            Kind::Set,
            Payload::Set(HashSet::with_capacity(init_capacity)),
            Deadline::NEVER,
            now,
        )
    }

    pub fn new_counter(key: Vec<u8>, now: Instant) -> Self {
        Self::new(key, Kind::Counter, Payload::Counter(0), Deadline::NEVER, now)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Deadline) {
        self.deadline = deadline;
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn alive(&self, now: Instant) -> bool {
        self.deadline.alive(now)
    }

    /// Bumps last-access and access-count under a shared lock.
    /// `Get` never updates `deadline`.
    pub fn touch(&self, now: Instant) {
        let nanos = now.saturating_duration_since(timeline_origin()).as_nanos() as u64;
        self.last_access_nanos.store(nanos, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since the shared process-wide timeline origin of the last
    /// access, 0 if never accessed. An absolute value comparable across all
    /// nodes, not relative to each node's own `created_at`.
    pub fn last_access_secs(&self) -> u64 {
        self.last_access_nanos.load(Ordering::Relaxed) / 1_000_000_000
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn bucket_weight(&self) -> Option<i64> {
        match self.bucket.load(Ordering::Relaxed) {
            UNBOUND => None,
            weight => Some(weight),
        }
    }

    pub fn set_bucket_weight(&self, weight: Option<i64>) {
        self.bucket.store(weight.unwrap_or(UNBOUND), Ordering::Relaxed);
    }

    /// Claims this Counter node for the integer accessor (`IncrBy`/`DecrBy`).
    /// Returns `false` if it was already claimed by `IncrByFloat`.
    pub fn claim_counter_int(&self) -> bool {
        self.claim_counter_repr(REPR_INT)
    }

    /// Claims this Counter node for `IncrByFloat`. Returns `false` if it was
    /// already claimed by the integer accessor.
    pub fn claim_counter_float(&self) -> bool {
        self.claim_counter_repr(REPR_FLOAT)
    }

    fn claim_counter_repr(&self, repr: u8) -> bool {
        match self
            .counter_repr
            .compare_exchange(REPR_UNTOUCHED, repr, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => true,
            Err(existing) => existing == repr,
        }
    }
}
