//! Orchestrates the Ordered Index and the Priority Structure, implements
//! Set/SetNX/Get/GetSet and the list/set/counter mutators, enforces
//! capacity via eviction, and performs TTL reclamation with double-check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{EngineError, EngineResult, MismatchReason};
use crate::index::OrderedIndex;
use crate::node::{Deadline, Kind, Payload, Value, ValueNode};
use crate::priority::PriorityStructure;

/// Selects the weight function used to order the Priority Structure
/// `Default` is an alias for `Weight`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityPolicy {
    Default,
    Lru,
    Lfu,
    Memory,
    Weight,
}

impl PriorityPolicy {
    /// LRU and LFU always evict ascending (oldest/least-used first),
    /// regardless of the configured `ascending` flag.
    fn forces_ascending(self) -> bool {
        matches!(self, PriorityPolicy::Lru | PriorityPolicy::Lfu)
    }
}

/// Configuration for a [`PrioritizedEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    capacity_limit: usize,
    priority_policy: PriorityPolicy,
    default_weight: i64,
    ascending: bool,
    max_weight: i64,
    scan_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            capacity_limit: 0,
            priority_policy: PriorityPolicy::Default,
            default_weight: 0,
            ascending: true,
            max_weight: i64::MAX / 2,
            scan_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// `0` means unbounded.
    pub fn capacity_limit(mut self, limit: usize) -> Self {
        self.capacity_limit = limit;
        self
    }

    pub fn priority_policy(mut self, policy: PriorityPolicy) -> Self {
        self.priority_policy = policy;
        self
    }

    pub fn default_weight(mut self, weight: i64) -> Self {
        self.default_weight = weight;
        self
    }

    pub fn ascending(mut self, ascending: bool) -> Self {
        self.ascending = ascending;
        self
    }

    pub fn max_weight(mut self, max_weight: i64) -> Self {
        self.max_weight = max_weight;
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Validates the configuration and builds the engine. Rejects a
    /// non-positive `max_weight`, since every clamp/invert computation in
    /// the Memory and Weight policies divides the weight space by it — a
    /// construction-time `WrongPriorityPolicy` rejection (the one condition
    /// the crate checks; left deliberately narrow rather than guessing at
    /// others).
    pub fn build(self) -> EngineResult<PrioritizedEngine> {
        if self.max_weight <= 0 {
            return Err(EngineError::WrongPriorityPolicy(
                "max_weight must be positive",
            ));
        }
        let ascending = self.ascending || self.priority_policy.forces_ascending();
        tracing::info!(
            policy = ?self.priority_policy,
            capacity_limit = self.capacity_limit,
            ascending,
            "prioritized engine constructed"
        );
        Ok(PrioritizedEngine {
            state: RwLock::new(EngineState {
                index: OrderedIndex::new(),
                priority: PriorityStructure::new(),
                kv_count: 0,
            }),
            config: EngineConfig { ascending, ..self },
        })
    }
}

struct EngineState {
    index: OrderedIndex,
    priority: PriorityStructure,
    /// Count of KV-kind nodes, the only kind subject to capacity eviction
    /// (KV-exclusive/List/Set/Counter are never bound).
    kv_count: usize,
}

/// The prioritized cache engine. A single `RwLock` guards the
/// Index and Priority Structure together so every mutation pairs them in
/// lock-step.
pub struct PrioritizedEngine {
    state: RwLock<EngineState>,
    config: EngineConfig,
}

/// Handle for the background active-expiration sweeper.
pub struct ExpirationHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ExpirationHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl EngineState {
    fn weight_of(&self, config: &EngineConfig, node: &ValueNode, now: Instant) -> i64 {
        let raw = match config.priority_policy {
            PriorityPolicy::Lru => return node.last_access_secs() as i64,
            PriorityPolicy::Lfu => return node.access_count() as i64,
            PriorityPolicy::Memory => match node.payload() {
                Payload::Kv(v) | Payload::KvExclusive(v) => v.memory_size() as i64,
                _ => 0,
            },
            PriorityPolicy::Weight | PriorityPolicy::Default => match node.payload() {
                Payload::Kv(v) | Payload::KvExclusive(v) => {
                    v.weight().unwrap_or(config.default_weight)
                }
                _ => config.default_weight,
            },
        };
        let _ = now;
        let clamped = raw.clamp(0, config.max_weight);
        if config.ascending {
            clamped
        } else {
            config.max_weight - clamped
        }
    }

    /// Binds a KV node into the priority structure at its current weight.
    fn bind_node(&mut self, config: &EngineConfig, key: &[u8], now: Instant) {
        let weight = {
            let node = self.index.find(key).expect("node just inserted");
            self.weight_of(config, node, now)
        };
        self.priority.bind(key, weight);
        let node = self.index.find(key).expect("node just inserted");
        node.set_bucket_weight(Some(weight));
    }

    fn unbind_node(&mut self, key: &[u8]) {
        if let Some(node) = self.index.find(key) {
            if let Some(weight) = node.bucket_weight() {
                self.priority.unbind(key, weight);
                node.set_bucket_weight(None);
            }
        }
    }

    fn rebind_node(&mut self, config: &EngineConfig, key: &[u8], now: Instant) {
        self.unbind_node(key);
        self.bind_node(config, key, now);
    }

    /// Evicts victims until inserting one more KV node would not exceed
    /// `capacity_limit`. Must run inside the
    /// same exclusive section as the insertion it guards.
    fn evict_while_full(&mut self, config: &EngineConfig) {
        if config.capacity_limit == 0 {
            return;
        }
        while self.kv_count + 1 > config.capacity_limit {
            match self.priority.pop_victim() {
                Some(victim) => {
                    if let Some(node) = self.index.remove(&victim) {
                        if node.kind() == Kind::Kv {
                            self.kv_count -= 1;
                        }
                        tracing::debug!(key = ?String::from_utf8_lossy(&victim), "evicted");
                    }
                }
                None => {
                    tracing::warn!("capacity exceeded but priority structure is empty");
                    break;
                }
            }
        }
    }

    /// Removes a node found to be expired, after re-verifying under the
    /// exclusive lock (the double-check protocol).
    fn reclaim_if_still_expired(&mut self, key: &[u8], now: Instant) -> bool {
        let still_expired = match self.index.find(key) {
            Some(node) => !node.alive(now),
            None => return false,
        };
        if still_expired {
            self.unbind_node(key);
            if let Some(node) = self.index.remove(key) {
                if node.kind() == Kind::Kv {
                    self.kv_count -= 1;
                }
            }
        }
        still_expired
    }
}

impl PrioritizedEngine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sets a KV entry, creating, overwriting, or (if over capacity) evicting first.
    pub fn set(&self, key: &[u8], val: Value, ttl: Duration) -> EngineResult<()> {
        self.set_with_negative_ttl(key, val, ttl, false)
    }

    /// As `set`, but allows an already-expired deadline for tests and for
    /// a scenario).
    pub fn set_expired(&self, key: &[u8], val: Value, ttl: Duration) -> EngineResult<()> {
        self.set_with_negative_ttl(key, val, ttl, true)
    }

    fn set_with_negative_ttl(
        &self,
        key: &[u8],
        val: Value,
        ttl: Duration,
        negative: bool,
    ) -> EngineResult<()> {
        let now = Instant::now();
        let deadline = Deadline::from_ttl(now, ttl, negative);
        let mut state = self.state.write();

        if let Some(node) = state.index.find_mut(key) {
            if node.kind() != Kind::Kv {
                return Err(EngineError::KindMismatch(MismatchReason::KvCanSet));
            }
            *node.payload_mut() = Payload::Kv(val);
            node.set_deadline(deadline);
            state.rebind_node(&self.config, key, now);
            return Ok(());
        }

        state.evict_while_full(&self.config);
        let node = ValueNode::new_kv(key.to_vec(), val, deadline, now);
        state.index.insert(node).ok();
        state.kv_count += 1;
        state.bind_node(&self.config, key, now);
        Ok(())
    }

    /// Sets a KV-exclusive entry only if absent or expired.
    pub fn set_nx(&self, key: &[u8], val: Value, ttl: Duration) -> EngineResult<bool> {
        let now = Instant::now();
        let deadline = Deadline::from_ttl(now, ttl, false);
        let mut state = self.state.write();

        let Some(node) = state.index.find_mut(key) else {
            let node = ValueNode::new_kv_exclusive(key.to_vec(), val, deadline, now);
            state.index.insert(node).ok();
            return Ok(true);
        };

        if node.kind() != Kind::KvExclusive {
            return Err(EngineError::KindMismatch(MismatchReason::KvNxCanSetNx));
        }

        let same_value =
            matches!(node.payload(), Payload::KvExclusive(existing) if existing.value_eq(val.as_ref()));
        let alive = node.alive(now);

        if same_value {
            node.set_deadline(deadline);
            return Ok(true);
        }

        if !alive {
            *node.payload_mut() = Payload::KvExclusive(val);
            node.set_deadline(deadline);
            return Ok(true);
        }

        Ok(false)
    }

    /// Reads a KV entry, reclaiming it if found expired.
    pub fn get(&self, key: &[u8]) -> EngineResult<Value> {
        let now = Instant::now();
        {
            let state = self.state.read();
            let node = state.index.find(key).ok_or(EngineError::KeyNotFound)?;
            if node.kind() != Kind::Kv {
                return Err(EngineError::KindMismatch(MismatchReason::KvCanGet));
            }
            if !node.alive(now) {
                // Fall through to the exclusive-lock reclaim path below.
            } else {
                node.touch(now);
                let value = match node.payload() {
                    Payload::Kv(v) => v.clone(),
                    _ => unreachable!("kind checked above"),
                };
                if !matches!(self.config.priority_policy, PriorityPolicy::Lru | PriorityPolicy::Lfu) {
                    return Ok(value);
                }
                // LRU/LFU must reposition the bucket; escalate below.
            }
        }

        let mut state = self.state.write();
        let Some(node) = state.index.find(key) else {
            return Err(EngineError::KeyNotFound);
        };
        if node.kind() != Kind::Kv {
            return Err(EngineError::KindMismatch(MismatchReason::KvCanGet));
        }
        if !node.alive(now) {
            state.reclaim_if_still_expired(key, now);
            return Err(EngineError::KeyNotFound);
        }
        node.touch(now);
        let value = match state.index.find(key).unwrap().payload() {
            Payload::Kv(v) => v.clone(),
            _ => unreachable!("kind checked above"),
        };
        if matches!(self.config.priority_policy, PriorityPolicy::Lru | PriorityPolicy::Lfu) {
            state.rebind_node(&self.config, key, now);
        }
        Ok(value)
    }

    /// Atomically swaps in a new value, returning the old one. Missing or
    /// expired always stores the new value and returns `KeyNotFound` (the
    /// expired old value is not surfaced) — see DESIGN.md for why this
    /// reading is treated as resolved rather than an open question.
    pub fn get_set(&self, key: &[u8], val: Value) -> EngineResult<Value> {
        let now = Instant::now();
        let mut state = self.state.write();

        if let Some(node) = state.index.find_mut(key) {
            if node.kind() != Kind::Kv {
                return Err(EngineError::KindMismatch(MismatchReason::KvCanGetSet));
            }
            if node.alive(now) {
                let old = match node.payload() {
                    Payload::Kv(v) => v.clone(),
                    _ => unreachable!(),
                };
                *node.payload_mut() = Payload::Kv(val);
                node.set_deadline(Deadline::NEVER);
                state.rebind_node(&self.config, key, now);
                return Ok(old);
            }
            // Present but expired: overwrite in place, report absence.
            state.unbind_node(key);
            let node = state.index.find_mut(key).unwrap();
            *node.payload_mut() = Payload::Kv(val);
            node.set_deadline(Deadline::NEVER);
            state.bind_node(&self.config, key, now);
            return Err(EngineError::KeyNotFound);
        }

        state.evict_while_full(&self.config);
        let node = ValueNode::new_kv(key.to_vec(), val, Deadline::NEVER, now);
        state.index.insert(node).ok();
        state.kv_count += 1;
        state.bind_node(&self.config, key, now);
        Err(EngineError::KeyNotFound)
    }

    /// Prepends each value in argument order, so the last argument ends
    /// up at the head.
    pub fn lpush(&self, key: &[u8], vals: &[Vec<u8>]) -> EngineResult<usize> {
        let now = Instant::now();
        let mut state = self.state.write();

        if state.index.find(key).is_none() {
            state.index.insert(ValueNode::new_list(key.to_vec(), now)).ok();
        }
        let node = state.index.find_mut(key).unwrap();
        if node.kind() != Kind::List {
            return Err(EngineError::KindMismatch(MismatchReason::ListCanLPush));
        }
        let Payload::List(list) = node.payload_mut() else { unreachable!() };
        for v in vals {
            list.push_front(v.clone());
        }
        Ok(list.len())
    }

    /// Pops the head of a list, pruning the node once it's empty.
    pub fn lpop(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        let mut state = self.state.write();
        let node = state.index.find_mut(key).ok_or(EngineError::KeyNotFound)?;
        if node.kind() != Kind::List {
            return Err(EngineError::KindMismatch(MismatchReason::ListCanLPop));
        }
        let Payload::List(list) = node.payload_mut() else { unreachable!() };
        let popped = list.pop_front().ok_or(EngineError::KeyNotFound)?;
        if list.is_empty() {
            state.index.remove(key);
        }
        Ok(popped)
    }

    /// Adds members to a set, returning how many were newly added.
    pub fn sadd(&self, key: &[u8], members: &[Vec<u8>]) -> EngineResult<usize> {
        let now = Instant::now();
        let mut state = self.state.write();

        if state.index.find(key).is_none() {
            state
                .index
                .insert(ValueNode::new_set(key.to_vec(), members.len(), now))
                .ok();
        }
        let node = state.index.find_mut(key).unwrap();
        if node.kind() != Kind::Set {
            return Err(EngineError::KindMismatch(MismatchReason::SetCanSAdd));
        }
        let Payload::Set(set) = node.payload_mut() else { unreachable!() };
        let mut added = 0;
        for m in members {
            if set.insert(m.clone()) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Removes members from a set, pruning the node once it's empty.
    pub fn srem(&self, key: &[u8], members: &[Vec<u8>]) -> EngineResult<usize> {
        let mut state = self.state.write();
        let node = state.index.find_mut(key).ok_or(EngineError::KeyNotFound)?;
        if node.kind() != Kind::Set {
            return Err(EngineError::KindMismatch(MismatchReason::SetCanSRem));
        }
        let Payload::Set(set) = node.payload_mut() else { unreachable!() };
        let mut removed = 0;
        for m in members {
            if set.remove(m) {
                removed += 1;
            }
        }
        let empty = set.is_empty();
        if empty {
            state.index.remove(key);
        }
        Ok(removed)
    }

    /// Increments a counter, creating it at zero if absent. Overflow
    /// wraps in two's complement.
    pub fn incr_by(&self, key: &[u8], n: i64) -> EngineResult<i64> {
        self.add_counter(key, n, MismatchReason::NumCanIncrBy)
    }

    /// Decrements a counter, creating it at zero if absent.
    pub fn decr_by(&self, key: &[u8], n: i64) -> EngineResult<i64> {
        self.add_counter(key, n.wrapping_neg(), MismatchReason::NumCanDecrBy)
    }

    fn add_counter(&self, key: &[u8], delta: i64, reason: MismatchReason) -> EngineResult<i64> {
        let now = Instant::now();
        let mut state = self.state.write();

        if state.index.find(key).is_none() {
            state.index.insert(ValueNode::new_counter(key.to_vec(), now)).ok();
        }
        let node = state.index.find_mut(key).unwrap();
        if node.kind() != Kind::Counter {
            return Err(EngineError::KindMismatch(reason));
        }
        if !node.claim_counter_int() {
            return Err(EngineError::KindMismatch(MismatchReason::NumReprConflict));
        }
        let Payload::Counter(value) = node.payload_mut() else { unreachable!() };
        *value = value.wrapping_add(delta);
        Ok(*value)
    }

    /// Deletes keys, returning how many were present and live.
    pub fn delete(&self, keys: &[Vec<u8>]) -> usize {
        let now = Instant::now();
        let mut state = self.state.write();
        let mut removed = 0;
        for key in keys {
            let alive = state.index.find(key).is_some_and(|n| n.alive(now));
            if alive {
                state.unbind_node(key);
                if let Some(node) = state.index.remove(key) {
                    if node.kind() == Kind::Kv {
                        state.kv_count -= 1;
                    }
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Floating-point counter increment. Stored as a counter whose bits
    /// are reinterpreted, since the Counter payload itself is a fixed
    /// `i64`; a node is claimed for either the integer accessor
    /// (`IncrBy`/`DecrBy`) or this one on first use, and mixing the two on
    /// one key is rejected rather than silently reinterpreting the stored
    /// bits under the other representation.
    pub fn incr_by_float(&self, key: &[u8], delta: f64) -> EngineResult<f64> {
        let now = Instant::now();
        let mut state = self.state.write();

        if state.index.find(key).is_none() {
            state.index.insert(ValueNode::new_counter(key.to_vec(), now)).ok();
        }
        let node = state.index.find_mut(key).unwrap();
        if node.kind() != Kind::Counter {
            return Err(EngineError::KindMismatch(MismatchReason::NumCanIncrBy));
        }
        if !node.claim_counter_float() {
            return Err(EngineError::KindMismatch(MismatchReason::NumReprConflict));
        }
        let Payload::Counter(value) = node.payload_mut() else { unreachable!() };
        let current = f64::from_bits(*value as u64);
        let updated = current + delta;
        *value = updated.to_bits() as i64;
        Ok(updated)
    }

    /// Scans all keys under a shared lock and reclaims any whose deadline
    /// has passed (the active reclamation mechanism).
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<Vec<u8>> = {
            let state = self.state.read();
            state
                .index
                .enumerate()
                .filter(|(_, node)| !node.alive(now))
                .map(|(k, _)| k.clone())
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }
        let mut state = self.state.write();
        let mut reclaimed = 0;
        for key in candidates {
            if state.reclaim_if_still_expired(&key, now) {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Starts the background active-expiration sweeper.
    pub fn start_sweeper(self: &Arc<Self>) -> ExpirationHandle {
        let interval = self.config.scan_interval.max(Duration::from_millis(1));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let engine = Arc::clone(self);

        tracing::info!(?interval, "starting background expiration sweeper");
        let join = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                let reclaimed = engine.sweep_expired();
                if reclaimed > 0 {
                    tracing::debug!(reclaimed, "background sweep reclaimed expired entries");
                }
            }
        });

        ExpirationHandle { stop, join: Some(join) }
    }

    /// Number of live KV nodes, for capacity-invariant assertions in tests.
    pub fn kv_count(&self) -> usize {
        self.state.read().kv_count
    }

    pub fn len(&self) -> usize {
        self.state.read().index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn bytes(s: &str) -> Value {
        StdArc::new(s.as_bytes().to_vec())
    }

    #[derive(Debug)]
    struct Weighted(i64);
    impl crate::node::CacheValue for Weighted {
        fn memory_size(&self) -> usize {
            8
        }
        fn weight(&self) -> Option<i64> {
            Some(self.0)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn set_then_get_roundtrip() {
        let engine = EngineConfig::new().build().unwrap();
        engine.set(b"k", bytes("v"), Duration::ZERO).unwrap();
        let v = engine.get(b"k").unwrap();
        assert_eq!(v.memory_size(), 1);
    }

    #[test]
    fn set_nx_refresh_and_reject() {
        let engine = EngineConfig::new().build().unwrap();
        assert!(engine.set_nx(b"k", bytes("a"), Duration::from_secs(60)).unwrap());
        // Different value while the previous entry is still alive: false,
        // and the stored value is untouched.
        assert!(!engine.set_nx(b"k", bytes("b"), Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn set_nx_overwrites_on_expired() {
        let engine = EngineConfig::new().build().unwrap();
        engine.set_nx(b"k", bytes("a"), Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(engine.set_nx(b"k", bytes("b"), Duration::from_secs(60)).unwrap());
    }

    /// "Present, same value → refresh deadline, return true" must hold for
    /// an equal-content value behind a *distinct* `Arc` — the normal pattern
    /// for an in-process client that reconstructs its value on every call.
    /// Comparing by pointer identity would always miss this branch.
    #[test]
    fn set_nx_refreshes_deadline_on_equal_content_distinct_arc() {
        let engine = EngineConfig::new().build().unwrap();
        assert!(engine.set_nx(b"k", bytes("a"), Duration::from_millis(50)).unwrap());
        // A distinct Arc with the same bytes — not the same allocation —
        // must still refresh the deadline to 60s rather than being
        // rejected as "different value".
        assert!(engine.set_nx(b"k", bytes("a"), Duration::from_secs(60)).unwrap());
        std::thread::sleep(Duration::from_millis(80));
        // Had the deadline not been refreshed, the original 50ms TTL would
        // have lapsed by now and a different-value SetNX would succeed by
        // overwriting the expired entry. With the refresh in effect the
        // entry is still alive, so a different value must be rejected.
        assert!(!engine.set_nx(b"k", bytes("b"), Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn incr_then_decr_restores_original() {
        let engine = EngineConfig::new().build().unwrap();
        let after_incr = engine.incr_by(b"c", 5).unwrap();
        assert_eq!(after_incr, 5);
        let after_decr = engine.decr_by(b"c", 5).unwrap();
        assert_eq!(after_decr, 0);
    }

    #[test]
    fn sadd_dedupes_within_and_across_calls() {
        let engine = EngineConfig::new().build().unwrap();
        let added = engine
            .sadd(b"s", &[b"a".to_vec(), b"a".to_vec(), b"b".to_vec()])
            .unwrap();
        assert_eq!(added, 2);
        let added_again = engine.sadd(b"s", &[b"a".to_vec()]).unwrap();
        assert_eq!(added_again, 0);
    }

    #[test]
    fn lpush_last_argument_ends_at_head() {
        let engine = EngineConfig::new().build().unwrap();
        engine.lpush(b"l", &[b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]).unwrap();
        assert_eq!(engine.lpop(b"l").unwrap(), b"3".to_vec());
        assert_eq!(engine.lpop(b"l").unwrap(), b"2".to_vec());
        assert_eq!(engine.lpop(b"l").unwrap(), b"1".to_vec());
    }

    #[test]
    fn lpop_prunes_empty_list() {
        let engine = EngineConfig::new().build().unwrap();
        engine.lpush(b"l", &[b"only".to_vec()]).unwrap();
        engine.lpop(b"l").unwrap();
        assert_eq!(engine.len(), 0);
    }

    /// Capacity eviction under the Weight policy, ascending order.
    #[test]
    fn capacity_eviction_under_weight_ascending() {
        let engine = EngineConfig::new()
            .capacity_limit(2)
            .priority_policy(PriorityPolicy::Weight)
            .default_weight(1)
            .build()
            .unwrap();

        engine.set(b"k1", bytes("v1"), Duration::from_secs(60)).unwrap();
        engine
            .set(b"k2", StdArc::new(Weighted(2)), Duration::from_secs(60))
            .unwrap();
        engine.set(b"k3", bytes("v3"), Duration::from_secs(60)).unwrap();

        assert_eq!(engine.kv_count(), 2);
        assert!(engine.get(b"k1").is_err());
        assert!(engine.get(b"k2").is_ok());
        assert!(engine.get(b"k3").is_ok());
    }

    /// LRU accounting — after Get("k1"), k1 moves out of the oldest bucket.
    #[test]
    fn lru_accounting_moves_bucket_on_access() {
        let engine = EngineConfig::new().priority_policy(PriorityPolicy::Lru).build().unwrap();
        engine.set(b"k1", bytes("v1"), Duration::from_secs(60)).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        engine.set(b"k2", bytes("v2"), Duration::from_secs(60)).unwrap();
        engine.get(b"k1").unwrap();

        // After touching k1, evicting twice should remove k2 first (it has
        // the lower last-access weight) then k1.
        let mut state = engine.state.write();
        let first_victim = state.priority.pop_victim().unwrap();
        drop(state);
        assert_eq!(first_victim, b"k2".to_vec());
    }

    /// Regression for the LRU weight function: it must compare nodes on one
    /// shared timeline, not seconds-since-each-node's-own-creation. A node
    /// created earlier but accessed more recently must still come out with
    /// a *higher* weight (more recently used) than one created later but
    /// accessed earlier.
    #[test]
    fn lru_weight_is_absolute_not_relative_to_creation() {
        let engine = EngineConfig::new().priority_policy(PriorityPolicy::Lru).build().unwrap();
        engine.set(b"k_old", bytes("v"), Duration::from_secs(60)).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        engine.set(b"k_new", bytes("v"), Duration::from_secs(60)).unwrap();

        // k_old has lived longer but is touched first; k_new is touched
        // right after. On an absolute timeline k_new's access happens
        // later, so it must carry the higher (more-recently-used) weight
        // even though it was created after k_old.
        engine.get(b"k_old").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        engine.get(b"k_new").unwrap();

        let state = engine.state.read();
        let old_weight = state.index.find(b"k_old").unwrap().last_access_secs();
        let new_weight = state.index.find(b"k_new").unwrap().last_access_secs();
        drop(state);
        assert!(
            new_weight > old_weight,
            "k_new accessed later must outrank k_old in LRU weight (old={old_weight}, new={new_weight})"
        );
    }

    /// LFU accounting — the key accessed more often sits behind the
    /// less-accessed key in eviction order.
    #[test]
    fn lfu_accounting_orders_by_access_count() {
        let engine = EngineConfig::new().priority_policy(PriorityPolicy::Lfu).build().unwrap();
        engine.set(b"k1", bytes("v1"), Duration::ZERO).unwrap();
        engine.set(b"k2", bytes("v2"), Duration::ZERO).unwrap();
        engine.get(b"k1").unwrap();
        engine.get(b"k1").unwrap();
        engine.get(b"k2").unwrap();

        let mut state = engine.state.write();
        let first_victim = state.priority.pop_victim().unwrap();
        drop(state);
        assert_eq!(first_victim, b"k2".to_vec());
    }

    /// SetNX refresh and overwrite-on-expire.
    #[test]
    fn set_nx_refresh_and_overwrite() {
        let engine = EngineConfig::new().build().unwrap();
        engine.set_nx(b"k", bytes("a"), Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(engine.set_nx(b"k", bytes("b"), Duration::from_secs(60)).unwrap());
        // Get requires a KV node; SetNX stores KV-exclusive, so the
        // refreshed value is only observable via SetNX's own return.
        assert!(matches!(
            engine.get(b"k"),
            Err(EngineError::KindMismatch(MismatchReason::KvCanGet))
        ));
    }

    /// Get on an already-expired node returns KeyNotFound and removes it.
    #[test]
    fn double_check_on_expired_get() {
        let engine = EngineConfig::new().build().unwrap();
        engine.set_expired(b"k", bytes("v"), Duration::from_secs(1)).unwrap();
        assert!(matches!(engine.get(b"k"), Err(EngineError::KeyNotFound)));
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn get_set_on_miss_stores_and_reports_not_found() {
        let engine = EngineConfig::new().build().unwrap();
        let result = engine.get_set(b"k", bytes("new"));
        assert!(matches!(result, Err(EngineError::KeyNotFound)));
        let stored = engine.get(b"k").unwrap();
        assert_eq!(stored.memory_size(), 3);
    }

    #[test]
    fn get_set_on_present_returns_old_value() {
        let engine = EngineConfig::new().build().unwrap();
        engine.set(b"k", bytes("old"), Duration::ZERO).unwrap();
        let old = engine.get_set(b"k", bytes("newvalue")).unwrap();
        assert_eq!(old.memory_size(), 3);
        let now_stored = engine.get(b"k").unwrap();
        assert_eq!(now_stored.memory_size(), 8);
    }

    #[test]
    fn kind_mismatch_on_wrong_operation() {
        let engine = EngineConfig::new().build().unwrap();
        engine.set(b"k", bytes("v"), Duration::ZERO).unwrap();
        assert!(matches!(
            engine.lpush(b"k", &[b"x".to_vec()]),
            Err(EngineError::KindMismatch(MismatchReason::ListCanLPush))
        ));
    }

    #[test]
    fn background_sweeper_reclaims_expired_entries() {
        let engine = StdArc::new(
            EngineConfig::new().scan_interval(Duration::from_millis(5)).build().unwrap(),
        );
        engine.set(b"k", bytes("v"), Duration::from_millis(1)).unwrap();
        let handle = engine.start_sweeper();
        std::thread::sleep(Duration::from_millis(40));
        handle.stop();
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn rejects_non_positive_max_weight() {
        let result = EngineConfig::new().max_weight(0).build();
        assert!(matches!(result, Err(EngineError::WrongPriorityPolicy(_))));
    }

    #[test]
    fn delete_removes_present_keys_only() {
        let engine = EngineConfig::new().build().unwrap();
        engine.set(b"k", bytes("v"), Duration::ZERO).unwrap();
        let removed = engine.delete(&[b"k".to_vec(), b"missing".to_vec()]);
        assert_eq!(removed, 1);
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn incr_by_float_accumulates() {
        let engine = EngineConfig::new().build().unwrap();
        let total = engine.incr_by_float(b"f", 1.5).unwrap();
        assert_eq!(total, 1.5);
        let total = engine.incr_by_float(b"f", 2.25).unwrap();
        assert_eq!(total, 3.75);
    }

    /// Mixing `IncrBy`/`DecrBy` and `IncrByFloat` on one key must be
    /// rejected in both directions rather than reinterpreting the stored
    /// `i64` bits under the other representation.
    #[test]
    fn counter_rejects_mixed_int_and_float_accessors() {
        let engine = EngineConfig::new().build().unwrap();
        engine.incr_by(b"c", 5).unwrap();
        assert!(matches!(
            engine.incr_by_float(b"c", 1.5),
            Err(EngineError::KindMismatch(MismatchReason::NumReprConflict))
        ));
        // The integer value is untouched by the rejected float call.
        assert_eq!(engine.incr_by(b"c", 0).unwrap(), 5);

        engine.incr_by_float(b"g", 1.5).unwrap();
        assert!(matches!(
            engine.incr_by(b"g", 1),
            Err(EngineError::KindMismatch(MismatchReason::NumReprConflict))
        ));
    }
}
