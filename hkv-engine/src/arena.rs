//! An alternative core over a typed value `V`, storing entries in
//! deadline-ordered arenas so that a whole block of same-window entries
//! can be freed in one step, rather than reclaiming keys one at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::{EngineError, EngineResult};

/// A single stored entry inside an [`Arena`].
struct ArenaSlot<V> {
    key: Vec<u8>,
    value: V,
    deadline: Instant,
    /// Mirrors the Prioritized Engine's KV/KV-exclusive split, since
    /// `SetNX` semantics apply here too.
    exclusive: bool,
}

/// A deadline-ordered block of entries. Slot storage is a dense
/// node-arena/free-list pair (`slots: Vec<Option<ArenaSlot<V>>>`,
/// `slot_free: Vec<usize>`), applied one level up from individual entries.
struct Arena<V> {
    deadline: Instant,
    slots: Vec<Option<ArenaSlot<V>>>,
    slot_free: Vec<usize>,
    active_count: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<V> Arena<V> {
    fn new(deadline: Instant, prev: Option<usize>, next: Option<usize>) -> Self {
        Arena { deadline, slots: Vec::new(), slot_free: Vec::new(), active_count: 0, prev, next }
    }

    fn push(&mut self, slot: ArenaSlot<V>) -> usize {
        self.active_count += 1;
        if let Some(free_idx) = self.slot_free.pop() {
            self.slots[free_idx] = Some(slot);
            free_idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    fn remove(&mut self, slot: usize) -> Option<ArenaSlot<V>> {
        let taken = self.slots.get_mut(slot)?.take()?;
        self.slot_free.push(slot);
        self.active_count = self.active_count.saturating_sub(1);
        Some(taken)
    }
}

/// Points a key at its storage location: which arena, which slot, and
/// the deadline under which it was last indexed.
#[derive(Clone, Copy)]
struct ArenaIndexEntry {
    arena: usize,
    slot: usize,
    deadline: Instant,
}

/// Configuration for an [`ArenaTtlEngine`].
#[derive(Debug, Clone)]
pub struct ArenaEngineConfig {
    default_ttl: Duration,
    scan_interval: Duration,
    scan_count: usize,
}

impl Default for ArenaEngineConfig {
    fn default() -> Self {
        ArenaEngineConfig {
            default_ttl: Duration::from_secs(30),
            scan_interval: Duration::from_secs(1),
            scan_count: 64,
        }
    }
}

impl ArenaEngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn scan_count(mut self, count: usize) -> Self {
        self.scan_count = count;
        self
    }
}

struct ArenaState<V> {
    arenas: Vec<Option<Arena<V>>>,
    arena_free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<Vec<u8>, ArenaIndexEntry>,
    /// Round-robin scan window over `index`'s keys, refreshed whenever
    /// the cursor runs past the snapshot.
    scan_keys: Vec<Vec<u8>>,
    scan_pos: usize,
}

impl<V> ArenaState<V> {
    fn new() -> Self {
        ArenaState {
            arenas: Vec::new(),
            arena_free: Vec::new(),
            head: None,
            tail: None,
            index: HashMap::new(),
            scan_keys: Vec::new(),
            scan_pos: 0,
        }
    }

    fn arena(&self, idx: usize) -> &Arena<V> {
        self.arenas[idx].as_ref().expect("dangling arena index")
    }

    fn arena_mut(&mut self, idx: usize) -> &mut Arena<V> {
        self.arenas[idx].as_mut().expect("dangling arena index")
    }

    /// Splices a new arena at `deadline` between `prev` and `next`,
    /// relinking the chain and `head`/`tail` as needed.
    fn splice_arena(&mut self, deadline: Instant, prev: Option<usize>, next: Option<usize>) -> usize {
        let arena = Arena::new(deadline, prev, next);
        let idx = if let Some(free_idx) = self.arena_free.pop() {
            self.arenas[free_idx] = Some(arena);
            free_idx
        } else {
            self.arenas.push(Some(arena));
            self.arenas.len() - 1
        };

        match prev {
            Some(p) => self.arena_mut(p).next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(n) => self.arena_mut(n).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        idx
    }

    /// Finds an arena to hold a new deadline, optionally starting the
    /// forward scan from `start` rather than the head (used by `set`'s
    /// reallocation path, since deadlines only increase walking forward).
    fn find_or_splice(
        &mut self,
        new_deadline: Instant,
        now: Instant,
        default_ttl: Duration,
        start: Option<usize>,
    ) -> usize {
        let mut prev = start.and_then(|s| self.arena(s).prev);
        let mut cursor = start.or(self.head);

        while let Some(idx) = cursor {
            let arena = self.arena(idx);
            if arena.deadline >= new_deadline {
                let slack = arena.deadline.saturating_duration_since(new_deadline);
                if slack <= default_ttl {
                    return idx;
                }
                break;
            }
            prev = cursor;
            cursor = arena.next;
        }

        let arena_deadline = match prev {
            None => {
                // Positioning at head.
                if new_deadline < now + default_ttl {
                    now + default_ttl
                } else {
                    new_deadline
                }
            }
            Some(p) => {
                // Predecessor exists.
                let pred_deadline = self.arena(p).deadline;
                if new_deadline < pred_deadline + default_ttl {
                    pred_deadline + default_ttl
                } else {
                    new_deadline
                }
            }
        };

        self.splice_arena(arena_deadline, prev, cursor)
    }

    fn insert_entry(&mut self, key: Vec<u8>, value: V, deadline: Instant, exclusive: bool, arena_idx: usize) {
        let slot_idx = self.arena_mut(arena_idx).push(ArenaSlot {
            key: key.clone(),
            value,
            deadline,
            exclusive,
        });
        self.index.insert(key, ArenaIndexEntry { arena: arena_idx, slot: slot_idx, deadline });
    }

    fn remove_entry(&mut self, key: &[u8]) -> Option<ArenaSlot<V>> {
        let entry = self.index.remove(key)?;
        self.arena_mut(entry.arena).remove(entry.slot)
    }

    /// Frees arenas from the head while their deadline has passed,
    /// pruning any remaining index entries inside them. Strictly head-
    /// first, regardless of active-count, so that addresses into a
    /// not-yet-freed arena stay valid while any live back-reference exists.
    fn free_expired_arenas(&mut self, now: Instant) -> usize {
        let mut freed = 0;
        while let Some(idx) = self.head {
            if self.arena(idx).deadline > now {
                break;
            }
            let arena = self.arenas[idx].take().expect("head points at live arena");
            for slot in arena.slots.into_iter().flatten() {
                self.index.remove(&slot.key);
            }
            self.head = arena.next;
            match self.head {
                Some(new_head) => self.arena_mut(new_head).prev = None,
                None => self.tail = None,
            }
            self.arena_free.push(idx);
            freed += 1;
        }
        freed
    }

    fn next_wake_deadline(&self) -> Option<Instant> {
        self.head.map(|idx| self.arena(idx).deadline)
    }
}

/// Handle for a background cleaner thread. Two of these are returned by
/// [`ArenaTtlEngine::start_cleaners`]: one per cooperating cleaner.
pub struct CleanerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl CleanerHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// The Arena TTL Engine, generic over a typed stored value.
pub struct ArenaTtlEngine<V> {
    state: RwLock<ArenaState<V>>,
    config: ArenaEngineConfig,
    arena_wake_tx: Sender<()>,
    arena_wake_rx: Receiver<()>,
}

impl<V: Clone + PartialEq + Send + Sync + 'static> ArenaTtlEngine<V> {
    pub fn new(config: ArenaEngineConfig) -> Self {
        let (arena_wake_tx, arena_wake_rx) = bounded(1);
        ArenaTtlEngine { state: RwLock::new(ArenaState::new()), config, arena_wake_tx, arena_wake_rx }
    }

    pub fn config(&self) -> &ArenaEngineConfig {
        &self.config
    }

    /// Sets a value, following the key/value engine's `Set` semantics
    /// with arena reallocation on deadline change.
    pub fn set(&self, key: &[u8], value: V, ttl: Duration) -> EngineResult<()> {
        let now = Instant::now();
        let new_deadline = now + ttl;
        let mut state = self.state.write();

        if let Some(existing) = state.index.get(key).copied() {
            if existing.deadline >= new_deadline {
                // Overwrite in place — no need to move arenas.
                let arena = state.arena_mut(existing.arena);
                if let Some(slot) = arena.slots[existing.slot].as_mut() {
                    slot.value = value;
                    slot.deadline = new_deadline;
                }
                if let Some(entry) = state.index.get_mut(key) {
                    entry.deadline = new_deadline;
                }
                return Ok(());
            }

            // Deadline grew: reallocate forward into a later arena.
            let new_arena = state.find_or_splice(
                new_deadline,
                now,
                self.config.default_ttl,
                Some(existing.arena),
            );
            state.remove_entry(key);
            state.insert_entry(key.to_vec(), value, new_deadline, false, new_arena);
            drop(state);
            self.wake_arena_cleaner();
            return Ok(());
        }

        let arena = state.find_or_splice(new_deadline, now, self.config.default_ttl, None);
        state.insert_entry(key.to_vec(), value, new_deadline, false, arena);
        drop(state);
        self.wake_arena_cleaner();
        Ok(())
    }

    /// Sets a value only if absent or expired, following the key/value
    /// engine's `SetNX` semantics.
    pub fn set_nx(&self, key: &[u8], value: V, ttl: Duration) -> EngineResult<bool> {
        let now = Instant::now();
        let new_deadline = now + ttl;
        let mut state = self.state.write();

        let Some(existing) = state.index.get(key).copied() else {
            let arena = state.find_or_splice(new_deadline, now, self.config.default_ttl, None);
            state.insert_entry(key.to_vec(), value, new_deadline, true, arena);
            drop(state);
            self.wake_arena_cleaner();
            return Ok(true);
        };

        let alive = existing.deadline > now;
        let same_value = {
            let arena = state.arena(existing.arena);
            arena.slots[existing.slot].as_ref().is_some_and(|s| s.exclusive && s.value == value)
        };

        if same_value {
            if let Some(slot) = state.arena_mut(existing.arena).slots[existing.slot].as_mut() {
                slot.deadline = new_deadline;
            }
            if let Some(entry) = state.index.get_mut(key) {
                entry.deadline = new_deadline;
            }
            return Ok(true);
        }

        if !alive {
            state.remove_entry(key);
            let arena = state.find_or_splice(new_deadline, now, self.config.default_ttl, None);
            state.insert_entry(key.to_vec(), value, new_deadline, true, arena);
            drop(state);
            self.wake_arena_cleaner();
            return Ok(true);
        }

        Ok(false)
    }

    /// Reads a value, following the key/value engine's double-check
    /// protocol on expiry.
    pub fn get(&self, key: &[u8]) -> EngineResult<V> {
        let now = Instant::now();
        {
            let state = self.state.read();
            match state.index.get(key) {
                None => return Err(EngineError::KeyNotFound),
                Some(entry) if entry.deadline > now => {
                    let arena = state.arena(entry.arena);
                    let value = arena.slots[entry.slot].as_ref().expect("index points at live slot").value.clone();
                    return Ok(value);
                }
                Some(_) => {}
            }
        }

        let mut state = self.state.write();
        match state.index.get(key).copied() {
            Some(entry) if entry.deadline <= now => {
                state.remove_entry(key);
                Err(EngineError::KeyNotFound)
            }
            Some(entry) => {
                let arena = state.arena(entry.arena);
                Ok(arena.slots[entry.slot].as_ref().expect("index points at live slot").value.clone())
            }
            None => Err(EngineError::KeyNotFound),
        }
    }

    /// Atomically swaps in a new value, following the key/value engine's
    /// `GetSet` semantics.
    pub fn get_set(&self, key: &[u8], value: V) -> EngineResult<V> {
        let now = Instant::now();
        let mut state = self.state.write();

        if let Some(entry) = state.index.get(key).copied() {
            if entry.deadline > now {
                let old = {
                    let arena = state.arena(entry.arena);
                    arena.slots[entry.slot].as_ref().expect("index points at live slot").value.clone()
                };
                if let Some(slot) = state.arena_mut(entry.arena).slots[entry.slot].as_mut() {
                    slot.value = value;
                }
                return Ok(old);
            }
            state.remove_entry(key);
        }

        // The key/value engine's GetSet stores the fresh node with no TTL,
        // but the arena engine has no "never expires" deadline since every
        // entry must live inside a deadline-ordered arena, so a miss is
        // granted one `default_ttl` window instead.
        let arena = state.find_or_splice(now + self.config.default_ttl, now, self.config.default_ttl, None);
        state.insert_entry(key.to_vec(), value, now + self.config.default_ttl, false, arena);
        drop(state);
        self.wake_arena_cleaner();
        Err(EngineError::KeyNotFound)
    }

    /// Scans up to `scan_count` index entries from the round-robin cursor,
    /// dropping any whose deadline has passed.
    pub fn sweep_index(&self) -> usize {
        let mut state = self.state.write();
        if state.scan_pos >= state.scan_keys.len() {
            state.scan_keys = state.index.keys().cloned().collect();
            state.scan_pos = 0;
        }
        if state.scan_keys.is_empty() {
            return 0;
        }

        let now = Instant::now();
        let end = (state.scan_pos + self.config.scan_count).min(state.scan_keys.len());
        let batch = state.scan_keys[state.scan_pos..end].to_vec();
        state.scan_pos = end;

        let mut reclaimed = 0;
        for key in batch {
            let expired = state.index.get(&key).is_some_and(|e| e.deadline <= now);
            if expired {
                state.remove_entry(&key);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Pops expired arenas from the head.
    pub fn sweep_arenas(&self) -> usize {
        let now = Instant::now();
        self.state.write().free_expired_arenas(now)
    }

    /// Starts the two cooperating background cleaners, returning one
    /// handle per cleaner.
    pub fn start_cleaners(self: &Arc<Self>) -> (CleanerHandle, CleanerHandle)
    where
        V: 'static,
    {
        let index_stop = Arc::new(AtomicBool::new(false));
        let index_stop_thread = Arc::clone(&index_stop);
        let index_engine = Arc::clone(self);
        let scan_interval = self.config.scan_interval.max(Duration::from_millis(1));
        tracing::info!(?scan_interval, "starting arena index cleaner");
        let index_join = std::thread::spawn(move || {
            while !index_stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(scan_interval);
                index_engine.sweep_index();
            }
        });

        let arena_stop = Arc::new(AtomicBool::new(false));
        let arena_stop_thread = Arc::clone(&arena_stop);
        let arena_engine = Arc::clone(self);
        let wake_rx = self.arena_wake_rx.clone();
        tracing::info!("starting arena cleaner");
        let arena_join = std::thread::spawn(move || {
            while !arena_stop_thread.load(Ordering::Acquire) {
                let timeout = {
                    let state = arena_engine.state.read();
                    match state.next_wake_deadline() {
                        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                        None => Duration::from_secs(1),
                    }
                };
                let _ = wake_rx.recv_timeout(timeout.max(Duration::from_millis(1)));
                let freed = arena_engine.sweep_arenas();
                if freed > 0 {
                    tracing::debug!(freed, "arena cleaner freed expired arenas");
                }
            }
        });

        (
            CleanerHandle { stop: index_stop, join: Some(index_join) },
            CleanerHandle { stop: arena_stop, join: Some(arena_join) },
        )
    }

    /// Notifies the arena cleaner that a new head arena may have been
    /// spliced in ahead of its current wake target.
    fn wake_arena_cleaner(&self) {
        let _ = self.arena_wake_tx.try_send(());
    }

    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn arena_count(&self) -> usize {
        self.state.read().arenas.iter().filter(|a| a.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrip() {
        let engine: ArenaTtlEngine<i64> = ArenaTtlEngine::new(ArenaEngineConfig::new());
        engine.set(b"k", 42, Duration::from_secs(60)).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), 42);
    }

    #[test]
    fn set_nx_refresh_and_reject() {
        let engine: ArenaTtlEngine<i64> = ArenaTtlEngine::new(ArenaEngineConfig::new());
        assert!(engine.set_nx(b"k", 1, Duration::from_secs(60)).unwrap());
        assert!(!engine.set_nx(b"k", 2, Duration::from_secs(60)).unwrap());
        assert_eq!(engine.get(b"k").unwrap(), 1);
    }

    /// SetNX refresh and overwrite-on-expire.
    #[test]
    fn set_nx_overwrites_on_expired() {
        let engine: ArenaTtlEngine<i64> = ArenaTtlEngine::new(ArenaEngineConfig::new());
        engine.set_nx(b"k", 1, Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(engine.set_nx(b"k", 2, Duration::from_secs(60)).unwrap());
        assert_eq!(engine.get(b"k").unwrap(), 2);
    }

    /// Get on an already-expired node returns KeyNotFound and removes it
    /// from the index.
    #[test]
    fn double_check_on_expired_get() {
        let engine: ArenaTtlEngine<i64> = ArenaTtlEngine::new(ArenaEngineConfig::new());
        engine.set(b"k", 1, Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(engine.get(b"k"), Err(EngineError::KeyNotFound)));
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn get_set_returns_old_and_stores_new() {
        let engine: ArenaTtlEngine<i64> = ArenaTtlEngine::new(ArenaEngineConfig::new());
        engine.set(b"k", 1, Duration::from_secs(60)).unwrap();
        let old = engine.get_set(b"k", 2).unwrap();
        assert_eq!(old, 1);
        assert_eq!(engine.get(b"k").unwrap(), 2);
    }

    #[test]
    fn get_set_on_miss_stores_and_reports_not_found() {
        let engine: ArenaTtlEngine<i64> = ArenaTtlEngine::new(ArenaEngineConfig::new());
        let result = engine.get_set(b"k", 5);
        assert!(matches!(result, Err(EngineError::KeyNotFound)));
        assert_eq!(engine.get(b"k").unwrap(), 5);
    }

    /// Arena splice: default_ttl=30s, an existing chain at 30s; a second
    /// Set at 50s splices a new arena after it rather than reusing the
    /// first, since the slack (60s proposed deadline minus 50s) would
    /// exceed the default TTL window only if reused at the wrong spot —
    /// this asserts the chain grows to two arenas in ascending order.
    #[test]
    fn arena_splice_grows_chain_in_order() {
        let engine: ArenaTtlEngine<i64> =
            ArenaTtlEngine::new(ArenaEngineConfig::new().default_ttl(Duration::from_secs(30)));
        engine.set(b"k1", 1, Duration::from_secs(30)).unwrap();
        assert_eq!(engine.arena_count(), 1);

        engine.set(b"k2", 2, Duration::from_secs(50)).unwrap();
        assert_eq!(engine.arena_count(), 2);

        let state = engine.state.read();
        let head = state.head.expect("chain has a head");
        let head_arena = state.arena(head);
        let tail = head_arena.next.expect("chain has a second arena");
        let tail_arena = state.arena(tail);
        assert!(tail_arena.deadline > head_arena.deadline);
        assert_eq!(tail_arena.next, None);
        assert_eq!(state.tail, Some(tail));
    }

    #[test]
    fn set_with_shrinking_deadline_overwrites_in_place() {
        let engine: ArenaTtlEngine<i64> =
            ArenaTtlEngine::new(ArenaEngineConfig::new().default_ttl(Duration::from_secs(30)));
        engine.set(b"k", 1, Duration::from_secs(60)).unwrap();
        let arenas_before = engine.arena_count();
        engine.set(b"k", 2, Duration::from_secs(1)).unwrap();
        assert_eq!(engine.arena_count(), arenas_before);
        assert_eq!(engine.get(b"k").unwrap(), 2);
    }

    #[test]
    fn set_with_growing_deadline_reallocates_forward() {
        let engine: ArenaTtlEngine<i64> =
            ArenaTtlEngine::new(ArenaEngineConfig::new().default_ttl(Duration::from_secs(30)));
        engine.set(b"k1", 1, Duration::from_secs(30)).unwrap();
        engine.set(b"k", 1, Duration::from_secs(1)).unwrap();
        engine.set(b"k", 2, Duration::from_secs(90)).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), 2);
        assert!(engine.arena_count() >= 2);
    }

    #[test]
    fn index_cleaner_reclaims_expired_entries() {
        let engine: ArenaTtlEngine<i64> = ArenaTtlEngine::new(ArenaEngineConfig::new());
        engine.set(b"a", 1, Duration::from_millis(1)).unwrap();
        engine.set(b"b", 2, Duration::from_secs(60)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let reclaimed = engine.sweep_index();
        assert_eq!(reclaimed, 1);
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn arena_cleaner_frees_expired_head_arena() {
        let engine: ArenaTtlEngine<i64> =
            ArenaTtlEngine::new(ArenaEngineConfig::new().default_ttl(Duration::from_millis(1)));
        engine.set(b"k", 1, Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let freed = engine.sweep_arenas();
        assert_eq!(freed, 1);
        assert_eq!(engine.len(), 0);
        assert_eq!(engine.arena_count(), 0);
    }

    #[test]
    fn background_cleaners_reclaim_over_time() {
        let engine = Arc::new(ArenaTtlEngine::<i64>::new(
            ArenaEngineConfig::new()
                .default_ttl(Duration::from_millis(1))
                .scan_interval(Duration::from_millis(5)),
        ));
        engine.set(b"k", 1, Duration::from_millis(1)).unwrap();
        let (index_handle, arena_handle) = engine.start_cleaners();
        std::thread::sleep(Duration::from_millis(60));
        index_handle.stop();
        arena_handle.stop();
        assert_eq!(engine.len(), 0);
        assert_eq!(engine.arena_count(), 0);
    }

    #[test]
    fn wake_arena_cleaner_does_not_panic_without_listener() {
        let engine: ArenaTtlEngine<i64> = ArenaTtlEngine::new(ArenaEngineConfig::new());
        engine.wake_arena_cleaner();
    }
}
