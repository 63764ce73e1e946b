//! A reclaimable, size-accounted cache that doubles as the context scavenger.
//!
//! The store keeps keyed byte payloads and tracks their total size against a
//! ceiling. Installed as the [`Scavenge`] implementation of an
//! [`AllocContext`], it gives memory back in sixteen stages when the
//! allocator runs dry:
//!
//! | phase | target size                         |
//! |-------|-------------------------------------|
//! | 0     | `max`                               |
//! | p     | `max / 16 * (16 - p)`               |
//! | 16    | exhausted, reports no progress      |
//!
//! For an unlimited store the target is derived from the current size
//! instead: `size / (16 - p) * (15 - p)`.
//!
//! Lock order is always context, then store. Store operations that release
//! memory drop the store lock before calling back into the context.

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tracing::{debug, trace};

use crate::block::Block;
use crate::context::{AllocContext, Reclaimer, Scavenge};

/// Number of scavenge phases before the store reports exhaustion.
pub const SCAVENGE_PHASES: u32 = 16;

/// Ceiling value meaning "no limit".
pub const UNLIMITED: usize = usize::MAX;

/// Store counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct StoreInner<K: Hash + Eq> {
    max: usize,
    size: usize,
    /// Least recently used first out.
    entries: LruCache<K, Vec<u8>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Eq + Hash + Clone> StoreInner<K> {
    fn take(&mut self, key: &K) -> Option<Vec<u8>> {
        let bytes = self.entries.pop(key)?;
        self.size -= bytes.len();
        Some(bytes)
    }

    fn pop_oldest(&mut self) -> Option<Vec<u8>> {
        let (_, bytes) = self.entries.pop_lru()?;
        self.size -= bytes.len();
        self.evictions += 1;
        Some(bytes)
    }

    /// Evict oldest entries until at least `want` bytes are freed.
    fn evict(&mut self, want: usize, mut sink: impl FnMut(Vec<u8>)) -> usize {
        let mut freed = 0;
        while freed < want {
            match self.pop_oldest() {
                Some(bytes) => {
                    freed += bytes.len();
                    sink(bytes);
                }
                None => break,
            }
        }
        freed
    }

    fn phase_target(&self, phase: u32) -> usize {
        let p = phase as usize;
        let n = SCAVENGE_PHASES as usize;
        if self.max == UNLIMITED {
            self.size / (n - p) * (n - 1 - p)
        } else {
            self.max / n * (n - p)
        }
    }
}

/// Keyed cache of byte payloads with LRU eviction.
///
/// A cheap handle; clones share the same entries. One clone is usually
/// installed as the context's scavenger and another kept by the session.
pub struct ResourceStore<K: Hash + Eq> {
    inner: Arc<Mutex<StoreInner<K>>>,
}

impl<K: Hash + Eq> Clone for ResourceStore<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash + Clone> fmt::Debug for ResourceStore<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStore")
            .field("max", &self.max())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<K: Eq + Hash + Clone> ResourceStore<K> {
    /// Create a store holding at most `max` bytes.
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                max,
                size: 0,
                entries: LruCache::unbounded(),
                hits: 0,
                misses: 0,
                evictions: 0,
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(UNLIMITED)
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max(&self) -> usize {
        self.lock().max
    }

    /// Bytes currently held.
    pub fn size(&self) -> usize {
        self.lock().size
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains(key)
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        StoreStats {
            entries: inner.entries.len(),
            size: inner.size,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Store `block` under `key`, evicting older entries to stay under the
    /// ceiling. Returns `false` when the payload alone exceeds the ceiling;
    /// it is then released instead of stored.
    ///
    /// `block` must come from `ctx`.
    pub fn put(&self, ctx: &AllocContext, key: K, block: Block) -> bool {
        if block.is_null() {
            return false;
        }
        let bytes = block.into_raw();
        let len = bytes.len();
        let mut freed = Vec::new();
        let stored = {
            let mut inner = self.lock();
            if len > inner.max {
                freed.push(bytes);
                false
            } else {
                if let Some(old) = inner.take(&key) {
                    freed.push(old);
                }
                let over = (inner.size + len).saturating_sub(inner.max);
                if over > 0 {
                    inner.evict(over, |b| freed.push(b));
                }
                inner.size += len;
                inner.entries.put(key, bytes);
                true
            }
        };
        if !freed.is_empty() {
            trace!(released = freed.len(), "store put released payloads");
        }
        for bytes in freed {
            ctx.release_raw(bytes);
        }
        stored
    }

    /// Copy the payload under `key` into a fresh block from `ctx`.
    ///
    /// The copy is allocated without the store lock held, so the allocation
    /// may itself scavenge this store. If the entry is evicted in the
    /// meantime the lookup misses.
    pub fn get(&self, ctx: &AllocContext, key: &K) -> Option<Block> {
        let len = {
            let mut inner = self.lock();
            match inner.entries.peek(key) {
                Some(bytes) => bytes.len(),
                None => {
                    inner.misses += 1;
                    return None;
                }
            }
        };
        let mut block = ctx.try_allocate(len)?;
        let copied = {
            let mut inner = self.lock();
            let copied = match inner.entries.get(key) {
                Some(bytes) if bytes.len() == len => {
                    block.copy_from_slice(bytes);
                    true
                }
                _ => false,
            };
            if copied {
                inner.hits += 1;
            } else {
                inner.misses += 1;
            }
            copied
        };
        // `block` drops outside the store lock on a miss.
        copied.then_some(block)
    }

    /// Drop the entry under `key`. Returns whether one was present.
    pub fn remove(&self, ctx: &AllocContext, key: &K) -> bool {
        let taken = self.lock().take(key);
        match taken {
            Some(bytes) => {
                ctx.release_raw(bytes);
                true
            }
            None => false,
        }
    }

    /// Drop every entry.
    pub fn clear(&self, ctx: &AllocContext) {
        let drained: Vec<Vec<u8>> = {
            let mut inner = self.lock();
            inner.size = 0;
            let mut drained = Vec::with_capacity(inner.entries.len());
            while let Some((_, bytes)) = inner.entries.pop_lru() {
                drained.push(bytes);
            }
            drained
        };
        if !drained.is_empty() {
            debug!(entries = drained.len(), "store cleared");
        }
        for bytes in drained {
            ctx.release_raw(bytes);
        }
    }
}

impl<K: Eq + Hash + Clone + Send> Scavenge for ResourceStore<K> {
    fn scavenge(&mut self, requested: usize, phase: &mut u32, reclaim: &Reclaimer<'_>) -> bool {
        let mut inner = self.lock();
        while *phase < SCAVENGE_PHASES {
            let target = inner.phase_target(*phase);
            *phase += 1;
            let need = inner.size.saturating_add(requested);
            if need > target {
                let freed = inner.evict(need - target, |bytes| reclaim.release(bytes));
                if freed > 0 {
                    debug!(requested, phase = *phase, freed, "store scavenged");
                    return true;
                }
            }
            if target == 0 {
                break;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::BudgetAllocator;

    fn budget_ctx(capacity: usize, max: usize) -> (Arc<BudgetAllocator>, ResourceStore<u32>, AllocContext) {
        let budget = Arc::new(BudgetAllocator::new(capacity));
        let store = ResourceStore::new(max);
        let ctx = AllocContext::new(budget.clone(), Box::new(store.clone()));
        (budget, store, ctx)
    }

    fn filled(ctx: &AllocContext, len: usize, value: u8) -> Block {
        let mut b = ctx.allocate(len).unwrap();
        b.fill(value);
        b
    }

    #[test]
    fn put_and_get_copy() {
        let (_budget, store, ctx) = budget_ctx(1024, 512);
        assert!(store.put(&ctx, 1, filled(&ctx, 10, 7)));
        let got = store.get(&ctx, &1).unwrap();
        assert_eq!(&got[..], &[7u8; 10]);
        assert!(store.get(&ctx, &2).is_none());
        let stats = store.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 10));
    }

    #[test]
    fn put_evicts_least_recently_used() {
        let (budget, store, ctx) = budget_ctx(1024, 30);
        store.put(&ctx, 1, filled(&ctx, 10, 1));
        store.put(&ctx, 2, filled(&ctx, 10, 2));
        store.put(&ctx, 3, filled(&ctx, 10, 3));
        // Touch 1 so 2 becomes the oldest.
        drop(store.get(&ctx, &1));
        store.put(&ctx, 4, filled(&ctx, 10, 4));
        assert!(store.contains(&1));
        assert!(!store.contains(&2));
        assert!(store.contains(&3));
        assert!(store.contains(&4));
        assert_eq!(store.size(), 30);
        assert_eq!(budget.used(), 30);
    }

    #[test]
    fn oversized_payload_is_released_not_stored() {
        let (budget, store, ctx) = budget_ctx(1024, 8);
        assert!(!store.put(&ctx, 1, filled(&ctx, 9, 0)));
        assert!(store.is_empty());
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn replacing_a_key_releases_old_payload() {
        let (budget, store, ctx) = budget_ctx(1024, 100);
        store.put(&ctx, 1, filled(&ctx, 20, 0));
        store.put(&ctx, 1, filled(&ctx, 5, 0));
        assert_eq!(store.size(), 5);
        assert_eq!(budget.used(), 5);
    }

    #[test]
    fn allocation_pressure_scavenges_store() {
        let (budget, store, ctx) = budget_ctx(64, 64);
        for k in 0..4 {
            store.put(&ctx, k, filled(&ctx, 16, k as u8));
        }
        assert_eq!(budget.used(), 64);

        let block = ctx.allocate(20).unwrap();
        assert_eq!(block.len(), 20);
        assert!(ctx.stats().scavenge_rounds >= 1);
        // Oldest entries went first.
        assert!(!store.contains(&0));
        assert!(store.contains(&3));
        assert!(budget.used() <= 64);
    }

    #[test]
    fn exhausted_store_fails_allocation() {
        let (_budget, store, ctx) = budget_ctx(32, 32);
        store.put(&ctx, 0, filled(&ctx, 16, 0));
        // Everything evictable is gone and 40 bytes still do not fit.
        assert!(ctx.try_allocate(40).is_none());
        assert!(store.is_empty());
        assert_eq!(ctx.stats().exhausted, 1);
    }

    #[test]
    fn phases_are_monotonic_and_bounded() {
        let store: ResourceStore<u32> = ResourceStore::new(1600);
        let raw = crate::raw::SystemAllocator;
        let reclaim = Reclaimer::for_tests(&raw);
        let mut s = store.clone();
        let mut phase = 0;
        assert!(!s.scavenge(10, &mut phase, &reclaim));
        assert!(phase <= SCAVENGE_PHASES);
        let mut phase = SCAVENGE_PHASES;
        assert!(!s.scavenge(10, &mut phase, &reclaim));
        assert_eq!(phase, SCAVENGE_PHASES);
    }

    #[test]
    fn phase_targets_shrink() {
        let store: ResourceStore<u32> = ResourceStore::new(1600);
        let inner = store.lock();
        assert_eq!(inner.phase_target(0), 1600);
        assert_eq!(inner.phase_target(1), 1500);
        assert_eq!(inner.phase_target(15), 100);
    }

    #[test]
    fn get_during_pressure_misses_cleanly() {
        let (_budget, store, ctx) = budget_ctx(32, 32);
        store.put(&ctx, 0, filled(&ctx, 16, 9));
        store.put(&ctx, 1, filled(&ctx, 16, 8));
        // Copying entry 0 needs 16 more bytes; the scavenger evicts entry 0
        // itself to make room, so the lookup misses.
        assert!(store.get(&ctx, &0).is_none());
        assert!(!store.contains(&0));
    }

    #[test]
    fn clear_returns_everything() {
        let (budget, store, ctx) = budget_ctx(256, 256);
        for k in 0..5 {
            store.put(&ctx, k, filled(&ctx, 10, 0));
        }
        store.clear(&ctx);
        assert!(store.is_empty());
        assert_eq!(budget.used(), 0);
        assert!(!store.remove(&ctx, &3));
    }
}
