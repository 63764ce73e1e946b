//! The allocation context and its scavenge-and-retry loop.
//!
//! Every request funnels into one of two primitives, `scavenging_alloc` and
//! `scavenging_realloc`. Each takes the context lock, asks the raw allocator,
//! and on failure asks the scavenger to reclaim memory, retrying for as long
//! as the scavenger reports progress:
//!
//! ```text
//! lock ─▶ raw.allocate ──ok──▶ unlock, return
//!             │ fail
//!             ▼
//!         scavenge(size, &mut phase) ──progress──▶ raw.allocate (again)
//!             │ nothing left
//!             ▼
//!         unlock, fail
//! ```
//!
//! Every public operation comes in two flavours: a throwing one returning
//! [`Result`] and a non-throwing `try_` one returning `Option`/`bool`. The
//! throwing flavour is a thin wrapper over the non-throwing primitive.

use std::ffi::CStr;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};

use crate::block::Block;
use crate::error::{AllocError, Result};
use crate::raw::{RawAllocator, SystemAllocator};

// ── Scavenging contract ──────────────────────────────────────────────────

/// A reclaimable cache the context can shrink when the allocator runs dry.
///
/// `scavenge` is called with the failed request size and a phase counter that
/// starts at 0 for each allocation attempt. Implementations advance `phase`
/// as they move to more aggressive reclamation and return `true` when they
/// freed something. The phase space must be finite: once nothing more can be
/// reclaimed the method must return `false`, which ends the retry loop.
///
/// The context lock is held for the duration of the call. Memory must be
/// returned through the supplied [`Reclaimer`]; dropping a [`Block`] owned by
/// the same context from inside `scavenge` would wait on that lock forever.
pub trait Scavenge: Send {
    fn scavenge(&mut self, requested: usize, phase: &mut u32, reclaim: &Reclaimer<'_>) -> bool;
}

/// Scavenger for contexts without a reclaimable cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScavenge;

impl Scavenge for NoScavenge {
    fn scavenge(&mut self, _requested: usize, _phase: &mut u32, _reclaim: &Reclaimer<'_>) -> bool {
        false
    }
}

/// Release path handed to a scavenger while the context lock is held.
pub struct Reclaimer<'a> {
    raw: &'a dyn RawAllocator,
}

impl<'a> Reclaimer<'a> {
    #[cfg(test)]
    pub(crate) fn for_tests(raw: &'a dyn RawAllocator) -> Self {
        Self { raw }
    }

    /// Return bytes obtained from this context's allocator.
    pub fn release(&self, bytes: Vec<u8>) {
        self.raw.release(bytes);
    }

    /// Return a block without going through its drop-time lock.
    pub fn release_block(&self, block: Block) {
        if !block.is_null() {
            self.raw.release(block.into_raw());
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────────────

/// Counters kept under the context lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Successful allocations and reallocations.
    pub granted: u64,
    /// Requests that failed after scavenging gave up.
    pub exhausted: u64,
    /// Scavenge calls that reported progress.
    pub scavenge_rounds: u64,
    /// Blocks handed back to the allocator.
    pub released: u64,
}

struct State {
    scavenger: Box<dyn Scavenge>,
    stats: AllocStats,
}

pub(crate) struct Shared {
    raw: Arc<dyn RawAllocator>,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn release(&self, bytes: Vec<u8>) {
        let mut state = self.lock();
        self.raw.release(bytes);
        state.stats.released += 1;
    }
}

// ── Context ──────────────────────────────────────────────────────────────

/// Session-scoped allocation handle.
///
/// Cloning is cheap and yields a handle to the same lock, allocator and
/// scavenger; concurrent requests through any clone are serialised against
/// each other and against the scavenger.
#[derive(Clone)]
pub struct AllocContext {
    shared: Arc<Shared>,
}

impl fmt::Debug for AllocContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocContext")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for AllocContext {
    fn default() -> Self {
        Self::new(Arc::new(SystemAllocator), Box::new(NoScavenge))
    }
}

impl AllocContext {
    /// Create a context over `raw`, reclaiming from `scavenger` on failure.
    pub fn new(raw: Arc<dyn RawAllocator>, scavenger: Box<dyn Scavenge>) -> Self {
        Self {
            shared: Arc::new(Shared {
                raw,
                state: Mutex::new(State {
                    scavenger,
                    stats: AllocStats::default(),
                }),
            }),
        }
    }

    /// Process heap, nothing to scavenge.
    pub fn system() -> Self {
        Self::default()
    }

    /// Snapshot of the context counters.
    pub fn stats(&self) -> AllocStats {
        self.shared.lock().stats
    }

    /// True when both handles refer to the same context.
    pub fn same_context(&self, other: &AllocContext) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn scavenging_alloc(&self, size: usize) -> Option<Vec<u8>> {
        let shared = &*self.shared;
        let mut state = shared.lock();
        let mut phase = 0u32;
        loop {
            if let Some(bytes) = shared.raw.allocate(size) {
                state.stats.granted += 1;
                return Some(bytes);
            }
            if !scavenge_once(shared, &mut state, size, &mut phase) {
                state.stats.exhausted += 1;
                return None;
            }
        }
    }

    fn scavenging_realloc(&self, bytes: Vec<u8>, size: usize) -> std::result::Result<Vec<u8>, Vec<u8>> {
        let shared = &*self.shared;
        let mut state = shared.lock();
        let mut phase = 0u32;
        let mut current = bytes;
        loop {
            match shared.raw.reallocate(current, size) {
                Ok(bytes) => {
                    state.stats.granted += 1;
                    return Ok(bytes);
                }
                Err(back) => current = back,
            }
            if !scavenge_once(shared, &mut state, size, &mut phase) {
                state.stats.exhausted += 1;
                return Err(current);
            }
        }
    }

    fn wrap(&self, bytes: Vec<u8>) -> Block {
        Block::new(bytes, Arc::clone(&self.shared))
    }

    /// Return detached bytes (see [`Block`]) to this context's allocator.
    pub(crate) fn release_raw(&self, bytes: Vec<u8>) {
        self.shared.release(bytes);
    }

    // ── Plain allocation ─────────────────────────────────────────────────

    /// Allocate `size` bytes. `size == 0` yields an empty block.
    pub fn allocate(&self, size: usize) -> Result<Block> {
        if size == 0 {
            return Ok(Block::empty());
        }
        self.try_allocate(size).ok_or(AllocError::OutOfMemory {
            op: "malloc",
            bytes: size,
        })
    }

    /// Non-throwing [`allocate`](Self::allocate): `None` on exhaustion.
    pub fn try_allocate(&self, size: usize) -> Option<Block> {
        if size == 0 {
            return Some(Block::empty());
        }
        self.scavenging_alloc(size).map(|bytes| self.wrap(bytes))
    }

    // ── Array allocation ─────────────────────────────────────────────────

    /// Allocate `count * size` bytes, failing with
    /// [`AllocError::IntegerOverflow`] before any attempt when the product
    /// overflows. A zero factor yields an empty block.
    pub fn allocate_array(&self, count: usize, size: usize) -> Result<Block> {
        let total = checked_array_size("malloc of array", count, size)?;
        if total == 0 {
            return Ok(Block::empty());
        }
        self.scavenging_alloc(total)
            .map(|bytes| self.wrap(bytes))
            .ok_or(AllocError::OutOfMemory {
                op: "malloc of array",
                bytes: total,
            })
    }

    /// Non-throwing [`allocate_array`](Self::allocate_array); overflow is
    /// reported as a diagnostic event and `None`.
    pub fn try_allocate_array(&self, count: usize, size: usize) -> Option<Block> {
        let total = checked_array_size_no_throw("malloc of array", count, size)?;
        if total == 0 {
            return Some(Block::empty());
        }
        self.scavenging_alloc(total).map(|bytes| self.wrap(bytes))
    }

    /// [`allocate_array`](Self::allocate_array) followed by a zero fill.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<Block> {
        let total = checked_array_size("calloc", count, size)?;
        if total == 0 {
            return Ok(Block::empty());
        }
        let mut block = self
            .scavenging_alloc(total)
            .map(|bytes| self.wrap(bytes))
            .ok_or(AllocError::OutOfMemory {
                op: "calloc",
                bytes: total,
            })?;
        block.fill(0);
        Ok(block)
    }

    /// Non-throwing [`allocate_zeroed`](Self::allocate_zeroed).
    pub fn try_allocate_zeroed(&self, count: usize, size: usize) -> Option<Block> {
        let total = checked_array_size_no_throw("calloc", count, size)?;
        if total == 0 {
            return Some(Block::empty());
        }
        let mut block = self.scavenging_alloc(total).map(|bytes| self.wrap(bytes))?;
        block.fill(0);
        Some(block)
    }

    // ── Resize ───────────────────────────────────────────────────────────

    /// Resize `block` to `count * size` bytes in place.
    ///
    /// A zero factor releases the block and leaves it empty. On failure the
    /// block keeps its previous contents and length.
    pub fn resize_array(&self, block: &mut Block, count: usize, size: usize) -> Result<()> {
        if count == 0 || size == 0 {
            *block = Block::empty();
            return Ok(());
        }
        let total = checked_array_size("resize array", count, size)?;
        self.resize_to(block, total)
    }

    /// Non-throwing [`resize_array`](Self::resize_array). Returns `false`
    /// when the block could not be resized; it is then left unchanged.
    pub fn try_resize_array(&self, block: &mut Block, count: usize, size: usize) -> bool {
        if count == 0 || size == 0 {
            *block = Block::empty();
            return true;
        }
        let Some(total) = checked_array_size_no_throw("resize array", count, size) else {
            return false;
        };
        match self.resize_to(block, total) {
            Ok(()) => true,
            Err(e) => {
                warn!("error: {e}");
                false
            }
        }
    }

    /// Blocks from another context are refused untouched: their bytes must
    /// only ever go back to the allocator that produced them.
    fn resize_to(&self, block: &mut Block, total: usize) -> Result<()> {
        if !block.owned_by(&self.shared) {
            return Err(AllocError::ForeignBlock { op: "resize array" });
        }
        let (bytes, owner) = block.take_parts();
        match self.scavenging_realloc(bytes, total) {
            Ok(bytes) => {
                block.set_parts(bytes, Some(Arc::clone(&self.shared)));
                Ok(())
            }
            Err(bytes) => {
                block.set_parts(bytes, owner);
                Err(AllocError::OutOfMemory {
                    op: "resize array",
                    bytes: total,
                })
            }
        }
    }

    // ── Release ──────────────────────────────────────────────────────────

    /// Release `block` now. Same as dropping it; a no-op for empty blocks.
    pub fn release(&self, block: Block) {
        drop(block);
    }

    // ── Strings ──────────────────────────────────────────────────────────

    /// Copy `s` including its NUL terminator into a new block.
    pub fn duplicate_cstr(&self, s: &CStr) -> Result<Block> {
        let src = s.to_bytes_with_nul();
        let mut block = self.allocate(src.len())?;
        block.copy_from_slice(src);
        Ok(block)
    }

    /// Non-throwing [`duplicate_cstr`](Self::duplicate_cstr).
    pub fn try_duplicate_cstr(&self, s: &CStr) -> Option<Block> {
        let src = s.to_bytes_with_nul();
        let mut block = self.try_allocate(src.len())?;
        block.copy_from_slice(src);
        Some(block)
    }
}

fn scavenge_once(shared: &Shared, state: &mut State, size: usize, phase: &mut u32) -> bool {
    let before = *phase;
    let reclaim = Reclaimer {
        raw: shared.raw.as_ref(),
    };
    let progressed = state.scavenger.scavenge(size, phase, &reclaim);
    debug_assert!(*phase >= before, "scavenge phase went backwards");
    if progressed {
        state.stats.scavenge_rounds += 1;
        trace!(size, phase = *phase, "scavenged; retrying allocation");
    } else {
        debug!(size, phase = *phase, "scavenger exhausted");
    }
    progressed
}

fn checked_array_size(op: &'static str, count: usize, size: usize) -> Result<usize> {
    if count == 0 || size == 0 {
        return Ok(0);
    }
    count
        .checked_mul(size)
        .ok_or(AllocError::IntegerOverflow { op, count, size })
}

fn checked_array_size_no_throw(op: &'static str, count: usize, size: usize) -> Option<usize> {
    match checked_array_size(op, count, size) {
        Ok(total) => Some(total),
        Err(e) => {
            warn!("error: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Raw allocator that counts calls and can be switched to always fail.
    #[derive(Default)]
    struct Counting {
        fail: AtomicBool,
        allocs: AtomicUsize,
        reallocs: AtomicUsize,
        releases: AtomicUsize,
    }

    impl RawAllocator for Counting {
        fn allocate(&self, size: usize) -> Option<Vec<u8>> {
            self.allocs.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                None
            } else {
                Some(vec![0xAA; size])
            }
        }

        fn reallocate(&self, mut block: Vec<u8>, size: usize) -> std::result::Result<Vec<u8>, Vec<u8>> {
            self.reallocs.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(block);
            }
            block.resize(size, 0xAA);
            Ok(block)
        }

        fn release(&self, _block: Vec<u8>) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Reports progress `remaining` times, recording every phase it sees.
    struct Limited {
        remaining: usize,
        phases: Arc<Mutex<Vec<u32>>>,
    }

    impl Scavenge for Limited {
        fn scavenge(&mut self, _requested: usize, phase: &mut u32, _reclaim: &Reclaimer<'_>) -> bool {
            self.phases.lock().unwrap().push(*phase);
            if self.remaining == 0 {
                return false;
            }
            self.remaining -= 1;
            *phase += 1;
            true
        }
    }

    fn counting_ctx(scavenger: Box<dyn Scavenge>) -> (Arc<Counting>, AllocContext) {
        let raw = Arc::new(Counting::default());
        let ctx = AllocContext::new(raw.clone(), scavenger);
        (raw, ctx)
    }

    #[test]
    fn zero_size_requests_are_empty_not_errors() {
        let (raw, ctx) = counting_ctx(Box::new(NoScavenge));
        assert!(ctx.allocate(0).unwrap().is_null());
        assert!(ctx.try_allocate(0).unwrap().is_null());
        assert!(ctx.allocate_array(0, 16).unwrap().is_null());
        assert!(ctx.allocate_array(16, 0).unwrap().is_null());
        assert!(ctx.try_allocate_array(0, 16).unwrap().is_null());
        assert!(ctx.allocate_zeroed(0, 3).unwrap().is_null());
        assert_eq!(raw.allocs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn array_overflow_is_distinct_and_attempts_nothing() {
        let (raw, ctx) = counting_ctx(Box::new(NoScavenge));
        let count = usize::MAX / 4 + 1;
        let err = ctx.allocate_array(count, 4).unwrap_err();
        assert_eq!(
            err,
            AllocError::IntegerOverflow {
                op: "malloc of array",
                count,
                size: 4
            }
        );
        assert!(ctx.try_allocate_array(count, 4).is_none());
        assert!(ctx.allocate_zeroed(count, 4).unwrap_err().is_overflow());
        let mut b = ctx.allocate(8).unwrap();
        assert!(ctx.resize_array(&mut b, count, 4).unwrap_err().is_overflow());
        assert_eq!(b.len(), 8);
        assert_eq!(raw.allocs.load(Ordering::SeqCst), 1);
        assert_eq!(raw.reallocs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn boundary_product_is_not_overflow() {
        let (raw, ctx) = counting_ctx(Box::new(NoScavenge));
        raw.fail.store(true, Ordering::SeqCst);
        let err = ctx.allocate_array(usize::MAX / 4, 4).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));
    }

    #[test]
    fn scavenge_converges_after_n_plus_one_attempts() {
        for n in [0usize, 1, 3, 7] {
            let phases = Arc::new(Mutex::new(Vec::new()));
            let (raw, ctx) = counting_ctx(Box::new(Limited {
                remaining: n,
                phases: phases.clone(),
            }));
            raw.fail.store(true, Ordering::SeqCst);

            let err = ctx.allocate(64).unwrap_err();
            assert_eq!(err, AllocError::OutOfMemory { op: "malloc", bytes: 64 });
            assert_eq!(raw.allocs.load(Ordering::SeqCst), n + 1, "n = {n}");

            let seen = phases.lock().unwrap().clone();
            assert_eq!(seen, (0..=n as u32).collect::<Vec<_>>());
            assert_eq!(ctx.stats().scavenge_rounds, n as u64);
            assert_eq!(ctx.stats().exhausted, 1);
        }
    }

    #[test]
    fn each_attempt_starts_at_phase_zero() {
        let phases = Arc::new(Mutex::new(Vec::new()));
        let (raw, ctx) = counting_ctx(Box::new(Limited {
            remaining: 2,
            phases: phases.clone(),
        }));
        raw.fail.store(true, Ordering::SeqCst);
        assert!(ctx.try_allocate(4).is_none());
        let mut block = Block::empty();
        assert!(!ctx.try_resize_array(&mut block, 1, 1));
        assert_eq!(*phases.lock().unwrap(), vec![0, 1, 2, 0]);
        assert_eq!(raw.reallocs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resize_to_zero_frees_exactly_once() {
        let (raw, ctx) = counting_ctx(Box::new(NoScavenge));
        let mut block = ctx.allocate_array(4, 8).unwrap();
        assert_eq!(block.len(), 32);

        ctx.resize_array(&mut block, 0, 8).unwrap();
        assert!(block.is_null());
        assert_eq!(raw.releases.load(Ordering::SeqCst), 1);

        drop(block);
        assert_eq!(raw.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_resize_keeps_contents() {
        let (raw, ctx) = counting_ctx(Box::new(NoScavenge));
        let mut block = ctx.allocate(3).unwrap();
        block.copy_from_slice(b"abc");
        raw.fail.store(true, Ordering::SeqCst);
        assert!(!ctx.try_resize_array(&mut block, 10, 1));
        assert_eq!(&block[..], b"abc");
        assert!(!block.is_null());
        raw.fail.store(false, Ordering::SeqCst);
        ctx.resize_array(&mut block, 5, 1).unwrap();
        assert_eq!(&block[..3], b"abc");
        assert_eq!(block.len(), 5);
    }

    #[test]
    fn resize_of_empty_block_allocates() {
        let (_raw, ctx) = counting_ctx(Box::new(NoScavenge));
        let mut block = Block::empty();
        ctx.resize_array(&mut block, 2, 3).unwrap();
        assert_eq!(block.len(), 6);
        assert!(!block.is_null());
    }

    #[test]
    fn resize_through_foreign_context_is_refused() {
        use crate::raw::BudgetAllocator;

        let budget_a = Arc::new(BudgetAllocator::new(64));
        let budget_b = Arc::new(BudgetAllocator::new(64));
        let a = AllocContext::new(budget_a.clone(), Box::new(NoScavenge));
        let b = AllocContext::new(budget_b.clone(), Box::new(NoScavenge));

        let mut block = a.allocate(16).unwrap();
        block.fill(5);
        let err = b.resize_array(&mut block, 32, 1).unwrap_err();
        assert_eq!(err, AllocError::ForeignBlock { op: "resize array" });
        assert!(!b.try_resize_array(&mut block, 8, 1));
        assert_eq!(&block[..], &[5u8; 16]);
        assert_eq!((budget_a.used(), budget_b.used()), (16, 0));

        drop(block);
        assert_eq!((budget_a.used(), budget_b.used()), (0, 0));
        assert_eq!(b.allocate(64).unwrap().len(), 64);
    }

    #[test]
    fn zeroed_allocation_clears_raw_garbage() {
        let (_raw, ctx) = counting_ctx(Box::new(NoScavenge));
        let plain = ctx.allocate(8).unwrap();
        assert!(plain.iter().all(|&b| b == 0xAA));
        let zeroed = ctx.allocate_zeroed(2, 4).unwrap();
        assert!(zeroed.iter().all(|&b| b == 0));
        assert!(ctx.try_allocate_zeroed(3, 3).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn drop_releases_through_allocator() {
        let (raw, ctx) = counting_ctx(Box::new(NoScavenge));
        let a = ctx.allocate(1).unwrap();
        let b = ctx.allocate(2).unwrap();
        ctx.release(a);
        drop(b);
        ctx.release(Block::empty());
        assert_eq!(raw.releases.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.stats().released, 2);
    }

    #[test]
    fn duplicate_cstr_copies_terminator() {
        let ctx = AllocContext::system();
        let s = CStr::from_bytes_with_nul(b"page\0").unwrap();
        let dup = ctx.duplicate_cstr(s).unwrap();
        assert_eq!(&dup[..], b"page\0");
        let dup = ctx.try_duplicate_cstr(s).unwrap();
        assert_eq!(dup.len(), 5);
    }

    /// Holds blocks and hands them back one per scavenge call.
    struct Hoard {
        held: Vec<Block>,
    }

    impl Scavenge for Hoard {
        fn scavenge(&mut self, _requested: usize, phase: &mut u32, reclaim: &Reclaimer<'_>) -> bool {
            *phase += 1;
            match self.held.pop() {
                Some(block) => {
                    reclaim.release_block(block);
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn scavenging_frees_room_under_budget() {
        use crate::raw::BudgetAllocator;

        let budget = Arc::new(BudgetAllocator::new(100));
        let filler = AllocContext::new(budget.clone(), Box::new(NoScavenge));
        // Both contexts draw on the same budget.
        let held = vec![filler.allocate(40).unwrap(), filler.allocate(40).unwrap()];
        let ctx = AllocContext::new(budget.clone(), Box::new(Hoard { held }));

        let block = ctx.allocate(50).unwrap();
        assert_eq!(block.len(), 50);
        assert_eq!(ctx.stats().scavenge_rounds, 1);
        assert_eq!(budget.used(), 90);
    }

    #[test]
    fn concurrent_allocations_are_serialised() {
        let ctx = AllocContext::system();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    for n in 1..50 {
                        let mut b = ctx.allocate(n + i).unwrap();
                        b.fill(i as u8);
                        assert!(b.iter().all(|&x| x == i as u8));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = ctx.stats();
        assert_eq!(stats.granted, 8 * 49);
        assert_eq!(stats.released, 8 * 49);
    }
}
