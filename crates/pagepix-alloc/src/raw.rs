//! Pluggable low-level allocators.
//!
//! A [`RawAllocator`] is the capability record the allocation context draws
//! memory from: allocate, reallocate and release always come as one
//! implementation, never overridden piecemeal. Any user data the allocator
//! needs lives in the implementing type itself.
//!
//! Two implementations ship with the crate:
//!
//! * [`SystemAllocator`]: the process heap, with fallible reservation so an
//!   exhausted heap reports `None` instead of aborting.
//! * [`BudgetAllocator`]: the process heap behind a hard byte ceiling. Used
//!   to run the renderer inside a fixed memory envelope and to reproduce
//!   memory pressure deterministically in tests.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Low-level allocator contract.
///
/// Every method is called with the owning context's lock held, so
/// implementations never see two calls at once from the same context.
pub trait RawAllocator: Send + Sync {
    /// Return a buffer of exactly `size` bytes, or `None` when out of memory.
    fn allocate(&self, size: usize) -> Option<Vec<u8>>;

    /// Resize `block` to exactly `size` bytes, preserving the common prefix.
    ///
    /// On failure the untouched original is handed back in `Err`.
    fn reallocate(&self, block: Vec<u8>, size: usize) -> Result<Vec<u8>, Vec<u8>>;

    /// Give `block` back.
    fn release(&self, block: Vec<u8>);
}

/// The process heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl RawAllocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        buf.resize(size, 0);
        Some(buf)
    }

    fn reallocate(&self, mut block: Vec<u8>, size: usize) -> Result<Vec<u8>, Vec<u8>> {
        if size > block.len() && block.try_reserve_exact(size - block.len()).is_err() {
            return Err(block);
        }
        block.resize(size, 0);
        block.shrink_to(size);
        Ok(block)
    }

    fn release(&self, block: Vec<u8>) {
        drop(block);
    }
}

/// The process heap limited to `capacity` live bytes.
///
/// Accounting follows the lengths handed out: `allocate(n)` charges `n`,
/// `reallocate` charges or refunds the difference, `release` refunds the
/// block's length.
#[derive(Debug)]
pub struct BudgetAllocator {
    capacity: usize,
    used: AtomicUsize,
}

impl BudgetAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    /// Configured ceiling in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn try_charge(&self, bytes: usize) -> bool {
        loop {
            let cur = self.used.load(Ordering::Relaxed);
            let next = cur.saturating_add(bytes);
            if next > self.capacity {
                return false;
            }
            if self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn refund(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

impl RawAllocator for BudgetAllocator {
    fn allocate(&self, size: usize) -> Option<Vec<u8>> {
        if !self.try_charge(size) {
            return None;
        }
        match SystemAllocator.allocate(size) {
            Some(buf) => Some(buf),
            None => {
                self.refund(size);
                None
            }
        }
    }

    fn reallocate(&self, block: Vec<u8>, size: usize) -> Result<Vec<u8>, Vec<u8>> {
        let old = block.len();
        if size > old && !self.try_charge(size - old) {
            return Err(block);
        }
        match SystemAllocator.reallocate(block, size) {
            Ok(buf) => {
                if size < old {
                    self.refund(old - size);
                }
                Ok(buf)
            }
            Err(block) => {
                if size > old {
                    self.refund(size - old);
                }
                Err(block)
            }
        }
    }

    fn release(&self, block: Vec<u8>) {
        self.refund(block.len());
    }
}
