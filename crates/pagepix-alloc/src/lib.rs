//! # pagepix-alloc
//!
//! Memory-pressure-aware allocation for the pagepix renderer.
//!
//! An [`AllocContext`] bundles a pluggable [`RawAllocator`] with a reclaimable
//! cache implementing [`Scavenge`]. When the raw allocator fails, the context
//! asks the cache to free memory in increasingly aggressive phases and retries
//! until either the allocation succeeds or the cache has nothing left. The
//! raw call and the scavenge step run under one lock per context.
//!
//! ```rust
//! use std::sync::Arc;
//! use pagepix_alloc::{AllocContext, BudgetAllocator, ResourceStore};
//!
//! let store: ResourceStore<u32> = ResourceStore::new(4096);
//! let ctx = AllocContext::new(Arc::new(BudgetAllocator::new(8192)), Box::new(store.clone()));
//!
//! let block = ctx.allocate_array(16, 64).unwrap();
//! store.put(&ctx, 1, block);
//! assert_eq!(store.size(), 1024);
//! ```

pub mod block;
pub mod context;
pub mod error;
pub mod raw;
pub mod store;

pub use block::Block;
pub use context::{AllocContext, AllocStats, NoScavenge, Reclaimer, Scavenge};
pub use error::{AllocError, Result};
pub use raw::{BudgetAllocator, RawAllocator, SystemAllocator};
pub use store::{ResourceStore, StoreStats, SCAVENGE_PHASES, UNLIMITED};
