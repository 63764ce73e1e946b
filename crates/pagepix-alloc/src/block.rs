//! Owned allocation handed out by an [`AllocContext`](crate::AllocContext).

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::context::Shared;

/// A byte buffer drawn from an allocation context.
///
/// Dropping the block returns its memory to the context's allocator under
/// the context lock, so every block is released exactly once. An empty
/// block (`size == 0` requests, resize-to-zero) owns nothing and releases
/// nothing.
pub struct Block {
    bytes: Vec<u8>,
    owner: Option<Arc<Shared>>,
}

impl Block {
    pub(crate) fn new(bytes: Vec<u8>, owner: Arc<Shared>) -> Self {
        Self {
            bytes,
            owner: Some(owner),
        }
    }

    /// A block that holds no allocation.
    pub fn empty() -> Self {
        Self {
            bytes: Vec::new(),
            owner: None,
        }
    }

    /// True when the block holds no allocation.
    pub fn is_null(&self) -> bool {
        self.owner.is_none()
    }

    /// False when the block belongs to a context other than `shared`. Empty
    /// blocks belong to every context.
    pub(crate) fn owned_by(&self, shared: &Arc<Shared>) -> bool {
        self.owner.as_ref().is_none_or(|o| Arc::ptr_eq(o, shared))
    }

    /// Detach the bytes from release-on-drop. The caller becomes responsible
    /// for returning them to the same allocator.
    pub(crate) fn into_raw(mut self) -> Vec<u8> {
        self.owner = None;
        mem::take(&mut self.bytes)
    }

    pub(crate) fn take_parts(&mut self) -> (Vec<u8>, Option<Arc<Shared>>) {
        (mem::take(&mut self.bytes), self.owner.take())
    }

    pub(crate) fn set_parts(&mut self, bytes: Vec<u8>, owner: Option<Arc<Shared>>) {
        self.bytes = bytes;
        self.owner = owner;
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release(mem::take(&mut self.bytes));
        }
    }
}

impl Deref for Block {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("len", &self.bytes.len())
            .field("null", &self.is_null())
            .finish()
    }
}
