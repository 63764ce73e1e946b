//! Error type for the allocation context.
//!
//! Exhaustion and size overflow are kept apart: an overflowing
//! `count * size` is detected before the underlying allocator is touched,
//! so it never triggers scavenging.

use thiserror::Error;

/// Result alias for the throwing allocation variants.
pub type Result<T> = std::result::Result<T, AllocError>;

/// Failure of a throwing allocation operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The underlying allocator failed and the store could reclaim nothing more.
    #[error("{op} of {bytes} bytes failed")]
    OutOfMemory { op: &'static str, bytes: usize },

    /// `count * size` does not fit in `usize`.
    #[error("{op} ({count} x {size} bytes) failed (integer overflow)")]
    IntegerOverflow {
        op: &'static str,
        count: usize,
        size: usize,
    },

    /// The block was handed out by a different allocation context.
    #[error("{op} of a block owned by another allocation context")]
    ForeignBlock { op: &'static str },
}

impl AllocError {
    /// True for [`AllocError::IntegerOverflow`].
    pub fn is_overflow(&self) -> bool {
        matches!(self, AllocError::IntegerOverflow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_message_names_both_factors() {
        let e = AllocError::IntegerOverflow {
            op: "malloc of array",
            count: 7,
            size: 9,
        };
        let msg = e.to_string();
        assert!(msg.contains("7 x 9"), "got: {msg}");
        assert!(msg.contains("integer overflow"));
        assert!(e.is_overflow());
    }

    #[test]
    fn oom_message() {
        let e = AllocError::OutOfMemory {
            op: "malloc",
            bytes: 4096,
        };
        assert_eq!(e.to_string(), "malloc of 4096 bytes failed");
        assert!(!e.is_overflow());
    }
}
