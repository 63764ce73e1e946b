//! Stages applied to a rendered pixmap.
//!
//! ## Data Flow
//!
//! ```text
//! pixmap ──▶ reduce ──▶ pack    (caller arrays and buffers)
//!        └─────────────▶ encode  (image files)
//! ```
//!
//! 1. [`reduce`]: gray scratch, threshold and Floyd-Steinberg diffusion into
//!    byte-per-pixel or packed 1-bit output
//! 2. [`pack`]: ARGB words or reduced bytes for callers
//! 3. [`encode`]: one writer per image format
//!
//! Every stage draws its temporary buffers from the session's allocation
//! context.

pub mod encode;
pub mod pack;
pub mod reduce;
