//! Error types for the pagepix library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`ExportError`]: **Fatal for one export call.** The page could not be
//!   resolved, rendered or written. Every export operation returns it, and
//!   [`ExportError::status_code`] folds it into the numeric convention used
//!   by foreign callers (-1 invalid handle, -2 render failure, -3 write
//!   failure).
//!
//! * [`ReduceError`]: the 1-bit reduction could not allocate its scratch
//!   buffer. No output byte is written in that case.
//!
//! * [`PageError`]: **Non-fatal** inside a batch. A single page failed while
//!   the others are fine; stored in [`crate::batch::PageOutcome`] so callers
//!   can inspect partial success.

use std::path::PathBuf;

use pagepix_alloc::AllocError;
use thiserror::Error;

use crate::config::{ColorMode, ImageFormat};

/// Status code for an unknown session handle.
pub const STATUS_INVALID_HANDLE: i32 = -1;
/// Status code for a failed page resolution, allocation or render.
pub const STATUS_RENDER_FAILED: i32 = -2;
/// Status code for a failed encode or file write.
pub const STATUS_WRITE_FAILED: i32 = -3;

/// All errors returned by export operations.
#[derive(Debug, Error)]
pub enum ExportError {
    // ── Handle errors ─────────────────────────────────────────────────────
    /// The session handle does not resolve (never opened or already closed).
    #[error("Invalid session handle {handle}")]
    InvalidHandle { handle: u64 },

    // ── Render errors ─────────────────────────────────────────────────────
    /// Page number is outside the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageNotFound { page: usize, total: usize },

    /// Opening the document or painting the page failed.
    #[error("Rendering failed for page {page}: {detail}")]
    Render { page: usize, detail: String },

    /// The pixel buffer could not be allocated.
    #[error("Pixel buffer allocation failed: {0}")]
    Alloc(#[from] AllocError),

    /// Black/white reduction failed.
    #[error(transparent)]
    Reduce(#[from] ReduceError),

    // ── Write errors ──────────────────────────────────────────────────────
    /// The image encoder rejected the pixel data or its parameters.
    #[error("Failed to encode {format} '{path}': {detail}")]
    Encode {
        format: ImageFormat,
        path: PathBuf,
        detail: String,
    },

    /// Could not create, read or write a file.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The colour mode cannot be written in the requested format.
    #[error("{format} cannot be written with colour mode {color}")]
    UnsupportedColor { format: ImageFormat, color: ColorMode },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or parameter validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ExportError {
    /// Numeric status for foreign callers.
    ///
    /// Validation failures of a write call (colour mode, parameters) are
    /// reported as write failures.
    pub fn status_code(&self) -> i32 {
        match self {
            ExportError::InvalidHandle { .. } => STATUS_INVALID_HANDLE,
            ExportError::PageNotFound { .. }
            | ExportError::Render { .. }
            | ExportError::Alloc(_)
            | ExportError::Reduce(_) => STATUS_RENDER_FAILED,
            ExportError::Encode { .. }
            | ExportError::Io { .. }
            | ExportError::UnsupportedColor { .. }
            | ExportError::InvalidConfig(_) => STATUS_WRITE_FAILED,
        }
    }

    pub(crate) fn render(page: usize, detail: impl Into<String>) -> Self {
        ExportError::Render {
            page,
            detail: detail.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExportError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of the black/white reduction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReduceError {
    /// The grayscale scratch buffer could not be allocated.
    #[error("Could not allocate {bytes}-byte grayscale scratch buffer")]
    ScratchAllocation { bytes: usize },
}

/// A non-fatal error for a single page of a batch.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Export of the page failed.
    #[error("Page {page}: {detail} (status {status})")]
    ExportFailed {
        page: usize,
        status: i32,
        detail: String,
    },

    /// The worker running the page panicked or was cancelled.
    #[error("Page {page}: worker failed: {detail}")]
    WorkerFailed { page: usize, detail: String },
}

impl PageError {
    pub(crate) fn from_export(page: usize, err: &ExportError) -> Self {
        PageError::ExportFailed {
            page,
            status: err.status_code(),
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_convention() {
        assert_eq!(ExportError::InvalidHandle { handle: 7 }.status_code(), -1);
        assert_eq!(ExportError::render(0, "boom").status_code(), -2);
        assert_eq!(
            ExportError::Alloc(AllocError::OutOfMemory {
                op: "malloc",
                bytes: 1
            })
            .status_code(),
            -2
        );
        assert_eq!(
            ExportError::Reduce(ReduceError::ScratchAllocation { bytes: 4 }).status_code(),
            -2
        );
        let encode = ExportError::Encode {
            format: ImageFormat::Png,
            path: "out.png".into(),
            detail: "bad".into(),
        };
        assert_eq!(encode.status_code(), -3);
        let io = ExportError::io(
            "x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no"),
        );
        assert_eq!(io.status_code(), -3);
    }

    #[test]
    fn unsupported_color_display() {
        let e = ExportError::UnsupportedColor {
            format: ImageFormat::Jpeg,
            color: ColorMode::Argb,
        };
        let msg = e.to_string();
        assert!(msg.contains("JPEG"), "got: {msg}");
        assert!(msg.contains("argb"), "got: {msg}");
    }

    #[test]
    fn page_error_keeps_status() {
        let e = ExportError::PageNotFound { page: 9, total: 3 };
        let pe = PageError::from_export(9, &e);
        let msg = pe.to_string();
        assert!(msg.contains("status -2"), "got: {msg}");
        assert!(msg.contains("3 pages"));
    }
}
