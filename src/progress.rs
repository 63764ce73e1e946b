//! Progress-callback trait for per-page export events.
//!
//! Pass an [`Arc<dyn ExportProgressCallback>`] in
//! [`crate::batch::ExportJob::progress`] to receive events as the batch
//! exports each page.
//!
//! # Example
//!
//! ```rust
//! use pagepix::ExportProgressCallback;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ExportProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, bytes: u64) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {}/{} done ({} bytes)", page_num, total_pages, bytes);
//!     }
//! }
//!
//! let cb: Arc<dyn ExportProgressCallback> = Arc::new(CountingCallback {
//!     completed: AtomicUsize::new(0),
//! });
//! cb.on_page_complete(1, 3, 1024);
//! ```

use std::sync::Arc;

/// Called by the batch exporter as it processes each page.
///
/// Pages run on several blocking workers at once, so every method may be
/// called concurrently. All methods default to no-ops.
pub trait ExportProgressCallback: Send + Sync {
    /// Called once before any page is rendered.
    fn on_export_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called just before a page is rendered.
    ///
    /// # Arguments
    /// * `page_num`:    1-indexed page number
    /// * `total_pages`: pages in this batch
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page has been written.
    ///
    /// # Arguments
    /// * `page_num`:    1-indexed page number
    /// * `total_pages`: pages in this batch
    /// * `bytes`:       size of the written output
    fn on_page_complete(&self, page_num: usize, total_pages: usize, bytes: u64) {
        let _ = (page_num, total_pages, bytes);
    }

    /// Called when a page fails.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after every page has been attempted.
    fn on_export_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExportProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::batch::ExportJob`].
pub type ProgressCallback = Arc<dyn ExportProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        bytes: AtomicUsize,
    }

    impl ExportProgressCallback for TrackingCallback {
        fn on_page_start(&self, _page_num: usize, _total_pages: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page_num: usize, _total_pages: usize, bytes: u64) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            self.bytes.fetch_add(bytes as usize, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page_num: usize, _total_pages: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_export_start(5);
        cb.on_page_start(1, 5);
        cb.on_page_complete(1, 5, 42);
        cb.on_page_error(2, 5, "render failed");
        cb.on_export_complete(5, 4);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_page_start(1, 2);
        tracker.on_page_complete(1, 2, 100);
        tracker.on_page_start(2, 2);
        tracker.on_page_error(2, 2, "encode failed");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.bytes.load(Ordering::SeqCst), 100);
    }
}
