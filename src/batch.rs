//! Concurrent export of many pages.
//!
//! Each page runs on a `spawn_blocking` worker with a document of its own,
//! opened through the caller's factory. All workers share one
//! [`SharedContext`], so every pixel buffer of the batch is drawn from the
//! same allocator and serialised by the same lock, and cached renders in the
//! shared store are reclaimed when any worker runs short.
//!
//! A failed page is recorded in its [`PageOutcome`] and the batch carries
//! on. TIFF append jobs write into a single file and therefore run one page
//! at a time in page order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use pagepix_alloc::{AllocContext, RawAllocator, ResourceStore, SystemAllocator};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ExportOptions, FormatParams, ImageFormat, SessionConfig, TiffMode};
use crate::document::Document;
use crate::error::{ExportError, PageError};
use crate::geometry::IRect;
use crate::pipeline::encode;
use crate::progress::ProgressCallback;
use crate::session::{RenderKey, Session};

/// Allocation context and render store shared by every worker of a batch.
#[derive(Debug, Clone)]
pub struct SharedContext {
    pub ctx: AllocContext,
    pub store: ResourceStore<RenderKey>,
}

impl SharedContext {
    /// Process heap, scavenging a store of `max_store` bytes.
    pub fn new(max_store: usize) -> Self {
        Self::with_allocator(Arc::new(SystemAllocator), max_store)
    }

    pub fn with_allocator(raw: Arc<dyn RawAllocator>, max_store: usize) -> Self {
        let store = ResourceStore::new(max_store);
        let ctx = AllocContext::new(raw, Box::new(store.clone()));
        Self { ctx, store }
    }
}

/// What each page turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Output {
    /// An image file.
    File(FormatParams),
    /// The packed pixel buffer, written verbatim (`.raw`).
    Raw,
}

impl Output {
    fn extension(&self) -> &'static str {
        match self {
            Output::File(p) => p.format().extension(),
            Output::Raw => "raw",
        }
    }

    fn appends(&self) -> bool {
        matches!(self, Output::File(FormatParams::Tiff(p)) if p.mode == TiffMode::Append)
    }
}

/// Settings for one batch.
#[derive(Clone)]
pub struct ExportJob {
    pub options: ExportOptions,
    pub output: Output,
    /// Directory the files are written to.
    pub out_dir: PathBuf,
    /// File name prefix. Pages become `{stem}-{page:04}.{ext}`; a TIFF
    /// append job writes everything to `{stem}.tif`.
    pub stem: String,
    pub session: SessionConfig,
    pub progress: Option<ProgressCallback>,
}

impl fmt::Debug for ExportJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportJob")
            .field("options", &self.options)
            .field("output", &self.output)
            .field("out_dir", &self.out_dir)
            .field("stem", &self.stem)
            .field("session", &self.session)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl ExportJob {
    pub fn new(options: ExportOptions, output: Output, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            options,
            output,
            out_dir: out_dir.into(),
            stem: "page".into(),
            session: SessionConfig::default(),
            progress: None,
        }
    }

    /// Destination of page `page` (0-based).
    pub fn output_path(&self, page: usize) -> PathBuf {
        let name = if self.output.appends() {
            format!("{}.{}", self.stem, ImageFormat::Tiff.extension())
        } else {
            format!("{}-{:04}.{}", self.stem, page + 1, self.output.extension())
        };
        self.out_dir.join(name)
    }

    fn sequential(&self) -> bool {
        self.output.appends()
    }
}

/// Result for one page of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageOutcome {
    /// 1-indexed page number.
    pub page: usize,
    pub path: Option<PathBuf>,
    /// Size of the written file, or of the raw buffer.
    pub bytes: u64,
    /// Output pixel bounds, `[0, 0, w, h]`.
    pub bounds: Option<IRect>,
    pub error: Option<PageError>,
    pub duration_ms: u64,
}

impl PageOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-page outcomes of a batch, in page order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportReport {
    pub pages: Vec<PageOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Export `pages` (0-based) concurrently, at most `concurrency` at a time.
pub async fn export_pages<F>(
    open: F,
    shared: SharedContext,
    pages: Vec<usize>,
    job: ExportJob,
    concurrency: usize,
) -> ExportReport
where
    F: Fn() -> Result<Box<dyn Document>, ExportError> + Send + Sync + 'static,
{
    let start = Instant::now();
    let total = pages.len();
    let limit = if job.sequential() { 1 } else { concurrency.max(1) };
    info!(pages = total, concurrency = limit, output = ?job.output, "starting export");
    if let Some(cb) = &job.progress {
        cb.on_export_start(total);
    }

    let open = Arc::new(open);
    let job = Arc::new(job);
    let mut outcomes: Vec<PageOutcome> = stream::iter(pages.into_iter().map(|page| {
        let open = Arc::clone(&open);
        let job = Arc::clone(&job);
        let shared = shared.clone();
        async move {
            let page_num = page + 1;
            if let Some(cb) = &job.progress {
                cb.on_page_start(page_num, total);
            }
            let page_start = Instant::now();
            let worker_job = Arc::clone(&job);
            let joined = tokio::task::spawn_blocking(move || {
                let doc = (*open)()?;
                let mut session =
                    Session::with_context(doc, shared.ctx, shared.store, worker_job.session);
                export_one(&mut session, page, &worker_job)
            })
            .await;
            let duration_ms = page_start.elapsed().as_millis() as u64;

            let outcome = match joined {
                Ok(Ok((path, bytes, bounds))) => PageOutcome {
                    page: page_num,
                    path: Some(path),
                    bytes,
                    bounds: Some(bounds),
                    error: None,
                    duration_ms,
                },
                Ok(Err(e)) => {
                    warn!(page = page_num, status = e.status_code(), "page export failed: {e}");
                    failed(page_num, PageError::from_export(page_num, &e), duration_ms)
                }
                Err(e) => {
                    warn!(page = page_num, "export worker failed: {e}");
                    let err = PageError::WorkerFailed {
                        page: page_num,
                        detail: e.to_string(),
                    };
                    failed(page_num, err, duration_ms)
                }
            };
            if let Some(cb) = &job.progress {
                match &outcome.error {
                    None => cb.on_page_complete(page_num, total, outcome.bytes),
                    Some(e) => cb.on_page_error(page_num, total, &e.to_string()),
                }
            }
            outcome
        }
    }))
    .buffer_unordered(limit)
    .collect()
    .await;

    outcomes.sort_by_key(|o| o.page);
    let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
    let report = ExportReport {
        failed: outcomes.len() - succeeded,
        succeeded,
        pages: outcomes,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    if let Some(cb) = &job.progress {
        cb.on_export_complete(total, succeeded);
    }
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        duration_ms = report.duration_ms,
        "export finished"
    );
    report
}

fn failed(page: usize, error: PageError, duration_ms: u64) -> PageOutcome {
    PageOutcome {
        page,
        path: None,
        bytes: 0,
        bounds: None,
        error: Some(error),
        duration_ms,
    }
}

/// Export one page through `session`: returns the path, the byte count and
/// the output bounds.
fn export_one(session: &mut Session, page: usize, job: &ExportJob) -> Result<(PathBuf, u64, IRect), ExportError> {
    let path = job.output_path(page);
    match &job.output {
        Output::File(params) => {
            let size = session.write(page, &job.options, params, &path)?;
            let bytes = file_len(&path)?;
            debug!(page, path = %path.display(), bytes, "page exported");
            Ok((path, bytes, IRect::new(0, 0, size.width as i32, size.height as i32)))
        }
        Output::Raw => {
            let buffer = session.pixel_buffer(page, &job.options)?;
            let written = encode::write_atomically(&path, &buffer.block);
            let bytes = buffer.block.len() as u64;
            let bounds = buffer.bounds;
            session.release_buffer(buffer);
            written?;
            debug!(page, path = %path.display(), bytes, "raw buffer exported");
            Ok((path, bytes, bounds))
        }
    }
}

fn file_len(path: &Path) -> Result<u64, ExportError> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| ExportError::io(path, e))
}
