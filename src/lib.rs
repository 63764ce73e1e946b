//! # pagepix
//!
//! Render document pages into pixmaps under a memory-pressure-aware
//! allocator, reduce them to 1-bit with error diffusion, and export them as
//! caller buffers or image files.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Document
//!  │
//!  ├─ 1. Resolve   page lookup through the Document collaborator
//!  ├─ 2. Place     zoom + rotation transform, crop, integer device box
//!  ├─ 3. Allocate  pixmap from the session AllocContext (scavenges on OOM)
//!  ├─ 4. Paint     display list into a DrawDevice
//!  ├─ 5. Adjust    gamma, unmultiply
//!  └─ 6. Output    packed array / direct buffer / 1-bit bitmap / image file
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagepix::{ColorMode, ExportOptions, RasterDocument, Session, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let doc = RasterDocument::open(["scan.png"])?;
//!     let mut session = Session::new(Box::new(doc), SessionConfig::from_env());
//!
//!     let opts = ExportOptions::builder()
//!         .zoom(2.0)
//!         .color(ColorMode::BlackWhiteDither)
//!         .build()?;
//!     let bitmap = session.packed_bitmap(0, &opts)?;
//!     eprintln!("{}x{} bitmap, {} bytes", bitmap.width, bitmap.height, bitmap.data.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pagepix` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pagepix = { version = "0.1", default-features = false }
//! ```
//!
//! ## Status codes
//!
//! Foreign callers see every failure as a number:
//!
//! | Code | Meaning |
//! |------|---------|
//! | `0`  | success |
//! | `-1` | invalid session handle |
//! | `-2` | page lookup, allocation or render failed |
//! | `-3` | encode or write failed |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod document;
pub mod error;
pub mod geometry;
pub mod pipeline;
pub mod pixmap;
pub mod progress;
pub mod raster_doc;
pub mod registry;
pub mod session;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{export_pages, ExportJob, ExportReport, Output, PageOutcome, SharedContext};
pub use config::{
    BmpParams, ColorMode, ExportOptions, ExportOptionsBuilder, FormatParams, ImageFormat,
    JpegParams, PageSelection, PamParams, PbmParams, PngParams, PnmParams, SessionConfig,
    TiffCompression, TiffMode, TiffParams,
};
pub use document::{DisplayList, Document, DocumentFormat, DrawDevice, Page, PageInfo};
pub use error::{ExportError, PageError, ReduceError};
pub use geometry::{IRect, Matrix, Rect, Rotation};
pub use pipeline::pack::PixelArray;
pub use pipeline::reduce::Bitmap;
pub use pixmap::{Colorspace, Pixmap};
pub use progress::{ExportProgressCallback, NoopProgressCallback};
pub use raster_doc::RasterDocument;
pub use registry::Registry;
pub use session::{DirectBuffer, RenderSummary, Session};

pub use pagepix_alloc;
