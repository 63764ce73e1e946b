//! Document and rendering collaborator contracts.
//!
//! The export pipeline never parses documents itself. It asks a
//! [`Document`] for a [`Page`], whose [`DisplayList`] paints into a
//! [`DrawDevice`] wrapping the pixmap being rendered.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ExportError;
use crate::geometry::{IRect, Matrix, Rect};
use crate::pixmap::Pixmap;

/// Kind of document behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    /// Pages carry an intrinsic rotation that [`crate::Rotation::Page`] honours.
    Pdf,
    /// Raster images; intrinsic rotation is always 0.
    Image,
}

/// Static facts about a page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    /// 0-based page index.
    pub index: usize,
    /// Page box in points.
    pub bounds: Rect,
    /// Intrinsic rotation in degrees.
    pub rotation: i32,
}

/// Paints a page into a device.
pub trait DisplayList: Send + Sync {
    /// Paint everything that falls inside `clip` using the page-to-device
    /// transform `ctm`. Runs to completion or fails; never suspends.
    fn run(&self, dev: &mut DrawDevice<'_>, ctm: &Matrix, clip: IRect) -> Result<(), ExportError>;
}

/// A resolved page, ready to paint.
pub struct Page {
    pub info: PageInfo,
    pub display_list: Box<dyn DisplayList>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("info", &self.info)
            .field("display_list", &"<dyn DisplayList>")
            .finish()
    }
}

/// Source of pages.
pub trait Document: Send {
    fn format(&self) -> DocumentFormat;

    fn page_count(&self) -> usize;

    /// Look up page `index` (0-based).
    fn resolve_page(&mut self, index: usize) -> Result<Page, ExportError>;
}

/// Rendering target handed to a display list.
///
/// Owned by exactly one export call and closed when dropped, on every exit
/// path.
pub struct DrawDevice<'a> {
    pixmap: &'a mut Pixmap,
    aa_level: u8,
}

impl<'a> DrawDevice<'a> {
    pub fn new(pixmap: &'a mut Pixmap, aa_level: u8) -> Self {
        trace!(bbox = %pixmap.bbox(), aa_level, "draw device opened");
        Self { pixmap, aa_level }
    }

    pub fn pixmap(&mut self) -> &mut Pixmap {
        self.pixmap
    }

    /// Anti-alias level, 0 (off) to 8.
    pub fn aa_level(&self) -> u8 {
        self.aa_level
    }
}

impl Drop for DrawDevice<'_> {
    fn drop(&mut self) {
        trace!("draw device closed");
    }
}

/// Page-space rectangle clipped and transformed into the device box used to
/// size the pixmap.
pub fn device_bbox(ctm: &Matrix, page_bounds: &Rect, crop: &Rect) -> IRect {
    IRect::round(&ctm.transform_rect(&crop.crop_to(page_bounds)))
}
