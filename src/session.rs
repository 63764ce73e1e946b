//! One open document plus the state every export from it shares.
//!
//! A [`Session`] owns the [`Document`], the allocation context all pixel
//! buffers come from, the reclaimable store that context scavenges, and the
//! rasteriser settings. Every export runs the same sequence:
//!
//! 1. resolve the page
//! 2. build the view transform and the device box
//! 3. allocate a pixmap over that box
//! 4. clear it (transparent for ARGB, white otherwise)
//! 5. paint the display list through a [`DrawDevice`]
//! 6. gamma, then unmultiply
//! 7. pack or encode
//!
//! The pixmap is released when the call returns, whatever the outcome.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pagepix_alloc::{AllocContext, Block, ResourceStore, SystemAllocator};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::config::{
    clamp_aa_level, BmpParams, ColorMode, ExportOptions, FormatParams, ImageFormat, JpegParams,
    PamParams, PbmParams, PngParams, PnmParams, SessionConfig, TiffParams,
};
use crate::document::{device_bbox, Document, DocumentFormat, DrawDevice};
use crate::error::ExportError;
use crate::geometry::{IRect, Matrix};
use crate::pipeline::{encode, pack, reduce};
use crate::pipeline::pack::PixelArray;
use crate::pipeline::reduce::Bitmap;
use crate::pixmap::{Colorspace, Pixmap};

/// Source of document ids; unique per session within the process.
static NEXT_DOC_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one rendered pixmap in the store.
///
/// Stores may be shared between sessions, so the key names the session's
/// document and the anti-alias level the pixels were drawn at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderKey {
    doc: u64,
    page: usize,
    zoom: u32,
    rotation: i32,
    colorspace: Colorspace,
    transparent: bool,
    gamma: u32,
    crop: [u32; 4],
    aa_level: u8,
    generation: u64,
}

impl RenderKey {
    fn new(session: &Session, page: usize, opts: &ExportOptions, rotation: i32, colorspace: Colorspace) -> Self {
        let c = opts.crop;
        Self {
            doc: session.doc_id,
            page,
            zoom: opts.zoom.to_bits(),
            rotation,
            colorspace,
            transparent: opts.color == ColorMode::Argb,
            gamma: if opts.applies_gamma() { opts.gamma.to_bits() } else { 0 },
            crop: [c.x0.to_bits(), c.y0.to_bits(), c.x1.to_bits(), c.y1.to_bits()],
            aa_level: session.aa_level,
            generation: session.glyph_generation,
        }
    }
}

/// Pixels handed out by [`Session::pixel_buffer`].
///
/// Colour modes hold one native-endian `u32` per pixel, black/white modes
/// one byte per pixel. Give it back with [`Session::release_buffer`].
#[derive(Debug)]
pub struct DirectBuffer {
    pub block: Block,
    pub bounds: IRect,
    pub color: ColorMode,
}

/// Pixel size of a written page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderSummary {
    pub width: u32,
    pub height: u32,
}

/// An open document and its rendering state.
pub struct Session {
    doc: Box<dyn Document>,
    doc_id: u64,
    ctx: AllocContext,
    store: ResourceStore<RenderKey>,
    config: SessionConfig,
    aa_level: u8,
    glyph_generation: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("format", &self.doc.format())
            .field("pages", &self.doc.page_count())
            .field("aa_level", &self.aa_level)
            .field("glyph_generation", &self.glyph_generation)
            .field("store", &self.store)
            .finish()
    }
}

impl Session {
    /// Open a session with its own context over the process heap, scavenging
    /// a store of `config.max_store` bytes.
    pub fn new(doc: Box<dyn Document>, config: SessionConfig) -> Self {
        let store = ResourceStore::new(config.max_store);
        let ctx = AllocContext::new(Arc::new(SystemAllocator), Box::new(store.clone()));
        Self::with_context(doc, ctx, store, config)
    }

    /// Open a session on an existing context. `store` should be the context's
    /// scavenger so cached renders are given up under memory pressure.
    pub fn with_context(
        doc: Box<dyn Document>,
        ctx: AllocContext,
        store: ResourceStore<RenderKey>,
        config: SessionConfig,
    ) -> Self {
        let aa_level = clamp_aa_level(config.aa_level.into());
        debug!(
            format = ?doc.format(),
            pages = doc.page_count(),
            aa_level,
            max_store = store.max(),
            "session opened"
        );
        Self {
            doc,
            doc_id: NEXT_DOC_ID.fetch_add(1, Ordering::Relaxed),
            ctx,
            store,
            config,
            aa_level,
            glyph_generation: 0,
        }
    }

    pub fn page_count(&self) -> usize {
        self.doc.page_count()
    }

    pub fn format(&self) -> DocumentFormat {
        self.doc.format()
    }

    pub fn context(&self) -> &AllocContext {
        &self.ctx
    }

    pub fn store(&self) -> &ResourceStore<RenderKey> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bumped every time cached glyph renderings are invalidated.
    pub fn glyph_generation(&self) -> u64 {
        self.glyph_generation
    }

    pub fn anti_alias_level(&self) -> u8 {
        self.aa_level
    }

    /// Set the anti-alias level, clamped to 0..=8. A change invalidates the
    /// glyph cache and drops cached renders.
    pub fn set_anti_alias_level(&mut self, level: i64) {
        let level = clamp_aa_level(level);
        if level == self.aa_level {
            return;
        }
        debug!(from = self.aa_level, to = level, "anti-alias level changed");
        self.aa_level = level;
        self.glyph_generation += 1;
        self.store.clear(&self.ctx);
    }

    /// Render page `page` (0-based) into a freshly allocated pixmap.
    pub fn render(&mut self, page: usize, opts: &ExportOptions) -> Result<Pixmap, ExportError> {
        let resolved = self.doc.resolve_page(page)?;
        let intrinsic = match self.doc.format() {
            DocumentFormat::Pdf => resolved.info.rotation,
            DocumentFormat::Image => 0,
        };
        let rotation = opts.rotation.resolve(intrinsic);
        let ctm = Matrix::view(opts.zoom, rotation);
        let bbox = device_bbox(&ctm, &resolved.info.bounds, &opts.crop);
        let colorspace = if opts.color.is_rgb() {
            Colorspace::Rgb
        } else {
            Colorspace::Gray
        };
        debug!(page, zoom = opts.zoom, rotation, %bbox, ?colorspace, "rendering page");

        let key = self
            .config
            .render_cache
            .then(|| RenderKey::new(self, page, opts, rotation, colorspace));
        if let Some(key) = &key {
            if let Some(pix) = self
                .store
                .get(&self.ctx, key)
                .and_then(|block| Pixmap::from_samples(bbox, colorspace, true, block))
            {
                trace!(page, "render served from store");
                return Ok(pix);
            }
        }

        let mut pix = Pixmap::new_with_rect(&self.ctx, colorspace, bbox, true)?;
        if !pix.has_samples() {
            return Err(ExportError::render(page, format!("device box {bbox} has no pixels")));
        }
        if opts.color == ColorMode::Argb {
            pix.clear();
        } else {
            pix.clear_with_value(255);
        }

        {
            let mut dev = DrawDevice::new(&mut pix, self.aa_level);
            resolved
                .display_list
                .run(&mut dev, &ctm, bbox)
                .map_err(|e| match e {
                    ExportError::Render { .. } => e,
                    other => ExportError::render(page, other.to_string()),
                })?;
        }

        if opts.applies_gamma() {
            pix.gamma(opts.gamma);
        }
        pix.unmultiply();

        if let Some(key) = key {
            self.keep(key, &pix);
        }
        Ok(pix)
    }

    /// Park a copy of `pix` in the store. Skipped when memory is short.
    fn keep(&self, key: RenderKey, pix: &Pixmap) {
        let Some(mut copy) = self.ctx.try_allocate(pix.samples().len()) else {
            return;
        };
        copy.copy_from_slice(pix.samples());
        if !self.store.put(&self.ctx, key, copy) {
            trace!(bytes = pix.samples().len(), "render too large for the store");
        }
    }

    /// Render and pack into a [`PixelArray`]. The bounds are `[0, 0, w, h]`.
    pub fn pixel_array(&mut self, page: usize, opts: &ExportOptions) -> Result<(PixelArray, IRect), ExportError> {
        let pix = self.render(page, opts)?;
        let array = pack::pixel_array(&self.ctx, &pix, opts.color)?;
        Ok((array, output_bounds(&pix)))
    }

    /// Render and pack into a context-allocated buffer.
    pub fn pixel_buffer(&mut self, page: usize, opts: &ExportOptions) -> Result<DirectBuffer, ExportError> {
        let pix = self.render(page, opts)?;
        let block = pack::direct_buffer(&self.ctx, &pix, opts.color)?;
        Ok(DirectBuffer {
            block,
            bounds: output_bounds(&pix),
            color: opts.color,
        })
    }

    /// Return a buffer from [`pixel_buffer`](Self::pixel_buffer).
    pub fn release_buffer(&self, buffer: DirectBuffer) {
        self.ctx.release(buffer.block);
    }

    /// Render and reduce to packed 1-bit rows. Only
    /// [`ColorMode::BlackWhiteDither`] diffuses the threshold error.
    pub fn packed_bitmap(&mut self, page: usize, opts: &ExportOptions) -> Result<Bitmap, ExportError> {
        let pix = self.render(page, opts)?;
        Ok(reduce::to_bitmap(&self.ctx, &pix.view(), opts.color.dithers())?)
    }

    /// Render and write one page with the encoder chosen by `params`.
    ///
    /// The colour mode is checked against the format before anything is
    /// rendered. PBM always renders gray.
    pub fn write(
        &mut self,
        page: usize,
        opts: &ExportOptions,
        params: &FormatParams,
        path: &Path,
    ) -> Result<RenderSummary, ExportError> {
        let format = params.format();
        if !format.accepts(opts.color) {
            return Err(ExportError::UnsupportedColor {
                format,
                color: opts.color,
            });
        }
        if let FormatParams::Tiff(p) = params {
            p.validate(opts.color)?;
        }
        let mut opts = *opts;
        if format == ImageFormat::Pbm {
            opts.color = ColorMode::Gray;
        }

        let pix = self.render(page, &opts)?;
        let color = opts.color;
        match params {
            FormatParams::Png(p) => encode::write_png(&pix, color, p, path),
            FormatParams::Jpeg(p) => encode::write_jpeg(&pix, color, p, path),
            FormatParams::Tiff(p) => encode::write_tiff(&self.ctx, &pix, color, p, path),
            FormatParams::Pnm(p) => encode::write_pnm(&pix, color, p, path),
            FormatParams::Pam(p) => encode::write_pam(&pix, color, p, path),
            FormatParams::Pbm(p) => encode::write_pbm(&self.ctx, &pix, p, path),
            FormatParams::Bmp(p) => encode::write_bmp(&self.ctx, &pix, color, p, path),
        }?;
        info!(page, %format, path = %path.display(), w = pix.width(), h = pix.height(), "page written");
        Ok(RenderSummary {
            width: pix.width() as u32,
            height: pix.height() as u32,
        })
    }

    pub fn write_png(
        &mut self,
        page: usize,
        zoom: f32,
        color: ColorMode,
        gamma: f32,
        path: &Path,
        params: &PngParams,
    ) -> Result<(), ExportError> {
        let opts = ExportOptions::for_write(zoom, color, gamma)?;
        self.write(page, &opts, &FormatParams::Png(*params), path).map(drop)
    }

    pub fn write_jpeg(
        &mut self,
        page: usize,
        zoom: f32,
        color: ColorMode,
        gamma: f32,
        path: &Path,
        params: &JpegParams,
    ) -> Result<(), ExportError> {
        let opts = ExportOptions::for_write(zoom, color, gamma)?;
        self.write(page, &opts, &FormatParams::Jpeg(*params), path).map(drop)
    }

    pub fn write_tiff(
        &mut self,
        page: usize,
        zoom: f32,
        color: ColorMode,
        gamma: f32,
        path: &Path,
        params: &TiffParams,
    ) -> Result<(), ExportError> {
        let opts = ExportOptions::for_write(zoom, color, gamma)?;
        self.write(page, &opts, &FormatParams::Tiff(*params), path).map(drop)
    }

    pub fn write_pnm(
        &mut self,
        page: usize,
        zoom: f32,
        color: ColorMode,
        gamma: f32,
        path: &Path,
        params: &PnmParams,
    ) -> Result<(), ExportError> {
        let opts = ExportOptions::for_write(zoom, color, gamma)?;
        self.write(page, &opts, &FormatParams::Pnm(*params), path).map(drop)
    }

    pub fn write_pam(
        &mut self,
        page: usize,
        zoom: f32,
        color: ColorMode,
        gamma: f32,
        path: &Path,
        params: &PamParams,
    ) -> Result<(), ExportError> {
        let opts = ExportOptions::for_write(zoom, color, gamma)?;
        self.write(page, &opts, &FormatParams::Pam(*params), path).map(drop)
    }

    /// Write a 1-bit PBM. `color` is accepted for symmetry with the other
    /// writers; the page is always rendered gray.
    pub fn write_pbm(
        &mut self,
        page: usize,
        zoom: f32,
        color: ColorMode,
        gamma: f32,
        path: &Path,
        params: &PbmParams,
    ) -> Result<(), ExportError> {
        let opts = ExportOptions::for_write(zoom, color, gamma)?;
        self.write(page, &opts, &FormatParams::Pbm(*params), path).map(drop)
    }

    pub fn write_bmp(
        &mut self,
        page: usize,
        zoom: f32,
        color: ColorMode,
        gamma: f32,
        path: &Path,
        params: &BmpParams,
    ) -> Result<(), ExportError> {
        let opts = ExportOptions::for_write(zoom, color, gamma)?;
        self.write(page, &opts, &FormatParams::Bmp(*params), path).map(drop)
    }
}

fn output_bounds(pix: &Pixmap) -> IRect {
    IRect::new(0, 0, pix.width() as i32, pix.height() as i32)
}
