//! Pixel buffers drawn from the allocation context.
//!
//! A [`Pixmap`] is row-major with channels interleaved per pixel: colour
//! channels first, alpha (when present) last. Samples are premultiplied by
//! alpha until [`Pixmap::unmultiply`] runs.

use std::fmt;

use pagepix_alloc::{AllocContext, AllocError, Block};
use serde::{Deserialize, Serialize};

use crate::geometry::IRect;

/// Colour family of a pixmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colorspace {
    Gray,
    Rgb,
}

impl Colorspace {
    /// Colour channels, excluding alpha.
    pub fn n(self) -> usize {
        match self {
            Colorspace::Gray => 1,
            Colorspace::Rgb => 3,
        }
    }
}

/// Borrowed view of interleaved 8-bit samples.
#[derive(Debug, Clone, Copy)]
pub struct PixelView<'a> {
    pub samples: &'a [u8],
    pub width: usize,
    pub height: usize,
    /// Bytes per pixel, alpha included.
    pub channels: usize,
    /// Whether the last channel is alpha.
    pub alpha: bool,
}

impl<'a> PixelView<'a> {
    /// View without alpha, e.g. a packed RGB or gray buffer.
    pub fn opaque(samples: &'a [u8], width: usize, height: usize, channels: usize) -> Self {
        Self {
            samples,
            width,
            height,
            channels,
            alpha: false,
        }
    }

    /// Number of channels that carry colour.
    pub fn color_channels(&self) -> usize {
        if self.alpha {
            self.channels.saturating_sub(1)
        } else {
            self.channels
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Rendered pixel buffer.
pub struct Pixmap {
    x: i32,
    y: i32,
    width: usize,
    height: usize,
    colorspace: Colorspace,
    alpha: bool,
    samples: Block,
}

impl fmt::Debug for Pixmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pixmap")
            .field("bbox", &self.bbox())
            .field("colorspace", &self.colorspace)
            .field("alpha", &self.alpha)
            .field("bytes", &self.samples.len())
            .finish()
    }
}

impl Pixmap {
    /// Allocate an uninitialised pixmap covering `bbox`.
    ///
    /// An empty box yields a pixmap without sample storage.
    pub fn new_with_rect(
        ctx: &AllocContext,
        colorspace: Colorspace,
        bbox: IRect,
        alpha: bool,
    ) -> Result<Self, AllocError> {
        let width = bbox.width() as usize;
        let height = bbox.height() as usize;
        let n = colorspace.n() + usize::from(alpha);
        let stride = width.checked_mul(n).ok_or(AllocError::IntegerOverflow {
            op: "pixmap row",
            count: width,
            size: n,
        })?;
        let samples = ctx.allocate_array(height, stride)?;
        Ok(Self {
            x: bbox.x0,
            y: bbox.y0,
            width,
            height,
            colorspace,
            alpha,
            samples,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    pub fn has_alpha(&self) -> bool {
        self.alpha
    }

    /// Bytes per pixel.
    pub fn n(&self) -> usize {
        self.colorspace.n() + usize::from(self.alpha)
    }

    pub fn stride(&self) -> usize {
        self.width * self.n()
    }

    /// Device-space box the pixmap covers.
    pub fn bbox(&self) -> IRect {
        IRect::new(
            self.x,
            self.y,
            self.x + self.width as i32,
            self.y + self.height as i32,
        )
    }

    /// False when the pixmap holds no sample storage.
    pub fn has_samples(&self) -> bool {
        !self.samples.is_null()
    }

    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [u8] {
        &mut self.samples
    }

    pub fn view(&self) -> PixelView<'_> {
        PixelView {
            samples: &self.samples,
            width: self.width,
            height: self.height,
            channels: self.n(),
            alpha: self.alpha,
        }
    }

    /// Give the sample block back, e.g. to park it in the store.
    pub fn into_samples(self) -> Block {
        self.samples
    }

    /// Rebuild a pixmap around samples taken from [`into_samples`](Self::into_samples).
    pub fn from_samples(
        bbox: IRect,
        colorspace: Colorspace,
        alpha: bool,
        samples: Block,
    ) -> Option<Self> {
        let width = bbox.width() as usize;
        let height = bbox.height() as usize;
        let n = colorspace.n() + usize::from(alpha);
        if width.checked_mul(height)?.checked_mul(n)? != samples.len() {
            return None;
        }
        Some(Self {
            x: bbox.x0,
            y: bbox.y0,
            width,
            height,
            colorspace,
            alpha,
            samples,
        })
    }

    /// Set every sample, alpha included, to zero (fully transparent).
    pub fn clear(&mut self) {
        self.samples.fill(0);
    }

    /// Set colour samples to `value` and alpha to opaque.
    pub fn clear_with_value(&mut self, value: u8) {
        if !self.alpha {
            self.samples.fill(value);
            return;
        }
        let n = self.n();
        for px in self.samples.chunks_exact_mut(n) {
            let (color, alpha) = px.split_at_mut(n - 1);
            color.fill(value);
            alpha[0] = 255;
        }
    }

    /// Map colour samples through `255 * (s / 255) ^ gamma`, truncated.
    pub fn gamma(&mut self, gamma: f32) {
        let mut table = [0u8; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = ((i as f32 / 255.0).powf(gamma) * 255.0) as u8;
        }
        let n = self.n();
        let colors = self.colorspace.n();
        for px in self.samples.chunks_exact_mut(n) {
            for s in &mut px[..colors] {
                *s = table[*s as usize];
            }
        }
    }

    /// Undo alpha premultiplication. No-op without alpha.
    pub fn unmultiply(&mut self) {
        if !self.alpha {
            return;
        }
        let n = self.n();
        for px in self.samples.chunks_exact_mut(n) {
            let a = px[n - 1] as u32;
            let inva = if a == 0 { 0 } else { 255 * 256 / a };
            for s in &mut px[..n - 1] {
                *s = ((*s as u32 * inva) >> 8).min(255) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixmap(cs: Colorspace, w: i32, h: i32, alpha: bool) -> Pixmap {
        Pixmap::new_with_rect(&AllocContext::system(), cs, IRect::new(0, 0, w, h), alpha).unwrap()
    }

    #[test]
    fn sample_length_matches_dimensions() {
        let p = pixmap(Colorspace::Rgb, 5, 3, true);
        assert_eq!(p.samples().len(), 5 * 3 * 4);
        assert_eq!(p.stride(), 20);
        let p = pixmap(Colorspace::Gray, 7, 2, false);
        assert_eq!(p.samples().len(), 14);
    }

    #[test]
    fn origin_is_kept() {
        let p = Pixmap::new_with_rect(
            &AllocContext::system(),
            Colorspace::Gray,
            IRect::new(-10, 4, -2, 6),
            true,
        )
        .unwrap();
        assert_eq!(p.bbox(), IRect::new(-10, 4, -2, 6));
        assert_eq!((p.width(), p.height()), (8, 2));
    }

    #[test]
    fn empty_box_has_no_samples() {
        let p = pixmap(Colorspace::Rgb, 0, 10, true);
        assert!(!p.has_samples());
    }

    #[test]
    fn clear_with_value_keeps_alpha_opaque() {
        let mut p = pixmap(Colorspace::Rgb, 2, 1, true);
        p.clear_with_value(255);
        assert_eq!(p.samples(), &[255; 8]);
        p.clear_with_value(10);
        assert_eq!(p.samples(), &[10, 10, 10, 255, 10, 10, 10, 255]);
        p.clear();
        assert_eq!(p.samples(), &[0; 8]);
    }

    #[test]
    fn gamma_truncates_and_skips_alpha() {
        let mut p = pixmap(Colorspace::Gray, 3, 1, true);
        p.samples_mut().copy_from_slice(&[0, 100, 128, 100, 255, 100]);
        p.gamma(2.0);
        // (128/255)^2 * 255 = 64.25
        assert_eq!(p.samples(), &[0, 100, 64, 100, 255, 100]);
    }

    #[test]
    fn unmultiply_restores_colour() {
        let mut p = pixmap(Colorspace::Rgb, 3, 1, true);
        p.samples_mut()
            .copy_from_slice(&[64, 32, 0, 128, 10, 10, 10, 0, 200, 100, 50, 255]);
        p.unmultiply();
        // inva(128) = 510: 64*510>>8 = 127, 32*510>>8 = 63.
        assert_eq!(
            p.samples(),
            &[127, 63, 0, 128, 0, 0, 0, 0, 200, 100, 50, 255]
        );
    }

    #[test]
    fn samples_round_trip_through_block() {
        let mut p = pixmap(Colorspace::Rgb, 2, 2, false);
        p.clear_with_value(7);
        let bbox = p.bbox();
        let block = p.into_samples();
        let back = Pixmap::from_samples(bbox, Colorspace::Rgb, false, block).unwrap();
        assert_eq!(back.samples(), &[7; 12]);
        assert!(Pixmap::from_samples(bbox, Colorspace::Rgb, true, Block::empty()).is_none());
    }
}
