//! Copy a rendered pixmap into caller-facing layouts.
//!
//! Colour modes pack one `u32` per pixel as `0xAARRGGBB`; the black/white
//! modes go through [`super::reduce`] and yield one byte per pixel.
//!
//! | Mode | [`PixelArray`] | direct buffer |
//! |------|----------------|---------------|
//! | `Argb` | `a r g b` | `a r g b` |
//! | `Rgb`  | `a r g b` | `0 r g b` |
//! | `Gray` | `a v v v` | `0 v v v` |
//! | `BlackWhite*` | bytes | bytes |

use pagepix_alloc::{AllocContext, Block};
use serde::{Deserialize, Serialize};

use crate::config::ColorMode;
use crate::error::ExportError;
use crate::pipeline::reduce;
use crate::pixmap::{Colorspace, Pixmap};

/// Packed pixels returned by [`crate::Session::pixel_array`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelArray {
    /// `0xAARRGGBB` per pixel.
    Argb(Vec<u32>),
    /// One byte per pixel, `0` ink and `255` background.
    Bytes(Vec<u8>),
}

impl PixelArray {
    pub fn len(&self) -> usize {
        match self {
            PixelArray::Argb(v) => v.len(),
            PixelArray::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[inline]
fn argb(a: u8, r: u8, g: u8, b: u8) -> u32 {
    (a as u32) << 24 | (r as u32) << 16 | (g as u32) << 8 | b as u32
}

/// One pixel of `pix` as `0xAARRGGBB`. Pixmaps without alpha report opaque.
fn packed_pixel(pix: &Pixmap, px: &[u8], keep_alpha: bool) -> u32 {
    let a = if !keep_alpha {
        0
    } else if pix.has_alpha() {
        px[pix.n() - 1]
    } else {
        255
    };
    match pix.colorspace() {
        Colorspace::Rgb => argb(a, px[0], px[1], px[2]),
        Colorspace::Gray => argb(a, px[0], px[0], px[0]),
    }
}

/// Pack `pix` into a [`PixelArray`] for `color`.
pub fn pixel_array(ctx: &AllocContext, pix: &Pixmap, color: ColorMode) -> Result<PixelArray, ExportError> {
    if color.is_binary() {
        let mut out = vec![0u8; pix.width() * pix.height()];
        reduce::reduce_to_bytes(ctx, &pix.view(), color.dithers(), &mut out)?;
        return Ok(PixelArray::Bytes(out));
    }
    let out = pix
        .samples()
        .chunks_exact(pix.n())
        .map(|px| packed_pixel(pix, px, true))
        .collect();
    Ok(PixelArray::Argb(out))
}

/// Pack `pix` into a context-allocated buffer: native-endian `u32` per
/// pixel for colour modes, one byte per pixel for black/white.
pub fn direct_buffer(ctx: &AllocContext, pix: &Pixmap, color: ColorMode) -> Result<Block, ExportError> {
    let size = pix.width() * pix.height();
    if color.is_binary() {
        let mut block = ctx.allocate(size)?;
        reduce::reduce_to_bytes(ctx, &pix.view(), color.dithers(), &mut block)?;
        return Ok(block);
    }
    let mut block = ctx.allocate_array(size, 4)?;
    let keep_alpha = color == ColorMode::Argb;
    for (dst, px) in block
        .chunks_exact_mut(4)
        .zip(pix.samples().chunks_exact(pix.n()))
    {
        dst.copy_from_slice(&packed_pixel(pix, px, keep_alpha).to_ne_bytes());
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::IRect;

    fn rgba_pixmap(samples: &[u8], w: i32, h: i32) -> Pixmap {
        let mut p = Pixmap::new_with_rect(
            &AllocContext::system(),
            Colorspace::Rgb,
            IRect::new(0, 0, w, h),
            true,
        )
        .unwrap();
        p.samples_mut().copy_from_slice(samples);
        p
    }

    #[test]
    fn rgb_array_keeps_alpha_in_top_byte() {
        let ctx = AllocContext::system();
        let p = rgba_pixmap(&[0x11, 0x22, 0x33, 0x80, 0xFF, 0x00, 0x00, 0xFF], 2, 1);
        let arr = pixel_array(&ctx, &p, ColorMode::Rgb).unwrap();
        assert_eq!(arr, PixelArray::Argb(vec![0x8011_2233, 0xFFFF_0000]));
    }

    #[test]
    fn gray_array_replicates_value() {
        let ctx = AllocContext::system();
        let mut p = Pixmap::new_with_rect(&ctx, Colorspace::Gray, IRect::new(0, 0, 1, 1), true)
            .unwrap();
        p.samples_mut().copy_from_slice(&[0x7F, 0xFF]);
        let arr = pixel_array(&ctx, &p, ColorMode::Gray).unwrap();
        assert_eq!(arr, PixelArray::Argb(vec![0xFF7F_7F7F]));
    }

    #[test]
    fn binary_array_is_bytes() {
        let ctx = AllocContext::system();
        let p = rgba_pixmap(&[0, 0, 0, 255, 255, 255, 255, 255], 2, 1);
        let arr = pixel_array(&ctx, &p, ColorMode::BlackWhite).unwrap();
        assert_eq!(arr, PixelArray::Bytes(vec![0, 255]));
    }

    #[test]
    fn direct_buffer_drops_alpha_for_rgb() {
        let ctx = AllocContext::system();
        let p = rgba_pixmap(&[0x11, 0x22, 0x33, 0x80], 1, 1);

        let rgb = direct_buffer(&ctx, &p, ColorMode::Rgb).unwrap();
        assert_eq!(&rgb[..], &0x0011_2233u32.to_ne_bytes());

        let argb_buf = direct_buffer(&ctx, &p, ColorMode::Argb).unwrap();
        assert_eq!(&argb_buf[..], &0x8011_2233u32.to_ne_bytes());
    }

    #[test]
    fn direct_buffer_binary_is_one_byte_per_pixel() {
        let ctx = AllocContext::system();
        let p = rgba_pixmap(&[0; 16], 2, 2);
        let buf = direct_buffer(&ctx, &p, ColorMode::BlackWhiteDither).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }
}
