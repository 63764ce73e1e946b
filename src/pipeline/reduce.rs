//! Black/white reduction with Floyd–Steinberg error diffusion.
//!
//! ## Steps
//!
//! 1. Collapse each pixel to one gray byte in a scratch buffer by OR-ing its
//!    colour channels (at most three; alpha is never included). This is a
//!    bitwise combination, not a luminance formula, and it must stay that way
//!    for output compatibility.
//! 2. Scan the scratch buffer row-major. Each sample below 128 becomes ink,
//!    anything else becomes background.
//! 3. With dithering on, the quantisation error of every interior pixel is
//!    pushed forward into its unvisited neighbours:
//!
//! ```text
//!              x     x+1
//!   y          *    7/16
//!   y+1  3/16 5/16  1/16
//! ```
//!
//! Pixels on any edge of the image neither receive nor send error through a
//! missing neighbour: the whole diffusion step is skipped for them.
//!
//! Output comes in two layouts:
//!
//! | Layout | Size | Ink | Background |
//! |--------|------|-----|------------|
//! | bytes  | `w * h` | `0` | `255` |
//! | packed | `ceil(w / 8) * h` | bit `1` | bit `0` |
//!
//! Packed rows are MSB-first (bit 7 is the leftmost pixel) and zero-padded.
//! The scratch buffer is allocated before any output byte is touched, so a
//! failed reduction leaves the output untouched.

use pagepix_alloc::{AllocContext, Block};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::ReduceError;
use crate::pixmap::PixelView;

/// Samples below this value become ink.
pub const THRESHOLD: u8 = 128;

const WEIGHT_RIGHT: f32 = 0.4375; // 7/16
const WEIGHT_BELOW_LEFT: f32 = 0.1875; // 3/16
const WEIGHT_BELOW: f32 = 0.3125; // 5/16
const WEIGHT_BELOW_RIGHT: f32 = 0.0625; // 1/16

/// Bytes per packed row.
pub fn packed_stride(width: usize) -> usize {
    width.div_ceil(8)
}

/// Size of the packed output for a `width` x `height` image.
pub fn packed_len(width: usize, height: usize) -> usize {
    packed_stride(width) * height
}

/// One-bit image with packed rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    pub width: usize,
    pub height: usize,
    /// Bytes per row.
    pub stride: usize,
    pub data: Vec<u8>,
}

impl Bitmap {
    /// True when the pixel at (`x`, `y`) is ink.
    pub fn is_ink(&self, x: usize, y: usize) -> bool {
        let byte = self.data[y * self.stride + x / 8];
        byte & (0x80 >> (x % 8)) != 0
    }
}

/// Build the gray scratch buffer for `src`. Non-throwing: allocation failure
/// is reported as [`ReduceError::ScratchAllocation`].
pub fn gray_scratch(ctx: &AllocContext, src: &PixelView<'_>) -> Result<Block, ReduceError> {
    let size = src.pixel_count();
    let mut scratch = ctx.try_allocate(size).ok_or_else(|| {
        warn!(bytes = size, "gray scratch allocation failed");
        ReduceError::ScratchAllocation { bytes: size }
    })?;
    let colors = src.color_channels().min(3);
    for (dst, px) in scratch
        .iter_mut()
        .zip(src.samples.chunks_exact(src.channels))
    {
        *dst = px[..colors].iter().fold(0, |acc, c| acc | c);
    }
    Ok(scratch)
}

/// Threshold (and optionally diffuse) `scratch` in place, calling `emit`
/// with `(x, y, ink)` for every pixel in scan order.
pub fn diffuse(
    scratch: &mut [u8],
    width: usize,
    height: usize,
    dither: bool,
    mut emit: impl FnMut(usize, usize, bool),
) {
    for y in 0..height {
        let row = y * width;
        for x in 0..width {
            let value = scratch[row + x] as f32;
            let ink = value < THRESHOLD as f32;
            emit(x, y, ink);

            if !dither || x == 0 || y == 0 || x == width - 1 || y == height - 1 {
                continue;
            }
            let qerror = if ink { value } else { value - 255.0 };
            let below = row + width;
            spread(&mut scratch[row + x + 1], WEIGHT_RIGHT, qerror);
            spread(&mut scratch[below + x - 1], WEIGHT_BELOW_LEFT, qerror);
            spread(&mut scratch[below + x], WEIGHT_BELOW, qerror);
            spread(&mut scratch[below + x + 1], WEIGHT_BELOW_RIGHT, qerror);
        }
    }
}

#[inline]
fn spread(sample: &mut u8, weight: f32, qerror: f32) {
    *sample = (*sample as f32 + weight * qerror).round().clamp(0.0, 255.0) as u8;
}

/// Reduce `src` to one byte per pixel (ink `0`, background `255`).
///
/// `out` must hold at least `width * height` bytes.
pub fn reduce_to_bytes(
    ctx: &AllocContext,
    src: &PixelView<'_>,
    dither: bool,
    out: &mut [u8],
) -> Result<(), ReduceError> {
    let (w, h) = (src.width, src.height);
    debug_assert!(out.len() >= w * h, "byte output too small");
    let mut scratch = gray_scratch(ctx, src)?;
    diffuse(&mut scratch, w, h, dither, |x, y, ink| {
        out[y * w + x] = if ink { 0 } else { 255 };
    });
    trace!(w, h, dither, "reduced to bytes");
    Ok(())
}

/// Reduce `src` to packed 1-bit rows.
///
/// `out` must hold at least [`packed_len`]`(width, height)` bytes.
pub fn reduce_to_packed(
    ctx: &AllocContext,
    src: &PixelView<'_>,
    dither: bool,
    out: &mut [u8],
) -> Result<(), ReduceError> {
    let (w, h) = (src.width, src.height);
    let stride = packed_stride(w);
    debug_assert!(out.len() >= stride * h, "packed output too small");
    let mut scratch = gray_scratch(ctx, src)?;

    let mut acc = 0u8;
    let mut bit = 7u32;
    let mut pos = 0usize;
    diffuse(&mut scratch, w, h, dither, |x, _y, ink| {
        if ink {
            acc |= 1 << bit;
        }
        if bit == 0 || x == w - 1 {
            out[pos] = acc;
            pos += 1;
            acc = 0;
            bit = 7;
        } else {
            bit -= 1;
        }
    });
    trace!(w, h, dither, stride, "reduced to packed bits");
    Ok(())
}

/// Reduce `src` into a freshly allocated [`Bitmap`].
pub fn to_bitmap(ctx: &AllocContext, src: &PixelView<'_>, dither: bool) -> Result<Bitmap, ReduceError> {
    let stride = packed_stride(src.width);
    let mut data = vec![0u8; stride * src.height];
    reduce_to_packed(ctx, src, dither, &mut data)?;
    Ok(Bitmap {
        width: src.width,
        height: src.height,
        stride,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagepix_alloc::{BudgetAllocator, NoScavenge};
    use std::sync::Arc;

    fn gray(samples: &[u8], w: usize, h: usize) -> PixelView<'_> {
        PixelView::opaque(samples, w, h, 1)
    }

    #[test]
    fn two_by_two_rgb_without_dither() {
        let ctx = AllocContext::system();
        let rgb = [0, 0, 0, 255, 255, 255, 0, 0, 0, 255, 255, 255];
        let src = PixelView::opaque(&rgb, 2, 2, 3);

        let mut bytes = [9u8; 4];
        reduce_to_bytes(&ctx, &src, false, &mut bytes).unwrap();
        assert_eq!(bytes, [0, 255, 0, 255]);

        let mut packed = [9u8; 2];
        reduce_to_packed(&ctx, &src, false, &mut packed).unwrap();
        assert_eq!(packed, [0x80, 0x80]);
    }

    #[test]
    fn alternating_row_packs_msb_first() {
        let ctx = AllocContext::system();
        let row = [0, 255, 0, 255, 0, 255, 0, 255];
        let mut packed = [0u8; 1];
        reduce_to_packed(&ctx, &gray(&row, 8, 1), true, &mut packed).unwrap();
        assert_eq!(packed[0], 0b1010_1010);
    }

    #[test]
    fn rows_are_padded_independently() {
        let ctx = AllocContext::system();
        // 10 wide: 2 bytes per row, second byte holds 2 pixels.
        let mut img = vec![255u8; 20];
        img[9] = 0; // last pixel of row 0
        img[10] = 0; // first pixel of row 1
        let mut packed = [0xFFu8; 4];
        reduce_to_packed(&ctx, &gray(&img, 10, 2), false, &mut packed).unwrap();
        assert_eq!(packed, [0x00, 0x40, 0x80, 0x00]);
        assert_eq!(packed_len(10, 2), 4);
    }

    #[test]
    fn border_pixels_skip_diffusion() {
        let mut scratch = vec![127u8; 9];
        let mut ink = Vec::new();
        diffuse(&mut scratch, 3, 3, true, |_, _, i| ink.push(i));
        // Only (1,1) diffused; its four forward neighbours changed.
        assert_eq!(scratch, [127, 127, 127, 127, 127, 183, 151, 167, 135]);
        assert_eq!(
            ink,
            [true, true, true, true, true, false, false, false, false]
        );
    }

    #[test]
    fn border_case_outputs() {
        let ctx = AllocContext::system();
        let img = [127u8; 9];
        let mut bytes = [0u8; 9];
        reduce_to_bytes(&ctx, &gray(&img, 3, 3), true, &mut bytes).unwrap();
        assert_eq!(bytes, [0, 0, 0, 0, 0, 255, 255, 255, 255]);
        let mut packed = [0u8; 3];
        reduce_to_packed(&ctx, &gray(&img, 3, 3), true, &mut packed).unwrap();
        assert_eq!(packed, [0xE0, 0xC0, 0x00]);
    }

    #[test]
    fn dithering_is_deterministic() {
        let ctx = AllocContext::system();
        let img: Vec<u8> = (0..64 * 48).map(|i| ((i * 37) % 256) as u8).collect();
        let src = gray(&img, 64, 48);
        let a = to_bitmap(&ctx, &src, true).unwrap();
        let b = to_bitmap(&ctx, &src, true).unwrap();
        assert_eq!(a, b);
        let mut x = vec![0u8; 64 * 48];
        let mut y = vec![1u8; 64 * 48];
        reduce_to_bytes(&ctx, &src, true, &mut x).unwrap();
        reduce_to_bytes(&ctx, &src, true, &mut y).unwrap();
        assert_eq!(x, y);
        // Both layouts agree pixel for pixel.
        for (i, v) in x.iter().enumerate() {
            assert_eq!(a.is_ink(i % 64, i / 64), *v == 0);
        }
    }

    #[test]
    fn gray_is_bitwise_or_of_colour_channels() {
        let ctx = AllocContext::system();
        let rgba = [0x01, 0x02, 0x40, 0xFF, 0x10, 0x00, 0x00, 0x00];
        let src = PixelView {
            samples: &rgba,
            width: 2,
            height: 1,
            channels: 4,
            alpha: true,
        };
        let scratch = gray_scratch(&ctx, &src).unwrap();
        assert_eq!(&scratch[..], &[0x43, 0x10]);

        // Gray with alpha: only channel 0.
        let ga = [0x20, 0xFF];
        let src = PixelView {
            samples: &ga,
            width: 1,
            height: 1,
            channels: 2,
            alpha: true,
        };
        assert_eq!(&gray_scratch(&ctx, &src).unwrap()[..], &[0x20]);
    }

    #[test]
    fn scratch_failure_leaves_output_untouched() {
        let ctx = AllocContext::new(Arc::new(BudgetAllocator::new(4)), Box::new(NoScavenge));
        let img = [0u8; 9];
        let mut out = [7u8; 9];
        let err = reduce_to_bytes(&ctx, &gray(&img, 3, 3), true, &mut out).unwrap_err();
        assert_eq!(err, ReduceError::ScratchAllocation { bytes: 9 });
        assert_eq!(out, [7; 9]);
        let mut packed = [7u8; 3];
        assert!(reduce_to_packed(&ctx, &gray(&img, 3, 3), false, &mut packed).is_err());
        assert_eq!(packed, [7; 3]);
    }

    #[test]
    fn output_sizes() {
        assert_eq!(packed_len(1, 1), 1);
        assert_eq!(packed_len(8, 3), 3);
        assert_eq!(packed_len(9, 3), 6);
        assert_eq!(packed_len(0, 5), 0);
    }
}
