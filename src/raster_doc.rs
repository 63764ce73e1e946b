//! Built-in document backend: one raster image per page.
//!
//! Each page box is the image size in points (one pixel per point, 72 dpi).
//! Painting inverse-maps device pixels through the view transform and
//! samples the source image, compositing premultiplied colour over whatever
//! background the pixmap already holds.
//!
//! Anti-aliasing level 0 takes one sample at each pixel centre; any higher
//! level averages a 2x2 grid of samples.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbaImage;
use tracing::{debug, warn};

use crate::document::{DisplayList, Document, DocumentFormat, DrawDevice, Page, PageInfo};
use crate::error::ExportError;
use crate::geometry::{IRect, Matrix, Rect};
use crate::pixmap::Colorspace;

enum Source {
    Path(PathBuf),
    Loaded(Arc<RgbaImage>),
}

/// Document whose pages are image files or in-memory images.
pub struct RasterDocument {
    pages: Vec<Source>,
}

impl RasterDocument {
    /// Document over image files, one page per path. Files are decoded on
    /// first use.
    pub fn open<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> Result<Self, ExportError> {
        let pages: Vec<Source> = paths
            .into_iter()
            .map(|p| Source::Path(p.as_ref().to_path_buf()))
            .collect();
        if pages.is_empty() {
            return Err(ExportError::InvalidConfig("document has no pages".into()));
        }
        Ok(Self { pages })
    }

    /// Document over already decoded images.
    pub fn from_images(images: Vec<RgbaImage>) -> Self {
        Self {
            pages: images
                .into_iter()
                .map(|img| Source::Loaded(Arc::new(img)))
                .collect(),
        }
    }

    fn load(&mut self, index: usize) -> Result<Arc<RgbaImage>, ExportError> {
        let source = &mut self.pages[index];
        let img = match source {
            Source::Loaded(img) => return Ok(Arc::clone(img)),
            Source::Path(path) => {
                let img = image::open(&*path).map_err(|e| {
                    warn!(page = index, path = %path.display(), "failed to decode page image: {e}");
                    ExportError::render(index, format!("cannot decode '{}': {e}", path.display()))
                })?;
                debug!(page = index, path = %path.display(), w = img.width(), h = img.height(), "decoded page image");
                Arc::new(img.to_rgba8())
            }
        };
        *source = Source::Loaded(Arc::clone(&img));
        Ok(img)
    }
}

impl Document for RasterDocument {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Image
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn resolve_page(&mut self, index: usize) -> Result<Page, ExportError> {
        if index >= self.pages.len() {
            return Err(ExportError::PageNotFound {
                page: index,
                total: self.pages.len(),
            });
        }
        let image = self.load(index)?;
        let bounds = Rect::new(0.0, 0.0, image.width() as f32, image.height() as f32);
        Ok(Page {
            info: PageInfo {
                index,
                bounds,
                rotation: 0,
            },
            display_list: Box::new(ImagePainter { image }),
        })
    }
}

/// Paints one image covering the page box.
struct ImagePainter {
    image: Arc<RgbaImage>,
}

impl ImagePainter {
    /// Source pixel under page point (`x`, `y`), if any.
    fn sample(&self, x: f32, y: f32) -> Option<[u8; 4]> {
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let (sx, sy) = (x as u32, y as u32);
        if sx >= self.image.width() || sy >= self.image.height() {
            return None;
        }
        Some(self.image.get_pixel(sx, sy).0)
    }
}

const SUBSAMPLES: [(f32, f32); 4] = [(0.25, 0.25), (0.75, 0.25), (0.25, 0.75), (0.75, 0.75)];

impl DisplayList for ImagePainter {
    fn run(&self, dev: &mut DrawDevice<'_>, ctm: &Matrix, clip: IRect) -> Result<(), ExportError> {
        let inv = ctm
            .invert()
            .ok_or_else(|| ExportError::InvalidConfig("view transform is not invertible".into()))?;
        let smooth = dev.aa_level() > 0;
        let pix = dev.pixmap();
        let area = pix.bbox();
        let x0 = clip.x0.max(area.x0);
        let y0 = clip.y0.max(area.y0);
        let x1 = clip.x1.min(area.x1);
        let y1 = clip.y1.min(area.y1);
        let n = pix.n();
        let stride = pix.stride();
        let gray = pix.colorspace() == Colorspace::Gray;
        let alpha = pix.has_alpha();
        let samples = pix.samples_mut();
        let offsets: &[(f32, f32)] = if smooth { &SUBSAMPLES } else { &[(0.5, 0.5)] };

        for dy in y0..y1 {
            for dx in x0..x1 {
                let mut acc = [0u32; 4];
                for (ox, oy) in offsets {
                    let (px, py) = inv.transform_point(dx as f32 + ox, dy as f32 + oy);
                    if let Some([r, g, b, a]) = self.sample(px, py) {
                        let a32 = a as u32;
                        // Premultiply each sample before averaging.
                        acc[0] += r as u32 * a32 / 255;
                        acc[1] += g as u32 * a32 / 255;
                        acc[2] += b as u32 * a32 / 255;
                        acc[3] += a32;
                    }
                }
                let count = offsets.len() as u32;
                let [r, g, b, a] = acc.map(|v| v / count);
                if a == 0 {
                    continue;
                }
                let at = (dy - area.y0) as usize * stride + (dx - area.x0) as usize * n;
                let px = &mut samples[at..at + n];
                let keep = 255 - a;
                let over = |dst: u8, src: u32| (src + dst as u32 * keep / 255).min(255) as u8;
                if gray {
                    let lum = (r * 77 + g * 150 + b * 29) >> 8;
                    px[0] = over(px[0], lum);
                } else {
                    px[0] = over(px[0], r);
                    px[1] = over(px[1], g);
                    px[2] = over(px[2], b);
                }
                if alpha {
                    px[n - 1] = over(px[n - 1], a);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixmap::Pixmap;
    use image::Rgba;
    use pagepix_alloc::AllocContext;

    fn two_tone() -> RgbaImage {
        // Left column black, right column white.
        RgbaImage::from_fn(2, 2, |x, _| {
            if x == 0 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        })
    }

    #[test]
    fn pages_report_image_bounds() {
        let mut doc = RasterDocument::from_images(vec![two_tone(), RgbaImage::new(5, 7)]);
        assert_eq!(doc.page_count(), 2);
        assert_eq!(doc.format(), DocumentFormat::Image);
        let page = doc.resolve_page(1).unwrap();
        assert_eq!(page.info.bounds, Rect::new(0.0, 0.0, 5.0, 7.0));
        assert!(matches!(
            doc.resolve_page(2),
            Err(ExportError::PageNotFound { page: 2, total: 2 })
        ));
    }

    #[test]
    fn paints_scaled_nearest_samples() {
        let mut doc = RasterDocument::from_images(vec![two_tone()]);
        let page = doc.resolve_page(0).unwrap();
        let ctm = Matrix::view(2.0, 0);
        let bbox = IRect::new(0, 0, 4, 4);
        let mut pix = Pixmap::new_with_rect(&AllocContext::system(), Colorspace::Rgb, bbox, true).unwrap();
        pix.clear_with_value(128);
        {
            let mut dev = DrawDevice::new(&mut pix, 0);
            page.display_list.run(&mut dev, &ctm, bbox).unwrap();
        }
        let s = pix.samples();
        // Row 0: two black pixels then two white.
        assert_eq!(&s[0..4], &[0, 0, 0, 255]);
        assert_eq!(&s[4..8], &[0, 0, 0, 255]);
        assert_eq!(&s[8..12], &[255, 255, 255, 255]);
        assert_eq!(&s[12..16], &[255, 255, 255, 255]);
    }

    #[test]
    fn transparent_source_keeps_background() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([10, 20, 30, 0]));
        let mut doc = RasterDocument::from_images(vec![img]);
        let page = doc.resolve_page(0).unwrap();
        let bbox = IRect::new(0, 0, 1, 1);
        let mut pix = Pixmap::new_with_rect(&AllocContext::system(), Colorspace::Gray, bbox, true).unwrap();
        pix.clear_with_value(255);
        {
            let mut dev = DrawDevice::new(&mut pix, 8);
            page.display_list.run(&mut dev, &Matrix::IDENTITY, bbox).unwrap();
        }
        assert_eq!(pix.samples(), &[255, 255]);
    }

    #[test]
    fn missing_file_is_a_render_error() {
        let mut doc = RasterDocument::open(["/definitely/not/here.png"]).unwrap();
        let err = doc.resolve_page(0).unwrap_err();
        assert_eq!(err.status_code(), -2);
    }

    #[test]
    fn empty_path_list_is_rejected() {
        let none: Vec<PathBuf> = Vec::new();
        assert!(RasterDocument::open(none).is_err());
    }
}
