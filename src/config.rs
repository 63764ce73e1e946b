//! Configuration types for page export.
//!
//! Per-call behaviour is controlled through [`ExportOptions`], built via its
//! [`ExportOptionsBuilder`]. Session-wide knobs (anti-aliasing, store size,
//! render cache) live in [`SessionConfig`], which can also be read from the
//! environment. Each encoder takes its own small parameter struct.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::geometry::{Rect, Rotation};

/// Largest accepted zoom factor.
pub const MAX_ZOOM: f32 = 64.0;

/// Default anti-alias level (full quality).
pub const DEFAULT_AA_LEVEL: u8 = 8;

/// Default ceiling of the reclaimable store: 60 MiB.
pub const DEFAULT_MAX_STORE: usize = 60 << 20;

/// Options for rendering one page.
///
/// Built via [`ExportOptions::builder()`] or using
/// [`ExportOptions::default()`].
///
/// # Example
/// ```rust
/// use pagepix::{ColorMode, ExportOptions};
///
/// let opts = ExportOptions::builder()
///     .zoom(2.0)
///     .rotate(90)
///     .color(ColorMode::BlackWhiteDither)
///     .build()
///     .unwrap();
/// assert_eq!(opts.zoom, 2.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Scale factor; 1.0 renders one pixel per point (72 dpi). Default: 1.0.
    pub zoom: f32,

    /// Page rotation. Default: [`Rotation::Page`], the page's own rotation.
    pub rotation: Rotation,

    /// Output colour mode. Default: [`ColorMode::Rgb`].
    pub color: ColorMode,

    /// Gamma exponent applied after rendering. Only values other than 1 and
    /// greater than 0 have an effect. Default: 1.0.
    pub gamma: f32,

    /// Page-space crop rectangle. All zeros means the full page; anything
    /// else is clamped to the page bounds. Default: all zeros.
    pub crop: Rect,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            rotation: Rotation::Page,
            color: ColorMode::Rgb,
            gamma: 1.0,
            crop: Rect::EMPTY,
        }
    }
}

impl ExportOptions {
    /// Create a new builder for `ExportOptions`.
    pub fn builder() -> ExportOptionsBuilder {
        ExportOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Options used by the file writers: page rotation, full page.
    pub fn for_write(zoom: f32, color: ColorMode, gamma: f32) -> Result<Self, ExportError> {
        Self::builder().zoom(zoom).color(color).gamma(gamma).build()
    }

    /// True when gamma correction changes the samples.
    pub fn applies_gamma(&self) -> bool {
        self.gamma > 0.0 && self.gamma != 1.0
    }
}

/// Builder for [`ExportOptions`].
#[derive(Debug)]
pub struct ExportOptionsBuilder {
    options: ExportOptions,
}

impl ExportOptionsBuilder {
    pub fn zoom(mut self, zoom: f32) -> Self {
        self.options.zoom = if zoom > MAX_ZOOM { MAX_ZOOM } else { zoom };
        self
    }

    /// Explicit rotation in degrees.
    pub fn rotate(mut self, degrees: i32) -> Self {
        self.options.rotation = Rotation::Degrees(degrees);
        self
    }

    pub fn rotation(mut self, rotation: Rotation) -> Self {
        self.options.rotation = rotation;
        self
    }

    pub fn color(mut self, color: ColorMode) -> Self {
        self.options.color = color;
        self
    }

    pub fn gamma(mut self, gamma: f32) -> Self {
        self.options.gamma = gamma;
        self
    }

    pub fn crop(mut self, crop: Rect) -> Self {
        self.options.crop = crop;
        self
    }

    /// Build the options, validating constraints.
    pub fn build(self) -> Result<ExportOptions, ExportError> {
        let o = &self.options;
        if !(o.zoom.is_finite() && o.zoom > 0.0) {
            return Err(ExportError::InvalidConfig(format!(
                "zoom must be a positive number, got {}",
                o.zoom
            )));
        }
        if !o.gamma.is_finite() {
            return Err(ExportError::InvalidConfig(format!(
                "gamma must be finite, got {}",
                o.gamma
            )));
        }
        if !o.crop.is_zero() && (o.crop.x0 > o.crop.x1 || o.crop.y0 > o.crop.y1) {
            return Err(ExportError::InvalidConfig(format!(
                "crop rectangle is inverted: {}",
                o.crop
            )));
        }
        Ok(self.options)
    }
}

// ── Session configuration ────────────────────────────────────────────────

/// Session-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Rasteriser anti-alias level, 0..=8. Default: 8.
    pub aa_level: u8,

    /// Ceiling of the reclaimable store in bytes. Default: 60 MiB.
    pub max_store: usize,

    /// Keep rendered pages in the store for reuse. Default: true.
    pub render_cache: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            aa_level: DEFAULT_AA_LEVEL,
            max_store: DEFAULT_MAX_STORE,
            render_cache: true,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `PAGEPIX_AA_LEVEL`, `PAGEPIX_MAX_STORE` and
    /// `PAGEPIX_RENDER_CACHE`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("PAGEPIX_AA_LEVEL") {
            if let Ok(v) = s.trim().parse::<i64>() {
                cfg.aa_level = clamp_aa_level(v);
            }
        }

        if let Ok(s) = std::env::var("PAGEPIX_MAX_STORE") {
            if let Ok(v) = s.trim().parse::<usize>() {
                cfg.max_store = v;
            }
        }

        if let Ok(s) = std::env::var("PAGEPIX_RENDER_CACHE") {
            match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => cfg.render_cache = true,
                "0" | "false" | "off" | "no" => cfg.render_cache = false,
                _ => {}
            }
        }

        cfg
    }
}

/// Clamp an anti-alias level into 0..=8.
pub fn clamp_aa_level(level: i64) -> u8 {
    level.clamp(0, 8) as u8
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Output colour mode.
///
/// | Mode | Render colourspace | Output |
/// |------|--------------------|--------|
/// | `Rgb` | RGB | colour, alpha dropped |
/// | `Argb` | RGB, transparent background | colour with alpha |
/// | `Gray` | gray | gray |
/// | `BlackWhite` | gray | 1-bit, thresholded |
/// | `BlackWhiteDither` | gray | 1-bit, error-diffused |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorMode {
    #[default]
    Rgb,
    Argb,
    Gray,
    #[serde(rename = "bw")]
    BlackWhite,
    #[serde(rename = "bw-dither")]
    BlackWhiteDither,
}

impl ColorMode {
    pub const ALL: [ColorMode; 5] = [
        ColorMode::Rgb,
        ColorMode::Argb,
        ColorMode::Gray,
        ColorMode::BlackWhite,
        ColorMode::BlackWhiteDither,
    ];

    /// True for the two 1-bit modes.
    pub fn is_binary(self) -> bool {
        matches!(self, ColorMode::BlackWhite | ColorMode::BlackWhiteDither)
    }

    /// True when rendering happens in RGB rather than gray.
    pub fn is_rgb(self) -> bool {
        matches!(self, ColorMode::Rgb | ColorMode::Argb)
    }

    pub fn dithers(self) -> bool {
        self == ColorMode::BlackWhiteDither
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColorMode::Rgb => "rgb",
            ColorMode::Argb => "argb",
            ColorMode::Gray => "gray",
            ColorMode::BlackWhite => "bw",
            ColorMode::BlackWhiteDither => "bw-dither",
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColorMode {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rgb" => Ok(ColorMode::Rgb),
            "argb" | "rgba" => Ok(ColorMode::Argb),
            "gray" | "grey" => Ok(ColorMode::Gray),
            "bw" | "binary" => Ok(ColorMode::BlackWhite),
            "bw-dither" | "binary-dither" => Ok(ColorMode::BlackWhiteDither),
            other => Err(ExportError::InvalidConfig(format!(
                "unknown colour mode '{other}' (expected rgb, argb, gray, bw, bw-dither)"
            ))),
        }
    }
}

/// Image file formats the session can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Tiff,
    Pnm,
    Pam,
    Pbm,
    Bmp,
}

impl ImageFormat {
    /// Colour modes the format can be written with.
    pub fn accepts(self, color: ColorMode) -> bool {
        use ColorMode::*;
        match self {
            ImageFormat::Png | ImageFormat::Pam => matches!(color, Rgb | Argb | Gray),
            ImageFormat::Jpeg | ImageFormat::Pnm => matches!(color, Rgb | Gray),
            ImageFormat::Bmp => matches!(color, Rgb | Gray | BlackWhite | BlackWhiteDither),
            ImageFormat::Tiff | ImageFormat::Pbm => true,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Tiff => "tif",
            ImageFormat::Pnm => "pnm",
            ImageFormat::Pam => "pam",
            ImageFormat::Pbm => "pbm",
            ImageFormat::Bmp => "bmp",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Png => "PNG",
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Tiff => "TIFF",
            ImageFormat::Pnm => "PNM",
            ImageFormat::Pam => "PAM",
            ImageFormat::Pbm => "PBM",
            ImageFormat::Bmp => "BMP",
        };
        f.write_str(name)
    }
}

impl FromStr for ImageFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            "tif" | "tiff" => Ok(ImageFormat::Tiff),
            "pnm" | "ppm" | "pgm" => Ok(ImageFormat::Pnm),
            "pam" => Ok(ImageFormat::Pam),
            "pbm" => Ok(ImageFormat::Pbm),
            "bmp" => Ok(ImageFormat::Bmp),
            other => Err(ExportError::InvalidConfig(format!(
                "unknown image format '{other}'"
            ))),
        }
    }
}

/// TIFF compression scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TiffCompression {
    #[default]
    None,
    CcittRle,
    CcittT4,
    CcittT6,
    Lzw,
    Jpeg,
    Zlib,
    Packbits,
    Deflate,
}

impl TiffCompression {
    pub fn is_ccitt(self) -> bool {
        matches!(
            self,
            TiffCompression::CcittRle | TiffCompression::CcittT4 | TiffCompression::CcittT6
        )
    }
}

/// What to do with an existing TIFF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TiffMode {
    /// Add the page after the pages already in the file.
    Append,
    /// Replace the file.
    #[default]
    Discard,
}

// ── Encoder parameters ───────────────────────────────────────────────────

/// PNG writer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PngParams {}

/// JPEG writer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JpegParams {
    /// 0..=100; anything else falls back to 75.
    pub quality: i32,
}

impl Default for JpegParams {
    fn default() -> Self {
        Self { quality: 75 }
    }
}

impl JpegParams {
    pub fn effective_quality(&self) -> u8 {
        if (0..=100).contains(&self.quality) {
            self.quality as u8
        } else {
            75
        }
    }
}

/// TIFF writer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TiffParams {
    pub compression: TiffCompression,
    pub mode: TiffMode,
    /// Zlib/Deflate level 1..=9 (else 6) or JPEG quality 1..=100 (else 75).
    pub quality: i32,
}

impl TiffParams {
    /// Quality after falling back to the compression's default.
    pub fn effective_quality(&self) -> i32 {
        match self.compression {
            TiffCompression::Zlib | TiffCompression::Deflate if !(1..=9).contains(&self.quality) => 6,
            TiffCompression::Jpeg if !(1..=100).contains(&self.quality) => 75,
            _ => self.quality,
        }
    }

    /// Check the parameters against the colour mode.
    pub fn validate(&self, color: ColorMode) -> Result<(), ExportError> {
        if self.compression.is_ccitt() && !color.is_binary() {
            return Err(ExportError::InvalidConfig(format!(
                "CCITT compression requires a black/white colour mode, got {color}"
            )));
        }
        Ok(())
    }
}

/// BMP writer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BmpParams {}

/// PNM writer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PnmParams {}

/// PAM writer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PamParams {}

/// PBM writer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbmParams {
    /// Diffuse the threshold error. Default: true.
    pub dither: bool,
}

impl Default for PbmParams {
    fn default() -> Self {
        Self { dither: true }
    }
}

/// Encoder parameters tagged with their format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum FormatParams {
    Png(PngParams),
    Jpeg(JpegParams),
    Tiff(TiffParams),
    Pnm(PnmParams),
    Pam(PamParams),
    Pbm(PbmParams),
    Bmp(BmpParams),
}

impl FormatParams {
    pub fn format(&self) -> ImageFormat {
        match self {
            FormatParams::Png(_) => ImageFormat::Png,
            FormatParams::Jpeg(_) => ImageFormat::Jpeg,
            FormatParams::Tiff(_) => ImageFormat::Tiff,
            FormatParams::Pnm(_) => ImageFormat::Pnm,
            FormatParams::Pam(_) => ImageFormat::Pam,
            FormatParams::Pbm(_) => ImageFormat::Pbm,
            FormatParams::Bmp(_) => ImageFormat::Bmp,
        }
    }

    /// Default parameters for `format`.
    pub fn defaults(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Png => FormatParams::Png(PngParams::default()),
            ImageFormat::Jpeg => FormatParams::Jpeg(JpegParams::default()),
            ImageFormat::Tiff => FormatParams::Tiff(TiffParams::default()),
            ImageFormat::Pnm => FormatParams::Pnm(PnmParams::default()),
            ImageFormat::Pam => FormatParams::Pam(PamParams::default()),
            ImageFormat::Pbm => FormatParams::Pbm(PbmParams::default()),
            ImageFormat::Bmp => FormatParams::Bmp(BmpParams::default()),
        }
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Specifies which pages of a document to export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Every page (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let o = ExportOptions::builder().build().unwrap();
        assert_eq!(o, ExportOptions::default());
        assert!(!o.applies_gamma());
    }

    #[test]
    fn builder_rejects_bad_zoom() {
        assert!(ExportOptions::builder().zoom(0.0).build().is_err());
        assert!(ExportOptions::builder().zoom(-1.0).build().is_err());
        assert!(ExportOptions::builder().zoom(f32::NAN).build().is_err());
        assert_eq!(ExportOptions::builder().zoom(1000.0).build().unwrap().zoom, MAX_ZOOM);
    }

    #[test]
    fn builder_rejects_inverted_crop() {
        let err = ExportOptions::builder()
            .crop(Rect::new(10.0, 0.0, 5.0, 5.0))
            .build()
            .unwrap_err();
        assert!(matches!(err, ExportError::InvalidConfig(_)));
    }

    #[test]
    fn gamma_applies_only_when_positive_and_not_one() {
        let g = |v| ExportOptions::builder().gamma(v).build().unwrap().applies_gamma();
        assert!(!g(1.0));
        assert!(!g(0.0));
        assert!(!g(-2.0));
        assert!(g(2.2));
        assert!(g(0.5));
    }

    #[test]
    fn format_color_matrix() {
        use ColorMode::*;
        assert!(ImageFormat::Png.accepts(Argb));
        assert!(!ImageFormat::Png.accepts(BlackWhite));
        assert!(!ImageFormat::Jpeg.accepts(Argb));
        assert!(!ImageFormat::Pnm.accepts(BlackWhiteDither));
        assert!(ImageFormat::Bmp.accepts(BlackWhiteDither));
        assert!(!ImageFormat::Bmp.accepts(Argb));
        assert!(ColorMode::ALL.iter().all(|c| ImageFormat::Tiff.accepts(*c)));
    }

    #[test]
    fn jpeg_quality_fallback() {
        assert_eq!(JpegParams { quality: 90 }.effective_quality(), 90);
        assert_eq!(JpegParams { quality: 0 }.effective_quality(), 0);
        assert_eq!(JpegParams { quality: 101 }.effective_quality(), 75);
        assert_eq!(JpegParams { quality: -5 }.effective_quality(), 75);
    }

    #[test]
    fn tiff_quality_fallback() {
        let p = |compression, quality| TiffParams {
            compression,
            mode: TiffMode::Discard,
            quality,
        };
        assert_eq!(p(TiffCompression::Zlib, 0).effective_quality(), 6);
        assert_eq!(p(TiffCompression::Zlib, 9).effective_quality(), 9);
        assert_eq!(p(TiffCompression::Deflate, 12).effective_quality(), 6);
        assert_eq!(p(TiffCompression::Jpeg, 0).effective_quality(), 75);
        assert_eq!(p(TiffCompression::Jpeg, 100).effective_quality(), 100);
        assert_eq!(p(TiffCompression::Lzw, 0).effective_quality(), 0);
    }

    #[test]
    fn ccitt_requires_binary() {
        let p = TiffParams {
            compression: TiffCompression::CcittT6,
            ..TiffParams::default()
        };
        assert!(p.validate(ColorMode::Rgb).is_err());
        assert!(p.validate(ColorMode::Argb).is_err());
        assert!(p.validate(ColorMode::BlackWhite).is_ok());
    }

    #[test]
    fn color_mode_round_trips_through_str() {
        for c in ColorMode::ALL {
            assert_eq!(c.as_str().parse::<ColorMode>().unwrap(), c);
        }
        assert!("purple".parse::<ColorMode>().is_err());
        assert_eq!(
            serde_json::to_string(&ColorMode::BlackWhiteDither).unwrap(),
            "\"bw-dither\""
        );
    }

    #[test]
    fn aa_level_clamps() {
        assert_eq!(clamp_aa_level(-3), 0);
        assert_eq!(clamp_aa_level(5), 5);
        assert_eq!(clamp_aa_level(99), 8);
    }

    #[test]
    fn session_defaults() {
        let c = SessionConfig::default();
        assert_eq!(c.aa_level, 8);
        assert_eq!(c.max_store, 60 * 1024 * 1024);
        assert!(c.render_cache);
    }

    #[test]
    fn page_selection_range() {
        assert_eq!(PageSelection::Range(2, 4).to_indices(10), vec![1, 2, 3]);
        assert_eq!(PageSelection::Set(vec![3, 1, 3, 99]).to_indices(5), vec![0, 2]);
        assert!(PageSelection::Single(0).to_indices(5).is_empty());
    }
}
