//! Image file writers.
//!
//! Each writer takes an unmultiplied [`Pixmap`], encodes it in memory and
//! then replaces the destination file in one step (temp file + rename), so a
//! failed encode never leaves a half-written image behind.
//!
//! | Format | Colour modes | Backend |
//! |--------|--------------|---------|
//! | PNG  | rgb, argb, gray | `image` |
//! | JPEG | rgb, gray | `image` |
//! | PNM  | rgb (P6), gray (P5) | `image` |
//! | PAM  | rgb, argb, gray | `image` |
//! | BMP  | rgb, gray, bw, bw-dither | `image` |
//! | TIFF | all | `tiff`, multi-page |
//! | PBM  | always 1-bit | written directly (P4) |

use std::io::{Cursor, Seek, Write};
use std::path::Path;

use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::pnm::{PnmEncoder, PnmSubtype, SampleEncoding};
use image::{ExtendedColorType, ImageEncoder};
use pagepix_alloc::AllocContext;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::compression::{Compression, Deflate, DeflateLevel, Lzw, Packbits, Uncompressed};
use tiff::encoder::{colortype, TiffEncoder};
use tracing::debug;

use crate::config::{
    BmpParams, ColorMode, ImageFormat, JpegParams, PamParams, PbmParams, PngParams, PnmParams,
    TiffCompression, TiffMode, TiffParams,
};
use crate::error::ExportError;
use crate::pipeline::reduce;
use crate::pixmap::{Colorspace, Pixmap};

/// Samples ready for an encoder.
struct Raster {
    width: u32,
    height: u32,
    color: ExtendedColorType,
    data: Vec<u8>,
}

impl Raster {
    /// Colour samples of `pix`, alpha kept only when `keep_alpha`.
    fn from_pixmap(pix: &Pixmap, keep_alpha: bool) -> Self {
        let n = pix.n();
        let colors = pix.colorspace().n();
        let data = if pix.has_alpha() && !keep_alpha {
            pix.samples()
                .chunks_exact(n)
                .flat_map(|px| px[..colors].iter().copied())
                .collect()
        } else {
            pix.samples().to_vec()
        };
        let with_alpha = pix.has_alpha() && keep_alpha;
        let color = match (pix.colorspace(), with_alpha) {
            (Colorspace::Gray, false) => ExtendedColorType::L8,
            (Colorspace::Gray, true) => ExtendedColorType::La8,
            (Colorspace::Rgb, false) => ExtendedColorType::Rgb8,
            (Colorspace::Rgb, true) => ExtendedColorType::Rgba8,
        };
        Self {
            width: pix.width() as u32,
            height: pix.height() as u32,
            color,
            data,
        }
    }

    /// One gray byte per pixel after black/white reduction. A failed
    /// reduction is a failure of the `format` writer.
    fn reduced(
        ctx: &AllocContext,
        pix: &Pixmap,
        dither: bool,
        format: ImageFormat,
        path: &Path,
    ) -> Result<Self, ExportError> {
        let mut data = vec![0u8; pix.width() * pix.height()];
        reduce::reduce_to_bytes(ctx, &pix.view(), dither, &mut data)
            .map_err(|e| encode_err(format, path, e))?;
        Ok(Self {
            width: pix.width() as u32,
            height: pix.height() as u32,
            color: ExtendedColorType::L8,
            data,
        })
    }
}

fn check_color(format: ImageFormat, color: ColorMode) -> Result<(), ExportError> {
    if format.accepts(color) {
        Ok(())
    } else {
        Err(ExportError::UnsupportedColor { format, color })
    }
}

fn encode_err(format: ImageFormat, path: &Path, detail: impl ToString) -> ExportError {
    ExportError::Encode {
        format,
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Replace `path` with `bytes` via a sibling temp file.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ExportError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| ExportError::io(path, e))?;
    tmp.flush().map_err(|e| ExportError::io(path, e))?;
    tmp.persist(path).map_err(|e| ExportError::io(path, e.error))?;
    debug!(path = %path.display(), bytes = bytes.len(), "wrote image");
    Ok(())
}

fn encode_with(
    format: ImageFormat,
    path: &Path,
    raster: &Raster,
    encode: impl FnOnce(&mut Vec<u8>, &Raster) -> image::ImageResult<()>,
) -> Result<(), ExportError> {
    let mut buf = Vec::new();
    encode(&mut buf, raster).map_err(|e| encode_err(format, path, e))?;
    write_atomically(path, &buf)
}

// ── Writers ──────────────────────────────────────────────────────────────

pub fn write_png(pix: &Pixmap, color: ColorMode, _params: &PngParams, path: &Path) -> Result<(), ExportError> {
    check_color(ImageFormat::Png, color)?;
    let raster = Raster::from_pixmap(pix, color == ColorMode::Argb);
    encode_with(ImageFormat::Png, path, &raster, |buf, r| {
        PngEncoder::new(buf).write_image(&r.data, r.width, r.height, r.color)
    })
}

pub fn write_jpeg(pix: &Pixmap, color: ColorMode, params: &JpegParams, path: &Path) -> Result<(), ExportError> {
    check_color(ImageFormat::Jpeg, color)?;
    let raster = Raster::from_pixmap(pix, false);
    let quality = params.effective_quality();
    encode_with(ImageFormat::Jpeg, path, &raster, |buf, r| {
        JpegEncoder::new_with_quality(buf, quality).write_image(&r.data, r.width, r.height, r.color)
    })
}

/// Binary PNM: P6 for RGB, P5 for gray.
pub fn write_pnm(pix: &Pixmap, color: ColorMode, _params: &PnmParams, path: &Path) -> Result<(), ExportError> {
    check_color(ImageFormat::Pnm, color)?;
    let raster = Raster::from_pixmap(pix, false);
    let subtype = match pix.colorspace() {
        Colorspace::Rgb => PnmSubtype::Pixmap(SampleEncoding::Binary),
        Colorspace::Gray => PnmSubtype::Graymap(SampleEncoding::Binary),
    };
    encode_with(ImageFormat::Pnm, path, &raster, |buf, r| {
        PnmEncoder::new(buf)
            .with_subtype(subtype)
            .write_image(&r.data, r.width, r.height, r.color)
    })
}

/// PAM (P7); alpha is written for argb only.
pub fn write_pam(pix: &Pixmap, color: ColorMode, _params: &PamParams, path: &Path) -> Result<(), ExportError> {
    check_color(ImageFormat::Pam, color)?;
    let raster = Raster::from_pixmap(pix, color == ColorMode::Argb);
    // The encoder's default header strategy writes PAM.
    encode_with(ImageFormat::Pam, path, &raster, |buf, r| {
        PnmEncoder::new(buf).write_image(&r.data, r.width, r.height, r.color)
    })
}

pub fn write_bmp(
    ctx: &AllocContext,
    pix: &Pixmap,
    color: ColorMode,
    _params: &BmpParams,
    path: &Path,
) -> Result<(), ExportError> {
    check_color(ImageFormat::Bmp, color)?;
    let raster = if color.is_binary() {
        Raster::reduced(ctx, pix, color.dithers(), ImageFormat::Bmp, path)?
    } else {
        Raster::from_pixmap(pix, false)
    };
    encode_with(ImageFormat::Bmp, path, &raster, |buf, r| {
        BmpEncoder::new(buf).write_image(&r.data, r.width, r.height, r.color)
    })
}

/// Binary PBM (P4) from the packed 1-bit reduction; `1` bits are black.
pub fn write_pbm(ctx: &AllocContext, pix: &Pixmap, params: &PbmParams, path: &Path) -> Result<(), ExportError> {
    let bitmap = reduce::to_bitmap(ctx, &pix.view(), params.dither)
        .map_err(|e| encode_err(ImageFormat::Pbm, path, e))?;
    let mut buf = format!("P4\n{} {}\n", bitmap.width, bitmap.height).into_bytes();
    buf.extend_from_slice(&bitmap.data);
    write_atomically(path, &buf)
}

// ── TIFF ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TiffKind {
    Gray,
    Rgb,
    Rgba,
}

struct TiffPage {
    width: u32,
    height: u32,
    kind: TiffKind,
    data: Vec<u8>,
}

impl TiffPage {
    fn from_raster(r: Raster) -> Self {
        let kind = match r.color {
            ExtendedColorType::Rgb8 => TiffKind::Rgb,
            ExtendedColorType::Rgba8 => TiffKind::Rgba,
            _ => TiffKind::Gray,
        };
        Self {
            width: r.width,
            height: r.height,
            kind,
            data: r.data,
        }
    }
}

fn deflate_level(quality: i32) -> DeflateLevel {
    match quality {
        ..=3 => DeflateLevel::Fast,
        4..=7 => DeflateLevel::Balanced,
        _ => DeflateLevel::Best,
    }
}

fn write_tiff_page<W: Write + Seek, D: Compression>(
    enc: &mut TiffEncoder<W>,
    page: &TiffPage,
    compression: D,
) -> tiff::TiffResult<()> {
    let (w, h, data) = (page.width, page.height, page.data.as_slice());
    match page.kind {
        TiffKind::Gray => enc.write_image_with_compression::<colortype::Gray8, D>(w, h, compression, data),
        TiffKind::Rgb => enc.write_image_with_compression::<colortype::RGB8, D>(w, h, compression, data),
        TiffKind::Rgba => enc.write_image_with_compression::<colortype::RGBA8, D>(w, h, compression, data),
    }
}

/// Pages already stored in a TIFF file, for append mode.
fn read_tiff_pages(bytes: &[u8]) -> Result<Vec<TiffPage>, String> {
    let mut decoder = Decoder::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let mut pages = Vec::new();
    loop {
        let (width, height) = decoder.dimensions().map_err(|e| e.to_string())?;
        let kind = match decoder.colortype().map_err(|e| e.to_string())? {
            tiff::ColorType::Gray(8) => TiffKind::Gray,
            tiff::ColorType::RGB(8) => TiffKind::Rgb,
            tiff::ColorType::RGBA(8) => TiffKind::Rgba,
            other => return Err(format!("cannot append to a TIFF page of type {other:?}")),
        };
        let data = match decoder.read_image().map_err(|e| e.to_string())? {
            DecodingResult::U8(data) => data,
            _ => return Err("unexpected sample format in existing TIFF page".into()),
        };
        pages.push(TiffPage {
            width,
            height,
            kind,
            data,
        });
        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(|e| e.to_string())?;
    }
    Ok(pages)
}

fn encode_tiff(pages: &[TiffPage], params: &TiffParams) -> Result<Vec<u8>, String> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut enc = TiffEncoder::new(&mut cursor).map_err(|e| e.to_string())?;
        for page in pages {
            let res = match params.compression {
                TiffCompression::None => write_tiff_page(&mut enc, page, Uncompressed::default()),
                TiffCompression::Lzw => write_tiff_page(&mut enc, page, Lzw::default()),
                TiffCompression::Packbits => write_tiff_page(&mut enc, page, Packbits::default()),
                TiffCompression::Zlib | TiffCompression::Deflate => write_tiff_page(
                    &mut enc,
                    page,
                    Deflate::with_level(deflate_level(params.effective_quality())),
                ),
                other => return Err(format!("{other:?} compression is not supported by the TIFF writer")),
            };
            res.map_err(|e| e.to_string())?;
        }
    }
    Ok(cursor.into_inner())
}

/// Write `pix` as a TIFF page. In [`TiffMode::Append`] an existing file keeps
/// its pages and gains this one at the end; a missing file is created.
pub fn write_tiff(
    ctx: &AllocContext,
    pix: &Pixmap,
    color: ColorMode,
    params: &TiffParams,
    path: &Path,
) -> Result<(), ExportError> {
    check_color(ImageFormat::Tiff, color)?;
    params.validate(color)?;

    let raster = if color.is_binary() {
        Raster::reduced(ctx, pix, color.dithers(), ImageFormat::Tiff, path)?
    } else {
        Raster::from_pixmap(pix, color == ColorMode::Argb)
    };

    let mut pages = Vec::new();
    if params.mode == TiffMode::Append {
        match std::fs::read(path) {
            Ok(existing) => {
                pages = read_tiff_pages(&existing).map_err(|e| encode_err(ImageFormat::Tiff, path, e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ExportError::io(path, e)),
        }
    }
    pages.push(TiffPage::from_raster(raster));
    debug!(path = %path.display(), pages = pages.len(), compression = ?params.compression, "encoding tiff");

    let bytes = encode_tiff(&pages, params).map_err(|e| encode_err(ImageFormat::Tiff, path, e))?;
    write_atomically(path, &bytes)
}
