//! CLI binary for pagepix.
//!
//! A thin shim over the library crate: every input file is one page of a
//! raster document, exported to a directory in the chosen format.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pagepix::{
    export_pages, BmpParams, ColorMode, Document, ExportJob, ExportOptions,
    ExportProgressCallback, FormatParams, ImageFormat, JpegParams, Output, PageSelection,
    PamParams, PbmParams, PngParams, PnmParams, RasterDocument, Rect, SessionConfig,
    SharedContext, TiffCompression, TiffMode, TiffParams,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per page. Pages may finish out of
/// order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Exporting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn times(&self) -> MutexGuard<'_, HashMap<usize, Instant>> {
        self.start_times.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn elapsed_secs(&self, page_num: usize) -> f64 {
        self.times()
            .remove(&page_num)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ExportProgressCallback for CliProgressCallback {
    fn on_export_start(&self, total_pages: usize) {
        self.bar.set_length(total_pages as u64);
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Exporting {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        self.times().insert(page_num, Instant::now());
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, bytes: u64) {
        let secs = self.elapsed_secs(page_num);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<12}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{bytes:>8} bytes")),
            dim(&format!("{secs:.2}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page_num);

        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(['\u{2026}']).collect()
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            dim(&format!("{secs:.2}s")),
        ));
        self.bar.inc(1);
    }

    fn on_export_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} pages exported",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages exported  ({} failed)",
                if failed == total_pages { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Every input as a PNG page in ./out
  pagepix scan1.png scan2.jpg -o out

  # Dithered 1-bit BMP at twice the size
  pagepix --color bw-dither --zoom 2 scan.png

  # One multi-page TIFF, deflate level 9
  pagepix --format tiff --compression deflate --quality 9 --append *.png

  # Raw ARGB words of a cropped region, with a JSON report
  pagepix --format raw --color argb --crop 0,0,200,100 --json scan.png

ENVIRONMENT VARIABLES:
  PAGEPIX_AA_LEVEL        Anti-alias level 0..8 (default 8)
  PAGEPIX_MAX_STORE       Render store ceiling in bytes (default 60 MiB)
  PAGEPIX_RENDER_CACHE    Keep rendered pages for reuse (1/0)
  RUST_LOG                tracing filter, overrides --verbose/--quiet
"#;

/// Render raster pages and export them as images or raw buffers.
#[derive(Parser, Debug)]
#[command(
    name = "pagepix",
    version,
    about = "Render pages to pixmaps and export them as images or raw buffers",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Image files, one page each.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output format.
    #[arg(short, long, env = "PAGEPIX_FORMAT", value_enum, default_value = "png")]
    format: FormatArg,

    /// Colour mode: rgb, argb, gray, bw, bw-dither.
    #[arg(short, long, env = "PAGEPIX_COLOR", default_value = "rgb", value_parser = parse_color)]
    color: ColorMode,

    /// Scale factor; 1 renders one pixel per point.
    #[arg(short, long, env = "PAGEPIX_ZOOM", default_value_t = 1.0)]
    zoom: f32,

    /// Rotation in degrees. Default: the page's own rotation.
    #[arg(long, env = "PAGEPIX_ROTATE", allow_negative_numbers = true)]
    rotate: Option<i32>,

    /// Gamma exponent applied after rendering.
    #[arg(long, env = "PAGEPIX_GAMMA", default_value_t = 1.0)]
    gamma: f32,

    /// Crop rectangle in points: x0,y0,x1,y1.
    #[arg(long, env = "PAGEPIX_CROP", value_parser = parse_crop)]
    crop: Option<Rect>,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "PAGEPIX_PAGES", default_value = "all")]
    pages: String,

    /// Output directory.
    #[arg(short, long, env = "PAGEPIX_OUTPUT", default_value = ".")]
    output: PathBuf,

    /// File name prefix.
    #[arg(long, env = "PAGEPIX_STEM", default_value = "page")]
    stem: String,

    /// Pages exported at once.
    #[arg(short, long, env = "PAGEPIX_JOBS", default_value_t = 4)]
    jobs: usize,

    /// Anti-alias level, 0..8.
    #[arg(long, env = "PAGEPIX_AA_LEVEL", allow_negative_numbers = true)]
    aa_level: Option<i64>,

    /// Render store ceiling in bytes.
    #[arg(long, env = "PAGEPIX_MAX_STORE")]
    max_store: Option<usize>,

    /// Do not keep rendered pages for reuse.
    #[arg(long)]
    no_render_cache: bool,

    /// JPEG quality 0..100, or TIFF deflate level 1..9.
    #[arg(long, env = "PAGEPIX_QUALITY", allow_negative_numbers = true)]
    quality: Option<i32>,

    /// TIFF compression.
    #[arg(long, env = "PAGEPIX_COMPRESSION", value_enum, default_value = "none")]
    compression: CompressionArg,

    /// Append all pages to one TIFF file.
    #[arg(long)]
    append: bool,

    /// PBM: plain threshold without error diffusion.
    #[arg(long)]
    no_dither: bool,

    /// Print the export report as JSON on stdout.
    #[arg(long, env = "PAGEPIX_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PAGEPIX_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PAGEPIX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PAGEPIX_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum FormatArg {
    Png,
    Jpeg,
    Tiff,
    Pnm,
    Pam,
    Pbm,
    Bmp,
    Raw,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CompressionArg {
    None,
    Lzw,
    Packbits,
    Deflate,
    Zlib,
    CcittRle,
    CcittT4,
    CcittT6,
    Jpeg,
}

impl From<CompressionArg> for TiffCompression {
    fn from(v: CompressionArg) -> Self {
        match v {
            CompressionArg::None => TiffCompression::None,
            CompressionArg::Lzw => TiffCompression::Lzw,
            CompressionArg::Packbits => TiffCompression::Packbits,
            CompressionArg::Deflate => TiffCompression::Deflate,
            CompressionArg::Zlib => TiffCompression::Zlib,
            CompressionArg::CcittRle => TiffCompression::CcittRle,
            CompressionArg::CcittT4 => TiffCompression::CcittT4,
            CompressionArg::CcittT6 => TiffCompression::CcittT6,
            CompressionArg::Jpeg => TiffCompression::Jpeg,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar covers per-page feedback, so library INFO logs are
    // suppressed while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build job ────────────────────────────────────────────────────────
    let total = cli.inputs.len();
    let selection = parse_pages(&cli.pages)?;
    let pages = selection.to_indices(total);
    if pages.is_empty() {
        anyhow::bail!("Page selection '{}' matches none of the {} inputs", cli.pages, total);
    }

    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create output directory {:?}", cli.output))?;

    let progress = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExportProgressCallback>)
    } else {
        None
    };
    let job = build_job(&cli, progress)?;

    // ── Run export ───────────────────────────────────────────────────────
    let inputs = cli.inputs.clone();
    let open = move || {
        RasterDocument::open(inputs.iter()).map(|doc| Box::new(doc) as Box<dyn Document>)
    };
    let shared = SharedContext::new(job.session.max_store);
    let report = export_pages(open, shared, pages, job, cli.jobs).await;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else if !cli.quiet && !show_progress {
        eprintln!(
            "Exported {}/{} pages in {}ms",
            report.succeeded,
            report.pages.len(),
            report.duration_ms
        );
        for page in report.pages.iter().filter(|p| !p.is_ok()) {
            if let Some(err) = &page.error {
                eprintln!("  {err}");
            }
        }
    }

    if report.failed > 0 {
        anyhow::bail!("{} of {} pages failed", report.failed, report.pages.len());
    }
    Ok(())
}

/// Map CLI args to an [`ExportJob`].
fn build_job(
    cli: &Cli,
    progress: Option<Arc<dyn ExportProgressCallback>>,
) -> Result<ExportJob> {
    let mut builder = ExportOptions::builder()
        .zoom(cli.zoom)
        .color(cli.color)
        .gamma(cli.gamma);
    if let Some(deg) = cli.rotate {
        builder = builder.rotate(deg);
    }
    if let Some(crop) = cli.crop {
        builder = builder.crop(crop);
    }
    let options = builder.build().context("Invalid export options")?;

    let output = match cli.format {
        FormatArg::Raw => Output::Raw,
        FormatArg::Png => Output::File(FormatParams::Png(PngParams::default())),
        FormatArg::Jpeg => Output::File(FormatParams::Jpeg(JpegParams {
            quality: cli.quality.unwrap_or(75),
        })),
        FormatArg::Tiff => Output::File(FormatParams::Tiff(TiffParams {
            compression: cli.compression.into(),
            mode: if cli.append { TiffMode::Append } else { TiffMode::Discard },
            quality: cli.quality.unwrap_or(0),
        })),
        FormatArg::Pnm => Output::File(FormatParams::Pnm(PnmParams::default())),
        FormatArg::Pam => Output::File(FormatParams::Pam(PamParams::default())),
        FormatArg::Pbm => Output::File(FormatParams::Pbm(PbmParams {
            dither: !cli.no_dither,
        })),
        FormatArg::Bmp => Output::File(FormatParams::Bmp(BmpParams::default())),
    };
    if let Output::File(params) = &output {
        check_format(params.format(), cli.color)?;
    }

    let mut session = SessionConfig::from_env();
    if let Some(level) = cli.aa_level {
        session.aa_level = pagepix::config::clamp_aa_level(level);
    }
    if let Some(max) = cli.max_store {
        session.max_store = max;
    }
    if cli.no_render_cache {
        session.render_cache = false;
    }

    let mut job = ExportJob::new(options, output, &cli.output);
    job.stem = cli.stem.clone();
    job.session = session;
    job.progress = progress;
    Ok(job)
}

/// Fail before rendering anything when the format cannot take the colour.
fn check_format(format: ImageFormat, color: ColorMode) -> Result<()> {
    if !format.accepts(color) {
        anyhow::bail!("{format} cannot be written with colour mode {color}");
    }
    Ok(())
}

fn parse_color(s: &str) -> Result<ColorMode, String> {
    s.parse().map_err(|e: pagepix::ExportError| e.to_string())
}

/// Parse `x0,y0,x1,y1`.
fn parse_crop(s: &str) -> Result<Rect, String> {
    let v: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| format!("'{}': {e}", p.trim())))
        .collect::<Result<_, _>>()?;
    match v.as_slice() {
        [x0, y0, x1, y1] => Ok(Rect::new(*x0, *y0, *x1, *y1)),
        _ => Err(format!("expected x0,y0,x1,y1, got {} values", v.len())),
    }
}

/// Parse `--pages` string into `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(PageSelection::All);
    }

    // Range: "3-15"
    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start
            .trim()
            .parse()
            .context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;

        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!("Invalid page range '{}-{}': start must be <= end", start, end);
        }

        return Ok(PageSelection::Range(start, end));
    }

    // Set: "1,3,5,7"
    if s.contains(',') {
        let pages: Vec<usize> = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid page number: '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(&p) = pages.iter().find(|&&p| p < 1) {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", p);
        }

        return Ok(PageSelection::Set(pages));
    }

    // Single page: "5"
    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }

    Ok(PageSelection::Single(page))
}
