//! CLI binary for pdf2muse.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig`, renders progress, and turns the run status into the
//! process exit code (0 success, 2 partial success, 1 failure).

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdf2muse::{
    download_models, inspect, run, Backend, ConversionConfig, ConversionProgressCallback,
    ConversionRun, NativeFormat, ProgressCallback, RunStatus,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
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

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Renders model download and page progress on one bar. Pages may finish
/// out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    downloading: Mutex<Option<String>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(SPINNER),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            downloading: Mutex::new(None),
        })
    }

    fn elapsed_secs(&self, page: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&page)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_model_download(&self, file: &str, downloaded: u64, total: Option<u64>) {
        let mut current = self.downloading.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_deref() != Some(file) {
            *current = Some(file.to_string());
            self.bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {bytes}/{total_bytes}  {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  ")
                .tick_strings(SPINNER),
            );
            self.bar.set_prefix("Models");
            self.bar.set_message(file.to_string());
            self.bar.set_position(0);
        }
        if let Some(t) = total {
            self.bar.set_length(t);
        }
        self.bar.set_position(downloaded);
    }

    fn on_conversion_start(&self, total_pages: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} pages  \
                 ⏱ {elapsed_precise}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(SPINNER),
        );
        self.bar.set_length(total_pages as u64);
        self.bar.set_position(0);
        self.bar.set_prefix("Recognising");
        self.bar.set_message("");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Recognising {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page_index: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(page_index, Instant::now());
    }

    fn on_page_retry(&self, page_index: usize, attempt: u32, reason: &str) {
        self.bar.println(format!(
            "  {} Page {:>3}  attempt {attempt}  {}",
            yellow("↻"),
            page_index + 1,
            dim(reason)
        ));
    }

    fn on_page_complete(&self, page_index: usize, total: usize, measures: usize) {
        let secs = self.elapsed_secs(page_index);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<12}  {}",
            green("✓"),
            page_index + 1,
            total,
            dim(&format!("{measures:>4} measures")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_index: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page_index);
        let msg: String = if error.chars().count() > 80 {
            format!("{}…", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_index + 1,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, _total_pages: usize, _recognized: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a score into ./output/combined.musicxml and combined.mscx
  pdf2muse convert nocturne.pdf

  # Custom output directory, one MusicXML per page, no deskew
  pdf2muse convert etude.pdf -o scores --per-page --no-deskew

  # Let MuseScore write the native file
  pdf2muse convert sonata.pdf --native musescore --musescore-bin mscore4

  # Machine-readable run report
  pdf2muse convert sonata.pdf --json > report.json

  # Fetch the OMR checkpoints ahead of time
  pdf2muse download-models

  # Page count and metadata only
  pdf2muse inspect sonata.pdf

EXIT STATUS:
  0  every page recognised and exported
  2  partial success: some pages failed (listed on stderr / in the report)
  1  failure: bad input, missing models, no page recognised, export failed

ENVIRONMENT VARIABLES:
  PDF2MUSE_CHECKPOINT_DIR  Model checkpoint cache directory
  PDFIUM_LIB_PATH          Path to an existing libpdfium
  RUST_LOG                 Log filter, overrides --verbose
"#;

/// Convert scanned sheet-music PDFs to MusicXML and MuseScore files.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2muse",
    version,
    about = "Convert scanned sheet-music PDFs to MusicXML and MuseScore files",
    long_about = "Convert scanned sheet-music PDFs to MusicXML with optical music recognition. \
Every page is rasterised, recognised by oemer, and merged into one score with continuous \
measure numbers; an optional MuseScore file is written next to it.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2MUSE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2MUSE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recognise a PDF and write MusicXML (and the native format).
    Convert(ConvertArgs),
    /// Download the OMR model checkpoints.
    DownloadModels(ModelArgs),
    /// Print page count and metadata of a PDF.
    Inspect {
        /// PDF file to inspect.
        input: PathBuf,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Scanned sheet-music PDF.
    input: PathBuf,

    /// Output directory.
    #[arg(short, long, env = "PDF2MUSE_OUTPUT_DIR", default_value = "output")]
    output: PathBuf,

    /// Base name of the written files.
    #[arg(long, env = "PDF2MUSE_STEM", default_value = "combined")]
    stem: String,

    /// Correct page rotation before recognition (default).
    #[arg(long, overrides_with = "no_deskew")]
    deskew: bool,

    /// Skip deskewing.
    #[arg(long, overrides_with = "deskew")]
    no_deskew: bool,

    /// Inference backend.
    #[arg(long, env = "PDF2MUSE_BACKEND", value_enum, default_value = "onnx")]
    backend: BackendArg,

    /// Rendering DPI (72–600).
    #[arg(long, env = "PDF2MUSE_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Pages recognised at once. Defaults to the number of CPUs.
    #[arg(short, long, env = "PDF2MUSE_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Retries per page on transient engine failures.
    #[arg(long, env = "PDF2MUSE_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Also write one MusicXML file per recognised page.
    #[arg(long, env = "PDF2MUSE_PER_PAGE")]
    per_page: bool,

    /// Native score format written after the MusicXML.
    #[arg(long, env = "PDF2MUSE_NATIVE", value_enum, default_value = "wrapper")]
    native: NativeArg,

    /// MuseScore executable for `--native musescore`.
    #[arg(long, env = "PDF2MUSE_MUSESCORE_BIN", default_value = "mscore")]
    musescore_bin: String,

    /// OMR engine command.
    #[arg(long, env = "PDF2MUSE_ENGINE", default_value = "oemer")]
    engine: String,

    /// Keep the engine's intermediate cache files.
    #[arg(long)]
    save_cache: bool,

    #[command(flatten)]
    models: ModelArgs,

    /// Per-attempt recognition timeout in seconds.
    #[arg(long, env = "PDF2MUSE_RECOGNITION_TIMEOUT", default_value_t = 600)]
    recognition_timeout: u64,

    /// Print the run report as JSON on stdout.
    #[arg(long, env = "PDF2MUSE_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "PDF2MUSE_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Download the checkpoints even if they are cached.
    #[arg(long = "force-redownload", alias = "force")]
    force_redownload: bool,

    /// Checkpoint cache directory.
    #[arg(long, env = "PDF2MUSE_CHECKPOINT_DIR")]
    model_dir: Option<PathBuf>,

    /// Checkpoint download timeout in seconds.
    #[arg(long, env = "PDF2MUSE_DOWNLOAD_TIMEOUT", default_value_t = 600)]
    download_timeout: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Onnx,
    Tf,
}

impl From<BackendArg> for Backend {
    fn from(v: BackendArg) -> Self {
        match v {
            BackendArg::Onnx => Backend::Onnx,
            BackendArg::Tf => Backend::NativeFramework,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum NativeArg {
    Wrapper,
    Musescore,
    None,
}

fn native_format(arg: NativeArg, executable: &str) -> NativeFormat {
    match arg {
        NativeArg::Wrapper => NativeFormat::MscxWrapper,
        NativeArg::Musescore => NativeFormat::MuseScoreCli {
            executable: executable.to_string(),
        },
        NativeArg::None => NativeFormat::None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar gives all the feedback that matters, so library logs
    // drop to ERROR while it is shown.
    let show_progress = match &cli.command {
        Command::Convert(args) => !cli.quiet && !args.no_progress && !args.json,
        Command::DownloadModels(_) => !cli.quiet,
        Command::Inspect { .. } => false,
    };
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

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let result = match &cli.command {
        Command::Convert(args) => convert(args, cli.quiet, progress).await,
        Command::DownloadModels(args) => models(args, cli.quiet, progress).await,
        Command::Inspect { input, json } => show_metadata(input, *json).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", red("error:"));
            ExitCode::from(1)
        }
    }
}

async fn convert(args: &ConvertArgs, quiet: bool, progress: Option<ProgressCallback>) -> Result<ExitCode> {
    let config = build_config(args, progress)?;
    let run = run(&args.input, &config).await;

    if args.json {
        let json = serde_json::to_string_pretty(&run.report()).context("Failed to serialise run report")?;
        println!("{json}");
    } else if !quiet {
        print_summary(&run);
    }

    Ok(ExitCode::from(run.exit_code() as u8))
}

async fn models(args: &ModelArgs, quiet: bool, progress: Option<ProgressCallback>) -> Result<ExitCode> {
    let mut builder = ConversionConfig::builder()
        .force_redownload_models(args.force_redownload)
        .download_timeout_secs(args.download_timeout);
    if let Some(ref dir) = args.model_dir {
        builder = builder.model_dir(dir);
    }
    if let Some(cb) = progress.clone() {
        builder = builder.progress_callback(cb);
    }
    let config = builder.build().context("Invalid configuration")?;

    let dir = download_models(&config)
        .await
        .context("Failed to download model checkpoints")?;
    if let Some(cb) = progress {
        cb.on_conversion_complete(0, 0);
    }
    if !quiet {
        eprintln!("{} checkpoints ready in {}", green("✔"), bold(&dir.display().to_string()));
    }
    Ok(ExitCode::SUCCESS)
}

async fn show_metadata(input: &Path, json: bool) -> Result<ExitCode> {
    let source = inspect(input).await.context("Failed to inspect PDF")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&source).context("Failed to serialise metadata")?
        );
        return Ok(ExitCode::SUCCESS);
    }
    let meta = &source.metadata;
    println!("File:         {}", source.path.display());
    if let Some(ref t) = meta.title {
        println!("Title:        {t}");
    }
    if let Some(ref a) = meta.author {
        println!("Author:       {a}");
    }
    if let Some(ref s) = meta.subject {
        println!("Subject:      {s}");
    }
    println!("Pages:        {}", source.page_count);
    println!("PDF Version:  {}", meta.pdf_version);
    if let Some(ref p) = meta.producer {
        println!("Producer:     {p}");
    }
    if let Some(ref c) = meta.creator {
        println!("Creator:      {c}");
    }
    Ok(ExitCode::SUCCESS)
}

/// Map CLI args to `ConversionConfig`.
fn build_config(args: &ConvertArgs, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .output_dir(&args.output)
        .output_stem(&args.stem)
        .deskew(args.deskew || !args.no_deskew)
        .backend(args.backend.into())
        .dpi(args.dpi)
        .max_retries(args.max_retries)
        .per_page_output(args.per_page)
        .native_format(native_format(args.native, &args.musescore_bin))
        .engine_command(&args.engine)
        .save_cache(args.save_cache)
        .force_redownload_models(args.models.force_redownload)
        .recognition_timeout_secs(args.recognition_timeout)
        .download_timeout_secs(args.models.download_timeout);

    if let Some(n) = args.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(ref dir) = args.models.model_dir {
        builder = builder.model_dir(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Human summary on stderr; matches the `RunStatus` the library reports.
fn print_summary(run: &ConversionRun) {
    let marker = match run.status {
        RunStatus::Success => green("✔"),
        RunStatus::PartialSuccess { .. } => yellow("⚠"),
        RunStatus::Failure { .. } => red("✘"),
    };
    eprintln!("{marker} {}", bold(&run.status.to_string()));

    for failure in run.failed_pages() {
        eprintln!("   {} {}", red("✗"), failure);
    }
    for warning in run.warnings() {
        eprintln!("   {} {}", yellow("!"), dim(&warning.to_string()));
    }

    let exports = &run.exports;
    if let Some(ref path) = exports.musicxml {
        eprintln!("   → {}", bold(&path.display().to_string()));
    }
    for path in &exports.page_files {
        eprintln!("   → {}", dim(&path.display().to_string()));
    }
    if let Some(ref path) = exports.native {
        eprintln!("   → {}", bold(&path.display().to_string()));
    }
    if let Some(ref e) = exports.native_error {
        eprintln!("   {} native export failed: {}", yellow("!"), e);
    }
    eprintln!(
        "   {}",
        dim(&format!(
            "{}/{} pages, {} measures, {}ms total",
            run.stats.recognized_pages,
            run.stats.total_pages,
            run.stats.merged_measures,
            run.stats.total_duration_ms
        ))
    );
}
