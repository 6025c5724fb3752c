//! # pdf2muse
//!
//! Convert scanned sheet-music PDFs to MusicXML, and optionally a MuseScore
//! `.mscx` file, with optical music recognition (OMR).
//!
//! ## How it works
//!
//! OMR engines read one image at a time and number everything from scratch
//! on every page. This crate does the multi-page part around them: it
//! rasterises each PDF page, runs the engine on the pages concurrently,
//! retries the failures worth retrying, and merges the per-page results into
//! one score with continuous measure numbers and a stable part list. One bad
//! page never sinks the run; it is reported and left out.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input       check the file exists and starts with %PDF
//!  ├─ 2. Render      rasterise pages via pdfium (blocking, spawn_blocking)
//!  ├─ 3. Checkpoints download the OMR models once per cache directory
//!  ├─ 4. Recognise   one oemer process per page, bounded concurrency, retries
//!  ├─ 5. Merge       renumber measures, map parts by position
//!  └─ 6. Export      <stem>.musicxml (atomic), then <stem>.mscx
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2muse::{run, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::builder()
//!         .output_dir("scores")
//!         .dpi(300)
//!         .build()?;
//!     let run = run("nocturne.pdf", &config).await;
//!     println!("{}", run.status);
//!     for failure in run.failed_pages() {
//!         eprintln!("{failure}");
//!     }
//!     std::process::exit(run.exit_code());
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2muse` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ## Runtime requirements
//!
//! - a pdfium shared library (`PDFIUM_LIB_PATH`, the working directory, or the
//!   system library path)
//! - the `oemer` command on `PATH`, or another engine injected through
//!   [`ConversionConfigBuilder::engine`]

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cancel;
pub mod config;
pub mod convert;
pub mod error;
pub mod notation;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::CancelToken;
pub use config::{Backend, ConversionConfig, ConversionConfigBuilder, NativeFormat, RunSettings};
pub use convert::{download_models, inspect, rerun_pages, run, run_sync};
pub use error::{
    ExportError, FailureKind, MergeWarning, ModelDownloadError, Pdf2MuseError, RasterizationError,
    RecognitionFailure,
};
pub use notation::{NotationError, NotationFragment};
pub use omr_checkpoints::{CheckpointCache, CheckpointError, CheckpointFetcher, OEMER_CHECKPOINTS};
pub use output::{
    ConversionRun, DocumentMetadata, ExportReport, FailedPage, PageReport, RecognitionOutcome,
    RecognitionResult, RunReport, RunStats, RunStatus, SourceDocument,
};
pub use pipeline::export::{MscxWrapper, MuseScoreCli, NativeConverter};
pub use pipeline::merge::{merge, MergedDocument};
pub use pipeline::recognize::{
    EngineError, EngineOutput, OemerEngine, RecognitionEngine, RecognitionOptions,
};
pub use pipeline::render::{PageImage, PageRasterizer, PdfiumRasterizer};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{recognize_stream, ResultStream};
