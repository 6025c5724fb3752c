//! Error types for the pdf2muse library.
//!
//! Failures fall into three tiers:
//!
//! * [`Pdf2MuseError`] is **fatal**: the run cannot produce a score at all
//!   (unreadable PDF, model checkpoints unavailable, every page failed, the
//!   MusicXML file could not be written). Stored on
//!   [`crate::output::ConversionRun`] and surfaced through its status.
//!
//! * [`RecognitionFailure`] is **per page**: one page could not be recognised
//!   (blank page, engine crash, timeout). Recorded in the page's
//!   [`crate::output::RecognitionResult`]; the rest of the document continues.
//!
//! * [`MergeWarning`] is **advisory**: the merged score was produced but
//!   something about the inputs looked off (duplicate part ids, ragged pages).
//!
//! Native-format export failures are reported as [`ExportError`] inside the
//! run's export report and never downgrade a run whose MusicXML was written.

use std::fmt;
use std::path::PathBuf;

use omr_checkpoints::CheckpointError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while opening or rasterising the source PDF.
///
/// Any of these aborts the run: there are no pages to recognise.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum RasterizationError {
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    NotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// No usable pdfium library could be bound.
    #[error(
        "PDF rendering engine unavailable: {detail}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy."
    )]
    EngineUnavailable { detail: String },

    /// The PDF could not be parsed.
    #[error("PDF '{path}' is corrupt or unsupported: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// pdfium failed on one specific page.
    #[error("Rasterisation failed for page {}: {detail}", .page + 1)]
    PageRender { page: usize, detail: String },

    /// The rasteriser returned a different page set than requested.
    #[error("Rasteriser returned {actual} page images, expected {expected}")]
    PageCountMismatch { expected: usize, actual: usize },

    /// Rendering did not finish within the configured bound.
    #[error("Rasterisation timed out after {secs}s\nIncrease --render-timeout.")]
    Timeout { secs: u64 },

    /// Reading the input or writing page images failed.
    #[error("I/O error during rasterisation: {detail}")]
    Io { detail: String },
}

/// Why a page failed to produce notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Resource exhaustion or an interrupted engine; a retry may succeed.
    Transient,
    /// The engine ran and failed on this input (blank page, unparsable output).
    Deterministic,
    /// The engine exceeded its per-invocation time bound.
    Timeout,
    /// The run was cancelled before the page finished.
    Cancelled,
    /// Model checkpoints could not be made available.
    ModelUnavailable,
}

impl FailureKind {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Deterministic => "deterministic",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::ModelUnavailable => "model unavailable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal failure for a single page.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("Page {}: {kind} failure: {reason}", .page_index + 1)]
pub struct RecognitionFailure {
    /// Zero-based page index.
    pub page_index: usize,
    pub kind: FailureKind,
    pub reason: String,
}

impl RecognitionFailure {
    pub fn new(page_index: usize, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            page_index,
            kind,
            reason: reason.into(),
        }
    }

    pub fn cancelled(page_index: usize) -> Self {
        Self::new(page_index, FailureKind::Cancelled, "conversion cancelled")
    }
}

/// Model checkpoints could not be fetched and none are cached.
#[derive(Debug, Error)]
#[error("Model checkpoints unavailable in '{cache_dir}': {source}\nCheck your internet connection or set PDF2MUSE_CHECKPOINT_DIR.")]
pub struct ModelDownloadError {
    pub cache_dir: PathBuf,
    #[source]
    pub source: CheckpointError,
}

/// Something the merger tolerated but the caller may want to know about.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeWarning {
    /// Two score-parts on one page share an id; the later declaration wins.
    #[error("Page {}: part id '{part_id}' declared more than once; the later declaration wins", .page_index + 1)]
    DuplicatePartId { page_index: usize, part_id: String },

    /// More than one result was supplied for the same page; the later one wins.
    #[error("Page {}: more than one recognition result; the later one wins", .page_index + 1)]
    DuplicatePage { page_index: usize },

    /// A part on this page is shorter than the page's longest part.
    #[error("Page {}: part '{part_id}' has {measures} measures, the page spans {expected}", .page_index + 1)]
    RaggedPage {
        page_index: usize,
        part_id: String,
        measures: usize,
        expected: usize,
    },
}

/// Errors raised while writing output files.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The score could not be serialised or re-read.
    #[error("Failed to serialise score: {detail}")]
    Serialize { detail: String },

    /// The native-format converter failed.
    #[error("Native export via {converter} failed: {detail}")]
    Converter { converter: String, detail: String },

    /// The native-format converter did not finish in time.
    #[error("Native export via {converter} timed out after {secs}s")]
    ConverterTimeout { converter: String, secs: u64 },
}

/// All fatal errors returned by the pdf2muse library.
///
/// Page-level failures use [`RecognitionFailure`] and are stored in
/// [`crate::output::RecognitionResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum Pdf2MuseError {
    // ── Input errors ──────────────────────────────────────────────────────
    #[error(transparent)]
    Rasterization(#[from] RasterizationError),

    // ── Model errors ──────────────────────────────────────────────────────
    #[error(transparent)]
    ModelDownload(#[from] ModelDownloadError),

    // ── Recognition errors ────────────────────────────────────────────────
    /// Every page failed; the merged score would be empty.
    #[error("No page of {total} was recognised.\nFirst error: {first_error}")]
    NoPagesRecognized { total: usize, first_error: String },

    /// Some pages succeeded but at least one failed.
    ///
    /// Returned by [`crate::output::ConversionRun::into_result`] when
    /// the caller wants to treat any page failure as an error.
    #[error("{failed}/{total} pages failed during recognition")]
    PartialFailure {
        recognized: usize,
        failed: usize,
        total: usize,
    },

    // ── Output errors ─────────────────────────────────────────────────────
    #[error(transparent)]
    Export(#[from] ExportError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The run was cancelled through its [`crate::CancelToken`].
    #[error("Conversion cancelled")]
    Cancelled,

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Pdf2MuseError {
    /// Short machine-readable category, used in JSON reports.
    pub fn category(&self) -> &'static str {
        match self {
            Pdf2MuseError::Rasterization(_) => "rasterization",
            Pdf2MuseError::ModelDownload(_) => "model_download",
            Pdf2MuseError::NoPagesRecognized { .. } => "no_pages_recognized",
            Pdf2MuseError::PartialFailure { .. } => "partial_failure",
            Pdf2MuseError::Export(_) => "export",
            Pdf2MuseError::InvalidConfig(_) => "invalid_config",
            Pdf2MuseError::Cancelled => "cancelled",
            Pdf2MuseError::Internal(_) => "internal",
        }
    }
}
