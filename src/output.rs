//! Result types produced by a conversion run.
//!
//! A run never returns `Err`: everything that happened, including fatal
//! failures, is recorded on [`ConversionRun`] so callers can inspect partial
//! work. [`ConversionRun::into_result`] turns it into a `Result` for callers
//! who only care about complete success.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::RunSettings;
use crate::error::{FailureKind, MergeWarning, Pdf2MuseError, RecognitionFailure};
use crate::notation::NotationFragment;
use crate::pipeline::merge::MergedDocument;

/// Metadata read from the PDF's document information dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub pdf_version: String,
}

/// The input PDF after it has been opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

/// What recognising one page produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionOutcome {
    Recognized(NotationFragment),
    Failed(RecognitionFailure),
}

/// The outcome of one page, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    /// Zero-based page index.
    pub page_index: usize,
    pub outcome: RecognitionOutcome,
    /// Engine invocations made for this page (0 when it never started).
    pub attempts: u32,
    pub duration_ms: u64,
}

impl RecognitionResult {
    pub fn recognized(page_index: usize, fragment: NotationFragment) -> Self {
        Self {
            page_index,
            outcome: RecognitionOutcome::Recognized(fragment),
            attempts: 1,
            duration_ms: 0,
        }
    }

    pub fn failed(failure: RecognitionFailure) -> Self {
        Self {
            page_index: failure.page_index,
            outcome: RecognitionOutcome::Failed(failure),
            attempts: 1,
            duration_ms: 0,
        }
    }

    pub fn is_recognized(&self) -> bool {
        matches!(self.outcome, RecognitionOutcome::Recognized(_))
    }

    pub fn fragment(&self) -> Option<&NotationFragment> {
        match &self.outcome {
            RecognitionOutcome::Recognized(f) => Some(f),
            RecognitionOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&RecognitionFailure> {
        match &self.outcome {
            RecognitionOutcome::Recognized(_) => None,
            RecognitionOutcome::Failed(f) => Some(f),
        }
    }

    /// Serialisable one-line summary of this page.
    pub fn report(&self) -> PageReport {
        PageReport {
            page_index: self.page_index,
            recognized: self.is_recognized(),
            measures: self.fragment().map_or(0, NotationFragment::measure_count),
            notes: self.fragment().map_or(0, NotationFragment::note_count),
            failure: self.failure().cloned(),
            attempts: self.attempts,
            duration_ms: self.duration_ms,
        }
    }
}

/// Files written by the export stage and what went wrong writing them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReport {
    pub musicxml: Option<PathBuf>,
    pub page_files: Vec<PathBuf>,
    pub native: Option<PathBuf>,
    /// Set when the combined MusicXML could not be written; fails the run.
    pub musicxml_error: Option<String>,
    /// Set when the native export failed; the run keeps its status.
    pub native_error: Option<String>,
    pub page_errors: Vec<String>,
}

/// A page left out of a partially successful run, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPage {
    /// Zero-based page index.
    pub page_index: usize,
    pub kind: FailureKind,
    pub reason: String,
}

impl From<&RecognitionFailure> for FailedPage {
    fn from(failure: &RecognitionFailure) -> Self {
        Self {
            page_index: failure.page_index,
            kind: failure.kind,
            reason: failure.reason.clone(),
        }
    }
}

impl fmt::Display for FailedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {} ({}: {})", self.page_index + 1, self.kind, self.reason)
    }
}

/// Overall verdict of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every page was recognised and the MusicXML was written.
    Success,
    /// The score was written but some pages are missing from it.
    PartialSuccess {
        recognized: usize,
        total: usize,
        /// The pages left out, in page order.
        failed_pages: Vec<FailedPage>,
    },
    /// No score was produced.
    Failure { reason: String },
}

impl RunStatus {
    /// Process exit code used by the CLI: 0, 2 or 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::PartialSuccess { .. } => 2,
            RunStatus::Failure { .. } => 1,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::PartialSuccess {
                recognized,
                total,
                failed_pages,
            } => {
                let pages: Vec<String> = failed_pages.iter().map(FailedPage::to_string).collect();
                write!(
                    f,
                    "partial success: {recognized}/{total} pages recognised; failed: {}",
                    pages.join(", ")
                )
            }
            RunStatus::Failure { reason } => write!(f, "failure: {reason}"),
        }
    }
}

/// Timing and volume counters for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_pages: usize,
    pub recognized_pages: usize,
    pub failed_pages: usize,
    /// Pages that needed more than one engine invocation.
    pub retried_pages: usize,
    pub merged_parts: usize,
    pub merged_measures: usize,
    pub total_duration_ms: u64,
    pub render_duration_ms: u64,
    pub recognition_duration_ms: u64,
    pub export_duration_ms: u64,
}

/// Everything one invocation of the pipeline did.
#[derive(Debug)]
pub struct ConversionRun {
    pub input: PathBuf,
    pub source: Option<SourceDocument>,
    pub settings: RunSettings,
    /// One entry per attempted page, ordered by page index.
    pub results: Vec<RecognitionResult>,
    pub merged: Option<MergedDocument>,
    pub exports: ExportReport,
    pub status: RunStatus,
    /// The fatal error behind a [`RunStatus::Failure`].
    pub error: Option<Pdf2MuseError>,
    pub stats: RunStats,
}

impl ConversionRun {
    pub(crate) fn new(input: PathBuf, settings: RunSettings) -> Self {
        Self {
            input,
            source: None,
            settings,
            results: Vec::new(),
            merged: None,
            exports: ExportReport::default(),
            status: RunStatus::Failure {
                reason: "run did not complete".into(),
            },
            error: None,
            stats: RunStats::default(),
        }
    }

    /// Mark the run failed with a fatal error.
    pub(crate) fn fail(mut self, error: Pdf2MuseError) -> Self {
        self.status = RunStatus::Failure {
            reason: error.to_string(),
        };
        self.error = Some(error);
        self
    }

    pub fn recognized_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_recognized()).count()
    }

    pub fn failed_pages(&self) -> Vec<&RecognitionFailure> {
        self.results.iter().filter_map(RecognitionResult::failure).collect()
    }

    /// Failed pages in the shape [`RunStatus::PartialSuccess`] reports them.
    pub fn failed_page_summaries(&self) -> Vec<FailedPage> {
        self.failed_pages().into_iter().map(FailedPage::from).collect()
    }

    pub fn failed_page_indices(&self) -> Vec<usize> {
        self.failed_pages().iter().map(|f| f.page_index).collect()
    }

    pub fn warnings(&self) -> &[MergeWarning] {
        self.merged
            .as_ref()
            .map(|m| m.warnings.as_slice())
            .unwrap_or_default()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// Treat anything short of full success as an error.
    pub fn into_result(mut self) -> Result<Self, Pdf2MuseError> {
        match self.status.clone() {
            RunStatus::Success => Ok(self),
            RunStatus::PartialSuccess {
                recognized, total, ..
            } => Err(Pdf2MuseError::PartialFailure {
                recognized,
                failed: total - recognized,
                total,
            }),
            RunStatus::Failure { reason } => Err(self
                .error
                .take()
                .unwrap_or(Pdf2MuseError::Internal(reason))),
        }
    }

    /// Serialisable summary for `--json` output and logs.
    pub fn report(&self) -> RunReport {
        RunReport {
            input: self.input.clone(),
            source: self.source.clone(),
            settings: self.settings.clone(),
            status: self.status.clone(),
            error_kind: self.error.as_ref().map(|e| e.category().to_string()),
            pages: self.results.iter().map(RecognitionResult::report).collect(),
            warnings: self.warnings().to_vec(),
            exports: self.exports.clone(),
            stats: self.stats.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageReport {
    pub page_index: usize,
    pub recognized: bool,
    pub measures: usize,
    pub notes: usize,
    pub failure: Option<RecognitionFailure>,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub input: PathBuf,
    pub source: Option<SourceDocument>,
    pub settings: RunSettings,
    pub status: RunStatus,
    pub error_kind: Option<String>,
    pub pages: Vec<PageReport>,
    pub warnings: Vec<MergeWarning>,
    pub exports: ExportReport,
    pub stats: RunStats,
}
