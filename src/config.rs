//! Configuration types for PDF-to-MusicXML conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. Besides plain settings the config
//! carries the run's collaborators: the page rasteriser, the recognition
//! engine, the checkpoint cache and the native-format converter. Each is
//! optional; when absent the pipeline builds its default implementation.
//! Tests substitute fakes here.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use omr_checkpoints::CheckpointCache;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::Pdf2MuseError;
use crate::pipeline::export::NativeConverter;
use crate::pipeline::recognize::{RecognitionEngine, RecognitionOptions};
use crate::pipeline::render::PageRasterizer;
use crate::progress::ProgressCallback;

/// Lowest accepted rendering DPI.
pub const MIN_DPI: u32 = 72;
/// Highest accepted rendering DPI.
pub const MAX_DPI: u32 = 600;

/// Configuration for a PDF-to-MusicXML conversion.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use pdf2muse::{Backend, ConversionConfig};
///
/// let config = ConversionConfig::builder()
///     .output_dir("scores")
///     .dpi(300)
///     .backend(Backend::Onnx)
///     .concurrency(2)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Directory that receives every output file. Created if missing. Default: `output`.
    pub output_dir: PathBuf,

    /// File stem for the combined score. Default: `combined`.
    pub output_stem: String,

    /// Also write one `<stem>_page_NNN.musicxml` per recognised page. Default: false.
    pub per_page_output: bool,

    /// Native score format written next to the MusicXML. Default: [`NativeFormat::MscxWrapper`].
    pub native_format: NativeFormat,

    /// Let the engine straighten skewed scans. Default: true.
    ///
    /// Deskewing costs a few seconds per page; clean digital PDFs rarely
    /// need it.
    pub deskew: bool,

    /// Inference backend handed to the engine. Default: [`Backend::Onnx`].
    pub backend: Backend,

    /// Rendering DPI used when rasterising each page. Range: 72–600. Default: 300.
    ///
    /// Staff-line detection degrades quickly below 200 DPI.
    pub dpi: u32,

    /// Optional cap on the rendered width and height in pixels. Default: none.
    pub max_rendered_pixels: Option<u32>,

    /// Number of pages recognised at the same time. Default: logical CPU count.
    ///
    /// Each engine process holds its models in memory, so lower this on
    /// machines with little RAM.
    pub concurrency: usize,

    /// Maximum retries of a page after a transient failure. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per retry. Default: 500.
    pub retry_backoff_ms: u64,

    /// Re-fetch model checkpoints even when cached (once per run). Default: false.
    pub force_redownload_models: bool,

    /// Checkpoint cache directory. Default: `PDF2MUSE_CHECKPOINT_DIR` or the
    /// platform cache dir.
    pub model_dir: Option<PathBuf>,

    /// Ask the engine to keep its intermediate predictions. Default: false.
    pub save_cache: bool,

    /// Executable used by the default engine. Default: `oemer`.
    pub engine_command: String,

    /// Bound on opening and rasterising the PDF, in seconds. Default: 300.
    pub render_timeout_secs: u64,

    /// Bound on one engine invocation, in seconds. Default: 600.
    pub recognition_timeout_secs: u64,

    /// Bound on one checkpoint file download, in seconds. Default: 600.
    pub download_timeout_secs: u64,

    /// Bound on the external native converter, in seconds. Default: 120.
    pub export_timeout_secs: u64,

    /// Receives per-page progress events.
    pub progress_callback: Option<ProgressCallback>,

    /// Cancels the run from another task.
    pub cancel: CancelToken,

    /// Injected rasteriser. Default: pdfium.
    pub rasterizer: Option<Arc<dyn PageRasterizer>>,

    /// Injected recognition engine. Default: the `engine_command` subprocess.
    pub engine: Option<Arc<dyn RecognitionEngine>>,

    /// Injected checkpoint cache. Default: one shared handle per cache directory.
    pub checkpoints: Option<Arc<CheckpointCache>>,

    /// Injected native converter. Takes precedence over `native_format`.
    pub native_converter: Option<Arc<dyn NativeConverter>>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            output_stem: "combined".to_string(),
            per_page_output: false,
            native_format: NativeFormat::default(),
            deskew: true,
            backend: Backend::default(),
            dpi: 300,
            max_rendered_pixels: None,
            concurrency: num_cpus::get().max(1),
            max_retries: 2,
            retry_backoff_ms: 500,
            force_redownload_models: false,
            model_dir: None,
            save_cache: false,
            engine_command: "oemer".to_string(),
            render_timeout_secs: 300,
            recognition_timeout_secs: 600,
            download_timeout_secs: 600,
            export_timeout_secs: 120,
            progress_callback: None,
            cancel: CancelToken::new(),
            rasterizer: None,
            engine: None,
            checkpoints: None,
            native_converter: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("output_dir", &self.output_dir)
            .field("output_stem", &self.output_stem)
            .field("per_page_output", &self.per_page_output)
            .field("native_format", &self.native_format)
            .field("deskew", &self.deskew)
            .field("backend", &self.backend)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("force_redownload_models", &self.force_redownload_models)
            .field("model_dir", &self.model_dir)
            .field("engine_command", &self.engine_command)
            .field("rasterizer", &self.rasterizer.as_ref().map(|_| "<dyn PageRasterizer>"))
            .field("engine", &self.engine.as_ref().map(|e| e.name().to_string()))
            .field("checkpoints", &self.checkpoints.as_ref().map(|c| c.root().to_path_buf()))
            .field(
                "native_converter",
                &self.native_converter.as_ref().map(|c| c.name().to_string()),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check constraints that field assignment alone cannot enforce.
    ///
    /// The builder calls this; the orchestrator calls it again so configs
    /// assembled by struct literal are held to the same rules.
    pub fn validate(&self) -> Result<(), Pdf2MuseError> {
        if !(MIN_DPI..=MAX_DPI).contains(&self.dpi) {
            return Err(Pdf2MuseError::InvalidConfig(format!(
                "DPI must be {MIN_DPI}–{MAX_DPI}, got {}",
                self.dpi
            )));
        }
        if self.concurrency == 0 {
            return Err(Pdf2MuseError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if self.output_stem.trim().is_empty()
            || self.output_stem.contains(['/', '\\'])
        {
            return Err(Pdf2MuseError::InvalidConfig(format!(
                "Output stem must be a plain file name, got '{}'",
                self.output_stem
            )));
        }
        if self.engine.is_none() && self.engine_command.trim().is_empty() {
            return Err(Pdf2MuseError::InvalidConfig(
                "Engine command must not be empty".into(),
            ));
        }
        if let NativeFormat::MuseScoreCli { executable } = &self.native_format {
            if executable.trim().is_empty() {
                return Err(Pdf2MuseError::InvalidConfig(
                    "MuseScore executable must not be empty".into(),
                ));
            }
        }
        for (name, secs) in [
            ("render", self.render_timeout_secs),
            ("recognition", self.recognition_timeout_secs),
            ("download", self.download_timeout_secs),
            ("export", self.export_timeout_secs),
        ] {
            if secs == 0 {
                return Err(Pdf2MuseError::InvalidConfig(format!(
                    "{name} timeout must be at least one second"
                )));
            }
        }
        Ok(())
    }

    /// The per-invocation settings handed to the recognition engine.
    pub fn recognition_options(&self) -> RecognitionOptions {
        RecognitionOptions {
            deskew: self.deskew,
            backend: self.backend,
            save_cache: self.save_cache,
            model_dir: self.model_dir.clone(),
            force_redownload: self.force_redownload_models,
            timeout: Duration::from_secs(self.recognition_timeout_secs),
        }
    }

    /// Upper bound on the wall time of one page, retries included.
    ///
    /// The orchestrator abandons a page task that outlives this.
    pub fn page_deadline(&self) -> Duration {
        let attempts = u64::from(self.max_retries) + 1;
        let backoff: u64 = (0..self.max_retries)
            .map(|n| self.retry_backoff_ms.saturating_mul(1u64 << n.min(20)))
            .fold(0u64, u64::saturating_add);
        Duration::from_secs(self.recognition_timeout_secs.saturating_mul(attempts))
            + Duration::from_millis(backoff)
            + Duration::from_secs(self.download_timeout_secs)
    }

    /// Snapshot of the settings that shaped a run, for its report.
    pub fn settings(&self) -> RunSettings {
        RunSettings {
            output_dir: self.output_dir.clone(),
            output_stem: self.output_stem.clone(),
            dpi: self.dpi,
            deskew: self.deskew,
            backend: self.backend,
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            per_page_output: self.per_page_output,
            native_format: self.native_format.clone(),
        }
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn output_stem(mut self, stem: impl Into<String>) -> Self {
        self.config.output_stem = stem.into();
        self
    }

    pub fn per_page_output(mut self, v: bool) -> Self {
        self.config.per_page_output = v;
        self
    }

    pub fn native_format(mut self, format: NativeFormat) -> Self {
        self.config.native_format = format;
        self
    }

    pub fn deskew(mut self, v: bool) -> Self {
        self.config.deskew = v;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(MIN_DPI, MAX_DPI);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = Some(px.max(100));
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn force_redownload_models(mut self, v: bool) -> Self {
        self.config.force_redownload_models = v;
        self
    }

    pub fn model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.model_dir = Some(dir.into());
        self
    }

    pub fn save_cache(mut self, v: bool) -> Self {
        self.config.save_cache = v;
        self
    }

    pub fn engine_command(mut self, command: impl Into<String>) -> Self {
        self.config.engine_command = command.into();
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render_timeout_secs = secs;
        self
    }

    pub fn recognition_timeout_secs(mut self, secs: u64) -> Self {
        self.config.recognition_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn export_timeout_secs(mut self, secs: u64) -> Self {
        self.config.export_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.config.progress_callback = Some(callback);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.config.cancel = token;
        self
    }

    pub fn rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.config.rasterizer = Some(rasterizer);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn RecognitionEngine>) -> Self {
        self.config.engine = Some(engine);
        self
    }

    pub fn checkpoints(mut self, cache: Arc<CheckpointCache>) -> Self {
        self.config.checkpoints = Some(cache);
        self
    }

    pub fn native_converter(mut self, converter: Arc<dyn NativeConverter>) -> Self {
        self.config.native_converter = Some(converter);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Pdf2MuseError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Inference backend the recognition engine should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Portable ONNX runtime models. (default)
    #[default]
    Onnx,
    /// The engine's native deep-learning framework (TensorFlow for oemer).
    NativeFramework,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Onnx => "onnx",
            Backend::NativeFramework => "native",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Native score format written alongside the MusicXML.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NativeFormat {
    /// MusicXML only.
    None,
    /// Wrap the merged parts in a MuseScore 4 `.mscx` document in-process. (default)
    #[default]
    MscxWrapper,
    /// Let a local MuseScore installation convert the MusicXML.
    MuseScoreCli { executable: String },
}

/// The settings a run was started with, kept on its report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub output_dir: PathBuf,
    pub output_stem: String,
    pub dpi: u32,
    pub deskew: bool,
    pub backend: Backend,
    pub concurrency: usize,
    pub max_retries: u32,
    pub per_page_output: bool,
    pub native_format: NativeFormat,
}
