//! Eager (whole-document) conversion entry points.
//!
//! [`run`] waits for every page, merges, exports and returns the complete
//! [`ConversionRun`]. Use [`crate::stream::recognize_stream`] instead to see
//! page results as they finish.
//!
//! ## Run phases
//!
//! ```text
//! validate ─▶ load ─▶ checkpoints ─▶ rasterise ─▶ pages (concurrent) ─▶ merge ─▶ export
//! ```
//!
//! Everything up to and including rasterisation is fatal. From then on
//! failures are per page and end up as entries in `run.results`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::stream::{self, Stream, StreamExt};
use omr_checkpoints::{default_cache_dir, CheckpointCache, CACHE_DIR_ENV};
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::config::ConversionConfig;
use crate::error::{FailureKind, Pdf2MuseError, RecognitionFailure};
use crate::output::{ConversionRun, RecognitionResult, RunStatus, SourceDocument};
use crate::pipeline::export::{self, NativeConverter};
use crate::pipeline::merge::merge;
use crate::pipeline::process::PageProcessor;
use crate::pipeline::recognize::{ensure_checkpoints, OemerEngine, RecognitionEngine, RecognitionInvoker};
use crate::pipeline::render::{self, PageImage, PageRasterizer, PdfiumRasterizer};
use crate::pipeline::input;
use crate::progress::ProgressCallback;

/// One checkpoint handle per cache directory for the whole process.
static CHECKPOINT_CACHES: Lazy<Mutex<HashMap<PathBuf, Arc<CheckpointCache>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The process-wide handle for the cache rooted at `root`.
pub(crate) fn shared_checkpoints(root: PathBuf, timeout: Duration) -> Arc<CheckpointCache> {
    let mut caches = CHECKPOINT_CACHES
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let cache = caches.entry(root.clone()).or_insert_with(|| {
        debug!("Opening checkpoint cache at {}", root.display());
        Arc::new(CheckpointCache::builder(root).timeout(timeout).build())
    });
    Arc::clone(cache)
}

/// External collaborators of a run: injected through the config or defaulted.
pub(crate) struct Collaborators {
    pub rasterizer: Arc<dyn PageRasterizer>,
    pub engine: Arc<dyn RecognitionEngine>,
    pub checkpoints: Arc<CheckpointCache>,
    pub native: Option<Arc<dyn NativeConverter>>,
}

/// Where the default checkpoint cache lives: `model_dir`, then
/// `PDF2MUSE_CHECKPOINT_DIR`, then the engine's own checkpoint folder, then
/// the platform cache directory.
pub(crate) async fn checkpoint_root(
    config: &ConversionConfig,
    engine: &Arc<dyn RecognitionEngine>,
) -> PathBuf {
    if let Some(ref dir) = config.model_dir {
        return dir.clone();
    }
    if std::env::var_os(CACHE_DIR_ENV).is_some_and(|v| !v.is_empty()) {
        return default_cache_dir();
    }
    let engine = Arc::clone(engine);
    match tokio::task::spawn_blocking(move || engine.checkpoint_dir()).await {
        Ok(Some(dir)) => dir,
        _ => default_cache_dir(),
    }
}

impl Collaborators {
    pub(crate) async fn resolve(config: &ConversionConfig) -> Self {
        let rasterizer = config
            .rasterizer
            .clone()
            .unwrap_or_else(|| Arc::new(PdfiumRasterizer::new(config.max_rendered_pixels)));
        let engine: Arc<dyn RecognitionEngine> = config
            .engine
            .clone()
            .unwrap_or_else(|| Arc::new(OemerEngine::new(config.engine_command.clone())));
        let checkpoints = match config.checkpoints.clone() {
            Some(cache) => cache,
            None => shared_checkpoints(
                checkpoint_root(config, &engine).await,
                Duration::from_secs(config.download_timeout_secs),
            ),
        };
        let native = config.native_converter.clone().or_else(|| {
            export::converter_for(
                &config.native_format,
                Duration::from_secs(config.export_timeout_secs),
            )
        });
        Self {
            rasterizer,
            engine,
            checkpoints,
            native,
        }
    }
}

/// Make the checkpoints available before any page is dispatched.
///
/// A failed download is fatal only when no usable checkpoints are cached.
pub(crate) async fn prepare_models(
    cache: &Arc<CheckpointCache>,
    force: bool,
    progress: Option<ProgressCallback>,
) -> Result<(), Pdf2MuseError> {
    match ensure_checkpoints(Arc::clone(cache), force, progress).await {
        Ok(dir) => {
            debug!("Checkpoints ready in {}", dir.display());
            Ok(())
        }
        Err(e) if cache.is_ready() => {
            warn!("{e}; continuing with the cached checkpoints");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Recognise `images` with bounded concurrency. Results arrive in completion order.
///
/// Each page runs in its own task so a panicking engine only fails that page,
/// and a page that outlives [`ConversionConfig::page_deadline`] is aborted and
/// reported as a timeout.
pub(crate) fn page_stream(
    invoker: Arc<RecognitionInvoker>,
    images: Vec<PageImage>,
    config: &ConversionConfig,
) -> impl Stream<Item = RecognitionResult> + Send + 'static {
    let total = images.len();
    // Checkpoints were prepared (and refreshed, if asked) before dispatch.
    let mut options = config.recognition_options();
    options.force_redownload = false;
    options.model_dir = Some(invoker.checkpoint_root().to_path_buf());
    let options = Arc::new(options);
    let progress = config.progress_callback.clone();
    let processor = Arc::new(
        PageProcessor::new(invoker, config.max_retries, config.retry_backoff_ms)
            .with_cancel(config.cancel.clone())
            .with_progress(progress.clone()),
    );
    let deadline = config.page_deadline();

    stream::iter(images)
        .map(move |image| {
            let processor = Arc::clone(&processor);
            let options = Arc::clone(&options);
            let progress = progress.clone();
            async move {
                let page = image.index;
                if let Some(ref cb) = progress {
                    cb.on_page_start(page, total);
                }

                let mut task = tokio::spawn(async move { processor.process(image, &options).await });
                let result = match tokio::time::timeout(deadline, &mut task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        warn!("Page {}: task failed: {e}", page + 1);
                        RecognitionResult::failed(RecognitionFailure::new(
                            page,
                            FailureKind::Deterministic,
                            format!("page task failed: {e}"),
                        ))
                    }
                    Err(_) => {
                        task.abort();
                        warn!("Page {}: abandoned after {}s", page + 1, deadline.as_secs());
                        RecognitionResult::failed(RecognitionFailure::new(
                            page,
                            FailureKind::Timeout,
                            format!("page exceeded its {}s deadline", deadline.as_secs()),
                        ))
                    }
                };

                if let Some(ref cb) = progress {
                    match result.failure() {
                        None => cb.on_page_complete(
                            page,
                            total,
                            result.fragment().map_or(0, |f| f.measure_count()),
                        ),
                        Some(f) => cb.on_page_error(page, total, &f.to_string()),
                    }
                }
                result
            }
        })
        .buffer_unordered(config.concurrency.max(1))
}

/// Convert a PDF to MusicXML (and the configured native format).
///
/// This is the primary entry point for the library. It never returns an
/// error: fatal problems are recorded as [`RunStatus::Failure`] on the run,
/// next to whatever was done before them. Call
/// [`ConversionRun::into_result`] for `?`-style handling.
///
/// For an N-page document `run.results` holds exactly N entries in page
/// order, one per page, failed or not.
pub async fn run(path: impl AsRef<Path>, config: &ConversionConfig) -> ConversionRun {
    execute(path.as_ref(), config, None, Vec::new()).await
}

/// Synchronous wrapper around [`run`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_sync(path: impl AsRef<Path>, config: &ConversionConfig) -> ConversionRun {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(run(path, config)),
        Err(e) => ConversionRun::new(path.as_ref().to_path_buf(), config.settings()).fail(
            Pdf2MuseError::Internal(format!("Failed to create tokio runtime: {e}")),
        ),
    }
}

/// Re-recognise only the pages that failed in `previous`.
///
/// Pages recognised last time are kept as they are. The score is merged and
/// exported again from the combined results. A previous run that never got
/// as far as loading the document is simply run again.
pub async fn rerun_pages(previous: &ConversionRun, config: &ConversionConfig) -> ConversionRun {
    if previous.source.is_none() {
        return run(&previous.input, config).await;
    }
    let failed = previous.failed_page_indices();
    info!(
        "Re-running {} failed page(s) of {}",
        failed.len(),
        previous.input.display()
    );
    let kept: Vec<RecognitionResult> = previous
        .results
        .iter()
        .filter(|r| r.is_recognized())
        .cloned()
        .collect();
    execute(&previous.input, config, Some(failed), kept).await
}

/// Read the page count and metadata of a PDF without recognising anything.
pub async fn inspect(path: impl AsRef<Path>) -> Result<SourceDocument, Pdf2MuseError> {
    let config = ConversionConfig::default();
    let pdf_path = input::validate_input(path.as_ref())?;
    let rasterizer: Arc<dyn PageRasterizer> =
        Arc::new(PdfiumRasterizer::new(config.max_rendered_pixels));
    let source = render::load_source(
        rasterizer,
        &pdf_path,
        Duration::from_secs(config.render_timeout_secs),
    )
    .await?;
    Ok(source)
}

/// Download the model checkpoints into the configured cache without converting.
///
/// Returns the cache directory.
pub async fn download_models(config: &ConversionConfig) -> Result<PathBuf, Pdf2MuseError> {
    let collaborators = Collaborators::resolve(config).await;
    let dir = ensure_checkpoints(
        collaborators.checkpoints,
        config.force_redownload_models,
        config.progress_callback.clone(),
    )
    .await?;
    info!("Checkpoints ready in {}", dir.display());
    Ok(dir)
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Drive one run over `selection` (all pages when `None`), merging the fresh
/// results with `carried` ones from an earlier run.
async fn execute(
    path: &Path,
    config: &ConversionConfig,
    selection: Option<Vec<usize>>,
    carried: Vec<RecognitionResult>,
) -> ConversionRun {
    let total_start = Instant::now();
    let mut run = ConversionRun::new(path.to_path_buf(), config.settings());
    info!("Starting conversion: {}", path.display());

    if let Err(e) = config.validate() {
        return run.fail(e);
    }

    // ── Step 1: Validate input ───────────────────────────────────────────
    let pdf_path = match input::validate_input(path) {
        Ok(p) => p,
        Err(e) => return run.fail(e.into()),
    };

    // ── Step 2: Collaborators and document ───────────────────────────────
    let collaborators = Collaborators::resolve(config).await;
    let render_timeout = Duration::from_secs(config.render_timeout_secs);
    let source = match render::load_source(
        Arc::clone(&collaborators.rasterizer),
        &pdf_path,
        render_timeout,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => return run.fail(e.into()),
    };
    info!("PDF has {} pages", source.page_count);
    run.source = Some(source.clone());

    let indices: Vec<usize> = match selection {
        Some(pages) => pages.into_iter().filter(|&p| p < source.page_count).collect(),
        None => (0..source.page_count).collect(),
    };
    let carried: Vec<RecognitionResult> = carried
        .into_iter()
        .filter(|r| r.page_index < source.page_count && !indices.contains(&r.page_index))
        .collect();

    // ── Step 3: Workdir, invoker, checkpoints ────────────────────────────
    let workdir = match tempfile::Builder::new().prefix("pdf2muse-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            return run.fail(Pdf2MuseError::Internal(format!(
                "could not create a working directory: {e}"
            )))
        }
    };
    debug!("Working directory: {}", workdir.path().display());

    if !indices.is_empty() {
        if let Err(e) = prepare_models(
            &collaborators.checkpoints,
            config.force_redownload_models,
            config.progress_callback.clone(),
        )
        .await
        {
            return run.fail(e);
        }
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_start(indices.len());
    }

    // ── Step 4: Rasterise ────────────────────────────────────────────────
    let render_start = Instant::now();
    let images = if indices.is_empty() {
        Vec::new()
    } else {
        match render::rasterize(
            Arc::clone(&collaborators.rasterizer),
            &source,
            config.dpi,
            &indices,
            workdir.path(),
            render_timeout,
        )
        .await
        {
            Ok(images) => images,
            Err(e) => return run.fail(e.into()),
        }
    };
    run.stats.render_duration_ms = render_start.elapsed().as_millis() as u64;

    // ── Step 5: Recognise pages ──────────────────────────────────────────
    let recognition_start = Instant::now();
    let invoker = Arc::new(RecognitionInvoker::new(
        Arc::clone(&collaborators.engine),
        Arc::clone(&collaborators.checkpoints),
        workdir.path(),
    ));
    let mut slots: Vec<Option<RecognitionResult>> = vec![None; indices.len()];
    let position: HashMap<usize, usize> = indices.iter().enumerate().map(|(i, &p)| (p, i)).collect();
    let mut pages = page_stream(invoker, images, config);
    while let Some(result) = pages.next().await {
        match position.get(&result.page_index) {
            Some(&slot) => slots[slot] = Some(result),
            None => warn!("Discarding result for unexpected page {}", result.page_index + 1),
        }
    }
    run.stats.recognition_duration_ms = recognition_start.elapsed().as_millis() as u64;

    let mut results: Vec<RecognitionResult> = slots
        .into_iter()
        .zip(&indices)
        .map(|(slot, &page)| {
            slot.unwrap_or_else(|| {
                RecognitionResult::failed(RecognitionFailure::new(
                    page,
                    FailureKind::Deterministic,
                    "page produced no result",
                ))
            })
        })
        .chain(carried)
        .collect();
    results.sort_by_key(|r| r.page_index);
    run.results = results;

    // ── Step 6: Merge and export ─────────────────────────────────────────
    let merged = merge(&run.results);
    let recognized = run.recognized_count();
    let failed_pages = run.failed_page_summaries();
    let total = run.results.len();

    let outcome = if config.cancel.is_cancelled() {
        Err(Pdf2MuseError::Cancelled)
    } else if recognized == 0 {
        let first_error = run
            .failed_pages()
            .first()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "document has no pages".to_string());
        Err(Pdf2MuseError::NoPagesRecognized { total, first_error })
    } else {
        let export_start = Instant::now();
        let exported = export::export(&merged, config, collaborators.native.clone()).await;
        run.stats.export_duration_ms = export_start.elapsed().as_millis() as u64;
        match exported {
            Ok(report) => {
                run.exports = report;
                Ok(())
            }
            Err(e) => {
                run.exports.musicxml_error = Some(e.to_string());
                Err(e.into())
            }
        }
    };

    run.stats.total_pages = source.page_count;
    run.stats.recognized_pages = recognized;
    run.stats.failed_pages = failed_pages.len();
    run.stats.retried_pages = run.results.iter().filter(|r| r.attempts > 1).count();
    run.stats.merged_parts = merged.parts.len();
    run.stats.merged_measures = merged.measure_count();
    run.merged = Some(merged);

    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_complete(total, recognized);
    }

    let mut run = match outcome {
        Err(e) => run.fail(e),
        Ok(()) if failed_pages.is_empty() => {
            run.status = RunStatus::Success;
            run
        }
        Ok(()) => {
            run.status = RunStatus::PartialSuccess {
                recognized,
                total,
                failed_pages,
            };
            run
        }
    };
    run.stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    info!(
        "Conversion finished ({}): {}/{} pages, {}ms total",
        run.status, recognized, total, run.stats.total_duration_ms
    );
    run
}
