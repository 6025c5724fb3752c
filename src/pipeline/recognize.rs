//! Optical music recognition of a single page image.
//!
//! [`RecognitionEngine`] is the seam to the OMR engine. The default
//! [`OemerEngine`] runs the `oemer` command line tool as a subprocess, one
//! process per page, with its own output directory so concurrent pages never
//! share files. [`RecognitionInvoker`] wraps an engine with the model
//! checkpoint check, failure classification and fragment parsing, and turns
//! every outcome into a [`RecognitionResult`]. It never retries; that is the
//! page processor's job.
//!
//! ## Failure classification
//!
//! | Engine outcome | Kind |
//! |----------------|------|
//! | killed by a signal, out of memory, `EAGAIN` | transient |
//! | timed out | timeout |
//! | exited non-zero for any other reason, no output, unparsable output, no notation | deterministic |
//! | checkpoints missing and not downloadable | model unavailable |
//!
//! ## Checkpoints
//!
//! oemer only loads models from the `checkpoints/` folder of its own package.
//! [`OemerEngine::checkpoint_dir`] asks the engine's interpreter where that
//! is, and the run's cache defaults to it. When the cache lives elsewhere
//! (`model_dir`), the cached files are linked into the engine's folder before
//! the first invocation, and the directory is passed to the engine process as
//! `PDF2MUSE_CHECKPOINT_DIR`.

use std::path::{Path, PathBuf};
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::{Lazy, OnceCell};
use omr_checkpoints::{CheckpointCache, CACHE_DIR_ENV, OEMER_CHECKPOINTS};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Backend;
use crate::error::{FailureKind, ModelDownloadError, RecognitionFailure};
use crate::notation::NotationFragment;
use crate::output::RecognitionResult;
use crate::pipeline::render::PageImage;
use crate::progress::ProgressCallback;

/// Engine stderr phrases that indicate resource exhaustion rather than a bad page.
static TRANSIENT_STDERR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(MemoryError|out of memory|ResourceExhausted|Cannot allocate memory|Resource temporarily unavailable|std::bad_alloc)",
    )
    .expect("static regex")
});

/// Per-invocation engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionOptions {
    pub deskew: bool,
    pub backend: Backend,
    pub save_cache: bool,
    /// Checkpoint cache the engine should load its models from.
    pub model_dir: Option<PathBuf>,
    /// Refresh model checkpoints before the first invocation.
    pub force_redownload: bool,
    /// Bound on one engine invocation.
    pub timeout: Duration,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            deskew: true,
            backend: Backend::Onnx,
            save_cache: false,
            model_dir: None,
            force_redownload: false,
            timeout: Duration::from_secs(600),
        }
    }
}

/// What a successful engine invocation hands back.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub musicxml: String,
    pub output_path: Option<PathBuf>,
}

/// Why an engine invocation failed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine could not be started: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("engine {status}: {stderr}")]
    Exited {
        status: String,
        /// Terminated by a signal rather than exiting.
        signalled: bool,
        stderr: String,
    },

    #[error("engine produced no MusicXML output")]
    NoOutput,

    #[error("engine timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Map an engine failure onto the retry policy's categories.
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Spawn(e) => match e.kind() {
                std::io::ErrorKind::OutOfMemory
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::ResourceBusy
                | std::io::ErrorKind::Interrupted => FailureKind::Transient,
                _ => FailureKind::Deterministic,
            },
            EngineError::Exited {
                signalled, stderr, ..
            } => {
                if *signalled || TRANSIENT_STDERR.is_match(stderr) {
                    FailureKind::Transient
                } else {
                    FailureKind::Deterministic
                }
            }
            EngineError::Timeout(_) => FailureKind::Timeout,
            EngineError::NoOutput | EngineError::Other(_) => FailureKind::Deterministic,
        }
    }
}

/// An OMR engine that turns one page image into MusicXML.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Recognise `image`. `workdir` is a scratch directory owned by the run.
    async fn recognize(
        &self,
        image: &PageImage,
        options: &RecognitionOptions,
        workdir: &Path,
    ) -> Result<EngineOutput, EngineError>;

    /// Directory the engine itself loads checkpoints from, if it has one.
    ///
    /// May block; call it off the async runtime.
    fn checkpoint_dir(&self) -> Option<PathBuf> {
        None
    }
}

/// Asks the oemer package where its checkpoints live.
const CHECKPOINT_DIR_SCRIPT: &str =
    "import os, oemer; print(os.path.join(os.path.dirname(oemer.__file__), 'checkpoints'))";

/// Runs the `oemer` command line tool.
#[derive(Debug, Clone)]
pub struct OemerEngine {
    command: String,
    checkpoint_dir: OnceCell<Option<PathBuf>>,
    /// Engine checkpoint folders already linked to a cache, as `(cache, engine)`.
    linked: Arc<Mutex<HashSet<(PathBuf, PathBuf)>>>,
}

impl OemerEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            checkpoint_dir: OnceCell::new(),
            linked: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Use `dir` as the engine's checkpoint folder instead of asking the
    /// interpreter.
    pub fn with_checkpoint_dir(self, dir: impl Into<PathBuf>) -> Self {
        let _ = self.checkpoint_dir.set(Some(dir.into()));
        self
    }

    /// Interpreter that runs `command`: the script's shebang when it has one,
    /// otherwise the `python3` on `PATH`.
    pub fn interpreter(command: &str) -> PathBuf {
        locate_command(command)
            .and_then(|path| read_shebang(&path))
            .unwrap_or_else(|| PathBuf::from("python3"))
    }

    fn query_checkpoint_dir(&self) -> Option<PathBuf> {
        let python = Self::interpreter(&self.command);
        let output = std::process::Command::new(&python)
            .args(["-c", CHECKPOINT_DIR_SCRIPT])
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(out) if out.status.success() => {
                let dir = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if dir.is_empty() {
                    None
                } else {
                    debug!("{} loads checkpoints from {}", self.command, dir);
                    Some(PathBuf::from(dir))
                }
            }
            Ok(out) => {
                debug!(
                    "{} could not import oemer: {}",
                    python.display(),
                    tail(&String::from_utf8_lossy(&out.stderr), 300)
                );
                None
            }
            Err(e) => {
                debug!("Could not run {}: {e}", python.display());
                None
            }
        }
    }

    /// [`RecognitionEngine::checkpoint_dir`], queried on the blocking pool.
    async fn resolve_checkpoint_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = self.checkpoint_dir.get() {
            return dir.clone();
        }
        let engine = self.clone();
        let found = tokio::task::spawn_blocking(move || engine.query_checkpoint_dir())
            .await
            .ok()
            .flatten();
        self.checkpoint_dir.get_or_init(|| found).clone()
    }

    /// Link the checkpoints cached in `cache` into `engine_dir`, once per pair.
    async fn install_checkpoints(&self, cache: &Path, engine_dir: &Path) {
        let key = (cache.to_path_buf(), engine_dir.to_path_buf());
        let done = self
            .linked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key);
        if done || cache == engine_dir {
            return;
        }
        match link_checkpoints(cache, engine_dir).await {
            Ok(n) => {
                if n > 0 {
                    debug!("Linked {n} checkpoint(s) into {}", engine_dir.display());
                }
                self.linked
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key);
            }
            Err(e) => warn!(
                "Could not link checkpoints into {}: {e}; the engine may fetch its own copy",
                engine_dir.display()
            ),
        }
    }

    /// Arguments for one invocation.
    pub fn args(image: &Path, out_dir: &Path, options: &RecognitionOptions) -> Vec<String> {
        let mut args = vec![
            image.display().to_string(),
            "-o".to_string(),
            out_dir.display().to_string(),
        ];
        if !options.deskew {
            args.push("--without-deskew".to_string());
        }
        if options.backend == Backend::NativeFramework {
            args.push("--use-tf".to_string());
        }
        if options.save_cache {
            args.push("--save-cache".to_string());
        }
        args
    }
}

impl Default for OemerEngine {
    fn default() -> Self {
        Self::new("oemer")
    }
}

#[async_trait]
impl RecognitionEngine for OemerEngine {
    fn name(&self) -> &str {
        &self.command
    }

    async fn recognize(
        &self,
        image: &PageImage,
        options: &RecognitionOptions,
        workdir: &Path,
    ) -> Result<EngineOutput, EngineError> {
        let out_dir = workdir.join(format!("omr_page_{:03}", image.index + 1));
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| EngineError::Other(format!("{}: {e}", out_dir.display())))?;

        let args = Self::args(&image.path, &out_dir, options);
        debug!("Running {} {}", self.command, args.join(" "));

        let mut command = Command::new(&self.command);
        if let Some(ref cache) = options.model_dir {
            if let Some(engine_dir) = self.resolve_checkpoint_dir().await {
                self.install_checkpoints(cache, &engine_dir).await;
            }
            command.env(CACHE_DIR_ENV, cache);
        }

        let child = command
            .args(&args)
            .current_dir(&out_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)?;

        let output = match tokio::time::timeout(options.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| EngineError::Other(e.to_string()))?,
            Err(_) => return Err(EngineError::Timeout(options.timeout.as_secs())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Exited {
                status: output.status.to_string(),
                signalled: output.status.code().is_none(),
                stderr: tail(&stderr, 2000),
            });
        }

        let path = find_musicxml(&out_dir, &image.path)
            .await
            .ok_or(EngineError::NoOutput)?;
        let musicxml = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| EngineError::Other(format!("{}: {e}", path.display())))?;
        Ok(EngineOutput {
            musicxml,
            output_path: Some(path),
        })
    }

    fn checkpoint_dir(&self) -> Option<PathBuf> {
        self.checkpoint_dir
            .get_or_init(|| self.query_checkpoint_dir())
            .clone()
    }
}

/// Full path of `command`, searching `PATH` when it has no directory part.
fn locate_command(command: &str) -> Option<PathBuf> {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let dirs = std::env::var_os("PATH")?;
    std::env::split_paths(&dirs)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

/// Interpreter named by a `#!` line, resolving `/usr/bin/env <name>`.
fn read_shebang(script: &Path) -> Option<PathBuf> {
    let mut head = [0u8; 256];
    let n = std::io::Read::read(&mut std::fs::File::open(script).ok()?, &mut head).ok()?;
    let text = std::str::from_utf8(&head[..n]).ok()?;
    let line = text.strip_prefix("#!")?.lines().next()?.trim();
    let mut words = line.split_whitespace();
    let first = words.next()?;
    if Path::new(first).file_name().is_some_and(|name| name == "env") {
        words.find(|w| !w.starts_with('-')).map(PathBuf::from)
    } else {
        Some(PathBuf::from(first))
    }
}

/// Make every checkpoint present in `cache` visible under `engine_dir`.
///
/// Files the engine already has are left alone. Returns the number of links
/// (or copies, off Unix) created.
async fn link_checkpoints(cache: &Path, engine_dir: &Path) -> std::io::Result<usize> {
    let mut linked = 0;
    for file in OEMER_CHECKPOINTS {
        let source = cache.join(file.relative_path());
        let target = engine_dir.join(file.relative_path());
        if tokio::fs::metadata(&source).await.is_err() || tokio::fs::metadata(&target).await.is_ok() {
            continue;
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        #[cfg(unix)]
        let made = tokio::fs::symlink(&source, &target).await;
        #[cfg(not(unix))]
        let made = tokio::fs::copy(&source, &target).await.map(|_| ());
        match made {
            Ok(()) => linked += 1,
            // Another page got there first.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(linked)
}

/// Locate the engine's output: `<image stem>.musicxml`, else any `.musicxml`.
async fn find_musicxml(out_dir: &Path, image: &Path) -> Option<PathBuf> {
    let stem = image.file_stem()?.to_string_lossy().to_string();
    let expected = out_dir.join(format!("{stem}.musicxml"));
    if tokio::fs::metadata(&expected).await.is_ok() {
        return Some(expected);
    }
    let mut entries = tokio::fs::read_dir(out_dir).await.ok()?;
    let mut found = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("musicxml")) {
            found.push(path);
        }
    }
    found.sort();
    found.into_iter().next()
}

/// Last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &s[start..])
}

/// Run [`CheckpointCache::ensure_ready`] on the blocking pool, forwarding
/// download progress to `progress`.
pub async fn ensure_checkpoints(
    cache: Arc<CheckpointCache>,
    force: bool,
    progress: Option<ProgressCallback>,
) -> Result<PathBuf, ModelDownloadError> {
    let cache_dir = cache.root().to_path_buf();
    let joined = tokio::task::spawn_blocking(move || match progress {
        Some(cb) => {
            let forward = |file: &str, done: u64, total: Option<u64>| {
                cb.on_model_download(file, done, total)
            };
            cache.ensure_ready(force, Some(&forward))
        }
        None => cache.ensure_ready(force, None),
    })
    .await;

    match joined {
        Ok(result) => result.map_err(|source| ModelDownloadError { cache_dir, source }),
        Err(e) => Err(ModelDownloadError {
            cache_dir,
            source: omr_checkpoints::CheckpointError::Download {
                file: "checkpoints".into(),
                reason: format!("download task panicked: {e}"),
            },
        }),
    }
}

/// Invokes the engine for one page and classifies the outcome.
pub struct RecognitionInvoker {
    engine: Arc<dyn RecognitionEngine>,
    checkpoints: Arc<CheckpointCache>,
    workdir: PathBuf,
}

impl RecognitionInvoker {
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        checkpoints: Arc<CheckpointCache>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            checkpoints,
            workdir: workdir.into(),
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Root of the checkpoint cache this invoker prepares.
    pub fn checkpoint_root(&self) -> &Path {
        self.checkpoints.root()
    }

    /// Make sure the model checkpoints are on disk, downloading them if needed.
    ///
    /// Safe to call from many tasks: the cache downloads at most once.
    pub async fn prepare(
        &self,
        force: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, ModelDownloadError> {
        ensure_checkpoints(Arc::clone(&self.checkpoints), force, progress).await
    }

    /// Recognise one page. Never retries.
    pub async fn recognize(&self, image: &PageImage, options: &RecognitionOptions) -> RecognitionResult {
        let start = Instant::now();
        let page = image.index;
        let mut result = self.recognize_inner(image, options).await;
        result.duration_ms = start.elapsed().as_millis() as u64;
        if let Some(f) = result.failure() {
            debug!("Page {}: {} ({:?})", page + 1, f.reason, f.kind);
        }
        result
    }

    async fn recognize_inner(&self, image: &PageImage, options: &RecognitionOptions) -> RecognitionResult {
        let page = image.index;

        if let Err(e) = self.prepare(options.force_redownload, None).await {
            return RecognitionResult::failed(RecognitionFailure::new(
                page,
                FailureKind::ModelUnavailable,
                e.to_string(),
            ));
        }

        let output = match self.engine.recognize(image, options, &self.workdir).await {
            Ok(output) => output,
            Err(e) => {
                let kind = e.kind();
                if kind == FailureKind::Transient {
                    warn!("Page {}: transient engine failure: {e}", page + 1);
                }
                return RecognitionResult::failed(RecognitionFailure::new(page, kind, e.to_string()));
            }
        };

        match NotationFragment::parse(&output.musicxml) {
            Ok(fragment) if fragment.has_notation() => {
                debug!(
                    "Page {}: {} parts, {} measures, {} notes",
                    page + 1,
                    fragment.parts.len(),
                    fragment.measure_count(),
                    fragment.note_count()
                );
                RecognitionResult::recognized(page, fragment)
            }
            Ok(_) => RecognitionResult::failed(RecognitionFailure::new(
                page,
                FailureKind::Deterministic,
                "no notation detected",
            )),
            Err(e) => RecognitionResult::failed(RecognitionFailure::new(
                page,
                FailureKind::Deterministic,
                format!("unparsable engine output: {e}"),
            )),
        }
    }
}
