//! # omr-checkpoints
//!
//! Download and cache the [oemer](https://github.com/BreezeWhite/oemer) model
//! checkpoints at runtime, so that the first conversion on a fresh machine
//! does not need a manual setup step.
//!
//! ## How it works
//!
//! On the first call to [`CheckpointCache::ensure_ready`]:
//!
//! 1. Checks the cache directory for every required checkpoint file.
//! 2. If any is absent, downloads it from the oemer `checkpoints` release.
//! 3. Writes each file to `<name>.part` and renames it into place, so an
//!    interrupted download never leaves a truncated checkpoint behind.
//!
//! Subsequent calls on the same handle skip the disk check entirely.
//!
//! ## One guard per cache directory
//!
//! A [`CheckpointCache`] is a handle on one directory. It owns a single mutex
//! that every caller acquires before checking or downloading, so when several
//! workers hit an empty cache at the same moment exactly one of them
//! downloads and the rest wait and then observe the ready state. Share the
//! handle as `Arc<CheckpointCache>`; do not build one per worker.
//!
//! ```rust,no_run
//! use omr_checkpoints::CheckpointCache;
//! use std::sync::Arc;
//!
//! let cache = Arc::new(CheckpointCache::at_default_location());
//! let dir = cache.ensure_ready(false, Some(&|file: &str, done: u64, total: Option<u64>| {
//!     if let Some(t) = total {
//!         eprint!("\r{file}: {done}/{t} bytes");
//!     }
//! })).expect("checkpoints unavailable");
//! println!("checkpoints in {}", dir.display());
//! ```
//!
//! ## Environment variable overrides
//!
//! - `PDF2MUSE_CHECKPOINT_DIR`: use this directory instead of the platform
//!   cache directory.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

// ── Public constants ─────────────────────────────────────────────────────────

/// Release URL hosting the oemer checkpoint assets.
pub const CHECKPOINT_RELEASE_URL: &str =
    "https://github.com/BreezeWhite/oemer/releases/download/checkpoints";

/// Environment variable that overrides the default cache directory.
pub const CACHE_DIR_ENV: &str = "PDF2MUSE_CHECKPOINT_DIR";

/// One file of the checkpoint set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointFile {
    /// Sub-directory of the cache, e.g. `unet_big`.
    pub group: &'static str,
    /// Asset name in the release, e.g. `1st_model.onnx`.
    pub remote_name: &'static str,
    /// Name on disk inside `group`, e.g. `model.onnx`.
    pub local_name: &'static str,
    /// Whether recognition cannot start without this file.
    pub required: bool,
}

impl CheckpointFile {
    /// Path of this file relative to the cache root.
    pub fn relative_path(&self) -> PathBuf {
        Path::new(self.group).join(self.local_name)
    }
}

/// The checkpoint layout oemer loads from its `checkpoints/` directory.
///
/// The ONNX graphs are required; the `.h5` weights are only read by the
/// TensorFlow backend, so they are fetched but not checked for readiness.
pub const OEMER_CHECKPOINTS: &[CheckpointFile] = &[
    CheckpointFile {
        group: "unet_big",
        remote_name: "1st_model.onnx",
        local_name: "model.onnx",
        required: true,
    },
    CheckpointFile {
        group: "unet_big",
        remote_name: "1st_weights.h5",
        local_name: "weights.h5",
        required: false,
    },
    CheckpointFile {
        group: "seg_net",
        remote_name: "2nd_model.onnx",
        local_name: "model.onnx",
        required: true,
    },
    CheckpointFile {
        group: "seg_net",
        remote_name: "2nd_weights.h5",
        local_name: "weights.h5",
        required: false,
    },
];

/// Progress callback: `(file_name, bytes_downloaded, total_bytes)`.
pub type ProgressFn<'a> = &'a dyn Fn(&str, u64, Option<u64>);

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned by checkpoint cache operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Could not create or navigate the local cache directory.
    #[error("Checkpoint cache directory '{path}' is unusable: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Network download failed.
    #[error("Download of '{file}' failed: {reason}")]
    Download { file: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download of '{file}' timed out after {secs}s")]
    Timeout { file: String, secs: u64 },

    /// Writing the downloaded bytes into the cache failed.
    #[error("Failed to write checkpoint '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every attempt for a file failed.
    #[error("Giving up on '{file}' after {attempts} attempts: {last_error}")]
    Exhausted {
        file: String,
        attempts: u32,
        last_error: String,
    },
}

impl CheckpointError {
    /// Whether another attempt at the same download could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CheckpointError::Download { .. } | CheckpointError::Timeout { .. }
        )
    }
}

// ── Fetching ─────────────────────────────────────────────────────────────────

/// Transport used to fetch one checkpoint asset into a local file.
///
/// The default is [`HttpFetcher`]; tests substitute an in-memory fetcher.
pub trait CheckpointFetcher: Send + Sync {
    /// Fetch `url` into `dest`, returning the number of bytes written.
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        on_progress: Option<&dyn Fn(u64, Option<u64>)>,
    ) -> Result<u64, CheckpointError>;
}

/// Blocking HTTP fetcher built on `reqwest`.
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl CheckpointFetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        on_progress: Option<&dyn Fn(u64, Option<u64>)>,
    ) -> Result<u64, CheckpointError> {
        let secs = self.timeout.as_secs();
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("omr-checkpoints/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(self.timeout)
            .build()
            .map_err(|e| CheckpointError::Download {
                file: url.to_string(),
                reason: e.to_string(),
            })?;

        let mut response = client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                CheckpointError::Timeout {
                    file: url.to_string(),
                    secs,
                }
            } else {
                CheckpointError::Download {
                    file: url.to_string(),
                    reason: format!("GET {url}: {e}"),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(CheckpointError::Download {
                file: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let total = response.content_length();
        let mut out = File::create(dest).map_err(|e| CheckpointError::Write {
            path: dest.to_path_buf(),
            source: e,
        })?;

        let mut chunk = vec![0u8; 64 * 1024]; // 64 KiB
        let mut downloaded: u64 = 0;

        loop {
            match response.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    out.write_all(&chunk[..n])
                        .map_err(|e| CheckpointError::Write {
                            path: dest.to_path_buf(),
                            source: e,
                        })?;
                    downloaded += n as u64;
                    if let Some(cb) = on_progress {
                        cb(downloaded, total);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(CheckpointError::Timeout {
                        file: url.to_string(),
                        secs,
                    });
                }
                Err(e) => {
                    return Err(CheckpointError::Download {
                        file: url.to_string(),
                        reason: format!("Read error: {e}"),
                    });
                }
            }
        }

        out.flush().map_err(|e| CheckpointError::Write {
            path: dest.to_path_buf(),
            source: e,
        })?;

        Ok(downloaded)
    }
}

// ── Cache directory resolution ───────────────────────────────────────────────

/// Returns the default checkpoint cache directory.
///
/// Default locations:
/// - **macOS**: `~/Library/Caches/pdf2muse/checkpoints/`
/// - **Linux**: `~/.cache/pdf2muse/checkpoints/`
/// - **Windows**: `%LOCALAPPDATA%\pdf2muse\checkpoints\`
///
/// Override by setting `PDF2MUSE_CHECKPOINT_DIR`.
pub fn default_cache_dir() -> PathBuf {
    if let Ok(override_dir) = std::env::var(CACHE_DIR_ENV) {
        if !override_dir.is_empty() {
            return PathBuf::from(override_dir);
        }
    }

    let base = dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(std::env::temp_dir);

    base.join("pdf2muse").join("checkpoints")
}

// ── The cache handle ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GuardState {
    /// Required files were confirmed present by this handle.
    verified: bool,
    /// A forced refresh already ran on this handle.
    forced: bool,
    /// Download passes started by this handle.
    download_passes: u32,
    /// Individual file fetches attempted by this handle.
    fetch_attempts: u32,
}

/// Handle on one checkpoint cache directory.
pub struct CheckpointCache {
    root: PathBuf,
    base_url: String,
    files: Vec<CheckpointFile>,
    fetcher: Box<dyn CheckpointFetcher>,
    max_attempts: u32,
    retry_backoff: Duration,
    guard: Mutex<GuardState>,
}

impl std::fmt::Debug for CheckpointCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointCache")
            .field("root", &self.root)
            .field("base_url", &self.base_url)
            .field("files", &self.files.len())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl CheckpointCache {
    /// A cache rooted at `root` that downloads the oemer checkpoints over HTTP.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::builder(root).build()
    }

    /// A cache at [`default_cache_dir`].
    pub fn at_default_location() -> Self {
        Self::new(default_cache_dir())
    }

    pub fn builder(root: impl Into<PathBuf>) -> CheckpointCacheBuilder {
        CheckpointCacheBuilder {
            root: root.into(),
            base_url: CHECKPOINT_RELEASE_URL.to_string(),
            files: OEMER_CHECKPOINTS.to_vec(),
            fetcher: None,
            timeout: Duration::from_secs(600),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1000),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Required files that are not on disk yet.
    pub fn missing_files(&self) -> Vec<CheckpointFile> {
        self.files
            .iter()
            .filter(|f| f.required && !self.root.join(f.relative_path()).exists())
            .copied()
            .collect()
    }

    /// Returns `true` if every required checkpoint is on disk.
    pub fn is_ready(&self) -> bool {
        self.missing_files().is_empty()
    }

    /// Number of download passes this handle has started.
    pub fn download_passes(&self) -> u32 {
        self.lock().download_passes
    }

    /// Number of individual file fetches this handle has attempted.
    pub fn fetch_attempts(&self) -> u32 {
        self.lock().fetch_attempts
    }

    /// Ensures every required checkpoint is present, downloading if needed.
    ///
    /// With `force`, every file is fetched again the first time this handle
    /// is asked to; later forced calls on the same handle reuse that refresh.
    ///
    /// # Thread safety
    ///
    /// Callers serialise on the handle's guard, so concurrent first use
    /// downloads once.
    pub fn ensure_ready(
        &self,
        force: bool,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<PathBuf, CheckpointError> {
        let mut state = self.lock();

        let refresh = force && !state.forced;
        if state.verified && !refresh {
            return Ok(self.root.clone());
        }

        if !refresh && self.is_ready() {
            debug!("All checkpoints present in {}", self.root.display());
            state.verified = true;
            return Ok(self.root.clone());
        }

        let pending: Vec<CheckpointFile> = if refresh {
            self.files.clone()
        } else {
            self.files
                .iter()
                .filter(|f| !self.root.join(f.relative_path()).exists())
                .copied()
                .collect()
        };

        info!(
            "Downloading {} checkpoint file(s) into {}",
            pending.len(),
            self.root.display()
        );
        state.download_passes += 1;

        for file in &pending {
            self.download_with_retry(file, &mut state, on_progress)?;
        }

        if refresh {
            state.forced = true;
        }
        state.verified = true;
        Ok(self.root.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        // A panic in a progress callback must not wedge every later caller.
        self.guard.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn download_with_retry(
        &self,
        file: &CheckpointFile,
        state: &mut GuardState,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<(), CheckpointError> {
        let mut last_err: Option<CheckpointError> = None;

        for attempt in 0..self.max_attempts.max(1) {
            if attempt > 0 {
                let backoff = self.retry_backoff * 2u32.pow(attempt - 1);
                warn!(
                    "{}: retry {}/{} after {:?}",
                    file.remote_name,
                    attempt,
                    self.max_attempts - 1,
                    backoff
                );
                std::thread::sleep(backoff);
            }

            state.fetch_attempts += 1;
            match self.download_once(file, on_progress) {
                Ok(bytes) => {
                    info!("Downloaded {} ({} bytes)", file.remote_name, bytes);
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    warn!("{}: attempt {} failed: {}", file.remote_name, attempt + 1, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(CheckpointError::Exhausted {
            file: file.remote_name.to_string(),
            attempts: self.max_attempts.max(1),
            last_error: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    fn download_once(
        &self,
        file: &CheckpointFile,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, CheckpointError> {
        let dir = self.root.join(file.group);
        std::fs::create_dir_all(&dir).map_err(|e| CheckpointError::CacheDir {
            path: dir.clone(),
            source: e,
        })?;

        let final_path = dir.join(file.local_name);
        let part_path = dir.join(format!("{}.part", file.local_name));
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), file.remote_name);

        let forward = |done: u64, total: Option<u64>| {
            if let Some(cb) = on_progress {
                cb(file.remote_name, done, total);
            }
        };

        let bytes = match self.fetcher.fetch(&url, &part_path, Some(&forward)) {
            Ok(n) => n,
            Err(e) => {
                let _ = std::fs::remove_file(&part_path);
                return Err(e);
            }
        };

        std::fs::rename(&part_path, &final_path).map_err(|e| CheckpointError::Write {
            path: final_path.clone(),
            source: e,
        })?;

        Ok(bytes)
    }
}

/// Builder for [`CheckpointCache`].
pub struct CheckpointCacheBuilder {
    root: PathBuf,
    base_url: String,
    files: Vec<CheckpointFile>,
    fetcher: Option<Box<dyn CheckpointFetcher>>,
    timeout: Duration,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl CheckpointCacheBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn files(mut self, files: &[CheckpointFile]) -> Self {
        self.files = files.to_vec();
        self
    }

    pub fn fetcher(mut self, fetcher: impl CheckpointFetcher + 'static) -> Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    /// Per-file download timeout. Ignored when a custom fetcher is set.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn build(self) -> CheckpointCache {
        let timeout = self.timeout;
        CheckpointCache {
            root: self.root,
            base_url: self.base_url,
            files: self.files,
            fetcher: self
                .fetcher
                .unwrap_or_else(|| Box::new(HttpFetcher::new(timeout))),
            max_attempts: self.max_attempts,
            retry_backoff: self.retry_backoff,
            guard: Mutex::new(GuardState::default()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
