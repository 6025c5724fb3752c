//! Per-page processing: recognition with retry, then cleanup.
//!
//! ## Retry Strategy
//!
//! Only [`FailureKind::Transient`] failures are retried: an engine that ran
//! out of memory while other pages were being recognised often succeeds
//! once they finish. Exponential backoff (`retry_backoff_ms * 2^(n-1)` before
//! retry `n`) gives the machine time to recover. Deterministic failures and
//! timeouts are final on the first attempt; a blank page stays blank.
//!
//! The page image is released after the last attempt whatever the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::RecognitionFailure;
use crate::output::RecognitionResult;
use crate::pipeline::recognize::{RecognitionInvoker, RecognitionOptions};
use crate::pipeline::render::PageImage;
use crate::progress::ProgressCallback;

/// Drives one page through the invoker under the run's retry policy.
pub struct PageProcessor {
    invoker: Arc<RecognitionInvoker>,
    max_retries: u32,
    retry_backoff_ms: u64,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
}

impl PageProcessor {
    pub fn new(invoker: Arc<RecognitionInvoker>, max_retries: u32, retry_backoff_ms: u64) -> Self {
        Self {
            invoker,
            max_retries,
            retry_backoff_ms,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Delay before attempt number `attempt` (1-based; the first retry is attempt 2).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(2).min(20);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << exp))
    }

    /// Recognise `image`, retrying transient failures, then release it.
    pub async fn process(&self, image: PageImage, options: &RecognitionOptions) -> RecognitionResult {
        let start = Instant::now();
        let page = image.index;
        let max_attempts = self.max_retries + 1;

        let mut attempts = 0;
        let mut result = RecognitionResult::failed(RecognitionFailure::cancelled(page));

        while attempts < max_attempts {
            if self.cancel.is_cancelled() {
                result = RecognitionResult::failed(RecognitionFailure::cancelled(page));
                break;
            }

            if attempts > 0 {
                let delay = self.backoff(attempts + 1);
                warn!(
                    "Page {}: retry {}/{} after {}ms",
                    page + 1,
                    attempts,
                    self.max_retries,
                    delay.as_millis()
                );
                if let (Some(cb), Some(f)) = (&self.progress, result.failure()) {
                    cb.on_page_retry(page, attempts + 1, &f.reason);
                }
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.cancel.cancelled() => {
                        result = RecognitionResult::failed(RecognitionFailure::cancelled(page));
                        break;
                    }
                }
            }

            attempts += 1;
            result = tokio::select! {
                r = self.invoker.recognize(&image, options) => r,
                _ = self.cancel.cancelled() => {
                    RecognitionResult::failed(RecognitionFailure::cancelled(page))
                }
            };

            match result.failure() {
                None => break,
                Some(f) if f.kind.is_retryable() => {
                    debug!("Page {}: attempt {} failed transiently: {}", page + 1, attempts, f.reason);
                }
                Some(_) => break,
            }
        }

        image.release();
        result.attempts = attempts;
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::notation::tests::page_xml;
    use crate::pipeline::recognize::{EngineError, EngineOutput, RecognitionEngine};
    use async_trait::async_trait;
    use omr_checkpoints::CheckpointCache;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with `error` for the first `failures` calls, then succeeds.
    struct FlakyEngine {
        failures: u32,
        error: fn() -> EngineError,
        calls: AtomicU32,
        delay: Duration,
    }

    #[async_trait]
    impl RecognitionEngine for FlakyEngine {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn recognize(
            &self,
            _image: &PageImage,
            _options: &RecognitionOptions,
            _workdir: &Path,
        ) -> Result<EngineOutput, EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if n < self.failures {
                Err((self.error)())
            } else {
                Ok(EngineOutput {
                    musicxml: page_xml(&[("P1", 1)]),
                    output_path: None,
                })
            }
        }
    }

    fn oom() -> EngineError {
        EngineError::Exited {
            status: "exit status: 1".into(),
            signalled: false,
            stderr: "MemoryError".into(),
        }
    }

    fn crash() -> EngineError {
        EngineError::Exited {
            status: "exit status: 1".into(),
            signalled: false,
            stderr: "IndexError".into(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Arc<FlakyEngine>,
        processor: PageProcessor,
        image: PageImage,
    }

    fn fixture(failures: u32, error: fn() -> EngineError, max_retries: u32, delay: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        for file in omr_checkpoints::OEMER_CHECKPOINTS {
            let path = models.join(file.relative_path());
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"w").unwrap();
        }
        let engine = Arc::new(FlakyEngine {
            failures,
            error,
            calls: AtomicU32::new(0),
            delay,
        });
        let invoker = Arc::new(RecognitionInvoker::new(
            engine.clone(),
            Arc::new(CheckpointCache::new(models)),
            dir.path(),
        ));
        let image_path: PathBuf = dir.path().join("page_001.png");
        std::fs::write(&image_path, b"png").unwrap();
        Fixture {
            processor: PageProcessor::new(invoker, max_retries, 1),
            image: PageImage {
                index: 0,
                path: image_path,
                dpi: 300,
                width: 1,
                height: 1,
            },
            engine,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_success() {
        let fx = fixture(1, oom, 2, Duration::ZERO);
        let path = fx.image.path.clone();
        let result = fx.processor.process(fx.image, &RecognitionOptions::default()).await;
        assert!(result.is_recognized());
        assert_eq!(result.attempts, 2);
        assert_eq!(fx.engine.calls.load(Ordering::SeqCst), 2);
        assert!(!path.exists(), "page image must be released");
    }

    #[tokio::test]
    async fn transient_failures_stop_at_max_retries() {
        let fx = fixture(10, oom, 2, Duration::ZERO);
        let result = fx.processor.process(fx.image, &RecognitionOptions::default()).await;
        assert_eq!(result.failure().unwrap().kind, FailureKind::Transient);
        assert_eq!(result.attempts, 3);
        assert_eq!(fx.engine.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deterministic_failure_is_not_retried() {
        let fx = fixture(10, crash, 5, Duration::ZERO);
        let path = fx.image.path.clone();
        let result = fx.processor.process(fx.image, &RecognitionOptions::default()).await;
        assert_eq!(result.failure().unwrap().kind, FailureKind::Deterministic);
        assert_eq!(result.attempts, 1);
        assert!(!path.exists(), "page image must be released on failure too");
    }

    #[tokio::test]
    async fn timeout_is_not_retried() {
        let fx = fixture(10, || EngineError::Timeout(1), 3, Duration::ZERO);
        let result = fx.processor.process(fx.image, &RecognitionOptions::default()).await;
        assert_eq!(result.failure().unwrap().kind, FailureKind::Timeout);
        assert_eq!(fx.engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_invokes_engine() {
        let fx = fixture(0, oom, 2, Duration::ZERO);
        let token = CancelToken::new();
        token.cancel();
        let processor = fx.processor.with_cancel(token);
        let result = processor.process(fx.image, &RecognitionOptions::default()).await;
        assert_eq!(result.failure().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(result.attempts, 0);
        assert_eq!(fx.engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_interrupts_running_attempt() {
        let fx = fixture(0, oom, 0, Duration::from_secs(30));
        let token = CancelToken::new();
        let processor = fx.processor.with_cancel(token.clone());
        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            processor.process(fx.image, &RecognitionOptions::default()),
        )
        .await
        .expect("cancel must interrupt the engine");
        canceller.await.unwrap();
        assert_eq!(result.failure().unwrap().kind, FailureKind::Cancelled);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let fx = fixture(0, oom, 3, Duration::ZERO);
        let p = PageProcessor::new(fx.processor.invoker.clone(), 3, 500);
        assert_eq!(p.backoff(2), Duration::from_millis(500));
        assert_eq!(p.backoff(3), Duration::from_millis(1000));
        assert_eq!(p.backoff(4), Duration::from_millis(2000));
    }
}
