//! Progress-callback trait for per-page recognition events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as the pipeline downloads models and recognises each page.
//!
//! The trait is `Send + Sync` because pages are recognised concurrently on
//! spawned tasks, and checkpoint download events arrive from a blocking
//! worker thread.
//!
//! # Example
//!
//! ```rust
//! use pdf2muse::{ConversionProgressCallback, ConversionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: Arc<AtomicUsize>,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_index: usize, total_pages: usize, measures: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {}/{} done ({} measures)", page_index + 1, total_pages, measures);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     completed: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the conversion pipeline as it works through a document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Page events may be delivered concurrently and in
/// completion order, not page order; every `page_index` is zero-based.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called while model checkpoints are being fetched.
    ///
    /// `total` is `None` when the server does not announce a length.
    fn on_model_download(&self, file: &str, downloaded: u64, total: Option<u64>) {
        let _ = (file, downloaded, total);
    }

    /// Called once after rasterisation, before any page is recognised.
    fn on_conversion_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called just before a page is handed to the recognition engine.
    fn on_page_start(&self, page_index: usize, total_pages: usize) {
        let _ = (page_index, total_pages);
    }

    /// Called before a transient failure is retried.
    ///
    /// `attempt` is the number of the attempt about to start (2 for the first retry).
    fn on_page_retry(&self, page_index: usize, attempt: u32, reason: &str) {
        let _ = (page_index, attempt, reason);
    }

    /// Called when a page produced notation.
    fn on_page_complete(&self, page_index: usize, total_pages: usize, measures: usize) {
        let _ = (page_index, total_pages, measures);
    }

    /// Called when a page failed for good (after any retries).
    fn on_page_error(&self, page_index: usize, total_pages: usize, error: &str) {
        let _ = (page_index, total_pages, error);
    }

    /// Called once after every page has been attempted.
    fn on_conversion_complete(&self, total_pages: usize, recognized: usize) {
        let _ = (total_pages, recognized);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
