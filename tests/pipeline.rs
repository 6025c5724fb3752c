//! Integration tests for the conversion pipeline.
//!
//! Every external collaborator is faked: the rasteriser writes placeholder
//! page files, the engine returns canned MusicXML per page, and checkpoints
//! come from an in-memory fetcher. No pdfium, oemer or network needed.

use async_trait::async_trait;
use futures::StreamExt;
use pdf2muse::pipeline::recognize::RecognitionInvoker;
use pdf2muse::{
    merge, recognize_stream, rerun_pages, run, CancelToken, CheckpointCache, CheckpointError,
    CheckpointFetcher, ConversionConfig, ConversionProgressCallback, DocumentMetadata,
    EngineError, EngineOutput, ExportError, FailedPage, FailureKind, NativeConverter, NativeFormat,
    NotationFragment, PageImage, PageRasterizer, Pdf2MuseError, RasterizationError,
    RecognitionEngine, RecognitionOptions, RunStatus, SourceDocument, OEMER_CHECKPOINTS,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// What the fake engine does with one page.
#[derive(Debug, Clone, Copy)]
enum Page {
    /// One part with this many measures.
    Score(usize),
    /// Two parts with this many measures each.
    Duet(usize),
    /// Valid MusicXML without any measure.
    Blank,
    /// Engine exits with an ordinary error.
    Crash,
    /// Runs out of memory this many times, then succeeds with one measure.
    Flaky(u32),
}

fn page_xml(parts: usize, measures: usize) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<score-partwise version=\"3.0\">\n  <work><work-title>Etude</work-title></work>\n  <part-list>\n",
    );
    for p in 1..=parts {
        xml.push_str(&format!(
            "    <score-part id=\"P{p}\"><part-name>Part {p}</part-name></score-part>\n"
        ));
    }
    xml.push_str("  </part-list>\n");
    for p in 1..=parts {
        xml.push_str(&format!("  <part id=\"P{p}\">\n"));
        for m in 1..=measures {
            xml.push_str(&format!(
                "    <measure number=\"{m}\"><attributes><clef><sign>G</sign><line>2</line></clef></attributes><note><rest/><duration>4</duration></note></measure>\n"
            ));
        }
        xml.push_str("  </part>\n");
    }
    xml.push_str("</score-partwise>\n");
    xml
}

struct FakeEngine {
    pages: Vec<Page>,
    delays_ms: Vec<u64>,
    calls: AtomicUsize,
    calls_per_page: Mutex<HashMap<usize, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    model_dirs: Mutex<Vec<Option<PathBuf>>>,
}

impl FakeEngine {
    fn new(pages: Vec<Page>) -> Arc<Self> {
        let delays = vec![0; pages.len()];
        Self::with_delays(pages, delays)
    }

    fn with_delays(pages: Vec<Page>, delays_ms: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            pages,
            delays_ms,
            calls: AtomicUsize::new(0),
            calls_per_page: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            model_dirs: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecognitionEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake-omr"
    }

    async fn recognize(
        &self,
        image: &PageImage,
        options: &RecognitionOptions,
        _workdir: &Path,
    ) -> Result<EngineOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.model_dirs.lock().unwrap().push(options.model_dir.clone());
        let nth = {
            let mut per_page = self.calls_per_page.lock().unwrap();
            let n = per_page.entry(image.index).or_insert(0);
            *n += 1;
            *n
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays_ms[image.index];
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let xml = match self.pages[image.index] {
            Page::Score(m) => page_xml(1, m),
            Page::Duet(m) => page_xml(2, m),
            Page::Blank => "<score-partwise version=\"3.0\"><part-list/></score-partwise>".to_string(),
            Page::Crash => {
                return Err(EngineError::Exited {
                    status: "exit status: 1".into(),
                    signalled: false,
                    stderr: "IndexError: list index out of range".into(),
                })
            }
            Page::Flaky(failures) if nth <= failures => {
                return Err(EngineError::Exited {
                    status: "exit status: 1".into(),
                    signalled: false,
                    stderr: "MemoryError: Unable to allocate 1.2 GiB".into(),
                })
            }
            Page::Flaky(_) => page_xml(1, 1),
        };
        Ok(EngineOutput {
            musicxml: xml,
            output_path: None,
        })
    }
}

/// Pretends to render: writes a placeholder file per requested page.
struct FakeRasterizer {
    pages: usize,
}

impl PageRasterizer for FakeRasterizer {
    fn load(&self, path: &Path) -> Result<SourceDocument, RasterizationError> {
        Ok(SourceDocument {
            path: path.to_path_buf(),
            page_count: self.pages,
            metadata: DocumentMetadata::default(),
        })
    }

    fn rasterize_pages(
        &self,
        _source: &SourceDocument,
        dpi: u32,
        indices: &[usize],
        workdir: &Path,
    ) -> Result<Vec<PageImage>, RasterizationError> {
        indices
            .iter()
            .map(|&index| {
                let path = workdir.join(format!("page_{:03}.png", index + 1));
                std::fs::write(&path, b"png").map_err(|e| RasterizationError::Io {
                    detail: e.to_string(),
                })?;
                Ok(PageImage {
                    index,
                    path,
                    dpi,
                    width: 2480,
                    height: 3508,
                })
            })
            .collect()
    }
}

/// Serves every checkpoint from memory and counts the fetches.
struct CountingFetcher {
    fetches: Arc<AtomicU32>,
}

impl CheckpointFetcher for CountingFetcher {
    fn fetch(
        &self,
        _url: &str,
        dest: &Path,
        on_progress: Option<&dyn Fn(u64, Option<u64>)>,
    ) -> Result<u64, CheckpointError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(dest, b"weights").map_err(|e| CheckpointError::Write {
            path: dest.to_path_buf(),
            source: e,
        })?;
        if let Some(cb) = on_progress {
            cb(7, Some(7));
        }
        Ok(7)
    }
}

/// A network that is always down.
struct OfflineFetcher {
    fetches: Arc<AtomicU32>,
}

impl CheckpointFetcher for OfflineFetcher {
    fn fetch(
        &self,
        url: &str,
        _dest: &Path,
        _on_progress: Option<&dyn Fn(u64, Option<u64>)>,
    ) -> Result<u64, CheckpointError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Err(CheckpointError::Download {
            file: url.to_string(),
            reason: "connection refused".into(),
        })
    }
}

/// Opens the document but cannot render one of its pages.
struct BrokenRasterizer {
    pages: usize,
    bad_page: usize,
}

impl PageRasterizer for BrokenRasterizer {
    fn load(&self, path: &Path) -> Result<SourceDocument, RasterizationError> {
        FakeRasterizer { pages: self.pages }.load(path)
    }

    fn rasterize_pages(
        &self,
        _source: &SourceDocument,
        _dpi: u32,
        _indices: &[usize],
        _workdir: &Path,
    ) -> Result<Vec<PageImage>, RasterizationError> {
        Err(RasterizationError::PageRender {
            page: self.bad_page,
            detail: "broken content stream".into(),
        })
    }
}

fn write_checkpoints(root: &Path) {
    for file in OEMER_CHECKPOINTS {
        let path = root.join(file.relative_path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"cached weights").unwrap();
    }
}

struct FailingConverter;

#[async_trait]
impl NativeConverter for FailingConverter {
    fn name(&self) -> &str {
        "broken-mscore"
    }

    async fn convert(&self, _musicxml: &Path, _target: &Path) -> Result<(), ExportError> {
        Err(ExportError::Converter {
            converter: "broken-mscore".into(),
            detail: "segmentation fault".into(),
        })
    }
}

#[derive(Default)]
struct Recorder {
    started: Mutex<Option<usize>>,
    completed: AtomicUsize,
    errored: AtomicUsize,
    retries: AtomicUsize,
    downloads: AtomicUsize,
}

impl ConversionProgressCallback for Recorder {
    fn on_model_download(&self, _file: &str, _downloaded: u64, _total: Option<u64>) {
        self.downloads.fetch_add(1, Ordering::SeqCst);
    }
    fn on_conversion_start(&self, total_pages: usize) {
        *self.started.lock().unwrap() = Some(total_pages);
    }
    fn on_page_retry(&self, _page_index: usize, _attempt: u32, _reason: &str) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }
    fn on_page_complete(&self, _page_index: usize, _total: usize, _measures: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_page_error(&self, _page_index: usize, _total: usize, _error: &str) {
        self.errored.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    dir: TempDir,
    pdf: PathBuf,
    pages: usize,
    fetches: Arc<AtomicU32>,
    checkpoints: Arc<CheckpointCache>,
}

impl Harness {
    fn new(pages: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("score.pdf");
        std::fs::write(&pdf, b"%PDF-1.7\n% fake score\n").unwrap();
        let fetches = Arc::new(AtomicU32::new(0));
        let checkpoints = Arc::new(
            CheckpointCache::builder(dir.path().join("models"))
                .fetcher(CountingFetcher {
                    fetches: Arc::clone(&fetches),
                })
                .retry_backoff(Duration::from_millis(1))
                .build(),
        );
        Self {
            dir,
            pdf,
            pages,
            fetches,
            checkpoints,
        }
    }

    fn out(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    fn config(&self, engine: &Arc<FakeEngine>) -> pdf2muse::ConversionConfigBuilder {
        ConversionConfig::builder()
            .output_dir(self.out())
            .concurrency(4)
            .retry_backoff_ms(1)
            .rasterizer(Arc::new(FakeRasterizer { pages: self.pages }))
            .engine(Arc::clone(engine) as Arc<dyn RecognitionEngine>)
            .checkpoints(Arc::clone(&self.checkpoints))
    }
}

fn measure_numbers(xml: &str) -> Vec<String> {
    let fragment = NotationFragment::parse(xml).unwrap();
    fragment.parts[0]
        .measures
        .iter()
        .map(|m| m.number.clone())
        .collect()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn blank_middle_page_is_partial_success_with_continuous_numbering() {
    let h = Harness::new(3);
    let engine = FakeEngine::new(vec![Page::Score(3), Page::Blank, Page::Score(2)]);
    let config = h.config(&engine).build().unwrap();

    let run = run(&h.pdf, &config).await;

    assert_eq!(run.results.len(), 3);
    assert_eq!(
        run.status,
        RunStatus::PartialSuccess {
            recognized: 2,
            total: 3,
            failed_pages: vec![FailedPage {
                page_index: 1,
                kind: FailureKind::Deterministic,
                reason: "no notation detected".into(),
            }],
        }
    );
    assert!(run.status.to_string().contains("page 2 (deterministic: no notation detected)"));
    assert_eq!(run.exit_code(), 2);
    assert_eq!(run.failed_page_indices(), vec![1]);
    let failure = run.failed_pages()[0];
    assert_eq!(failure.kind, FailureKind::Deterministic);
    assert_eq!(failure.reason, "no notation detected");

    let merged = run.merged.as_ref().unwrap();
    assert_eq!(merged.pages, vec![0, 2]);
    let numbers: Vec<u32> = merged.parts[0].measures.iter().map(|m| m.number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);

    let musicxml = h.out().join("combined.musicxml");
    let written = std::fs::read_to_string(&musicxml).unwrap();
    assert_eq!(measure_numbers(&written), vec!["1", "2", "3", "4", "5"]);
    assert_eq!(run.exports.musicxml, Some(musicxml));
    assert!(h.out().join("combined.mscx").exists());
    assert_eq!(run.stats.merged_measures, 5);
}

#[tokio::test]
async fn output_order_is_independent_of_completion_order() {
    let pages: Vec<Page> = (1..=8).map(Page::Score).collect();
    // Page 0 finishes last, page 7 first.
    let delays: Vec<u64> = (0..8).rev().map(|i| i * 15).collect();

    let h = Harness::new(8);
    let concurrent = FakeEngine::with_delays(pages.clone(), delays);
    let config = h.config(&concurrent).concurrency(4).build().unwrap();
    let first = run(&h.pdf, &config).await;

    let h2 = Harness::new(8);
    let sequential = FakeEngine::new(pages);
    let config2 = h2.config(&sequential).concurrency(1).build().unwrap();
    let second = run(&h2.pdf, &config2).await;

    assert!(first.is_success());
    let order: Vec<usize> = first.results.iter().map(|r| r.page_index).collect();
    assert_eq!(order, (0..8).collect::<Vec<_>>());
    assert!(concurrent.max_in_flight.load(Ordering::SeqCst) > 1);
    assert!(concurrent.max_in_flight.load(Ordering::SeqCst) <= 4);
    assert_eq!(sequential.max_in_flight.load(Ordering::SeqCst), 1);

    let merged = first.merged.as_ref().unwrap();
    let sources: Vec<usize> = merged.parts[0].measures.iter().map(|m| m.source_page).collect();
    let mut sorted = sources.clone();
    sorted.sort_unstable();
    assert_eq!(sources, sorted);
    assert_eq!(first.merged, second.merged);

    let a = std::fs::read(h.out().join("combined.musicxml")).unwrap();
    let b = std::fs::read(h2.out().join("combined.musicxml")).unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn all_pages_failing_is_a_failure_not_a_crash() {
    let h = Harness::new(2);
    let engine = FakeEngine::new(vec![Page::Blank, Page::Crash]);
    let config = h.config(&engine).build().unwrap();

    let run = run(&h.pdf, &config).await;

    assert_eq!(run.results.len(), 2);
    assert!(matches!(run.status, RunStatus::Failure { .. }));
    assert!(matches!(run.error, Some(Pdf2MuseError::NoPagesRecognized { total: 2, .. })));
    assert_eq!(run.exit_code(), 1);
    let merged = run.merged.as_ref().unwrap();
    assert_eq!(merged.measure_count(), 0);
    assert!(merged.is_empty());
    assert!(!h.out().join("combined.musicxml").exists());
}

#[tokio::test]
async fn missing_input_fails_without_results_or_files() {
    let h = Harness::new(3);
    let engine = FakeEngine::new(vec![Page::Score(1); 3]);
    let config = h.config(&engine).build().unwrap();

    let run = run(h.dir.path().join("nope.pdf"), &config).await;

    assert!(matches!(
        run.error,
        Some(Pdf2MuseError::Rasterization(RasterizationError::NotFound { .. }))
    ));
    assert!(run.results.is_empty());
    assert!(run.source.is_none());
    assert!(!h.out().exists());
    assert_eq!(engine.calls(), 0);
    assert_eq!(h.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn non_pdf_input_is_rejected() {
    let h = Harness::new(1);
    let text = h.dir.path().join("notes.pdf");
    std::fs::write(&text, "just some notes").unwrap();
    let engine = FakeEngine::new(vec![Page::Score(1)]);
    let config = h.config(&engine).build().unwrap();

    let run = run(&text, &config).await;

    assert!(matches!(
        run.error,
        Some(Pdf2MuseError::Rasterization(RasterizationError::NotAPdf { .. }))
    ));
    assert!(run.results.is_empty());
}

#[tokio::test]
async fn empty_cache_is_downloaded_once_for_concurrent_pages() {
    let h = Harness::new(4);
    let engine = FakeEngine::with_delays(vec![Page::Score(1); 4], vec![30; 4]);
    let config = h.config(&engine).concurrency(4).build().unwrap();

    let run = run(&h.pdf, &config).await;

    assert!(run.is_success());
    assert_eq!(h.checkpoints.download_passes(), 1);
    assert_eq!(h.fetches.load(Ordering::SeqCst) as usize, OEMER_CHECKPOINTS.len());
    assert!(h.checkpoints.is_ready());
}

#[tokio::test]
async fn concurrent_invocations_share_one_download() {
    let h = Harness::new(4);
    let engine = FakeEngine::new(vec![Page::Score(1); 4]);
    let workdir = h.dir.path().join("work");
    std::fs::create_dir_all(&workdir).unwrap();
    let invoker = Arc::new(RecognitionInvoker::new(
        engine.clone() as Arc<dyn RecognitionEngine>,
        Arc::clone(&h.checkpoints),
        &workdir,
    ));

    let tasks: Vec<_> = (0..4)
        .map(|index| {
            let invoker = Arc::clone(&invoker);
            let path = workdir.join(format!("page_{:03}.png", index + 1));
            std::fs::write(&path, b"png").unwrap();
            tokio::spawn(async move {
                let image = PageImage {
                    index,
                    path,
                    dpi: 300,
                    width: 1,
                    height: 1,
                };
                invoker.recognize(&image, &RecognitionOptions::default()).await
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_recognized());
    }

    assert_eq!(h.checkpoints.download_passes(), 1);
    assert_eq!(h.fetches.load(Ordering::SeqCst) as usize, OEMER_CHECKPOINTS.len());
    assert_eq!(engine.calls(), 4);
}

#[tokio::test]
async fn merge_and_export_are_idempotent() {
    let h = Harness::new(3);
    let engine = FakeEngine::new(vec![Page::Duet(2), Page::Score(1), Page::Duet(3)]);
    let config = h.config(&engine).build().unwrap();
    let run1 = run(&h.pdf, &config).await;
    let first = std::fs::read(h.out().join("combined.musicxml")).unwrap();

    let again = merge(&run1.results);
    assert_eq!(Some(&again), run1.merged.as_ref());

    let run2 = run(&h.pdf, &config).await;
    let second = std::fs::read(h.out().join("combined.musicxml")).unwrap();
    assert_eq!(first, second);
    assert_eq!(run1.merged, run2.merged);
    // Page 1 has no second part: that part gets a rest measure there.
    let merged = run1.merged.as_ref().unwrap();
    let second_part: Vec<u32> = merged.parts[1].measures.iter().map(|m| m.number).collect();
    assert_eq!(second_part, vec![1, 2, 3, 4, 5, 6]);
    assert!(merged.parts[1].measures[2].padded);
    assert_eq!(merged.parts[1].measures[2].source_page, 1);
    let exported = NotationFragment::parse(std::str::from_utf8(&first).unwrap()).unwrap();
    let lengths: Vec<usize> = exported.parts.iter().map(|p| p.measures.len()).collect();
    assert_eq!(lengths, vec![6, 6]);
}

#[tokio::test]
async fn rerun_only_touches_failed_pages() {
    let h = Harness::new(3);
    let broken = FakeEngine::new(vec![Page::Score(2), Page::Crash, Page::Score(2)]);
    let first = run(&h.pdf, &h.config(&broken).build().unwrap()).await;
    assert_eq!(first.failed_page_indices(), vec![1]);

    let fixed = FakeEngine::new(vec![Page::Score(9), Page::Score(1), Page::Score(9)]);
    let second = rerun_pages(&first, &h.config(&fixed).build().unwrap()).await;

    assert_eq!(fixed.calls(), 1);
    assert!(second.is_success());
    assert_eq!(second.results.len(), 3);
    let merged = second.merged.as_ref().unwrap();
    assert_eq!(merged.pages, vec![0, 1, 2]);
    let numbers: Vec<u32> = merged.parts[0].measures.iter().map(|m| m.number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn native_export_failure_keeps_musicxml() {
    let h = Harness::new(1);
    let engine = FakeEngine::new(vec![Page::Score(2)]);
    let config = h
        .config(&engine)
        .native_converter(Arc::new(FailingConverter))
        .build()
        .unwrap();

    let run = run(&h.pdf, &config).await;

    assert!(run.is_success());
    assert!(h.out().join("combined.musicxml").exists());
    assert!(run.exports.native.is_none());
    assert!(run.exports.native_error.as_deref().unwrap().contains("segmentation fault"));
}

#[tokio::test]
async fn per_page_files_and_no_native_output() {
    let h = Harness::new(3);
    let engine = FakeEngine::new(vec![Page::Score(1), Page::Crash, Page::Score(1)]);
    let config = h
        .config(&engine)
        .per_page_output(true)
        .native_format(NativeFormat::None)
        .output_stem("etude")
        .build()
        .unwrap();

    let run = run(&h.pdf, &config).await;

    assert_eq!(
        run.exports.page_files,
        vec![
            h.out().join("etude_page_001.musicxml"),
            h.out().join("etude_page_003.musicxml"),
        ]
    );
    assert!(h.out().join("etude.musicxml").exists());
    assert!(!h.out().join("etude.mscx").exists());
    assert!(run.exports.native.is_none());
}

#[tokio::test]
async fn transient_failure_is_retried_and_counted() {
    let h = Harness::new(2);
    let engine = FakeEngine::new(vec![Page::Flaky(1), Page::Score(1)]);
    let recorder = Arc::new(Recorder::default());
    let config = h
        .config(&engine)
        .progress_callback(recorder.clone())
        .build()
        .unwrap();

    let run = run(&h.pdf, &config).await;

    assert!(run.is_success());
    assert_eq!(run.results[0].attempts, 2);
    assert_eq!(run.results[1].attempts, 1);
    assert_eq!(run.stats.retried_pages, 1);
    assert_eq!(recorder.retries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deterministic_failure_is_not_retried() {
    let h = Harness::new(1);
    let engine = FakeEngine::new(vec![Page::Crash]);
    let config = h.config(&engine).max_retries(5).build().unwrap();

    let run = run(&h.pdf, &config).await;

    assert_eq!(engine.calls(), 1);
    assert_eq!(run.results[0].attempts, 1);
    assert_eq!(run.results[0].failure().unwrap().kind, FailureKind::Deterministic);
}

#[tokio::test]
async fn progress_sees_every_page_once() {
    let h = Harness::new(4);
    let engine = FakeEngine::new(vec![Page::Score(1), Page::Blank, Page::Score(2), Page::Crash]);
    let recorder = Arc::new(Recorder::default());
    let config = h
        .config(&engine)
        .progress_callback(recorder.clone())
        .build()
        .unwrap();

    let run = run(&h.pdf, &config).await;

    assert_eq!(run.results.len(), 4);
    assert_eq!(*recorder.started.lock().unwrap(), Some(4));
    assert_eq!(recorder.completed.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.errored.load(Ordering::SeqCst), 2);
    assert!(recorder.downloads.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn cancelled_run_keeps_one_entry_per_page() {
    let h = Harness::new(3);
    let engine = FakeEngine::new(vec![Page::Score(1); 3]);
    let token = CancelToken::new();
    token.cancel();
    let config = h.config(&engine).cancel_token(token).build().unwrap();

    let run = run(&h.pdf, &config).await;

    assert_eq!(run.results.len(), 3);
    assert!(run
        .results
        .iter()
        .all(|r| r.failure().map(|f| f.kind) == Some(FailureKind::Cancelled)));
    assert!(matches!(run.error, Some(Pdf2MuseError::Cancelled)));
    assert_eq!(engine.calls(), 0);
    assert!(!h.out().join("combined.musicxml").exists());
}

#[tokio::test]
async fn cancel_interrupts_running_pages() {
    let h = Harness::new(4);
    let engine = FakeEngine::with_delays(vec![Page::Score(1); 4], vec![10_000; 4]);
    let token = CancelToken::new();
    let config = h
        .config(&engine)
        .concurrency(2)
        .cancel_token(token.clone())
        .build()
        .unwrap();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });
    let run = tokio::time::timeout(Duration::from_secs(5), run(&h.pdf, &config))
        .await
        .expect("cancellation must not wait for hung pages");
    canceller.await.unwrap();

    assert_eq!(run.results.len(), 4);
    assert!(engine.calls() <= 2);
    assert!(matches!(run.status, RunStatus::Failure { .. }));
    assert!(run
        .results
        .iter()
        .all(|r| r.failure().map(|f| f.kind) == Some(FailureKind::Cancelled)));
}

#[tokio::test]
async fn hung_page_is_abandoned_at_its_deadline() {
    let h = Harness::new(2);
    let engine = FakeEngine::with_delays(vec![Page::Score(1), Page::Score(1)], vec![0, 30_000]);
    let config = h
        .config(&engine)
        .max_retries(0)
        .recognition_timeout_secs(1)
        .download_timeout_secs(1)
        .build()
        .unwrap();

    let run = tokio::time::timeout(Duration::from_secs(10), run(&h.pdf, &config))
        .await
        .expect("page deadline must bound the run");

    assert_eq!(run.results.len(), 2);
    assert!(run.results[0].is_recognized());
    assert_eq!(run.results[1].failure().unwrap().kind, FailureKind::Timeout);
    assert_eq!(run.failed_page_indices(), vec![1]);
    assert_eq!(run.exit_code(), 2);
}

#[tokio::test]
async fn stream_yields_one_result_per_page() {
    let h = Harness::new(5);
    let engine = FakeEngine::new(vec![
        Page::Score(1),
        Page::Blank,
        Page::Score(1),
        Page::Score(2),
        Page::Crash,
    ]);
    let config = h.config(&engine).build().unwrap();

    let stream = recognize_stream(&h.pdf, &config).await.unwrap();
    let mut results: Vec<_> = stream.collect().await;
    results.sort_by_key(|r| r.page_index);

    assert_eq!(results.len(), 5);
    let recognized: Vec<usize> = results
        .iter()
        .filter(|r| r.is_recognized())
        .map(|r| r.page_index)
        .collect();
    assert_eq!(recognized, vec![0, 2, 3]);
    assert_eq!(merge(&results).measure_count(), 4);
}

#[tokio::test]
async fn json_report_carries_status_and_pages() {
    let h = Harness::new(2);
    let engine = FakeEngine::new(vec![Page::Score(1), Page::Blank]);
    let config = h.config(&engine).build().unwrap();

    let run = run(&h.pdf, &config).await;
    let json = serde_json::to_value(run.report()).unwrap();

    assert_eq!(json["status"]["status"], "partial_success");
    assert_eq!(
        json["status"]["failed_pages"],
        serde_json::json!([{
            "page_index": 1,
            "kind": "deterministic",
            "reason": "no notation detected"
        }])
    );
    assert_eq!(json["pages"].as_array().unwrap().len(), 2);
    assert_eq!(json["pages"][1]["failure"]["reason"], "no notation detected");
}

#[tokio::test]
async fn engine_is_pointed_at_the_checkpoint_cache() {
    let h = Harness::new(2);
    let engine = FakeEngine::new(vec![Page::Score(1), Page::Score(1)]);
    let run = run(&h.pdf, &h.config(&engine).build().unwrap()).await;
    assert!(run.is_success(), "{}", run.status);
    assert_eq!(
        *engine.model_dirs.lock().unwrap(),
        vec![Some(h.dir.path().join("models")); 2]
    );

    // Without an injected cache, `model_dir` becomes the cache root.
    let models = h.dir.path().join("my_models");
    write_checkpoints(&models);
    let engine = FakeEngine::new(vec![Page::Score(1), Page::Score(1)]);
    let config = ConversionConfig::builder()
        .output_dir(h.dir.path().join("out2"))
        .rasterizer(Arc::new(FakeRasterizer { pages: 2 }))
        .engine(Arc::clone(&engine) as Arc<dyn RecognitionEngine>)
        .model_dir(&models)
        .build()
        .unwrap();
    let run = pdf2muse::run(&h.pdf, &config).await;
    assert!(run.is_success(), "{}", run.status);
    assert_eq!(*engine.model_dirs.lock().unwrap(), vec![Some(models); 2]);
}

#[tokio::test]
async fn checkpoint_download_failure_on_empty_cache_is_fatal() {
    let h = Harness::new(3);
    let engine = FakeEngine::new(vec![Page::Score(1); 3]);
    let fetches = Arc::new(AtomicU32::new(0));
    let offline = Arc::new(
        CheckpointCache::builder(h.dir.path().join("empty_models"))
            .fetcher(OfflineFetcher {
                fetches: Arc::clone(&fetches),
            })
            .max_attempts(2)
            .retry_backoff(Duration::from_millis(1))
            .build(),
    );
    let config = h.config(&engine).checkpoints(offline).build().unwrap();

    let run = run(&h.pdf, &config).await;

    assert!(matches!(run.status, RunStatus::Failure { .. }));
    assert!(matches!(run.error, Some(Pdf2MuseError::ModelDownload(_))));
    assert_eq!(run.exit_code(), 1);
    assert!(run.results.is_empty());
    assert!(run.source.is_some());
    assert_eq!(engine.calls(), 0);
    assert!(fetches.load(Ordering::SeqCst) >= 2);
    assert!(!h.out().exists());
}

#[tokio::test]
async fn checkpoint_refresh_failure_falls_back_to_cached_files() {
    let h = Harness::new(2);
    let engine = FakeEngine::new(vec![Page::Score(2), Page::Score(1)]);
    let root = h.dir.path().join("cached_models");
    write_checkpoints(&root);
    let fetches = Arc::new(AtomicU32::new(0));
    let offline = Arc::new(
        CheckpointCache::builder(&root)
            .fetcher(OfflineFetcher {
                fetches: Arc::clone(&fetches),
            })
            .max_attempts(1)
            .build(),
    );
    let config = h
        .config(&engine)
        .checkpoints(offline)
        .force_redownload_models(true)
        .build()
        .unwrap();

    let run = run(&h.pdf, &config).await;

    assert!(fetches.load(Ordering::SeqCst) > 0);
    assert!(run.is_success(), "{}", run.status);
    assert_eq!(run.recognized_count(), 2);
    assert!(h.out().join("combined.musicxml").exists());
}

#[tokio::test]
async fn page_render_failure_is_fatal_with_no_results() {
    let h = Harness::new(3);
    let engine = FakeEngine::new(vec![Page::Score(1); 3]);
    let config = h
        .config(&engine)
        .rasterizer(Arc::new(BrokenRasterizer {
            pages: 3,
            bad_page: 1,
        }))
        .build()
        .unwrap();

    let run = run(&h.pdf, &config).await;

    assert!(matches!(
        run.error,
        Some(Pdf2MuseError::Rasterization(RasterizationError::PageRender { page: 1, .. }))
    ));
    assert_eq!(run.exit_code(), 1);
    assert!(run.results.is_empty());
    assert_eq!(engine.calls(), 0);
    assert!(!h.out().exists());
}
