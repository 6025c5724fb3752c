//! PDF rasterisation: render pages to PNG files via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is CPU-bound. [`load_source`] and [`rasterize`] run the blocking
//! [`PageRasterizer`] on Tokio's blocking pool and bound it with the
//! configured render timeout.
//!
//! Every returned [`PageImage`] is a file inside the run's working
//! directory; [`PageImage::release`] deletes it once the page is done.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pdfium_render::prelude::*;
use tracing::{debug, info};

use crate::error::RasterizationError;
use crate::output::{DocumentMetadata, SourceDocument};
use crate::pipeline::encode;

/// One rendered page, stored as a PNG file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// Zero-based page index.
    pub index: usize,
    pub path: PathBuf,
    pub dpi: u32,
    pub width: u32,
    pub height: u32,
}

impl PageImage {
    /// Delete the backing file. Missing files are ignored.
    pub fn release(self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released page image {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Could not remove {}: {e}", self.path.display()),
        }
    }
}

/// Turns a PDF into page images.
///
/// Implementations are blocking; callers go through [`load_source`] and
/// [`rasterize`], which move the work off the async runtime.
pub trait PageRasterizer: Send + Sync {
    /// Open the document and read its page count and metadata.
    fn load(&self, path: &Path) -> Result<SourceDocument, RasterizationError>;

    /// Render the pages at `indices` into `workdir`, one image per index, in
    /// the same order.
    fn rasterize_pages(
        &self,
        source: &SourceDocument,
        dpi: u32,
        indices: &[usize],
        workdir: &Path,
    ) -> Result<Vec<PageImage>, RasterizationError>;

    /// Render every page of `source`, `0..page_count`.
    fn rasterize(
        &self,
        source: &SourceDocument,
        dpi: u32,
        workdir: &Path,
    ) -> Result<Vec<PageImage>, RasterizationError> {
        let all: Vec<usize> = (0..source.page_count).collect();
        self.rasterize_pages(source, dpi, &all, workdir)
    }
}

/// Load `path` on the blocking pool.
pub async fn load_source(
    rasterizer: Arc<dyn PageRasterizer>,
    path: &Path,
    timeout: Duration,
) -> Result<SourceDocument, RasterizationError> {
    let path = path.to_path_buf();
    let task = tokio::task::spawn_blocking(move || rasterizer.load(&path));
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.map_err(|e| RasterizationError::Io {
            detail: format!("PDF load task panicked: {e}"),
        })?,
        Err(_) => Err(RasterizationError::Timeout {
            secs: timeout.as_secs(),
        }),
    }
}

/// Render `indices` of `source` on the blocking pool.
///
/// The result is checked against the request: one image per index, in index
/// order. Anything else is reported as [`RasterizationError::PageCountMismatch`].
pub async fn rasterize(
    rasterizer: Arc<dyn PageRasterizer>,
    source: &SourceDocument,
    dpi: u32,
    indices: &[usize],
    workdir: &Path,
    timeout: Duration,
) -> Result<Vec<PageImage>, RasterizationError> {
    if let Some(&bad) = indices.iter().find(|&&i| i >= source.page_count) {
        return Err(RasterizationError::PageRender {
            page: bad,
            detail: format!("out of range (document has {} pages)", source.page_count),
        });
    }

    let source_owned = source.clone();
    let wanted = indices.to_vec();
    let dir = workdir.to_path_buf();
    let task = tokio::task::spawn_blocking(move || {
        rasterizer.rasterize_pages(&source_owned, dpi, &wanted, &dir)
    });
    let images = match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.map_err(|e| RasterizationError::Io {
            detail: format!("render task panicked: {e}"),
        })??,
        Err(_) => {
            return Err(RasterizationError::Timeout {
                secs: timeout.as_secs(),
            })
        }
    };

    let matches = images.len() == indices.len()
        && images.iter().zip(indices).all(|(img, &i)| img.index == i);
    if !matches {
        return Err(RasterizationError::PageCountMismatch {
            expected: indices.len(),
            actual: images.len(),
        });
    }
    info!("Rasterised {} pages at {} DPI", images.len(), dpi);
    Ok(images)
}

/// The default rasteriser, backed by a dynamically loaded pdfium library.
///
/// The library is looked up at `library_path`, then `PDFIUM_LIB_PATH`, then
/// the working directory, then the system library search path.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    pub max_rendered_pixels: Option<u32>,
    pub library_path: Option<PathBuf>,
}

impl PdfiumRasterizer {
    pub fn new(max_rendered_pixels: Option<u32>) -> Self {
        Self {
            max_rendered_pixels,
            library_path: None,
        }
    }

    fn bind(&self) -> Result<Pdfium, RasterizationError> {
        let explicit = self
            .library_path
            .clone()
            .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));
        let bindings = match explicit {
            Some(path) => Pdfium::bind_to_library(&path),
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| RasterizationError::EngineUnavailable {
            detail: format!("{e:?}"),
        })?;
        Ok(Pdfium::new(bindings))
    }

    fn open<'a>(
        pdfium: &'a Pdfium,
        path: &Path,
    ) -> Result<PdfDocument<'a>, RasterizationError> {
        pdfium.load_pdf_from_file(path, None).map_err(|e| {
            let detail = format!("{e:?}");
            if detail.to_ascii_lowercase().contains("password") {
                RasterizationError::Corrupt {
                    path: path.to_path_buf(),
                    detail: "document is encrypted".into(),
                }
            } else {
                RasterizationError::Corrupt {
                    path: path.to_path_buf(),
                    detail,
                }
            }
        })
    }

    fn render_config(&self, dpi: u32) -> PdfRenderConfig {
        let config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0);
        match self.max_rendered_pixels {
            Some(px) => config
                .set_maximum_width(px as i32)
                .set_maximum_height(px as i32),
            None => config,
        }
    }
}

impl PageRasterizer for PdfiumRasterizer {
    fn load(&self, path: &Path) -> Result<SourceDocument, RasterizationError> {
        let pdfium = self.bind()?;
        let document = Self::open(&pdfium, path)?;
        let metadata = document.metadata();

        let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
            metadata.get(tag).and_then(|t| {
                let v = t.value().trim().to_string();
                (!v.is_empty()).then_some(v)
            })
        };

        let page_count = document.pages().len() as usize;
        info!("PDF loaded: {} pages", page_count);

        Ok(SourceDocument {
            path: path.to_path_buf(),
            page_count,
            metadata: DocumentMetadata {
                title: get_meta(PdfDocumentMetadataTagType::Title),
                author: get_meta(PdfDocumentMetadataTagType::Author),
                subject: get_meta(PdfDocumentMetadataTagType::Subject),
                creator: get_meta(PdfDocumentMetadataTagType::Creator),
                producer: get_meta(PdfDocumentMetadataTagType::Producer),
                pdf_version: format!("{:?}", document.version()),
            },
        })
    }

    fn rasterize_pages(
        &self,
        source: &SourceDocument,
        dpi: u32,
        indices: &[usize],
        workdir: &Path,
    ) -> Result<Vec<PageImage>, RasterizationError> {
        let pdfium = self.bind()?;
        let document = Self::open(&pdfium, &source.path)?;
        let pages = document.pages();
        let render_config = self.render_config(dpi);

        let mut images = Vec::with_capacity(indices.len());
        for &idx in indices {
            let page = pages
                .get(idx as u16)
                .map_err(|e| RasterizationError::PageRender {
                    page: idx,
                    detail: format!("{e:?}"),
                })?;
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| RasterizationError::PageRender {
                    page: idx,
                    detail: format!("{e:?}"),
                })?;

            let path = workdir.join(encode::page_file_name(idx));
            let (width, height) =
                encode::write_png(&bitmap.as_image(), &path).map_err(|e| RasterizationError::Io {
                    detail: format!("{}: {e}", path.display()),
                })?;
            debug!("Rendered page {} → {}x{} px", idx + 1, width, height);

            images.push(PageImage {
                index: idx,
                path,
                dpi,
                width,
                height,
            });
        }
        Ok(images)
    }
}
