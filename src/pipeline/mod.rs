//! Pipeline stages for PDF-to-MusicXML conversion.
//!
//! Each submodule implements one step. The orchestrator in
//! [`crate::convert`] wires them together; the stages never call each other
//! except through the data they pass along.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ process ──▶ merge ──▶ export
//! (path)    (pdfium)   (oemer,      (one      (MusicXML,
//!                       retries)    score)    .mscx)
//! ```
//!
//! 1. [`input`]   check the path exists and really is a PDF
//! 2. [`render`]  rasterise selected pages to PNG files; pdfium is blocking,
//!    so it runs in `spawn_blocking`
//! 3. [`encode`]  PNG encoding and page file naming used by `render`
//! 4. [`recognize`] one engine invocation per page image, behind the
//!    checkpoint cache
//! 5. [`process`] retry transient recognition failures, release the image
//! 6. [`merge`]   renumber measures and map parts across pages
//! 7. [`export`]  write MusicXML atomically, then the native format

pub mod encode;
pub mod export;
pub mod input;
pub mod merge;
pub mod process;
pub mod recognize;
pub mod render;
