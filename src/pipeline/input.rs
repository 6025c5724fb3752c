//! Input validation: make sure the user-supplied path is a readable PDF.
//!
//! pdfium reports a missing or non-PDF file as a generic load failure, so the
//! checks run before the rasteriser is involved and give callers a specific
//! error instead.

use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::RasterizationError;

/// Validate that `path` exists, is readable and starts with the `%PDF` magic.
pub fn validate_input(path: &Path) -> Result<PathBuf, RasterizationError> {
    let path = path.to_path_buf();

    if !path.exists() {
        return Err(RasterizationError::NotFound { path });
    }
    if path.is_dir() {
        return Err(RasterizationError::NotAPdf {
            path,
            magic: [0; 4],
        });
    }

    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(RasterizationError::PermissionDenied { path });
        }
        Err(e) => {
            return Err(RasterizationError::Io {
                detail: format!("{}: {e}", path.display()),
            });
        }
    };

    let mut magic = [0u8; 4];
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) => {
                return Err(RasterizationError::Io {
                    detail: format!("{}: {e}", path.display()),
                })
            }
        }
    }
    if &magic != b"%PDF" {
        return Err(RasterizationError::NotAPdf { path, magic });
    }

    debug!("Validated PDF input: {}", path.display());
    Ok(path)
}
