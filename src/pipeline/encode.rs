//! Page image encoding: `DynamicImage` → PNG file handed to the engine.
//!
//! The engine reads images from disk, so every rendered page is written as a
//! lossless PNG. Alpha is dropped: scans are opaque and the engine's
//! binarisation expects three channels.

use std::path::Path;

use image::{DynamicImage, ImageFormat};
use tracing::debug;

/// File name used for page `index` inside the run's working directory.
pub fn page_file_name(index: usize) -> String {
    format!("page_{:03}.png", index + 1)
}

/// Write `img` to `path` as an RGB PNG and return its dimensions.
pub fn write_png(img: &DynamicImage, path: &Path) -> Result<(u32, u32), image::ImageError> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    rgb.save_with_format(path, ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} page image → {}",
        rgb.width(),
        rgb.height(),
        path.display()
    );
    Ok((rgb.width(), rgb.height()))
}
