//! Streaming recognition API: emit page results as they complete.
//!
//! A long score takes minutes to recognise. [`recognize_stream`] hands each
//! [`RecognitionResult`] to the caller as soon as its page finishes, in
//! completion order, so a UI can show progress or a caller can start
//! inspecting pages early. It does not merge or export; collect the results
//! and pass them to [`crate::pipeline::merge::merge`] for that, or use the
//! eager [`crate::convert::run`].

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio_stream::Stream;
use tracing::{debug, info};

use crate::config::ConversionConfig;
use crate::convert::{page_stream, prepare_models, Collaborators};
use crate::error::Pdf2MuseError;
use crate::output::RecognitionResult;
use crate::pipeline::recognize::RecognitionInvoker;
use crate::pipeline::{input, render};

/// A boxed stream of page results.
pub type ResultStream = Pin<Box<dyn Stream<Item = RecognitionResult> + Send>>;

/// Rasterise `path` and stream one [`RecognitionResult`] per page.
///
/// Everything fatal (bad input, missing checkpoints, rasterisation) happens
/// before the stream is returned and comes back as `Err`. After that the
/// stream yields exactly one item per page. Sort by `page_index` if order
/// matters.
pub async fn recognize_stream(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ResultStream, Pdf2MuseError> {
    let path = path.as_ref();
    info!("Starting streaming recognition: {}", path.display());
    config.validate()?;

    let pdf_path = input::validate_input(path)?;
    let collaborators = Collaborators::resolve(config).await;
    let render_timeout = Duration::from_secs(config.render_timeout_secs);
    let source =
        render::load_source(Arc::clone(&collaborators.rasterizer), &pdf_path, render_timeout)
            .await?;

    let workdir = tempfile::Builder::new()
        .prefix("pdf2muse-")
        .tempdir()
        .map_err(|e| Pdf2MuseError::Internal(format!("could not create a working directory: {e}")))?;
    let workdir = Arc::new(workdir);

    let indices: Vec<usize> = (0..source.page_count).collect();
    if !indices.is_empty() {
        prepare_models(
            &collaborators.checkpoints,
            config.force_redownload_models,
            config.progress_callback.clone(),
        )
        .await?;
    }
    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_start(indices.len());
    }

    let images = if indices.is_empty() {
        Vec::new()
    } else {
        render::rasterize(
            Arc::clone(&collaborators.rasterizer),
            &source,
            config.dpi,
            &indices,
            workdir.path(),
            render_timeout,
        )
        .await?
    };
    debug!("Streaming {} pages", images.len());

    let invoker = Arc::new(RecognitionInvoker::new(
        collaborators.engine,
        collaborators.checkpoints,
        workdir.path(),
    ));
    let results = page_stream(invoker, images, config).map(move |result| {
        // The page images and engine output live in the workdir until the
        // stream is dropped.
        let _keep = &workdir;
        result
    });
    Ok(Box::pin(results))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_fails_before_streaming() {
        let config = ConversionConfig::default();
        let err = recognize_stream("/definitely/not/here.pdf", &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Pdf2MuseError::Rasterization(_)));
    }
}
