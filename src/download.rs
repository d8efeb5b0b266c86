use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Response;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Streams a response body into `target`, creating or truncating it.
///
/// Chunks are written as they arrive. A failure or cancellation mid-stream leaves the
/// partially written file behind.
pub(crate) async fn stream_to_file(
    mut response: Response,
    target: &Path,
    expected_len: Option<u64>,
    progress: bool,
    cancel: &CancellationToken,
) -> Result<u64> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
    }

    let mut out = tokio::fs::File::create(target)
        .await
        .map_err(|e| Error::io(target, e))?;

    let total = expected_len.or_else(|| response.content_length());
    let pb = progress.then(|| progress_bar(total));

    let mut downloaded: u64 = 0;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            chunk = response.chunk() => chunk?,
        };
        let Some(chunk) = chunk else { break };

        out.write_all(&chunk)
            .await
            .map_err(|e| Error::io(target, e))?;
        downloaded += chunk.len() as u64;
        if let Some(pb) = &pb {
            pb.inc(chunk.len() as u64);
        }
    }

    out.flush().await.map_err(|e| Error::io(target, e))?;
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    debug!(
        bytes = downloaded,
        path = %target.display(),
        "downloaded {:.2} MB",
        downloaded as f64 / (1024.0 * 1024.0)
    );
    Ok(downloaded)
}

fn progress_bar(total: Option<u64>) -> ProgressBar {
    match total {
        Some(len) => {
            let pb = ProgressBar::new(len);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar} {eta}",
            ) {
                pb.set_style(style.progress_chars("=>-"));
            }
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {bytes} ({bytes_per_sec})")
            {
                pb.set_style(style);
            }
            pb
        }
    }
}
