//! ffmpeg conversion step
//!
//! Audio-only downloads arrive as whatever container the source serves
//! (usually m4a or webm); Telegram players want MP3, so the pipeline
//! runs one ffmpeg pass before upload.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::core::process::terminate_gracefully;
use crate::download::transfer::cleanup_partial_files;

/// Converts the downloaded audio file to MP3.
///
/// Returns the path of the converted file. The source file is removed
/// after a successful conversion. Honors the cancellation token the same
/// way the transfer does: SIGTERM, grace period, forced kill, cleanup.
/// Returns Ok(None) when cancelled.
pub async fn convert_to_mp3(
    source: &Path,
    cancel: &CancellationToken,
) -> AppResult<Option<PathBuf>> {
    let output = source.with_extension("mp3");

    let mut child = Command::new(config::FFMPEG_BIN.as_str())
        .arg("-y")
        .arg("-i")
        .arg(source)
        .arg("-vn")
        .arg("-codec:a")
        .arg("libmp3lame")
        .arg("-q:a")
        .arg("2")
        .arg(&output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::ConversionFailed(format!("failed to start ffmpeg: {}", e)))?;

    // Drain stderr so ffmpeg can't block on a full pipe.
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = String::new();
            let mut stderr = stderr;
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            log::info!("Cancellation requested, terminating ffmpeg for {}", source.display());
            // Clean up partials even if the kill escalation errors.
            let terminated = terminate_gracefully(&mut child, config::cancel::grace_period()).await;
            cleanup_partial_files(&output);
            terminated?;
            return Ok(None);
        }
        _ = tokio::time::sleep(config::convert::timeout()) => {
            let terminated = terminate_gracefully(&mut child, config::cancel::grace_period()).await;
            cleanup_partial_files(&output);
            terminated?;
            return Err(AppError::ConversionFailed(format!(
                "ffmpeg timed out after {}s",
                config::convert::TIMEOUT_SECS
            )));
        }
        status = child.wait() => status?,
    };

    if !status.success() {
        let tail = match stderr_task {
            Some(task) => {
                let buf = task.await.unwrap_or_default();
                buf.lines().rev().take(5).collect::<Vec<_>>().join(" | ")
            }
            None => String::new(),
        };
        cleanup_partial_files(&output);
        return Err(AppError::ConversionFailed(format!(
            "ffmpeg exited with {}: {}",
            status, tail
        )));
    }

    if let Err(e) = std::fs::remove_file(source) {
        log::warn!("Could not remove conversion source {}: {}", source.display(), e);
    }

    log::info!("Converted {} -> {}", source.display(), output.display());
    Ok(Some(output))
}
