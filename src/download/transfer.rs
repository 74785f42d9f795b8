//! yt-dlp transfer task
//!
//! Spawns yt-dlp with `--newline`, parses its `[download]` progress lines
//! into samples for the reporter, and watches the job's cancellation
//! token. Owns exactly one destination file; on cancellation, failure, or
//! timeout the partial file and yt-dlp's fragment siblings are removed.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::core::process::terminate_gracefully;
use crate::download::probe::FormatOption;
use crate::download::progress::ProgressSample;

/// Last stderr lines kept for error reporting.
const STDERR_TAIL_LINES: usize = 200;

/// How a transfer ended, short of an error.
#[derive(Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
}

/// Parsed fields of one `[download]` progress line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    pub percent: f32,
    pub total_size: Option<u64>,
}

impl ProgressLine {
    /// Bytes transferred, derived from percent and total.
    pub fn bytes_done(&self) -> Option<u64> {
        self.total_size
            .map(|total| (total as f64 * (self.percent as f64 / 100.0)) as u64)
    }
}

/// Parses progress from a yt-dlp output line.
/// Example: `[download]  45.2% of 10.00MiB at 500.00KiB/s ETA 00:10`
pub fn parse_progress(line: &str) -> Option<ProgressLine> {
    if !line.contains("[download]") || !line.contains('%') {
        return None;
    }

    let mut percent = None;
    let mut total_size = None;

    let parts: Vec<&str> = line.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        if part.ends_with('%') {
            if let Ok(p) = part.trim_end_matches('%').parse::<f32>() {
                percent = Some(p.clamp(0.0, 100.0));
            }
        }

        // "of 10.00MiB" or "of ~10.00MiB" for estimated totals
        if *part == "of" && i + 1 < parts.len() {
            if let Some(size_bytes) = parse_size(parts[i + 1].trim_start_matches('~')) {
                total_size = Some(size_bytes);
            }
        }
    }

    percent.map(|percent| ProgressLine { percent, total_size })
}

/// Parses a size like "10.00MiB" or "500.00KiB".
fn parse_size(size_str: &str) -> Option<u64> {
    let size_str = size_str.trim_end_matches("/s");
    if size_str.ends_with("MiB") {
        if let Ok(mb) = size_str.trim_end_matches("MiB").parse::<f64>() {
            return Some((mb * 1024.0 * 1024.0) as u64);
        }
    } else if size_str.ends_with("KiB") {
        if let Ok(kb) = size_str.trim_end_matches("KiB").parse::<f64>() {
            return Some((kb * 1024.0) as u64);
        }
    } else if size_str.ends_with("GiB") {
        if let Ok(gb) = size_str.trim_end_matches("GiB").parse::<f64>() {
            return Some((gb * 1024.0 * 1024.0 * 1024.0) as u64);
        }
    }
    None
}

/// Removes the destination file and yt-dlp's partial-download siblings.
pub fn cleanup_partial_files(path: &Path) {
    let mut candidates: Vec<PathBuf> = vec![path.to_path_buf()];
    let display = path.display().to_string();
    candidates.push(PathBuf::from(format!("{}.part", display)));
    candidates.push(PathBuf::from(format!("{}.ytdl", display)));

    for candidate in candidates {
        match std::fs::remove_file(&candidate) {
            Ok(()) => log::info!("Removed partial file {}", candidate.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove {}: {}", candidate.display(), e),
        }
    }
}

/// Terminates the child, drops the stderr drain, and removes partials.
///
/// Partials are cleaned up whether or not the kill escalation itself
/// succeeded; the termination error (if any) is returned afterwards.
async fn abort_transfer(
    child: &mut tokio::process::Child,
    stderr_task: &tokio::task::JoinHandle<VecDeque<String>>,
    dest: &Path,
) -> AppResult<()> {
    let terminated = terminate_gracefully(child, config::cancel::grace_period()).await;
    stderr_task.abort();
    cleanup_partial_files(dest);
    terminated
}

/// Downloads `url` into `dest` with the chosen format.
///
/// Progress samples go through `progress_tx`; when the channel is full
/// the sample is dropped so a slow reporter never stalls the reader.
/// On cancellation the child gets SIGTERM, then a forced kill after the
/// grace period, and partial files are cleaned up before returning
/// `TransferStatus::Cancelled`.
pub async fn run_transfer(
    url: &Url,
    option: &FormatOption,
    dest: &Path,
    progress_tx: mpsc::Sender<ProgressSample>,
    cancel: CancellationToken,
) -> AppResult<TransferStatus> {
    let mut cmd = Command::new(config::YTDL_BIN.as_str());
    cmd.arg("--newline")
        .arg("--no-playlist")
        .arg("-f")
        .arg(option.selector())
        .arg("-o")
        .arg(dest);
    if !option.audio_only {
        cmd.arg("--merge-output-format").arg("mp4");
    }
    cmd.arg(url.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    log::info!("Starting yt-dlp for {} -> {}", url, dest.display());

    let mut child = cmd
        .spawn()
        .map_err(|e| AppError::TransferFailed(format!("failed to start {}: {}", *config::YTDL_BIN, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::TransferFailed("no stdout handle from yt-dlp".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::TransferFailed("no stderr handle from yt-dlp".to_string()))?;

    // Drain stderr concurrently, keeping only a bounded tail.
    let stderr_task = tokio::spawn(async move {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    });

    let deadline = Instant::now() + config::transfer::timeout();
    let mut stdout_lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Cancellation requested, terminating yt-dlp for {}", dest.display());
                abort_transfer(&mut child, &stderr_task, dest).await?;
                return Ok(TransferStatus::Cancelled);
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                abort_transfer(&mut child, &stderr_task, dest).await?;
                return Err(AppError::TransferFailed(format!(
                    "download timed out after {}s",
                    config::transfer::TIMEOUT_SECS
                )));
            }
            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(parsed) = parse_progress(&line) {
                            if let Some(bytes_done) = parsed.bytes_done() {
                                let sample = ProgressSample {
                                    bytes_done,
                                    total_bytes: parsed.total_size,
                                    at: Instant::now(),
                                };
                                // Drop the sample when the reporter lags.
                                let _ = progress_tx.try_send(sample);
                            }
                        }
                    }
                    Ok(None) => break, // EOF: yt-dlp is wrapping up
                    Err(e) => {
                        log::warn!("Error reading yt-dlp stdout: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // Output ended; wait for exit, still honoring cancel and deadline.
    let status = tokio::select! {
        _ = cancel.cancelled() => {
            abort_transfer(&mut child, &stderr_task, dest).await?;
            return Ok(TransferStatus::Cancelled);
        }
        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
            abort_transfer(&mut child, &stderr_task, dest).await?;
            return Err(AppError::TransferFailed("download timed out while finalizing".to_string()));
        }
        status = child.wait() => status?,
    };

    let stderr_tail = stderr_task.await.unwrap_or_default();

    if !status.success() {
        let tail: Vec<String> = stderr_tail.into_iter().rev().take(5).collect();
        cleanup_partial_files(dest);
        return Err(AppError::TransferFailed(format!(
            "yt-dlp exited with {}: {}",
            status,
            tail.join(" | ")
        )));
    }

    if !dest.exists() {
        return Err(AppError::TransferFailed(
            "yt-dlp reported success but produced no file".to_string(),
        ));
    }

    log::info!("Transfer finished: {}", dest.display());
    Ok(TransferStatus::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ==================== parse_progress Tests ====================

    #[test]
    fn test_parse_progress_full_line() {
        let line = "[download]  45.2% of 10.00MiB at 500.00KiB/s ETA 00:10";
        let parsed = parse_progress(line).unwrap();
        assert_eq!(parsed.percent, 45.2);
        assert_eq!(parsed.total_size, Some(10 * 1024 * 1024));
        let bytes = parsed.bytes_done().unwrap();
        assert_eq!(bytes, (10.0 * 1024.0 * 1024.0 * 0.452) as u64);
    }

    #[test]
    fn test_parse_progress_estimated_total() {
        let line = "[download]  12.0% of ~1.50GiB at 2.30MiB/s ETA 09:30";
        let parsed = parse_progress(line).unwrap();
        assert_eq!(parsed.total_size, Some((1.5 * 1024.0 * 1024.0 * 1024.0) as u64));
    }

    #[test]
    fn test_parse_progress_ignores_non_progress_lines() {
        assert_eq!(parse_progress("[download] Destination: video.mp4"), None);
        assert_eq!(parse_progress("[info] Downloading format 137"), None);
        assert_eq!(parse_progress("45.2% something else"), None);
    }

    #[test]
    fn test_parse_progress_clamps_percent() {
        let line = "[download]  120.0% of 10.00MiB at 1.00MiB/s ETA 00:00";
        assert_eq!(parse_progress(line).unwrap().percent, 100.0);
    }

    // ==================== parse_size Tests ====================

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("10.00MiB"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("500.00KiB"), Some(512_000));
        assert_eq!(parse_size("2.00GiB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("1.00MiB/s"), Some(1024 * 1024));
        assert_eq!(parse_size("Unknown"), None);
    }

    // ==================== cleanup_partial_files Tests ====================

    #[test]
    fn test_cleanup_removes_file_and_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("clip.mp4");
        let part = dir.path().join("clip.mp4.part");
        let ytdl = dir.path().join("clip.mp4.ytdl");
        for p in [&dest, &part, &ytdl] {
            std::fs::write(p, b"data").unwrap();
        }

        cleanup_partial_files(&dest);

        assert!(!dest.exists());
        assert!(!part.exists());
        assert!(!ytdl.exists());
    }

    #[test]
    fn test_cleanup_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing was ever written; must not panic or error.
        cleanup_partial_files(&dir.path().join("never-existed.mp4"));
    }

    // ==================== abort_transfer Tests ====================

    #[tokio::test]
    async fn test_abort_removes_partials_and_reaps_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("clip.mp4");
        std::fs::write(dir.path().join("clip.mp4.part"), b"partial").unwrap();

        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stderr_task = tokio::spawn(async { VecDeque::new() });

        abort_transfer(&mut child, &stderr_task, &dest).await.unwrap();

        assert!(!dir.path().join("clip.mp4.part").exists());
        // The child was reaped, so wait() reports the kill immediately.
        assert!(child.try_wait().unwrap().is_some());
    }
}
