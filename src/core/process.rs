//! Process execution utilities with timeout support
//!
//! Provides helpers for running external processes (yt-dlp, ffmpeg)
//! with configurable timeouts, plus graceful termination for
//! cancellation: SIGTERM first so the tool can finalize fragments,
//! forced kill after a grace period.

use std::process::Output;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::core::error::AppError;

/// Run an async Command with a timeout.
///
/// Returns the process Output on success, or an AppError on timeout/IO failure.
pub async fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output, AppError> {
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(AppError::Io(e)),
        Err(_) => Err(AppError::TransferFailed(format!(
            "Process timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Terminate a child process, giving it a grace period to exit cleanly.
///
/// Sends SIGTERM (via `kill`, since tokio only exposes SIGKILL), waits up
/// to `grace` for the child to exit, then force-kills it. Always reaps
/// the child before returning.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) -> Result<(), AppError> {
    if let Some(pid) = child.id() {
        // Ignore failures: the child may already have exited.
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .output()
            .await;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            log::debug!("Child exited after SIGTERM with {}", status);
            Ok(())
        }
        Ok(Err(e)) => Err(AppError::Io(e)),
        Err(_) => {
            log::warn!("Child did not exit within {}s grace period, killing", grace.as_secs());
            child.kill().await?;
            child.wait().await?;
            Ok(())
        }
    }
}
