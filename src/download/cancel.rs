//! Cancellation coordinator
//!
//! Cancellation is cooperative: this module flips the job's token and,
//! when no background task is running yet, drives the state machine to
//! Cancelled directly. A running pipeline observes the token at its next
//! subprocess boundary, terminates the child, cleans partial files, and
//! reports the terminal state itself.

use std::sync::Arc;

use teloxide::types::ChatId;
use tokio_util::sync::CancellationToken;

use crate::core::error::{AppError, AppResult};
use crate::download::job::{JobEvent, JobRegistry, JobState};

/// What a cancel request found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Token flipped; the job will reach Cancelled within the grace period
    Requested,
    /// The job already reached a terminal state; nothing to do
    AlreadyFinished,
    /// No such job (evicted, or the keyboard was stale)
    NotFound,
}

/// Runs a future unless the token fires first.
///
/// Used for phases with no child process to signal (the upload): the
/// future is dropped when cancellation wins and `None` is returned.
pub async fn unless_cancelled<F>(token: &CancellationToken, fut: F) -> Option<F::Output>
where
    F: std::future::Future,
{
    tokio::select! {
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Requests cancellation of the chat's job. Idempotent: repeated calls
/// on a finished or missing job are not errors.
pub async fn request_cancel(
    registry: &Arc<JobRegistry>,
    chat_id: ChatId,
    job_id: &str,
) -> AppResult<CancelOutcome> {
    let job = match registry.get(chat_id) {
        Some(job) => job,
        None => return Ok(CancelOutcome::NotFound),
    };

    let state = {
        let guard = job.lock().await;
        if guard.id != job_id {
            return Ok(CancelOutcome::NotFound);
        }
        if guard.state().is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished);
        }
        guard.cancel_token.cancel();
        guard.state()
    };

    // Before a format is chosen no pipeline task exists to observe the
    // token, so the transition happens here.
    if matches!(state, JobState::Probing | JobState::AwaitingChoice) {
        match registry.advance(chat_id, job_id, JobEvent::Cancelled).await {
            Ok(_) => {}
            // The pipeline may have raced us into a terminal state.
            Err(AppError::InvalidTransition(_)) => return Ok(CancelOutcome::AlreadyFinished),
            Err(e) => return Err(e),
        }
    }

    log::info!("Cancel requested for job {} in chat {} (was {:?})", job_id, chat_id, state);
    Ok(CancelOutcome::Requested)
}
