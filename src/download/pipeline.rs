//! Per-job download pipeline
//!
//! One detached task per job, spawned when the user picks a format:
//! transfer, optional conversion, upload, then the terminal transition.
//! Every failure funnels into a single edited chat message; the temp
//! file never outlives the job.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use teloxide::prelude::*;
use tokio::sync::mpsc;

use crate::core::config;
use crate::core::error::AppError;
use crate::core::utils::{escape_filename, sanitize_filename};
use crate::download::cancel::unless_cancelled;
use crate::download::convert::convert_to_mp3;
use crate::download::job::{JobEvent, JobHandle, JobRegistry};
use crate::download::probe::FormatOption;
use crate::download::progress::{run_reporter, DownloadStatus, ProgressMessage, ProgressSample};
use crate::download::transfer::{cleanup_partial_files, run_transfer, TransferStatus};
use crate::telegram::send::send_artifact;

/// Spawns the pipeline for a job whose format was just chosen.
pub fn spawn(
    bot: Bot,
    registry: Arc<JobRegistry>,
    job: JobHandle,
    progress_msg: ProgressMessage,
    upload_as_document: bool,
) {
    tokio::spawn(async move {
        run(bot, registry, job, progress_msg, upload_as_document).await;
    });
}

async fn run(
    bot: Bot,
    registry: Arc<JobRegistry>,
    job: JobHandle,
    progress_msg: ProgressMessage,
    upload_as_document: bool,
) {
    let (job_id, chat_id, url, option, title, cancel_token, started_at) = {
        let guard = job.lock().await;
        let option = match guard.format.clone() {
            Some(option) => option,
            None => {
                log::error!("Pipeline started without a chosen format for job {}", guard.id);
                return;
            }
        };
        (
            guard.id.clone(),
            guard.chat_id,
            guard.url.clone(),
            option,
            guard.title.clone().unwrap_or_else(|| "media".to_string()),
            guard.cancel_token.clone(),
            guard.started_at,
        )
    };

    let dest = artifact_path(&title, &job_id, &option);

    let (tx, rx) = mpsc::channel::<ProgressSample>(config::progress::CHANNEL_CAPACITY);
    let reporter = tokio::spawn(run_reporter(
        bot.clone(),
        progress_msg,
        job.clone(),
        rx,
        title.clone(),
    ));

    let transfer_result = run_transfer(&url, &option, &dest, tx, cancel_token.clone()).await;

    // The sender is dropped by run_transfer returning; the reporter
    // drains what's left and hands the message handle back.
    let mut progress_msg = match reporter.await {
        Ok(pm) => pm,
        Err(e) => {
            log::error!("Progress reporter panicked for job {}: {}", job_id, e);
            ProgressMessage::new(chat_id)
        }
    };

    match transfer_result {
        Ok(TransferStatus::Completed) => {}
        Ok(TransferStatus::Cancelled) => {
            finish_cancelled(&bot, &registry, chat_id, &job_id, &mut progress_msg, &title).await;
            return;
        }
        Err(e) => {
            finish_failed(&bot, &registry, chat_id, &job_id, &mut progress_msg, &title, &e).await;
            return;
        }
    }

    if registry
        .advance(
            chat_id,
            &job_id,
            JobEvent::TransferFinished {
                needs_conversion: option.audio_only,
            },
        )
        .await
        .is_err()
    {
        // Cancelled out from under us between transfer end and here.
        cleanup_partial_files(&dest);
        return;
    }

    let mut artifact = dest.clone();
    if option.audio_only {
        let converting = DownloadStatus::Converting { title: title.clone() };
        if let Err(e) = progress_msg.update(&bot, &converting).await {
            log::warn!("Status edit failed for chat {}: {}", chat_id, e);
        }

        match convert_to_mp3(&dest, &cancel_token).await {
            Ok(Some(converted)) => {
                artifact = converted;
                if let Err(e) = registry.advance(chat_id, &job_id, JobEvent::ConversionFinished).await {
                    log::warn!("Could not record conversion finish for job {}: {}", job_id, e);
                    cleanup_partial_files(&artifact);
                    return;
                }
            }
            Ok(None) => {
                cleanup_partial_files(&dest);
                finish_cancelled(&bot, &registry, chat_id, &job_id, &mut progress_msg, &title).await;
                return;
            }
            Err(e) => {
                cleanup_partial_files(&dest);
                finish_failed(&bot, &registry, chat_id, &job_id, &mut progress_msg, &title, &e).await;
                return;
            }
        }
    }

    // Last cooperative checkpoint before the upload starts.
    if cancel_token.is_cancelled() {
        cleanup_partial_files(&artifact);
        finish_cancelled(&bot, &registry, chat_id, &job_id, &mut progress_msg, &title).await;
        return;
    }

    let uploading = DownloadStatus::Uploading { title: title.clone() };
    if let Err(e) = progress_msg.update(&bot, &uploading).await {
        log::warn!("Status edit failed for chat {}: {}", chat_id, e);
    }

    // The upload has no child process to signal, so cancellation races
    // the send future directly.
    let upload = unless_cancelled(
        &cancel_token,
        send_artifact(&bot, chat_id, &artifact, &title, &option, upload_as_document),
    )
    .await;
    match upload {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            cleanup_partial_files(&artifact);
            finish_failed(&bot, &registry, chat_id, &job_id, &mut progress_msg, &title, &e).await;
            return;
        }
        None => {
            cleanup_partial_files(&artifact);
            finish_cancelled(&bot, &registry, chat_id, &job_id, &mut progress_msg, &title).await;
            return;
        }
    }

    if let Err(e) = registry.advance(chat_id, &job_id, JobEvent::UploadFinished).await {
        log::warn!("Could not record upload finish for job {}: {}", job_id, e);
    }

    let elapsed_secs = (Utc::now() - started_at).num_seconds().max(0) as u64;
    let done = DownloadStatus::Success {
        title: title.clone(),
        elapsed_secs,
    };
    if let Err(e) = progress_msg.update(&bot, &done).await {
        log::warn!("Final status edit failed for chat {}: {}", chat_id, e);
    }

    cleanup_partial_files(&artifact);
    log::info!("Job {} finished for chat {} in {}s", job_id, chat_id, elapsed_secs);
}

/// File-name budget for the title part of the destination, in characters.
const MAX_NAME_CHARS: usize = 64;

/// Download destination under the configured folder, unique per job.
fn artifact_path(title: &str, job_id: &str, option: &FormatOption) -> PathBuf {
    let mut name = escape_filename(&sanitize_filename(title));
    // Truncate on a char boundary; byte 64 may fall inside a multibyte title.
    let cut = name
        .char_indices()
        .nth(MAX_NAME_CHARS)
        .map_or(name.len(), |(i, _)| i);
    name.truncate(cut);
    let short_id: String = job_id.chars().take(8).collect();
    PathBuf::from(config::download_dir()).join(format!("{}-{}.{}", name, short_id, option.extension()))
}

async fn finish_cancelled(
    bot: &Bot,
    registry: &Arc<JobRegistry>,
    chat_id: ChatId,
    job_id: &str,
    progress_msg: &mut ProgressMessage,
    title: &str,
) {
    match registry.advance(chat_id, job_id, JobEvent::Cancelled).await {
        Ok(_) => {}
        // request_cancel may already have driven the transition.
        Err(AppError::InvalidTransition(_)) => {}
        Err(e) => log::warn!("Could not record cancellation for job {}: {}", job_id, e),
    }

    let status = DownloadStatus::Cancelled { title: title.to_string() };
    if let Err(e) = progress_msg.update(bot, &status).await {
        log::warn!("Cancel status edit failed for chat {}: {}", chat_id, e);
    }
}

async fn finish_failed(
    bot: &Bot,
    registry: &Arc<JobRegistry>,
    chat_id: ChatId,
    job_id: &str,
    progress_msg: &mut ProgressMessage,
    title: &str,
    error: &AppError,
) {
    log::error!("Job {} failed for chat {}: {}", job_id, chat_id, error);

    if let Err(e) = registry.advance(chat_id, job_id, JobEvent::Failed).await {
        log::warn!("Could not record failure for job {}: {}", job_id, e);
    }

    let status = DownloadStatus::Error {
        title: title.to_string(),
        error: error.user_message(),
    };
    if let Err(e) = progress_msg.update(bot, &status).await {
        log::warn!("Failure status edit failed for chat {}: {}", chat_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_path_is_unique_per_job() {
        let option = FormatOption {
            id: "720p".to_string(),
            label: "720p".to_string(),
            resolution: None,
            audio_only: false,
            est_size: None,
        };
        let a = artifact_path("Some Clip", "aaaaaaaa-1111", &option);
        let b = artifact_path("Some Clip", "bbbbbbbb-2222", &option);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with(".mp4"));
    }

    #[test]
    fn test_artifact_path_sanitizes_title() {
        let option = FormatOption {
            id: "audio".to_string(),
            label: "Audio".to_string(),
            resolution: None,
            audio_only: true,
            est_size: None,
        };
        let path = artifact_path("a/b: c*?.mp4", "deadbeef", &option);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
        assert!(!name.contains('*'));
    }

    #[test]
    fn test_artifact_path_truncates_multibyte_titles_on_char_boundary() {
        let option = FormatOption {
            id: "720p".to_string(),
            label: "720p".to_string(),
            resolution: None,
            audio_only: false,
            est_size: None,
        };
        // Titles whose byte length is not a multiple of the char width
        // used to land mid-codepoint at the truncation cut.
        for title in [&"あ".repeat(30), &"й".repeat(100), &"🎬".repeat(40)] {
            let path = artifact_path(title, "deadbeef-0000", &option);
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.chars().count() <= MAX_NAME_CHARS + "deadbeef.mp4-".len() + 1);
        }
    }
}
