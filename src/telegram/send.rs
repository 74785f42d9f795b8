//! Uploading finished artifacts to the chat
//!
//! One entry point, [`send_artifact`], picks the right Bot API method
//! for the artifact: audio for MP3s, video (streamable) or document for
//! everything else depending on the user's upload mode. Rate limits are
//! honored with a single wait-and-retry.

use std::path::Path;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{InputFile, ParseMode};
use tokio::time::sleep;

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::core::utils::{escape_markdown_v2, extract_retry_after, format_bytes};
use crate::download::probe::FormatOption;

/// Sends the finished file to the chat.
///
/// Applies the upload size cap before touching the network and maps all
/// Bot API failures to `UploadFailed` so the caller reports a single
/// user-facing message.
pub async fn send_artifact(
    bot: &Bot,
    chat_id: ChatId,
    path: &Path,
    title: &str,
    option: &FormatOption,
    upload_as_document: bool,
) -> AppResult<()> {
    let size = tokio::fs::metadata(path).await.map(|m| m.len()).map_err(|e| {
        AppError::UploadFailed(format!("artifact disappeared before upload: {}", e))
    })?;

    let size_cap = config::validation::max_upload_size_bytes();
    if size > size_cap {
        return Err(AppError::UploadFailed(format!(
            "file is too large for Telegram ({}, limit {})",
            format_bytes(size),
            format_bytes(size_cap)
        )));
    }

    log::info!(
        "Uploading {} ({}) to chat {} as {}",
        path.display(),
        format_bytes(size),
        chat_id,
        upload_kind(option, upload_as_document)
    );

    match send_once(bot, chat_id, path, title, option, upload_as_document).await {
        Ok(()) => Ok(()),
        Err(e) => {
            // Telegram flood control: wait the advertised interval and retry once
            if let Some(retry_after) = extract_retry_after(&e.to_string()) {
                log::warn!("Rate limited during upload, retrying after {}s", retry_after);
                sleep(Duration::from_secs(retry_after)).await;
                send_once(bot, chat_id, path, title, option, upload_as_document).await
            } else {
                Err(e)
            }
        }
    }
}

fn upload_kind(option: &FormatOption, upload_as_document: bool) -> &'static str {
    if option.audio_only {
        "audio"
    } else if upload_as_document {
        "document"
    } else {
        "video"
    }
}

async fn send_once(
    bot: &Bot,
    chat_id: ChatId,
    path: &Path,
    title: &str,
    option: &FormatOption,
    upload_as_document: bool,
) -> AppResult<()> {
    let input_file = InputFile::file(path.to_path_buf());
    let caption = escape_markdown_v2(title);

    let result = if option.audio_only {
        bot.send_audio(chat_id, input_file)
            .caption(&caption)
            .parse_mode(ParseMode::MarkdownV2)
            .title(title.to_string())
            .await
    } else if upload_as_document {
        bot.send_document(chat_id, input_file)
            .caption(&caption)
            .parse_mode(ParseMode::MarkdownV2)
            .await
    } else {
        bot.send_video(chat_id, input_file)
            .caption(&caption)
            .parse_mode(ParseMode::MarkdownV2)
            .supports_streaming(true)
            .await
    };

    result
        .map(|_| ())
        .map_err(|e| AppError::UploadFailed(e.to_string()))
}
