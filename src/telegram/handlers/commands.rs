//! Command and URL message endpoints

use std::path::Path;

use teloxide::prelude::*;
use teloxide::types::{Message, ParseMode};
use url::Url;

use super::types::HandlerDeps;
use crate::core::config;
use crate::core::disk;
use crate::core::error::AppError;
use crate::core::utils::{escape_markdown_v2, extract_url, format_duration};
use crate::download::cancel::{request_cancel, CancelOutcome};
use crate::download::job::JobEvent;
use crate::download::probe::probe_formats;
use crate::telegram::menu::{format_keyboard, mode_keyboard};

const WELCOME_TEXT: &str = "👋 Send me a video link and I'll fetch it for you.\n\n\
    I'll show the available qualities first; pick one and I'll download, \
    convert if needed, and send the file back here.\n\n\
    One download at a time per chat. Use /status to check on it and \
    /cancel to abort it.";

/// /start - welcome message
pub async fn handle_start_command(bot: &Bot, msg: &Message) -> ResponseResult<()> {
    bot.send_message(msg.chat.id, WELCOME_TEXT).await?;
    Ok(())
}

/// /mode - upload mode menu
pub async fn handle_mode_command(bot: &Bot, deps: &HandlerDeps, msg: &Message) -> ResponseResult<()> {
    let current = if deps.upload_as_document(msg.chat.id) {
        "document"
    } else {
        "video"
    };
    bot.send_message(
        msg.chat.id,
        format!("Videos are currently sent as: {}\n\nPick an upload mode:", current),
    )
    .reply_markup(mode_keyboard())
    .await?;
    Ok(())
}

/// /status - report on the chat's job plus downloads dir usage
pub async fn handle_status_command(bot: &Bot, deps: &HandlerDeps, msg: &Message) -> ResponseResult<()> {
    let mut text = match deps.registry.get(msg.chat.id) {
        None => "No active download in this chat.".to_string(),
        Some(job) => {
            let guard = job.lock().await;
            let title = guard.title.as_deref().unwrap_or("(untitled)");
            match (guard.total_bytes, guard.bytes_done) {
                (Some(total), done) if total > 0 && !guard.state().is_terminal() => {
                    let percent = (done.saturating_mul(100) / total).min(100);
                    format!("{} — {} ({}%)", title, guard.state().label(), percent)
                }
                _ => format!("{} — {}", title, guard.state().label()),
            }
        }
    };

    let dir = config::download_dir();
    text.push_str(&format!("\n\n📁 Downloads dir: {}", dir));
    match disk::disk_space(&dir) {
        Ok(info) => text.push_str(&format!("\n💾 {}", info.summary())),
        Err(e) => log::warn!("Disk usage check failed for {}: {}", dir, e),
    }

    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

/// /cancel - abort the chat's job if one is running
pub async fn handle_cancel_command(bot: &Bot, deps: &HandlerDeps, msg: &Message) -> ResponseResult<()> {
    let chat_id = msg.chat.id;
    let job_id = match deps.registry.get(chat_id) {
        Some(job) => job.lock().await.id.clone(),
        None => {
            bot.send_message(chat_id, "Nothing to cancel.").await?;
            return Ok(());
        }
    };

    let text = match request_cancel(&deps.registry, chat_id, &job_id).await {
        Ok(CancelOutcome::Requested) => "🚫 Cancelling...",
        Ok(CancelOutcome::AlreadyFinished) => "That download already finished.",
        Ok(CancelOutcome::NotFound) | Err(_) => "Nothing to cancel.",
    };
    bot.send_message(chat_id, text).await?;
    Ok(())
}

/// /clean - purge downloads-dir files older than the cleanup age
pub async fn handle_clean_command(bot: &Bot, msg: &Message) -> ResponseResult<()> {
    let dir = config::download_dir();
    let text = match disk::purge_older_than(Path::new(&dir), config::cleanup::max_artifact_age()) {
        Ok(removed) => format!("🧹 Cleaned {} old files from {}.", removed, dir),
        Err(e) => {
            log::warn!("Cleanup of {} failed: {}", dir, e);
            "Cleanup failed. Please try again later.".to_string()
        }
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

/// Handles a plain message carrying (hopefully) a URL.
///
/// Creates the job, probes the catalog, and presents the quality
/// keyboard. All failures collapse into a single chat message and put
/// the job into Failed so the chat frees up immediately.
pub async fn handle_url_message(bot: &Bot, deps: &HandlerDeps, msg: &Message) -> ResponseResult<()> {
    let chat_id = msg.chat.id;
    let Some(raw_url) = msg.text().and_then(extract_url) else {
        bot.send_message(chat_id, "Send me a link to a video and I'll take it from there.")
            .await?;
        return Ok(());
    };

    if raw_url.len() > config::validation::MAX_URL_LENGTH {
        bot.send_message(chat_id, "That link is too long for me to handle.").await?;
        return Ok(());
    }

    let url = match Url::parse(raw_url) {
        Ok(url) => url,
        Err(e) => {
            log::debug!("Rejected unparseable URL from chat {}: {}", chat_id, e);
            bot.send_message(chat_id, AppError::Url(e).user_message()).await?;
            return Ok(());
        }
    };

    let job = match deps.registry.create(chat_id, url.clone()).await {
        Ok(job) => job,
        Err(e) => {
            bot.send_message(chat_id, e.user_message()).await?;
            return Ok(());
        }
    };
    let job_id = job.lock().await.id.clone();

    // Once the job exists, a Telegram failure must not leave it live or
    // the chat stays blocked until eviction.
    let status_msg = match bot.send_message(chat_id, "🔍 Checking available formats...").await {
        Ok(msg) => msg,
        Err(e) => {
            let _ = deps.registry.advance(chat_id, &job_id, JobEvent::Failed).await;
            return Err(e);
        }
    };

    let probe = match probe_formats(&url).await {
        Ok(probe) => probe,
        Err(e) => {
            log::warn!("Probe failed for chat {}: {}", chat_id, e);
            let _ = deps.registry.advance(chat_id, &job_id, JobEvent::Failed).await;
            bot.edit_message_text(chat_id, status_msg.id, e.user_message()).await?;
            return Ok(());
        }
    };

    {
        let mut guard = job.lock().await;
        guard.title = Some(probe.title.clone());
        guard.formats = probe.formats.clone();
    }

    // The user may have cancelled while the probe ran
    if deps.registry.advance(chat_id, &job_id, JobEvent::FormatsReady).await.is_err() {
        return Ok(());
    }

    let mut header = format!("🎬 *{}*", escape_markdown_v2(&probe.title));
    if let Some(duration) = probe.duration_secs {
        header.push_str(&format!("\n⏱ {}", escape_markdown_v2(&format_duration(duration))));
    }
    header.push_str("\n\nPick a quality:");

    if let Err(e) = bot
        .edit_message_text(chat_id, status_msg.id, header)
        .parse_mode(ParseMode::MarkdownV2)
        .reply_markup(format_keyboard(&job_id, &probe.formats))
        .await
    {
        let _ = deps.registry.advance(chat_id, &job_id, JobEvent::Failed).await;
        return Err(e);
    }

    Ok(())
}
