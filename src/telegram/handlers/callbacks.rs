//! Inline keyboard callback endpoint
//!
//! Routes decoded callback actions: format choice spawns the pipeline,
//! cancel flips the job's token, mode toggles the per-chat upload
//! preference. Stale buttons (evicted or replaced jobs) are answered
//! with a short notice instead of erroring.

use teloxide::prelude::*;

use super::types::HandlerDeps;
use crate::download::cancel::{request_cancel, CancelOutcome};
use crate::download::pipeline;
use crate::download::probe::FormatOption;
use crate::download::progress::{DownloadStatus, ProgressMessage};
use crate::telegram::menu::{job_tag, parse_callback_data, CallbackAction};

/// Handles a callback query from any of the bot's inline keyboards.
pub async fn handle_callback(bot: Bot, q: CallbackQuery, deps: HandlerDeps) -> ResponseResult<()> {
    let callback_id = q.id.clone();

    let Some(data) = q.data.as_deref() else {
        bot.answer_callback_query(callback_id).await?;
        return Ok(());
    };

    let chat_id = q.message.as_ref().map(|m| m.chat().id);
    let message_id = q.message.as_ref().map(|m| m.id());
    let (Some(chat_id), Some(message_id)) = (chat_id, message_id) else {
        bot.answer_callback_query(callback_id).await?;
        return Ok(());
    };

    let Some(action) = parse_callback_data(data) else {
        log::debug!("Ignoring unknown callback data from chat {}: {}", chat_id, data);
        bot.answer_callback_query(callback_id).await?;
        return Ok(());
    };

    match action {
        CallbackAction::SetUploadMode { as_document } => {
            deps.set_upload_mode(chat_id, as_document);
            let label = if as_document { "document" } else { "video" };
            bot.answer_callback_query(callback_id).text("Saved").await?;
            bot.edit_message_text(chat_id, message_id, format!("✅ Videos will be sent as: {}", label))
                .await?;
        }
        CallbackAction::Cancel { job_tag: tag } => {
            let notice = match resolve_job_id(&deps, chat_id, &tag).await {
                Some(job_id) => match request_cancel(&deps.registry, chat_id, &job_id).await {
                    Ok(CancelOutcome::Requested) => "Cancelling...",
                    Ok(CancelOutcome::AlreadyFinished) => "Already finished",
                    Ok(CancelOutcome::NotFound) | Err(_) => "Nothing to cancel",
                },
                None => "Nothing to cancel",
            };
            bot.answer_callback_query(callback_id).text(notice).await?;
        }
        CallbackAction::ChooseFormat { format_id, job_tag: tag } => {
            handle_format_choice(&bot, &deps, chat_id, message_id, &format_id, &tag, callback_id).await?;
        }
    }

    Ok(())
}

/// Resolves a callback job tag to the full job id, if the chat still
/// holds that job.
async fn resolve_job_id(deps: &HandlerDeps, chat_id: ChatId, tag: &str) -> Option<String> {
    let job = deps.registry.get(chat_id)?;
    let guard = job.lock().await;
    (job_tag(&guard.id) == tag).then(|| guard.id.clone())
}

async fn handle_format_choice(
    bot: &Bot,
    deps: &HandlerDeps,
    chat_id: ChatId,
    message_id: teloxide::types::MessageId,
    format_id: &str,
    tag: &str,
    callback_id: teloxide::types::CallbackQueryId,
) -> ResponseResult<()> {
    let resolved: Option<(String, Option<FormatOption>, String)> = match deps.registry.get(chat_id) {
        Some(job) => {
            let guard = job.lock().await;
            if job_tag(&guard.id) == tag {
                let option = guard.formats.iter().find(|f| f.id == format_id).cloned();
                let title = guard.title.clone().unwrap_or_else(|| "media".to_string());
                Some((guard.id.clone(), option, title))
            } else {
                None
            }
        }
        None => None,
    };

    let Some((job_id, option, title)) = resolved else {
        bot.answer_callback_query(callback_id).text("This menu has expired").await?;
        return Ok(());
    };

    let Some(option) = option else {
        log::warn!("Unknown format id {} in callback for chat {}", format_id, chat_id);
        bot.answer_callback_query(callback_id).text("That option is gone").await?;
        return Ok(());
    };

    let job = match deps.registry.choose(chat_id, &job_id, option).await {
        Ok(job) => job,
        Err(e) => {
            // Double tap or a cancel raced the choice
            bot.answer_callback_query(callback_id).text(e.user_message()).await?;
            return Ok(());
        }
    };

    bot.answer_callback_query(callback_id).await?;

    let mut progress_msg = ProgressMessage::attach(chat_id, message_id);
    let starting = DownloadStatus::Starting { title };
    let _ = progress_msg.update(bot, &starting).await;

    pipeline::spawn(
        bot.clone(),
        deps.registry.clone(),
        job,
        progress_msg,
        deps.upload_as_document(chat_id),
    );

    Ok(())
}
