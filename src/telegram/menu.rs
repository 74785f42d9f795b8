//! Inline keyboard construction and callback data parsing
//!
//! Callback data is a compact pipe-separated string so it stays well
//! under Telegram's 64-byte limit:
//!
//! - `fmt:<quality>|job:<id8>` - format choice
//! - `cancel|job:<id8>` - cancel button
//!
//! Only the first 8 characters of the job UUID travel in the callback
//! data; the handlers match them against the registry entry.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::download::probe::FormatOption;

/// Number of UUID characters carried in callback data.
pub const JOB_TAG_LEN: usize = 8;

/// Action decoded from callback data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    /// User picked a format from the catalog keyboard
    ChooseFormat { format_id: String, job_tag: String },
    /// User pressed the cancel button
    Cancel { job_tag: String },
    /// User toggled the upload mode from the /mode menu
    SetUploadMode { as_document: bool },
}

/// Shortened job id used in callback data.
pub fn job_tag(job_id: &str) -> &str {
    &job_id[..job_id.len().min(JOB_TAG_LEN)]
}

/// Builds the quality selection keyboard for a probed catalog.
///
/// One button per row, in catalog order, with a cancel row at the
/// bottom.
pub fn format_keyboard(job_id: &str, formats: &[FormatOption]) -> InlineKeyboardMarkup {
    let tag = job_tag(job_id);
    let mut rows: Vec<Vec<InlineKeyboardButton>> = formats
        .iter()
        .map(|option| {
            vec![InlineKeyboardButton::callback(
                option.label.clone(),
                format!("fmt:{}|job:{}", option.id, tag),
            )]
        })
        .collect();

    rows.push(vec![InlineKeyboardButton::callback(
        "❌ Cancel".to_string(),
        format!("cancel|job:{}", tag),
    )]);

    InlineKeyboardMarkup::new(rows)
}

/// Upload mode selection keyboard for /mode.
pub fn mode_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(
            "🎬 Video (plays inline)".to_string(),
            "mode:video".to_string(),
        )],
        vec![InlineKeyboardButton::callback(
            "📄 Document (original file)".to_string(),
            "mode:document".to_string(),
        )],
    ])
}

/// Decodes callback data into an action.
///
/// Returns `None` for unknown or malformed payloads; the dispatcher
/// answers those queries without acting on them.
pub fn parse_callback_data(data: &str) -> Option<CallbackAction> {
    if let Some(mode) = data.strip_prefix("mode:") {
        return match mode {
            "video" => Some(CallbackAction::SetUploadMode { as_document: false }),
            "document" => Some(CallbackAction::SetUploadMode { as_document: true }),
            _ => None,
        };
    }

    let (head, tail) = data.split_once('|')?;
    let job_tag = tail.strip_prefix("job:")?;
    if job_tag.is_empty() {
        return None;
    }

    if head == "cancel" {
        return Some(CallbackAction::Cancel {
            job_tag: job_tag.to_string(),
        });
    }

    let format_id = head.strip_prefix("fmt:")?;
    if format_id.is_empty() {
        return None;
    }

    Some(CallbackAction::ChooseFormat {
        format_id: format_id.to_string(),
        job_tag: job_tag.to_string(),
    })
}
