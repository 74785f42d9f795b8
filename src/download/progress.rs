//! Progress reporting: ETA smoothing and throttled message edits
//!
//! The transfer task produces `ProgressSample`s at whatever rate yt-dlp
//! prints them; this module consumes them, smooths throughput over a
//! small ring buffer, and edits one chat message at a bounded rate.
//! Terminal updates bypass the throttle so the last edit always reflects
//! the final state.

use std::collections::VecDeque;
use std::time::Instant;

use teloxide::prelude::*;
use teloxide::types::MessageId;
use tokio::sync::mpsc;

use crate::core::config;
use crate::core::utils::{escape_markdown_v2 as escape_markdown, extract_retry_after, format_duration};
use crate::download::job::JobHandle;

/// One progress observation from the transfer task.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSample {
    pub bytes_done: u64,
    pub total_bytes: Option<u64>,
    pub at: Instant,
}

/// Smooths throughput over a ring buffer of recent samples.
///
/// Throughput is computed from the window endpoints, so a single noisy
/// sample can't spike the displayed speed. Samples whose byte count is
/// below the last accepted one are dropped; yt-dlp occasionally reorders
/// lines when it switches between video and audio tracks.
pub struct EtaEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: usize,
    total_bytes: Option<u64>,
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self::with_window(config::progress::SAMPLE_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window: window.max(2),
            total_bytes: None,
        }
    }

    /// Feeds one sample. Returns false when the sample was dropped as
    /// out-of-order.
    pub fn push(&mut self, sample: ProgressSample) -> bool {
        if let Some(&(_, last_bytes)) = self.samples.back() {
            if sample.bytes_done < last_bytes {
                return false;
            }
        }
        if sample.total_bytes.is_some() {
            self.total_bytes = sample.total_bytes;
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back((sample.at, sample.bytes_done));
        true
    }

    pub fn bytes_done(&self) -> u64 {
        self.samples.back().map(|&(_, b)| b).unwrap_or(0)
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    /// Percent complete, None when the total is unknown.
    pub fn percent(&self) -> Option<u8> {
        let total = self.total_bytes?;
        if total == 0 {
            return None;
        }
        Some(((self.bytes_done() as f64 / total as f64) * 100.0).min(100.0) as u8)
    }

    /// Smoothed throughput in bytes per second over the current window.
    pub fn throughput_bps(&self) -> Option<f64> {
        let (first, last) = (self.samples.front()?, self.samples.back()?);
        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let transferred = last.1.saturating_sub(first.1);
        Some(transferred as f64 / elapsed)
    }

    /// Estimated seconds to completion.
    ///
    /// Unknown (None) when the total size is missing or the smoothed
    /// throughput is zero; the UI shows a spinner instead of a number.
    pub fn eta_seconds(&self) -> Option<u64> {
        let total = self.total_bytes?;
        let throughput = self.throughput_bps()?;
        if throughput <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.bytes_done());
        Some((remaining as f64 / throughput).ceil() as u64)
    }
}

impl Default for EtaEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Download state for displaying progress to the user.
#[derive(Debug, Clone)]
pub enum DownloadStatus {
    /// Probe finished, download is about to start
    Starting { title: String },
    /// Download in progress with a progress bar
    Downloading {
        title: String,
        /// Percent (0-100), None when the total is unknown
        percent: Option<u8>,
        speed_mbs: Option<f64>,
        eta_seconds: Option<u64>,
        current_size: u64,
        total_size: Option<u64>,
    },
    Converting { title: String },
    Uploading { title: String },
    /// Terminal: file delivered
    Success { title: String, elapsed_secs: u64 },
    /// Terminal: cancelled by the user
    Cancelled { title: String },
    /// Terminal: something failed; `error` is already user-readable
    Error { title: String, error: String },
}

impl DownloadStatus {
    /// Formatted MarkdownV2 message text for the current state.
    pub fn to_message(&self) -> String {
        match self {
            DownloadStatus::Starting { title } => {
                format!("🎬 *{}*\n\n⏳ Starting download\\.\\.\\.", escape_markdown(title))
            }
            DownloadStatus::Downloading {
                title,
                percent,
                speed_mbs,
                eta_seconds,
                current_size,
                total_size,
            } => {
                let escaped = escape_markdown(title);
                let mut s = String::with_capacity(escaped.len() + 200);
                s.push_str("🎬 *");
                s.push_str(&escaped);
                s.push_str("*\n\n📥 Downloading");
                match percent {
                    Some(p) => {
                        s.push_str(&format!(": {}%\n", p));
                        s.push_str(&create_progress_bar(*p));
                    }
                    None => s.push_str("\\.\\.\\."),
                }

                if let Some(speed) = speed_mbs {
                    s.push_str("\n\n⚡ Speed: ");
                    s.push_str(&format!("{:.1} MB/s", speed).replace('.', "\\."));
                }

                if let Some(eta) = eta_seconds {
                    s.push_str("\n⏱️ ETA: ");
                    s.push_str(&escape_markdown(&format_duration(*eta)));
                }

                let current_mb = *current_size as f64 / (1024.0 * 1024.0);
                match total_size {
                    Some(total) => {
                        let total_mb = *total as f64 / (1024.0 * 1024.0);
                        s.push_str("\n📦 Size: ");
                        s.push_str(&format!("{:.1} / {:.1} MB", current_mb, total_mb).replace('.', "\\."));
                    }
                    None if *current_size > 0 => {
                        s.push_str("\n📦 Size: ");
                        s.push_str(&format!("{:.1} MB", current_mb).replace('.', "\\."));
                    }
                    None => {}
                }

                s
            }
            DownloadStatus::Converting { title } => {
                format!("🎵 *{}*\n\n🔄 Converting to MP3\\.\\.\\.", escape_markdown(title))
            }
            DownloadStatus::Uploading { title } => {
                format!("🎬 *{}*\n\n📤 Uploading to Telegram\\.\\.\\.", escape_markdown(title))
            }
            DownloadStatus::Success { title, elapsed_secs } => {
                format!(
                    "🎬 *{}*\n\n✅ Done in {}",
                    escape_markdown(title),
                    escape_markdown(&format_duration(*elapsed_secs))
                )
            }
            DownloadStatus::Cancelled { title } => {
                format!("🎬 *{}*\n\n🚫 Cancelled", escape_markdown(title))
            }
            DownloadStatus::Error { title, error } => {
                format!("🎬 *{}*\n\n❌ {}", escape_markdown(title), escape_markdown(error))
            }
        }
    }
}

/// Creates a visual progress bar.
fn create_progress_bar(progress: u8) -> String {
    let progress = progress.min(100);
    let filled = (progress / 10) as usize;
    let empty = 10 - filled;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// Manages the single status message edited throughout a job.
pub struct ProgressMessage {
    pub chat_id: ChatId,
    /// Progress message ID (None if not yet sent)
    pub message_id: Option<MessageId>,
}

impl ProgressMessage {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            message_id: None,
        }
    }

    /// Reuses an existing message (e.g. the format menu) for status edits.
    pub fn attach(chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            chat_id,
            message_id: Some(message_id),
        }
    }

    /// Sends or edits the status message.
    ///
    /// "message is not modified" edits are tolerated silently. On a rate
    /// limit the edit is retried once after the reported wait; any other
    /// edit failure falls back to sending a new message.
    pub async fn update(&mut self, bot: &Bot, status: &DownloadStatus) -> ResponseResult<()> {
        let text = status.to_message();

        if let Some(msg_id) = self.message_id {
            match bot
                .edit_message_text(self.chat_id, msg_id, text.clone())
                .parse_mode(teloxide::types::ParseMode::MarkdownV2)
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => {
                    let error_str = e.to_string();
                    if error_str.contains("message is not modified") {
                        return Ok(());
                    }

                    if let Some(retry_after_secs) = extract_retry_after(&error_str) {
                        log::warn!(
                            "Rate limit hit when editing message: retry after {}s",
                            retry_after_secs
                        );
                        tokio::time::sleep(tokio::time::Duration::from_secs(retry_after_secs + 1)).await;
                        match bot
                            .edit_message_text(self.chat_id, msg_id, text.clone())
                            .parse_mode(teloxide::types::ParseMode::MarkdownV2)
                            .await
                        {
                            Ok(_) => return Ok(()),
                            Err(e2) => {
                                if e2.to_string().contains("message is not modified") {
                                    return Ok(());
                                }
                                log::warn!("Edit still failing after rate limit wait: {}", e2);
                            }
                        }
                    } else {
                        log::warn!("Failed to edit message: {}. Sending a new one.", e);
                    }

                    let msg = bot
                        .send_message(self.chat_id, text)
                        .parse_mode(teloxide::types::ParseMode::MarkdownV2)
                        .await?;
                    self.message_id = Some(msg.id);
                    Ok(())
                }
            }
        } else {
            let msg = bot
                .send_message(self.chat_id, text)
                .parse_mode(teloxide::types::ParseMode::MarkdownV2)
                .await?;
            self.message_id = Some(msg.id);
            Ok(())
        }
    }
}

/// Consumes samples from the transfer task until the channel closes.
///
/// Records every accepted sample on the job (for /status) but edits the
/// chat message at most once per configured interval. The loop ends when
/// the sender side drops; the pipeline then posts the next phase's
/// status, which acts as the flush for whatever the throttle held back.
pub async fn run_reporter(
    bot: Bot,
    mut progress_msg: ProgressMessage,
    job: JobHandle,
    mut rx: mpsc::Receiver<ProgressSample>,
    title: String,
) -> ProgressMessage {
    let mut estimator = EtaEstimator::new();
    let edit_interval = config::progress::edit_interval();
    let mut last_edit: Option<Instant> = None;

    while let Some(sample) = rx.recv().await {
        if !estimator.push(sample) {
            continue;
        }

        {
            let mut guard = job.lock().await;
            guard.record_progress(sample.bytes_done, sample.total_bytes);
        }

        let due = last_edit.is_none_or(|at| at.elapsed() >= edit_interval);
        if !due {
            continue;
        }

        let status = DownloadStatus::Downloading {
            title: title.clone(),
            percent: estimator.percent(),
            speed_mbs: estimator.throughput_bps().map(|bps| bps / (1024.0 * 1024.0)),
            eta_seconds: estimator.eta_seconds(),
            current_size: estimator.bytes_done(),
            total_size: estimator.total_bytes(),
        };

        if let Err(e) = progress_msg.update(&bot, &status).await {
            log::warn!("Progress edit failed for chat {}: {}", progress_msg.chat_id, e);
        }
        last_edit = Some(Instant::now());
    }

    progress_msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn sample(at: Instant, offset_ms: u64, bytes: u64, total: Option<u64>) -> ProgressSample {
        ProgressSample {
            bytes_done: bytes,
            total_bytes: total,
            at: at + Duration::from_millis(offset_ms),
        }
    }

    // ==================== EtaEstimator Tests ====================

    #[test]
    fn test_estimator_drops_out_of_order_samples() {
        let t0 = Instant::now();
        let mut est = EtaEstimator::with_window(4);
        assert!(est.push(sample(t0, 0, 1000, Some(10_000))));
        assert!(est.push(sample(t0, 500, 2000, Some(10_000))));
        // Regressing byte count gets dropped.
        assert!(!est.push(sample(t0, 600, 1500, Some(10_000))));
        assert_eq!(est.bytes_done(), 2000);
    }

    #[test]
    fn test_estimator_throughput_from_window_endpoints() {
        let t0 = Instant::now();
        let mut est = EtaEstimator::with_window(4);
        est.push(sample(t0, 0, 0, Some(10_000)));
        est.push(sample(t0, 1000, 1000, Some(10_000)));
        est.push(sample(t0, 2000, 2000, Some(10_000)));
        let bps = est.throughput_bps().unwrap();
        assert!((bps - 1000.0).abs() < 1.0, "throughput was {}", bps);
    }

    #[test]
    fn test_estimator_window_caps_sample_count() {
        let t0 = Instant::now();
        let mut est = EtaEstimator::with_window(3);
        for i in 0..10u64 {
            est.push(sample(t0, i * 100, i * 1000, Some(100_000)));
        }
        // Only the last 3 samples remain: endpoints at 7000 and 9000 bytes.
        let bps = est.throughput_bps().unwrap();
        assert!((bps - 10_000.0).abs() < 50.0, "throughput was {}", bps);
    }

    #[test]
    fn test_estimator_eta_needs_total_and_throughput() {
        let t0 = Instant::now();
        let mut est = EtaEstimator::with_window(4);
        // No samples at all.
        assert_eq!(est.eta_seconds(), None);

        // Samples but no total size.
        est.push(sample(t0, 0, 0, None));
        est.push(sample(t0, 1000, 1000, None));
        assert_eq!(est.eta_seconds(), None);

        // Total arrives: 1000 B/s, 9000 bytes remaining.
        est.push(sample(t0, 2000, 2000, Some(10_000)));
        assert_eq!(est.eta_seconds(), Some(8));
    }

    #[test]
    fn test_estimator_stalled_transfer_has_no_eta() {
        let t0 = Instant::now();
        let mut est = EtaEstimator::with_window(4);
        est.push(sample(t0, 0, 5000, Some(10_000)));
        est.push(sample(t0, 1000, 5000, Some(10_000)));
        est.push(sample(t0, 2000, 5000, Some(10_000)));
        assert_eq!(est.throughput_bps(), Some(0.0));
        assert_eq!(est.eta_seconds(), None);
    }

    #[test]
    fn test_estimator_percent() {
        let t0 = Instant::now();
        let mut est = EtaEstimator::new();
        est.push(sample(t0, 0, 2500, Some(10_000)));
        assert_eq!(est.percent(), Some(25));

        let mut unknown = EtaEstimator::new();
        unknown.push(sample(t0, 0, 2500, None));
        assert_eq!(unknown.percent(), None);
    }

    // ==================== create_progress_bar Tests ====================

    #[test]
    fn test_progress_bar() {
        assert_eq!(create_progress_bar(0), "[░░░░░░░░░░]");
        assert_eq!(create_progress_bar(50), "[█████░░░░░]");
        assert_eq!(create_progress_bar(100), "[██████████]");
        assert_eq!(create_progress_bar(150), "[██████████]");
    }

    // ==================== DownloadStatus::to_message Tests ====================

    #[test]
    fn test_status_downloading_message() {
        let status = DownloadStatus::Downloading {
            title: "Test Clip".to_string(),
            percent: Some(50),
            speed_mbs: Some(5.5),
            eta_seconds: Some(90),
            current_size: 50 * 1024 * 1024,
            total_size: Some(100 * 1024 * 1024),
        };
        let msg = status.to_message();
        assert!(msg.contains("Test Clip"));
        assert!(msg.contains("50%"));
        assert!(msg.contains("[█████░░░░░]"));
        assert!(msg.contains("1:30"));
    }

    #[test]
    fn test_status_downloading_unknown_total_has_no_bar() {
        let status = DownloadStatus::Downloading {
            title: "Test".to_string(),
            percent: None,
            speed_mbs: None,
            eta_seconds: None,
            current_size: 0,
            total_size: None,
        };
        let msg = status.to_message();
        assert!(!msg.contains('%'));
        assert!(!msg.contains('█'));
    }

    #[test]
    fn test_status_terminal_messages() {
        let done = DownloadStatus::Success {
            title: "Clip".to_string(),
            elapsed_secs: 65,
        };
        assert!(done.to_message().contains("✅"));
        assert!(done.to_message().contains("1:05"));

        let cancelled = DownloadStatus::Cancelled { title: "Clip".to_string() };
        assert!(cancelled.to_message().contains("🚫"));

        let error = DownloadStatus::Error {
            title: "Clip".to_string(),
            error: "The download failed.".to_string(),
        };
        assert!(error.to_message().contains("❌"));
    }

    #[test]
    fn test_status_escapes_markdown_in_title() {
        let status = DownloadStatus::Starting {
            title: "Song (live).mp3".to_string(),
        };
        assert!(status.to_message().contains("Song \\(live\\)\\.mp3"));
    }

    // ==================== ProgressMessage Tests ====================

    #[test]
    fn test_progress_message_new() {
        let pm = ProgressMessage::new(ChatId(12345));
        assert_eq!(pm.chat_id, ChatId(12345));
        assert!(pm.message_id.is_none());
    }

    #[test]
    fn test_progress_message_attach() {
        let pm = ProgressMessage::attach(ChatId(1), MessageId(7));
        assert_eq!(pm.message_id, Some(MessageId(7)));
    }
}
