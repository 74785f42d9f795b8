//! Job state machine and per-chat registry
//!
//! A `Job` tracks one download from probe to upload. Transitions are
//! forward-only (Probing → AwaitingChoice → Downloading → Converting →
//! Uploading → Done) except for the jumps to Cancelled and Failed, which
//! are reachable from any non-terminal state. `Job::advance` is the only
//! place that mutates the state. The registry holds at most one live job
//! per chat; a chat with no registry entry is idle.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use teloxide::types::ChatId;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::download::probe::FormatOption;

/// Lifecycle state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Probing,
    AwaitingChoice,
    Downloading,
    Converting,
    Uploading,
    Done,
    Cancelled,
    Failed,
}

impl JobState {
    /// Terminal states accept no further events.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled | JobState::Failed)
    }

    /// Short label for /status and log lines.
    pub fn label(self) -> &'static str {
        match self {
            JobState::Probing => "probing formats",
            JobState::AwaitingChoice => "waiting for format choice",
            JobState::Downloading => "downloading",
            JobState::Converting => "converting",
            JobState::Uploading => "uploading",
            JobState::Done => "done",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        }
    }
}

/// Events that drive a job between states.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Probe finished, catalog is ready for the user
    FormatsReady,
    /// User picked a format from the keyboard
    FormatChosen(FormatOption),
    /// yt-dlp finished writing the file
    TransferFinished {
        /// The artifact needs an ffmpeg pass before upload
        needs_conversion: bool,
    },
    ConversionFinished,
    UploadFinished,
    Failed,
    Cancelled,
}

/// One download job, from probe to upload.
#[derive(Debug)]
pub struct Job {
    /// Unique job identifier (UUID), carried through callback data
    pub id: String,
    pub chat_id: ChatId,
    pub url: Url,
    /// Title reported by the probe, used for captions and file names
    pub title: Option<String>,
    /// Catalog from the probe, consulted when the choice callback arrives
    pub formats: Vec<FormatOption>,
    /// Chosen format; set by the FormatChosen transition
    pub format: Option<FormatOption>,
    state: JobState,
    /// Bytes transferred so far; only ever grows
    pub bytes_done: u64,
    /// Total size when the source reports one
    pub total_bytes: Option<u64>,
    pub started_at: DateTime<Utc>,
    /// Cooperative cancellation handle observed by the pipeline task
    pub cancel_token: CancellationToken,
}

impl Job {
    pub fn new(chat_id: ChatId, url: Url) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id,
            url,
            title: None,
            formats: Vec::new(),
            format: None,
            state: JobState::Probing,
            bytes_done: 0,
            total_bytes: None,
            started_at: Utc::now(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Applies an event to the state machine.
    ///
    /// The sole mutator of `state`. Returns the new state, or
    /// `InvalidTransition` when the event is not legal in the current
    /// state. Terminal states reject everything.
    pub fn advance(&mut self, event: JobEvent) -> AppResult<JobState> {
        let next = match (self.state, &event) {
            (JobState::Probing, JobEvent::FormatsReady) => JobState::AwaitingChoice,
            (JobState::AwaitingChoice, JobEvent::FormatChosen(_)) => JobState::Downloading,
            (JobState::Downloading, JobEvent::TransferFinished { needs_conversion }) => {
                if *needs_conversion {
                    JobState::Converting
                } else {
                    JobState::Uploading
                }
            }
            (JobState::Converting, JobEvent::ConversionFinished) => JobState::Uploading,
            (JobState::Uploading, JobEvent::UploadFinished) => JobState::Done,
            (state, JobEvent::Failed) if !state.is_terminal() => JobState::Failed,
            (state, JobEvent::Cancelled) if !state.is_terminal() => JobState::Cancelled,
            (state, event) => {
                return Err(AppError::InvalidTransition(format!(
                    "{:?} does not accept {:?}",
                    state, event
                )));
            }
        };

        if let JobEvent::FormatChosen(option) = event {
            self.format = Some(option);
        }

        log::info!("Job {} [chat {}]: {:?} -> {:?}", self.id, self.chat_id, self.state, next);
        self.state = next;
        Ok(next)
    }

    /// Records transfer progress. Stale samples (bytes below what was
    /// already seen) are dropped so displayed progress never regresses.
    pub fn record_progress(&mut self, bytes_done: u64, total_bytes: Option<u64>) {
        if bytes_done < self.bytes_done {
            return;
        }
        self.bytes_done = bytes_done;
        if total_bytes.is_some() {
            self.total_bytes = total_bytes;
        }
    }
}

/// Shared handle to a job.
pub type JobHandle = Arc<Mutex<Job>>;

/// Registry of live jobs, one per chat.
///
/// Entries linger for a while after reaching a terminal state so /status
/// can still report the outcome, then get evicted by a background task.
pub struct JobRegistry {
    jobs: DashMap<ChatId, JobHandle>,
    /// Non-terminal jobs across all chats, bounded by the global cap
    live: AtomicUsize,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            live: AtomicUsize::new(0),
        }
    }

    /// Looks up the chat's job, if any.
    ///
    /// The handle is cloned out of the map so no shard lock is held
    /// while callers await the job mutex.
    pub fn get(&self, chat_id: ChatId) -> Option<JobHandle> {
        self.jobs.get(&chat_id).map(|entry| entry.value().clone())
    }

    /// Number of non-terminal jobs.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Creates a new job for the chat in state Probing.
    ///
    /// Fails with `ConcurrentJobExists` when the chat already has a live
    /// job or the global concurrency cap is reached. A lingering terminal
    /// job is replaced.
    pub async fn create(&self, chat_id: ChatId, url: Url) -> AppResult<JobHandle> {
        if let Some(existing) = self.get(chat_id) {
            let guard = existing.lock().await;
            if !guard.state().is_terminal() {
                return Err(AppError::ConcurrentJobExists);
            }
        }

        // Reserve a live slot before inserting; a plain load-then-add
        // lets two chats race past the cap.
        let cap = *config::job::MAX_CONCURRENT;
        let mut current = self.live.load(Ordering::SeqCst);
        loop {
            if current >= cap {
                log::warn!("Global job cap reached, rejecting new job for chat {}", chat_id);
                return Err(AppError::ConcurrentJobExists);
            }
            match self
                .live
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let job = Arc::new(Mutex::new(Job::new(chat_id, url)));
        self.jobs.insert(chat_id, job.clone());
        Ok(job)
    }

    /// Applies an event to the chat's job, rejecting stale job ids.
    ///
    /// When the job reaches a terminal state the live counter drops and
    /// eviction is scheduled.
    pub async fn advance(
        self: &Arc<Self>,
        chat_id: ChatId,
        job_id: &str,
        event: JobEvent,
    ) -> AppResult<JobState> {
        let job = self
            .get(chat_id)
            .ok_or_else(|| AppError::InvalidTransition("no job in this chat".to_string()))?;

        let mut guard = job.lock().await;
        if guard.id != job_id {
            return Err(AppError::InvalidTransition("job id does not match".to_string()));
        }

        let was_terminal = guard.state().is_terminal();
        let new_state = guard.advance(event)?;

        if new_state.is_terminal() && !was_terminal {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.schedule_eviction(chat_id, guard.id.clone(), config::job::evict_delay());
        }

        Ok(new_state)
    }

    /// User picked a format. Only legal while the job awaits the choice.
    pub async fn choose(
        self: &Arc<Self>,
        chat_id: ChatId,
        job_id: &str,
        option: FormatOption,
    ) -> AppResult<JobHandle> {
        self.advance(chat_id, job_id, JobEvent::FormatChosen(option)).await?;
        // advance() verified the entry exists and the id matches.
        self.get(chat_id)
            .ok_or_else(|| AppError::InvalidTransition("no job in this chat".to_string()))
    }

    /// Removes the chat's entry if it still holds the given job.
    pub fn remove_if_matches(&self, chat_id: ChatId, job_id: &str) {
        let matches = self
            .get(chat_id)
            .is_some_and(|job| job.try_lock().map(|guard| guard.id == job_id).unwrap_or(false));
        if matches {
            self.jobs.remove(&chat_id);
        }
    }

    fn schedule_eviction(self: &Arc<Self>, chat_id: ChatId, job_id: String, delay: std::time::Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.remove_if_matches(chat_id, &job_id);
            log::debug!("Evicted finished job {} for chat {}", job_id, chat_id);
        });
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::probe::FormatOption;

    fn test_url() -> Url {
        Url::parse("https://example.com/watch?v=abc").unwrap()
    }

    fn video_option() -> FormatOption {
        FormatOption {
            id: "720p".to_string(),
            label: "720p".to_string(),
            resolution: Some("1280x720".to_string()),
            audio_only: false,
            est_size: Some(30_000_000),
        }
    }

    // ==================== State machine tests ====================

    #[test]
    fn test_happy_path_video() {
        let mut job = Job::new(ChatId(1), test_url());
        assert_eq!(job.state(), JobState::Probing);

        assert_eq!(job.advance(JobEvent::FormatsReady).unwrap(), JobState::AwaitingChoice);
        assert_eq!(
            job.advance(JobEvent::FormatChosen(video_option())).unwrap(),
            JobState::Downloading
        );
        assert!(job.format.is_some());
        assert_eq!(
            job.advance(JobEvent::TransferFinished { needs_conversion: false }).unwrap(),
            JobState::Uploading
        );
        assert_eq!(job.advance(JobEvent::UploadFinished).unwrap(), JobState::Done);
        assert!(job.state().is_terminal());
    }

    #[test]
    fn test_audio_path_goes_through_converting() {
        let mut job = Job::new(ChatId(1), test_url());
        job.advance(JobEvent::FormatsReady).unwrap();
        job.advance(JobEvent::FormatChosen(video_option())).unwrap();
        assert_eq!(
            job.advance(JobEvent::TransferFinished { needs_conversion: true }).unwrap(),
            JobState::Converting
        );
        assert_eq!(job.advance(JobEvent::ConversionFinished).unwrap(), JobState::Uploading);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut job = Job::new(ChatId(1), test_url());
        // Choosing before the catalog is ready is not legal.
        assert!(matches!(
            job.advance(JobEvent::FormatChosen(video_option())),
            Err(AppError::InvalidTransition(_))
        ));
        // Upload can't finish before it starts.
        assert!(matches!(
            job.advance(JobEvent::UploadFinished),
            Err(AppError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut job = Job::new(ChatId(1), test_url());
        job.advance(JobEvent::Cancelled).unwrap();
        assert!(job.advance(JobEvent::FormatsReady).is_err());
        assert!(job.advance(JobEvent::Cancelled).is_err());
        assert!(job.advance(JobEvent::Failed).is_err());
    }

    #[test]
    fn test_cancel_and_fail_from_any_live_state() {
        for make in [JobEvent::Cancelled, JobEvent::Failed] {
            let mut job = Job::new(ChatId(1), test_url());
            job.advance(JobEvent::FormatsReady).unwrap();
            job.advance(JobEvent::FormatChosen(video_option())).unwrap();
            let result = job.advance(make.clone()).unwrap();
            assert!(result.is_terminal());
        }
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut job = Job::new(ChatId(1), test_url());
        job.record_progress(1000, Some(10_000));
        job.record_progress(500, Some(10_000)); // out-of-order sample
        assert_eq!(job.bytes_done, 1000);
        job.record_progress(2000, None);
        assert_eq!(job.bytes_done, 2000);
        assert_eq!(job.total_bytes, Some(10_000));
    }

    // ==================== Registry tests ====================

    #[tokio::test]
    async fn test_second_create_in_same_chat_rejected() {
        let registry = Arc::new(JobRegistry::new());
        registry.create(ChatId(1), test_url()).await.unwrap();
        let err = registry.create(ChatId(1), test_url()).await.unwrap_err();
        assert!(matches!(err, AppError::ConcurrentJobExists));
        // A different chat is fine.
        assert!(registry.create(ChatId(2), test_url()).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_replaces_terminal_job() {
        let registry = Arc::new(JobRegistry::new());
        let job = registry.create(ChatId(1), test_url()).await.unwrap();
        let job_id = job.lock().await.id.clone();
        registry.advance(ChatId(1), &job_id, JobEvent::Cancelled).await.unwrap();
        assert!(registry.create(ChatId(1), test_url()).await.is_ok());
    }

    #[tokio::test]
    async fn test_advance_rejects_stale_job_id() {
        let registry = Arc::new(JobRegistry::new());
        registry.create(ChatId(1), test_url()).await.unwrap();
        let err = registry
            .advance(ChatId(1), "not-the-id", JobEvent::FormatsReady)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_choose_without_awaiting_choice_rejected() {
        let registry = Arc::new(JobRegistry::new());
        let job = registry.create(ChatId(1), test_url()).await.unwrap();
        let job_id = job.lock().await.id.clone();
        // Still Probing.
        let err = registry.choose(ChatId(1), &job_id, video_option()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_live_count_tracks_terminal_transitions() {
        let registry = Arc::new(JobRegistry::new());
        let job = registry.create(ChatId(1), test_url()).await.unwrap();
        assert_eq!(registry.live_count(), 1);
        let job_id = job.lock().await.id.clone();
        registry.advance(ChatId(1), &job_id, JobEvent::Failed).await.unwrap();
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_a_job_frees_the_chat_immediately() {
        // Errors between create and the keyboard edit must not leave the
        // chat blocked behind a live Probing job.
        let registry = Arc::new(JobRegistry::new());
        let job = registry.create(ChatId(1), test_url()).await.unwrap();
        let job_id = job.lock().await.id.clone();
        assert!(matches!(
            registry.create(ChatId(1), test_url()).await,
            Err(AppError::ConcurrentJobExists)
        ));

        registry.advance(ChatId(1), &job_id, JobEvent::Failed).await.unwrap();
        assert!(registry.create(ChatId(1), test_url()).await.is_ok());
    }

    #[tokio::test]
    async fn test_global_cap_holds_under_concurrent_creates() {
        let registry = Arc::new(JobRegistry::new());
        let cap = *config::job::MAX_CONCURRENT;

        let mut handles = Vec::new();
        for i in 0..(cap * 8) {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.create(ChatId(5000 + i as i64), test_url()).await.is_ok()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, cap);
        assert_eq!(registry.live_count(), cap);
    }

    #[tokio::test]
    async fn test_remove_if_matches_ignores_other_ids() {
        let registry = Arc::new(JobRegistry::new());
        registry.create(ChatId(1), test_url()).await.unwrap();
        registry.remove_if_matches(ChatId(1), "other-id");
        assert!(registry.get(ChatId(1)).is_some());
    }
}
