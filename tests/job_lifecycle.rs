//! Integration tests for the job registry and cancellation flow
//!
//! These drive the library API the same way the Telegram handlers do,
//! without touching the network or spawning external processes.

use std::sync::Arc;

use teloxide::types::ChatId;
use url::Url;

use vidra::core::AppError;
use vidra::download::cancel::{request_cancel, CancelOutcome};
use vidra::download::transfer::cleanup_partial_files;
use vidra::download::{FormatOption, JobEvent, JobRegistry, JobState};

fn test_url() -> Url {
    Url::parse("https://example.com/watch?v=abc123").expect("static URL parses")
}

fn video_option() -> FormatOption {
    FormatOption {
        id: "720p".to_string(),
        label: "720p (~20.0 MB)".to_string(),
        resolution: Some("1280x720".to_string()),
        audio_only: false,
        est_size: Some(20_000_000),
    }
}

#[tokio::test]
async fn full_lifecycle_reaches_done() {
    let registry = Arc::new(JobRegistry::new());
    let chat = ChatId(100);

    let job = registry.create(chat, test_url()).await.expect("create job");
    let job_id = job.lock().await.id.clone();

    registry
        .advance(chat, &job_id, JobEvent::FormatsReady)
        .await
        .expect("probe finished");
    registry
        .choose(chat, &job_id, video_option())
        .await
        .expect("format chosen");
    registry
        .advance(chat, &job_id, JobEvent::TransferFinished { needs_conversion: false })
        .await
        .expect("transfer finished");
    let final_state = registry
        .advance(chat, &job_id, JobEvent::UploadFinished)
        .await
        .expect("upload finished");

    assert_eq!(final_state, JobState::Done);
    assert_eq!(registry.live_count(), 0);
}

#[tokio::test]
async fn audio_lifecycle_passes_through_converting() {
    let registry = Arc::new(JobRegistry::new());
    let chat = ChatId(101);

    let job = registry.create(chat, test_url()).await.expect("create job");
    let job_id = job.lock().await.id.clone();

    registry
        .advance(chat, &job_id, JobEvent::FormatsReady)
        .await
        .expect("probe finished");
    let audio = FormatOption {
        id: "audio".to_string(),
        label: "Audio / MP3".to_string(),
        resolution: None,
        audio_only: true,
        est_size: None,
    };
    registry.choose(chat, &job_id, audio).await.expect("format chosen");

    let state = registry
        .advance(chat, &job_id, JobEvent::TransferFinished { needs_conversion: true })
        .await
        .expect("transfer finished");
    assert_eq!(state, JobState::Converting);

    let state = registry
        .advance(chat, &job_id, JobEvent::ConversionFinished)
        .await
        .expect("conversion finished");
    assert_eq!(state, JobState::Uploading);
}

#[tokio::test]
async fn second_job_in_same_chat_is_rejected() {
    let registry = Arc::new(JobRegistry::new());
    let chat = ChatId(102);

    registry.create(chat, test_url()).await.expect("first job");
    let err = registry.create(chat, test_url()).await.expect_err("second job rejected");
    assert!(matches!(err, AppError::ConcurrentJobExists));

    // A different chat is unaffected
    registry.create(ChatId(103), test_url()).await.expect("other chat ok");
}

#[tokio::test]
async fn skipping_the_choice_is_an_invalid_transition() {
    let registry = Arc::new(JobRegistry::new());
    let chat = ChatId(104);

    let job = registry.create(chat, test_url()).await.expect("create job");
    let job_id = job.lock().await.id.clone();

    let err = registry
        .advance(chat, &job_id, JobEvent::TransferFinished { needs_conversion: false })
        .await
        .expect_err("probing cannot jump to uploading");
    assert!(matches!(err, AppError::InvalidTransition(_)));

    // The failed event must not have corrupted the job
    assert_eq!(job.lock().await.state(), JobState::Probing);
}

#[tokio::test]
async fn stale_job_id_is_rejected() {
    let registry = Arc::new(JobRegistry::new());
    let chat = ChatId(105);

    registry.create(chat, test_url()).await.expect("create job");
    let err = registry
        .advance(chat, "not-the-real-id", JobEvent::FormatsReady)
        .await
        .expect_err("stale id rejected");
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn cancel_before_choice_is_immediate_and_idempotent() {
    let registry = Arc::new(JobRegistry::new());
    let chat = ChatId(106);

    let job = registry.create(chat, test_url()).await.expect("create job");
    let job_id = job.lock().await.id.clone();

    let outcome = request_cancel(&registry, chat, &job_id).await.expect("cancel");
    assert_eq!(outcome, CancelOutcome::Requested);
    assert_eq!(job.lock().await.state(), JobState::Cancelled);
    assert!(job.lock().await.cancel_token.is_cancelled());

    // Second press lands on a terminal job
    let outcome = request_cancel(&registry, chat, &job_id).await.expect("cancel again");
    assert_eq!(outcome, CancelOutcome::AlreadyFinished);
}

#[tokio::test]
async fn cancel_during_download_only_flips_the_token() {
    let registry = Arc::new(JobRegistry::new());
    let chat = ChatId(107);

    let job = registry.create(chat, test_url()).await.expect("create job");
    let job_id = job.lock().await.id.clone();
    registry
        .advance(chat, &job_id, JobEvent::FormatsReady)
        .await
        .expect("probe finished");
    registry.choose(chat, &job_id, video_option()).await.expect("chosen");

    let outcome = request_cancel(&registry, chat, &job_id).await.expect("cancel");
    assert_eq!(outcome, CancelOutcome::Requested);

    // The pipeline task owns the terminal transition in this phase
    let guard = job.lock().await;
    assert_eq!(guard.state(), JobState::Downloading);
    assert!(guard.cancel_token.is_cancelled());
}

#[tokio::test]
async fn terminal_job_is_replaced_by_a_new_one() {
    let registry = Arc::new(JobRegistry::new());
    let chat = ChatId(108);

    let job = registry.create(chat, test_url()).await.expect("create job");
    let job_id = job.lock().await.id.clone();
    registry
        .advance(chat, &job_id, JobEvent::Failed)
        .await
        .expect("fail job");

    let replacement = registry.create(chat, test_url()).await.expect("replacement accepted");
    assert_ne!(replacement.lock().await.id, job_id);
}

#[test]
fn cleanup_removes_destination_and_droppings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("clip.mp4");

    std::fs::write(&dest, b"partial").expect("write dest");
    std::fs::write(dir.path().join("clip.mp4.part"), b"part").expect("write .part");
    std::fs::write(dir.path().join("clip.mp4.ytdl"), b"state").expect("write .ytdl");

    cleanup_partial_files(&dest);

    assert!(!dest.exists());
    assert!(!dir.path().join("clip.mp4.part").exists());
    assert!(!dir.path().join("clip.mp4.ytdl").exists());

    // Running again on a clean directory is a no-op
    cleanup_partial_files(&dest);
}
