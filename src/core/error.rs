use thiserror::Error;

/// Centralized error types for the application
///
/// Every failure in the pipeline is converted to this enum so there is a
/// single place that maps an error to the message shown in chat.
/// Uses `thiserror` for automatic conversion and display formatting.
#[derive(Error, Debug)]
pub enum AppError {
    /// The source URL has no playable streams or yt-dlp rejected it
    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    /// Format probe did not finish within the configured timeout
    #[error("Probe timed out after {0}s")]
    ProbeTimeout(u64),

    /// The chat already has a live job
    #[error("A download is already running in this chat")]
    ConcurrentJobExists,

    /// Requested job operation is not valid in the job's current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// yt-dlp transfer failed; carries a bounded stderr tail
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// ffmpeg conversion failed; carries a bounded stderr tail
    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    /// Sending the finished file to Telegram failed
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// Telegram API errors
    #[error("Telegram error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// Anyhow errors (for general error handling)
    #[error("Application error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// One human-readable line for the chat message. Internal details
    /// (stderr tails, parse errors) stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            AppError::UnsupportedSource(_) => {
                "This link doesn't seem to contain downloadable media.".to_string()
            }
            AppError::ProbeTimeout(_) => {
                "Checking available formats took too long. Please try again.".to_string()
            }
            AppError::ConcurrentJobExists => {
                "A download is already running in this chat. Cancel it first or wait for it to finish."
                    .to_string()
            }
            AppError::InvalidTransition(_) => {
                "That action isn't available anymore. Send the link again to start over.".to_string()
            }
            AppError::TransferFailed(_) => "The download failed. Please try again later.".to_string(),
            AppError::ConversionFailed(_) => "Converting the file failed.".to_string(),
            AppError::UploadFailed(_) => {
                "The file was downloaded but couldn't be sent to Telegram.".to_string()
            }
            AppError::Url(_) => "That doesn't look like a valid link.".to_string(),
            AppError::Telegram(_) | AppError::Io(_) | AppError::Anyhow(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

/// Helper conversion for ad-hoc transfer failures
impl From<String> for AppError {
    fn from(err: String) -> Self {
        AppError::TransferFailed(err)
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        AppError::TransferFailed(err.to_string())
    }
}
