use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Configuration constants for the bot
/// Cached yt-dlp binary path
/// Read once at startup from YTDL_BIN environment variable or defaults to "yt-dlp"
pub static YTDL_BIN: Lazy<String> = Lazy::new(|| env::var("YTDL_BIN").unwrap_or_else(|_| "yt-dlp".to_string()));

/// Cached ffmpeg binary path
/// Read from FFMPEG_BIN environment variable or defaults to "ffmpeg"
pub static FFMPEG_BIN: Lazy<String> =
    Lazy::new(|| env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()));

/// Download folder path
/// Read from DOWNLOAD_FOLDER environment variable
/// Supports tilde (~) expansion for home directory
pub static DOWNLOAD_FOLDER: Lazy<String> =
    Lazy::new(|| env::var("DOWNLOAD_FOLDER").unwrap_or_else(|_| "~/downloads/vidra".to_string()));

/// Returns the download folder with tilde expansion applied
pub fn download_dir() -> String {
    shellexpand::tilde(DOWNLOAD_FOLDER.as_str()).to_string()
}

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: app.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "app.log".to_string()));

/// Bot token
/// Read from BOT_TOKEN or TELOXIDE_TOKEN environment variable
pub static BOT_TOKEN: Lazy<String> = Lazy::new(|| {
    env::var("BOT_TOKEN")
        .or_else(|_| env::var("TELOXIDE_TOKEN"))
        .unwrap_or_else(|_| String::new())
});

/// Default upload mode for chats that haven't toggled /mode
/// Read from UPLOAD_AS_DOCUMENT environment variable ("true" = document)
pub static UPLOAD_AS_DOCUMENT: Lazy<bool> = Lazy::new(|| {
    env::var("UPLOAD_AS_DOCUMENT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
});

/// Format probe configuration
pub mod probe {
    use once_cell::sync::Lazy;
    use std::env;
    use std::time::Duration;

    /// Timeout for `yt-dlp -J` metadata probes (in seconds)
    /// Read from PROBE_TIMEOUT_SECS environment variable
    pub static TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
        env::var("PROBE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30)
    });

    /// Probe timeout duration
    pub fn timeout() -> Duration {
        Duration::from_secs(*TIMEOUT_SECS)
    }
}

/// Progress reporting configuration
pub mod progress {
    use once_cell::sync::Lazy;
    use std::env;
    use std::time::Duration;

    /// Minimum interval between progress message edits (in milliseconds)
    /// Read from PROGRESS_EDIT_INTERVAL_MS environment variable
    pub static EDIT_INTERVAL_MS: Lazy<u64> = Lazy::new(|| {
        env::var("PROGRESS_EDIT_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2500)
    });

    /// Number of recent samples kept for throughput smoothing
    pub const SAMPLE_WINDOW: usize = 8;

    /// Capacity of the sample channel between transfer and reporter.
    /// Producers drop samples when full instead of blocking.
    pub const CHANNEL_CAPACITY: usize = 64;

    /// Edit throttle duration
    pub fn edit_interval() -> Duration {
        Duration::from_millis(*EDIT_INTERVAL_MS)
    }
}

/// Cancellation configuration
pub mod cancel {
    use once_cell::sync::Lazy;
    use std::env;
    use std::time::Duration;

    /// Grace period between SIGTERM and forced kill (in seconds)
    /// Read from CANCEL_GRACE_SECS environment variable
    pub static GRACE_SECS: Lazy<u64> = Lazy::new(|| {
        env::var("CANCEL_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8)
    });

    /// Grace period duration
    pub fn grace_period() -> Duration {
        Duration::from_secs(*GRACE_SECS)
    }
}

/// Job registry configuration
pub mod job {
    use once_cell::sync::Lazy;
    use std::env;
    use std::time::Duration;

    /// How long terminal jobs stay visible to /status before eviction (in seconds)
    pub const EVICT_DELAY_SECS: u64 = 60;

    /// Global cap on concurrently live jobs across all chats
    /// Read from MAX_CONCURRENT_JOBS environment variable
    pub static MAX_CONCURRENT: Lazy<usize> = Lazy::new(|| {
        env::var("MAX_CONCURRENT_JOBS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4)
    });

    /// Eviction delay duration
    pub fn evict_delay() -> Duration {
        Duration::from_secs(EVICT_DELAY_SECS)
    }
}

/// Transfer configuration
pub mod transfer {
    use super::Duration;

    /// Timeout for a single yt-dlp download (in seconds)
    pub const TIMEOUT_SECS: u64 = 1800; // 30 minutes

    /// Transfer timeout duration
    pub fn timeout() -> Duration {
        Duration::from_secs(TIMEOUT_SECS)
    }
}

/// Conversion configuration
pub mod convert {
    use super::Duration;

    /// Timeout for ffmpeg conversions (in seconds)
    pub const TIMEOUT_SECS: u64 = 600; // 10 minutes

    /// Conversion timeout duration
    pub fn timeout() -> Duration {
        Duration::from_secs(TIMEOUT_SECS)
    }
}

/// Network configuration
pub mod network {
    use super::Duration;

    /// Request timeout for HTTP requests (in seconds)
    /// Large enough for big file uploads through the Bot API
    pub const REQUEST_TIMEOUT_SECS: u64 = 900; // 15 minutes

    /// Request timeout duration
    pub fn timeout() -> Duration {
        Duration::from_secs(REQUEST_TIMEOUT_SECS)
    }
}

/// Stale artifact cleanup (/clean)
pub mod cleanup {
    use super::Duration;

    /// Files in the downloads dir older than this get purged (in seconds)
    pub const MAX_ARTIFACT_AGE_SECS: u64 = 3 * 24 * 3600; // 3 days

    /// Maximum artifact age as a duration
    pub fn max_artifact_age() -> Duration {
        Duration::from_secs(MAX_ARTIFACT_AGE_SECS)
    }
}

/// Upload limits
pub mod validation {
    use once_cell::sync::Lazy;
    use std::env;

    /// Maximum file size for Telegram uploads, in megabytes
    /// Read from MAX_UPLOAD_SIZE_MB environment variable
    /// Default: 1900 MB; a local Bot API server (BOT_API_URL) accepts up
    /// to 2 GB, the hosted one rejects files over 50 MB on its own
    pub static MAX_UPLOAD_SIZE_MB: Lazy<u64> = Lazy::new(|| {
        env::var("MAX_UPLOAD_SIZE_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1900)
    });

    /// Upload size cap in bytes
    pub fn max_upload_size_bytes() -> u64 {
        *MAX_UPLOAD_SIZE_MB * 1024 * 1024
    }

    /// Maximum URL length accepted from chat messages
    pub const MAX_URL_LENGTH: usize = 2048;
}
