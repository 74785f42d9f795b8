//! Logging initialization and startup diagnostics
//!
//! This module provides:
//! - Logger initialization (console + file)
//! - External tool availability checks at startup

use anyhow::Result;
use simplelog::*;
use std::fs::File;

use crate::core::config;

/// Initialize logger for both console and file output
///
/// # Arguments
/// * `log_file_path` - Path to the log file
///
/// # Returns
/// * `Ok(())` - Logger initialized successfully
/// * `Err(anyhow::Error)` - Failed to initialize logger
pub fn init_logger(log_file_path: &str) -> Result<()> {
    let log_file = File::create(log_file_path).map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, Config::default(), log_file),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    Ok(())
}

/// Logs tool and directory configuration at application startup
///
/// Checks that yt-dlp and ffmpeg are invokable and that the download
/// directory exists (creating it if needed), so misconfiguration shows
/// up at boot instead of on the first download.
pub async fn log_startup_configuration() {
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("Startup configuration check");
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for (label, bin) in [("yt-dlp", config::YTDL_BIN.as_str()), ("ffmpeg", config::FFMPEG_BIN.as_str())] {
        let mut cmd = tokio::process::Command::new(bin);
        cmd.arg("--version");
        match crate::core::process::run_with_timeout(&mut cmd, std::time::Duration::from_secs(15)).await {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                let first_line = version.lines().next().unwrap_or("unknown");
                log::info!("✅ {}: {} ({})", label, bin, first_line);
            }
            Ok(output) => {
                log::warn!("⚠️  {}: {} exited with {}", label, bin, output.status);
            }
            Err(e) => {
                log::error!("❌ {}: {} not invokable: {}", label, bin, e);
                log::error!("   Downloads will fail until {} is installed", label);
            }
        }
    }

    let dir = config::download_dir();
    match std::fs::create_dir_all(&dir) {
        Ok(()) => log::info!("✅ Download folder: {}", dir),
        Err(e) => log::error!("❌ Download folder {} is not writable: {}", dir, e),
    }

    log::info!(
        "Upload mode default: {}",
        if *config::UPLOAD_AS_DOCUMENT { "document" } else { "video" }
    );
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
