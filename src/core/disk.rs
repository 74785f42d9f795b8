//! Disk usage reporting and stale artifact cleanup
//!
//! Backs the /status disk line and the /clean command. Finished
//! downloads stay on disk until a /clean sweep or until they age out.

use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::core::error::AppError;
use crate::core::utils::format_bytes;

/// Disk space snapshot for the downloads volume
#[derive(Debug, Clone)]
pub struct DiskSpaceInfo {
    /// Available space in bytes
    pub available_bytes: u64,
    /// Total space in bytes
    pub total_bytes: u64,
}

impl DiskSpaceInfo {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    /// One-line human summary for chat messages
    pub fn summary(&self) -> String {
        format!(
            "Used {} / Total {} (Free {})",
            format_bytes(self.used_bytes()),
            format_bytes(self.total_bytes),
            format_bytes(self.available_bytes)
        )
    }
}

/// Get disk space information for a path using the df command
///
/// Works on Linux and macOS. If the path doesn't exist yet (the
/// downloads dir is created lazily), its parent is checked instead.
pub fn disk_space(path: &str) -> Result<DiskSpaceInfo, AppError> {
    let expanded = shellexpand::tilde(path).into_owned();
    let check_path = if Path::new(&expanded).exists() {
        expanded
    } else {
        Path::new(&expanded)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "/".to_string())
    };

    let output = std::process::Command::new("df")
        .args(["-k", &check_path]) // -k for 1K blocks
        .output()?;

    if !output.status.success() {
        return Err(AppError::Anyhow(anyhow::anyhow!(
            "df failed for {}: {}",
            check_path,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    // df output: Filesystem 1K-blocks Used Available Use% Mounted
    let parts: Vec<&str> = stdout
        .lines()
        .nth(1)
        .ok_or_else(|| AppError::Anyhow(anyhow::anyhow!("unexpected df output")))?
        .split_whitespace()
        .collect();
    if parts.len() < 4 {
        return Err(AppError::Anyhow(anyhow::anyhow!("unexpected df output")));
    }

    let total_kb: u64 = parts[1]
        .parse()
        .map_err(|_| AppError::Anyhow(anyhow::anyhow!("failed to parse df total")))?;
    let available_kb: u64 = parts[3]
        .parse()
        .map_err(|_| AppError::Anyhow(anyhow::anyhow!("failed to parse df available")))?;

    Ok(DiskSpaceInfo {
        available_bytes: available_kb * 1024,
        total_bytes: total_kb * 1024,
    })
}

/// Deletes regular files in `dir` older than `max_age`.
///
/// Returns the number of files removed. A missing directory counts as
/// already clean. Per-file errors are logged and skipped so one locked
/// file doesn't abort the whole sweep.
pub fn purge_older_than(dir: &Path, max_age: Duration) -> Result<usize, AppError> {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    purge_older_than_cutoff(dir, cutoff)
}

fn purge_older_than_cutoff(dir: &Path, cutoff: SystemTime) -> Result<usize, AppError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        let path = entry.path();
        let stale = entry
            .metadata()
            .ok()
            .filter(|m| m.is_file())
            .and_then(|m| m.modified().ok())
            .is_some_and(|modified| modified < cutoff);
        if !stale {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::info!("🗑 Removed stale artifact: {}", path.display());
                removed += 1;
            }
            Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ==================== Disk Summary Tests ====================

    #[test]
    fn test_summary_reports_used_total_and_free() {
        let info = DiskSpaceInfo {
            available_bytes: 1024 * 1024 * 1024,
            total_bytes: 4 * 1024 * 1024 * 1024,
        };
        assert_eq!(info.used_bytes(), 3 * 1024 * 1024 * 1024);
        assert_eq!(info.summary(), "Used 3.0 GB / Total 4.0 GB (Free 1.0 GB)");
    }

    // ==================== Purge Tests ====================

    #[test]
    fn test_purge_removes_files_older_than_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.mp4"), b"data").unwrap();
        std::fs::write(dir.path().join("old.mp3"), b"data").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        // Everything just written is older than a cutoff in the future
        let cutoff = SystemTime::now() + Duration::from_secs(3600);
        let removed = purge_older_than_cutoff(dir.path(), cutoff).unwrap();

        assert_eq!(removed, 2);
        assert!(!dir.path().join("old.mp4").exists());
        // Directories are left alone
        assert!(dir.path().join("nested").exists());
    }

    #[test]
    fn test_purge_keeps_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fresh.mp4"), b"data").unwrap();

        let removed = purge_older_than(dir.path(), Duration::from_secs(3 * 24 * 3600)).unwrap();

        assert_eq!(removed, 0);
        assert!(dir.path().join("fresh.mp4").exists());
    }

    #[test]
    fn test_purge_treats_missing_dir_as_clean() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(purge_older_than(&missing, Duration::from_secs(60)).unwrap(), 0);
    }
}
