//! Format catalog probe
//!
//! Runs `yt-dlp -J` against a URL under a bounded timeout and turns the
//! JSON format list into an ordered catalog the user can choose from:
//! video quality tiers best-first, then one audio-only entry.

use serde_json::Value;
use std::collections::HashMap;
use tokio::process::Command;
use tokio::time::timeout;
use url::Url;

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::core::utils::format_bytes;

/// One selectable entry in the format catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOption {
    /// Stable identifier carried through callback data ("1080p", "audio", ...)
    pub id: String,
    /// Human-readable button label, size included when known
    pub label: String,
    /// "WxH" when the probe could determine it
    pub resolution: Option<String>,
    pub audio_only: bool,
    /// Estimated download size in bytes; merged video+audio for video-only streams
    pub est_size: Option<u64>,
}

impl FormatOption {
    fn video(quality: &str, resolution: Option<String>, est_size: Option<u64>) -> Self {
        let label = match est_size {
            Some(size) => format!("{} (~{})", quality, format_bytes(size)),
            None => quality.to_string(),
        };
        FormatOption {
            id: quality.to_string(),
            label,
            resolution,
            audio_only: false,
            est_size,
        }
    }

    fn audio(est_size: Option<u64>) -> Self {
        let label = match est_size {
            Some(size) => format!("Audio / MP3 (~{})", format_bytes(size)),
            None => "Audio / MP3".to_string(),
        };
        FormatOption {
            id: "audio".to_string(),
            label,
            resolution: None,
            audio_only: true,
            est_size,
        }
    }

    /// yt-dlp `-f` selector for this option.
    ///
    /// Video tiers cap the height and merge with best audio, falling back
    /// to a combined stream when no separate tracks exist.
    pub fn selector(&self) -> String {
        if self.audio_only {
            return "bestaudio/best".to_string();
        }
        match self.id.as_str() {
            "1080p" => "bv*[height<=1080]+ba/b[height<=1080]/b".to_string(),
            "720p" => "bv*[height<=720]+ba/b[height<=720]/b".to_string(),
            "480p" => "bv*[height<=480]+ba/b[height<=480]/b".to_string(),
            "360p" => "bv*[height<=360]+ba/b[height<=360]/b".to_string(),
            _ => "bv*+ba/b".to_string(),
        }
    }

    /// File extension of the artifact this option produces.
    pub fn extension(&self) -> &'static str {
        if self.audio_only {
            "m4a"
        } else {
            "mp4"
        }
    }
}

/// Result of probing one URL.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub title: String,
    pub duration_secs: Option<u64>,
    pub formats: Vec<FormatOption>,
}

/// Probes the URL with `yt-dlp -J --no-playlist` and extracts the catalog.
///
/// Fails with `ProbeTimeout` when the bounded wait elapses and
/// `UnsupportedSource` when yt-dlp rejects the URL or reports no
/// playable streams.
pub async fn probe_formats(url: &Url) -> AppResult<ProbeResult> {
    let probe_timeout = config::probe::timeout();

    let output = match timeout(
        probe_timeout,
        Command::new(config::YTDL_BIN.as_str())
            .arg("-J")
            .arg("--no-playlist")
            .arg(url.as_str())
            .output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(AppError::Io(e)),
        Err(_) => return Err(AppError::ProbeTimeout(probe_timeout.as_secs())),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
        log::warn!("yt-dlp probe failed for {}: {}", url, tail);
        return Err(AppError::UnsupportedSource(tail));
    }

    let json: Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| AppError::UnsupportedSource(format!("unparseable metadata: {}", e)))?;

    let title = json
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("media")
        .to_string();
    let duration_secs = json.get("duration").and_then(|v| v.as_f64()).map(|d| d as u64);

    let formats = extract_format_options(&json);
    if formats.is_empty() {
        return Err(AppError::UnsupportedSource("no playable streams".to_string()));
    }

    Ok(ProbeResult {
        title,
        duration_secs,
        formats,
    })
}

fn parse_resolution_string(resolution: &str) -> Option<(u64, u64)> {
    let mut parts = resolution.split('x');
    let width_part = parts.next()?;
    let height_part = parts.next()?;

    let width_str: String = width_part.chars().filter(|c| c.is_ascii_digit()).collect();
    let height_str: String = height_part.chars().filter(|c| c.is_ascii_digit()).collect();

    if width_str.is_empty() || height_str.is_empty() {
        return None;
    }

    Some((width_str.parse().ok()?, height_str.parse().ok()?))
}

fn quality_from_short_side(short_side: u64) -> Option<&'static str> {
    match short_side {
        1080 => Some("1080p"),
        720 => Some("720p"),
        480 => Some("480p"),
        360 => Some("360p"),
        _ => None,
    }
}

fn quality_from_dimensions(width: Option<u64>, height: Option<u64>) -> Option<&'static str> {
    let short_side = match (width, height) {
        (Some(w), Some(h)) => w.min(h),
        (Some(w), None) => w,
        (None, Some(h)) => h,
        _ => return None,
    };

    quality_from_short_side(short_side)
}

fn quality_from_note(note: &str) -> Option<&'static str> {
    let lowered = note.to_ascii_lowercase();
    if lowered.contains("1080") {
        Some("1080p")
    } else if lowered.contains("720") {
        Some("720p")
    } else if lowered.contains("480") {
        Some("480p")
    } else if lowered.contains("360") {
        Some("360p")
    } else {
        None
    }
}

fn stream_size(format: &Value) -> Option<u64> {
    format
        .get("filesize")
        .or_else(|| format.get("filesize_approx"))
        .and_then(|v| v.as_u64())
}

/// Builds the ordered catalog from a yt-dlp `-J` format list.
///
/// Video-only streams get the best audio stream's size added so the
/// label reflects the merged file. Per quality tier the largest known
/// stream wins.
pub fn extract_format_options(json: &Value) -> Vec<FormatOption> {
    let formats = match json.get("formats").and_then(|v| v.as_array()) {
        Some(formats) => formats,
        None => return Vec::new(),
    };

    let mut best_audio_size: Option<u64> = None;
    let mut has_audio = false;
    for format in formats {
        let vcodec = format.get("vcodec").and_then(|v| v.as_str()).unwrap_or("");
        let acodec = format.get("acodec").and_then(|v| v.as_str()).unwrap_or("");
        if vcodec != "none" {
            continue;
        }
        if acodec != "none" {
            has_audio = true;
        }
        if let Some(size) = stream_size(format) {
            if best_audio_size.is_none_or(|current| size > current) {
                best_audio_size = Some(size);
            }
        }
    }

    let mut by_quality: HashMap<&'static str, (Option<String>, Option<u64>)> = HashMap::new();

    for format in formats {
        let vcodec = format.get("vcodec").and_then(|v| v.as_str()).unwrap_or("");
        if vcodec == "none" {
            continue;
        }
        // Combined streams carry audio too.
        if format.get("acodec").and_then(|v| v.as_str()).is_some_and(|a| a != "none") {
            has_audio = true;
        }

        let mut width = format.get("width").and_then(|v| v.as_u64());
        let mut height = format.get("height").and_then(|v| v.as_u64());
        let resolution_field = format.get("resolution").and_then(|v| v.as_str());

        if width.is_none() || height.is_none() {
            if let Some(resolution) = resolution_field {
                if let Some((parsed_width, parsed_height)) = parse_resolution_string(resolution) {
                    width = width.or(Some(parsed_width));
                    height = height.or(Some(parsed_height));
                }
            }
        }

        let mut quality = quality_from_dimensions(width, height);
        if quality.is_none() {
            if let Some(note) = format.get("format_note").and_then(|v| v.as_str()) {
                quality = quality_from_note(note);
            }
        }

        let quality = match quality {
            Some(value) => value,
            None => continue,
        };

        let mut size_bytes = stream_size(format);
        let acodec = format.get("acodec").and_then(|v| v.as_str()).unwrap_or("");
        if acodec == "none" {
            if let (Some(size), Some(audio_size)) = (size_bytes, best_audio_size) {
                size_bytes = Some(size + audio_size);
            }
        }

        let resolution = match (width, height) {
            (Some(w), Some(h)) => Some(format!("{}x{}", w, h)),
            _ => resolution_field
                .map(|value| value.to_string())
                .filter(|value| value != "unknown"),
        };

        let entry = by_quality.entry(quality).or_insert((None, None));
        let replace = match (entry.1, size_bytes) {
            (None, Some(_)) => true,
            (Some(current), Some(new)) => new > current,
            _ => false,
        };
        if replace {
            entry.1 = size_bytes;
        }
        if entry.0.is_none() {
            entry.0 = resolution;
        }
    }

    let mut ordered = Vec::new();
    for quality in ["1080p", "720p", "480p", "360p"] {
        if let Some((resolution, size_bytes)) = by_quality.remove(quality) {
            ordered.push(FormatOption::video(quality, resolution, size_bytes));
        }
    }

    if has_audio {
        ordered.push(FormatOption::audio(best_audio_size));
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    // ==================== parse_resolution_string tests ====================

    #[test]
    fn test_parse_resolution_string_standard() {
        assert_eq!(parse_resolution_string("1920x1080"), Some((1920, 1080)));
        assert_eq!(parse_resolution_string("1280x720"), Some((1280, 720)));
    }

    #[test]
    fn test_parse_resolution_string_invalid() {
        assert_eq!(parse_resolution_string(""), None);
        assert_eq!(parse_resolution_string("1920"), None);
        assert_eq!(parse_resolution_string("x1080"), None);
    }

    // ==================== quality helpers tests ====================

    #[test]
    fn test_quality_from_short_side() {
        assert_eq!(quality_from_short_side(1080), Some("1080p"));
        assert_eq!(quality_from_short_side(360), Some("360p"));
        assert_eq!(quality_from_short_side(1440), None);
    }

    #[test]
    fn test_quality_from_dimensions_portrait() {
        // Vertical video uses the short side.
        assert_eq!(quality_from_dimensions(Some(1080), Some(1920)), Some("1080p"));
    }

    #[test]
    fn test_quality_from_note() {
        assert_eq!(quality_from_note("720p HD"), Some("720p"));
        assert_eq!(quality_from_note("audio only"), None);
    }

    // ==================== extract_format_options tests ====================

    fn sample_json() -> Value {
        json!({
            "title": "Test Video",
            "duration": 120.0,
            "formats": [
                {"format_id": "140", "vcodec": "none", "acodec": "mp4a", "filesize": 2_000_000},
                {"format_id": "137", "vcodec": "avc1", "acodec": "none",
                 "width": 1920, "height": 1080, "filesize": 50_000_000},
                {"format_id": "136", "vcodec": "avc1", "acodec": "none",
                 "width": 1280, "height": 720, "filesize": 30_000_000},
                {"format_id": "18", "vcodec": "avc1", "acodec": "mp4a",
                 "width": 640, "height": 360, "filesize": 10_000_000}
            ]
        })
    }

    #[test]
    fn test_extract_ordered_best_first() {
        let options = extract_format_options(&sample_json());
        let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["1080p", "720p", "360p", "audio"]);
    }

    #[test]
    fn test_extract_merges_audio_size_into_video_only() {
        let options = extract_format_options(&sample_json());
        // 1080p is video-only: 50MB video + 2MB best audio.
        assert_eq!(options[0].est_size, Some(52_000_000));
        // 360p is a combined stream: size untouched.
        let v360 = options.iter().find(|o| o.id == "360p").unwrap();
        assert_eq!(v360.est_size, Some(10_000_000));
    }

    #[test]
    fn test_extract_audio_entry_present() {
        let options = extract_format_options(&sample_json());
        let audio = options.last().unwrap();
        assert!(audio.audio_only);
        assert_eq!(audio.est_size, Some(2_000_000));
    }

    #[test]
    fn test_extract_empty_formats() {
        assert!(extract_format_options(&json!({"formats": []})).is_empty());
        assert!(extract_format_options(&json!({})).is_empty());
    }

    // ==================== selector tests ====================

    #[test]
    fn test_selector_caps_height() {
        let opt = FormatOption::video("720p", None, None);
        assert_eq!(opt.selector(), "bv*[height<=720]+ba/b[height<=720]/b");
    }

    #[test]
    fn test_selector_audio() {
        let opt = FormatOption::audio(None);
        assert_eq!(opt.selector(), "bestaudio/best");
        assert_eq!(opt.extension(), "m4a");
    }

    #[test]
    fn test_label_includes_size() {
        let opt = FormatOption::video("1080p", None, Some(52_000_000));
        assert!(opt.label.starts_with("1080p (~"));
        let bare = FormatOption::video("480p", None, None);
        assert_eq!(bare.label, "480p");
    }
}
