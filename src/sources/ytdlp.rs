use async_process::Command;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use super::{SourceKind, StreamHint, Track, TrackId};
use crate::error::ProviderError;

/// Information extracted by `yt-dlp --dump-json`.
///
/// Flat playlist entries only carry `url`, full extractions carry
/// `webpage_url`.
#[derive(Debug, Clone, Deserialize)]
pub struct YtDlpInfo {
    pub id: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub url: Option<String>,
    pub is_live: Option<bool>,
}

impl YtDlpInfo {
    pub fn page_url(&self) -> Option<&str> {
        self.webpage_url.as_deref().or(self.url.as_deref())
    }

    pub fn into_track(self, kind: SourceKind) -> Option<Track> {
        let url = self.page_url()?.to_string();
        let title = self
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| url.clone());

        let mut track = Track::new(
            TrackId { kind, id: self.id.clone() },
            title,
            url.clone(),
            StreamHint::Extractor(url),
        );

        if let Some(artist) = self.uploader.or(self.channel) {
            track = track.with_artist(artist);
        }
        // Live streams report no (or a bogus) duration.
        if !self.is_live.unwrap_or(false) {
            if let Some(seconds) = self.duration.filter(|d| d.is_finite() && *d >= 0.0) {
                track = track.with_duration(Duration::from_secs_f64(seconds));
            }
        }
        if let Some(thumbnail) = self.thumbnail {
            track = track.with_thumbnail(thumbnail);
        }

        Some(track)
    }
}

/// Thin wrapper around the `yt-dlp` binary.
pub struct YtDlp {
    binary: String,
    // Limit concurrent extractions to avoid upstream rate limiting
    permits: Semaphore,
}

impl YtDlp {
    pub fn new() -> Self {
        Self::with_binary("yt-dlp")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            permits: Semaphore::new(3),
        }
    }

    /// Runs `yt-dlp --dump-json` on `target` (a URL or `ytsearchN:` query).
    /// `playlist_end` caps playlist expansion.
    pub async fn dump(&self, target: &str, playlist_end: Option<usize>) -> Result<Vec<YtDlpInfo>, ProviderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Transient("yt-dlp runner shut down".into()))?;

        debug!("📊 yt-dlp dump: {}", target);

        let mut command = Command::new(&self.binary);
        command.args([
            "--dump-json",
            "--flat-playlist",
            "--skip-download",
            "--no-warnings",
            "--socket-timeout",
            "15",
        ]);
        if let Some(end) = playlist_end {
            command.args(["--playlist-end", &end.to_string()]);
        }
        command.arg(target).kill_on_drop(true);

        let output = command
            .output()
            .await
            .map_err(|e| ProviderError::Transient(format!("failed to run yt-dlp: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let entries = parse_dump(&stdout);

        if !output.status.success() && entries.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(target, &stderr));
        }

        Ok(entries)
    }

    /// `yt-dlp --version`, used by the health check.
    pub async fn version(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.binary).arg("--version").output().await?;
        if !output.status.success() {
            anyhow::bail!("yt-dlp exited with {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new()
    }
}

/// One JSON document per line; unparsable lines are skipped.
pub(crate) fn parse_dump(stdout: &str) -> Vec<YtDlpInfo> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<YtDlpInfo>(line).ok())
        .collect()
}

pub(crate) fn classify_failure(target: &str, stderr: &str) -> ProviderError {
    let lower = stderr.to_lowercase();
    let reason = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("yt-dlp failed")
        .trim()
        .to_string();

    if lower.contains("http error 429")
        || lower.contains("timed out")
        || lower.contains("temporary failure")
        || lower.contains("connection reset")
        || lower.contains("http error 5")
    {
        ProviderError::Transient(reason)
    } else if lower.contains("unsupported url")
        || lower.contains("video unavailable")
        || lower.contains("not found")
        || lower.contains("private video")
        || lower.contains("does not exist")
    {
        ProviderError::NotFound(target.to_string())
    } else {
        ProviderError::Rejected(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SEARCH_OUTPUT: &str = r#"{"id": "dQw4w9WgXcQ", "title": "Never Gonna Give You Up", "duration": 213.0, "uploader": "Rick Astley", "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ", "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg"}
not json at all
{"id": "abc", "title": "Flat entry", "url": "https://www.youtube.com/watch?v=abc", "channel": "Someone"}
"#;

    #[test]
    fn dump_output_is_parsed_line_by_line() {
        let entries = parse_dump(SEARCH_OUTPUT);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].page_url(), Some("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn info_becomes_a_track() {
        let track = parse_dump(SEARCH_OUTPUT)
            .remove(0)
            .into_track(SourceKind::Search)
            .expect("has a url");

        assert_eq!(track.title(), "Never Gonna Give You Up");
        assert_eq!(track.artist(), Some("Rick Astley"));
        assert_eq!(track.duration(), Some(Duration::from_secs(213)));
        assert_eq!(
            track.stream(),
            &StreamHint::Extractor("https://www.youtube.com/watch?v=dQw4w9WgXcQ".into())
        );
    }

    #[test]
    fn live_streams_have_unknown_duration() {
        let info: YtDlpInfo = serde_json::from_str(
            r#"{"id": "live", "title": "Lofi radio", "duration": 0.0, "is_live": true, "webpage_url": "https://youtu.be/live"}"#,
        )
        .expect("valid json");
        let track = info.into_track(SourceKind::Direct).expect("has a url");
        assert_eq!(track.duration(), None);
    }

    #[test]
    fn failures_are_classified() {
        assert!(classify_failure("q", "ERROR: HTTP Error 429: Too Many Requests").is_transient());
        assert_eq!(
            classify_failure("https://x.test/a", "ERROR: Unsupported URL: https://x.test/a"),
            ProviderError::NotFound("https://x.test/a".into())
        );
        assert!(matches!(
            classify_failure("q", "ERROR: Sign in to confirm your age"),
            ProviderError::Rejected(_)
        ));
    }
}
