use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::{
    ytdlp::YtDlp, MusicSource, QueryShape, Resolved, SearchClient, SourceKind, StreamHint, Track,
    TrackId,
};
use crate::error::ProviderError;

const AUDIO_EXTENSIONS: [&str; 7] = [".mp3", ".wav", ".ogg", ".flac", ".m4a", ".opus", ".webm"];

/// Direct-link provider.
///
/// Pages and playlists yt-dlp understands are expanded through it; plain
/// audio-file URLs that yt-dlp refuses are played as-is over HTTP.
pub struct DirectUrlClient {
    ytdlp: Arc<YtDlp>,
    max_playlist_size: usize,
}

impl DirectUrlClient {
    pub fn new(ytdlp: Arc<YtDlp>, max_playlist_size: usize) -> Self {
        Self {
            ytdlp,
            max_playlist_size,
        }
    }

    pub fn is_audio_file(url: &Url) -> bool {
        let path = url.path().to_lowercase();
        AUDIO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    /// Descriptor for a bare media file; the title is the decoded file name.
    pub fn bare_track(url: &Url) -> Track {
        let title = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .map(|name| {
                urlencoding::decode(name)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or_else(|_| name.to_string())
            })
            .unwrap_or_else(|| url.to_string());

        Track::new(
            TrackId {
                kind: SourceKind::Direct,
                id: url.to_string(),
            },
            title,
            url.to_string(),
            StreamHint::Http(url.to_string()),
        )
    }
}

#[async_trait]
impl MusicSource for DirectUrlClient {
    fn accepts(&self, shape: &QueryShape) -> bool {
        matches!(shape, QueryShape::Direct(_))
    }

    async fn resolve(&self, shape: &QueryShape) -> Result<Vec<Resolved>, ProviderError> {
        let QueryShape::Direct(url) = shape else {
            return Err(ProviderError::Rejected("direct loader only accepts URLs".into()));
        };

        info!("🔗 Loading link: {}", url);

        match self.ytdlp.dump(url.as_str(), Some(self.max_playlist_size)).await {
            Ok(entries) if !entries.is_empty() => Ok(entries
                .into_iter()
                .filter_map(|info| info.into_track(SourceKind::Direct))
                .take(self.max_playlist_size)
                .map(Resolved::Playable)
                .collect()),
            Ok(_) | Err(ProviderError::NotFound(_)) | Err(ProviderError::Rejected(_))
                if Self::is_audio_file(url) && !SearchClient::is_youtube_url(url.as_str()) =>
            {
                debug!("yt-dlp can't extract {}, playing it as a plain file", url);
                Ok(vec![Resolved::Playable(Self::bare_track(url))])
            }
            Ok(_) => Err(ProviderError::NotFound(url.to_string())),
            Err(e) => Err(e),
        }
    }

    fn source_name(&self) -> &'static str {
        "direct"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_files_are_detected_by_extension() {
        let mp3 = Url::parse("https://cdn.example.com/music/Track%20One.MP3").expect("url");
        let page = Url::parse("https://example.com/watch?v=abc").expect("url");
        assert!(DirectUrlClient::is_audio_file(&mp3));
        assert!(!DirectUrlClient::is_audio_file(&page));
    }

    #[test]
    fn bare_tracks_use_the_decoded_file_name() {
        let url = Url::parse("https://cdn.example.com/music/Track%20One.mp3").expect("url");
        let track = DirectUrlClient::bare_track(&url);
        assert_eq!(track.title(), "Track One.mp3");
        assert_eq!(track.id().kind, SourceKind::Direct);
        assert_eq!(track.stream(), &StreamHint::Http(url.to_string()));
        assert_eq!(track.duration(), None);
    }

    #[tokio::test]
    async fn spawn_failures_stay_transient() {
        let client = DirectUrlClient::new(
            Arc::new(YtDlp::with_binary("/nonexistent/yt-dlp-for-tests")),
            10,
        );
        let url = Url::parse("https://cdn.example.com/a.ogg").expect("url");

        // Spawning the binary fails, which is transient, so no fallback.
        let result = client.resolve(&QueryShape::Direct(url)).await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
    }
}
