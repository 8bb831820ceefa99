pub mod direct_url;
pub mod lyrics;
pub mod resolver;
pub mod spotify;
pub mod youtube;
pub mod ytdlp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{sync::LazyLock, time::Duration};
use url::Url;

use crate::error::ProviderError;

pub use direct_url::DirectUrlClient;
pub use lyrics::{Lyrics, LyricsClient};
pub use resolver::{Resolution, ResolverSettings, TrackResolver};
pub use spotify::SpotifyClient;
pub use youtube::{SearchClient, SearchEngine};

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://[-a-zA-Z0-9+&@#/%?=~_|!:,.;]*[-a-zA-Z0-9+&@#/%=~_|]?$")
        .expect("valid url regex")
});

static SPOTIFY_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:www\.)?open\.spotify\.com/(?:intl-[a-zA-Z-]+/)?(?:user/[a-zA-Z0-9_-]+/)?(?P<kind>track|album|playlist)/(?P<id>[a-zA-Z0-9]+)",
    )
    .expect("valid spotify url regex")
});

static SPOTIFY_URI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^spotify:(?P<kind>track|album|playlist):(?P<id>[a-zA-Z0-9]+)$")
        .expect("valid spotify uri regex")
});

/// Common interface for every source provider.
///
/// A provider declares which query shapes it accepts and returns zero or more
/// normalized results. Providers that only know metadata (Spotify) return
/// [`Resolved::Metadata`] and let the resolver find a playable stream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MusicSource: Send + Sync {
    fn accepts(&self, shape: &QueryShape) -> bool;

    async fn resolve(&self, shape: &QueryShape) -> Result<Vec<Resolved>, ProviderError>;

    /// Stable provider name, also part of the cache key.
    fn source_name(&self) -> &'static str;
}

/// What a provider hands back for one query.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Playable(Track),
    /// Metadata without a stream; re-resolved through the search provider.
    Metadata(TrackMetadata),
}

/// Shape of a user query, decided before any provider is asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryShape {
    Direct(Url),
    Spotify(SpotifyRef),
    Search(String),
}

impl QueryShape {
    /// Returns `None` for a blank query.
    pub fn classify(query: &str) -> Option<Self> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }

        if let Some(reference) = SpotifyRef::parse(query) {
            return Some(Self::Spotify(reference));
        }

        if URL_PATTERN.is_match(query) {
            if let Ok(url) = Url::parse(query) {
                return Some(Self::Direct(url));
            }
        }

        Some(Self::Search(query.to_string()))
    }

    pub fn as_query(&self) -> String {
        match self {
            Self::Direct(url) => url.to_string(),
            Self::Spotify(reference) => reference.uri(),
            Self::Search(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpotifyKind {
    Track,
    Album,
    Playlist,
}

/// A Spotify track/album/playlist reference, from either a share URL or a
/// `spotify:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpotifyRef {
    pub kind: SpotifyKind,
    pub id: String,
}

impl SpotifyRef {
    pub fn parse(query: &str) -> Option<Self> {
        let captures = SPOTIFY_URL_PATTERN
            .captures(query)
            .or_else(|| SPOTIFY_URI_PATTERN.captures(query))?;

        let kind = match &captures["kind"] {
            "track" => SpotifyKind::Track,
            "album" => SpotifyKind::Album,
            _ => SpotifyKind::Playlist,
        };

        Some(Self {
            kind,
            id: captures["id"].to_string(),
        })
    }

    pub fn uri(&self) -> String {
        let kind = match self.kind {
            SpotifyKind::Track => "track",
            SpotifyKind::Album => "album",
            SpotifyKind::Playlist => "playlist",
        };
        format!("spotify:{}:{}", kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Direct,
    Search,
    Spotify,
}

/// Identity of a track within a queue. Duplicates are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId {
    pub kind: SourceKind,
    pub id: String,
}

/// How the audio pipeline opens the stream once the track reaches the head
/// of the queue. Stream URLs expire, so only the hint is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum StreamHint {
    /// A page yt-dlp knows how to extract (YouTube, SoundCloud, ...).
    Extractor(String),
    /// A plain HTTP media file.
    Http(String),
}

/// Metadata-only result (Spotify).
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub duration: Option<Duration>,
    pub thumbnail: Option<String>,
    pub url: String,
}

impl TrackMetadata {
    /// Free-text query used to find a playable stream for this track.
    pub fn search_query(&self) -> String {
        match &self.artist {
            Some(artist) => format!("{} - {}", artist, self.title),
            None => self.title.clone(),
        }
    }
}

/// Immutable descriptor of a resolved, playable track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    id: TrackId,
    title: String,
    artist: Option<String>,
    /// `None` when unknown (live streams, bare files).
    duration: Option<Duration>,
    thumbnail: Option<String>,
    url: String,
    stream: StreamHint,
    requested_by: UserId,
    added_at: DateTime<Utc>,
}

impl Track {
    pub fn new(id: TrackId, title: String, url: String, stream: StreamHint) -> Self {
        Self {
            id,
            title,
            artist: None,
            duration: None,
            thumbnail: None,
            url,
            stream,
            // Providers don't know the requester; the resolver stamps it.
            requested_by: UserId::new(1),
            added_at: Utc::now(),
        }
    }

    // Getters
    pub fn id(&self) -> &TrackId {
        &self.id
    }
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn artist(&self) -> Option<&str> {
        self.artist.as_deref()
    }
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    pub fn stream(&self) -> &StreamHint {
        &self.stream
    }
    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }

    // Builders
    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    /// Keeps the stream but takes identity and display data from `meta`.
    /// Used for two-stage (Spotify → search) resolution.
    pub fn with_metadata_of(mut self, meta: &TrackMetadata) -> Self {
        self.id = TrackId {
            kind: SourceKind::Spotify,
            id: meta.id.clone(),
        };
        self.title = meta.title.clone();
        self.artist = meta.artist.clone().or(self.artist);
        self.duration = meta.duration.or(self.duration);
        self.thumbnail = meta.thumbnail.clone().or(self.thumbnail);
        self.url = meta.url.clone();
        self
    }

    /// Stamps the requester and enqueue time.
    pub fn requested(mut self, user: UserId) -> Self {
        self.requested_by = user;
        self.added_at = Utc::now();
        self
    }

    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            title: self.title.clone(),
            artist: self.artist.clone(),
            duration: self.duration,
            url: self.url.clone(),
            requested_by: self.requested_by,
            requested_at: self.added_at,
        }
    }
}

/// What the control surface gets to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackSummary {
    pub title: String,
    pub artist: Option<String>,
    pub duration: Option<Duration>,
    pub url: String,
    pub requested_by: UserId,
    pub requested_at: DateTime<Utc>,
}
