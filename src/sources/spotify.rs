use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{MusicSource, QueryShape, Resolved, SpotifyKind, SpotifyRef, TrackMetadata};
use crate::error::ProviderError;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_URL: &str = "https://api.spotify.com/v1";

/// Spotify Web API client (client-credentials flow).
///
/// Spotify never yields audio, only metadata; every item comes back as
/// [`Resolved::Metadata`].
pub struct SpotifyClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<AccessToken>>,
    max_tracks: usize,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    track: Option<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    id: Option<String>,
    name: String,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
    duration_ms: Option<u64>,
    #[serde(default)]
    external_urls: ExternalUrls,
    album: Option<SpotifyAlbum>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyAlbum {
    #[serde(default)]
    images: Vec<SpotifyImage>,
}

#[derive(Debug, Deserialize)]
struct SpotifyImage {
    url: String,
}

impl SpotifyTrack {
    /// Local files and removed tracks have no id and are skipped.
    fn into_metadata(self) -> Option<TrackMetadata> {
        let id = self.id?;
        let artist = if self.artists.is_empty() {
            None
        } else {
            Some(
                self.artists
                    .iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        };

        Some(TrackMetadata {
            url: self
                .external_urls
                .spotify
                .unwrap_or_else(|| format!("https://open.spotify.com/track/{}", id)),
            id,
            title: self.name,
            artist,
            duration: self.duration_ms.map(Duration::from_millis),
            thumbnail: self
                .album
                .and_then(|album| album.images.into_iter().next())
                .map(|image| image.url),
        })
    }
}

impl SpotifyClient {
    pub fn new(client_id: String, client_secret: String, max_tracks: usize) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            client_id,
            client_secret,
            token: Mutex::new(None),
            max_tracks,
        }
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.token.lock().as_ref() {
            if token.expires_at > Instant::now() + Duration::from_secs(30) {
                return Ok(token.value.clone());
            }
        }

        debug!("🔑 Requesting Spotify access token");
        let credentials = STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
        let response = self
            .http
            .post(TOKEN_URL)
            .header("Authorization", format!("Basic {}", credentials))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(request_error)?;

        let token: TokenResponse = check_status(response, "token")
            .await?
            .json()
            .await
            .map_err(request_error)?;

        let value = token.access_token.clone();
        *self.token.lock() = Some(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(request_error)?;

        check_status(response, url)
            .await?
            .json()
            .await
            .map_err(request_error)
    }

    /// Follows `next` links until the cap is reached.
    async fn collect_pages<T, F>(&self, first: String, mut extract: F) -> Result<Vec<TrackMetadata>, ProviderError>
    where
        T: DeserializeOwned,
        F: FnMut(T) -> Option<SpotifyTrack>,
    {
        let mut tracks = Vec::new();
        let mut next = Some(first);

        while let Some(url) = next.take() {
            let page: Page<T> = self.get(&url).await?;
            tracks.extend(page.items.into_iter().filter_map(&mut extract).filter_map(SpotifyTrack::into_metadata));

            if tracks.len() >= self.max_tracks {
                tracks.truncate(self.max_tracks);
                break;
            }
            next = page.next;
        }

        Ok(tracks)
    }

    pub async fn lookup(&self, reference: &SpotifyRef) -> Result<Vec<TrackMetadata>, ProviderError> {
        info!("🟢 Spotify lookup: {}", reference.uri());

        let tracks = match reference.kind {
            SpotifyKind::Track => {
                let track: SpotifyTrack = self.get(&format!("{}/tracks/{}", API_URL, reference.id)).await?;
                track.into_metadata().into_iter().collect()
            }
            SpotifyKind::Album => {
                self.collect_pages(
                    format!("{}/albums/{}/tracks?limit=50", API_URL, reference.id),
                    Some::<SpotifyTrack>,
                )
                .await?
            }
            SpotifyKind::Playlist => {
                self.collect_pages(
                    format!("{}/playlists/{}/tracks?limit=100", API_URL, reference.id),
                    |item: PlaylistItem| item.track,
                )
                .await?
            }
        };

        if tracks.is_empty() {
            return Err(ProviderError::NotFound(reference.uri()));
        }
        Ok(tracks)
    }
}

#[async_trait]
impl MusicSource for SpotifyClient {
    fn accepts(&self, shape: &QueryShape) -> bool {
        matches!(shape, QueryShape::Spotify(_))
    }

    async fn resolve(&self, shape: &QueryShape) -> Result<Vec<Resolved>, ProviderError> {
        let QueryShape::Spotify(reference) = shape else {
            return Err(ProviderError::Rejected("not a Spotify reference".into()));
        };

        Ok(self
            .lookup(reference)
            .await?
            .into_iter()
            .map(Resolved::Metadata)
            .collect())
    }

    fn source_name(&self) -> &'static str {
        "spotify"
    }
}

fn request_error(error: reqwest::Error) -> ProviderError {
    ProviderError::Transient(error.to_string())
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(status_error(status, what))
}

fn status_error(status: StatusCode, what: &str) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => ProviderError::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Rejected(format!("Spotify refused credentials ({})", status))
        }
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            ProviderError::Transient(format!("Spotify answered {}", status))
        }
        s => ProviderError::Rejected(format!("Spotify answered {}", s)),
    }
}
