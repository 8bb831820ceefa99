use regex::Regex;
use serde::Deserialize;
use std::{sync::LazyLock, time::Duration};
use tracing::debug;
use url::Url;

use crate::error::ProviderError;

const LYRICS_TIMEOUT: Duration = Duration::from_secs(7);

/// `[mm:ss.xx]` stamps at the start of synced lines.
static TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\[\d{1,3}:\d{2}(?:[.:]\d{1,3})?\])+\s?").expect("valid timestamp regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lyrics {
    pub title: String,
    pub artist: Option<String>,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LrclibItem {
    track_name: String,
    #[serde(default)]
    artist_name: Option<String>,
    #[serde(default)]
    plain_lyrics: Option<String>,
    #[serde(default)]
    synced_lyrics: Option<String>,
    #[serde(default)]
    instrumental: bool,
}

/// Lyrics lookups against an lrclib-compatible search API.
pub struct LyricsClient {
    http: reqwest::Client,
    base_url: String,
}

impl LyricsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(LYRICS_TIMEOUT)
                .user_agent(concat!("open-radio/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn search(&self, query: &str) -> Result<Lyrics, ProviderError> {
        let mut url = Url::parse(&format!("{}/api/search", self.base_url))
            .map_err(|e| ProviderError::Rejected(format!("bad lyrics endpoint: {}", e)))?;
        url.query_pairs_mut().append_pair("q", query);

        debug!("🎼 Looking up lyrics for `{}`", query);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Transient(format!("lyrics service answered {}", status)));
        }
        if !status.is_success() {
            return Err(ProviderError::NotFound(query.to_string()));
        }

        let items: Vec<LrclibItem> = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable lyrics answer: {}", e)))?;
        pick(items).ok_or_else(|| ProviderError::NotFound(query.to_string()))
    }
}

/// First match with any text. Plain lyrics win over synced ones.
fn pick(items: Vec<LrclibItem>) -> Option<Lyrics> {
    items.into_iter().filter(|item| !item.instrumental).find_map(|item| {
        let text = match (item.plain_lyrics, item.synced_lyrics) {
            (Some(plain), _) if !plain.trim().is_empty() => plain.trim().to_string(),
            (_, Some(synced)) if !synced.trim().is_empty() => strip_timestamps(&synced),
            _ => return None,
        };
        Some(Lyrics {
            title: item.track_name,
            artist: item.artist_name.filter(|a| !a.is_empty()),
            text,
        })
    })
}

fn strip_timestamps(synced: &str) -> String {
    synced
        .lines()
        .map(|line| TIMESTAMP.replace(line, "").into_owned())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
