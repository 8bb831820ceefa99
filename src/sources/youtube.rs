use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};
use tracing::info;

use super::{ytdlp::YtDlp, MusicSource, QueryShape, Resolved, SourceKind};
use crate::error::ProviderError;

/// Which site free-text queries are searched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    #[default]
    YouTube,
    SoundCloud,
}

impl SearchEngine {
    fn prefix(self) -> &'static str {
        match self {
            Self::YouTube => "ytsearch1",
            Self::SoundCloud => "scsearch1",
        }
    }
}

impl FromStr for SearchEngine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "youtube" | "yt" => Ok(Self::YouTube),
            "soundcloud" | "sc" => Ok(Self::SoundCloud),
            other => anyhow::bail!("unknown search engine `{}` (expected youtube or soundcloud)", other),
        }
    }
}

impl fmt::Display for SearchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::YouTube => f.write_str("youtube"),
            Self::SoundCloud => f.write_str("soundcloud"),
        }
    }
}

/// Default search provider: asks yt-dlp for the best match of a free-text
/// query.
pub struct SearchClient {
    ytdlp: Arc<YtDlp>,
    engine: SearchEngine,
}

impl SearchClient {
    pub fn new(ytdlp: Arc<YtDlp>, engine: SearchEngine) -> Self {
        Self { ytdlp, engine }
    }

    pub fn is_youtube_url(url: &str) -> bool {
        url.contains("youtube.com/") || url.contains("youtu.be/")
    }
}

#[async_trait]
impl MusicSource for SearchClient {
    fn accepts(&self, shape: &QueryShape) -> bool {
        matches!(shape, QueryShape::Search(_))
    }

    async fn resolve(&self, shape: &QueryShape) -> Result<Vec<Resolved>, ProviderError> {
        let QueryShape::Search(text) = shape else {
            return Err(ProviderError::Rejected("search only accepts free text".into()));
        };

        info!("🔍 Searching {}: {}", self.engine, text);
        let target = format!("{}:{}", self.engine.prefix(), text);

        let tracks: Vec<Resolved> = self
            .ytdlp
            .dump(&target, None)
            .await?
            .into_iter()
            .filter_map(|info| info.into_track(SourceKind::Search))
            .map(Resolved::Playable)
            .take(1)
            .collect();

        if tracks.is_empty() {
            return Err(ProviderError::NotFound(text.clone()));
        }
        Ok(tracks)
    }

    fn source_name(&self) -> &'static str {
        match self.engine {
            SearchEngine::YouTube => "youtube",
            SearchEngine::SoundCloud => "soundcloud",
        }
    }
}
