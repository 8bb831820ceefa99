use futures::{stream, StreamExt};
use serenity::model::id::UserId;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{MusicSource, QueryShape, Resolved, Track, TrackMetadata};
use crate::cache::{CacheKey, ResolutionCache};
use crate::error::{ProviderError, ResolutionError, ResolutionFailure};

/// Tuning knobs for [`TrackResolver`].
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Upper bound for one provider call; hitting it counts as transient.
    pub timeout: Duration,
    pub retries: u32,
    pub max_playlist_size: usize,
    /// How many metadata items are re-resolved at once.
    pub expansion_concurrency: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            retries: 1,
            max_playlist_size: 100,
            expansion_concurrency: 4,
        }
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Playable tracks in source order, stamped with the requester.
    pub tracks: Vec<Track>,
    /// Sub-tracks that could not be resolved.
    pub failures: Vec<ResolutionFailure>,
    pub from_cache: bool,
}

impl Resolution {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Routes a query to the one provider that accepts its shape, expands
/// metadata-only results through the search provider and caches complete
/// answers.
pub struct TrackResolver {
    search: Arc<dyn MusicSource>,
    sources: Vec<Arc<dyn MusicSource>>,
    cache: Arc<ResolutionCache>,
    settings: ResolverSettings,
}

impl TrackResolver {
    pub fn new(search: Arc<dyn MusicSource>, cache: Arc<ResolutionCache>, settings: ResolverSettings) -> Self {
        Self {
            search,
            sources: Vec::new(),
            cache,
            settings,
        }
    }

    /// Registers a provider for URLs or platform references.
    pub fn with_source(mut self, source: Arc<dyn MusicSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    fn provider_for(&self, shape: &QueryShape) -> Option<&Arc<dyn MusicSource>> {
        match shape {
            QueryShape::Search(_) => Some(&self.search),
            _ => self.sources.iter().find(|source| source.accepts(shape)),
        }
    }

    pub async fn resolve(&self, query: &str, requester: UserId) -> Result<Resolution, ResolutionError> {
        let shape = QueryShape::classify(query).ok_or(ResolutionError::EmptyQuery)?;
        let provider = self
            .provider_for(&shape)
            .ok_or_else(|| ResolutionError::Unsupported(query.trim().to_string()))?;

        let key = CacheKey::new(provider.source_name(), &shape.as_query());
        if let Some(tracks) = self.cache.get(&key) {
            debug!("💾 Cache hit for {} ({} tracks)", key.query(), tracks.len());
            return Ok(Resolution {
                tracks: stamp(tracks, requester),
                failures: Vec::new(),
                from_cache: true,
            });
        }

        let results = self.call(provider.as_ref(), &shape).await.map_err(|error| match error {
            ProviderError::NotFound(_) => ResolutionError::NotFound(query.trim().to_string()),
            error => ResolutionError::Provider {
                query: query.trim().to_string(),
                provider: provider.source_name(),
                error,
            },
        })?;

        let expanded: Vec<Result<Track, ResolutionFailure>> = stream::iter(
            results.into_iter().take(self.settings.max_playlist_size),
        )
        .map(|item| self.playable(item))
        .buffered(self.settings.expansion_concurrency.max(1))
        .collect()
        .await;

        let mut tracks = Vec::with_capacity(expanded.len());
        let mut failures = Vec::new();
        for item in expanded {
            match item {
                Ok(track) => tracks.push(track),
                Err(failure) => {
                    warn!("⚠️ Couldn't resolve {}: {}", failure.query, failure.reason);
                    failures.push(failure);
                }
            }
        }

        if tracks.is_empty() {
            return Err(if failures.is_empty() {
                ResolutionError::NotFound(query.trim().to_string())
            } else {
                ResolutionError::AllFailed {
                    query: query.trim().to_string(),
                    failures,
                }
            });
        }

        // A partial answer would pin the failures for the whole TTL.
        if failures.is_empty() {
            self.cache.insert(key, tracks.clone());
        }

        info!(
            "✅ Resolved {} via {}: {} tracks, {} failed",
            query.trim(),
            provider.source_name(),
            tracks.len(),
            failures.len()
        );

        Ok(Resolution {
            tracks: stamp(tracks, requester),
            failures,
            from_cache: false,
        })
    }

    /// Second stage: metadata is searched as `"<artist> - <title>"`.
    async fn playable(&self, item: Resolved) -> Result<Track, ResolutionFailure> {
        let meta = match item {
            Resolved::Playable(track) => return Ok(track),
            Resolved::Metadata(meta) => meta,
        };

        let query = meta.search_query();
        self.search_one(&query)
            .await
            .map(|track| track.with_metadata_of(&meta))
            .map_err(|error| ResolutionFailure {
                query,
                reason: error.to_string(),
            })
    }

    async fn search_one(&self, query: &str) -> Result<Track, ProviderError> {
        let key = CacheKey::new(self.search.source_name(), query);
        if let Some(track) = self.cache.get(&key).and_then(|tracks| tracks.into_iter().next()) {
            return Ok(track);
        }

        let track = self
            .call(self.search.as_ref(), &QueryShape::Search(query.to_string()))
            .await?
            .into_iter()
            .find_map(|item| match item {
                Resolved::Playable(track) => Some(track),
                Resolved::Metadata(_) => None,
            })
            .ok_or_else(|| ProviderError::NotFound(query.to_string()))?;

        self.cache.insert(key, vec![track.clone()]);
        Ok(track)
    }

    /// One provider call with timeout and transient retries.
    async fn call(&self, provider: &dyn MusicSource, shape: &QueryShape) -> Result<Vec<Resolved>, ProviderError> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.settings.timeout, provider.resolve(shape)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Transient(format!(
                    "{} timed out after {:?}",
                    provider.source_name(),
                    self.settings.timeout
                ))),
            };

            match result {
                Err(error) if error.is_transient() && attempt < self.settings.retries => {
                    attempt += 1;
                    warn!(
                        "🔄 {} failed ({}), retry {}/{}",
                        provider.source_name(),
                        error,
                        attempt,
                        self.settings.retries
                    );
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
                other => return other,
            }
        }
    }
}

fn stamp(tracks: Vec<Track>, requester: UserId) -> Vec<Track> {
    tracks.into_iter().map(|track| track.requested(requester)).collect()
}

/// Used by tests across the crate.
#[cfg(test)]
pub(crate) fn test_track(id: &str) -> Track {
    use super::{SourceKind, StreamHint, TrackId};

    Track::new(
        TrackId {
            kind: SourceKind::Search,
            id: id.to_string(),
        },
        id.to_string(),
        format!("https://youtu.be/{}", id),
        StreamHint::Extractor(format!("https://youtu.be/{}", id)),
    )
}

#[cfg(test)]
pub(crate) fn test_metadata(title: &str) -> TrackMetadata {
    TrackMetadata {
        id: format!("sp-{}", title.to_lowercase()),
        title: title.to_string(),
        artist: Some("Artist".into()),
        duration: Some(Duration::from_secs(180)),
        thumbnail: None,
        url: format!("https://open.spotify.com/track/{}", title.to_lowercase()),
    }
}
