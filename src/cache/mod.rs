//! # Cache Module
//!
//! Short-lived resolution cache for Open Radio.
//!
//! Resolving a query means spawning yt-dlp or calling the Spotify API, which
//! takes seconds. Requests repeat a lot (the same song gets queued again, the
//! same playlist gets loaded by several guilds), so resolved track lists are
//! kept for a while keyed by the normalized query and the provider that
//! answered it.
//!
//! ## Semantics
//!
//! - **Advisory only**: a miss or an expired entry costs latency, never
//!   changes what a query resolves to.
//! - **TTL per entry**: entries expire independently (`CACHE_TTL`, default
//!   30 minutes) so upstream catalog changes are picked up.
//! - **Lazy + active expiry**: reads never return an expired entry, and a
//!   sweep task (`CACHE_SWEEP_INTERVAL`) drops entries nobody reads.
//! - **Shared**: one cache for every guild, safe for concurrent use.
//!
//! ## Example
//!
//! ```rust,no_run
//! use open_radio::cache::{CacheKey, ResolutionCache};
//! use std::time::Duration;
//!
//! let cache = ResolutionCache::new(Duration::from_secs(1800));
//! let key = CacheKey::new("youtube", "  Daft   Punk - Around The World ");
//! assert_eq!(key.query(), "daft punk - around the world");
//! cache.insert(key.clone(), Vec::new());
//! assert!(cache.get(&key).is_some());
//! ```

pub mod ttl_cache;

pub use ttl_cache::{CacheMetrics, TtlCache};

use crate::sources::Track;

/// Cache shared by every guild's resolver calls.
pub type ResolutionCache = TtlCache<CacheKey, Vec<Track>>;

/// Normalized query plus the identity of the provider that resolved it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    provider: &'static str,
    query: String,
}

impl CacheKey {
    pub fn new(provider: &'static str, query: &str) -> Self {
        Self {
            provider,
            query: normalize_query(query),
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

/// Case-folds and collapses runs of whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
