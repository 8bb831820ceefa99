use anyhow::{Context, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::audio::session::SessionSettings;
use crate::sources::{resolver::ResolverSettings, SearchEngine};

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // development: register commands on one guild

    // Playback
    pub default_volume: u8,
    pub max_queue_size: usize,
    pub max_playlist_size: usize,
    pub idle_timeout: Duration,
    pub buffer_timeout: Duration,
    pub transient_retries: u32,
    pub snapshot_interval: Duration,

    // Resolution
    pub search_engine: SearchEngine,
    pub resolve_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
    pub lyrics_api_url: String,

    // Runtime
    pub data_dir: PathBuf,
    pub worker_threads: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN is not set")?,
            application_id: std::env::var("APPLICATION_ID")
                .context("APPLICATION_ID is not set")?
                .parse()
                .context("APPLICATION_ID must be a number")?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            default_volume: parsed("DEFAULT_VOLUME", defaults.default_volume)?,
            max_queue_size: parsed("MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            max_playlist_size: parsed("MAX_PLAYLIST_SIZE", defaults.max_playlist_size)?,
            idle_timeout: duration("IDLE_TIMEOUT", defaults.idle_timeout)?,
            buffer_timeout: duration("BUFFER_TIMEOUT", defaults.buffer_timeout)?,
            transient_retries: parsed("TRANSIENT_RETRIES", defaults.transient_retries)?,
            snapshot_interval: duration("SNAPSHOT_INTERVAL", defaults.snapshot_interval)?,

            search_engine: parsed("SEARCH_ENGINE", defaults.search_engine)?,
            resolve_timeout: duration("RESOLVE_TIMEOUT", defaults.resolve_timeout)?,
            cache_ttl: duration("CACHE_TTL", defaults.cache_ttl)?,
            cache_sweep_interval: duration("CACHE_SWEEP_INTERVAL", defaults.cache_sweep_interval)?,
            spotify_client_id: non_empty("SPOTIFY_CLIENT_ID"),
            spotify_client_secret: non_empty("SPOTIFY_CLIENT_SECRET"),
            lyrics_api_url: non_empty("LYRICS_API_URL").unwrap_or(defaults.lyrics_api_url),

            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.trim().parse().context("WORKER_THREADS")?,
                _ => defaults.worker_threads,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that catch typos before the bot connects anywhere.
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > 200 {
            anyhow::bail!("Default volume must be between 0 and 200, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        for (name, value) in [
            ("IDLE_TIMEOUT", self.idle_timeout),
            ("BUFFER_TIMEOUT", self.buffer_timeout),
            ("RESOLVE_TIMEOUT", self.resolve_timeout),
            ("CACHE_TTL", self.cache_ttl),
            ("CACHE_SWEEP_INTERVAL", self.cache_sweep_interval),
            ("SNAPSHOT_INTERVAL", self.snapshot_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        if self.spotify_client_id.is_some() != self.spotify_client_secret.is_some() {
            anyhow::bail!("SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET must be set together");
        }

        if url::Url::parse(&self.lyrics_api_url).is_err() {
            anyhow::bail!("LYRICS_API_URL is not a valid URL: {}", self.lyrics_api_url);
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        Ok(())
    }

    pub fn spotify_enabled(&self) -> bool {
        self.spotify_client_id.is_some() && self.spotify_client_secret.is_some()
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            max_queue_size: self.max_queue_size,
            default_volume: self.default_volume,
            idle_timeout: self.idle_timeout,
            buffer_timeout: self.buffer_timeout,
            transient_retries: self.transient_retries,
            snapshot_interval: self.snapshot_interval,
        }
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            timeout: self.resolve_timeout,
            retries: self.transient_retries,
            max_playlist_size: self.max_playlist_size,
            ..ResolverSettings::default()
        }
    }

    /// Log-safe summary; the token never appears.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Playback: {}% vol, {} queue, {} playlist, idle {}, buffer {}\n  \
            Resolution: {} search, timeout {}, {} retries, Spotify={}\n  \
            Cache: ttl {}, sweep every {}\n  \
            Storage: {} (snapshots every {}), {} workers",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.default_volume,
            self.max_queue_size,
            self.max_playlist_size,
            humantime::format_duration(self.idle_timeout),
            humantime::format_duration(self.buffer_timeout),
            self.search_engine,
            humantime::format_duration(self.resolve_timeout),
            self.transient_retries,
            self.spotify_enabled(),
            humantime::format_duration(self.cache_ttl),
            humantime::format_duration(self.cache_sweep_interval),
            self.data_dir.display(),
            humantime::format_duration(self.snapshot_interval),
            self.worker_threads,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            default_volume: 30,
            max_queue_size: 1000,
            max_playlist_size: 100,
            idle_timeout: Duration::from_secs(300),
            buffer_timeout: Duration::from_secs(30),
            transient_retries: 1,
            snapshot_interval: Duration::from_secs(30),

            search_engine: SearchEngine::default(),
            resolve_timeout: Duration::from_secs(20),
            cache_ttl: Duration::from_secs(30 * 60),
            cache_sweep_interval: Duration::from_secs(5 * 60),
            spotify_client_id: None,
            spotify_client_secret: None,
            lyrics_api_url: "https://lrclib.net".into(),

            data_dir: "./data".into(),
            worker_threads: num_cpus::get(),
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value `{}`: {}", key, raw, e)),
        None => Ok(default),
    }
}

fn duration(key: &str, default: Duration) -> Result<Duration> {
    match non_empty(key) {
        Some(raw) => parse_duration(&raw).with_context(|| format!("{} has an invalid duration `{}`", key, raw)),
        None => Ok(default),
    }
}

/// Plain numbers are seconds; anything else goes through humantime (`5m`, `1h 30m`).
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    Ok(humantime::parse_duration(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_seconds_and_humantime() {
        assert_eq!(parse_duration("90").expect("seconds"), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").expect("humantime"), Duration::from_secs(300));
        assert_eq!(parse_duration(" 1h 30m ").expect("humantime"), Duration::from_secs(5400));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.session_settings().transient_retries, 1);
        assert_eq!(config.resolver_settings().max_playlist_size, 100);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let loud = Config {
            default_volume: 250,
            ..Config::default()
        };
        assert!(loud.validate().is_err());

        let half_spotify = Config {
            spotify_client_id: Some("id".into()),
            ..Config::default()
        };
        assert!(half_spotify.validate().is_err());

        let bad_lyrics = Config {
            lyrics_api_url: "not a url".into(),
            ..Config::default()
        };
        assert!(bad_lyrics.validate().is_err());

        let no_idle = Config {
            idle_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(no_idle.validate().is_err());
    }

    #[test]
    fn summary_hides_the_token() {
        let config = Config {
            discord_token: "super-secret".into(),
            ..Config::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("super-secret"));
        assert!(summary.contains("5m"));
    }
}
