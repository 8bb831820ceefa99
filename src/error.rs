//! Typed errors surfaced by the playback engine.
//!
//! Application plumbing (config, start-up, Discord handlers) keeps using
//! [`anyhow`]; everything a caller of the engine can observe is one of the
//! enums below so the control surface can render a precise reason.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::state::PlaybackState;

/// Failure reported by a single source provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("nothing matched `{0}`")]
    NotFound(String),
    /// Network hiccups, rate limits and timeouts. Retried once.
    #[error("temporary provider failure: {0}")]
    Transient(String),
    /// Authentication or permanent upstream refusal.
    #[error("provider rejected the request: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One sub-track of a playlist that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionFailure {
    /// The query as it was sent to the provider (e.g. `"Artist - Title"`).
    pub query: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("the query is empty")]
    EmptyQuery,
    #[error("no source can handle `{0}`")]
    Unsupported(String),
    #[error("couldn't find anything matching `{0}`")]
    NotFound(String),
    #[error("{provider} failed for `{query}`: {error}")]
    Provider {
        query: String,
        provider: &'static str,
        #[source]
        error: ProviderError,
    },
    #[error("none of the {} tracks in `{query}` could be resolved", failures.len())]
    AllFailed {
        query: String,
        failures: Vec<ResolutionFailure>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceError {
    #[error("failed to join the voice channel: {0}")]
    Connect(String),
    #[error("no voice connection for this guild")]
    NotConnected,
    #[error("audio pipeline error: {0}")]
    Playback(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Result of a control-surface operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("nothing is playing in this server")]
    NoActiveSession,
    #[error("can't {action} while the player is {state}")]
    InvalidState {
        action: &'static str,
        state: PlaybackState,
    },
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("the queue is full ({0} tracks max)")]
    QueueFull(usize),
    #[error("join a voice channel first")]
    NoVoiceChannel,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("the request was cancelled by a stop")]
    Cancelled,
}

impl EngineError {
    pub(crate) fn invalid_state(action: &'static str, state: PlaybackState) -> Self {
        Self::InvalidState { action, state }
    }
}
