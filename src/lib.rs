//! # Open Radio
//!
//! Multi-guild Discord radio bot. Each guild gets an independent playback
//! session with its own queue, state machine and voice connection; a
//! shared resolver turns user queries (search terms, direct URLs, Spotify
//! links) into playable tracks.
//!
//! The binary wires the pieces together:
//!
//! ```text
//! Discord ─▶ bot (slash commands, buttons) ─▶ RadioEngine ─▶ SessionRegistry ─▶ guild sessions
//!    ▲                                                              │                 │
//!    │                                                  TrackResolver + cache   VoiceTransport (songbird)
//!    │                                                                                │
//!    └──── announcer ◀── now playing / idle broadcast              JsonStorage snapshots
//! ```

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod sources;
pub mod storage;
pub mod ui;

pub use engine::RadioEngine;
pub use error::EngineError;
