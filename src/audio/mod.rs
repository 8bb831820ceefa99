//! # Audio Module
//!
//! Per-guild playback engine for Open Radio.
//!
//! Every guild with activity owns one session task. The
//! task holds the queue, the playback state machine and the voice
//! connection handle, and is driven exclusively through its mailbox, so
//! user commands, resolver completions and voice events for a guild are
//! applied one at a time and in arrival order.
//!
//! ## Architecture
//!
//! ### [`registry`] - Session Registry
//! - One session per guild, created on first enqueue
//! - Routes voice events to the owning session
//! - Removes sessions after explicit leave or idle expiry
//!
//! ### [`session`] - Guild Session
//! - Playback state machine (see [`state::PlaybackState`])
//! - Ordered application of concurrent enqueues
//! - Retry of transient failures, snapshotting, idle timer
//!
//! ### [`queue`] - Queue Management
//! - FIFO queue with loop modes, shuffle, move and remove
//! - Track history
//!
//! ### Serial lanes
//! - Voice commands and snapshot writes for a guild run off the session
//!   task, one at a time and in the order the session issued them
//!
//! ### [`voice`] - Voice Transport
//! - Songbird-backed adapter that owns the 20 ms frame clock
//! - Track events tagged with a [`state::PlaybackToken`] so stale
//!   notifications can be recognized and dropped
//!
//! ## State machine
//!
//! ```text
//! IDLE ──▶ CONNECTING ──▶ LOADING ──▶ PLAYING ◀──▶ PAUSED
//!   ▲           │            │           │            │
//!   └───────────┴────────────┴───────────┴────────────┘
//!          queue exhausted, voice lost, or STOPPING done
//! ```
//!
//! `LOADING` is re-entered on every track change. `STOPPING` can be
//! reached from any state but `IDLE` and always ends in `IDLE`.

mod lane;
pub mod queue;
pub mod registry;
pub mod session;
pub mod state;
pub mod voice;
