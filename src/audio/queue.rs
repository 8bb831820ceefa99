use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt, str::FromStr, time::Duration};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::sources::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl FromStr for LoopMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "track" | "song" => Ok(Self::Track),
            "queue" | "all" => Ok(Self::Queue),
            other => Err(EngineError::InvalidArgument(format!(
                "unknown loop mode `{}` (off, track or queue)",
                other
            ))),
        }
    }
}

impl LoopMode {
    /// Off, then track, then queue, then off again.
    pub fn next(self) -> Self {
        match self {
            Self::Off => Self::Track,
            Self::Track => Self::Queue,
            Self::Queue => Self::Off,
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("off"),
            Self::Track => f.write_str("track"),
            Self::Queue => f.write_str("queue"),
        }
    }
}

/// Why the current track is leaving the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Finished,
    Skipped,
    Failed,
}

/// A guild's upcoming tracks plus the one on the player.
///
/// Strict FIFO unless reordered by [`MusicQueue::move_track`] or
/// [`MusicQueue::shuffle`]. `max_size` bounds the upcoming items only.
#[derive(Debug)]
pub struct MusicQueue {
    items: VecDeque<Track>,
    current: Option<Track>,
    history: VecDeque<Track>,
    loop_mode: LoopMode,
    max_size: usize,
    max_history: usize,
}

impl MusicQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            current: None,
            history: VecDeque::new(),
            loop_mode: LoopMode::Off,
            max_size,
            max_history: 50,
        }
    }

    pub fn free_slots(&self) -> usize {
        self.max_size.saturating_sub(self.items.len())
    }

    /// Appends in order and returns how many fit. Overflow is dropped.
    pub fn add_tracks(&mut self, tracks: Vec<Track>) -> Result<usize, EngineError> {
        if tracks.is_empty() {
            return Ok(0);
        }

        let to_add = tracks.len().min(self.free_slots());
        if to_add == 0 {
            return Err(EngineError::QueueFull(self.max_size));
        }

        self.items.extend(tracks.into_iter().take(to_add));
        info!("➕ Added {} tracks to the queue ({} waiting)", to_add, self.items.len());
        Ok(to_add)
    }

    /// Puts tracks back at the head, keeping their order. Used for restores,
    /// which may exceed `max_size`.
    pub fn restore_front(&mut self, tracks: Vec<Track>) {
        for track in tracks.into_iter().rev() {
            self.items.push_front(track);
        }
    }

    /// Retires the current track and promotes the next one.
    pub fn advance(&mut self, reason: Advance) -> Option<Track> {
        if let Some(current) = self.current.take() {
            match (reason, self.loop_mode) {
                (Advance::Finished, LoopMode::Track) => {
                    info!("🔂 Repeating: {}", current.title());
                    self.current = Some(current.clone());
                    return Some(current);
                }
                (Advance::Finished | Advance::Skipped, LoopMode::Queue) => {
                    debug!("🔁 Re-queued: {}", current.title());
                    self.items.push_back(current.clone());
                }
                _ => {}
            }
            self.push_history(current);
        }

        self.current = self.items.pop_front();
        match &self.current {
            Some(track) => info!("➡️ Next up: {}", track.title()),
            None => info!("📭 Queue exhausted"),
        }
        self.current.clone()
    }

    /// Returns the interrupted track to the head of the queue.
    pub fn requeue_current(&mut self) {
        if let Some(current) = self.current.take() {
            self.items.push_front(current);
        }
    }

    /// Drops the current track without touching the upcoming items.
    pub fn take_current(&mut self) -> Option<Track> {
        let current = self.current.take();
        if let Some(track) = &current {
            self.push_history(track.clone());
        }
        current
    }

    pub fn clear(&mut self) {
        self.items.clear();
        info!("🗑️ Queue cleared");
    }

    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.items.make_contiguous().shuffle(rng);
        info!("🔀 Queue shuffled");
    }

    /// Zero-based positions within the upcoming items.
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<(), EngineError> {
        let len = self.items.len();
        if from >= len || to >= len {
            return Err(EngineError::InvalidArgument(format!(
                "positions must be between 1 and {}",
                len
            )));
        }

        if from != to {
            if let Some(track) = self.items.remove(from) {
                self.items.insert(to, track);
                debug!("📍 Moved track from {} to {}", from, to);
            }
        }
        Ok(())
    }

    pub fn remove_track(&mut self, index: usize) -> Result<Track, EngineError> {
        let len = self.items.len();
        self.items.remove(index).ok_or_else(|| {
            EngineError::InvalidArgument(format!("position must be between 1 and {}", len))
        })
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Loop disabled"),
            LoopMode::Track => info!("🔂 Looping the current track"),
            LoopMode::Queue => info!("🔁 Looping the queue"),
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    pub fn history(&self) -> impl DoubleEndedIterator<Item = &Track> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn has_upcoming(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.current.is_none()
    }

    pub fn total_duration(&self) -> Duration {
        self.items
            .iter()
            .chain(self.current.iter())
            .filter_map(|track| track.duration())
            .sum()
    }

    fn push_history(&mut self, track: Track) {
        self.history.push_back(track);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }
}
