use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, Instant},
};

/// Lifecycle of a guild's player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackState {
    /// Nothing playing. The voice connection may linger until the idle timeout.
    Idle,
    /// Voice handshake in flight.
    Connecting,
    /// Head of the queue handed to the transport, waiting for buffer-ready.
    Loading,
    Playing,
    Paused,
    /// Stop/disconnect in flight.
    Stopping,
}

impl PlaybackState {
    /// The transition table. The session never moves along an edge that is
    /// not listed here.
    pub fn can_transition_to(self, next: PlaybackState) -> bool {
        use PlaybackState::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Loading)
                | (Connecting, Loading)
                | (Connecting, Idle)
                | (Connecting, Stopping)
                | (Loading, Loading)
                | (Loading, Playing)
                | (Loading, Idle)
                | (Loading, Stopping)
                | (Playing, Paused)
                | (Playing, Loading)
                | (Playing, Idle)
                | (Playing, Stopping)
                | (Paused, Playing)
                | (Paused, Loading)
                | (Paused, Idle)
                | (Paused, Stopping)
                | (Stopping, Idle)
        )
    }

    /// A track is attached to the transport (buffering, playing or paused).
    pub fn has_track(self) -> bool {
        matches!(self, Self::Loading | Self::Playing | Self::Paused)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Loading => "loading",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Generation counter attached to every asynchronous request the session
/// makes. A completion carrying an older token is stale and gets dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PlaybackToken(u64);

impl PlaybackToken {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlaybackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tracks the playback position of the current track across pauses and seeks.
#[derive(Debug, Clone, Default)]
pub struct PositionClock {
    base: Duration,
    running_since: Option<Instant>,
}

impl PositionClock {
    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.base += since.elapsed();
        }
    }

    pub fn resume(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    /// Moves the clock without changing whether it runs.
    pub fn seek(&mut self, position: Duration) {
        self.base = position;
        if self.running_since.is_some() {
            self.running_since = Some(Instant::now());
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn position(&self) -> Duration {
        self.base + self.running_since.map(|s| s.elapsed()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PlaybackState::*;

    const ALL: [PlaybackState; 6] = [Idle, Connecting, Loading, Playing, Paused, Stopping];

    #[test]
    fn stopping_only_returns_to_idle() {
        for next in ALL {
            assert_eq!(Stopping.can_transition_to(next), next == Idle, "{next}");
        }
    }

    #[test]
    fn pause_is_only_reachable_from_playing() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Paused), from == Playing, "{from}");
        }
    }

    #[test]
    fn every_state_can_reach_idle() {
        for from in ALL {
            if from != Idle {
                assert!(from.can_transition_to(Idle), "{from}");
            }
        }
    }

    #[test]
    fn clock_holds_position_while_paused() {
        let mut clock = PositionClock::default();
        clock.seek(Duration::from_secs(10));
        clock.resume();
        clock.pause();
        let held = clock.position();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.position(), held);
        assert!(held >= Duration::from_secs(10));

        clock.seek(Duration::from_secs(3));
        assert_eq!(clock.position(), Duration::from_secs(3));
    }

    #[test]
    fn tokens_are_monotonic() {
        let first = PlaybackToken::default();
        let second = first.next();
        assert!(second > first);
        assert_eq!(second.get(), 1);
    }
}
