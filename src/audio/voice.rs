use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    error::PlayError,
    events::{CoreEvent, Event, EventContext, EventHandler as SongbirdEventHandler, TrackEvent},
    input::{HttpRequest, Input, YoutubeDl},
    tracks::{PlayMode, TrackHandle},
    Songbird,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::state::PlaybackToken;
use crate::error::VoiceError;
use crate::sources::{StreamHint, Track};

/// What the session hands the transport when a track reaches the head of
/// the queue.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub token: PlaybackToken,
    pub track: Track,
    /// Percent, 0..=200.
    pub volume: u8,
    pub start_at: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFailure {
    pub reason: String,
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEventKind {
    /// The stream produced its first audio.
    BufferReady { token: PlaybackToken },
    TrackEnded { token: PlaybackToken },
    TrackFailed { token: PlaybackToken, failure: TrackFailure },
    Disconnected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceEvent {
    pub guild_id: GuildId,
    pub kind: VoiceEventKind,
}

pub type VoiceEventSender = mpsc::UnboundedSender<VoiceEvent>;

/// Everything the engine needs from the voice client.
///
/// Frame pacing (20 ms Opus frames) belongs to the implementation; the
/// engine only says which stream to play. Results of a `play` are reported
/// asynchronously as [`VoiceEvent`]s carrying the request's token.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VoiceError>;

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), VoiceError>;

    /// Replaces whatever is playing in the guild. A request older than the
    /// stream already playing is ignored.
    async fn play(&self, guild_id: GuildId, request: PlayRequest) -> Result<(), VoiceError>;

    /// Stops the stream if it was started by `token` or an older request.
    async fn stop(&self, guild_id: GuildId, token: PlaybackToken) -> Result<(), VoiceError>;

    async fn pause(&self, guild_id: GuildId) -> Result<(), VoiceError>;

    async fn resume(&self, guild_id: GuildId) -> Result<(), VoiceError>;

    async fn seek(&self, guild_id: GuildId, position: Duration) -> Result<(), VoiceError>;

    async fn set_volume(&self, guild_id: GuildId, volume: u8) -> Result<(), VoiceError>;
}

/// Songbird-backed transport: songbird's driver owns the mixer and frame
/// clock, symphonia decodes inside it.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    tracks: DashMap<GuildId, (PlaybackToken, TrackHandle)>,
    events: VoiceEventSender,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, events: VoiceEventSender) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
            tracks: DashMap::new(),
            events,
        }
    }

    fn input_for(&self, track: &Track) -> Input {
        match track.stream() {
            StreamHint::Extractor(url) => YoutubeDl::new(self.http.clone(), url.clone()).into(),
            StreamHint::Http(url) => HttpRequest::new(self.http.clone(), url.clone()).into(),
        }
    }

    fn handle(&self, guild_id: GuildId) -> Result<TrackHandle, VoiceError> {
        self.tracks
            .get(&guild_id)
            .map(|entry| entry.1.clone())
            .ok_or(VoiceError::NotConnected)
    }
}

fn control_error(error: impl std::fmt::Display) -> VoiceError {
    VoiceError::Playback(error.to_string())
}

fn gain(volume: u8) -> f32 {
    f32::from(volume.min(200)) / 100.0
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VoiceError> {
        info!("🔗 Joining channel {} in guild {}", channel_id, guild_id);

        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| VoiceError::Connect(format!("{:?}", e)))?;

        let mut call = call.lock().await;
        // Joining again reuses the call; keep exactly one handler on it.
        call.remove_all_global_events();
        call.add_global_event(
            Event::Core(CoreEvent::DriverDisconnect),
            DisconnectNotifier {
                guild_id,
                events: self.events.clone(),
            },
        );

        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), VoiceError> {
        self.tracks.remove(&guild_id);
        if self.manager.get(guild_id).is_none() {
            return Ok(());
        }

        info!("👋 Leaving voice in guild {}", guild_id);
        self.manager
            .remove(guild_id)
            .await
            .map_err(|e| VoiceError::Connect(format!("{:?}", e)))
    }

    async fn play(&self, guild_id: GuildId, request: PlayRequest) -> Result<(), VoiceError> {
        if self.tracks.get(&guild_id).is_some_and(|entry| entry.0 > request.token) {
            debug!("Ignoring stale play {} in guild {}", request.token, guild_id);
            return Ok(());
        }
        let call = self.manager.get(guild_id).ok_or(VoiceError::NotConnected)?;
        let input = self.input_for(&request.track);

        let handle = {
            let mut call = call.lock().await;
            call.play_only_input(input)
        };
        handle.set_volume(gain(request.volume)).map_err(control_error)?;
        if !request.start_at.is_zero() {
            let pending = handle.seek(request.start_at);
            let start_at = request.start_at;
            tokio::spawn(async move {
                match pending.result_async().await {
                    Ok(at) => debug!("⏩ Resumed guild {} at {:?}", guild_id, at),
                    Err(e) => warn!("Couldn't resume guild {} at {:?}: {}", guild_id, start_at, e),
                }
            });
        }

        for (event, kind) in [
            (TrackEvent::Playable, NotifierKind::Ready),
            (TrackEvent::End, NotifierKind::Ended),
            (TrackEvent::Error, NotifierKind::Failed),
        ] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackNotifier {
                        guild_id,
                        token: request.token,
                        kind,
                        events: self.events.clone(),
                    },
                )
                .map_err(control_error)?;
        }

        debug!("🎵 Handed {} to the mixer ({})", request.track.title(), request.token);
        self.tracks.insert(guild_id, (request.token, handle));
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId, token: PlaybackToken) -> Result<(), VoiceError> {
        if let Some((_, (_, handle))) = self.tracks.remove_if(&guild_id, |_, (current, _)| *current <= token) {
            handle.stop().map_err(control_error)?;
        }
        Ok(())
    }

    async fn pause(&self, guild_id: GuildId) -> Result<(), VoiceError> {
        self.handle(guild_id)?.pause().map_err(control_error)
    }

    async fn resume(&self, guild_id: GuildId) -> Result<(), VoiceError> {
        self.handle(guild_id)?.play().map_err(control_error)
    }

    async fn seek(&self, guild_id: GuildId, position: Duration) -> Result<(), VoiceError> {
        self.handle(guild_id)?
            .seek_async(position)
            .await
            .map(|_| ())
            .map_err(control_error)
    }

    async fn set_volume(&self, guild_id: GuildId, volume: u8) -> Result<(), VoiceError> {
        self.handle(guild_id)?.set_volume(gain(volume)).map_err(control_error)
    }
}

#[derive(Clone, Copy)]
enum NotifierKind {
    Ready,
    Ended,
    Failed,
}

struct TrackNotifier {
    guild_id: GuildId,
    token: PlaybackToken,
    kind: NotifierKind,
    events: VoiceEventSender,
}

#[async_trait]
impl SongbirdEventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let token = self.token;
        let kind = match self.kind {
            NotifierKind::Ready => VoiceEventKind::BufferReady { token },
            NotifierKind::Ended => VoiceEventKind::TrackEnded { token },
            NotifierKind::Failed => {
                let failure = match ctx {
                    EventContext::Track(tracks) => tracks
                        .iter()
                        .find_map(|(state, _)| match &state.playing {
                            PlayMode::Errored(error) => Some(describe_play_error(error)),
                            _ => None,
                        }),
                    _ => None,
                }
                .unwrap_or_else(|| TrackFailure {
                    reason: "the audio stream failed".into(),
                    transient: false,
                });
                VoiceEventKind::TrackFailed { token, failure }
            }
        };

        if self.events.send(VoiceEvent { guild_id: self.guild_id, kind }).is_err() {
            debug!("Voice event dropped, engine is shutting down");
        }
        // One-shot: Playable/End/Error fire once per track.
        Some(Event::Cancel)
    }
}

/// Opening the stream (yt-dlp, HTTP) can fail for network reasons and is
/// worth a retry; decode errors are not.
fn describe_play_error(error: &PlayError) -> TrackFailure {
    match error {
        PlayError::Create(e) => TrackFailure {
            reason: format!("couldn't open the stream: {}", e),
            transient: true,
        },
        other => TrackFailure {
            reason: format!("{}", other),
            transient: false,
        },
    }
}

struct DisconnectNotifier {
    guild_id: GuildId,
    events: VoiceEventSender,
}

#[async_trait]
impl SongbirdEventHandler for DisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(data) = ctx {
            let reason = data
                .reason
                .as_ref()
                .map(|r| format!("{:?}", r))
                .unwrap_or_else(|| "requested".to_string());
            warn!("🔌 Voice driver disconnected in guild {}: {}", self.guild_id, reason);

            let _ = self.events.send(VoiceEvent {
                guild_id: self.guild_id,
                kind: VoiceEventKind::Disconnected { reason },
            });
        }
        None
    }
}

/// In-process transport used by the engine's tests. Records every call and
/// reports buffer-ready immediately unless told otherwise.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Connect(ChannelId),
        Disconnect,
        Play(String, PlaybackToken),
        Stop,
        Pause,
        Resume,
        Seek(Duration),
        SetVolume(u8),
    }

    pub struct FakeTransport {
        events: VoiceEventSender,
        calls: Mutex<Vec<(GuildId, Call)>>,
        playing: DashMap<GuildId, PlaybackToken>,
        auto_ready: Mutex<bool>,
        failing: Mutex<HashSet<String>>,
        slow: Mutex<HashMap<String, Duration>>,
        seek_delay: Mutex<Duration>,
        refuse_connect: Mutex<bool>,
    }

    impl FakeTransport {
        pub fn new(events: VoiceEventSender) -> Self {
            Self {
                events,
                calls: Mutex::new(Vec::new()),
                playing: DashMap::new(),
                auto_ready: Mutex::new(true),
                failing: Mutex::new(HashSet::new()),
                slow: Mutex::new(HashMap::new()),
                seek_delay: Mutex::new(Duration::ZERO),
                refuse_connect: Mutex::new(false),
            }
        }

        pub fn set_auto_ready(&self, enabled: bool) {
            *self.auto_ready.lock() = enabled;
        }

        /// Tracks with this title fail to open, permanently.
        pub fn fail_title(&self, title: &str) {
            self.failing.lock().insert(title.to_string());
        }

        /// Handing a track with this title to the mixer takes `delay`.
        pub fn slow_title(&self, title: &str, delay: Duration) {
            self.slow.lock().insert(title.to_string(), delay);
        }

        /// Every seek takes `delay`, like re-opening a remote stream.
        pub fn slow_seeks(&self, delay: Duration) {
            *self.seek_delay.lock() = delay;
        }

        pub fn refuse_connections(&self) {
            *self.refuse_connect.lock() = true;
        }

        pub fn calls(&self, guild_id: GuildId) -> Vec<Call> {
            self.calls
                .lock()
                .iter()
                .filter(|(g, _)| *g == guild_id)
                .map(|(_, c)| c.clone())
                .collect()
        }

        pub fn count(&self, guild_id: GuildId, matches: impl Fn(&Call) -> bool) -> usize {
            self.calls(guild_id).iter().filter(|c| matches(c)).count()
        }

        pub fn played_titles(&self, guild_id: GuildId) -> Vec<String> {
            self.calls(guild_id)
                .into_iter()
                .filter_map(|c| match c {
                    Call::Play(title, _) => Some(title),
                    _ => None,
                })
                .collect()
        }

        pub fn current_token(&self, guild_id: GuildId) -> Option<PlaybackToken> {
            self.playing.get(&guild_id).map(|t| *t)
        }

        pub fn emit(&self, guild_id: GuildId, kind: VoiceEventKind) {
            let _ = self.events.send(VoiceEvent { guild_id, kind });
        }

        /// Ends the current track naturally.
        pub fn finish(&self, guild_id: GuildId) {
            if let Some(token) = self.current_token(guild_id) {
                self.emit(guild_id, VoiceEventKind::TrackEnded { token });
            }
        }

        fn record(&self, guild_id: GuildId, call: Call) {
            self.calls.lock().push((guild_id, call));
        }
    }

    #[async_trait]
    impl VoiceTransport for FakeTransport {
        async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VoiceError> {
            self.record(guild_id, Call::Connect(channel_id));
            if *self.refuse_connect.lock() {
                return Err(VoiceError::Connect("refused".into()));
            }
            Ok(())
        }

        async fn disconnect(&self, guild_id: GuildId) -> Result<(), VoiceError> {
            self.record(guild_id, Call::Disconnect);
            self.playing.remove(&guild_id);
            Ok(())
        }

        // Like songbird: a new track ends the one it replaces, and stopping a
        // track fires its end event.
        async fn play(&self, guild_id: GuildId, request: PlayRequest) -> Result<(), VoiceError> {
            let title = request.track.title().to_string();
            let delay = self.slow.lock().get(&title).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.current_token(guild_id).is_some_and(|current| current > request.token) {
                return Ok(());
            }
            self.record(guild_id, Call::Play(title.clone(), request.token));
            if let Some(replaced) = self.playing.insert(guild_id, request.token) {
                self.emit(guild_id, VoiceEventKind::TrackEnded { token: replaced });
            }

            if self.failing.lock().contains(&title) {
                self.emit(
                    guild_id,
                    VoiceEventKind::TrackFailed {
                        token: request.token,
                        failure: TrackFailure {
                            reason: "unplayable".into(),
                            transient: false,
                        },
                    },
                );
            } else if *self.auto_ready.lock() {
                self.emit(guild_id, VoiceEventKind::BufferReady { token: request.token });
            }
            Ok(())
        }

        async fn stop(&self, guild_id: GuildId, token: PlaybackToken) -> Result<(), VoiceError> {
            self.record(guild_id, Call::Stop);
            if let Some((_, stopped)) = self.playing.remove_if(&guild_id, |_, current| *current <= token) {
                self.emit(guild_id, VoiceEventKind::TrackEnded { token: stopped });
            }
            Ok(())
        }

        async fn pause(&self, guild_id: GuildId) -> Result<(), VoiceError> {
            self.record(guild_id, Call::Pause);
            Ok(())
        }

        async fn resume(&self, guild_id: GuildId) -> Result<(), VoiceError> {
            self.record(guild_id, Call::Resume);
            Ok(())
        }

        async fn seek(&self, guild_id: GuildId, position: Duration) -> Result<(), VoiceError> {
            let delay = *self.seek_delay.lock();
            tokio::time::sleep(delay).await;
            self.record(guild_id, Call::Seek(position));
            Ok(())
        }

        async fn set_volume(&self, guild_id: GuildId, volume: u8) -> Result<(), VoiceError> {
            self.record(guild_id, Call::SetVolume(volume));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_maps_to_linear_gain() {
        assert_eq!(gain(100), 1.0);
        assert_eq!(gain(30), 0.3);
        assert_eq!(gain(255), 2.0);
    }
}
