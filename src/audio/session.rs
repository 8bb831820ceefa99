use chrono::Utc;
use serde::Serialize;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    collections::{BTreeMap, VecDeque},
    ops::ControlFlow,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lane::SerialLane;
use super::queue::{Advance, LoopMode, MusicQueue};
use super::state::{PlaybackState, PlaybackToken, PositionClock};
use super::voice::{PlayRequest, TrackFailure, VoiceEventKind, VoiceTransport};
use crate::error::{EngineError, PersistenceError, ResolutionError, ResolutionFailure, VoiceError};
use crate::sources::{Resolution, Track, TrackResolver, TrackSummary};
use crate::storage::{GuildPreferences, QueueSnapshot, SnapshotStore};

const MAILBOX_SIZE: usize = 64;
const MAX_WARNINGS: usize = 5;
const RECENT_TRACKS: usize = 5;
pub const MAX_VOLUME: u8 = 200;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Per-session knobs, taken from the process configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_queue_size: usize,
    pub default_volume: u8,
    pub idle_timeout: Duration,
    pub buffer_timeout: Duration,
    pub transient_retries: u32,
    pub snapshot_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            default_volume: 30,
            idle_timeout: Duration::from_secs(300),
            buffer_timeout: Duration::from_secs(30),
            transient_retries: 1,
            snapshot_interval: Duration::from_secs(30),
        }
    }
}

/// Notifications a session sends to its registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    IdleExpired { guild_id: GuildId, session_id: u64 },
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub resolver: Arc<TrackResolver>,
    pub transport: Arc<dyn VoiceTransport>,
    pub store: Arc<dyn SnapshotStore>,
    pub settings: SessionSettings,
    pub lifecycle: mpsc::UnboundedSender<Lifecycle>,
    pub announcements: broadcast::Sender<Announcement>,
}

/// Playback news for whoever renders it (the Discord layer posts a
/// controller message per track).
#[derive(Debug, Clone, PartialEq)]
pub enum Announcement {
    /// A new track produced audio. Not sent again on resume.
    NowPlaying { guild_id: GuildId, track: TrackSummary },
    /// Nothing is playing any more.
    Idle { guild_id: GuildId },
}

/// Why a session is asked to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Explicit leave: forget the queue.
    Leave,
    /// Idle timeout: only honored if the session is still idle.
    IdleExpiry,
    /// Process exit: keep a final snapshot for the next start.
    ProcessExit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnqueueOutcome {
    /// What was actually added, in order.
    pub added: Vec<TrackSummary>,
    /// 1-based position of the first added track among upcoming tracks.
    pub position: usize,
    /// Tracks dropped because the queue hit its bound.
    pub truncated: usize,
    pub failures: Vec<ResolutionFailure>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NowPlaying {
    pub track: TrackSummary,
    pub position: Duration,
}

/// Read-only view of a session for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueView {
    pub state: PlaybackState,
    pub current: Option<NowPlaying>,
    pub upcoming: Vec<TrackSummary>,
    pub volume: u8,
    pub loop_mode: LoopMode,
    pub voice_channel: Option<ChannelId>,
    pub total_duration: Duration,
    /// Most recent dropped tracks and resolution failures.
    pub warnings: Vec<String>,
    /// Recently finished tracks, newest first.
    pub recent: Vec<TrackSummary>,
}

impl QueueView {
    /// 1-based page of upcoming tracks with the starting position.
    pub fn page(&self, page: usize, per_page: usize) -> (usize, &[TrackSummary]) {
        let per_page = per_page.max(1);
        let page = page.clamp(1, self.total_pages(per_page));
        let start = ((page - 1) * per_page).min(self.upcoming.len());
        let end = (start + per_page).min(self.upcoming.len());
        (start + 1, &self.upcoming[start..end])
    }

    pub fn total_pages(&self, per_page: usize) -> usize {
        self.upcoming.len().div_ceil(per_page.max(1)).max(1)
    }
}

pub(crate) enum Command {
    Enqueue {
        query: String,
        requester: UserId,
        voice_channel: Option<ChannelId>,
        reply: Reply<EnqueueOutcome>,
    },
    Skip(Reply<TrackSummary>),
    Stop(Reply<()>),
    Pause(Reply<()>),
    Resume(Reply<()>),
    Seek(Duration, Reply<()>),
    SetVolume(u8, Reply<u8>),
    SetLoop(LoopMode, Reply<LoopMode>),
    Shuffle(Reply<usize>),
    Move(usize, usize, Reply<()>),
    Remove(usize, Reply<TrackSummary>),
    View(oneshot::Sender<QueueView>),
    Shutdown(ShutdownMode, oneshot::Sender<bool>),

    // Completions posted back by spawned work.
    Resolved {
        seq: u64,
        result: Result<Resolution, ResolutionError>,
    },
    Connected {
        token: PlaybackToken,
        result: Result<(), VoiceError>,
    },
    PlayDispatched {
        token: PlaybackToken,
        result: Result<(), VoiceError>,
    },
    Seeked {
        token: PlaybackToken,
        position: Duration,
        result: Result<(), VoiceError>,
        reply: Reply<()>,
    },
    BufferDeadline(PlaybackToken),
    Stopped(PlaybackToken),
    Voice(VoiceEventKind),
    IdleExpired(u64),
    Restored {
        snapshot: Option<QueueSnapshot>,
        preferences: Option<GuildPreferences>,
    },
    SnapshotTick,
}

/// Cheap, cloneable address of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    guild_id: GuildId,
    tx: mpsc::Sender<Command>,
    internal: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EngineError::NoActiveSession)?;
        rx.await.map_err(|_| EngineError::NoActiveSession)?
    }

    pub async fn enqueue(
        &self,
        query: String,
        requester: UserId,
        voice_channel: Option<ChannelId>,
    ) -> Result<EnqueueOutcome, EngineError> {
        self.request(|reply| Command::Enqueue {
            query,
            requester,
            voice_channel,
            reply,
        })
        .await
    }

    pub async fn skip(&self) -> Result<TrackSummary, EngineError> {
        self.request(Command::Skip).await
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        self.request(Command::Stop).await
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.request(Command::Resume).await
    }

    pub async fn seek(&self, position: Duration) -> Result<(), EngineError> {
        self.request(|reply| Command::Seek(position, reply)).await
    }

    pub async fn set_volume(&self, volume: u8) -> Result<u8, EngineError> {
        self.request(|reply| Command::SetVolume(volume, reply)).await
    }

    pub async fn set_loop(&self, mode: LoopMode) -> Result<LoopMode, EngineError> {
        self.request(|reply| Command::SetLoop(mode, reply)).await
    }

    pub async fn shuffle(&self) -> Result<usize, EngineError> {
        self.request(Command::Shuffle).await
    }

    pub async fn move_track(&self, from: usize, to: usize) -> Result<(), EngineError> {
        self.request(|reply| Command::Move(from, to, reply)).await
    }

    pub async fn remove_track(&self, index: usize) -> Result<TrackSummary, EngineError> {
        self.request(|reply| Command::Remove(index, reply)).await
    }

    pub async fn view(&self) -> Result<QueueView, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::View(reply))
            .await
            .map_err(|_| EngineError::NoActiveSession)?;
        rx.await.map_err(|_| EngineError::NoActiveSession)
    }

    /// Returns whether the session agreed to end. A closed mailbox counts
    /// as ended.
    pub async fn shutdown(&self, mode: ShutdownMode) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(mode, reply)).await.is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    /// Never waits: voice events for one guild must not hold up another.
    pub(crate) fn notify(&self, event: VoiceEventKind) {
        if self.internal.send(Command::Voice(event)).is_err() {
            debug!("Voice event for ended session {} dropped", self.id);
        }
    }
}

struct PendingEnqueue {
    reply: Reply<EnqueueOutcome>,
    result: Option<Result<Resolution, ResolutionError>>,
}

/// The per-guild state machine. Runs as its own task and is only ever
/// touched through its mailbox, so every transition is serialized.
///
/// Requests arrive on the bounded mailbox. Completions of spawned work and
/// voice events come back on an unbounded internal channel, so the work
/// never blocks on a busy session.
struct GuildSession {
    id: u64,
    guild_id: GuildId,
    ctx: SessionContext,
    internal: mpsc::UnboundedSender<Command>,
    voice: SerialLane,
    writer: SerialLane,

    state: PlaybackState,
    queue: MusicQueue,
    token: PlaybackToken,
    clock: PositionClock,
    /// Where the next dispatched track starts (restored position).
    start_offset: Duration,
    attempts: u32,
    volume: u8,
    channel: Option<ChannelId>,
    connected: bool,

    next_seq: u64,
    pending: BTreeMap<u64, PendingEnqueue>,

    idle_epoch: u64,
    dirty: bool,
    warnings: VecDeque<String>,
    background: CancellationToken,
}

pub(crate) fn spawn(id: u64, guild_id: GuildId, ctx: SessionContext) -> SessionHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
    let (internal, internal_rx) = mpsc::unbounded_channel();

    let session = GuildSession {
        id,
        guild_id,
        internal: internal.clone(),
        voice: SerialLane::spawn("voice"),
        writer: SerialLane::spawn("snapshot"),
        state: PlaybackState::Idle,
        queue: MusicQueue::new(ctx.settings.max_queue_size),
        token: PlaybackToken::default(),
        clock: PositionClock::default(),
        start_offset: Duration::ZERO,
        attempts: 0,
        volume: ctx.settings.default_volume.min(MAX_VOLUME),
        channel: None,
        connected: false,
        next_seq: 0,
        pending: BTreeMap::new(),
        idle_epoch: 0,
        dirty: false,
        warnings: VecDeque::new(),
        background: CancellationToken::new(),
        ctx,
    };

    tokio::spawn(session.run(rx, internal_rx));
    SessionHandle {
        id,
        guild_id,
        tx,
        internal,
    }
}

impl GuildSession {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut internal: mpsc::UnboundedReceiver<Command>) {
        info!("🎛️ Session {} started for guild {}", self.id, self.guild_id);

        self.spawn_restore();
        self.spawn_snapshot_ticker();
        self.arm_idle_timer();

        loop {
            // The session keeps an internal sender, so that branch never
            // closes; the session ends when every handle is gone.
            let command = tokio::select! {
                biased;
                Some(command) = internal.recv() => command,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            if self.handle(command).await.is_break() {
                break;
            }
        }

        self.background.cancel();
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(EngineError::Cancelled));
        }
        info!("🛑 Session {} for guild {} ended", self.id, self.guild_id);
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Enqueue {
                query,
                requester,
                voice_channel,
                reply,
            } => self.on_enqueue(query, requester, voice_channel, reply),
            Command::Skip(reply) => {
                let _ = reply.send(self.on_skip());
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.on_stop());
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.on_pause());
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.on_resume());
            }
            Command::Seek(position, reply) => self.on_seek(position, reply),
            Command::SetVolume(volume, reply) => {
                let _ = reply.send(self.on_set_volume(volume));
            }
            Command::SetLoop(mode, reply) => {
                self.queue.set_loop_mode(mode);
                self.dirty = true;
                let _ = reply.send(Ok(mode));
            }
            Command::Shuffle(reply) => {
                self.queue.shuffle(&mut rand::thread_rng());
                self.dirty = true;
                let _ = reply.send(Ok(self.queue.len()));
            }
            Command::Move(from, to, reply) => {
                let result = self.queue.move_track(from, to);
                self.dirty |= result.is_ok();
                let _ = reply.send(result);
            }
            Command::Remove(index, reply) => {
                let result = self.queue.remove_track(index).map(|track| track.summary());
                self.dirty |= result.is_ok();
                let _ = reply.send(result);
            }
            Command::View(reply) => {
                let _ = reply.send(self.view());
            }
            Command::Shutdown(mode, reply) => return self.on_shutdown(mode, reply).await,

            Command::Resolved { seq, result } => self.on_resolved(seq, result),
            Command::Connected { token, result } => self.on_connected(token, result),
            Command::PlayDispatched { token, result } => {
                if let Err(e) = result {
                    if token == self.token && self.state.has_track() {
                        self.on_track_failed(TrackFailure {
                            reason: e.to_string(),
                            transient: false,
                        });
                    }
                }
            }
            Command::Seeked {
                token,
                position,
                result,
                reply,
            } => {
                let result = result.map_err(|e| EngineError::InvalidArgument(format!("seek failed: {}", e)));
                if result.is_ok() && token == self.token && self.state.has_track() {
                    self.clock.seek(position);
                }
                let _ = reply.send(result);
            }
            Command::BufferDeadline(token) => {
                if token == self.token && self.state == PlaybackState::Loading {
                    self.on_track_failed(TrackFailure {
                        reason: "timed out waiting for audio".into(),
                        transient: true,
                    });
                }
            }
            Command::Stopped(token) => {
                if token == self.token && self.state == PlaybackState::Stopping {
                    self.connected = false;
                    self.transition(PlaybackState::Idle);
                    // Requests that arrived while stopping.
                    self.start();
                }
            }
            Command::Voice(event) => self.on_voice_event(event),
            Command::IdleExpired(epoch) => {
                if epoch == self.idle_epoch && self.state == PlaybackState::Idle && self.pending.is_empty() {
                    info!("⏰ Guild {} idle for {:?}", self.guild_id, self.ctx.settings.idle_timeout);
                    let _ = self.ctx.lifecycle.send(Lifecycle::IdleExpired {
                        guild_id: self.guild_id,
                        session_id: self.id,
                    });
                }
            }
            Command::Restored { snapshot, preferences } => self.on_restored(snapshot, preferences),
            Command::SnapshotTick => {
                if self.dirty {
                    self.spawn_snapshot_flush();
                }
            }
        }
        ControlFlow::Continue(())
    }

    // ---- enqueue -------------------------------------------------------

    fn on_enqueue(
        &mut self,
        query: String,
        requester: UserId,
        voice_channel: Option<ChannelId>,
        reply: Reply<EnqueueOutcome>,
    ) {
        // A live connection wins over the requester's channel.
        if !self.connected {
            if let Some(channel) = voice_channel {
                self.channel = Some(channel);
            }
        }
        if self.channel.is_none() {
            let _ = reply.send(Err(EngineError::NoVoiceChannel));
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq, PendingEnqueue { reply, result: None });

        let resolver = self.ctx.resolver.clone();
        self.post(async move {
            let result = resolver.resolve(&query, requester).await;
            Some(Command::Resolved { seq, result })
        });
    }

    /// Results are applied strictly in request order; a fast resolution
    /// waits for the slower ones queued before it.
    fn on_resolved(&mut self, seq: u64, result: Result<Resolution, ResolutionError>) {
        match self.pending.get_mut(&seq) {
            Some(pending) => pending.result = Some(result),
            None => {
                debug!("Dropping resolution #{} cancelled by a stop", seq);
                return;
            }
        }

        while let Some(entry) = self.pending.first_entry() {
            if entry.get().result.is_none() {
                break;
            }
            let pending = entry.remove();
            if let Some(result) = pending.result {
                let outcome = self.apply_resolution(result);
                let _ = pending.reply.send(outcome);
            }
        }
    }

    fn apply_resolution(&mut self, result: Result<Resolution, ResolutionError>) -> Result<EnqueueOutcome, EngineError> {
        let resolution = result.map_err(|e| {
            if let ResolutionError::AllFailed { failures, .. } = &e {
                for failure in failures {
                    self.warn(format!("{}: {}", failure.query, failure.reason));
                }
            }
            EngineError::from(e)
        })?;

        let total = resolution.tracks.len();
        let position = self.queue.len() + 1;
        let added: Vec<TrackSummary> = resolution.tracks.iter().map(Track::summary).collect();
        let partial = resolution.is_partial();
        let count = self.queue.add_tracks(resolution.tracks)?;

        if partial {
            for failure in &resolution.failures {
                self.warn(format!("{}: {}", failure.query, failure.reason));
            }
        }
        if count < total {
            warn!("📦 Queue full in guild {}, dropped {} tracks", self.guild_id, total - count);
        }

        self.dirty = true;
        if self.state == PlaybackState::Idle {
            self.start();
        }

        Ok(EnqueueOutcome {
            added: added.into_iter().take(count).collect(),
            position,
            truncated: total - count,
            failures: resolution.failures,
            from_cache: resolution.from_cache,
        })
    }

    // ---- playback ------------------------------------------------------

    /// Leaves IDLE if there is something to play.
    fn start(&mut self) {
        if self.state != PlaybackState::Idle || !self.queue.has_upcoming() {
            return;
        }

        if self.connected {
            self.advance(Advance::Finished);
            return;
        }

        let Some(channel) = self.channel else {
            return;
        };
        self.token = self.token.next();
        self.transition(PlaybackState::Connecting);

        let token = self.token;
        let guild_id = self.guild_id;
        let transport = self.ctx.transport.clone();
        self.drive(async move {
            let result = transport.connect(guild_id, channel).await;
            Some(Command::Connected { token, result })
        });
    }

    fn on_connected(&mut self, token: PlaybackToken, result: Result<(), VoiceError>) {
        if token != self.token || self.state != PlaybackState::Connecting {
            // A stop overtook the handshake; don't leave a stray connection.
            if result.is_ok() && !self.connected && self.state != PlaybackState::Connecting {
                self.spawn_disconnect();
            }
            debug!("Stale connect result {} in guild {}", token, self.guild_id);
            return;
        }

        match result {
            Ok(()) => {
                self.connected = true;
                self.advance(Advance::Finished);
            }
            Err(e) => {
                error!("❌ Couldn't join voice in guild {}: {}", self.guild_id, e);
                self.warn(e.to_string());
                self.transition(PlaybackState::Idle);
            }
        }
    }

    /// Retires the current track and loads the next one, or goes idle.
    fn advance(&mut self, reason: Advance) {
        self.token = self.token.next();
        self.attempts = 0;
        self.clock.reset();
        self.dirty = true;

        match self.queue.advance(reason) {
            Some(track) => {
                self.transition(PlaybackState::Loading);
                let start_at = std::mem::take(&mut self.start_offset);
                self.dispatch(track, start_at);
            }
            None => self.go_idle(),
        }
    }

    fn dispatch(&mut self, track: Track, start_at: Duration) {
        let token = self.token;
        let guild_id = self.guild_id;
        let transport = self.ctx.transport.clone();
        let request = PlayRequest {
            token,
            track,
            volume: self.volume,
            start_at,
        };
        self.clock.seek(start_at);

        self.drive(async move {
            let result = transport.play(guild_id, request).await;
            Some(Command::PlayDispatched { token, result })
        });

        let deadline = self.ctx.settings.buffer_timeout;
        self.post(async move {
            tokio::time::sleep(deadline).await;
            Some(Command::BufferDeadline(token))
        });
    }

    fn go_idle(&mut self) {
        if self.state.has_track() {
            let transport = self.ctx.transport.clone();
            let guild_id = self.guild_id;
            let token = self.token;
            self.drive(async move {
                if let Err(e) = transport.stop(guild_id, token).await {
                    debug!("Stopping the finished stream failed: {}", e);
                }
                None
            });
        }
        self.clock.reset();
        self.transition(PlaybackState::Idle);
    }

    fn on_track_failed(&mut self, failure: TrackFailure) {
        let Some(track) = self.queue.current().cloned() else {
            return;
        };

        if failure.transient && self.attempts < self.ctx.settings.transient_retries {
            self.attempts += 1;
            warn!(
                "🔄 {} failed ({}), retry {}/{}",
                track.title(),
                failure.reason,
                self.attempts,
                self.ctx.settings.transient_retries
            );
            self.token = self.token.next();
            self.transition(PlaybackState::Loading);
            let resume_at = self.clock.position();
            self.dispatch(track, resume_at);
            return;
        }

        warn!("⏭️ Dropping {}: {}", track.title(), failure.reason);
        self.warn(format!("{}: {}", track.title(), failure.reason));
        self.advance(Advance::Failed);
    }

    fn on_voice_event(&mut self, event: VoiceEventKind) {
        match event {
            VoiceEventKind::BufferReady { token } => {
                if token == self.token && self.state == PlaybackState::Loading {
                    self.clock.resume();
                    self.transition(PlaybackState::Playing);
                    if let Some(track) = self.queue.current().map(Track::summary) {
                        info!("▶️ Now playing in guild {}: {}", self.guild_id, track.title);
                        self.announce(Announcement::NowPlaying {
                            guild_id: self.guild_id,
                            track,
                        });
                    }
                } else {
                    debug!("Stale buffer-ready {} (current {})", token, self.token);
                }
            }
            VoiceEventKind::TrackEnded { token } => {
                if token == self.token && self.state.has_track() {
                    self.advance(Advance::Finished);
                }
            }
            VoiceEventKind::TrackFailed { token, failure } => {
                if token == self.token && self.state.has_track() {
                    self.on_track_failed(failure);
                }
            }
            VoiceEventKind::Disconnected { reason } => self.on_disconnected(reason),
        }
    }

    /// Forced disconnect: back to IDLE with the queue intact.
    fn on_disconnected(&mut self, reason: String) {
        self.connected = false;
        // Stopping finishes on its own; a pending handshake reports for itself.
        if matches!(
            self.state,
            PlaybackState::Idle | PlaybackState::Stopping | PlaybackState::Connecting
        ) {
            return;
        }

        warn!("🔌 Lost voice in guild {} while {}: {}", self.guild_id, self.state, reason);
        self.token = self.token.next();
        if self.state.has_track() {
            self.start_offset = self.clock.position();
            self.queue.requeue_current();
        }
        self.clock.reset();
        self.dirty = true;
        self.transition(PlaybackState::Idle);
    }

    // ---- control -------------------------------------------------------

    fn on_skip(&mut self) -> Result<TrackSummary, EngineError> {
        if !self.state.has_track() {
            return Err(EngineError::invalid_state("skip", self.state));
        }
        let skipped = self
            .queue
            .current()
            .map(Track::summary)
            .ok_or(EngineError::invalid_state("skip", self.state))?;

        info!("⏭️ Skipping {} in guild {}", skipped.title, self.guild_id);
        self.start_offset = Duration::ZERO;
        self.advance(Advance::Skipped);
        Ok(skipped)
    }

    fn on_stop(&mut self) -> Result<(), EngineError> {
        if !self.state.can_transition_to(PlaybackState::Stopping) {
            return Err(EngineError::invalid_state("stop", self.state));
        }

        info!("⏹️ Stopping playback in guild {}", self.guild_id);
        self.cancel_pending();
        self.queue.clear();
        self.queue.take_current();
        self.start_offset = Duration::ZERO;
        self.clock.reset();
        self.dirty = true;

        self.token = self.token.next();
        self.transition(PlaybackState::Stopping);

        let token = self.token;
        let guild_id = self.guild_id;
        let transport = self.ctx.transport.clone();
        self.drive(async move {
            if let Err(e) = transport.stop(guild_id, token).await {
                debug!("Stop failed in guild {}: {}", guild_id, e);
            }
            if let Err(e) = transport.disconnect(guild_id).await {
                warn!("Disconnect failed in guild {}: {}", guild_id, e);
            }
            Some(Command::Stopped(token))
        });
        Ok(())
    }

    fn on_pause(&mut self) -> Result<(), EngineError> {
        if self.state != PlaybackState::Playing {
            return Err(EngineError::invalid_state("pause", self.state));
        }
        let (transport, guild_id) = (self.ctx.transport.clone(), self.guild_id);
        self.drive(async move {
            if let Err(e) = transport.pause(guild_id).await {
                warn!("Transport pause failed in guild {}: {}", guild_id, e);
            }
            None
        });
        self.clock.pause();
        self.transition(PlaybackState::Paused);
        Ok(())
    }

    fn on_resume(&mut self) -> Result<(), EngineError> {
        if self.state != PlaybackState::Paused {
            return Err(EngineError::invalid_state("resume", self.state));
        }
        let (transport, guild_id) = (self.ctx.transport.clone(), self.guild_id);
        self.drive(async move {
            if let Err(e) = transport.resume(guild_id).await {
                warn!("Transport resume failed in guild {}: {}", guild_id, e);
            }
            None
        });
        self.clock.resume();
        self.transition(PlaybackState::Playing);
        Ok(())
    }

    /// Seeking a remote stream can take seconds; the reply is sent once the
    /// transport is done, while the session keeps serving other requests.
    fn on_seek(&mut self, position: Duration, reply: Reply<()>) {
        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
            let _ = reply.send(Err(EngineError::invalid_state("seek", self.state)));
            return;
        }
        if let Some(duration) = self.queue.current().and_then(Track::duration) {
            if position > duration {
                let _ = reply.send(Err(EngineError::InvalidArgument(format!(
                    "the track is only {}s long",
                    duration.as_secs()
                ))));
                return;
            }
        }

        let token = self.token;
        let (transport, guild_id) = (self.ctx.transport.clone(), self.guild_id);
        self.drive(async move {
            let result = transport.seek(guild_id, position).await;
            Some(Command::Seeked {
                token,
                position,
                result,
                reply,
            })
        });
    }

    fn on_set_volume(&mut self, volume: u8) -> Result<u8, EngineError> {
        if volume > MAX_VOLUME {
            return Err(EngineError::InvalidArgument(format!(
                "volume must be between 0 and {}",
                MAX_VOLUME
            )));
        }

        self.volume = volume;
        self.dirty = true;
        if self.state.has_track() {
            let (transport, guild_id) = (self.ctx.transport.clone(), self.guild_id);
            self.drive(async move {
                if let Err(e) = transport.set_volume(guild_id, volume).await {
                    warn!("Transport volume change failed in guild {}: {}", guild_id, e);
                }
                None
            });
        }
        info!("🔊 Volume in guild {} set to {}%", self.guild_id, volume);
        Ok(volume)
    }

    async fn on_shutdown(&mut self, mode: ShutdownMode, reply: oneshot::Sender<bool>) -> ControlFlow<()> {
        if mode == ShutdownMode::IdleExpiry && (self.state != PlaybackState::Idle || !self.pending.is_empty()) {
            debug!("Guild {} became busy again, keeping session {}", self.guild_id, self.id);
            let _ = reply.send(false);
            return ControlFlow::Continue(());
        }

        self.cancel_pending();
        let store = self.ctx.store.clone();
        let guild_id = self.guild_id;
        // Queued behind any flush still in flight, so an older save can't
        // land after this.
        match mode {
            ShutdownMode::Leave => self.writer.submit(async move {
                if let Err(e) = store.delete_snapshot(guild_id).await {
                    warn!("Couldn't delete snapshot for guild {}: {}", guild_id, e);
                }
            }),
            ShutdownMode::IdleExpiry | ShutdownMode::ProcessExit => {
                let snapshot = self.snapshot();
                self.writer.submit(async move {
                    if let Err(e) = write_snapshot(store.as_ref(), &snapshot).await {
                        warn!("Final snapshot failed for guild {}: {}", guild_id, e);
                    }
                });
            }
        }

        let transport = self.ctx.transport.clone();
        let (token, has_track) = (self.token, self.state.has_track());
        let connected = self.connected || self.state == PlaybackState::Connecting;
        self.voice.submit(async move {
            if has_track {
                let _ = transport.stop(guild_id, token).await;
            }
            if connected {
                if let Err(e) = transport.disconnect(guild_id).await {
                    warn!("Disconnect failed in guild {}: {}", guild_id, e);
                }
            }
        });

        futures::join!(self.writer.drain(), self.voice.drain());
        if self.state != PlaybackState::Idle {
            self.announce(Announcement::Idle { guild_id });
        }

        info!("👋 Session {} for guild {} shutting down ({:?})", self.id, self.guild_id, mode);
        let _ = reply.send(true);
        ControlFlow::Break(())
    }

    // ---- persistence ---------------------------------------------------

    fn spawn_restore(&self) {
        let store = self.ctx.store.clone();
        let guild_id = self.guild_id;
        self.post(async move {
            let snapshot = store.load_snapshot(guild_id).await.unwrap_or_else(|e| {
                warn!("Ignoring unreadable snapshot for guild {}: {}", guild_id, e);
                None
            });
            let preferences = store
                .load_preferences(guild_id)
                .await
                .map_err(|e| warn!("Couldn't load preferences for guild {}: {}", guild_id, e))
                .ok();
            Some(Command::Restored { snapshot, preferences })
        });
    }

    fn on_restored(&mut self, snapshot: Option<QueueSnapshot>, preferences: Option<GuildPreferences>) {
        if let Some(volume) = preferences.and_then(|p| p.default_volume) {
            self.volume = volume.min(MAX_VOLUME);
        }

        let Some(snapshot) = snapshot.filter(|s| !s.is_empty()) else {
            return;
        };

        info!(
            "♻️ Restoring {} tracks for guild {}",
            snapshot.queue.len() + usize::from(snapshot.current.is_some()),
            self.guild_id
        );
        self.volume = snapshot.volume.min(MAX_VOLUME);
        self.queue.set_loop_mode(snapshot.loop_mode);
        if self.channel.is_none() {
            self.channel = snapshot.voice_channel;
        }

        let mut tracks = Vec::with_capacity(snapshot.queue.len() + 1);
        if let Some(current) = snapshot.current {
            if self.state == PlaybackState::Idle {
                self.start_offset = snapshot.position;
            }
            tracks.push(current);
        }
        tracks.extend(snapshot.queue);
        self.queue.restore_front(tracks);
        self.start();
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            guild_id: self.guild_id,
            voice_channel: self.channel,
            current: self.queue.current().cloned(),
            position: if self.state.has_track() {
                self.clock.position()
            } else {
                self.start_offset
            },
            queue: self.queue.tracks().cloned().collect(),
            volume: self.volume,
            loop_mode: self.queue.loop_mode(),
            saved_at: Utc::now(),
        }
    }

    fn spawn_snapshot_flush(&mut self) {
        self.dirty = false;
        let snapshot = self.snapshot();
        let store = self.ctx.store.clone();
        self.writer.submit(async move {
            if let Err(e) = write_snapshot(store.as_ref(), &snapshot).await {
                warn!("Snapshot for guild {} failed: {}", snapshot.guild_id, e);
            }
        });
    }

    fn spawn_snapshot_ticker(&self) {
        let every = self.ctx.settings.snapshot_interval;
        let internal = self.internal.clone();
        let cancel = self.background.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if internal.send(Command::SnapshotTick).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // ---- helpers -------------------------------------------------------

    fn transition(&mut self, next: PlaybackState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        if !self.state.can_transition_to(next) {
            error!("Illegal transition {} -> {} in guild {}", self.state, next, self.guild_id);
        }

        debug!("Guild {}: {} -> {}", self.guild_id, self.state, next);
        let was_active = self.state != PlaybackState::Idle;
        self.state = next;
        self.idle_epoch += 1;
        if next == PlaybackState::Idle {
            self.arm_idle_timer();
            if was_active {
                self.announce(Announcement::Idle { guild_id: self.guild_id });
            }
        }
    }

    fn arm_idle_timer(&self) {
        let epoch = self.idle_epoch;
        let timeout = self.ctx.settings.idle_timeout;
        self.post(async move {
            tokio::time::sleep(timeout).await;
            Some(Command::IdleExpired(epoch))
        });
    }

    fn cancel_pending(&mut self) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(EngineError::Cancelled));
        }
    }

    fn spawn_disconnect(&self) {
        let transport = self.ctx.transport.clone();
        let guild_id = self.guild_id;
        self.drive(async move {
            let _ = transport.disconnect(guild_id).await;
            None
        });
    }

    fn announce(&self, announcement: Announcement) {
        // Fails only when nobody is subscribed.
        let _ = self.ctx.announcements.send(announcement);
    }

    fn warn(&mut self, message: String) {
        self.warnings.push_back(message);
        while self.warnings.len() > MAX_WARNINGS {
            self.warnings.pop_front();
        }
    }

    fn view(&self) -> QueueView {
        QueueView {
            state: self.state,
            current: self
                .queue
                .current()
                .filter(|_| self.state.has_track())
                .map(|track| NowPlaying {
                    track: track.summary(),
                    position: self.clock.position(),
                }),
            upcoming: self.queue.tracks().map(Track::summary).collect(),
            volume: self.volume,
            loop_mode: self.queue.loop_mode(),
            voice_channel: self.channel,
            total_duration: self.queue.total_duration(),
            warnings: self.warnings.iter().cloned().collect(),
            recent: self
                .queue
                .history()
                .rev()
                .take(RECENT_TRACKS)
                .map(Track::summary)
                .collect(),
        }
    }

    /// Runs `work` off the session task and posts its result back.
    fn post<F>(&self, work: F)
    where
        F: std::future::Future<Output = Option<Command>> + Send + 'static,
    {
        let internal = self.internal.clone();
        tokio::spawn(async move {
            if let Some(command) = work.await {
                let _ = internal.send(command);
            }
        });
    }

    /// Like [`post`](Self::post), but on the voice lane: transport calls run
    /// one at a time, in the order the session issued them.
    fn drive<F>(&self, work: F)
    where
        F: std::future::Future<Output = Option<Command>> + Send + 'static,
    {
        let internal = self.internal.clone();
        self.voice.submit(async move {
            if let Some(command) = work.await {
                let _ = internal.send(command);
            }
        });
    }
}

async fn write_snapshot(store: &dyn SnapshotStore, snapshot: &QueueSnapshot) -> Result<(), PersistenceError> {
    if snapshot.is_empty() {
        store.delete_snapshot(snapshot.guild_id).await
    } else {
        store.save_snapshot(snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::registry::testing::{eventually, wait_for, Harness};
    use crate::audio::voice::fake::Call;
    use crate::sources::{resolver::test_metadata, MockMusicSource, QueryShape, Resolved};
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const GUILD: GuildId = GuildId::new(1);
    const CHANNEL: ChannelId = ChannelId::new(10);
    const USER: UserId = UserId::new(100);

    fn titles(view: &QueueView) -> Vec<String> {
        view.upcoming.iter().map(|t| t.title.clone()).collect()
    }

    async fn playing(harness: &Harness, title: &str) {
        let title = title.to_string();
        wait_for(&harness.engine, GUILD, move |view| {
            view.state == PlaybackState::Playing
                && view.current.as_ref().map(|c| c.track.title.as_str()) == Some(title.as_str())
        })
        .await;
    }

    #[tokio::test]
    async fn enqueue_into_idle_starts_playback() {
        let harness = Harness::new();
        let outcome = harness
            .engine
            .enqueue(GUILD, "first song", USER, Some(CHANNEL))
            .await
            .expect("enqueued");
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.position, 1);

        playing(&harness, "first song").await;
        assert_eq!(
            harness.transport.calls(GUILD)[0],
            Call::Connect(CHANNEL),
        );
    }

    #[tokio::test]
    async fn enqueue_needs_a_voice_channel() {
        let harness = Harness::new();
        let result = harness.engine.enqueue(GUILD, "song", USER, None).await;
        assert_eq!(result, Err(EngineError::NoVoiceChannel));
    }

    #[tokio::test]
    async fn queue_view_preserves_enqueue_order() {
        let harness = Harness::new();
        for title in ["a", "b", "c", "d"] {
            harness
                .engine
                .enqueue(GUILD, title, USER, Some(CHANNEL))
                .await
                .expect("enqueued");
        }
        playing(&harness, "a").await;

        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert_eq!(titles(&view), vec!["b", "c", "d"]);
    }

    /// Search mock whose `slow*` queries block until the returned sender
    /// fires (or two seconds pass).
    fn gated_search() -> (std::sync::mpsc::Sender<()>, impl FnOnce(&mut MockMusicSource)) {
        let (open, gate) = std::sync::mpsc::channel::<()>();
        let gate = parking_lot::Mutex::new(gate);
        let configure = move |search: &mut MockMusicSource| {
            search.expect_resolve().returning(move |shape| {
                let text = shape.as_query();
                if text.starts_with("slow") {
                    let _ = gate.lock().recv_timeout(Duration::from_secs(2));
                }
                Ok(vec![Resolved::Playable(crate::sources::resolver::test_track(&text))])
            });
        };
        (open, configure)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_apply_in_arrival_order() {
        let (open, configure) = gated_search();
        let harness = Harness::with_search(configure);
        let session = harness.engine.registry().get_or_create(GUILD);

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.enqueue("slow".into(), USER, Some(CHANNEL)).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = tokio::spawn({
            let session = session.clone();
            async move { session.enqueue("fast".into(), USER, Some(CHANNEL)).await }
        });

        // "fast" is resolved but held back behind "slow".
        tokio::time::sleep(Duration::from_millis(30)).await;
        let view = session.view().await.expect("view");
        assert!(view.upcoming.is_empty());
        assert_eq!(view.state, PlaybackState::Idle);

        open.send(()).expect("gate open");
        assert_eq!(first.await.expect("joined").expect("first").position, 1);
        assert_eq!(second.await.expect("joined").expect("second").position, 2);

        playing(&harness, "slow").await;
        let view = session.view().await.expect("view");
        assert_eq!(titles(&view), vec!["fast"]);
    }

    #[tokio::test]
    async fn pausing_twice_reports_invalid_state_once() {
        let harness = Harness::new();
        harness.engine.enqueue(GUILD, "song", USER, Some(CHANNEL)).await.expect("enqueued");
        playing(&harness, "song").await;

        harness.engine.pause(GUILD).await.expect("first pause");
        assert_eq!(
            harness.engine.pause(GUILD).await,
            Err(EngineError::InvalidState {
                action: "pause",
                state: PlaybackState::Paused
            })
        );

        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert_eq!(view.state, PlaybackState::Paused);
        eventually("pause reaching the transport", || {
            harness.transport.count(GUILD, |c| *c == Call::Pause) == 1
        })
        .await;

        harness.engine.resume(GUILD).await.expect("resume");
        assert_eq!(harness.engine.resume(GUILD).await.map_err(|_| ()), Err(()));
    }

    #[tokio::test]
    async fn late_buffer_ready_for_a_skipped_track_is_ignored() {
        let harness = Harness::new();
        harness.transport.set_auto_ready(false);
        for title in ["a", "b"] {
            harness.engine.enqueue(GUILD, title, USER, Some(CHANNEL)).await.expect("enqueued");
        }
        wait_for(&harness.engine, GUILD, |v| v.state == PlaybackState::Loading).await;
        let stale = harness.dispatched(GUILD, None).await;

        harness.engine.skip(GUILD).await.expect("skip while loading");
        let fresh = harness.dispatched(GUILD, Some(stale)).await;
        harness.transport.emit(GUILD, VoiceEventKind::BufferReady { token: stale });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert_eq!(view.state, PlaybackState::Loading);
        assert_eq!(view.current.map(|c| c.track.title), Some("b".to_string()));

        harness.transport.emit(GUILD, VoiceEventKind::BufferReady { token: fresh });
        playing(&harness, "b").await;
    }

    #[tokio::test]
    async fn back_to_back_skips_advance_exactly_twice() {
        let harness = Harness::new();
        for title in ["a", "b", "c", "d"] {
            harness.engine.enqueue(GUILD, title, USER, Some(CHANNEL)).await.expect("enqueued");
        }
        playing(&harness, "a").await;

        let first = harness.engine.skip(GUILD).await.expect("skip a");
        let second = harness.engine.skip(GUILD).await.expect("skip b");
        assert_eq!(first.title, "a");
        assert_eq!(second.title, "b");

        playing(&harness, "c").await;
        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert_eq!(titles(&view), vec!["d"]);
    }

    #[tokio::test]
    async fn skips_racing_a_slow_hand_off_advance_exactly_twice() {
        let harness = Harness::new();
        for title in ["a", "b", "c", "d"] {
            harness.engine.enqueue(GUILD, title, USER, Some(CHANNEL)).await.expect("enqueued");
        }
        playing(&harness, "a").await;

        // "b" is still being handed to the mixer when the second skip lands.
        harness.transport.slow_title("b", Duration::from_millis(60));
        harness.engine.skip(GUILD).await.expect("skip a");
        harness.engine.skip(GUILD).await.expect("skip b");

        playing(&harness, "c").await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert_eq!(view.current.clone().map(|c| c.track.title), Some("c".to_string()));
        assert_eq!(titles(&view), vec!["d"]);
        assert_eq!(harness.transport.played_titles(GUILD), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn a_slow_seek_never_blocks_other_requests() {
        let harness = Harness::new();
        for title in ["a", "b"] {
            harness.engine.enqueue(GUILD, title, USER, Some(CHANNEL)).await.expect("enqueued");
        }
        playing(&harness, "a").await;
        harness.transport.slow_seeks(Duration::from_millis(300));

        let seeking = tokio::spawn({
            let engine = harness.engine.clone();
            async move { engine.seek(GUILD, Duration::from_secs(20)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let view = tokio::time::timeout(Duration::from_millis(100), harness.engine.queue_view(GUILD))
            .await
            .expect("view answered during the seek")
            .expect("view");
        assert_eq!(view.state, PlaybackState::Playing);
        let paused = tokio::time::timeout(Duration::from_millis(100), harness.engine.pause(GUILD))
            .await
            .expect("pause answered during the seek");
        assert_eq!(paused, Ok(()));

        seeking.await.expect("joined").expect("seek");
        assert!(harness.transport.calls(GUILD).contains(&Call::Seek(Duration::from_secs(20))));
    }

    #[tokio::test]
    async fn tracks_are_announced_once_and_idle_when_done() {
        let harness = Harness::new();
        let mut announcements = harness.engine.announcements();
        harness.engine.enqueue(GUILD, "only", USER, Some(CHANNEL)).await.expect("enqueued");
        playing(&harness, "only").await;

        harness.engine.pause(GUILD).await.expect("pause");
        harness.engine.resume(GUILD).await.expect("resume");
        harness.transport.finish(GUILD);
        wait_for(&harness.engine, GUILD, |v| v.state == PlaybackState::Idle).await;

        let mut seen = Vec::new();
        while let Ok(announcement) = announcements.try_recv() {
            seen.push(announcement);
        }
        assert_eq!(seen.len(), 2, "{:?}", seen);
        assert!(matches!(&seen[0], Announcement::NowPlaying { track, .. } if track.title == "only"));
        assert_eq!(seen[1], Announcement::Idle { guild_id: GUILD });

        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert_eq!(view.recent.iter().map(|t| t.title.as_str()).collect::<Vec<_>>(), vec!["only"]);
    }

    #[tokio::test]
    async fn leave_never_brings_back_a_snapshot() {
        let harness = Harness::with_settings(SessionSettings {
            snapshot_interval: Duration::from_millis(10),
            ..SessionSettings::default()
        });
        *harness.store.save_delay.lock() = Duration::from_millis(100);
        harness.engine.enqueue(GUILD, "song", USER, Some(CHANNEL)).await.expect("enqueued");

        // A save is in flight when the guild leaves.
        eventually("a snapshot save starting", || {
            harness.store.saves_started.load(std::sync::atomic::Ordering::SeqCst) > 0
        })
        .await;
        harness.engine.leave(GUILD).await.expect("leave");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.store.snapshots.get(&GUILD).is_none());
    }

    #[tokio::test]
    async fn skip_and_stop_are_invalid_when_idle() {
        let harness = Harness::new();
        harness.engine.registry().get_or_create(GUILD);
        assert!(matches!(
            harness.engine.skip(GUILD).await,
            Err(EngineError::InvalidState { action: "skip", .. })
        ));
        assert!(matches!(
            harness.engine.stop(GUILD).await,
            Err(EngineError::InvalidState { action: "stop", .. })
        ));
    }

    #[tokio::test]
    async fn exhausting_the_queue_goes_idle_then_expires() {
        let harness = Harness::with_settings(SessionSettings {
            idle_timeout: Duration::from_millis(80),
            ..SessionSettings::default()
        });
        harness.engine.enqueue(GUILD, "only", USER, Some(CHANNEL)).await.expect("enqueued");
        playing(&harness, "only").await;

        harness.transport.finish(GUILD);
        wait_for(&harness.engine, GUILD, |v| v.state == PlaybackState::Idle).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while harness.engine.registry().get(GUILD).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session removed after the idle timeout");
        assert_eq!(harness.engine.queue_view(GUILD).await, Err(EngineError::NoActiveSession));
        assert_eq!(harness.transport.calls(GUILD).last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn failing_playlist_track_is_reported_with_its_query() {
        let mut spotify = MockMusicSource::new();
        spotify.expect_source_name().return_const("spotify");
        spotify
            .expect_accepts()
            .returning(|shape| matches!(shape, QueryShape::Spotify(_)));
        spotify.expect_resolve().returning(|_| {
            Ok(["One", "Two", "Three"]
                .into_iter()
                .map(|t| Resolved::Metadata(test_metadata(t)))
                .collect())
        });

        let harness = Harness::builder()
            .search(|search| {
                search.expect_resolve().returning(|shape| match shape.as_query().as_str() {
                    "Artist - Two" => Err(crate::error::ProviderError::NotFound("Artist - Two".into())),
                    other => Ok(vec![Resolved::Playable(crate::sources::resolver::test_track(other))]),
                });
            })
            .source(spotify)
            .build();
        harness.transport.set_auto_ready(false);

        let outcome = harness
            .engine
            .enqueue(GUILD, "spotify:playlist:abc", USER, Some(CHANNEL))
            .await
            .expect("partial success");
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(outcome.failures[0].query, "Artist - Two");

        wait_for(&harness.engine, GUILD, |v| v.state == PlaybackState::Loading).await;
        let view = harness.engine.queue_view(GUILD).await.expect("view");
        let mut all: Vec<String> = view.current.iter().map(|c| c.track.title.clone()).collect();
        all.extend(titles(&view));
        assert_eq!(all, vec!["One", "Three"]);
        assert!(view.warnings.iter().any(|w| w.contains("Artist - Two")));
    }

    #[tokio::test]
    async fn unplayable_tracks_are_dropped_and_playback_moves_on() {
        let harness = Harness::new();
        harness.transport.fail_title("broken");
        for title in ["broken", "fine"] {
            harness.engine.enqueue(GUILD, title, USER, Some(CHANNEL)).await.expect("enqueued");
        }

        playing(&harness, "fine").await;
        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert!(view.warnings[0].starts_with("broken"));
        assert_eq!(harness.transport.played_titles(GUILD), vec!["broken", "fine"]);
    }

    #[tokio::test]
    async fn transient_buffer_timeouts_are_retried_once() {
        let harness = Harness::with_settings(SessionSettings {
            buffer_timeout: Duration::from_millis(40),
            ..SessionSettings::default()
        });
        harness.transport.set_auto_ready(false);
        harness.engine.enqueue(GUILD, "slow", USER, Some(CHANNEL)).await.expect("enqueued");

        // First deadline retries, second one drops the track.
        wait_for(&harness.engine, GUILD, |v| v.state == PlaybackState::Idle && !v.warnings.is_empty()).await;
        assert_eq!(harness.transport.played_titles(GUILD), vec!["slow", "slow"]);
    }

    #[tokio::test]
    async fn forced_disconnect_keeps_the_queue() {
        let harness = Harness::new();
        for title in ["a", "b"] {
            harness.engine.enqueue(GUILD, title, USER, Some(CHANNEL)).await.expect("enqueued");
        }
        playing(&harness, "a").await;

        harness.transport.emit(
            GUILD,
            VoiceEventKind::Disconnected {
                reason: "kicked".into(),
            },
        );
        wait_for(&harness.engine, GUILD, |v| v.state == PlaybackState::Idle).await;
        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert_eq!(titles(&view), vec!["a", "b"]);

        // The next request reconnects and picks up where it left off.
        harness.engine.enqueue(GUILD, "c", USER, None).await.expect("enqueued");
        playing(&harness, "a").await;
        assert_eq!(harness.transport.count(GUILD, |c| matches!(c, Call::Connect(_))), 2);
    }

    #[tokio::test]
    async fn stop_clears_and_disconnects() {
        let harness = Harness::new();
        for title in ["a", "b"] {
            harness.engine.enqueue(GUILD, title, USER, Some(CHANNEL)).await.expect("enqueued");
        }
        playing(&harness, "a").await;

        harness.engine.stop(GUILD).await.expect("stop");
        wait_for(&harness.engine, GUILD, |v| v.state == PlaybackState::Idle).await;

        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert!(view.upcoming.is_empty());
        assert!(view.current.is_none());
        assert!(harness.transport.calls(GUILD).contains(&Call::Disconnect));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_cancels_enqueues_still_resolving() {
        let (open, configure) = gated_search();
        let harness = Harness::with_search(configure);
        harness.engine.enqueue(GUILD, "a", USER, Some(CHANNEL)).await.expect("enqueued");
        playing(&harness, "a").await;

        let session = harness.engine.registry().get(GUILD).expect("session");
        let pending = tokio::spawn(async move { session.enqueue("slow".into(), USER, None).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        harness.engine.stop(GUILD).await.expect("stop");

        assert_eq!(pending.await.expect("joined"), Err(EngineError::Cancelled));
        open.send(()).expect("gate open");

        // The late resolution is dropped, nothing gets queued.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert!(view.upcoming.is_empty());
    }

    #[tokio::test]
    async fn volume_loop_and_seek_are_validated() {
        let harness = Harness::new();
        harness.engine.enqueue(GUILD, "song", USER, Some(CHANNEL)).await.expect("enqueued");
        playing(&harness, "song").await;

        assert_eq!(harness.engine.set_volume(GUILD, 150).await, Ok(150));
        assert!(matches!(
            harness.engine.set_volume(GUILD, 201).await,
            Err(EngineError::InvalidArgument(_))
        ));
        eventually("volume reaching the transport", || {
            harness.transport.calls(GUILD).contains(&Call::SetVolume(150))
        })
        .await;

        assert_eq!(harness.engine.set_loop(GUILD, LoopMode::Track).await, Ok(LoopMode::Track));

        // test_track has no duration, so any position is accepted.
        harness.engine.seek(GUILD, Duration::from_secs(30)).await.expect("seek");
        assert!(harness.transport.calls(GUILD).contains(&Call::Seek(Duration::from_secs(30))));

        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert_eq!(view.volume, 150);
        assert_eq!(view.loop_mode, LoopMode::Track);
        assert!(view.current.expect("playing").position >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn snapshots_are_restored_on_creation() {
        let harness = Harness::new();
        harness.store.snapshots.insert(
            GUILD,
            QueueSnapshot {
                guild_id: GUILD,
                voice_channel: Some(CHANNEL),
                current: Some(crate::sources::resolver::test_track("was playing")),
                position: Duration::from_secs(12),
                queue: vec![crate::sources::resolver::test_track("next")],
                volume: 70,
                loop_mode: LoopMode::Off,
                saved_at: Utc::now(),
            },
        );

        harness.engine.registry().get_or_create(GUILD);
        playing(&harness, "was playing").await;

        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert_eq!(view.volume, 70);
        assert_eq!(titles(&view), vec!["next"]);
    }

    #[tokio::test]
    async fn random_command_sequences_stay_within_the_transition_table() {
        let harness = Harness::with_settings(SessionSettings {
            buffer_timeout: Duration::from_millis(20),
            ..SessionSettings::default()
        });
        let mut rng = StdRng::seed_from_u64(0x5eed);
        harness.engine.registry().get_or_create(GUILD);

        for step in 0..200 {
            let result = match rng.gen_range(0..9) {
                0 | 1 => harness
                    .engine
                    .enqueue(GUILD, &format!("t{}", step), USER, Some(CHANNEL))
                    .await
                    .map(|_| ()),
                2 => harness.engine.skip(GUILD).await.map(|_| ()),
                3 => harness.engine.pause(GUILD).await,
                4 => harness.engine.resume(GUILD).await,
                5 => harness.engine.stop(GUILD).await,
                6 => {
                    harness.transport.finish(GUILD);
                    Ok(())
                }
                7 => {
                    harness.transport.emit(
                        GUILD,
                        VoiceEventKind::Disconnected {
                            reason: "chaos".into(),
                        },
                    );
                    Ok(())
                }
                _ => harness.engine.shuffle(GUILD).await.map(|_| ()),
            };

            // The session task never dies: only typed, non-fatal errors.
            assert_ne!(result, Err(EngineError::NoActiveSession), "step {}", step);
            if rng.gen_bool(0.3) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }

        let view = harness.engine.queue_view(GUILD).await.expect("session alive");
        assert!(view.upcoming.len() <= SessionSettings::default().max_queue_size);
    }

    #[tokio::test]
    async fn failed_voice_joins_keep_the_queue() {
        let harness = Harness::new();
        harness.transport.refuse_connections();
        let outcome = harness
            .engine
            .enqueue(GUILD, "waiting", USER, Some(CHANNEL))
            .await
            .expect("resolution still succeeds");
        assert_eq!(outcome.position, 1);

        wait_for(&harness.engine, GUILD, |v| v.state == PlaybackState::Idle && !v.warnings.is_empty()).await;
        let view = harness.engine.queue_view(GUILD).await.expect("view");
        assert_eq!(titles(&view), vec!["waiting"]);
        assert!(harness.transport.played_titles(GUILD).is_empty());
    }

    #[test]
    fn views_are_paginated() {
        let summary = |i: usize| TrackSummary {
            title: format!("t{}", i),
            artist: None,
            duration: None,
            url: String::new(),
            requested_by: USER,
            requested_at: Utc::now(),
        };
        let view = QueueView {
            state: PlaybackState::Idle,
            current: None,
            upcoming: (1..=12).map(summary).collect(),
            volume: 30,
            loop_mode: LoopMode::Off,
            voice_channel: None,
            total_duration: Duration::ZERO,
            warnings: Vec::new(),
            recent: Vec::new(),
        };

        assert_eq!(view.total_pages(5), 3);
        let (start, items) = view.page(3, 5);
        assert_eq!(start, 11);
        assert_eq!(items.len(), 2);
        assert_eq!(view.page(99, 5).0, 11);
    }
}
