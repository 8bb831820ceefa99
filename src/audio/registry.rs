use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session::{self, Announcement, Lifecycle, SessionContext, SessionHandle, SessionSettings, ShutdownMode};
use super::voice::{VoiceEvent, VoiceTransport};
use crate::sources::TrackResolver;
use crate::storage::SnapshotStore;

const ANNOUNCEMENT_BUFFER: usize = 64;

/// Process-wide map of guild → running session.
///
/// [`SessionRegistry::get_or_create`] is the only way a session comes to
/// life; the per-key entry lock guarantees at most one per guild.
pub struct SessionRegistry {
    sessions: DashMap<GuildId, SessionHandle>,
    context: SessionContext,
    next_id: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRegistry {
    /// Builds the registry and starts its lifecycle and voice-event pumps.
    pub fn init(
        resolver: Arc<TrackResolver>,
        transport: Arc<dyn VoiceTransport>,
        store: Arc<dyn SnapshotStore>,
        settings: SessionSettings,
        voice_events: mpsc::UnboundedReceiver<VoiceEvent>,
    ) -> Arc<Self> {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (announcements, _) = broadcast::channel(ANNOUNCEMENT_BUFFER);

        let registry = Arc::new(Self {
            sessions: DashMap::new(),
            context: SessionContext {
                resolver,
                transport,
                store,
                settings,
                lifecycle: lifecycle_tx,
                announcements,
            },
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let lifecycle = tokio::spawn(lifecycle_loop(Arc::downgrade(&registry), lifecycle_rx, registry.cancel.clone()));
        let pump = tokio::spawn(voice_pump(Arc::downgrade(&registry), voice_events, registry.cancel.clone()));
        registry.tasks.lock().extend([lifecycle, pump]);

        info!("🗂️ Session registry ready");
        registry
    }

    /// Now-playing and idle news from every session. Slow receivers miss
    /// old announcements rather than holding sessions up.
    pub fn announcements(&self) -> broadcast::Receiver<Announcement> {
        self.context.announcements.subscribe()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<SessionHandle> {
        self.sessions
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    pub fn get_or_create(&self, guild_id: GuildId) -> SessionHandle {
        match self.sessions.entry(guild_id) {
            Entry::Occupied(entry) if !entry.get().is_closed() => entry.get().clone(),
            Entry::Occupied(mut entry) => {
                let handle = self.spawn_session(guild_id);
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => entry.insert(self.spawn_session(guild_id)).value().clone(),
        }
    }

    fn spawn_session(&self, guild_id: GuildId) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Creating session {} for guild {}", id, guild_id);
        session::spawn(id, guild_id, self.context.clone())
    }

    /// Explicit leave: stops the session, releases voice and forgets it.
    /// Returns `false` if the guild had no session.
    pub async fn remove(&self, guild_id: GuildId) -> bool {
        let Some(handle) = self.get(guild_id) else {
            return false;
        };

        handle.shutdown(ShutdownMode::Leave).await;
        self.sessions.remove_if(&guild_id, |_, current| current.id() == handle.id());
        info!("🗑️ Session for guild {} removed", guild_id);
        true
    }

    /// Idle expiry. Skipped if the session woke up again or was replaced.
    async fn expire(&self, guild_id: GuildId, session_id: u64) {
        let Some(handle) = self.get(guild_id).filter(|h| h.id() == session_id) else {
            debug!("Expiry for replaced session {} ignored", session_id);
            return;
        };

        if handle.shutdown(ShutdownMode::IdleExpiry).await {
            self.sessions.remove_if(&guild_id, |_, current| current.id() == session_id);
            info!("💤 Session for guild {} expired", guild_id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drains every session, keeping final snapshots, and stops the pumps.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        info!("🛑 Draining {} sessions", handles.len());
        join_all(handles.iter().map(|h| h.shutdown(ShutdownMode::ProcessExit))).await;
        self.sessions.clear();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        join_all(tasks).await;
    }
}

async fn lifecycle_loop(
    registry: Weak<SessionRegistry>,
    mut rx: mpsc::UnboundedReceiver<Lifecycle>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(registry) = registry.upgrade() else { break };

        match event {
            Lifecycle::IdleExpired { guild_id, session_id } => {
                // Expiry waits on the session; don't hold up other guilds.
                tokio::spawn(async move { registry.expire(guild_id, session_id).await });
            }
        }
    }
}

async fn voice_pump(
    registry: Weak<SessionRegistry>,
    mut events: mpsc::UnboundedReceiver<VoiceEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(handle) = registry.upgrade().and_then(|r| r.get(event.guild_id)) else {
            debug!("Voice event for guild {} without a session", event.guild_id);
            continue;
        };
        handle.notify(event.kind);
    }
}
