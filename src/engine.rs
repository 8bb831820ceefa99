use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::info;

use crate::audio::{
    queue::LoopMode,
    registry::SessionRegistry,
    session::{Announcement, EnqueueOutcome, QueueView, SessionHandle, MAX_VOLUME},
    state::PlaybackState,
};
use crate::error::EngineError;
use crate::sources::TrackSummary;

/// Guild-keyed front door used by the command layer.
///
/// Only [`RadioEngine::enqueue`] creates sessions; every other operation
/// needs one to exist already and fails with
/// [`EngineError::NoActiveSession`] otherwise.
#[derive(Clone)]
pub struct RadioEngine {
    registry: Arc<SessionRegistry>,
}

impl RadioEngine {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn session(&self, guild_id: GuildId) -> Result<SessionHandle, EngineError> {
        self.registry.get(guild_id).ok_or(EngineError::NoActiveSession)
    }

    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        query: &str,
        requester: UserId,
        voice_channel: Option<ChannelId>,
    ) -> Result<EnqueueOutcome, EngineError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(EngineError::InvalidArgument("query is empty".into()));
        }

        info!("🎵 Enqueue in guild {} by {}: {}", guild_id, requester, query);
        self.registry
            .get_or_create(guild_id)
            .enqueue(query.to_string(), requester, voice_channel)
            .await
    }

    pub async fn skip(&self, guild_id: GuildId) -> Result<TrackSummary, EngineError> {
        self.session(guild_id)?.skip().await
    }

    pub async fn stop(&self, guild_id: GuildId) -> Result<(), EngineError> {
        self.session(guild_id)?.stop().await
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<(), EngineError> {
        self.session(guild_id)?.pause().await
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<(), EngineError> {
        self.session(guild_id)?.resume().await
    }

    pub async fn seek(&self, guild_id: GuildId, position: Duration) -> Result<(), EngineError> {
        self.session(guild_id)?.seek(position).await
    }

    pub async fn set_volume(&self, guild_id: GuildId, volume: u8) -> Result<u8, EngineError> {
        self.session(guild_id)?.set_volume(volume).await
    }

    pub async fn set_loop(&self, guild_id: GuildId, mode: LoopMode) -> Result<LoopMode, EngineError> {
        self.session(guild_id)?.set_loop(mode).await
    }

    /// Pauses a playing guild or resumes a paused one. Returns whether the
    /// guild ends up paused.
    pub async fn toggle_pause(&self, guild_id: GuildId) -> Result<bool, EngineError> {
        let session = self.session(guild_id)?;
        match session.view().await?.state {
            PlaybackState::Paused => session.resume().await.map(|_| false),
            _ => session.pause().await.map(|_| true),
        }
    }

    /// Moves the volume by `delta` percent, clamped to the valid range.
    pub async fn adjust_volume(&self, guild_id: GuildId, delta: i16) -> Result<u8, EngineError> {
        let session = self.session(guild_id)?;
        let current = i16::from(session.view().await?.volume);
        let target = (current + delta).clamp(0, i16::from(MAX_VOLUME));
        session.set_volume(target as u8).await
    }

    pub async fn cycle_loop(&self, guild_id: GuildId) -> Result<LoopMode, EngineError> {
        let session = self.session(guild_id)?;
        let next = session.view().await?.loop_mode.next();
        session.set_loop(next).await
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> Result<usize, EngineError> {
        self.session(guild_id)?.shuffle().await
    }

    /// Zero-based positions within the upcoming tracks.
    pub async fn move_track(&self, guild_id: GuildId, from: usize, to: usize) -> Result<(), EngineError> {
        self.session(guild_id)?.move_track(from, to).await
    }

    pub async fn remove_track(&self, guild_id: GuildId, index: usize) -> Result<TrackSummary, EngineError> {
        self.session(guild_id)?.remove_track(index).await
    }

    pub async fn queue_view(&self, guild_id: GuildId) -> Result<QueueView, EngineError> {
        self.session(guild_id)?.view().await
    }

    pub async fn leave(&self, guild_id: GuildId) -> Result<(), EngineError> {
        if self.registry.remove(guild_id).await {
            Ok(())
        } else {
            Err(EngineError::NoActiveSession)
        }
    }

    pub fn announcements(&self) -> broadcast::Receiver<Announcement> {
        self.registry.announcements()
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use crate::audio::registry::testing::Harness;
    use crate::audio::queue::LoopMode;
    use crate::audio::registry::testing::wait_for;
    use crate::audio::state::PlaybackState;
    use crate::error::EngineError;
    use serenity::model::id::{ChannelId, GuildId, UserId};
    use std::time::Duration;

    const GUILD: GuildId = GuildId::new(4);

    #[tokio::test]
    async fn commands_without_a_session_are_rejected() {
        let harness = Harness::new();
        let engine = &harness.engine;

        assert_eq!(engine.skip(GUILD).await.map(|_| ()), Err(EngineError::NoActiveSession));
        assert_eq!(engine.pause(GUILD).await, Err(EngineError::NoActiveSession));
        assert_eq!(engine.seek(GUILD, Duration::from_secs(3)).await, Err(EngineError::NoActiveSession));
        assert_eq!(engine.set_volume(GUILD, 10).await, Err(EngineError::NoActiveSession));
        assert_eq!(engine.leave(GUILD).await, Err(EngineError::NoActiveSession));
        assert!(engine.queue_view(GUILD).await.is_err());
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn blank_queries_never_create_sessions() {
        let harness = Harness::new();
        let result = harness
            .engine
            .enqueue(GUILD, "   ", UserId::new(1), Some(ChannelId::new(2)))
            .await;

        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
        assert!(harness.engine.registry().is_empty());
    }

    #[tokio::test]
    async fn leave_forgets_the_session() {
        let harness = Harness::new();
        harness
            .engine
            .enqueue(GUILD, "song", UserId::new(1), Some(ChannelId::new(2)))
            .await
            .expect("enqueued");

        harness.engine.leave(GUILD).await.expect("left");
        assert!(harness.engine.registry().get(GUILD).is_none());
        assert_eq!(harness.engine.pause(GUILD).await, Err(EngineError::NoActiveSession));
    }

    #[tokio::test]
    async fn controller_shortcuts_flip_and_clamp() {
        let harness = Harness::new();
        let engine = &harness.engine;
        engine
            .enqueue(GUILD, "song", UserId::new(1), Some(ChannelId::new(2)))
            .await
            .expect("enqueued");
        wait_for(engine, GUILD, |v| v.state == PlaybackState::Playing).await;

        assert_eq!(engine.toggle_pause(GUILD).await, Ok(true));
        assert_eq!(engine.toggle_pause(GUILD).await, Ok(false));

        engine.set_volume(GUILD, 195).await.expect("volume");
        assert_eq!(engine.adjust_volume(GUILD, 10).await, Ok(200));
        engine.set_volume(GUILD, 5).await.expect("volume");
        assert_eq!(engine.adjust_volume(GUILD, -10).await, Ok(0));

        assert_eq!(engine.cycle_loop(GUILD).await, Ok(LoopMode::Track));
        assert_eq!(engine.cycle_loop(GUILD).await, Ok(LoopMode::Queue));
        assert_eq!(engine.cycle_loop(GUILD).await, Ok(LoopMode::Off));
    }
}
