use dashmap::DashMap;
use serenity::{
    builder::CreateMessage,
    http::Http,
    model::id::{ChannelId, GuildId, MessageId},
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::{
    audio::{queue::LoopMode, session::Announcement, state::PlaybackState},
    engine::RadioEngine,
    sources::TrackSummary,
    storage::{JsonStorage, SnapshotStore},
    ui::{controls, embeds},
};

/// Posts a controller message for every new track and removes it when the
/// guild goes quiet. One controller per guild at a time.
pub struct Announcer {
    engine: RadioEngine,
    storage: Arc<JsonStorage>,
    /// Text channel of the last `/play` per guild.
    bound: DashMap<GuildId, ChannelId>,
    controllers: DashMap<GuildId, (ChannelId, MessageId)>,
}

impl Announcer {
    pub fn new(engine: RadioEngine, storage: Arc<JsonStorage>) -> Self {
        Self {
            engine,
            storage,
            bound: DashMap::new(),
            controllers: DashMap::new(),
        }
    }

    pub fn bind(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.bound.insert(guild_id, channel_id);
    }

    pub async fn run(self: Arc<Self>, http: Arc<Http>, mut announcements: broadcast::Receiver<Announcement>) {
        info!("📣 Announcer listening");
        loop {
            match announcements.recv().await {
                Ok(Announcement::NowPlaying { guild_id, track }) => {
                    self.post_controller(&http, guild_id, &track).await;
                }
                Ok(Announcement::Idle { guild_id }) => {
                    if let Some((_, controller)) = self.controllers.remove(&guild_id) {
                        delete(&http, controller).await;
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Announcer fell behind, {} announcements skipped", missed),
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Announcer stopped");
    }

    async fn post_controller(&self, http: &Http, guild_id: GuildId, track: &TrackSummary) {
        let preferred = match self.storage.load_preferences(guild_id).await {
            Ok(preferences) => preferences.announcement_channel_id,
            Err(e) => {
                warn!("Couldn't load preferences for guild {}: {}", guild_id, e);
                None
            }
        };
        let bound = self.bound.get(&guild_id).map(|entry| *entry);
        let Some(channel_id) = target_channel(preferred, bound) else {
            debug!("No channel to announce in for guild {}", guild_id);
            return;
        };

        let loop_mode = self
            .engine
            .queue_view(guild_id)
            .await
            .map_or(LoopMode::Off, |view| view.loop_mode);
        let message = CreateMessage::new()
            .embed(embeds::now_playing_announcement(track))
            .components(controls::player_controls(PlaybackState::Playing, loop_mode));

        match channel_id.send_message(http, message).await {
            Ok(posted) => {
                if let Some(previous) = self.controllers.insert(guild_id, (channel_id, posted.id)) {
                    delete(http, previous).await;
                }
            }
            Err(e) => warn!("Couldn't announce in channel {} (guild {}): {}", channel_id, guild_id, e),
        }
    }
}

/// A configured announcement channel wins over the `/play` channel.
fn target_channel(preferred: Option<ChannelId>, bound: Option<ChannelId>) -> Option<ChannelId> {
    preferred.or(bound)
}

async fn delete(http: &Http, (channel_id, message_id): (ChannelId, MessageId)) {
    if let Err(e) = channel_id.delete_message(http, message_id).await {
        debug!("Old controller {} already gone: {}", message_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_channel_wins() {
        let (configured, played) = (ChannelId::new(1), ChannelId::new(2));
        assert_eq!(target_channel(Some(configured), Some(played)), Some(configured));
        assert_eq!(target_channel(None, Some(played)), Some(played));
        assert_eq!(target_channel(None, None), None);
    }
}
