//! # Bot Module
//!
//! Thin Discord control surface for Open Radio.
//!
//! [`OpenRadioBot`] implements Serenity's [`EventHandler`]. It registers the
//! slash commands, turns interactions into [`RadioEngine`] calls and renders
//! the results as embeds. It holds no playback state of its own: everything
//! lives in the engine's per-guild sessions.
//!
//! ## Events
//!
//! - **ready**: registers commands and restores sessions that were
//!   snapshotted before the last shutdown
//! - **interaction_create**: slash commands and controller buttons, see
//!   [`handlers`]
//! - **voice_state_update**: leaves a guild once the last human has left
//!   the bot's voice channel
//!
//! The [`announcer::Announcer`] task, started on the first `ready`, turns
//! engine announcements into a controller message per track.

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, UserId, VoiceState},
    async_trait,
};
use dashmap::DashMap;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tracing::{debug, error, info, warn};

pub mod announcer;
pub mod commands;
pub mod handlers;

use crate::{config::Config, engine::RadioEngine, sources::LyricsClient, storage::JsonStorage};
use announcer::Announcer;

pub struct OpenRadioBot {
    config: Arc<Config>,
    pub engine: RadioEngine,
    pub storage: Arc<JsonStorage>,
    pub announcer: Arc<Announcer>,
    pub lyrics: LyricsClient,
    /// Last lyrics lookup per user.
    pub lyrics_cooldowns: DashMap<UserId, Instant>,
    restored: AtomicBool,
    announcing: AtomicBool,
}

impl OpenRadioBot {
    pub fn new(config: Arc<Config>, engine: RadioEngine, storage: Arc<JsonStorage>) -> Self {
        Self {
            announcer: Arc::new(Announcer::new(engine.clone(), storage.clone())),
            lyrics: LyricsClient::new(config.lyrics_api_url.clone()),
            lyrics_cooldowns: DashMap::new(),
            config,
            engine,
            storage,
            restored: AtomicBool::new(false),
            announcing: AtomicBool::new(false),
        }
    }

    /// Guild commands show up instantly, global ones can take an hour.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registering slash commands (application {})", self.config.application_id);

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ Not a member of development guild {}, skipping registration", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    anyhow::anyhow!(
                        "couldn't register guild commands, check the applications.commands scope: {}",
                        e
                    )
                })?;
                info!("✅ Guild commands registered for {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await.map_err(|e| {
                    anyhow::anyhow!(
                        "couldn't register global commands, check the applications.commands scope: {}",
                        e
                    )
                })?;
                info!("✅ Global commands registered");
            }
        }

        Ok(())
    }

    /// Brings back sessions that were snapshotted before the last shutdown.
    async fn restore_sessions(&self) {
        if self.restored.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.storage.snapshot_guilds().await {
            Ok(guilds) if guilds.is_empty() => {}
            Ok(guilds) => {
                info!("♻️ Restoring {} sessions from snapshots", guilds.len());
                for guild_id in guilds {
                    self.engine.registry().get_or_create(guild_id);
                }
            }
            Err(e) => error!("Couldn't list stored snapshots: {:?}", e),
        }
    }
}

#[async_trait]
impl EventHandler for OpenRadioBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} is online in {} guilds", ready.user.name, ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Command registration failed: {:?}", e);
        }

        // Reconnects fire `ready` again; one announcer is enough.
        if !self.announcing.swap(true, Ordering::SeqCst) {
            let announcements = self.engine.announcements();
            tokio::spawn(self.announcer.clone().run(ctx.http.clone(), announcements));
        }

        self.restore_sessions().await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let result = match interaction {
            Interaction::Command(command) => handlers::handle_command(&ctx, command, self).await,
            Interaction::Component(component) => handlers::handle_component(&ctx, component, self).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("Interaction handling failed: {:?}", e);
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id.or_else(|| old.as_ref().and_then(|o| o.guild_id)) else {
            return;
        };
        if self.engine.registry().get(guild_id).is_none() {
            return;
        }

        let bot_id = ctx.cache.current_user().id;
        let Some(channel_id) = bot_channel(&ctx, guild_id, bot_id) else {
            return;
        };

        // Only someone leaving (or moving out of) the bot's channel matters.
        let left_our_channel = old.as_ref().and_then(|o| o.channel_id) == Some(channel_id)
            && new.channel_id != Some(channel_id);
        if !left_our_channel || new.user_id == bot_id {
            return;
        }

        let humans = humans_in_channel(&ctx, guild_id, channel_id, bot_id);
        debug!("{} humans left in {} (guild {})", humans, channel_id, guild_id);
        if humans == 0 {
            info!("🚪 Everyone left the voice channel in guild {}, leaving", guild_id);
            if let Err(e) = self.engine.leave(guild_id).await {
                debug!("Leave after empty channel in guild {}: {}", guild_id, e);
            }
        }
    }
}

fn bot_channel(ctx: &Context, guild_id: GuildId, bot_id: UserId) -> Option<ChannelId> {
    let guild = ctx.cache.guild(guild_id)?;
    guild.voice_states.get(&bot_id).and_then(|state| state.channel_id)
}

fn humans_in_channel(ctx: &Context, guild_id: GuildId, channel_id: ChannelId, bot_id: UserId) -> usize {
    let Some(guild) = ctx.cache.guild(guild_id) else {
        return 0;
    };

    guild
        .voice_states
        .values()
        .filter(|state| state.channel_id == Some(channel_id) && state.user_id != bot_id)
        .filter(|state| {
            guild
                .members
                .get(&state.user_id)
                .map_or(true, |member| !member.user.bot)
        })
        .count()
}
