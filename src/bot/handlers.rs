use anyhow::Result;
use serenity::{
    builder::{CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::{CommandDataOptionValue, CommandInteraction, ComponentInteraction},
        guild::Member,
        id::{ChannelId, GuildId, RoleId, UserId},
        permissions::Permissions,
    },
    prelude::Context,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{
    audio::queue::LoopMode,
    bot::OpenRadioBot,
    error::EngineError,
    storage::SnapshotStore,
    ui::{
        controls::{ControlAction, VOLUME_STEP},
        embeds,
    },
};

/// Commands anyone may use even when the guild has a DJ role.
const OPEN_COMMANDS: &[&str] = &["play", "queue", "nowplaying", "lyrics"];

/// Server settings. They need Manage Server instead of the DJ role.
const SETTINGS_COMMANDS: &[&str] = &["dj", "announce"];

const LYRICS_COOLDOWN: Duration = Duration::from_secs(5);

pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &OpenRadioBot) -> Result<()> {
    let Some(guild_id) = command.guild_id else {
        return respond(ctx, &command, embeds::error_embed("Servers only", "Use this command in a server."), true).await;
    };

    info!(
        "📝 /{} used by {} in guild {}",
        command.data.name, command.user.name, guild_id
    );

    let name = command.data.name.as_str();
    if SETTINGS_COMMANDS.contains(&name) {
        let permissions = command.member.as_ref().and_then(|m| m.permissions);
        if !can_manage(permissions) {
            let embed = embeds::error_embed("Managers only", "You need the Manage Server permission for that.");
            return respond(ctx, &command, embed, true).await;
        }
        let embed = match handle_settings(&command, guild_id, bot).await {
            Ok(embed) => embed,
            Err(e) => embeds::error_embed("Couldn't save", &e.to_string()),
        };
        return respond(ctx, &command, embed, true).await;
    }

    if !OPEN_COMMANDS.contains(&name) && !is_dj(command.member.as_deref(), guild_id, bot).await {
        let embed = embeds::error_embed("DJ only", "You need this server's DJ role for that.");
        return respond(ctx, &command, embed, true).await;
    }

    match name {
        "play" => return handle_play(ctx, &command, guild_id, bot).await,
        "lyrics" => return handle_lyrics(ctx, &command, guild_id, bot).await,
        _ => {}
    }

    let result = match command.data.name.as_str() {
        "skip" => bot
            .engine
            .skip(guild_id)
            .await
            .map(|track| embeds::success_embed("Skipped", &format!("⏭️ **{}**", track.title))),
        "stop" => bot
            .engine
            .stop(guild_id)
            .await
            .map(|()| embeds::success_embed("Stopped", "⏹️ Playback stopped and queue cleared")),
        "pause" => bot
            .engine
            .pause(guild_id)
            .await
            .map(|()| embeds::success_embed("Paused", "⏸️ Playback paused")),
        "resume" => bot
            .engine
            .resume(guild_id)
            .await
            .map(|()| embeds::success_embed("Resumed", "▶️ Playback resumed")),
        "seek" => handle_seek(&command, guild_id, bot).await,
        "queue" => {
            let page = int_option(&command, "page").unwrap_or(1).max(1) as usize;
            bot.engine.queue_view(guild_id).await.map(|view| embeds::queue(&view, page))
        }
        "nowplaying" => bot.engine.queue_view(guild_id).await.and_then(|view| match &view.current {
            Some(now) => Ok(embeds::now_playing(now, &view)),
            None => Err(EngineError::NoActiveSession),
        }),
        "volume" => match int_option(&command, "level").map(u8::try_from) {
            Some(Ok(level)) => bot.engine.set_volume(guild_id, level).await.map(embeds::volume),
            _ => Err(EngineError::InvalidArgument("volume must be between 0 and 200".into())),
        },
        "loop" => match str_option(&command, "mode").map(str::parse::<LoopMode>) {
            Some(Ok(mode)) => bot
                .engine
                .set_loop(guild_id, mode)
                .await
                .map(|mode| embeds::success_embed("Loop", &format!("Repeat mode is now **{}**", mode))),
            Some(Err(e)) => Err(e),
            None => Err(EngineError::InvalidArgument("missing loop mode".into())),
        },
        "shuffle" => bot
            .engine
            .shuffle(guild_id)
            .await
            .map(|count| embeds::success_embed("Shuffled", &format!("🔀 Shuffled {} tracks", count))),
        "move" => handle_move(&command, guild_id, bot).await,
        "remove" => match queue_index(int_option(&command, "index")) {
            Ok(index) => bot
                .engine
                .remove_track(guild_id, index)
                .await
                .map(|track| embeds::success_embed("Removed", &format!("🗑️ **{}**", track.title))),
            Err(e) => Err(e),
        },
        "leave" => bot
            .engine
            .leave(guild_id)
            .await
            .map(|()| embeds::success_embed("Left", "👋 Disconnected from voice")),
        other => {
            warn!("Unknown command /{}", other);
            Err(EngineError::InvalidArgument(format!("unknown command /{}", other)))
        }
    };

    match result {
        Ok(embed) => respond(ctx, &command, embed, false).await,
        Err(e) => respond(ctx, &command, embeds::engine_error(&e), true).await,
    }
}

/// Resolution can take a while, so the reply is deferred and edited.
async fn handle_play(ctx: &Context, command: &CommandInteraction, guild_id: GuildId, bot: &OpenRadioBot) -> Result<()> {
    let Some(query) = str_option(command, "query") else {
        return respond(ctx, command, embeds::error_embed("Missing query", "Tell me what to play."), true).await;
    };

    command
        .create_response(&ctx.http, CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()))
        .await?;

    bot.announcer.bind(guild_id, command.channel_id);
    let channel = user_voice_channel(ctx, guild_id, command.user.id);
    let embed = match bot.engine.enqueue(guild_id, query, command.user.id, channel).await {
        Ok(outcome) => embeds::enqueued(&outcome),
        Err(e) => embeds::engine_error(&e),
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
        .await?;
    Ok(())
}

/// Lyrics for the given song, or for the current track.
async fn handle_lyrics(ctx: &Context, command: &CommandInteraction, guild_id: GuildId, bot: &OpenRadioBot) -> Result<()> {
    let now = Instant::now();
    let last = bot.lyrics_cooldowns.get(&command.user.id).map(|entry| *entry);
    if let Some(left) = cooldown_left(last, now, LYRICS_COOLDOWN) {
        let embed = embeds::error_embed(
            "Slow down",
            &format!("Try again in {}s.", left.as_secs().max(1)),
        );
        return respond(ctx, command, embed, true).await;
    }

    let query = match str_option(command, "query").map(str::trim).filter(|q| !q.is_empty()) {
        Some(query) => query.to_string(),
        None => {
            let current = bot.engine.queue_view(guild_id).await.ok().and_then(|view| view.current);
            match current {
                Some(playing) => match playing.track.artist {
                    Some(artist) => format!("{} {}", artist, playing.track.title),
                    None => playing.track.title,
                },
                None => {
                    let embed = embeds::error_embed("Nothing playing", "Tell me which song to look up.");
                    return respond(ctx, command, embed, true).await;
                }
            }
        }
    };

    bot.lyrics_cooldowns.insert(command.user.id, now);
    command
        .create_response(&ctx.http, CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()))
        .await?;

    let embed = match bot.lyrics.search(&query).await {
        Ok(lyrics) => embeds::lyrics(&lyrics),
        Err(e) => {
            debug!("Lyrics lookup for `{}` failed: {}", query, e);
            embeds::error_embed("No lyrics", &embeds::clip(&format!("Couldn't find lyrics for `{}`.", query), 512))
        }
    };
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
        .await?;
    Ok(())
}

/// `/dj` and `/announce`: no option clears the setting.
async fn handle_settings(command: &CommandInteraction, guild_id: GuildId, bot: &OpenRadioBot) -> Result<CreateEmbed> {
    let mut preferences = bot.storage.load_preferences(guild_id).await?;
    let description = match command.data.name.as_str() {
        "dj" => {
            preferences.dj_role_id = option(command, "role").and_then(|value| value.as_role_id());
            match preferences.dj_role_id {
                Some(role) => format!("🎧 Only <@&{}> can control playback now", role),
                None => "🎧 Everyone can control playback now".to_string(),
            }
        }
        "announce" => {
            preferences.announcement_channel_id = option(command, "channel").and_then(|value| value.as_channel_id());
            match preferences.announcement_channel_id {
                Some(channel) => format!("📣 Now-playing messages go to <#{}>", channel),
                None => "📣 Now-playing messages go where `/play` was used".to_string(),
            }
        }
        other => anyhow::bail!("unknown setting /{}", other),
    };

    bot.storage.update_preferences(preferences).await?;
    Ok(embeds::success_embed("Settings saved", &description))
}

/// Buttons under a now-playing announcement.
pub async fn handle_component(ctx: &Context, component: ComponentInteraction, bot: &OpenRadioBot) -> Result<()> {
    let Some(action) = ControlAction::from_custom_id(&component.data.custom_id) else {
        debug!("Ignoring unknown component {}", component.data.custom_id);
        return Ok(());
    };
    let Some(guild_id) = component.guild_id else {
        return Ok(());
    };

    info!(
        "🔘 {:?} pressed by {} in guild {}",
        action, component.user.name, guild_id
    );

    if action.needs_dj() {
        if !is_dj(component.member.as_ref(), guild_id, bot).await {
            let embed = embeds::error_embed("DJ only", "You need this server's DJ role for that.");
            return respond_component(ctx, &component, embed).await;
        }
        let listening = user_voice_channel(ctx, guild_id, component.user.id);
        let playing_in = bot.engine.queue_view(guild_id).await.ok().and_then(|view| view.voice_channel);
        if !same_channel(listening, playing_in) {
            let embed = embeds::error_embed("Not listening", "Join the bot's voice channel to use the controls.");
            return respond_component(ctx, &component, embed).await;
        }
    }

    let engine = &bot.engine;
    let result = match action {
        ControlAction::TogglePause => engine.toggle_pause(guild_id).await.map(|paused| {
            if paused {
                embeds::success_embed("Paused", "⏸️ Playback paused")
            } else {
                embeds::success_embed("Resumed", "▶️ Playback resumed")
            }
        }),
        ControlAction::Skip => engine
            .skip(guild_id)
            .await
            .map(|track| embeds::success_embed("Skipped", &format!("⏭️ **{}**", track.title))),
        ControlAction::Stop => engine
            .stop(guild_id)
            .await
            .map(|()| embeds::success_embed("Stopped", "⏹️ Playback stopped and queue cleared")),
        ControlAction::Shuffle => engine
            .shuffle(guild_id)
            .await
            .map(|count| embeds::success_embed("Shuffled", &format!("🔀 Shuffled {} tracks", count))),
        ControlAction::CycleLoop => engine
            .cycle_loop(guild_id)
            .await
            .map(|mode| embeds::success_embed("Loop", &format!("Repeat mode is now **{}**", mode))),
        ControlAction::VolumeDown => engine.adjust_volume(guild_id, -VOLUME_STEP).await.map(embeds::volume),
        ControlAction::VolumeUp => engine.adjust_volume(guild_id, VOLUME_STEP).await.map(embeds::volume),
        ControlAction::Queue => engine.queue_view(guild_id).await.map(|view| embeds::queue(&view, 1)),
    };

    let embed = result.unwrap_or_else(|e| embeds::engine_error(&e));
    respond_component(ctx, &component, embed).await
}

async fn handle_seek(command: &CommandInteraction, guild_id: GuildId, bot: &OpenRadioBot) -> Result<CreateEmbed, EngineError> {
    let seconds = int_option(command, "seconds")
        .and_then(|s| u64::try_from(s).ok())
        .ok_or_else(|| EngineError::InvalidArgument("seconds must be zero or more".into()))?;
    let position = Duration::from_secs(seconds);

    bot.engine.seek(guild_id, position).await?;
    Ok(embeds::success_embed(
        "Seeked",
        &format!("⏩ Jumped to `{}`", embeds::format_duration(position)),
    ))
}

async fn handle_move(command: &CommandInteraction, guild_id: GuildId, bot: &OpenRadioBot) -> Result<CreateEmbed, EngineError> {
    let from = queue_index(int_option(command, "from"))?;
    let to = queue_index(int_option(command, "to"))?;

    bot.engine.move_track(guild_id, from, to).await?;
    Ok(embeds::success_embed(
        "Moved",
        &format!("📍 Track {} is now at position {}", from + 1, to + 1),
    ))
}

async fn respond(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed, ephemeral: bool) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().embed(embed).ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

/// Button replies only go to whoever pressed.
async fn respond_component(ctx: &Context, component: &ComponentInteraction, embed: CreateEmbed) -> Result<()> {
    component
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed).ephemeral(true)),
        )
        .await?;
    Ok(())
}

async fn is_dj(member: Option<&Member>, guild_id: GuildId, bot: &OpenRadioBot) -> bool {
    let dj_role = match bot.storage.load_preferences(guild_id).await {
        Ok(preferences) => preferences.dj_role_id,
        Err(e) => {
            warn!("Couldn't load preferences for guild {}: {}", guild_id, e);
            None
        }
    };

    let Some(member) = member else {
        return dj_role.is_none();
    };
    has_dj_access(dj_role, &member.roles, member.permissions)
}

fn can_manage(permissions: Option<Permissions>) -> bool {
    permissions.is_some_and(|p| p.manage_guild() || p.administrator())
}

/// Controls only work from inside the channel the bot plays in.
fn same_channel(listening: Option<ChannelId>, playing_in: Option<ChannelId>) -> bool {
    listening.is_some() && listening == playing_in
}

fn cooldown_left(last: Option<Instant>, now: Instant, cooldown: Duration) -> Option<Duration> {
    let elapsed = now.saturating_duration_since(last?);
    (elapsed < cooldown).then(|| cooldown - elapsed)
}

/// No configured role means everyone is a DJ. Administrators always are.
fn has_dj_access(dj_role: Option<RoleId>, roles: &[RoleId], permissions: Option<Permissions>) -> bool {
    match dj_role {
        None => true,
        Some(role) => roles.contains(&role) || permissions.is_some_and(|p| p.administrator()),
    }
}

/// Users count from 1, the engine from 0.
fn queue_index(position: Option<i64>) -> Result<usize, EngineError> {
    position
        .filter(|p| *p >= 1)
        .and_then(|p| usize::try_from(p - 1).ok())
        .ok_or_else(|| EngineError::InvalidArgument("positions start at 1".into()))
}

fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild.voice_states.get(&user_id).and_then(|state| state.channel_id)
}

fn option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a CommandDataOptionValue> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .map(|opt| &opt.value)
}

fn str_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    option(command, name).and_then(|value| value.as_str())
}

fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    option(command, name).and_then(|value| value.as_i64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_converted_to_zero_based() {
        assert_eq!(queue_index(Some(1)), Ok(0));
        assert_eq!(queue_index(Some(12)), Ok(11));
        assert!(queue_index(Some(0)).is_err());
        assert!(queue_index(Some(-3)).is_err());
        assert!(queue_index(None).is_err());
    }

    #[test]
    fn dj_role_gates_access() {
        let dj = RoleId::new(7);
        assert!(has_dj_access(None, &[], None));
        assert!(has_dj_access(Some(dj), &[RoleId::new(1), dj], None));
        assert!(!has_dj_access(Some(dj), &[RoleId::new(1)], Some(Permissions::SEND_MESSAGES)));
        assert!(has_dj_access(Some(dj), &[], Some(Permissions::ADMINISTRATOR)));
    }

    #[test]
    fn settings_need_manage_server() {
        assert!(can_manage(Some(Permissions::MANAGE_GUILD)));
        assert!(can_manage(Some(Permissions::ADMINISTRATOR)));
        assert!(!can_manage(Some(Permissions::SEND_MESSAGES)));
        assert!(!can_manage(None));
    }

    #[test]
    fn controls_need_the_bots_voice_channel() {
        let channel = Some(ChannelId::new(3));
        assert!(same_channel(channel, channel));
        assert!(!same_channel(Some(ChannelId::new(4)), channel));
        assert!(!same_channel(None, None));
    }

    #[test]
    fn lyrics_cooldown_counts_down() {
        let start = Instant::now();
        assert_eq!(cooldown_left(None, start, LYRICS_COOLDOWN), None);
        assert_eq!(
            cooldown_left(Some(start), start + Duration::from_secs(2), LYRICS_COOLDOWN),
            Some(Duration::from_secs(3))
        );
        assert_eq!(cooldown_left(Some(start), start + LYRICS_COOLDOWN, LYRICS_COOLDOWN), None);
    }
}
