use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, channel::ChannelType, id::GuildId, permissions::Permissions},
    prelude::Context,
};

pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }
    Ok(())
}

/// Development registration on a single guild.
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        skip_command(),
        stop_command(),
        pause_command(),
        resume_command(),
        seek_command(),
        queue_command(),
        nowplaying_command(),
        volume_command(),
        loop_command(),
        shuffle_command(),
        move_command(),
        remove_command(),
        lyrics_command(),
        leave_command(),
        dj_command(),
        announce_command(),
    ]
}

// Playback

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Play a song, playlist or Spotify link")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "URL or search terms")
                .required(true),
        )
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Skip the current track")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Stop playback and clear the queue")
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pause playback")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Resume paused playback")
}

fn seek_command() -> CreateCommand {
    CreateCommand::new("seek")
        .description("Jump to a position in the current track")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "seconds", "Position in seconds")
                .min_int_value(0)
                .required(true),
        )
}

// Queue

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Show the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "page", "Page number").min_int_value(1),
        )
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Show the current track")
}

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Set the playback volume")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "level", "Volume (0-200)")
                .min_int_value(0)
                .max_int_value(200)
                .required(true),
        )
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop")
        .description("Set the repeat mode")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "mode", "Repeat mode")
                .add_string_choice("Off", "off")
                .add_string_choice("Track", "track")
                .add_string_choice("Queue", "queue")
                .required(true),
        )
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Shuffle the upcoming tracks")
}

fn move_command() -> CreateCommand {
    CreateCommand::new("move")
        .description("Move a track within the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "from", "Current position")
                .min_int_value(1)
                .required(true),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "to", "New position")
                .min_int_value(1)
                .required(true),
        )
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Remove a track from the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "index", "Position in the queue")
                .min_int_value(1)
                .required(true),
        )
}

fn lyrics_command() -> CreateCommand {
    CreateCommand::new("lyrics")
        .description("Show lyrics for the current track or any song")
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "query",
            "Song to look up (defaults to the current track)",
        ))
}

// Connection

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Stop and leave the voice channel")
}

// Settings

fn dj_command() -> CreateCommand {
    CreateCommand::new("dj")
        .description("Limit playback controls to a role")
        .default_member_permissions(Permissions::MANAGE_GUILD)
        .add_option(CreateCommandOption::new(
            CommandOptionType::Role,
            "role",
            "DJ role (leave empty to allow everyone)",
        ))
}

fn announce_command() -> CreateCommand {
    CreateCommand::new("announce")
        .description("Choose where now-playing messages are posted")
        .default_member_permissions(Permissions::MANAGE_GUILD)
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Channel,
                "channel",
                "Text channel (leave empty to use the /play channel)",
            )
            .channel_types(vec![ChannelType::Text]),
        )
}
