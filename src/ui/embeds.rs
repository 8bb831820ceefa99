use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::{
    audio::{
        queue::LoopMode,
        session::{EnqueueOutcome, NowPlaying, QueueView},
        state::PlaybackState,
    },
    error::EngineError,
    sources::{Lyrics, TrackSummary},
};

/// Standard palette
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

const STANDARD_FOOTER: &str = "📻 Open Radio";

pub const QUEUE_PAGE_SIZE: usize = 10;

/// Discord's limits, in characters.
pub const FIELD_LIMIT: usize = 1024;
pub const DESCRIPTION_LIMIT: usize = 4096;
/// One failure or warning line; provider messages can be whole pages.
const LINE_LIMIT: usize = 120;

fn base(title: impl Into<String>) -> CreateEmbed {
    CreateEmbed::default()
        .title(title)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn now_playing(now: &NowPlaying, view: &QueueView) -> CreateEmbed {
    let track = &now.track;
    let status = match view.state {
        PlaybackState::Paused => "⏸️ Paused",
        PlaybackState::Loading => "⏳ Loading",
        _ => "🎵 Now Playing",
    };

    let progress = match track.duration {
        Some(total) => format!(
            "{} `{} / {}`",
            progress_bar(now.position, total),
            format_duration(now.position),
            format_duration(total)
        ),
        None => "🔴 Live".to_string(),
    };

    base(status)
        .description(format!("**[{}]({})**", track.title, track.url))
        .color(colors::SUCCESS_GREEN)
        .field("🎤 Artist", track.artist.as_deref().unwrap_or("Unknown"), true)
        .field(
            "👤 Requested by",
            format!("<@{}> <t:{}:R>", track.requested_by, track.requested_at.timestamp()),
            true,
        )
        .field("🔊 Volume", format!("{}%", view.volume), true)
        .field("⏱️ Progress", progress, false)
        .field("🔁 Loop", loop_label(view.loop_mode), true)
        .field("📋 Up next", view.upcoming.len().to_string(), true)
}

/// Posted to the guild's channel when a new track starts.
pub fn now_playing_announcement(track: &TrackSummary) -> CreateEmbed {
    base("🎵 Now Playing")
        .description(format!("**[{}]({})**", track.title, track.url))
        .color(colors::SUCCESS_GREEN)
        .field("🎤 Artist", track.artist.as_deref().unwrap_or("Unknown"), true)
        .field("⏱️ Duration", duration_label(track.duration), true)
        .field("👤 Requested by", format!("<@{}>", track.requested_by), true)
}

pub fn lyrics(lyrics: &Lyrics) -> CreateEmbed {
    let title = match &lyrics.artist {
        Some(artist) => format!("🎼 {} - {}", lyrics.title, artist),
        None => format!("🎼 {}", lyrics.title),
    };
    base(clip(&title, 256))
        .description(clip_lines(&lyrics.text, DESCRIPTION_LIMIT))
        .color(colors::MUSIC_PURPLE)
        .footer(CreateEmbedFooter::new(format!("Lyrics from lrclib • {}", STANDARD_FOOTER)))
}

pub fn enqueued(outcome: &EnqueueOutcome) -> CreateEmbed {
    let mut embed = match outcome.added.as_slice() {
        [track] => base("✅ Added to the queue")
            .description(format!("**[{}]({})**", track.title, track.url))
            .field("🎤 Artist", track.artist.as_deref().unwrap_or("Unknown"), true)
            .field("⏱️ Duration", duration_label(track.duration), true),
        tracks => base("📋 Playlist added")
            .description(format!("Added **{}** tracks to the queue", tracks.len()))
            .field(
                "⏱️ Total duration",
                format_duration(tracks.iter().filter_map(|t| t.duration).sum()),
                true,
            ),
    }
    .color(colors::MUSIC_PURPLE)
    .field("📍 Position", outcome.position.to_string(), true);

    if outcome.truncated > 0 {
        embed = embed.field(
            "✂️ Queue full",
            format!("{} tracks didn't fit and were left out", outcome.truncated),
            false,
        );
    }

    if !outcome.failures.is_empty() {
        let listed: Vec<String> = outcome
            .failures
            .iter()
            .take(5)
            .map(|f| clip(&format!("• `{}`: {}", f.query, f.reason), LINE_LIMIT))
            .collect();
        let more = outcome.failures.len().saturating_sub(listed.len());
        let mut text = listed.join("\n");
        if more > 0 {
            text.push_str(&format!("\n…and {} more", more));
        }
        embed = embed
            .field(
                format!("⚠️ {} tracks couldn't be found", outcome.failures.len()),
                clip_lines(&text, FIELD_LIMIT),
                false,
            )
            .color(colors::WARNING_ORANGE);
    }

    if outcome.from_cache {
        embed = embed.footer(CreateEmbedFooter::new(format!("{} • cached", STANDARD_FOOTER)));
    }
    embed
}

pub fn queue(view: &QueueView, page: usize) -> CreateEmbed {
    let embed = base("📋 Queue").color(colors::INFO_BLUE);

    if view.current.is_none() && view.upcoming.is_empty() {
        return embed
            .description("😴 **The queue is empty**\n\n💡 Use `/play <song>` to add music")
            .color(colors::NEUTRAL_GRAY);
    }

    let mut description = String::new();
    if let Some(now) = &view.current {
        description.push_str(&format!(
            "**Now:** {} `{}`\n\n",
            summary_line(&now.track),
            duration_label(now.track.duration)
        ));
    }

    let pages = view.total_pages(QUEUE_PAGE_SIZE);
    let page = page.clamp(1, pages);
    let (start, items) = view.page(page, QUEUE_PAGE_SIZE);
    for (offset, track) in items.iter().enumerate() {
        description.push_str(&format!(
            "`{}.` {} `{}`\n",
            start + offset,
            summary_line(track),
            duration_label(track.duration)
        ));
    }

    let mut embed = embed
        .description(clip_lines(&description, DESCRIPTION_LIMIT))
        .field("🎵 Tracks", view.upcoming.len().to_string(), true)
        .field("⏱️ Total", format_duration(view.total_duration), true)
        .field("🔁 Loop", loop_label(view.loop_mode), true)
        .footer(CreateEmbedFooter::new(format!("Page {}/{} • {}", page, pages, STANDARD_FOOTER)));

    if !view.recent.is_empty() {
        let recent: Vec<String> = view
            .recent
            .iter()
            .map(|track| clip(&format!("• {}", track.title), LINE_LIMIT))
            .collect();
        embed = embed.field("🕘 Recently played", clip_lines(&recent.join("\n"), FIELD_LIMIT), false);
    }

    if !view.warnings.is_empty() {
        let warnings: Vec<String> = view.warnings.iter().map(|w| clip(w, LINE_LIMIT)).collect();
        embed = embed.field("⚠️ Recent problems", clip_lines(&warnings.join("\n"), FIELD_LIMIT), false);
    }
    embed
}

pub fn volume(level: u8) -> CreateEmbed {
    let icon = match level {
        0 => "🔇",
        1..=50 => "🔉",
        _ => "🔊",
    };
    base(format!("{} Volume", icon))
        .description(format!("{} **{}%**", volume_bar(level), level))
        .color(colors::INFO_BLUE)
}

pub fn engine_error(error: &EngineError) -> CreateEmbed {
    let title = match error {
        EngineError::NoActiveSession => "Nothing playing",
        EngineError::InvalidState { .. } => "Not right now",
        EngineError::Resolution(_) => "Couldn't load that",
        EngineError::QueueFull(_) => "Queue full",
        EngineError::NoVoiceChannel => "No voice channel",
        EngineError::InvalidArgument(_) => "Invalid input",
        EngineError::Cancelled => "Cancelled",
    };
    error_embed(title, &error.to_string())
}

pub fn error_embed(title: &str, description: &str) -> CreateEmbed {
    base(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
}

pub fn success_embed(title: &str, description: &str) -> CreateEmbed {
    base(format!("✅ {}", title))
        .description(description)
        .color(colors::SUCCESS_GREEN)
}

fn summary_line(track: &TrackSummary) -> String {
    match &track.artist {
        Some(artist) => format!("[{} - {}]({})", track.title, artist, track.url),
        None => format!("[{}]({})", track.title, track.url),
    }
}

fn loop_label(mode: LoopMode) -> &'static str {
    match mode {
        LoopMode::Off => "➡️ Off",
        LoopMode::Track => "🔂 Track",
        LoopMode::Queue => "🔁 Queue",
    }
}

fn duration_label(duration: Option<Duration>) -> String {
    duration.map_or_else(|| "🔴 Live".to_string(), format_duration)
}

fn progress_bar(position: Duration, total: Duration) -> String {
    const SEGMENTS: usize = 15;
    let ratio = if total.is_zero() {
        0.0
    } else {
        (position.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
    };
    let marker = ((ratio * SEGMENTS as f64) as usize).min(SEGMENTS - 1);
    (0..SEGMENTS)
        .map(|i| if i == marker { '🔘' } else { '▬' })
        .collect()
}

fn volume_bar(level: u8) -> String {
    const SEGMENTS: usize = 20;
    let filled = (usize::from(level.min(200)) * SEGMENTS) / 200;
    format!("`[{}{}]`", "█".repeat(filled), "▒".repeat(SEGMENTS - filled))
}

/// Cuts `text` to at most `max` characters, ending in `…` when cut.
pub fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}

/// Like [`clip`], but drops whole lines where it can.
pub fn clip_lines(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut kept = String::new();
    for line in text.lines() {
        // Room for the newline and the trailing ellipsis.
        if kept.chars().count() + line.chars().count() + 2 > max {
            break;
        }
        kept.push_str(line);
        kept.push('\n');
    }
    if kept.is_empty() {
        return clip(text, max);
    }
    kept.push('…');
    kept
}

/// `m:ss`, or `h:mm:ss` past the hour.
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_format_like_a_player() {
        assert_eq!(format_duration(Duration::from_secs(5)), "0:05");
        assert_eq!(format_duration(Duration::from_secs(245)), "4:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn progress_marker_tracks_position() {
        let total = Duration::from_secs(100);
        assert!(progress_bar(Duration::ZERO, total).starts_with('🔘'));
        assert!(progress_bar(total, total).ends_with('🔘'));
        assert_eq!(progress_bar(Duration::from_secs(50), Duration::ZERO).chars().count(), 15);
    }

    #[test]
    fn long_text_is_clipped_on_char_boundaries() {
        assert_eq!(clip("short", 10), "short");
        let clipped = clip(&"é".repeat(300), LINE_LIMIT);
        assert_eq!(clipped.chars().count(), LINE_LIMIT);
        assert!(clipped.ends_with('…'));
    }

    #[test]
    fn huge_provider_errors_stay_inside_one_field() {
        let failures: Vec<String> = (0..5)
            .map(|i| clip(&format!("• `query {}`: {}", i, "x".repeat(2000)), LINE_LIMIT))
            .collect();
        let field = clip_lines(&failures.join("\n"), FIELD_LIMIT);
        assert!(field.chars().count() <= FIELD_LIMIT);
        assert!(field.lines().all(|line| line.chars().count() <= LINE_LIMIT));

        let lyrics = (0..500).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let description = clip_lines(&lyrics, DESCRIPTION_LIMIT);
        assert!(description.chars().count() <= DESCRIPTION_LIMIT);
        assert!(description.ends_with("…"));
        assert!(description.starts_with("line 0\nline 1\n"));
    }

    #[test]
    fn volume_bar_is_proportional() {
        assert_eq!(volume_bar(0), format!("`[{}]`", "▒".repeat(20)));
        assert_eq!(volume_bar(100), format!("`[{}{}]`", "█".repeat(10), "▒".repeat(10)));
        assert_eq!(volume_bar(200), format!("`[{}]`", "█".repeat(20)));
    }
}
