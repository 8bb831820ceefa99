use serenity::{
    all::ButtonStyle,
    builder::{CreateActionRow, CreateButton},
};

use crate::audio::{queue::LoopMode, state::PlaybackState};

pub mod button_ids {
    pub const PLAY_PAUSE: &str = "radio_play_pause";
    pub const SKIP: &str = "radio_skip";
    pub const STOP: &str = "radio_stop";
    pub const SHUFFLE: &str = "radio_shuffle";
    pub const LOOP: &str = "radio_loop";
    pub const VOLUME_DOWN: &str = "radio_volume_down";
    pub const VOLUME_UP: &str = "radio_volume_up";
    pub const QUEUE: &str = "radio_queue";
}

/// Volume change per button press, in percent.
pub const VOLUME_STEP: i16 = 10;

/// What a controller button asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    TogglePause,
    Skip,
    Stop,
    Shuffle,
    CycleLoop,
    VolumeDown,
    VolumeUp,
    Queue,
}

impl ControlAction {
    pub fn from_custom_id(id: &str) -> Option<Self> {
        let action = match id {
            button_ids::PLAY_PAUSE => Self::TogglePause,
            button_ids::SKIP => Self::Skip,
            button_ids::STOP => Self::Stop,
            button_ids::SHUFFLE => Self::Shuffle,
            button_ids::LOOP => Self::CycleLoop,
            button_ids::VOLUME_DOWN => Self::VolumeDown,
            button_ids::VOLUME_UP => Self::VolumeUp,
            button_ids::QUEUE => Self::Queue,
            _ => return None,
        };
        Some(action)
    }

    pub fn custom_id(self) -> &'static str {
        match self {
            Self::TogglePause => button_ids::PLAY_PAUSE,
            Self::Skip => button_ids::SKIP,
            Self::Stop => button_ids::STOP,
            Self::Shuffle => button_ids::SHUFFLE,
            Self::CycleLoop => button_ids::LOOP,
            Self::VolumeDown => button_ids::VOLUME_DOWN,
            Self::VolumeUp => button_ids::VOLUME_UP,
            Self::Queue => button_ids::QUEUE,
        }
    }

    /// Looking at the queue is open to everyone; the rest follows the DJ role.
    pub fn needs_dj(self) -> bool {
        self != Self::Queue
    }
}

/// The two button rows under a now-playing announcement.
pub fn player_controls(state: PlaybackState, loop_mode: LoopMode) -> Vec<CreateActionRow> {
    let play_pause = if state == PlaybackState::Paused { '▶' } else { '⏸' };
    let loop_style = match loop_mode {
        LoopMode::Off => ButtonStyle::Secondary,
        LoopMode::Track | LoopMode::Queue => ButtonStyle::Success,
    };

    let button = |action: ControlAction, emoji: char, style: ButtonStyle| {
        CreateButton::new(action.custom_id()).emoji(emoji).style(style)
    };

    let row1 = CreateActionRow::Buttons(vec![
        button(ControlAction::TogglePause, play_pause, ButtonStyle::Primary),
        button(ControlAction::Skip, '⏭', ButtonStyle::Secondary),
        button(ControlAction::Stop, '⏹', ButtonStyle::Danger),
        button(ControlAction::Shuffle, '🔀', ButtonStyle::Secondary),
        button(ControlAction::CycleLoop, '🔁', loop_style),
    ]);

    let row2 = CreateActionRow::Buttons(vec![
        button(ControlAction::VolumeDown, '🔉', ButtonStyle::Secondary),
        button(ControlAction::VolumeUp, '🔊', ButtonStyle::Secondary),
        button(ControlAction::Queue, '📋', ButtonStyle::Secondary).label("Queue"),
    ]);

    vec![row1, row2]
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ControlAction; 8] = [
        ControlAction::TogglePause,
        ControlAction::Skip,
        ControlAction::Stop,
        ControlAction::Shuffle,
        ControlAction::CycleLoop,
        ControlAction::VolumeDown,
        ControlAction::VolumeUp,
        ControlAction::Queue,
    ];

    #[test]
    fn every_button_maps_back_to_its_action() {
        for action in ALL {
            assert_eq!(ControlAction::from_custom_id(action.custom_id()), Some(action));
        }
        assert_eq!(ControlAction::from_custom_id("music_play_pause"), None);
    }

    #[test]
    fn only_the_queue_button_skips_the_dj_check() {
        let open: Vec<_> = ALL.into_iter().filter(|a| !a.needs_dj()).collect();
        assert_eq!(open, vec![ControlAction::Queue]);
    }

    #[test]
    fn controls_fit_discord_row_limits() {
        let rows = player_controls(PlaybackState::Playing, LoopMode::Off);
        assert_eq!(rows.len(), 2);
        for row in rows {
            match row {
                CreateActionRow::Buttons(buttons) => assert!(buttons.len() <= 5),
                _ => panic!("controller rows only hold buttons"),
            }
        }
    }
}
