//! Typed events consumed by the [`CommandDispatcher`](super::dispatcher::CommandDispatcher).
//!
//! User commands and player notifications share one enum so both go through
//! the same per-guild queue, and each kind has its own handler arm.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::audio::player::{GuildId, Track};

/// Por qué terminó un track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Only natural ends and load failures leave the player wanting a next track
    pub fn may_start_next(self) -> bool {
        matches!(self, TrackEndReason::Finished | TrackEndReason::LoadFailed)
    }
}

/// Notificaciones del reproductor
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    TrackStart { track: Track },
    TrackEnd { track: Track, reason: TrackEndReason },
    TrackException { track: Track, message: String },
}

/// Comandos de usuario
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuildCommand {
    Play { query: String },
    Skip,
    Resume,
    Autoplay { enabled: bool },
    /// Bot left the voice channel; per-guild state can go
    Leave,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuildEvent {
    Command(GuildCommand),
    Player(PlayerEvent),
}

impl GuildEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GuildEvent::Command(GuildCommand::Play { .. }) => "play",
            GuildEvent::Command(GuildCommand::Skip) => "skip",
            GuildEvent::Command(GuildCommand::Resume) => "resume",
            GuildEvent::Command(GuildCommand::Autoplay { .. }) => "autoplay",
            GuildEvent::Command(GuildCommand::Leave) => "leave",
            GuildEvent::Player(PlayerEvent::TrackStart { .. }) => "track_start",
            GuildEvent::Player(PlayerEvent::TrackEnd { .. }) => "track_end",
            GuildEvent::Player(PlayerEvent::TrackException { .. }) => "track_exception",
        }
    }
}

impl From<GuildCommand> for GuildEvent {
    fn from(command: GuildCommand) -> Self {
        GuildEvent::Command(command)
    }
}

impl From<PlayerEvent> for GuildEvent {
    fn from(event: PlayerEvent) -> Self {
        GuildEvent::Player(event)
    }
}

/// Evento dirigido a un guild
#[derive(Debug, Clone, PartialEq)]
pub struct GuildEnvelope {
    pub guild: GuildId,
    pub event: GuildEvent,
}

impl GuildEnvelope {
    pub fn new(guild: GuildId, event: impl Into<GuildEvent>) -> Self {
        Self {
            guild,
            event: event.into(),
        }
    }
}

pub type EventSender = mpsc::Sender<GuildEnvelope>;
pub type EventReceiver = mpsc::Receiver<GuildEnvelope>;

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity)
}
