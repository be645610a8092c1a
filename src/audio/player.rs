//! Narrow capability interfaces over the external player and search backend.
//!
//! The core never builds a player. The bot implements [`PlayerHandle`] and
//! [`TrackSearch`] as adapters over whatever node or library it drives, and
//! hands them to the dispatcher.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

/// Identificador de guild (clave opaca de aislamiento)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuildId(pub u64);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for GuildId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepeatMode::Off => "off",
            RepeatMode::Track => "track",
            RepeatMode::Queue => "queue",
        };
        f.write_str(name)
    }
}

impl FromStr for RepeatMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" => Ok(RepeatMode::Off),
            "track" | "song" => Ok(RepeatMode::Track),
            "queue" | "all" => Ok(RepeatMode::Queue),
            other => anyhow::bail!("Modo de repetición desconocido: {}", other),
        }
    }
}

/// Información mínima de un track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Source-specific identifier (video id, URI hash...)
    pub identifier: String,
    pub title: String,
    pub author: Option<String>,
    pub uri: Option<String>,
    pub duration: Option<Duration>,
}

impl Track {
    pub fn new(identifier: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            author: None,
            uri: None,
            duration: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Query used to look for tracks related to this one
    pub fn seed_query(&self) -> String {
        match self.author.as_deref() {
            Some(author) if !author.trim().is_empty() => format!("{} {}", author, self.title),
            _ => self.title.clone(),
        }
    }
}

/// Snapshot of what the core reads from a player
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerState {
    pub playing: bool,
    pub paused: bool,
    pub repeat_mode: RepeatMode,
    pub current: Option<Track>,
    pub queue_len: usize,
}

impl PlayerState {
    /// Nada sonando, nada pausado, nada cargado
    pub fn is_idle(&self) -> bool {
        !self.playing && !self.paused && self.current.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResults {
    pub tracks: Vec<Track>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Player capability for one guild
#[async_trait]
pub trait PlayerHandle: Send + Sync {
    async fn state(&self) -> PlayerState;

    /// Adds a track to the end of the queue, starting playback if idle
    async fn enqueue(&self, track: Track) -> Result<()>;

    async fn skip(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;
}

/// Resolves the player for a guild, if the bot has one connected
pub trait PlayerRegistry: Send + Sync {
    fn player(&self, guild: GuildId) -> Option<Arc<dyn PlayerHandle>>;
}

impl PlayerRegistry for DashMap<GuildId, Arc<dyn PlayerHandle>> {
    fn player(&self, guild: GuildId) -> Option<Arc<dyn PlayerHandle>> {
        self.get(&guild).map(|player| player.clone())
    }
}

/// Search backend supplied by the bot
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<SearchResults>;
}
