//! # Audio Module
//!
//! Playback-facing side of the core.
//!
//! ### [`player`] - Player Capabilities
//! - [`PlayerHandle`](player::PlayerHandle): the few operations the core needs from a player
//! - [`TrackSearch`](player::TrackSearch): search backend used to seed autoplay
//! - Plain data types: [`Track`](player::Track), [`PlayerState`](player::PlayerState),
//!   [`RepeatMode`](player::RepeatMode)
//!
//! ### [`autoplay`] - Autoplay Decisions
//! - Pure gating functions over player snapshots
//! - Per-guild cooldown against double triggers
//! - [`AutoplayEngine`](autoplay::AutoplayEngine) running the seed search
//!
//! Both are implemented by adapters in the bot; nothing here talks to a
//! voice connection directly.

pub mod autoplay;
pub mod player;

pub use autoplay::{AutoplayConfig, AutoplayEngine, AutoplayOutcome, AutoplayPhase};
pub use player::{
    GuildId, PlayerHandle, PlayerRegistry, PlayerState, RepeatMode, SearchResults, Track,
    TrackSearch,
};
