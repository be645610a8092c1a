//! # Bot Module
//!
//! Command handling side of the core.
//!
//! - [`guild_mutex`]: per-guild FIFO serialization of handlers
//! - [`events`]: typed commands and player notifications
//! - [`dispatcher`]: the [`CommandDispatcher`] that owns the shared caches
//!   and the autoplay engine and runs every event under its guild's mutex
//!
//! ## Example
//!
//! ```rust,no_run
//! use open_music_core::{
//!     audio::{GuildId, PlayerHandle, TrackSearch},
//!     bot::{CommandDispatcher, DispatcherConfig, GuildCommand},
//!     cache::{CircuitBreaker, CircuitBreakerConfig, OfflineStore},
//! };
//! use std::sync::Arc;
//!
//! # async fn example(search: Arc<dyn TrackSearch>, player: Arc<dyn PlayerHandle>) -> anyhow::Result<()> {
//! let breaker = Arc::new(CircuitBreaker::new(
//!     "search",
//!     Arc::new(OfflineStore::new()),
//!     CircuitBreakerConfig::default(),
//! )?);
//! let dispatcher = Arc::new(CommandDispatcher::new(DispatcherConfig::default(), breaker, search)?);
//!
//! let report = dispatcher
//!     .dispatch(GuildId(123), GuildCommand::Play { query: "lofi".into() }.into(), player)
//!     .await?;
//! println!("Agregado: {:?}", report.enqueued);
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod events;
pub mod guild_mutex;

pub use dispatcher::{CommandDispatcher, DispatchReport, DispatcherConfig, HealthSnapshot};
pub use events::{
    event_channel, EventReceiver, EventSender, GuildCommand, GuildEnvelope, GuildEvent,
    PlayerEvent, TrackEndReason,
};
pub use guild_mutex::GuildMutex;
