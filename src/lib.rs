//! # Open Music Core
//!
//! Per-guild command handling core for the Open Music bot: two-tier caching
//! behind a circuit breaker, per-guild serialization of commands, and the
//! autoplay decision engine.
//!
//! - [`cache`]: TTL cache, remote store, circuit breaker, layered cache
//! - [`bot`]: guild mutex, typed events, command dispatcher
//! - [`audio`]: player/search capability traits, autoplay
//! - [`config`]: environment-based configuration

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;

pub use config::Config;
pub use error::{CacheError, CacheResult, RemoteError, RemoteResult};
