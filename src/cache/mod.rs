//! # Cache Module
//!
//! Resilient caching for per-guild command handling.
//!
//! The module is layered bottom-up:
//!
//! ### [`ttl_cache`] - Local TTL Cache
//! - Bounded key/value store with per-entry expiry
//! - Evicts the entry closest to expiry when full
//! - Background sweep of expired entries
//!
//! ### [`remote`] - Remote Store
//! - [`RemoteStore`] trait over the shared cache server
//! - [`RedisStore`] (namespaced keys, `SET PX`, `MGET`, `SCAN` + `DEL`)
//! - [`OfflineStore`] when no server is reachable at startup
//!
//! ### [`circuit_breaker`] - Circuit Breaker
//! - Wraps every remote call with a timeout and failure accounting
//! - Opens on a failure ratio, probes with a single trial after a cooldown
//! - Serves reads from a local fallback cache while the remote is unhealthy
//!
//! ### [`layered`] - Two-Tier Cache
//! - L1 process-local, L2 through the breaker
//! - Promotion of L2 hits, coalesced loads, hit-rate statistics
//!
//! Nothing in here returns a remote error to a caller: a degraded remote
//! shows up as cache misses and in [`BreakerMetrics`].
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_core::cache::{
//!     CircuitBreaker, CircuitBreakerConfig, LayeredCache, LayeredCacheConfig, OfflineStore,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let breaker = CircuitBreaker::new(
//!     "search",
//!     Arc::new(OfflineStore::new()),
//!     CircuitBreakerConfig::default(),
//! )?;
//! let cache: LayeredCache<Vec<String>> =
//!     LayeredCache::new(LayeredCacheConfig::default(), Arc::new(breaker))?;
//!
//! cache.set("search:lofi", vec!["Lofi Beats".to_string()], None).await;
//! assert!(cache.get("search:lofi").await.is_some());
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod layered;
pub mod remote;
pub mod ttl_cache;

pub use circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use layered::{
    search_key, LayerStats, LayeredCache, LayeredCacheConfig, LayeredStats, OverallStats,
    SetOptions, SizeInfo,
};
pub use remote::{redact_url, OfflineStore, RedisConfig, RedisStore, RemoteStatus, RemoteStore};
pub use ttl_cache::{TtlCache, TtlCacheConfig, TtlCacheStats};
