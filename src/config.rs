use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

use crate::{
    audio::autoplay::AutoplayConfig,
    bot::dispatcher::DispatcherConfig,
    cache::{
        redact_url, CircuitBreakerConfig, LayeredCacheConfig, RedisConfig, TtlCacheConfig,
    },
};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    // Redis (L2)
    pub redis_url: String,
    pub redis_key_prefix: String,

    // Caché local
    pub l1_cache_size: usize,
    pub l1_cache_ttl: Duration,
    pub search_cache_ttl: Duration, // TTL en L2
    pub cache_cleanup_interval: Duration,
    pub fallback_cache_size: usize,
    pub fallback_cache_ttl: Duration,

    // Circuit breaker
    pub breaker_failure_threshold: f64,
    pub breaker_volume_threshold: u32,
    pub breaker_monitoring_window: Duration,
    pub breaker_timeout: Duration,
    pub remote_operation_timeout: Duration,

    // Autoplay
    pub autoplay_enabled: bool,
    pub autoplay_cooldown: Duration,
    pub autoplay_cooldown_ttl: Duration,

    // UI y monitoreo
    pub ui_push_interval: Duration,
    pub health_log_interval: Duration,
}

fn var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Valor inválido para {}: '{}'", name, raw)),
        _ => Ok(default),
    }
}

fn var_ms(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Result<Duration> {
    var(lookup, name, default.as_millis() as u64).map(Duration::from_millis)
}

impl Config {
    /// Loads `.env` (if present) and then the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source, then validates it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            // Redis
            redis_url: var(&lookup, "REDIS_URL", defaults.redis_url)?,
            redis_key_prefix: var(&lookup, "REDIS_KEY_PREFIX", defaults.redis_key_prefix)?,

            // Caché local
            l1_cache_size: var(&lookup, "L1_CACHE_SIZE", defaults.l1_cache_size)?,
            l1_cache_ttl: var_ms(&lookup, "L1_CACHE_TTL_MS", defaults.l1_cache_ttl)?,
            search_cache_ttl: var_ms(&lookup, "SEARCH_CACHE_TTL_MS", defaults.search_cache_ttl)?,
            cache_cleanup_interval: var_ms(
                &lookup,
                "CACHE_CLEANUP_INTERVAL_MS",
                defaults.cache_cleanup_interval,
            )?,
            fallback_cache_size: var(&lookup, "FALLBACK_CACHE_SIZE", defaults.fallback_cache_size)?,
            fallback_cache_ttl: var_ms(&lookup, "FALLBACK_CACHE_TTL_MS", defaults.fallback_cache_ttl)?,

            // Circuit breaker
            breaker_failure_threshold: var(
                &lookup,
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            )?,
            breaker_volume_threshold: var(
                &lookup,
                "BREAKER_VOLUME_THRESHOLD",
                defaults.breaker_volume_threshold,
            )?,
            breaker_monitoring_window: var_ms(
                &lookup,
                "BREAKER_MONITORING_WINDOW_MS",
                defaults.breaker_monitoring_window,
            )?,
            breaker_timeout: var_ms(&lookup, "BREAKER_TIMEOUT_MS", defaults.breaker_timeout)?,
            remote_operation_timeout: var_ms(
                &lookup,
                "REMOTE_OPERATION_TIMEOUT_MS",
                defaults.remote_operation_timeout,
            )?,

            // Autoplay
            autoplay_enabled: var(&lookup, "AUTOPLAY_ENABLED", defaults.autoplay_enabled)?,
            autoplay_cooldown: var_ms(&lookup, "AUTOPLAY_COOLDOWN_MS", defaults.autoplay_cooldown)?,
            autoplay_cooldown_ttl: var_ms(
                &lookup,
                "AUTOPLAY_COOLDOWN_TTL_MS",
                defaults.autoplay_cooldown_ttl,
            )?,

            // UI y monitoreo
            ui_push_interval: var_ms(&lookup, "UI_PUSH_INTERVAL_MS", defaults.ui_push_interval)?,
            health_log_interval: var_ms(
                &lookup,
                "HEALTH_LOG_INTERVAL_MS",
                defaults.health_log_interval,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Cache sizes must be greater than 0
    /// - TTLs, windows and intervals must be greater than 0
    /// - Failure threshold must be in `(0, 1]`
    /// - Autoplay cooldown memory must outlive the cooldown window
    /// - Redis URL must use `redis://` or `rediss://`
    pub fn validate(&self) -> Result<()> {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            anyhow::bail!(
                "Redis URL must start with redis:// or rediss://, got: {}",
                redact_url(&self.redis_url)
            );
        }

        if self.l1_cache_size == 0 {
            anyhow::bail!("L1 cache size must be greater than 0");
        }

        if self.fallback_cache_size == 0 {
            anyhow::bail!("Fallback cache size must be greater than 0");
        }

        let non_zero = [
            ("L1_CACHE_TTL_MS", self.l1_cache_ttl),
            ("SEARCH_CACHE_TTL_MS", self.search_cache_ttl),
            ("CACHE_CLEANUP_INTERVAL_MS", self.cache_cleanup_interval),
            ("FALLBACK_CACHE_TTL_MS", self.fallback_cache_ttl),
            ("BREAKER_MONITORING_WINDOW_MS", self.breaker_monitoring_window),
            ("BREAKER_TIMEOUT_MS", self.breaker_timeout),
            ("REMOTE_OPERATION_TIMEOUT_MS", self.remote_operation_timeout),
            ("AUTOPLAY_COOLDOWN_MS", self.autoplay_cooldown),
            ("UI_PUSH_INTERVAL_MS", self.ui_push_interval),
            ("HEALTH_LOG_INTERVAL_MS", self.health_log_interval),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if !(self.breaker_failure_threshold > 0.0 && self.breaker_failure_threshold <= 1.0) {
            anyhow::bail!(
                "Breaker failure threshold must be in (0, 1], got: {}",
                self.breaker_failure_threshold
            );
        }

        if self.breaker_volume_threshold == 0 {
            anyhow::bail!("Breaker volume threshold must be greater than 0");
        }

        if self.autoplay_cooldown_ttl < self.autoplay_cooldown {
            anyhow::bail!("Autoplay cooldown TTL cannot be shorter than the cooldown window");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The Redis password, if any, is redacted.
    pub fn summary(&self) -> String {
        let fmt = humantime::format_duration;
        format!(
            "Config Summary:\n  \
            Redis: {} (prefix '{}')\n  \
            L1: {} entries, TTL {}, sweep every {}\n  \
            Fallback: {} entries, TTL {}\n  \
            Breaker: {:.0}% of {} calls in {}, open for {}, op timeout {}\n  \
            Autoplay: {} (cooldown {})\n  \
            UI push: every {}",
            redact_url(&self.redis_url),
            self.redis_key_prefix,
            self.l1_cache_size,
            fmt(self.l1_cache_ttl),
            fmt(self.cache_cleanup_interval),
            self.fallback_cache_size,
            fmt(self.fallback_cache_ttl),
            self.breaker_failure_threshold * 100.0,
            self.breaker_volume_threshold,
            fmt(self.breaker_monitoring_window),
            fmt(self.breaker_timeout),
            fmt(self.remote_operation_timeout),
            if self.autoplay_enabled { "on" } else { "off" },
            fmt(self.autoplay_cooldown),
            fmt(self.ui_push_interval),
        )
    }

    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            url: self.redis_url.clone(),
            key_prefix: self.redis_key_prefix.clone(),
        }
    }

    /// Configuración del L1
    pub fn ttl_cache_config(&self) -> TtlCacheConfig {
        TtlCacheConfig {
            max_size: self.l1_cache_size,
            default_ttl: self.l1_cache_ttl,
            cleanup_interval: self.cache_cleanup_interval,
        }
    }

    pub fn fallback_cache_config(&self) -> TtlCacheConfig {
        TtlCacheConfig {
            max_size: self.fallback_cache_size,
            default_ttl: self.fallback_cache_ttl,
            cleanup_interval: self.cache_cleanup_interval,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            volume_threshold: self.breaker_volume_threshold,
            monitoring_window: self.breaker_monitoring_window,
            timeout: self.breaker_timeout,
            operation_timeout: self.remote_operation_timeout,
            fallback: self.fallback_cache_config(),
        }
    }

    pub fn layered_config(&self) -> LayeredCacheConfig {
        LayeredCacheConfig {
            l1: self.ttl_cache_config(),
            l2_default_ttl: self.search_cache_ttl,
        }
    }

    pub fn autoplay_config(&self) -> AutoplayConfig {
        AutoplayConfig {
            enabled: self.autoplay_enabled,
            cooldown: self.autoplay_cooldown,
            cooldown_ttl: self.autoplay_cooldown_ttl,
            cleanup_interval: self.cache_cleanup_interval,
            ..AutoplayConfig::default()
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let defaults = DispatcherConfig::default();
        DispatcherConfig {
            search_cache: self.layered_config(),
            autoplay: self.autoplay_config(),
            ui_push_interval: self.ui_push_interval,
            ui_push_memory: TtlCacheConfig {
                cleanup_interval: self.cache_cleanup_interval,
                ..defaults.ui_push_memory
            },
        }
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_key_prefix: "openmusic:".to_string(),

            l1_cache_size: 1000,
            l1_cache_ttl: Duration::from_secs(300),
            search_cache_ttl: Duration::from_secs(3600), // 1 hora
            cache_cleanup_interval: Duration::from_secs(60),
            fallback_cache_size: 500,
            fallback_cache_ttl: Duration::from_secs(300),

            breaker_failure_threshold: 0.5,
            breaker_volume_threshold: 10,
            breaker_monitoring_window: Duration::from_secs(60),
            breaker_timeout: Duration::from_secs(30),
            remote_operation_timeout: Duration::from_secs(2),

            autoplay_enabled: true,
            autoplay_cooldown: Duration::from_millis(1500),
            autoplay_cooldown_ttl: Duration::from_secs(300),

            ui_push_interval: Duration::from_secs(2),
            health_log_interval: Duration::from_secs(60),
        }
    }
}
