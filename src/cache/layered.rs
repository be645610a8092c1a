use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    circuit_breaker::{BreakerMetrics, CircuitBreaker},
    ttl_cache::{TtlCache, TtlCacheConfig},
};
use crate::error::{CacheError, CacheResult};

#[derive(Debug, Clone, PartialEq)]
pub struct LayeredCacheConfig {
    pub l1: TtlCacheConfig,
    /// TTL for L2 writes that don't carry one
    pub l2_default_ttl: Duration,
}

impl Default for LayeredCacheConfig {
    fn default() -> Self {
        Self {
            l1: TtlCacheConfig::default(),
            l2_default_ttl: Duration::from_secs(3600), // 1 hora
        }
    }
}

impl LayeredCacheConfig {
    pub fn validate(&self) -> CacheResult<()> {
        if self.l2_default_ttl.is_zero() {
            return Err(CacheError::InvalidConfig(
                "l2_default_ttl debe ser mayor que 0".to_string(),
            ));
        }
        self.l1.validate()
    }
}

/// Opciones de escritura
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Keep the value process-local (L1 only)
    pub skip_l2: bool,
}

#[derive(Debug, Default)]
struct LayerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl LayerCounters {
    fn snapshot(&self) -> LayerStats {
        LayerStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallStats {
    pub total_hits: u64,
    pub total_misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LayeredStats {
    pub l1: LayerStats,
    pub l2: LayerStats,
    pub overall: OverallStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeInfo {
    pub l1_size: usize,
    pub l1_max_size: usize,
    pub usage_percent: f64,
    pub estimated_memory_bytes: usize,
}

/// Drops the coalescing slot for `key` once nobody else holds it, on every
/// exit path of `get_or_set` including cancellation.
struct InflightRelease<'a> {
    inflight: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
}

impl Drop for InflightRelease<'_> {
    fn drop(&mut self) {
        // Solo el mapa y nosotros: nadie más espera esta clave
        self.inflight
            .remove_if(self.key, |_, existing| Arc::strong_count(existing) <= 2);
    }
}

/// Two-tier cache: process-local L1 in front of the breaker-protected L2.
///
/// - Reads check L1, then L2; an L2 hit is promoted into L1.
/// - Writes go to both tiers unless [`SetOptions::skip_l2`] is set.
/// - Values cross the L2 boundary as JSON; the encoded length doubles as the
///   L1 size hint.
/// - [`get_or_set`](Self::get_or_set) coalesces concurrent misses for the
///   same key so the loader runs once per miss.
///
/// Cross-tier operations on the same key are not linearizable. This is a
/// best-effort cache, never the source of truth.
pub struct LayeredCache<V> {
    l1: TtlCache<String, V>,
    l2: Arc<CircuitBreaker>,
    config: LayeredCacheConfig,
    l1_stats: LayerCounters,
    l2_stats: LayerCounters,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl<V> std::fmt::Debug for LayeredCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredCache")
            .field("config", &self.config)
            .field("l2", &self.l2)
            .finish()
    }
}

impl<V> LayeredCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(config: LayeredCacheConfig, l2: Arc<CircuitBreaker>) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self {
            l1: TtlCache::new(config.l1.clone())?,
            l2,
            config,
            l1_stats: LayerCounters::default(),
            l2_stats: LayerCounters::default(),
            inflight: DashMap::new(),
        })
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let value = self.lookup(key).await;
        if value.is_none() {
            self.record_miss();
            debug!(key, "❌ Cache miss L1/L2");
        }
        value
    }

    /// Tiered read that counts hits only; the caller decides whether a
    /// `None` is a miss.
    async fn lookup(&self, key: &str) -> Option<V> {
        if let Some(value) = self.l1.get(key) {
            self.l1_stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "✅ Cache hit L1");
            return Some(value);
        }

        let raw = self.l2.get(key).await?;

        match serde_json::from_str::<V>(&raw) {
            Ok(value) => {
                self.l1_stats.misses.fetch_add(1, Ordering::Relaxed);
                self.l2_stats.hits.fetch_add(1, Ordering::Relaxed);
                self.l1
                    .set_sized(key.to_string(), value.clone(), None, key.len() + raw.len());
                debug!(key, "✅ Cache hit L2, promovido a L1");
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "⚠️ Valor ilegible en L2, tratado como miss");
                None
            }
        }
    }

    fn record_miss(&self) {
        self.l1_stats.misses.fetch_add(1, Ordering::Relaxed);
        self.l2_stats.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.set_with(key, value, ttl, SetOptions::default()).await;
    }

    pub async fn set_with(&self, key: &str, value: V, ttl: Option<Duration>, opts: SetOptions) {
        let encoded = serde_json::to_string(&value);
        let size = encoded
            .as_ref()
            .map_or(std::mem::size_of::<V>(), |raw| raw.len());

        self.l1.set_sized(key.to_string(), value, ttl, key.len() + size);
        self.l1_stats.sets.fetch_add(1, Ordering::Relaxed);

        if opts.skip_l2 {
            return;
        }

        match encoded {
            Ok(raw) => {
                let l2_ttl = ttl.unwrap_or(self.config.l2_default_ttl);
                self.l2.set(key, &raw, Some(l2_ttl)).await;
                self.l2_stats.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(key, error = %e, "⚠️ No se pudo serializar para L2, solo L1");
            }
        }
    }

    /// Returns the cached value or runs `loader` once and stores its result.
    ///
    /// Concurrent callers missing on the same key wait for the first one and
    /// then re-check L1 instead of calling their own loader. A loader error
    /// is returned to its caller and nothing is stored.
    ///
    /// Each call counts once in the stats: a hit when it is served from
    /// cache, including a value loaded by a concurrent caller, and a miss
    /// when its own loader runs.
    pub async fn get_or_set<F, Fut>(
        &self,
        key: &str,
        loader: F,
        ttl: Option<Duration>,
    ) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(value) = self.lookup(key).await {
            return Ok(value);
        }

        let slot = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        // Declared after `slot` so it runs while our handle is still counted
        let _release = InflightRelease {
            inflight: &self.inflight,
            key,
        };

        let _leader = slot.lock().await;

        if let Some(value) = self.l1.get(key) {
            self.l1_stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "🤝 Carga compartida con otra petición");
            return Ok(value);
        }

        self.record_miss();
        debug!(key, "❌ Cache miss L1/L2, cargando");
        let value = loader().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Batched read; keys missing from both tiers are omitted
    pub async fn mget(&self, keys: &[String]) -> HashMap<String, V> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();

        for key in keys {
            match self.l1.get(key.as_str()) {
                Some(value) => {
                    self.l1_stats.hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(key.clone(), value);
                }
                None => {
                    self.l1_stats.misses.fetch_add(1, Ordering::Relaxed);
                    missing.push(key.clone());
                }
            }
        }

        if missing.is_empty() {
            return found;
        }

        let values = self.l2.mget(&missing).await;
        for (key, raw) in missing.into_iter().zip(values) {
            let decoded = raw.and_then(|raw| {
                serde_json::from_str::<V>(&raw)
                    .ok()
                    .map(|value| (value, raw.len()))
            });

            match decoded {
                Some((value, size)) => {
                    self.l2_stats.hits.fetch_add(1, Ordering::Relaxed);
                    self.l1
                        .set_sized(key.clone(), value.clone(), None, key.len() + size);
                    found.insert(key, value);
                }
                None => {
                    self.l2_stats.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        found
    }

    pub async fn delete(&self, key: &str) -> bool {
        let local = self.l1.remove(key);
        let remote = self.l2.delete(key).await;
        local || remote
    }

    pub fn stats(&self) -> LayeredStats {
        let l1 = self.l1_stats.snapshot();
        let l2 = self.l2_stats.snapshot();
        let total_hits = l1.hits + l2.hits;
        let total_misses = l2.misses;
        let total = total_hits + total_misses;

        LayeredStats {
            l1,
            l2,
            overall: OverallStats {
                total_hits,
                total_misses,
                hit_rate: if total > 0 {
                    total_hits as f64 / total as f64
                } else {
                    0.0
                },
            },
        }
    }

    pub fn reset_stats(&self) {
        self.l1_stats.reset();
        self.l2_stats.reset();
    }

    pub fn size_info(&self) -> SizeInfo {
        let l1_size = self.l1.len();
        let l1_max_size = self.l1.max_size();
        SizeInfo {
            l1_size,
            l1_max_size,
            usage_percent: l1_size as f64 / l1_max_size as f64 * 100.0,
            estimated_memory_bytes: self.l1.estimated_bytes(),
        }
    }

    pub fn breaker_metrics(&self) -> BreakerMetrics {
        self.l2.metrics()
    }

    /// Vacía solo el nivel local
    pub fn clear_l1(&self) {
        self.l1.clear();
    }

    pub async fn clear(&self) {
        self.l1.clear();
        self.l2.clear().await;
    }

    /// Detiene el barrido del L1
    pub fn destroy(&self) {
        self.l1.destroy();
    }
}

/// Normaliza una búsqueda para usarla como clave de caché
pub fn search_key(query: &str) -> String {
    let normalized = query
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ");
    format!("search:{}", normalized)
}
