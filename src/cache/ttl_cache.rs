use parking_lot::Mutex;
use serde::Serialize;
use std::{
    borrow::Borrow,
    collections::{BTreeMap, HashMap},
    hash::Hash,
    sync::Arc,
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::error::{CacheError, CacheResult};

/// Configuración de un [`TtlCache`]
#[derive(Debug, Clone, PartialEq)]
pub struct TtlCacheConfig {
    /// Maximum number of entries, enforced on insert
    pub max_size: usize,
    /// TTL used when `set` is called without one
    pub default_ttl: Duration,
    /// Period of the background sweep
    pub cleanup_interval: Duration,
}

impl Default for TtlCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(300), // 5 minutos
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl TtlCacheConfig {
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_size == 0 {
            return Err(CacheError::InvalidConfig(
                "max_size debe ser mayor que 0".to_string(),
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(CacheError::InvalidConfig(
                "default_ttl debe ser mayor que 0".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "cleanup_interval debe ser mayor que 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cache entry con expiración absoluta
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    seq: u64,
    size_hint: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct Inner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    // (expires_at, insertion seq) -> key; first element is the next eviction victim
    by_expiry: BTreeMap<(Instant, u64), K>,
    next_seq: u64,
    bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_expiry: BTreeMap::new(),
            next_seq: 0,
            bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn live<Q>(&self, key: &Q, now: Instant) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| &entry.value)
    }

    fn remove_entry<Q>(&mut self, key: &Q) -> Option<CacheEntry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.remove(key)?;
        self.by_expiry.remove(&(entry.expires_at, entry.seq));
        self.bytes = self.bytes.saturating_sub(entry.size_hint);
        Some(entry)
    }

    fn pop_soonest(&mut self) -> Option<CacheEntry<V>> {
        let (_, key) = self.by_expiry.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.bytes = self.bytes.saturating_sub(entry.size_hint);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((&(expires_at, _), _)) = self.by_expiry.first_key_value() {
            if expires_at > now {
                break;
            }
            if self.pop_soonest().is_some() {
                removed += 1;
            }
        }
        self.expirations += removed as u64;
        removed
    }

    fn insert(
        &mut self,
        key: K,
        value: V,
        ttl: Duration,
        size_hint: usize,
        max_size: usize,
        now: Instant,
    ) {
        if self.remove_entry(&key).is_none() && self.entries.len() >= max_size {
            self.purge_expired(now);
            if self.entries.len() >= max_size && self.pop_soonest().is_some() {
                self.evictions += 1;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        // Duraciones absurdas se saturan a ~30 años
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(30 * 365 * 24 * 3600));

        self.by_expiry.insert((expires_at, seq), key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at,
                seq,
                size_hint,
            },
        );
        self.bytes += size_hint;
    }
}

/// Bounded map with per-entry expiry and a background sweep.
///
/// Capacity is enforced on insert: when a new key arrives at `max_size`,
/// expired entries are purged first and, if still full, the entry with the
/// soonest expiry is evicted (ties go to the oldest insertion).
///
/// A sweeper task is spawned on the current tokio runtime at construction
/// and removes expired entries every `cleanup_interval`. It holds only a
/// weak reference to the map and stops on [`destroy`](Self::destroy) or drop.
/// Without a runtime no sweeper is started and expiry stays lazy.
///
/// # Example
///
/// ```rust,no_run
/// use open_music_core::cache::{TtlCache, TtlCacheConfig};
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let cache: TtlCache<String, u32> = TtlCache::new(TtlCacheConfig {
///     max_size: 100,
///     default_ttl: Duration::from_secs(60),
///     cleanup_interval: Duration::from_secs(10),
/// })?;
///
/// cache.set("guild:1".to_string(), 7, None);
/// assert_eq!(cache.get("guild:1"), Some(7));
/// cache.destroy();
/// # Ok(())
/// # }
/// ```
pub struct TtlCache<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    config: TtlCacheConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: TtlCacheConfig) -> CacheResult<Self> {
        config.validate()?;

        let cache = Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            config,
            sweeper: Mutex::new(None),
        };
        cache.start_cleanup_task();
        Ok(cache)
    }

    /// Inserta o sobrescribe con el TTL dado (o el de por defecto)
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let size_hint = std::mem::size_of::<K>() + std::mem::size_of::<V>();
        self.set_sized(key, value, ttl, size_hint);
    }

    /// Inserta con un tamaño estimado explícito para `estimated_bytes`
    pub fn set_sized(&self, key: K, value: V, ttl: Option<Duration>, size_hint: usize) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let now = Instant::now();
        self.inner
            .lock()
            .insert(key, value, ttl, size_hint, self.config.max_size, now);
    }

    /// Atomic check-and-set: `predicate` sees the current live value (if
    /// any) and the insert only happens when it returns `true`.
    pub fn set_if<F>(&self, key: K, value: V, ttl: Option<Duration>, predicate: F) -> bool
    where
        F: FnOnce(Option<&V>) -> bool,
    {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let size_hint = std::mem::size_of::<K>() + std::mem::size_of::<V>();
        let now = Instant::now();

        let mut inner = self.inner.lock();
        if !predicate(inner.live(&key, now)) {
            return false;
        }
        inner.insert(key, value, ttl, size_hint, self.config.max_size, now);
        true
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                inner.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.remove_entry(key);
            inner.expirations += 1;
        }
        inner.misses += 1;
        None
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().live(key, Instant::now()).is_some()
    }

    /// Elimina una entrada; retorna si existía
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().remove_entry(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.by_expiry.clear();
        inner.bytes = 0;
    }

    /// Number of live entries; expired ones are purged first
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Suma de los size hints de las entradas presentes
    pub fn estimated_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Limpia entradas expiradas y retorna el número de elementos removidos
    pub fn purge_expired(&self) -> usize {
        let removed = self.inner.lock().purge_expired(Instant::now());
        if removed > 0 {
            debug!("🧹 Limpiadas {} entradas expiradas del cache", removed);
        }
        removed
    }

    pub fn stats(&self) -> TtlCacheStats {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        TtlCacheStats {
            size: inner.entries.len(),
            max_size: self.config.max_size,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            estimated_bytes: inner.bytes,
        }
    }

    /// Detiene la tarea de limpieza. Idempotente; el caché sigue usable
    /// con expiración perezosa.
    pub fn destroy(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
            debug!("🛑 Tarea de limpieza del cache detenida");
        }
    }

    fn start_cleanup_task(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("Sin runtime de tokio, el cache usará solo expiración perezosa");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let every = self.config.cleanup_interval;

        let task = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = inner.lock().purge_expired(Instant::now());
                if removed > 0 {
                    debug!("🧹 Limpieza automática: {} entradas expiradas", removed);
                }
            }
        });

        *self.sweeper.lock() = Some(task);
    }
}

impl<K, V> Drop for TtlCache<K, V> {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("config", &self.config)
            .field("sweeper_running", &self.sweeper.lock().is_some())
            .finish()
    }
}

/// Métricas básicas del cache
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub estimated_bytes: usize,
}

impl TtlCacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn usage_percent(&self) -> f64 {
        self.size as f64 / self.max_size as f64 * 100.0
    }
}
