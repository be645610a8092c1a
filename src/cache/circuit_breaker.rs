//! # Circuit Breaker
//!
//! Protects the remote cache with a rolling failure-ratio breaker and keeps
//! a local [`TtlCache`] as fallback so reads degrade instead of failing.
//!
//! ```text
//!            ratio >= threshold            timeout elapsed
//!  CLOSED ───────────────────────▶ OPEN ─────────────────▶ HALF_OPEN
//!    ▲                              ▲                          │
//!    │          trial ok            │       trial failed       │
//!    └──────────────────────────────┼──────────────────────────┘
//!                                   └──────────────────────────┘
//! ```
//!
//! No operation surfaces a remote error: a timeout, a refused connection or
//! an error reply all count as one failure and the caller gets the fallback
//! value (possibly stale, possibly absent).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{
    remote::RemoteStore,
    ttl_cache::{TtlCache, TtlCacheConfig},
};
use crate::error::{CacheError, CacheResult, RemoteError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, every remote call is attempted
    Closed,
    /// Remote skipped, fallback only
    Open,
    /// One trial call allowed to probe recovery
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure ratio (0, 1] that opens the circuit
    pub failure_threshold: f64,
    /// Minimum samples in the window before the ratio is evaluated
    pub volume_threshold: u32,
    /// Counters reset once the window is older than this
    pub monitoring_window: Duration,
    /// How long OPEN lasts before a trial is allowed
    pub timeout: Duration,
    /// Hard limit for a single remote call
    pub operation_timeout: Duration,
    pub fallback: TtlCacheConfig,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            volume_threshold: 10,
            monitoring_window: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(2),
            fallback: TtlCacheConfig {
                max_size: 500,
                ..TtlCacheConfig::default()
            },
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> CacheResult<()> {
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) {
            return Err(CacheError::InvalidConfig(format!(
                "failure_threshold debe estar en (0, 1], recibido: {}",
                self.failure_threshold
            )));
        }
        if self.volume_threshold == 0 {
            return Err(CacheError::InvalidConfig(
                "volume_threshold debe ser mayor que 0".to_string(),
            ));
        }
        if self.monitoring_window.is_zero()
            || self.timeout.is_zero()
            || self.operation_timeout.is_zero()
        {
            return Err(CacheError::InvalidConfig(
                "monitoring_window, timeout y operation_timeout deben ser mayores que 0"
                    .to_string(),
            ));
        }
        self.fallback.validate()
    }
}

/// Snapshot for the health check
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub fallback_cache_size: usize,
    pub redis_status: String,
    pub last_opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u64,
    successes: u64,
    window_start: Instant,
    last_opened_at: Option<Instant>,
    last_opened_wall: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            window_start: now,
            last_opened_at: None,
            last_opened_wall: None,
            trial_in_flight: false,
        }
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.saturating_duration_since(self.window_start) > window {
            self.failures = 0;
            self.successes = 0;
            self.window_start = now;
        }
    }

    fn reset_counters(&mut self, now: Instant) {
        self.failures = 0;
        self.successes = 0;
        self.window_start = now;
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_opened_at = Some(now);
        self.last_opened_wall = Some(Utc::now());
        self.trial_in_flight = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
    Rejected,
}

enum RemoteOutcome<T> {
    Done(T),
    Failed,
    Skipped,
}

/// Releases the half-open trial slot if the call is cancelled mid-flight
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.state.lock().trial_in_flight = false;
        }
    }
}

/// Remote cache client guarded by a circuit breaker with local fallback
pub struct CircuitBreaker {
    name: String,
    remote: Arc<dyn RemoteStore>,
    fallback: TtlCache<String, String>,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    disconnected: AtomicBool,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("provider", &self.remote.provider_name())
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        remote: Arc<dyn RemoteStore>,
        config: CircuitBreakerConfig,
    ) -> CacheResult<Self> {
        config.validate()?;
        let name = name.into();
        let fallback = TtlCache::new(config.fallback.clone())?;

        info!(
            breaker = %name,
            provider = remote.provider_name(),
            failure_threshold = config.failure_threshold,
            volume_threshold = config.volume_threshold,
            timeout_ms = config.timeout.as_millis() as u64,
            "🛡️ Circuit breaker inicializado"
        );

        Ok(Self {
            name,
            remote,
            fallback,
            state: Mutex::new(BreakerState::new(Instant::now())),
            config,
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lee del remoto; ante error o circuito abierto, del fallback
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.call("get", || self.remote.get(key)).await {
            RemoteOutcome::Done(value) => value,
            RemoteOutcome::Failed | RemoteOutcome::Skipped => self.fallback.get(key),
        }
    }

    /// Always writes the fallback, then the remote unless the circuit is open
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| self.fallback.default_ttl());
        self.fallback.set_sized(
            key.to_string(),
            value.to_string(),
            Some(ttl),
            key.len() + value.len(),
        );

        self.call("set", || self.remote.set(key, value, ttl)).await;
    }

    pub async fn delete(&self, key: &str) -> bool {
        let local = self.fallback.remove(key);
        match self.call("delete", || self.remote.delete(key)).await {
            RemoteOutcome::Done(remote) => local || remote,
            RemoteOutcome::Failed | RemoteOutcome::Skipped => local,
        }
    }

    /// Batched read, one slot per key
    pub async fn mget(&self, keys: &[String]) -> Vec<Option<String>> {
        if keys.is_empty() {
            return Vec::new();
        }

        match self.call("mget", || self.remote.mget(keys)).await {
            RemoteOutcome::Done(values) if values.len() == keys.len() => values,
            RemoteOutcome::Done(values) => {
                warn!(
                    breaker = %self.name,
                    expected = keys.len(),
                    received = values.len(),
                    "⚠️ MGET devolvió un número inesperado de valores"
                );
                keys.iter().map(|k| self.fallback.get(k)).collect()
            }
            RemoteOutcome::Failed | RemoteOutcome::Skipped => {
                keys.iter().map(|k| self.fallback.get(k)).collect()
            }
        }
    }

    /// Vacía el fallback y el namespace remoto
    pub async fn clear(&self) {
        self.fallback.clear();
        if let RemoteOutcome::Done(removed) =
            self.call("clear", || self.remote.clear_namespace()).await
        {
            info!(breaker = %self.name, removed, "🗑️ Caché remoto limpiado");
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let (state, failures, successes, last_opened_at) = {
            let s = self.state.lock();
            (s.state, s.failures, s.successes, s.last_opened_wall)
        };

        BreakerMetrics {
            state,
            failures,
            successes,
            fallback_cache_size: self.fallback.len(),
            redis_status: self.remote.status().to_string(),
            last_opened_at,
        }
    }

    pub fn fallback_len(&self) -> usize {
        self.fallback.len()
    }

    /// Abre el circuito manualmente (mantenimiento del remoto)
    pub fn force_open(&self) {
        warn!(breaker = %self.name, "🚨 Circuit breaker forzado a OPEN");
        self.state.lock().open(Instant::now());
    }

    pub fn force_closed(&self) {
        warn!(breaker = %self.name, "🚨 Circuit breaker forzado a CLOSED");
        let now = Instant::now();
        let mut s = self.state.lock();
        s.state = CircuitState::Closed;
        s.trial_in_flight = false;
        s.reset_counters(now);
    }

    /// Closes the remote connection and stops the fallback sweeper.
    /// Later calls skip the remote entirely. Idempotent.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        self.remote.disconnect().await;
        self.fallback.destroy();
        info!(breaker = %self.name, "👋 Circuit breaker desconectado");
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> RemoteOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let admission = self.admit();
        if admission == Admission::Rejected {
            debug!(breaker = %self.name, operation, "⏭️ Remoto omitido, usando fallback");
            return RemoteOutcome::Skipped;
        }

        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let result = match timeout(self.config.operation_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.config.operation_timeout)),
        };
        guard.armed = false;

        match result {
            Ok(value) => {
                self.record(admission, true);
                RemoteOutcome::Done(value)
            }
            Err(e) => {
                debug!(breaker = %self.name, operation, error = %e, "🔴 Operación remota falló");
                self.record(admission, false);
                RemoteOutcome::Failed
            }
        }
    }

    fn admit(&self) -> Admission {
        if self.disconnected.load(Ordering::Acquire) {
            return Admission::Rejected;
        }

        let now = Instant::now();
        let mut s = self.state.lock();
        s.roll_window(now, self.config.monitoring_window);

        match s.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => {
                let elapsed = s
                    .last_opened_at
                    .map_or(self.config.timeout, |at| now.saturating_duration_since(at));
                if elapsed >= self.config.timeout {
                    s.state = CircuitState::HalfOpen;
                    s.trial_in_flight = true;
                    info!(breaker = %self.name, "🟡 Circuit breaker HALF_OPEN (probando recuperación)");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen if !s.trial_in_flight => {
                s.trial_in_flight = true;
                Admission::Trial
            }
            CircuitState::HalfOpen => Admission::Rejected,
        }
    }

    fn record(&self, admission: Admission, success: bool) {
        let now = Instant::now();
        let mut s = self.state.lock();

        if admission == Admission::Trial {
            if success {
                s.state = CircuitState::Closed;
                s.trial_in_flight = false;
                s.reset_counters(now);
                info!(breaker = %self.name, "🟢 Circuit breaker CLOSED (recuperado)");
            } else {
                s.open(now);
                warn!(breaker = %self.name, "🔴 Prueba fallida, circuit breaker vuelve a OPEN");
            }
            return;
        }

        s.roll_window(now, self.config.monitoring_window);
        if success {
            s.successes += 1;
        } else {
            s.failures += 1;
        }

        let total = s.failures + s.successes;
        if s.state == CircuitState::Closed
            && total >= u64::from(self.config.volume_threshold)
            && s.failures as f64 / total as f64 >= self.config.failure_threshold
        {
            s.open(now);
            warn!(
                breaker = %self.name,
                failures = s.failures,
                successes = s.successes,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "🔴 Circuit breaker OPEN (usando fallback)"
            );
        }
    }
}
