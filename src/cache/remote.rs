//! Remote key-value client used as the L2 tier.
//!
//! [`RemoteStore`] is the seam the [`CircuitBreaker`](super::CircuitBreaker)
//! wraps. Values are opaque strings; callers serialise before writing.
//! Two implementations ship with the crate:
//!
//! - [`RedisStore`]: async multiplexed connection through
//!   `redis::aio::ConnectionManager`, every key namespaced by a prefix.
//! - [`OfflineStore`]: used when Redis is unreachable at startup. Every call
//!   fails with [`RemoteError::Unavailable`], so the breaker opens and the
//!   fallback cache serves all traffic.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::error::{RemoteError, RemoteResult};

/// Estado de la conexión remota, reportado en el health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Connecting = 0,
    Ready = 1,
    Reconnecting = 2,
    Offline = 3,
    End = 4,
}

impl From<u8> for RemoteStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => RemoteStatus::Connecting,
            1 => RemoteStatus::Ready,
            2 => RemoteStatus::Reconnecting,
            3 => RemoteStatus::Offline,
            _ => RemoteStatus::End,
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteStatus::Connecting => "connecting",
            RemoteStatus::Ready => "ready",
            RemoteStatus::Reconnecting => "reconnecting",
            RemoteStatus::Offline => "offline",
            RemoteStatus::End => "end",
        };
        f.write_str(s)
    }
}

/// Operaciones del caché remoto
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// `Ok(None)` on a miss
    async fn get(&self, key: &str) -> RemoteResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> RemoteResult<bool>;

    /// One slot per requested key, in order
    async fn mget(&self, keys: &[String]) -> RemoteResult<Vec<Option<String>>>;

    /// Removes every key this client owns; returns how many were deleted
    async fn clear_namespace(&self) -> RemoteResult<u64>;

    fn status(&self) -> RemoteStatus;

    /// Cierra la conexión. Idempotente.
    async fn disconnect(&self);

    fn provider_name(&self) -> &'static str;
}

/// Configuración de conexión a Redis
#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "openmusic:".to_string(),
        }
    }
}

/// Cliente Redis con reconexión automática
pub struct RedisStore {
    connection: Mutex<Option<ConnectionManager>>,
    key_prefix: String,
    status: AtomicU8,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("status", &self.status())
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> RemoteResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| RemoteError::Connection(format!("URL de Redis inválida: {}", e)))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| RemoteError::Connection(format!("No se pudo conectar a Redis: {}", e)))?;

        info!(url = %redact_url(&config.url), prefix = %config.key_prefix, "🔌 Conectado a Redis");

        Ok(Self {
            connection: Mutex::new(Some(manager)),
            key_prefix: config.key_prefix.clone(),
            status: AtomicU8::new(RemoteStatus::Ready as u8),
        })
    }

    fn connection(&self) -> RemoteResult<ConnectionManager> {
        self.connection.lock().clone().ok_or(RemoteError::Unavailable)
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Actualiza el estado según el resultado de la operación
    fn track<T>(&self, result: redis::RedisResult<T>) -> RemoteResult<T> {
        match result {
            Ok(value) => {
                self.status
                    .store(RemoteStatus::Ready as u8, Ordering::Release);
                Ok(value)
            }
            Err(e) => {
                let err = RemoteError::from(e);
                if matches!(err, RemoteError::Connection(_) | RemoteError::Timeout(_)) {
                    self.status
                        .store(RemoteStatus::Reconnecting as u8, Ordering::Release);
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> RemoteResult<Option<String>> {
        let mut conn = self.connection()?;
        let result = redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async::<Option<String>>(&mut conn)
            .await;
        self.track(result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<()> {
        let mut conn = self.connection()?;
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let result = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await;
        self.track(result)
    }

    async fn delete(&self, key: &str) -> RemoteResult<bool> {
        let mut conn = self.connection()?;
        let result = redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query_async::<i64>(&mut conn)
            .await;
        self.track(result).map(|removed| removed > 0)
    }

    async fn mget(&self, keys: &[String]) -> RemoteResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection()?;
        let namespaced: Vec<String> = keys.iter().map(|k| self.namespaced(k)).collect();
        let result = redis::cmd("MGET")
            .arg(&namespaced)
            .query_async::<Vec<Option<String>>>(&mut conn)
            .await;
        self.track(result)
    }

    async fn clear_namespace(&self) -> RemoteResult<u64> {
        let mut conn = self.connection()?;
        let pattern = format!("{}*", self.key_prefix);
        let mut deleted: u64 = 0;
        let mut cursor: u64 = 0;

        // SCAN para no bloquear el servidor
        loop {
            let scanned = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await;
            let (next_cursor, keys) = self.track(scanned)?;

            if !keys.is_empty() {
                let removed = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<u64>(&mut conn)
                    .await;
                deleted += self.track(removed)?;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, deleted, "🗑️ Namespace remoto limpiado");
        Ok(deleted)
    }

    fn status(&self) -> RemoteStatus {
        RemoteStatus::from(self.status.load(Ordering::Acquire))
    }

    async fn disconnect(&self) {
        if self.connection.lock().take().is_some() {
            self.status.store(RemoteStatus::End as u8, Ordering::Release);
            info!("👋 Conexión a Redis cerrada");
        }
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}

/// Stand-in used when Redis could not be reached at startup
#[derive(Debug, Default)]
pub struct OfflineStore;

impl OfflineStore {
    pub fn new() -> Self {
        warn!("⚠️ Caché remoto en modo offline, solo se usará el caché local");
        Self
    }
}

#[async_trait]
impl RemoteStore for OfflineStore {
    async fn get(&self, _key: &str) -> RemoteResult<Option<String>> {
        Err(RemoteError::Unavailable)
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> RemoteResult<()> {
        Err(RemoteError::Unavailable)
    }

    async fn delete(&self, _key: &str) -> RemoteResult<bool> {
        Err(RemoteError::Unavailable)
    }

    async fn mget(&self, _keys: &[String]) -> RemoteResult<Vec<Option<String>>> {
        Err(RemoteError::Unavailable)
    }

    async fn clear_namespace(&self) -> RemoteResult<u64> {
        Err(RemoteError::Unavailable)
    }

    fn status(&self) -> RemoteStatus {
        RemoteStatus::Offline
    }

    async fn disconnect(&self) {}

    fn provider_name(&self) -> &'static str {
        "offline"
    }
}

/// Oculta la contraseña de una URL de Redis para logs
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };

    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => format!("{}://***@{}", scheme, host),
    }
}
