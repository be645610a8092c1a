//! Error types for the cache and remote layers.
//!
//! Cache-layer failures never reach command handlers: remote errors are
//! absorbed by the [`CircuitBreaker`](crate::cache::CircuitBreaker) and only
//! configuration mistakes surface, at construction time.

use std::time::Duration;
use thiserror::Error;

/// Errores de construcción y uso del caché
#[derive(Debug, Error)]
pub enum CacheError {
    /// Configuration rejected by `validate()`
    #[error("Configuración inválida: {0}")]
    InvalidConfig(String),

    /// A value could not be encoded for the remote tier
    #[error("Error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errores del cliente remoto (Redis)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Error de conexión: {0}")]
    Connection(String),

    #[error("Operación remota excedió {0:?}")]
    Timeout(Duration),

    #[error("Error del backend: {0}")]
    Backend(String),

    /// No remote client is available (offline mode or after disconnect)
    #[error("Caché remoto no disponible")]
    Unavailable,
}

pub type CacheResult<T> = Result<T, CacheError>;
pub type RemoteResult<T> = Result<T, RemoteError>;

impl From<redis::RedisError> for RemoteError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout(Duration::ZERO)
        } else if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            RemoteError::Connection(e.to_string())
        } else {
            RemoteError::Backend(e.to_string())
        }
    }
}
