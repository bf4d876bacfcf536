//! Error types for Stratum v1 protocol.

use thiserror::Error;

use crate::types::Extranonce2;

/// Stratum protocol errors.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Line from the pool could not be parsed
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// TCP connect failed (refused, unreachable, DNS)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Subscription failed
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Pool refused the worker credentials
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Pool reported the session as unmanaged or desynchronized
    #[error("Session unmanaged by pool: {0}")]
    Unmanaged(String),

    /// Pool asked us to reconnect (`client.reconnect`)
    #[error("Pool requested reconnect")]
    PoolReconnect,

    /// Pool assigned an extranonce2 wider than the hash engine can roll
    #[error("Unsupported extranonce2 size: {0} bytes (max {max})", max = Extranonce2::MAX_SIZE)]
    UnsupportedExtranonce2Size(usize),

    /// Reconnect attempts exhausted
    #[error("Gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Unexpected response (wrong ID, missing fields, etc.)
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid URL format
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Connection lost
    #[error("Connection lost")]
    Disconnected,

    /// Timeout waiting for connect, response, or any inbound traffic
    #[error("Timeout: {0}")]
    Timeout(&'static str),
}

impl StratumError {
    /// Whether the session should be retried through the backoff loop.
    ///
    /// Authorization failures, bad URLs, an unusable extranonce2 width and
    /// exhausted retries are final.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            StratumError::AuthorizationFailed(_)
                | StratumError::InvalidUrl(_)
                | StratumError::UnsupportedExtranonce2Size(_)
                | StratumError::ReconnectExhausted { .. }
        )
    }
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;
