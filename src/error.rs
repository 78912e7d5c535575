//! Error types for the price stream

use thiserror::Error;

/// Errors that can occur when fetching prices from a REST provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network request failed
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Invalid response from provider
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Symbol not priced by this provider
    #[error("Symbol not supported: {0}")]
    UnsupportedSymbol(String),

    /// Provider API error
    #[error("Provider API error: {0}")]
    ApiError(String),

    /// Timeout waiting for response
    #[error("Request timeout")]
    Timeout,
}

/// Errors raised by the streaming core and the `PriceStream` handle
#[derive(Debug, Error)]
pub enum StreamError {
    /// The socket is not open and the message cannot be transmitted
    #[error("Connection is not open")]
    NotConnected,

    /// The stream has been closed and no longer accepts commands
    #[error("Price stream is closed")]
    Closed,

    /// An inbound frame could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A wire subscription key did not have the expected shape
    #[error("Invalid subscription key: {0}")]
    InvalidSubscriptionKey(String),

    /// A `StreamConfig` value cannot be used
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The websocket transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Encoding an outbound message failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The REST provider backing the cross rate could not be built
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Errors raised when opening a persisted store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be read
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file does not hold a JSON object of the expected values
    #[error("Store file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StreamError {
    /// Creates a MalformedFrame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Creates a Transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
