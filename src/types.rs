//! Types for the price stream

use crate::{
    constants::{AGGREGATE_INDEX, AGGREGATE_MARKET, CROSS_QUOTE},
    error::StreamError,
    metrics::MetricsSnapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Value delivered to subscribers
///
/// A subscriber either receives a price or the `InvalidCoin` sentinel once the
/// feed has rejected the symbol in every quote currency that was tried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceUpdate {
    /// Price in the requested quote currency
    Price(f64),
    /// The symbol is not supported by the feed
    InvalidCoin,
}

impl PriceUpdate {
    /// Returns the price, if this is not the invalid sentinel
    pub fn price(&self) -> Option<f64> {
        match self {
            PriceUpdate::Price(price) => Some(*price),
            PriceUpdate::InvalidCoin => None,
        }
    }

    /// Returns true for the invalid-coin sentinel
    pub fn is_invalid(&self) -> bool {
        matches!(self, PriceUpdate::InvalidCoin)
    }
}

/// Callback invoked for every update of a subscribed symbol
pub type PriceCallback = Arc<dyn Fn(PriceUpdate) + Send + Sync>;

/// Identity of a single subscriber callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Creates a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle returned by `PriceStream::subscribe`, used to unsubscribe later
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriberId,
    symbol: String,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubscriberId, symbol: String) -> Self {
        Self { id, symbol }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

/// Wire-level subscription key, `5~CCCAGG~{SYMBOL}~{QUOTE}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    symbol: String,
    quote: String,
}

impl SubscriptionKey {
    /// Creates a key; symbol and quote are upper-cased
    pub fn new(symbol: &str, quote: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            quote: quote.to_uppercase(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// True when the pair is already quoted in the cross currency
    pub fn is_cross(&self) -> bool {
        self.quote == CROSS_QUOTE
    }

    /// Same symbol quoted in another currency
    pub fn with_quote(&self, quote: &str) -> Self {
        Self::new(&self.symbol, quote)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}~{}~{}~{}",
            AGGREGATE_INDEX, AGGREGATE_MARKET, self.symbol, self.quote
        )
    }
}

impl FromStr for SubscriptionKey {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('~').collect();
        match parts.as_slice() {
            [kind, market, symbol, quote]
                if *kind == AGGREGATE_INDEX
                    && *market == AGGREGATE_MARKET
                    && !symbol.is_empty()
                    && !quote.is_empty() =>
            {
                Ok(Self::new(symbol, quote))
            }
            _ => Err(StreamError::InvalidSubscriptionKey(s.to_string())),
        }
    }
}

/// Subscription control action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubAction {
    SubAdd,
    SubRemove,
}

/// Outbound subscription control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: SubAction,
    pub subs: Vec<String>,
}

impl ControlMessage {
    /// Builds a `SubAdd` for the given keys
    pub fn add<'a>(keys: impl IntoIterator<Item = &'a SubscriptionKey>) -> Self {
        Self {
            action: SubAction::SubAdd,
            subs: keys.into_iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Builds a `SubRemove` for the given keys
    pub fn remove<'a>(keys: impl IntoIterator<Item = &'a SubscriptionKey>) -> Self {
        Self {
            action: SubAction::SubRemove,
            subs: keys.into_iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, StreamError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decoded inbound event the core reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Aggregate-index tick
    Tick {
        from_symbol: String,
        to_symbol: String,
        price: Option<f64>,
        flags: Option<u64>,
    },
    /// The feed rejected a subscription
    InvalidSubscription { key: SubscriptionKey },
}

/// Lifecycle of the streaming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Whether a context holds the connection or follows another context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    Owner,
    Follower,
}

/// Point-in-time view of a `PriceStream`
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    /// Id of this context on the broadcast channel
    pub context_id: Uuid,
    /// Owner or follower
    pub role: ContextRole,
    /// Connection state, `None` for followers
    pub connection: Option<ConnectionState>,
    /// Wire keys currently subscribed upstream
    pub active_keys: Vec<String>,
    /// Number of subscriber callbacks registered in this context
    pub subscribers: usize,
    /// Cached USD/BTC rate
    pub cross_rate: Option<f64>,
    /// When the cross rate was last refreshed
    pub cross_rate_updated: Option<DateTime<Utc>>,
    /// Stream counters
    pub metrics: MetricsSnapshot,
}

/// Overall system health status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// System is healthy and all components are operational
    Healthy,
    /// System is degraded but still functional
    Degraded,
    /// System is unhealthy and requires attention
    Unhealthy,
}

/// Component health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Optional status message
    pub message: Option<String>,
    /// Component-specific details
    pub details: std::collections::HashMap<String, serde_json::Value>,
    /// Last checked timestamp
    pub last_checked: DateTime<Utc>,
}
