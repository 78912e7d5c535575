//! Constants for the price stream
//!
//! Default settings for the stream are centralized here. `StreamConfig`
//! starts from these values and only the endpoint and API key can be
//! overridden from the environment.

/// CryptoCompare streaming endpoint
pub const STREAMER_WS_URL: &str = "wss://streamer.cryptocompare.com/v2";

/// CryptoCompare REST API base URL
pub const CRYPTOCOMPARE_API_URL: &str = "https://min-api.cryptocompare.com";

/// Single symbol price endpoint
pub const PRICE_ENDPOINT: &str = "/data/price";

/// Multiple symbol price endpoint
pub const PRICE_MULTI_ENDPOINT: &str = "/data/pricemulti";

/// Coin list endpoint
pub const COIN_LIST_ENDPOINT: &str = "/data/all/coinlist";

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "CRYPTOCOMPARE_API_KEY";

/// Environment variable overriding the streaming endpoint
pub const WS_URL_ENV: &str = "PRICE_STREAM_WS_URL";

/// HTTP request timeout when fetching prices (in seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// User agent for HTTP requests
pub const USER_AGENT: &str = "price-stream-sdk/0.1.0";

/// Wire message type of an aggregate-index tick
pub const AGGREGATE_INDEX: &str = "5";

/// Wire message type of an invalid-subscription notice
pub const INVALID_SUBSCRIPTION: &str = "500";

/// Aggregate index market name used in subscription keys
pub const AGGREGATE_MARKET: &str = "CCCAGG";

/// Quote currency used when a subscriber does not pick one
pub const DEFAULT_QUOTE: &str = "USD";

/// Quote currency used for the cross-rate fallback
pub const CROSS_QUOTE: &str = "BTC";

/// How often the USD/BTC cross rate is refreshed (in milliseconds)
pub const RATE_REFRESH_INTERVAL_MS: u64 = 15_000;

/// Shortest accepted cross-rate refresh period (in milliseconds)
pub const MIN_RATE_REFRESH_INTERVAL_MS: u64 = 10;

/// How long a cached cross rate stays usable (in seconds)
pub const RATE_STALE_THRESHOLD_SECS: u64 = 300;

/// Capacity of the cross-context broadcast channel
pub const BROADCAST_CAPACITY: usize = 1024;
