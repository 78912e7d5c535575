//! # Price Stream SDK
//!
//! Streams live cryptocurrency prices from the CryptoCompare aggregate index
//! (CCCAGG) over a websocket and hands them to per-symbol callbacks.
//!
//! ## How prices are resolved
//!
//! Each symbol is first subscribed against USD. If the feed rejects the USD
//! pair, the symbol is retried once against BTC and the BTC-quoted prices are
//! converted back to USD with a USD/BTC cross rate refreshed from the REST API.
//! A symbol rejected in both forms delivers [`PriceUpdate::InvalidCoin`].
//!
//! ## Sharing one connection
//!
//! Several contexts can share one upstream connection through a
//! [`BroadcastChannel`]: one context owns the connection and relays prices,
//! the others follow.
//!
//! ```no_run
//! use price_stream_sdk::{BroadcastChannel, PriceStream, PriceUpdate, StreamConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = BroadcastChannel::default();
//! let owner = PriceStream::connect_shared(StreamConfig::from_env(), &channel)?;
//! let follower = PriceStream::follow(&channel);
//!
//! let (handle, mut updates) = follower.subscribe_channel("eth")?;
//! while let Some(update) = updates.recv().await {
//!     match update {
//!         PriceUpdate::Price(price) => println!("ETH: ${:.2}", price),
//!         PriceUpdate::InvalidCoin => break,
//!     }
//! }
//!
//! follower.unsubscribe(&handle).await?;
//! owner.close().await;
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod constants;
pub mod corrector;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod socket;
pub mod store;
pub mod stream;
pub mod types;

// Re-export commonly used types
pub use broadcast::{BroadcastChannel, BroadcastEnvelope, BroadcastSynchronizer, EnvelopeKind};
pub use config::StreamConfig;
pub use connection::{ConnectionManager, Transport};
pub use corrector::CrossRateCorrector;
pub use error::{ProviderError, StoreError, StreamError};
pub use metrics::MetricsSnapshot;
pub use provider::MarketPriceProvider;
pub use providers::CryptoCompareProvider;
pub use registry::{FallbackState, FrameOutcome, SubscriptionRegistry};
pub use store::{FileStore, KeyValuePair, KeyValueStore, MemoryStore};
pub use stream::PriceStream;
pub use types::{
    ComponentHealth, ConnectionState, ContextRole, HealthStatus, PriceUpdate, StreamStatus,
    SubscriberId, SubscriptionHandle, SubscriptionKey,
};
