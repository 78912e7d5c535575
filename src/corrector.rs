//! USD/BTC cross-rate correction
//!
//! The feed does not carry a direct USD pair for every symbol. Those symbols
//! are streamed against BTC instead and the corrector converts the BTC price
//! back to USD with a periodically refreshed rate.

use crate::{
    constants::{CROSS_QUOTE, DEFAULT_QUOTE, MIN_RATE_REFRESH_INTERVAL_MS, RATE_STALE_THRESHOLD_SECS},
    error::ProviderError,
    provider::{MarketPriceProvider, QuoteMap},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Pair the cached rate is quoted in: BTC per one USD
pub const RATE_PAIR: &str = "USD/BTC";

/// Last known cross rate
#[derive(Debug, Clone, Default)]
pub struct RateCache {
    value: Option<f64>,
    last_updated: Option<DateTime<Utc>>,
}

impl RateCache {
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// True when there is no value or it is older than `threshold`
    pub fn is_stale(&self, threshold: Duration) -> bool {
        match self.last_updated {
            Some(updated) => {
                let age = Utc::now().signed_duration_since(updated);
                age.num_milliseconds() > threshold.as_millis() as i64
            }
            None => true,
        }
    }
}

/// Converts BTC-quoted prices into USD
#[derive(Debug)]
pub struct CrossRateCorrector {
    cache: RateCache,
    stale_after: Duration,
}

impl Default for CrossRateCorrector {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossRateCorrector {
    pub fn new() -> Self {
        Self::with_stale_after(Duration::from_secs(RATE_STALE_THRESHOLD_SECS))
    }

    /// Creates a corrector that stops using a rate older than `stale_after`
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            cache: RateCache::default(),
            stale_after,
        }
    }

    pub fn cache(&self) -> &RateCache {
        &self.cache
    }

    /// The cached rate, if present and fresh
    pub fn rate(&self) -> Option<f64> {
        if self.cache.is_stale(self.stale_after) {
            None
        } else {
            self.cache.value
        }
    }

    /// Stores a new rate; non-positive or non-finite values are rejected
    pub fn set_rate(&mut self, rate: f64) -> bool {
        if !rate.is_finite() || rate <= 0.0 {
            tracing::warn!(pair = RATE_PAIR, rate, "Ignoring unusable cross rate");
            return false;
        }
        self.cache.value = Some(rate);
        self.cache.last_updated = Some(Utc::now());
        true
    }

    /// Applies the outcome of a rate lookup
    ///
    /// On any failure the previous rate is kept. Returns true if a new rate
    /// was stored.
    pub fn apply_refresh(&mut self, result: Result<QuoteMap, ProviderError>) -> bool {
        match result {
            Ok(quotes) => match quotes.get(CROSS_QUOTE).copied().flatten() {
                Some(rate) => {
                    let stored = self.set_rate(rate);
                    if stored {
                        tracing::debug!(pair = RATE_PAIR, rate, "Cross rate refreshed");
                    }
                    stored
                }
                None => {
                    tracing::warn!(pair = RATE_PAIR, "Cross rate missing from response, keeping last value");
                    false
                }
            },
            Err(e) => {
                tracing::warn!(pair = RATE_PAIR, error = %e, "Cross rate refresh failed, keeping last value");
                false
            }
        }
    }

    /// Fetches and applies the rate in one step
    pub async fn refresh(&mut self, provider: &dyn MarketPriceProvider) -> bool {
        let result = fetch_cross_rate(provider).await;
        self.apply_refresh(result)
    }

    /// Converts a price quoted in `to_symbol` into USD when it is BTC-quoted
    /// and a fresh rate is known; otherwise returns it unchanged
    pub fn correct(&self, price: f64, to_symbol: &str) -> f64 {
        if !to_symbol.eq_ignore_ascii_case(CROSS_QUOTE) {
            return price;
        }
        match self.rate() {
            Some(rate) => price / rate,
            None => price,
        }
    }
}

/// Looks up USD priced in BTC
pub async fn fetch_cross_rate(
    provider: &dyn MarketPriceProvider,
) -> Result<QuoteMap, ProviderError> {
    provider.fetch_price(DEFAULT_QUOTE, &[CROSS_QUOTE]).await
}

/// Result of one scheduled rate lookup
#[derive(Debug)]
pub struct RateFetch {
    pub result: Result<QuoteMap, ProviderError>,
    pub elapsed: Duration,
}

/// Periodic rate lookup task, aborted when the guard is dropped
///
/// The first lookup runs immediately. Results are sent to the owner instead of
/// being applied here so the cache is only ever touched by the event loop.
/// Periods shorter than `MIN_RATE_REFRESH_INTERVAL_MS` are raised to it.
pub struct RateRefresher {
    handle: JoinHandle<()>,
}

impl RateRefresher {
    pub fn spawn(
        provider: Arc<dyn MarketPriceProvider>,
        period: Duration,
        results: mpsc::UnboundedSender<RateFetch>,
    ) -> Self {
        let period = clamp_period(period);
        let handle = tokio::spawn(async move {
            tracing::info!(
                provider = provider.provider_name(),
                refresh_interval_ms = period.as_millis() as u64,
                "Starting cross rate refresh task"
            );

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let start = Instant::now();
                let result = fetch_cross_rate(provider.as_ref()).await;
                let fetch = RateFetch {
                    result,
                    elapsed: start.elapsed(),
                };
                if results.send(fetch).is_err() {
                    break;
                }
            }
        });

        Self { handle }
    }
}

/// `tokio::time::interval` panics on a zero period
fn clamp_period(period: Duration) -> Duration {
    let min = Duration::from_millis(MIN_RATE_REFRESH_INTERVAL_MS);
    if period < min {
        tracing::warn!(
            requested_ms = period.as_millis() as u64,
            min_ms = MIN_RATE_REFRESH_INTERVAL_MS,
            "Cross rate refresh interval too short, using minimum"
        );
        return min;
    }
    period
}

impl Drop for RateRefresher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
