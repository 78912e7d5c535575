//! Provider abstraction for REST price lookups

use crate::error::ProviderError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Prices of one symbol keyed by quote currency; `None` when the provider
/// did not price that quote
pub type QuoteMap = HashMap<String, Option<f64>>;

/// Trait for REST price providers
///
/// The streaming core only needs `fetch_price` (for the cross rate); the
/// remaining lookups are exposed for callers that seed their views before the
/// first tick arrives.
#[async_trait]
pub trait MarketPriceProvider: Send + Sync {
    /// Fetches the current price of `symbol` in each of `quotes`
    ///
    /// # Arguments
    /// * `symbol` - Symbol to price, e.g. `"ETH"`
    /// * `quotes` - Quote currencies, e.g. `["USD", "BTC"]`
    ///
    /// # Returns
    /// One entry per requested quote, `None` for quotes the provider omitted
    async fn fetch_price(&self, symbol: &str, quotes: &[&str]) -> Result<QuoteMap, ProviderError>;

    /// Fetches prices for multiple symbols in a single request
    ///
    /// # Returns
    /// HashMap of upper-cased symbol to its quote map
    async fn fetch_prices(
        &self,
        symbols: &[&str],
        quotes: &[&str],
    ) -> Result<HashMap<String, QuoteMap>, ProviderError>;

    /// Fetches every symbol the provider knows about
    async fn fetch_coin_list(&self) -> Result<Vec<String>, ProviderError>;

    /// Returns the name of this provider
    fn provider_name(&self) -> &'static str;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Mock provider for testing
    #[derive(Default)]
    pub struct MockProvider {
        prices: Arc<Mutex<HashMap<String, HashMap<String, f64>>>>,
        failures: Arc<Mutex<HashMap<String, String>>>,
        call_count: Arc<Mutex<usize>>,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_price(&self, symbol: &str, quote: &str, price: f64) {
            self.failures.lock().unwrap().remove(&symbol.to_uppercase());
            self.prices
                .lock()
                .unwrap()
                .entry(symbol.to_uppercase())
                .or_default()
                .insert(quote.to_uppercase(), price);
        }

        pub fn set_error(&self, symbol: &str, message: &str) {
            self.failures
                .lock()
                .unwrap()
                .insert(symbol.to_uppercase(), message.to_string());
        }

        pub fn call_count(&self) -> usize {
            *self.call_count.lock().unwrap()
        }
    }

    #[async_trait]
    impl MarketPriceProvider for MockProvider {
        async fn fetch_price(
            &self,
            symbol: &str,
            quotes: &[&str],
        ) -> Result<QuoteMap, ProviderError> {
            *self.call_count.lock().unwrap() += 1;
            let symbol = symbol.to_uppercase();

            if let Some(message) = self.failures.lock().unwrap().get(&symbol) {
                return Err(ProviderError::ApiError(message.clone()));
            }

            let prices = self.prices.lock().unwrap();
            let known = prices
                .get(&symbol)
                .ok_or_else(|| ProviderError::UnsupportedSymbol(symbol.clone()))?;

            Ok(quotes
                .iter()
                .map(|q| (q.to_uppercase(), known.get(&q.to_uppercase()).copied()))
                .collect())
        }

        async fn fetch_prices(
            &self,
            symbols: &[&str],
            quotes: &[&str],
        ) -> Result<HashMap<String, QuoteMap>, ProviderError> {
            let mut result = HashMap::new();
            for symbol in symbols {
                if let Ok(prices) = self.fetch_price(symbol, quotes).await {
                    result.insert(symbol.to_uppercase(), prices);
                }
            }
            Ok(result)
        }

        async fn fetch_coin_list(&self) -> Result<Vec<String>, ProviderError> {
            let mut coins: Vec<String> = self.prices.lock().unwrap().keys().cloned().collect();
            coins.sort();
            Ok(coins)
        }

        fn provider_name(&self) -> &'static str {
            "mock"
        }
    }
}
