//! CryptoCompare REST price provider implementation

use crate::{
    constants::{
        COIN_LIST_ENDPOINT, CRYPTOCOMPARE_API_URL, PRICE_ENDPOINT, PRICE_MULTI_ENDPOINT,
        REQUEST_TIMEOUT_SECS, USER_AGENT,
    },
    error::ProviderError,
    provider::{MarketPriceProvider, QuoteMap},
};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Coin list response; only the symbol keys of `Data` are used
#[derive(Debug, Deserialize)]
struct CoinListResponse {
    #[serde(rename = "Data")]
    data: HashMap<String, Value>,
}

/// CryptoCompare price provider
pub struct CryptoCompareProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CryptoCompareProvider {
    /// Creates a new CryptoCompare provider
    pub fn new(api_key: Option<String>) -> Result<Self, ProviderError> {
        Self::with_base_url(CRYPTOCOMPARE_API_URL, api_key)
    }

    /// Creates a provider against a custom base URL
    pub fn with_base_url(base_url: &str, api_key: Option<String>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(ProviderError::NetworkError)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Performs a GET and decodes the JSON body
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, endpoint);
        tracing::debug!(url = %url, "Fetching from CryptoCompare");

        let mut request = self.client.get(&url).query(query);
        if let Some(key) = &self.api_key {
            request = request.query(&[("api_key", key)]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::NetworkError(e)
            }
        })?;

        // Check for rate limiting
        if response.status().as_u16() == 429 {
            return Err(ProviderError::RateLimitExceeded);
        }

        if !response.status().is_success() {
            return Err(ProviderError::ApiError(format!(
                "HTTP {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        let response_text = response.text().await.map_err(ProviderError::NetworkError)?;
        let body: Value = serde_json::from_str(&response_text).map_err(|e| {
            ProviderError::InvalidResponse(format!(
                "Failed to parse CryptoCompare response: {}. Response: {}",
                e, response_text
            ))
        })?;

        check_api_error(&body)?;

        serde_json::from_value(body).map_err(|e| {
            ProviderError::InvalidResponse(format!("Unexpected CryptoCompare payload: {}", e))
        })
    }
}

/// CryptoCompare reports failures as `{"Response":"Error","Message":...}`
/// with a 200 status
fn check_api_error(body: &Value) -> Result<(), ProviderError> {
    if body.get("Response").and_then(Value::as_str) == Some("Error") {
        let message = body
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(ProviderError::ApiError(message.to_string()));
    }
    Ok(())
}

/// Picks the requested quotes out of a `{"USD": 1.0, ...}` object
fn parse_quotes(prices: &HashMap<String, Value>, quotes: &[&str]) -> QuoteMap {
    quotes
        .iter()
        .map(|quote| {
            let quote = quote.to_uppercase();
            let price = prices.get(&quote).and_then(Value::as_f64);
            (quote, price)
        })
        .collect()
}

fn join_upper(items: &[&str]) -> String {
    items
        .iter()
        .map(|s| s.to_uppercase())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl MarketPriceProvider for CryptoCompareProvider {
    async fn fetch_price(&self, symbol: &str, quotes: &[&str]) -> Result<QuoteMap, ProviderError> {
        if quotes.is_empty() {
            return Ok(QuoteMap::new());
        }

        let prices: HashMap<String, Value> = self
            .get_json(
                PRICE_ENDPOINT,
                &[
                    ("fsym", symbol.to_uppercase()),
                    ("tsyms", join_upper(quotes)),
                ],
            )
            .await?;

        Ok(parse_quotes(&prices, quotes))
    }

    async fn fetch_prices(
        &self,
        symbols: &[&str],
        quotes: &[&str],
    ) -> Result<HashMap<String, QuoteMap>, ProviderError> {
        if symbols.is_empty() || quotes.is_empty() {
            return Ok(HashMap::new());
        }

        let response: HashMap<String, HashMap<String, Value>> = self
            .get_json(
                PRICE_MULTI_ENDPOINT,
                &[("fsyms", join_upper(symbols)), ("tsyms", join_upper(quotes))],
            )
            .await?;

        let empty = HashMap::new();
        let result: HashMap<String, QuoteMap> = symbols
            .iter()
            .map(|symbol| {
                let symbol = symbol.to_uppercase();
                let prices = response.get(&symbol).unwrap_or(&empty);
                let quotes = parse_quotes(prices, quotes);
                (symbol, quotes)
            })
            .collect();

        tracing::debug!(count = result.len(), "Fetched prices from CryptoCompare");

        Ok(result)
    }

    async fn fetch_coin_list(&self) -> Result<Vec<String>, ProviderError> {
        let response: CoinListResponse = self
            .get_json(COIN_LIST_ENDPOINT, &[("summary", "true".to_string())])
            .await?;

        let mut coins: Vec<String> = response.data.into_keys().collect();
        coins.sort();
        Ok(coins)
    }

    fn provider_name(&self) -> &'static str {
        "cryptocompare"
    }
}
