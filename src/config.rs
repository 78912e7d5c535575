//! Runtime configuration for a price stream

use crate::{
    constants::{
        API_KEY_ENV, RATE_REFRESH_INTERVAL_MS, RATE_STALE_THRESHOLD_SECS, STREAMER_WS_URL,
        WS_URL_ENV,
    },
    error::StreamError,
};
use reqwest::Url;
use std::time::Duration;

/// Settings of an owner context
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Streaming endpoint
    pub ws_url: String,
    /// API key appended to the endpoint as `api_key`
    pub api_key: Option<String>,
    /// Period of the cross-rate refresh
    pub rate_refresh_interval: Duration,
    /// Age after which the cross rate is no longer applied
    pub rate_stale_after: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: STREAMER_WS_URL.to_string(),
            api_key: None,
            rate_refresh_interval: Duration::from_millis(RATE_REFRESH_INTERVAL_MS),
            rate_stale_after: Duration::from_secs(RATE_STALE_THRESHOLD_SECS),
        }
    }
}

impl StreamConfig {
    /// Defaults overridden by `CRYPTOCOMPARE_API_KEY` and `PRICE_STREAM_WS_URL`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(WS_URL_ENV) {
            config.ws_url = url;
        }
        config.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        config
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_rate_refresh_interval(mut self, interval: Duration) -> Self {
        self.rate_refresh_interval = interval;
        self
    }

    /// Full endpoint URL including the API key
    pub fn stream_url(&self) -> Result<String, StreamError> {
        let mut url = Url::parse(&self.ws_url)
            .map_err(|e| StreamError::InvalidConfig(format!("stream url {}: {}", self.ws_url, e)))?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("api_key", key);
        }
        Ok(url.to_string())
    }
}
