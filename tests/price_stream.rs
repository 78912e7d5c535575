//! End-to-end tests against a local websocket feed

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use price_stream_sdk::{
    provider::QuoteMap,
    types::{ControlMessage, SubAction},
    BroadcastChannel, ConnectionState, HealthStatus, MarketPriceProvider, PriceStream,
    PriceUpdate, ProviderError, StreamConfig, StreamStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// 1 USD = 0.0000125 BTC, i.e. BTC at 80,000 USD
const USD_IN_BTC: f64 = 0.0000125;

struct StaticRateProvider;

#[async_trait]
impl MarketPriceProvider for StaticRateProvider {
    async fn fetch_price(&self, _symbol: &str, quotes: &[&str]) -> Result<QuoteMap, ProviderError> {
        Ok(quotes
            .iter()
            .map(|quote| (quote.to_string(), Some(USD_IN_BTC)))
            .collect())
    }

    async fn fetch_prices(
        &self,
        symbols: &[&str],
        quotes: &[&str],
    ) -> Result<HashMap<String, QuoteMap>, ProviderError> {
        let mut prices = HashMap::new();
        for symbol in symbols {
            prices.insert(symbol.to_uppercase(), self.fetch_price(symbol, quotes).await?);
        }
        Ok(prices)
    }

    async fn fetch_coin_list(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["BTC".to_string(), "DOGE".to_string()])
    }

    fn provider_name(&self) -> &'static str {
        "static"
    }
}

/// Frames the fake feed answers a SubAdd with
fn feed_reply(key: &str) -> Option<String> {
    let reply = match key {
        "5~CCCAGG~BTC~USD" => r#"{"TYPE":"5","MARKET":"CCCAGG","FROMSYMBOL":"BTC","TOSYMBOL":"USD","FLAGS":1,"PRICE":67000.5}"#.to_string(),
        "5~CCCAGG~DOGE~BTC" => r#"{"TYPE":"5","MARKET":"CCCAGG","FROMSYMBOL":"DOGE","TOSYMBOL":"BTC","FLAGS":2,"PRICE":0.0000025}"#.to_string(),
        "5~CCCAGG~DOGE~USD" | "5~CCCAGG~ETH~USD" | "5~CCCAGG~ETH~BTC" => {
            format!(r#"{{"TYPE":"500","MESSAGE":"INVALID_SUB","PARAMETER":"{}","INFO":"Invalid subscription"}}"#, key)
        }
        _ => return None,
    };
    Some(reply)
}

/// Starts a one-connection feed; returns its URL and the control messages it receives
async fn spawn_feed() -> (String, mpsc::UnboundedReceiver<ControlMessage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let ws = accept_async(socket).await.unwrap();
        let (mut write, mut read) = ws.split();

        write
            .send(Message::Text(r#"{"TYPE":"20","MESSAGE":"STREAMERWELCOME"}"#.into()))
            .await
            .unwrap();

        while let Some(Ok(message)) = read.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let control: ControlMessage = serde_json::from_str(text.as_str()).unwrap();
            if control.action == SubAction::SubAdd {
                for key in &control.subs {
                    if let Some(reply) = feed_reply(key) {
                        if write.send(Message::Text(reply.into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = seen_tx.send(control);
        }
    });

    (format!("ws://{}", addr), seen_rx)
}

fn config(url: &str) -> StreamConfig {
    StreamConfig::default()
        .with_ws_url(url)
        .with_rate_refresh_interval(Duration::from_millis(50))
}

async fn next_update(updates: &mut mpsc::UnboundedReceiver<PriceUpdate>) -> PriceUpdate {
    tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("no update within 5s")
        .expect("update channel closed")
}

async fn next_control(seen: &mut mpsc::UnboundedReceiver<ControlMessage>) -> ControlMessage {
    tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("no control message within 5s")
        .expect("feed stopped")
}

async fn wait_until(stream: &PriceStream, check: impl Fn(&StreamStatus) -> bool) -> StreamStatus {
    for _ in 0..250 {
        let status = stream.status().await.unwrap();
        if check(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("stream never reached the expected state");
}

#[tokio::test]
async fn test_usd_ticks_fan_out_to_every_subscriber() {
    let (url, mut seen) = spawn_feed().await;
    let stream = PriceStream::with_provider(config(&url), Arc::new(StaticRateProvider)).unwrap();

    let (_first, mut first_rx) = stream.subscribe_channel("btc").unwrap();
    let (_second, mut second_rx) = stream.subscribe_channel("BTC").unwrap();

    assert_eq!(next_update(&mut first_rx).await, PriceUpdate::Price(67000.5));
    assert_eq!(next_update(&mut second_rx).await, PriceUpdate::Price(67000.5));

    // Both subscribers share one wire subscription.
    let add = next_control(&mut seen).await;
    assert_eq!(add.action, SubAction::SubAdd);
    assert_eq!(add.subs, vec!["5~CCCAGG~BTC~USD"]);

    let status = stream.status().await.unwrap();
    assert_eq!(status.connection, Some(ConnectionState::Open));
    assert_eq!(status.active_keys, vec!["5~CCCAGG~BTC~USD"]);
    assert_eq!(status.subscribers, 2);

    stream.close().await;
    let remove = next_control(&mut seen).await;
    assert_eq!(remove.action, SubAction::SubRemove);
    assert_eq!(remove.subs, vec!["5~CCCAGG~BTC~USD"]);
}

#[tokio::test]
async fn test_symbol_rejected_twice_reports_invalid_coin() {
    let (url, mut seen) = spawn_feed().await;
    let stream = PriceStream::with_provider(config(&url), Arc::new(StaticRateProvider)).unwrap();

    let (_handle, mut updates) = stream.subscribe_channel("eth").unwrap();
    assert_eq!(next_update(&mut updates).await, PriceUpdate::InvalidCoin);

    let first = next_control(&mut seen).await;
    let retry = next_control(&mut seen).await;
    assert_eq!(first.subs, vec!["5~CCCAGG~ETH~USD"]);
    assert_eq!(retry.action, SubAction::SubAdd);
    assert_eq!(retry.subs, vec!["5~CCCAGG~ETH~BTC"]);

    // No third attempt.
    let status = wait_until(&stream, |s| s.metrics.invalid_notices == 2).await;
    assert_eq!(status.metrics.fallback_retries, 1);
    assert!(status.active_keys.is_empty());

    // Late subscribers learn about the rejection at once.
    let (_late, mut late_updates) = stream.subscribe_channel("eth").unwrap();
    assert_eq!(next_update(&mut late_updates).await, PriceUpdate::InvalidCoin);

    stream.close().await;
}

#[tokio::test]
async fn test_btc_quoted_ticks_are_converted_to_usd() {
    let (url, _seen) = spawn_feed().await;
    let stream = PriceStream::with_provider(config(&url), Arc::new(StaticRateProvider)).unwrap();

    let status = wait_until(&stream, |s| {
        s.cross_rate.is_some() && s.connection == Some(ConnectionState::Open)
    })
    .await;
    assert_eq!(status.cross_rate, Some(USD_IN_BTC));
    assert!(status.metrics.rate_refreshes >= 1);

    let health = stream.health_check().await;
    assert_eq!(health.status, HealthStatus::Healthy);

    let (_handle, mut updates) = stream.subscribe_channel("doge").unwrap();
    let price = next_update(&mut updates)
        .await
        .price()
        .expect("expected a price");
    assert!((price - 0.2).abs() < 1e-9, "unexpected price {}", price);

    stream.close().await;
    let health = stream.health_check().await;
    assert_eq!(health.status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_follower_receives_prices_through_shared_owner() {
    let (url, mut seen) = spawn_feed().await;
    let channel = BroadcastChannel::default();
    let owner =
        PriceStream::shared_with_provider(config(&url), Arc::new(StaticRateProvider), &channel)
            .unwrap();
    let follower = PriceStream::follow(&channel);

    let (handle, mut updates) = follower.subscribe_channel("btc").unwrap();
    assert_eq!(next_update(&mut updates).await, PriceUpdate::Price(67000.5));

    let add = next_control(&mut seen).await;
    assert_eq!(add.subs, vec!["5~CCCAGG~BTC~USD"]);

    // The owner keeps the wire subscription while the follower needs it.
    let status = owner.status().await.unwrap();
    assert_eq!(status.active_keys, vec!["5~CCCAGG~BTC~USD"]);

    assert!(follower.unsubscribe(&handle).await.unwrap());
    let remove = next_control(&mut seen).await;
    assert_eq!(remove.action, SubAction::SubRemove);
    assert_eq!(remove.subs, vec!["5~CCCAGG~BTC~USD"]);

    follower.close().await;
    owner.close().await;
}

#[tokio::test]
async fn test_invalid_symbols_are_refused() {
    let channel = BroadcastChannel::default();
    let follower = PriceStream::follow(&channel);
    assert!(follower.subscribe("", |_| {}).is_err());
    assert!(follower.subscribe("5~CCCAGG~BTC~USD", |_| {}).is_err());
    follower.close().await;
}
