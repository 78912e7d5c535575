//! Price stream service
//!
//! `PriceStream` is the handle applications use. Every stream runs one
//! background task that owns all mutable state (registry, connection, cross
//! rate, broadcast synchronizer, metrics) and processes commands, socket
//! events, rate refreshes and broadcast envelopes one at a time.

use crate::{
    broadcast::{BroadcastChannel, BroadcastSynchronizer},
    config::StreamConfig,
    connection::ConnectionManager,
    corrector::{CrossRateCorrector, RateFetch, RateRefresher},
    error::StreamError,
    metrics::StreamMetrics,
    provider::MarketPriceProvider,
    providers::CryptoCompareProvider,
    registry::{FrameOutcome, SubscriptionRegistry},
    socket::{self, SocketEvent, WsTransport},
    types::{
        ComponentHealth, ConnectionState, ContextRole, HealthStatus, PriceCallback, PriceUpdate,
        StreamStatus, SubscriberId, SubscriptionHandle,
    },
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

enum Command {
    Subscribe {
        symbol: String,
        id: SubscriberId,
        callback: PriceCallback,
    },
    Unsubscribe {
        symbol: String,
        id: SubscriberId,
        reply: oneshot::Sender<bool>,
    },
    Status(oneshot::Sender<StreamStatus>),
    Close(oneshot::Sender<()>),
}

/// Handle to a running price stream
///
/// Must be created inside a tokio runtime. Cloned handles share the same
/// stream; the stream shuts down on `close()` or when every handle is dropped.
///
/// # Example
/// ```no_run
/// use price_stream_sdk::{PriceStream, PriceUpdate, StreamConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = PriceStream::connect(StreamConfig::from_env())?;
/// let handle = stream.subscribe("btc", |update| match update {
///     PriceUpdate::Price(price) => println!("BTC: ${:.2}", price),
///     PriceUpdate::InvalidCoin => println!("BTC is not supported"),
/// })?;
///
/// stream.unsubscribe(&handle).await?;
/// stream.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PriceStream {
    commands: mpsc::UnboundedSender<Command>,
    context_id: Uuid,
    role: ContextRole,
}

impl PriceStream {
    /// Opens a connection using the CryptoCompare REST API for the cross rate
    pub fn connect(config: StreamConfig) -> Result<Self, StreamError> {
        let provider = Arc::new(CryptoCompareProvider::new(config.api_key.clone())?);
        Self::with_provider(config, provider)
    }

    /// Opens a connection using a custom provider for the cross rate
    pub fn with_provider(
        config: StreamConfig,
        provider: Arc<dyn MarketPriceProvider>,
    ) -> Result<Self, StreamError> {
        Self::spawn_owner(config, provider, None)
    }

    /// Opens a connection and serves other contexts listening on `channel`
    pub fn connect_shared(config: StreamConfig, channel: &BroadcastChannel) -> Result<Self, StreamError> {
        let provider = Arc::new(CryptoCompareProvider::new(config.api_key.clone())?);
        Self::shared_with_provider(config, provider, channel)
    }

    /// Shared owner with a custom provider for the cross rate
    pub fn shared_with_provider(
        config: StreamConfig,
        provider: Arc<dyn MarketPriceProvider>,
        channel: &BroadcastChannel,
    ) -> Result<Self, StreamError> {
        Self::spawn_owner(config, provider, Some(channel))
    }

    /// Joins `channel` without opening a connection
    ///
    /// Prices arrive only while some other context owns a shared connection.
    pub fn follow(channel: &BroadcastChannel) -> Self {
        let sync = BroadcastSynchronizer::new(channel.clone());
        let envelopes = sync.channel().subscribe();
        let context_id = sync.context_id();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let worker = StreamWorker {
            context_id,
            role: ContextRole::Follower,
            registry: None,
            sync: Some(sync),
            metrics: StreamMetrics::new(),
            commands: commands_rx,
            socket_events: None,
            rate_results: None,
            envelopes: Some(envelopes),
            _refresher: None,
        };
        tokio::spawn(worker.run());

        tracing::info!(context = %context_id, "Following shared price stream");

        Self {
            commands: commands_tx,
            context_id,
            role: ContextRole::Follower,
        }
    }

    fn spawn_owner(
        config: StreamConfig,
        provider: Arc<dyn MarketPriceProvider>,
        channel: Option<&BroadcastChannel>,
    ) -> Result<Self, StreamError> {
        let url = config.stream_url()?;

        let sync = channel.map(|c| BroadcastSynchronizer::new(c.clone()));
        let envelopes = sync.as_ref().map(|s| s.channel().subscribe());
        let context_id = sync
            .as_ref()
            .map_or_else(Uuid::new_v4, BroadcastSynchronizer::context_id);

        let (transport, socket_events) = socket::connect(url);
        let registry = SubscriptionRegistry::new(
            ConnectionManager::new(transport),
            CrossRateCorrector::with_stale_after(config.rate_stale_after),
        );

        let (rate_tx, rate_rx) = mpsc::unbounded_channel();
        let refresher = RateRefresher::spawn(provider, config.rate_refresh_interval, rate_tx);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let worker = StreamWorker {
            context_id,
            role: ContextRole::Owner,
            registry: Some(registry),
            sync,
            metrics: StreamMetrics::new(),
            commands: commands_rx,
            socket_events: Some(socket_events),
            rate_results: Some(rate_rx),
            envelopes,
            _refresher: Some(refresher),
        };
        tokio::spawn(worker.run());

        Ok(Self {
            commands: commands_tx,
            context_id,
            role: ContextRole::Owner,
        })
    }

    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    fn send(&self, command: Command) -> Result<(), StreamError> {
        self.commands.send(command).map_err(|_| StreamError::Closed)
    }

    /// Calls `callback` with every update for `symbol`
    ///
    /// Callbacks run on the stream task and must not block. The same price may
    /// be delivered more than once.
    pub fn subscribe<F>(&self, symbol: &str, callback: F) -> Result<SubscriptionHandle, StreamError>
    where
        F: Fn(PriceUpdate) + Send + Sync + 'static,
    {
        let symbol = validate_symbol(symbol)?;
        let id = SubscriberId::new();
        self.send(Command::Subscribe {
            symbol: symbol.clone(),
            id,
            callback: Arc::new(callback),
        })?;
        Ok(SubscriptionHandle::new(id, symbol))
    }

    /// Subscribes and returns the updates as a channel
    pub fn subscribe_channel(
        &self,
        symbol: &str,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<PriceUpdate>), StreamError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(symbol, move |update| {
            let _ = tx.send(update);
        })?;
        Ok((handle, rx))
    }

    /// Removes a subscriber; returns false if it was not registered
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<bool, StreamError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Unsubscribe {
            symbol: handle.symbol().to_string(),
            id: handle.id(),
            reply,
        })?;
        response.await.map_err(|_| StreamError::Closed)
    }

    /// Current state of the stream
    pub async fn status(&self) -> Result<StreamStatus, StreamError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Status(reply))?;
        response.await.map_err(|_| StreamError::Closed)
    }

    /// Unsubscribes everything and closes the connection
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        let (reply, response) = oneshot::channel();
        if self.send(Command::Close(reply)).is_ok() {
            let _ = response.await;
        }
    }

    /// Perform a health check on the stream
    pub async fn health_check(&self) -> ComponentHealth {
        let mut details = HashMap::new();
        details.insert("context_id".to_string(), serde_json::json!(self.context_id));

        let (status, message) = match self.status().await {
            Ok(status) => {
                details.insert("connection".to_string(), serde_json::json!(status.connection));
                details.insert("active_keys".to_string(), serde_json::json!(status.active_keys));
                details.insert("subscribers".to_string(), serde_json::json!(status.subscribers));
                details.insert("cross_rate".to_string(), serde_json::json!(status.cross_rate));
                details.insert("metrics".to_string(), serde_json::json!(status.metrics));
                evaluate_health(&status)
            }
            Err(e) => (HealthStatus::Unhealthy, format!("Price stream unavailable: {}", e)),
        };

        ComponentHealth {
            name: "price_stream".to_string(),
            status,
            message: Some(message),
            details,
            last_checked: chrono::Utc::now(),
        }
    }
}

fn validate_symbol(symbol: &str) -> Result<String, StreamError> {
    let symbol = symbol.trim().to_lowercase();
    if symbol.is_empty() || symbol.contains('~') {
        return Err(StreamError::InvalidSubscriptionKey(symbol));
    }
    Ok(symbol)
}

fn evaluate_health(status: &StreamStatus) -> (HealthStatus, String) {
    match (status.role, status.connection) {
        (ContextRole::Follower, _) => (
            HealthStatus::Healthy,
            "Following a shared price stream".to_string(),
        ),
        (ContextRole::Owner, Some(ConnectionState::Open)) if status.cross_rate.is_some() => (
            HealthStatus::Healthy,
            "Price stream is connected with a fresh cross rate".to_string(),
        ),
        (ContextRole::Owner, Some(ConnectionState::Open)) => (
            HealthStatus::Degraded,
            "Price stream is connected but has no cross rate".to_string(),
        ),
        (ContextRole::Owner, Some(ConnectionState::Connecting)) => (
            HealthStatus::Degraded,
            "Price stream is still connecting".to_string(),
        ),
        (ContextRole::Owner, _) => (
            HealthStatus::Unhealthy,
            "Price stream connection is closed".to_string(),
        ),
    }
}

/// State owned by the stream task
struct StreamWorker {
    context_id: Uuid,
    role: ContextRole,
    registry: Option<SubscriptionRegistry<WsTransport>>,
    sync: Option<BroadcastSynchronizer>,
    metrics: StreamMetrics,
    commands: mpsc::UnboundedReceiver<Command>,
    socket_events: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    rate_results: Option<mpsc::UnboundedReceiver<RateFetch>>,
    envelopes: Option<broadcast::Receiver<String>>,
    _refresher: Option<RateRefresher>,
}

impl StreamWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = recv_or_pending(&mut self.socket_events) => self.handle_socket_event(event),
                Some(fetch) = recv_or_pending(&mut self.rate_results) => self.handle_rate(fetch),
                Some(text) = recv_envelope(&mut self.envelopes) => self.handle_envelope(&text),
            }
        }

        tracing::info!(context = %self.context_id, "Price stream task stopped");
    }

    /// Returns false once the stream has been closed
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Subscribe {
                symbol,
                id,
                callback,
            } => match (self.sync.as_mut(), self.registry.as_mut()) {
                (Some(sync), registry) => sync.subscribe(&symbol, id, callback, registry),
                (None, Some(registry)) => registry.subscribe_with_id(&symbol, id, callback),
                (None, None) => {}
            },
            Command::Unsubscribe { symbol, id, reply } => {
                let removed = match (self.sync.as_mut(), self.registry.as_mut()) {
                    (Some(sync), registry) => sync.unsubscribe(&symbol, id, registry),
                    (None, Some(registry)) => registry.unsubscribe(&symbol, id),
                    (None, None) => false,
                };
                let _ = reply.send(removed);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Close(reply) => {
                self.shutdown();
                self.commands.close();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        let Some(registry) = self.registry.as_mut() else {
            return;
        };

        match event {
            SocketEvent::Opened => registry.on_open(),
            SocketEvent::Closed => registry.on_closed(),
            SocketEvent::Frame(text) => {
                self.metrics.record_frame();
                match registry.handle_frame(&text) {
                    FrameOutcome::Dispatched { .. } => self.metrics.record_tick(),
                    FrameOutcome::Retried { .. } => {
                        self.metrics.record_invalid();
                        self.metrics.record_retry();
                    }
                    FrameOutcome::Rejected { .. } => self.metrics.record_invalid(),
                    FrameOutcome::Dropped => self.metrics.record_dropped(),
                    FrameOutcome::Ignored => {}
                }
            }
        }
    }

    fn handle_rate(&mut self, fetch: RateFetch) {
        let Some(registry) = self.registry.as_mut() else {
            return;
        };
        let stored = registry.corrector_mut().apply_refresh(fetch.result);
        self.metrics.record_refresh(fetch.elapsed, stored);
    }

    fn handle_envelope(&mut self, text: &str) {
        let Some(sync) = self.sync.as_mut() else {
            return;
        };
        if sync.handle_message(text, self.registry.as_mut()).is_some() {
            self.metrics.record_envelope();
        }
    }

    fn status(&self) -> StreamStatus {
        let registry = self.registry.as_ref();
        let local = self.sync.as_ref().map_or(0, BroadcastSynchronizer::local_subscribers);

        StreamStatus {
            context_id: self.context_id,
            role: self.role,
            connection: registry.map(|r| r.connection().state()),
            active_keys: registry
                .map(|r| r.active_keys().iter().map(ToString::to_string).collect())
                .unwrap_or_default(),
            subscribers: registry.map_or(0, SubscriptionRegistry::total_subscribers) + local,
            cross_rate: registry.and_then(|r| r.corrector().rate()),
            cross_rate_updated: registry.and_then(|r| r.corrector().cache().last_updated()),
            metrics: self.metrics.snapshot(),
        }
    }

    fn shutdown(&mut self) {
        tracing::info!(context = %self.context_id, "Closing price stream");
        if let Some(sync) = self.sync.as_mut() {
            sync.release_all();
        }
        if let Some(registry) = self.registry.as_mut() {
            registry.close();
        }
        self._refresher = None;
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    let Some(inner) = rx.as_mut() else {
        return std::future::pending().await;
    };
    let received = inner.recv().await;
    if received.is_none() {
        *rx = None;
    }
    received
}

async fn recv_envelope(rx: &mut Option<broadcast::Receiver<String>>) -> Option<String> {
    loop {
        let Some(inner) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match inner.recv().await {
            Ok(text) => return Some(text),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Broadcast receiver lagged, envelopes lost");
            }
            Err(broadcast::error::RecvError::Closed) => *rx = None,
        }
    }
}
