//! Cross-context subscription sharing
//!
//! Several contexts (tabs, workers, embedding applications) can share one
//! upstream connection. Every context announces its subscribe/unsubscribe
//! intents on a [`BroadcastChannel`]; the context that owns the
//! [`SubscriptionRegistry`] performs the wire subscription and relays prices
//! back as envelopes. Delivery is fire-and-forget and not deduplicated.

use crate::{
    connection::Transport,
    constants::BROADCAST_CAPACITY,
    error::StreamError,
    registry::SubscriptionRegistry,
    types::{PriceCallback, PriceUpdate, SubscriberId},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const SUBSCRIBE_INTENT: &str = "subscribe-intent";
const UNSUBSCRIBE_INTENT: &str = "unsubscribe-intent";
const UPDATE_SUFFIX: &str = "-update";
const INVALID_PREFIX: &str = "invalid-";

/// Kind of a broadcast envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Update,
    Invalid,
    SubscribeIntent,
    UnsubscribeIntent,
}

/// Message exchanged between contexts
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEnvelope {
    pub kind: EnvelopeKind,
    pub symbol: String,
    pub price: Option<f64>,
    /// Context that sent the envelope
    pub origin: Option<Uuid>,
}

/// JSON form: `{"event": "...", "coin": "...", "price": ..., "origin": "..."}`
#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    coin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<Uuid>,
}

impl BroadcastEnvelope {
    fn new(kind: EnvelopeKind, symbol: &str, price: Option<f64>) -> Self {
        Self {
            kind,
            symbol: symbol.trim().to_lowercase(),
            price,
            origin: None,
        }
    }

    pub fn update(symbol: &str, price: f64) -> Self {
        Self::new(EnvelopeKind::Update, symbol, Some(price))
    }

    pub fn invalid(symbol: &str) -> Self {
        Self::new(EnvelopeKind::Invalid, symbol, None)
    }

    pub fn subscribe_intent(symbol: &str) -> Self {
        Self::new(EnvelopeKind::SubscribeIntent, symbol, None)
    }

    pub fn unsubscribe_intent(symbol: &str) -> Self {
        Self::new(EnvelopeKind::UnsubscribeIntent, symbol, None)
    }

    pub fn with_origin(mut self, origin: Uuid) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn to_json(&self) -> Result<String, StreamError> {
        let event = match self.kind {
            EnvelopeKind::Update => format!("{}{}", self.symbol, UPDATE_SUFFIX),
            EnvelopeKind::Invalid => format!("{}{}", INVALID_PREFIX, self.symbol),
            EnvelopeKind::SubscribeIntent => SUBSCRIBE_INTENT.to_string(),
            EnvelopeKind::UnsubscribeIntent => UNSUBSCRIBE_INTENT.to_string(),
        };
        let raw = RawEnvelope {
            event,
            coin: Some(self.symbol.clone()),
            price: self.price,
            origin: self.origin,
        };
        Ok(serde_json::to_string(&raw)?)
    }

    pub fn from_json(text: &str) -> Result<Self, StreamError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| StreamError::malformed(e.to_string()))?;

        let envelope = match raw.event.as_str() {
            SUBSCRIBE_INTENT | UNSUBSCRIBE_INTENT => {
                let coin = raw
                    .coin
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| StreamError::malformed("intent without coin"))?;
                let kind = if raw.event == SUBSCRIBE_INTENT {
                    EnvelopeKind::SubscribeIntent
                } else {
                    EnvelopeKind::UnsubscribeIntent
                };
                Self::new(kind, &coin, None)
            }
            event => {
                if let Some(symbol) = event.strip_suffix(UPDATE_SUFFIX).filter(|s| !s.is_empty()) {
                    let price = raw
                        .price
                        .ok_or_else(|| StreamError::malformed("update without price"))?;
                    Self::update(symbol, price)
                } else if let Some(symbol) =
                    event.strip_prefix(INVALID_PREFIX).filter(|s| !s.is_empty())
                {
                    Self::invalid(symbol)
                } else {
                    return Err(StreamError::malformed(format!("unknown event {}", event)));
                }
            }
        };

        Ok(Self {
            origin: raw.origin,
            ..envelope
        })
    }
}

/// In-process broadcast channel carrying JSON envelopes between contexts
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    sender: broadcast::Sender<String>,
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(BROADCAST_CAPACITY)
    }
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Opens a receiver for envelopes sent from now on
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Sends an envelope to every context
    pub fn publish(&self, envelope: &BroadcastEnvelope) {
        match envelope.to_json() {
            Ok(text) => {
                // No receivers simply means no other context is listening.
                let _ = self.sender.send(text);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode broadcast envelope"),
        }
    }
}

/// Owner-side relay for one symbol requested by other contexts
struct Relay {
    id: SubscriberId,
    intents: usize,
}

/// Keeps one context's subscriptions in sync with the shared connection
pub struct BroadcastSynchronizer {
    context_id: Uuid,
    channel: BroadcastChannel,
    /// Callbacks of this context, fed by envelopes
    local: HashMap<String, Vec<(SubscriberId, PriceCallback)>>,
    /// Symbols relayed on behalf of other contexts
    relays: HashMap<String, Relay>,
}

impl BroadcastSynchronizer {
    pub fn new(channel: BroadcastChannel) -> Self {
        Self {
            context_id: Uuid::new_v4(),
            channel,
            local: HashMap::new(),
            relays: HashMap::new(),
        }
    }

    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    pub fn channel(&self) -> &BroadcastChannel {
        &self.channel
    }

    /// Number of callbacks waiting for envelopes in this context
    pub fn local_subscribers(&self) -> usize {
        self.local.values().map(Vec::len).sum()
    }

    /// Number of symbols relayed for other contexts
    pub fn relayed_symbols(&self) -> usize {
        self.relays.len()
    }

    fn publish(&self, envelope: BroadcastEnvelope) {
        self.channel.publish(&envelope.with_origin(self.context_id));
    }

    /// Registers a local subscriber and announces the intent
    ///
    /// With a registry (owner context) the subscriber is attached to it
    /// directly; otherwise it waits for envelopes from the owner.
    pub fn subscribe<T: Transport>(
        &mut self,
        symbol: &str,
        id: SubscriberId,
        callback: PriceCallback,
        registry: Option<&mut SubscriptionRegistry<T>>,
    ) {
        let name = symbol.trim().to_lowercase();
        match registry {
            Some(registry) => registry.subscribe_with_id(&name, id, callback),
            None => self.local.entry(name.clone()).or_default().push((id, callback)),
        }
        self.publish(BroadcastEnvelope::subscribe_intent(&name));
    }

    /// Removes a local subscriber and announces the intent
    pub fn unsubscribe<T: Transport>(
        &mut self,
        symbol: &str,
        id: SubscriberId,
        registry: Option<&mut SubscriptionRegistry<T>>,
    ) -> bool {
        let name = symbol.trim().to_lowercase();
        let removed = match registry {
            Some(registry) => registry.unsubscribe(&name, id),
            None => self.remove_local(&name, id),
        };
        if removed {
            self.publish(BroadcastEnvelope::unsubscribe_intent(&name));
        }
        removed
    }

    fn remove_local(&mut self, name: &str, id: SubscriberId) -> bool {
        let Some(entries) = self.local.get_mut(name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.local.remove(name);
        }
        removed
    }

    /// Drops every local subscriber, announcing one unsubscribe intent each
    pub fn release_all(&mut self) {
        for (symbol, entries) in std::mem::take(&mut self.local) {
            for _ in entries {
                self.publish(BroadcastEnvelope::unsubscribe_intent(&symbol));
            }
        }
        self.relays.clear();
    }

    /// Handles one envelope received from the channel
    ///
    /// Returns the decoded envelope if it came from another context.
    pub fn handle_message<T: Transport>(
        &mut self,
        text: &str,
        registry: Option<&mut SubscriptionRegistry<T>>,
    ) -> Option<BroadcastEnvelope> {
        let envelope = match BroadcastEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping broadcast envelope");
                return None;
            }
        };

        if envelope.origin == Some(self.context_id) {
            return None;
        }

        match envelope.kind {
            EnvelopeKind::SubscribeIntent => {
                if let Some(registry) = registry {
                    self.relay_subscribe(&envelope.symbol, registry);
                }
            }
            EnvelopeKind::UnsubscribeIntent => {
                if let Some(registry) = registry {
                    self.relay_unsubscribe(&envelope.symbol, registry);
                }
            }
            EnvelopeKind::Update => {
                if let Some(price) = envelope.price {
                    self.deliver(&envelope.symbol, PriceUpdate::Price(price));
                }
            }
            EnvelopeKind::Invalid => self.deliver(&envelope.symbol, PriceUpdate::InvalidCoin),
        }

        Some(envelope)
    }

    fn deliver(&self, symbol: &str, update: PriceUpdate) {
        if let Some(entries) = self.local.get(symbol) {
            for (_, callback) in entries {
                callback(update);
            }
        }
    }

    fn relay_subscribe<T: Transport>(&mut self, symbol: &str, registry: &mut SubscriptionRegistry<T>) {
        if let Some(relay) = self.relays.get_mut(symbol) {
            relay.intents += 1;
            if registry.is_rejected(symbol) {
                self.publish(BroadcastEnvelope::invalid(symbol));
            }
            return;
        }

        tracing::debug!(symbol, context = %self.context_id, "Relaying subscription for another context");
        let channel = self.channel.clone();
        let origin = self.context_id;
        let relayed = symbol.to_string();
        let callback: PriceCallback = Arc::new(move |update| {
            let envelope = match update {
                PriceUpdate::Price(price) => BroadcastEnvelope::update(&relayed, price),
                PriceUpdate::InvalidCoin => BroadcastEnvelope::invalid(&relayed),
            };
            channel.publish(&envelope.with_origin(origin));
        });

        let id = registry.subscribe(symbol, callback);
        self.relays.insert(symbol.to_string(), Relay { id, intents: 1 });
    }

    fn relay_unsubscribe<T: Transport>(&mut self, symbol: &str, registry: &mut SubscriptionRegistry<T>) {
        let Some(relay) = self.relays.get_mut(symbol) else {
            return;
        };
        relay.intents -= 1;
        if relay.intents == 0 {
            let id = relay.id;
            self.relays.remove(symbol);
            registry.unsubscribe(symbol, id);
        }
    }
}
