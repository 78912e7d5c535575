//! Subscription registry
//!
//! Multiplexes any number of subscriber callbacks per symbol over a single
//! wire subscription and runs the invalid-pair fallback: a pair rejected in
//! USD is retried once against BTC, and a rejected BTC pair is
//! reported to every subscriber with [`PriceUpdate::InvalidCoin`].

use crate::{
    connection::{decode_frame, ConnectionManager, Transport},
    constants::{CROSS_QUOTE, DEFAULT_QUOTE},
    corrector::CrossRateCorrector,
    types::{ControlMessage, PriceCallback, PriceUpdate, StreamEvent, SubscriberId, SubscriptionKey},
};
use std::collections::HashMap;

/// Where a symbol is in the fallback protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    /// Subscribed against USD
    Direct,
    /// USD pair was rejected, subscribed against BTC
    Fallback,
    /// Rejected in every quote tried
    Rejected,
}

struct SubscriberEntry {
    id: SubscriberId,
    callback: PriceCallback,
}

struct Subscription {
    key: SubscriptionKey,
    state: FallbackState,
    subscribers: Vec<SubscriberEntry>,
}

impl Subscription {
    fn notify(&self, update: PriceUpdate) {
        for entry in &self.subscribers {
            (entry.callback)(update);
        }
    }
}

/// What handling an inbound frame led to
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// A price was delivered to the subscribers of `symbol`
    Dispatched { symbol: String, subscribers: usize },
    /// The symbol was re-subscribed under `key`
    Retried { key: SubscriptionKey },
    /// The sentinel was delivered to the subscribers of `symbol`
    Rejected { symbol: String, subscribers: usize },
    /// Valid frame that needed no action
    Ignored,
    /// Frame could not be decoded
    Dropped,
}

/// Maps subscribers to wire subscriptions
pub struct SubscriptionRegistry<T: Transport> {
    connection: ConnectionManager<T>,
    corrector: CrossRateCorrector,
    subscriptions: HashMap<String, Subscription>,
}

fn normalize(symbol: &str) -> String {
    symbol.trim().to_lowercase()
}

impl<T: Transport> SubscriptionRegistry<T> {
    pub fn new(connection: ConnectionManager<T>, corrector: CrossRateCorrector) -> Self {
        Self {
            connection,
            corrector,
            subscriptions: HashMap::new(),
        }
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager<T> {
        &mut self.connection
    }

    pub fn corrector(&self) -> &CrossRateCorrector {
        &self.corrector
    }

    pub fn corrector_mut(&mut self) -> &mut CrossRateCorrector {
        &mut self.corrector
    }

    /// Registers `callback` for `symbol` and returns its id
    pub fn subscribe(&mut self, symbol: &str, callback: PriceCallback) -> SubscriberId {
        let id = SubscriberId::new();
        self.subscribe_with_id(symbol, id, callback);
        id
    }

    /// Registers `callback` under a caller-chosen id
    ///
    /// The first subscriber of a symbol creates the wire subscription. Joining
    /// a symbol the feed already rejected delivers the sentinel right away.
    pub fn subscribe_with_id(&mut self, symbol: &str, id: SubscriberId, callback: PriceCallback) {
        let name = normalize(symbol);

        if let Some(subscription) = self.subscriptions.get_mut(&name) {
            if subscription.state == FallbackState::Rejected {
                callback(PriceUpdate::InvalidCoin);
            }
            subscription.subscribers.push(SubscriberEntry { id, callback });
            tracing::debug!(
                symbol = %name,
                subscribers = subscription.subscribers.len(),
                "Added subscriber to existing subscription"
            );
            return;
        }

        let key = SubscriptionKey::new(&name, DEFAULT_QUOTE);
        tracing::info!(symbol = %name, key = %key, "Subscribing");
        if let Err(e) = self.connection.send(&ControlMessage::add([&key])) {
            tracing::warn!(key = %key, error = %e, "Failed to send subscribe");
        }

        self.subscriptions.insert(
            name,
            Subscription {
                key,
                state: FallbackState::Direct,
                subscribers: vec![SubscriberEntry { id, callback }],
            },
        );
    }

    /// Removes exactly one subscriber
    ///
    /// Removing the last subscriber of a symbol sends the wire unsubscribe and
    /// forgets the symbol. Returns false if no such subscriber exists.
    pub fn unsubscribe(&mut self, symbol: &str, id: SubscriberId) -> bool {
        let name = normalize(symbol);
        let Some(subscription) = self.subscriptions.get_mut(&name) else {
            return false;
        };

        let before = subscription.subscribers.len();
        subscription.subscribers.retain(|entry| entry.id != id);
        if subscription.subscribers.len() == before {
            return false;
        }

        if subscription.subscribers.is_empty() {
            let key = subscription.key.clone();
            self.subscriptions.remove(&name);
            tracing::info!(symbol = %name, key = %key, "Last subscriber left, unsubscribing");
            if let Err(e) = self.connection.send(&ControlMessage::remove([&key])) {
                tracing::warn!(key = %key, error = %e, "Failed to send unsubscribe");
            }
        }

        true
    }

    /// Decodes and handles one inbound frame
    pub fn handle_frame(&mut self, text: &str) -> FrameOutcome {
        match decode_frame(text) {
            Ok(Some(event)) => self.handle_event(event),
            Ok(None) => FrameOutcome::Ignored,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping frame");
                FrameOutcome::Dropped
            }
        }
    }

    /// Handles one decoded event
    pub fn handle_event(&mut self, event: StreamEvent) -> FrameOutcome {
        match event {
            StreamEvent::Tick {
                from_symbol,
                to_symbol,
                price: Some(price),
                ..
            } => self.dispatch_tick(&from_symbol, &to_symbol, price),
            StreamEvent::Tick { price: None, .. } => FrameOutcome::Ignored,
            StreamEvent::InvalidSubscription { key } => self.handle_invalid(key),
        }
    }

    fn dispatch_tick(&self, from_symbol: &str, to_symbol: &str, price: f64) -> FrameOutcome {
        let name = normalize(from_symbol);
        let Some(subscription) = self.subscriptions.get(&name) else {
            return FrameOutcome::Ignored;
        };
        // The sentinel is final for a rejected symbol.
        if subscription.state == FallbackState::Rejected {
            return FrameOutcome::Ignored;
        }

        let corrected = self.corrector.correct(price, to_symbol);
        tracing::trace!(symbol = %name, to_symbol, price, corrected, "Dispatching tick");
        subscription.notify(PriceUpdate::Price(corrected));

        FrameOutcome::Dispatched {
            symbol: name,
            subscribers: subscription.subscribers.len(),
        }
    }

    fn handle_invalid(&mut self, rejected: SubscriptionKey) -> FrameOutcome {
        let name = normalize(rejected.symbol());
        let Some(subscription) = self.subscriptions.get_mut(&name) else {
            return FrameOutcome::Ignored;
        };

        // Notices for keys no longer in use (or repeated ones) must not
        // trigger another hop.
        if subscription.key != rejected || subscription.state == FallbackState::Rejected {
            tracing::debug!(key = %rejected, "Ignoring stale invalid-subscription notice");
            return FrameOutcome::Ignored;
        }
        self.connection.forget(&rejected);

        if !rejected.is_cross() {
            let retry = rejected.with_quote(CROSS_QUOTE);
            tracing::info!(rejected = %rejected, retry = %retry, "Pair rejected, retrying via cross pair");
            subscription.key = retry.clone();
            subscription.state = FallbackState::Fallback;
            if let Err(e) = self.connection.send(&ControlMessage::add([&retry])) {
                tracing::warn!(key = %retry, error = %e, "Failed to send fallback subscribe");
            }
            return FrameOutcome::Retried { key: retry };
        }

        tracing::warn!(symbol = %name, "Pair rejected in every quote, notifying subscribers");
        subscription.state = FallbackState::Rejected;
        subscription.notify(PriceUpdate::InvalidCoin);

        FrameOutcome::Rejected {
            symbol: name,
            subscribers: subscription.subscribers.len(),
        }
    }

    /// Fallback state of a symbol, if it has subscribers
    pub fn fallback_state(&self, symbol: &str) -> Option<FallbackState> {
        self.subscriptions.get(&normalize(symbol)).map(|s| s.state)
    }

    pub fn is_rejected(&self, symbol: &str) -> bool {
        self.fallback_state(symbol) == Some(FallbackState::Rejected)
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.subscriptions
            .get(&normalize(symbol))
            .map_or(0, |s| s.subscribers.len())
    }

    pub fn total_subscribers(&self) -> usize {
        self.subscriptions.values().map(|s| s.subscribers.len()).sum()
    }

    /// Wire keys of all symbols with subscribers, sorted
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self
            .subscriptions
            .values()
            .filter(|s| s.state != FallbackState::Rejected)
            .map(|s| s.key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn on_open(&mut self) {
        self.connection.on_open();
    }

    pub fn on_closed(&mut self) {
        self.connection.on_closed();
    }

    /// Unsubscribes everything upstream and closes the connection
    pub fn close(&mut self) {
        self.connection.close();
    }
}
