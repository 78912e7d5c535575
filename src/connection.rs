//! Streaming connection state machine
//!
//! `ConnectionManager` owns one duplex connection through a [`Transport`],
//! queues control messages until the socket opens and decodes inbound frames.
//! It never reconnects: once the transport reports a drop the manager stays
//! `Closed` and inbound events stop until the owner replaces it.

use crate::{
    constants::{AGGREGATE_INDEX, INVALID_SUBSCRIPTION},
    error::StreamError,
    types::{ConnectionState, ControlMessage, StreamEvent, SubAction, SubscriptionKey},
};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};

/// Outbound half of a streaming connection
pub trait Transport: Send {
    /// Hands a serialized text frame to the socket
    fn transmit(&mut self, text: String) -> Result<(), StreamError>;

    /// Starts closing the socket
    fn close(&mut self);
}

/// Inbound frame, relevant fields only
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "TYPE")]
    kind: String,
    #[serde(rename = "FROMSYMBOL")]
    from_symbol: Option<String>,
    #[serde(rename = "TOSYMBOL")]
    to_symbol: Option<String>,
    #[serde(rename = "PRICE")]
    price: Option<f64>,
    #[serde(rename = "PARAMETER")]
    parameter: Option<String>,
    #[serde(rename = "FLAGS", default, deserialize_with = "lenient_flags")]
    flags: Option<u64>,
}

/// `FLAGS` is informational; an unexpected value must not cost the tick
fn lenient_flags<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(Value::as_u64))
}

/// Decodes one inbound text frame
///
/// Returns `Ok(None)` for message kinds the core does not handle (heartbeats,
/// welcome messages, future kinds) and an error when the frame is not JSON or a
/// handled kind lacks a required field.
pub fn decode_frame(text: &str) -> Result<Option<StreamEvent>, StreamError> {
    let frame: RawFrame =
        serde_json::from_str(text).map_err(|e| StreamError::malformed(e.to_string()))?;

    match frame.kind.as_str() {
        AGGREGATE_INDEX => {
            let (Some(from_symbol), Some(to_symbol)) = (frame.from_symbol, frame.to_symbol) else {
                return Err(StreamError::malformed("tick without FROMSYMBOL/TOSYMBOL"));
            };
            Ok(Some(StreamEvent::Tick {
                from_symbol,
                to_symbol,
                price: frame.price,
                flags: frame.flags,
            }))
        }
        INVALID_SUBSCRIPTION => {
            let parameter = frame
                .parameter
                .ok_or_else(|| StreamError::malformed("invalid notice without PARAMETER"))?;
            let key = parameter.parse::<SubscriptionKey>()?;
            Ok(Some(StreamEvent::InvalidSubscription { key }))
        }
        _ => Ok(None),
    }
}

/// Connection lifecycle and outbound queue
pub struct ConnectionManager<T: Transport> {
    transport: T,
    state: ConnectionState,
    pending: VecDeque<String>,
    /// Wire keys added and not yet removed
    tracked: BTreeSet<String>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Wraps a transport whose connection is still being established
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: ConnectionState::Connecting,
            pending: VecDeque::new(),
            tracked: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of messages waiting for the socket to open
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Wire keys currently subscribed upstream
    pub fn tracked_keys(&self) -> impl Iterator<Item = &str> {
        self.tracked.iter().map(String::as_str)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends a control message, queueing it while the socket is connecting
    pub fn send(&mut self, message: &ControlMessage) -> Result<(), StreamError> {
        let text = message.to_json()?;

        match self.state {
            ConnectionState::Connecting => {
                tracing::debug!(queued = self.pending.len() + 1, "Socket connecting, queueing message");
                self.pending.push_back(text);
            }
            ConnectionState::Open => self.transport.transmit(text)?,
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(StreamError::NotConnected);
            }
        }

        self.track(message);
        Ok(())
    }

    fn track(&mut self, message: &ControlMessage) {
        match message.action {
            SubAction::SubAdd => self.tracked.extend(message.subs.iter().cloned()),
            SubAction::SubRemove => {
                for key in &message.subs {
                    self.tracked.remove(key);
                }
            }
        }
    }

    /// Stops tracking a key the feed rejected, without telling the feed
    pub fn forget(&mut self, key: &SubscriptionKey) {
        self.tracked.remove(&key.to_string());
    }

    /// Handles the socket's open event
    ///
    /// Moves to `Open` and flushes the queue once, in enqueue order. Only the
    /// first call while `Connecting` has any effect.
    pub fn on_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            tracing::debug!(state = %self.state, "Ignoring open event");
            return;
        }

        self.state = ConnectionState::Open;
        let queued = std::mem::take(&mut self.pending);
        tracing::info!(queued = queued.len(), "Price stream connected");

        for text in queued {
            if let Err(e) = self.transport.transmit(text) {
                tracing::warn!(error = %e, "Failed to flush queued message");
            }
        }
    }

    /// Handles the socket going away
    pub fn on_closed(&mut self) {
        if self.state != ConnectionState::Closed {
            tracing::info!(previous = %self.state, "Price stream disconnected");
        }
        self.state = ConnectionState::Closed;
    }

    /// Unsubscribes every tracked key in one message and closes the socket
    ///
    /// While still connecting nothing has reached the feed, so the queue is
    /// discarded instead. A connection already closing or closed is left alone.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.pending.clear();
            self.tracked.clear();
        } else if !self.tracked.is_empty() {
            let message = ControlMessage {
                action: SubAction::SubRemove,
                subs: self.tracked.iter().cloned().collect(),
            };
            if let Err(e) = self.send(&message) {
                tracing::debug!(error = %e, "Could not unsubscribe before close");
            }
        }

        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => {}
            ConnectionState::Connecting | ConnectionState::Open => {
                self.state = ConnectionState::Closing;
                self.transport.close();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;

    fn add(symbol: &str) -> ControlMessage {
        ControlMessage::add([&SubscriptionKey::new(symbol, "USD")])
    }

    #[test]
    fn test_starts_connecting() {
        let connection = ConnectionManager::new(RecordingTransport::default());
        assert_eq!(connection.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_queue_flushes_in_order_on_open() {
        let transport = RecordingTransport::default();
        let mut connection = ConnectionManager::new(transport.clone());

        for symbol in ["btc", "eth", "doge", "sol"] {
            connection.send(&add(symbol)).unwrap();
        }
        assert!(transport.sent().is_empty());
        assert_eq!(connection.pending_len(), 4);

        connection.on_open();

        let subs: Vec<String> = transport
            .messages()
            .into_iter()
            .flat_map(|m| m.subs)
            .collect();
        assert_eq!(
            subs,
            vec![
                "5~CCCAGG~BTC~USD",
                "5~CCCAGG~ETH~USD",
                "5~CCCAGG~DOGE~USD",
                "5~CCCAGG~SOL~USD"
            ]
        );
        assert_eq!(connection.pending_len(), 0);
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[test]
    fn test_open_drains_only_once() {
        let transport = RecordingTransport::default();
        let mut connection = ConnectionManager::new(transport.clone());
        connection.send(&add("btc")).unwrap();

        connection.on_open();
        connection.on_open();

        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn test_send_when_open_is_immediate() {
        let transport = RecordingTransport::default();
        let mut connection = ConnectionManager::new(transport.clone());
        connection.on_open();

        connection.send(&add("btc")).unwrap();
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(connection.pending_len(), 0);
    }

    #[test]
    fn test_close_unsubscribes_tracked_keys_in_one_message() {
        let transport = RecordingTransport::default();
        let mut connection = ConnectionManager::new(transport.clone());
        connection.on_open();
        connection.send(&add("btc")).unwrap();
        connection.send(&add("eth")).unwrap();
        connection
            .send(&ControlMessage::remove([&SubscriptionKey::new("btc", "USD")]))
            .unwrap();
        transport.clear();

        connection.close();

        let messages = transport.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].action, SubAction::SubRemove);
        assert_eq!(messages[0].subs, vec!["5~CCCAGG~ETH~USD"]);
        assert!(transport.is_closed());
        assert_eq!(connection.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_second_close_is_noop() {
        let transport = RecordingTransport::default();
        let mut connection = ConnectionManager::new(transport.clone());
        connection.on_open();
        connection.send(&add("btc")).unwrap();
        transport.clear();

        connection.close();
        connection.close();

        let messages = transport.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].action, SubAction::SubRemove);
        assert_eq!(transport.close_calls(), 1);
        assert_eq!(connection.state(), ConnectionState::Closing);

        connection.on_closed();
        connection.close();
        assert_eq!(transport.close_calls(), 1);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_while_connecting_discards_queue() {
        let transport = RecordingTransport::default();
        let mut connection = ConnectionManager::new(transport.clone());
        connection.send(&add("btc")).unwrap();
        connection.send(&add("eth")).unwrap();

        connection.close();

        assert_eq!(connection.state(), ConnectionState::Closing);
        assert_eq!(connection.pending_len(), 0);
        assert_eq!(connection.tracked_keys().count(), 0);
        assert_eq!(transport.close_calls(), 1);

        // A late open event must not flush anything.
        connection.on_open();
        assert!(transport.sent().is_empty());
        assert_eq!(connection.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_send_after_close_fails() {
        let transport = RecordingTransport::default();
        let mut connection = ConnectionManager::new(transport.clone());
        connection.on_open();
        connection.close();
        connection.on_closed();

        assert!(matches!(
            connection.send(&add("btc")),
            Err(StreamError::NotConnected)
        ));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_decode_tick() {
        let event = decode_frame(
            r#"{"TYPE":"5","MARKET":"CCCAGG","FROMSYMBOL":"BTC","TOSYMBOL":"USD","FLAGS":2,"PRICE":67012.5}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            Some(StreamEvent::Tick {
                from_symbol: "BTC".to_string(),
                to_symbol: "USD".to_string(),
                price: Some(67012.5),
                flags: Some(2),
            })
        );
    }

    #[test]
    fn test_decode_tick_with_odd_flags() {
        for flags in ["-1", "\"4\"", "null", "1.5"] {
            let frame = format!(
                r#"{{"TYPE":"5","FROMSYMBOL":"BTC","TOSYMBOL":"USD","FLAGS":{},"PRICE":67000}}"#,
                flags
            );
            let event = decode_frame(&frame).unwrap();
            assert_eq!(
                event,
                Some(StreamEvent::Tick {
                    from_symbol: "BTC".to_string(),
                    to_symbol: "USD".to_string(),
                    price: Some(67000.0),
                    flags: None,
                })
            );
        }
    }

    #[test]
    fn test_decode_invalid_notice() {
        let event = decode_frame(
            r#"{"TYPE":"500","MESSAGE":"INVALID_SUB","PARAMETER":"5~CCCAGG~ETH~USD","INFO":"No data"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            Some(StreamEvent::InvalidSubscription {
                key: SubscriptionKey::new("ETH", "USD")
            })
        );
    }

    #[test]
    fn test_decode_ignores_unknown_kinds() {
        assert_eq!(decode_frame(r#"{"TYPE":"999","MESSAGE":"HEARTBEAT"}"#).unwrap(), None);
        assert_eq!(decode_frame(r#"{"TYPE":"20","MESSAGE":"STREAMERWELCOME"}"#).unwrap(), None);
    }

    #[test]
    fn test_decode_fails_closed() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"FROMSYMBOL":"BTC"}"#).is_err());
        assert!(decode_frame(r#"{"TYPE":"5","FROMSYMBOL":"BTC"}"#).is_err());
        assert!(decode_frame(r#"{"TYPE":"500"}"#).is_err());
        assert!(decode_frame(r#"{"TYPE":"500","PARAMETER":"garbage"}"#).is_err());
        assert!(decode_frame(r#"{"TYPE":"5","FROMSYMBOL":"BTC","TOSYMBOL":"USD","PRICE":"x"}"#).is_err());
    }
}
