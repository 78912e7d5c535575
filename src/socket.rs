//! WebSocket I/O for the streaming connection
//!
//! `connect` spawns a task that owns the tokio-tungstenite socket. Outbound
//! frames reach it through the returned [`WsTransport`]; socket lifecycle and
//! inbound text frames come back as [`SocketEvent`]s. The task never
//! reconnects.

use crate::{connection::Transport, error::StreamError};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Lifecycle and data events of the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Handshake completed
    Opened,
    /// Inbound text frame
    Frame(String),
    /// Socket is gone (connect failure, remote close or error)
    Closed,
}

/// Outbound half handed to the `ConnectionManager`
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Message>,
}

impl Transport for WsTransport {
    fn transmit(&mut self, text: String) -> Result<(), StreamError> {
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| StreamError::transport("socket task has stopped"))
    }

    fn close(&mut self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

/// Starts connecting to `url` in the background
pub fn connect(url: String) -> (WsTransport, mpsc::UnboundedReceiver<SocketEvent>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_socket(url, outbound_rx, events_tx));

    (WsTransport { outbound: outbound_tx }, events_rx)
}

async fn run_socket(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    tracing::info!(url = %redact(&url), "Connecting to price stream");

    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            tracing::warn!(error = %e, "Price stream connection failed");
            let _ = events.send(SocketEvent::Closed);
            return;
        }
    };

    if events.send(SocketEvent::Opened).is_err() {
        return;
    }

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = write.send(message).await {
                        tracing::warn!(error = %e, "Failed to write to price stream");
                        break;
                    }
                }
                None => {
                    // Owner is gone.
                    let _ = write.close().await;
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if events.send(SocketEvent::Frame(text.to_string())).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "Price stream closed by remote");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Price stream read error");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = events.send(SocketEvent::Closed);
}

/// Hides the API key when logging the endpoint
fn redact(url: &str) -> String {
    match url.split_once("api_key=") {
        Some((head, _)) => format!("{}api_key=***", head),
        None => url.to_string(),
    }
}
