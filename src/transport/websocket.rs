//! WebSocket signaling
//!
//! The relay pushes offers and trickled candidates over a socket. The latest
//! offer is kept in a single slot so fetching behaves like the HTTP relay.
//! The slot belongs to the socket that filled it: the relay only asks the
//! publisher for a new offer when a receiver connects, so a consumed offer
//! is cleared by reconnecting. The socket is re-established by the next
//! fetch after it drops.

use super::SignalingTransport;
use crate::webrtc::{Answer, IceCandidate, Offer, RelayError, SignalingMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

type OfferSlot = Arc<Mutex<Option<Offer>>>;

/// One live socket and the offer it delivered
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    latest_offer: OfferSlot,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// WebSocket push transport
pub struct WebSocketSignaling {
    url: String,
    connection: tokio::sync::Mutex<Option<Connection>>,
    candidates_tx: mpsc::UnboundedSender<IceCandidate>,
    candidates_rx: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
}

impl WebSocketSignaling {
    pub fn new(url: impl Into<String>) -> Self {
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            connection: tokio::sync::Mutex::new(None),
            candidates_tx,
            candidates_rx: Mutex::new(Some(candidates_rx)),
        }
    }

    /// Connect if there is no live socket; returns the live socket's offer slot
    async fn ensure_connected(&self) -> Result<OfferSlot, RelayError> {
        let mut connection = self.connection.lock().await;
        if let Some(live) = connection.as_ref().filter(|c| c.is_alive()) {
            return Ok(live.latest_offer.clone());
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str()).await
            .map_err(|e| RelayError::Signaling(format!("WebSocket connect to {} failed: {}", self.url, e)))?;
        info!("Signaling socket connected to {}", self.url);

        let (write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer_handle = tokio::spawn(async move {
            let mut write = write;
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let latest_offer: OfferSlot = Arc::new(Mutex::new(None));
        let slot = latest_offer.clone();
        let candidates_tx = self.candidates_tx.clone();
        let pong_tx = outbound_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => handle_message(&text, &slot, &candidates_tx),
                    Ok(Message::Binary(data)) => {
                        debug!("Ignoring binary signaling message: {} bytes", data.len());
                    }
                    Ok(Message::Ping(ping)) => {
                        let _ = pong_tx.send(Message::Pong(ping));
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Frame(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        error!("Signaling socket error: {}", e);
                        break;
                    }
                }
            }
            // Closing the writer marks the connection dead for the next fetch
            writer_handle.abort();
            warn!("Signaling socket closed");
        });

        *connection = Some(Connection {
            outbound: outbound_tx,
            latest_offer: latest_offer.clone(),
            reader,
        });
        Ok(latest_offer)
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), RelayError> {
        let json = message.to_json()?;
        let connection = self.connection.lock().await;
        match connection.as_ref() {
            Some(live) => live.outbound.send(Message::Text(json))
                .map_err(|_| RelayError::Signaling("Signaling socket closed".to_string())),
            None => Err(RelayError::Signaling("Signaling socket not connected".to_string())),
        }
    }
}

fn handle_message(
    text: &str,
    latest_offer: &Mutex<Option<Offer>>,
    candidates_tx: &mpsc::UnboundedSender<IceCandidate>,
) {
    let message = match SignalingMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };

    match message {
        offer @ SignalingMessage::Offer { .. } => match offer.into_offer() {
            Ok(offer) => {
                debug!("Offer pushed by relay");
                *latest_offer.lock() = Some(offer);
            }
            Err(e) => warn!("Dropping pushed offer: {}", e),
        },
        SignalingMessage::Candidate { candidate: Some(candidate) } => {
            let _ = candidates_tx.send(candidate);
        }
        SignalingMessage::Candidate { candidate: None } => {
            debug!("Remote candidate gathering complete");
        }
        other => debug!("Ignoring signaling message of type {}", other.kind()),
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    async fn fetch_offer(&self) -> Result<Option<Offer>, RelayError> {
        let slot = self.ensure_connected().await?;
        let offer = slot.lock().clone();
        Ok(offer)
    }

    async fn post_answer(&self, answer: &Answer) -> Result<(), RelayError> {
        self.send(SignalingMessage::from(answer.clone())).await
    }

    async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), RelayError> {
        self.send(SignalingMessage::candidate(candidate.clone())).await
    }

    /// Close the socket; the next fetch reconnects and the relay asks the
    /// publisher for a new offer
    async fn reset(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.reader.abort();
            let _ = connection.outbound.send(Message::Close(None));
            info!("Dropped signaling socket holding a consumed offer");
        }
    }

    fn take_remote_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
        self.candidates_rx.lock().take()
    }

    fn supports_trickle(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}
