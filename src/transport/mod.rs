//! Signaling transport layer
//!
//! Offers are fetched from the relay either by polling an HTTP endpoint or
//! from a WebSocket push channel. `SignalingClient` sits on top of either
//! transport and implements offer freshness and polling cadence.

pub mod http;
pub mod websocket;

pub use http::HttpSignaling;
pub use websocket::WebSocketSignaling;

use crate::config::{SignalingConfig, SignalingMode};
use crate::webrtc::{Answer, IceCandidate, Offer, RelayError};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

/// Raw signaling channel to the relay
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Currently pending offer, `None` when nothing is pending
    async fn fetch_offer(&self) -> Result<Option<Offer>, RelayError>;

    /// Hand the local answer to the publisher
    async fn post_answer(&self, answer: &Answer) -> Result<(), RelayError>;

    /// Forward a locally gathered candidate
    async fn send_candidate(&self, _candidate: &IceCandidate) -> Result<(), RelayError> {
        Ok(())
    }

    /// Give up on the pending offer so the relay hands out a new one
    async fn reset(&self) {}

    /// Stream of remote candidates, if the transport carries them. Yields
    /// the receiver once.
    fn take_remote_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
        None
    }

    /// Whether candidates travel over this transport
    fn supports_trickle(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

/// Offer acquisition and answer submission on top of a transport
#[derive(Clone)]
pub struct SignalingClient {
    transport: Arc<dyn SignalingTransport>,
    poll_interval: Duration,
}

impl SignalingClient {
    pub fn new(transport: Arc<dyn SignalingTransport>, poll_interval: Duration) -> Self {
        Self {
            transport,
            poll_interval,
        }
    }

    /// Build the transport selected by configuration
    pub fn from_config(config: &SignalingConfig) -> Result<Self, RelayError> {
        let transport: Arc<dyn SignalingTransport> = match config.mode {
            SignalingMode::Http => Arc::new(HttpSignaling::new(
                &config.url,
                Duration::from_millis(config.request_timeout_ms),
            )?),
            SignalingMode::Websocket => Arc::new(WebSocketSignaling::new(config.websocket_url())),
        };
        Ok(Self::new(transport, Duration::from_millis(config.poll_interval_ms)))
    }

    /// Wait for an offer whose SDP differs from `exclude_sdp`.
    ///
    /// Empty polls and stale offers are retried every poll interval without
    /// bound; transport errors are returned to the caller. The first stale
    /// offer resets the transport once.
    pub async fn acquire_fresh_offer(&self, exclude_sdp: Option<&str>) -> Result<Offer, RelayError> {
        let mut attempts = 0u64;
        let mut reset = false;
        loop {
            match self.try_acquire(exclude_sdp).await {
                Ok(offer) => {
                    debug!("Acquired offer via {} after {} empty polls", self.transport.name(), attempts);
                    return Ok(offer);
                }
                Err(RelayError::NoOfferPending) => {
                    if attempts == 0 {
                        debug!("No offer pending, polling every {:?}", self.poll_interval);
                    }
                }
                Err(RelayError::StaleOffer) if !reset => {
                    debug!("Pending offer already consumed, resetting {} transport", self.transport.name());
                    self.transport.reset().await;
                    reset = true;
                }
                Err(RelayError::StaleOffer) => {
                    debug!("Pending offer already consumed, waiting for a new one");
                }
                Err(e) => return Err(e),
            }
            attempts += 1;
            time::sleep(self.poll_interval).await;
        }
    }

    async fn try_acquire(&self, exclude_sdp: Option<&str>) -> Result<Offer, RelayError> {
        match self.transport.fetch_offer().await? {
            None => Err(RelayError::NoOfferPending),
            Some(offer) if offer.matches(exclude_sdp) => Err(RelayError::StaleOffer),
            Some(offer) => Ok(offer),
        }
    }

    /// Post the local answer; failures are not retried here
    pub async fn submit_answer(&self, answer: &Answer) -> Result<(), RelayError> {
        self.transport.post_answer(answer).await
    }

    /// Forward a local candidate; a no-op over HTTP
    pub async fn publish_candidate(&self, candidate: &IceCandidate) -> Result<(), RelayError> {
        self.transport.send_candidate(candidate).await
    }

    pub fn take_remote_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
        self.transport.take_remote_candidates()
    }

    /// Whether local candidates can be trickled over this transport
    pub fn supports_trickle(&self) -> bool {
        self.transport.supports_trickle()
    }
}
