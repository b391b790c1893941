//! Polled HTTP signaling
//!
//! The relay keeps a single offer slot: `GET /offer` returns it while one is
//! pending and `POST /answer` hands our answer to the publisher.

use super::SignalingTransport;
use crate::webrtc::{Answer, Offer, RelayError, SignalingMessage};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// HTTP polling transport
pub struct HttpSignaling {
    client: Client,
    offer_url: String,
    answer_url: String,
}

impl HttpSignaling {
    /// Create a transport for the relay at `base_url`
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayError::Signaling(format!("Failed to build HTTP client: {}", e)))?;
        let base = base_url.trim_end_matches('/');

        Ok(Self {
            client,
            offer_url: format!("{}/offer", base),
            answer_url: format!("{}/answer", base),
        })
    }
}

#[async_trait]
impl SignalingTransport for HttpSignaling {
    async fn fetch_offer(&self) -> Result<Option<Offer>, RelayError> {
        let response = self.client.get(&self.offer_url).send().await
            .map_err(|e| RelayError::Signaling(format!("GET {} failed: {}", self.offer_url, e)))?;

        // 404 from the reference relay, 204 from others
        if response.status() != StatusCode::OK {
            return Ok(None);
        }

        let body = response.text().await
            .map_err(|e| RelayError::Signaling(format!("Failed to read offer body: {}", e)))?;
        let offer = SignalingMessage::from_json(&body)?.into_offer()?;
        debug!("Fetched offer ({} bytes of SDP)", offer.sdp.len());
        Ok(Some(offer))
    }

    async fn post_answer(&self, answer: &Answer) -> Result<(), RelayError> {
        let message = SignalingMessage::from(answer.clone());
        let response = self.client.post(&self.answer_url).json(&message).send().await
            .map_err(|e| RelayError::Signaling(format!("POST {} failed: {}", self.answer_url, e)))?;

        if !response.status().is_success() {
            return Err(RelayError::Signaling(format!("Answer rejected: {}", response.status())));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
