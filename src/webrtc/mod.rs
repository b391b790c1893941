//! WebRTC receive side
//!
//! This module provides the one-way video receiver:
//! - Signaling wire messages (offer/answer/candidate)
//! - Native peer connection seam and its webrtc-rs implementation
//! - Session negotiation and reconnection state machine
//! - Inbound RTP inspection and periodic health sampling

pub mod media_track;
pub mod peer_connection;
pub mod session;
pub mod signaling;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use media_track::{InboundTrack, MediaKind, TrackKey};
pub use peer_connection::{Connectivity, PeerConnector, PeerEvent, PeerEventSender, PeerHandle, WebRtcConnector};
pub use session::{ConnectionManager, ConnectionState, ManagerConfig, ManagerHandle};
pub use signaling::{Answer, IceCandidate, Offer, SignalingMessage};
pub use stats::{StatsMonitor, StatsObserver, StatsSample};

use std::error::Error;
use std::fmt;

/// Receiver errors
///
/// `NoOfferPending` and `StaleOffer` never leave the signaling client; every
/// other runtime category is recovered by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Signaling endpoint has nothing to hand out
    NoOfferPending,
    /// Fetched offer equals the last consumed one
    StaleOffer,
    /// Signaling transport or protocol failure
    Signaling(String),
    /// SDP could not be parsed or applied
    Sdp(String),
    /// Answer could not be produced
    Negotiation(String),
    /// Native transport reported disconnected/failed
    Connectivity(String),
    /// A single stats query failed
    Stats(String),
    /// Inbound media could not be read
    Media(String),
    /// Invalid configuration
    Config(String),
    /// Operation on a closed session or stopped manager
    Closed,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::NoOfferPending => write!(f, "No offer pending"),
            RelayError::StaleOffer => write!(f, "Offer is stale"),
            RelayError::Signaling(msg) => write!(f, "Signaling error: {}", msg),
            RelayError::Sdp(msg) => write!(f, "SDP error: {}", msg),
            RelayError::Negotiation(msg) => write!(f, "Negotiation failed: {}", msg),
            RelayError::Connectivity(msg) => write!(f, "Connectivity failure: {}", msg),
            RelayError::Stats(msg) => write!(f, "Stats error: {}", msg),
            RelayError::Media(msg) => write!(f, "Media error: {}", msg),
            RelayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RelayError::Closed => write!(f, "Session closed"),
        }
    }
}

impl Error for RelayError {}
