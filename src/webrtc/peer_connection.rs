//! WebRTC PeerConnection management
//!
//! `PeerConnector` creates native connections and `PeerHandle` drives one of
//! them through answer-side negotiation. The production implementation wraps
//! webrtc-rs; native callbacks are forwarded as `PeerEvent`s tagged with the
//! session generation so the connection manager can drop late events from a
//! session it already closed.

use super::media_track::{InboundTrack, MediaKind, RtpSource, TrackKey};
use super::signaling::IceCandidate;
use super::stats::{CandidatePairStats, PairState, TransportStats};
use super::RelayError;
use crate::config::WebRTCConfig;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

/// Connectivity state reported by the native ICE transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCIceConnectionState> for Connectivity {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => Connectivity::Checking,
            RTCIceConnectionState::Connected => Connectivity::Connected,
            RTCIceConnectionState::Completed => Connectivity::Completed,
            RTCIceConnectionState::Disconnected => Connectivity::Disconnected,
            RTCIceConnectionState::Failed => Connectivity::Failed,
            RTCIceConnectionState::Closed => Connectivity::Closed,
            _ => Connectivity::New,
        }
    }
}

/// Native notifications for one session
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Remote side started sending a track
    Track(InboundTrack),
    /// ICE connectivity changed
    Connectivity(Connectivity),
    /// Locally gathered candidate (trickle only)
    LocalCandidate(IceCandidate),
}

/// Sender half handed to a connector; stamps events with their session
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward an event; dropped silently once the manager is gone
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send((self.generation, event));
    }
}

/// Creates native peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a connection whose callbacks report through `events`
    async fn connect(&self, events: PeerEventSender) -> Result<Arc<dyn PeerHandle>, RelayError>;
}

/// One native peer connection, answering side
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Apply the publisher offer as remote description
    async fn apply_offer(&self, sdp: &str) -> Result<(), RelayError>;

    /// Create and apply the local answer, returning its SDP
    async fn create_answer(&self) -> Result<String, RelayError>;

    /// Add a trickled remote candidate
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), RelayError>;

    /// Current transport statistics
    async fn stats(&self) -> Result<TransportStats, RelayError>;

    /// Unregister callbacks and release the connection
    async fn close(&self) -> Result<(), RelayError>;
}

/// Connector backed by webrtc-rs
pub struct WebRtcConnector {
    config: WebRTCConfig,
    ice_trickle: bool,
}

impl WebRtcConnector {
    /// Create a connector; `ice_trickle` is only honoured when the
    /// signaling transport can carry candidates
    pub fn new(config: WebRTCConfig, ice_trickle: bool) -> Self {
        Self { config, ice_trickle }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = self.config.ice_servers.iter().map(|server| {
            RTCIceServer {
                urls: server.normalized_urls(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            }
        }).collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, events: PeerEventSender) -> Result<Arc<dyn PeerHandle>, RelayError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()
            .map_err(|e| RelayError::Negotiation(format!("Failed to register codecs: {}", e)))?;

        // Interceptors provide NACK/RTCP reports for the inbound stream
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| RelayError::Negotiation(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api.new_peer_connection(self.rtc_config()).await
            .map_err(|e| RelayError::Negotiation(format!("Failed to create peer connection: {}", e)))?;
        let peer_connection = Arc::new(peer_connection);

        register_callbacks(&peer_connection, &events, self.ice_trickle);
        debug!("Peer connection created for session generation {}", events.generation());

        Ok(Arc::new(WebRtcPeer {
            peer_connection,
            ice_trickle: self.ice_trickle,
            gather_timeout: Duration::from_millis(self.config.gather_timeout_ms),
        }))
    }
}

fn register_callbacks(peer_connection: &Arc<RTCPeerConnection>, events: &PeerEventSender, ice_trickle: bool) {
    let track_events = events.clone();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let inbound = InboundTrack::new(
                TrackKey {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                    ssrc: track.ssrc(),
                },
                kind,
                track.codec().capability.mime_type,
                Arc::new(RemoteTrackSource(track)),
            );
            track_events.emit(PeerEvent::Track(inbound));
            Box::pin(async {})
        },
    ));

    let state_events = events.clone();
    peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        state_events.emit(PeerEvent::Connectivity(Connectivity::from(state)));
        Box::pin(async {})
    }));

    if ice_trickle {
        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => candidate_events.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));
    }
}

fn clear_callbacks(peer_connection: &RTCPeerConnection) {
    peer_connection.on_track(Box::new(|_, _, _| Box::pin(async {})));
    peer_connection.on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
    peer_connection.on_ice_candidate(Box::new(|_| Box::pin(async {})));
}

/// Reads RTP from a webrtc-rs remote track
struct RemoteTrackSource(Arc<TrackRemote>);

#[async_trait]
impl RtpSource for RemoteTrackSource {
    async fn read_packet(&self) -> Result<Bytes, RelayError> {
        let (packet, _) = self.0.read_rtp().await
            .map_err(|e| RelayError::Media(format!("Failed to read RTP: {}", e)))?;
        packet.marshal()
            .map_err(|e| RelayError::Media(format!("Failed to marshal RTP: {}", e)))
    }
}

/// webrtc-rs backed session handle
struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    ice_trickle: bool,
    gather_timeout: Duration,
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn apply_offer(&self, sdp: &str) -> Result<(), RelayError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| RelayError::Sdp(format!("Invalid SDP offer: {}", e)))?;

        self.peer_connection.set_remote_description(offer).await
            .map_err(|e| RelayError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn create_answer(&self) -> Result<String, RelayError> {
        let answer = self.peer_connection.create_answer(None).await
            .map_err(|e| RelayError::Negotiation(format!("Failed to create answer: {}", e)))?;

        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;

        self.peer_connection.set_local_description(answer.clone()).await
            .map_err(|e| RelayError::Sdp(format!("Failed to set local description: {}", e)))?;

        // Without trickle the answer has to carry every candidate
        if !self.ice_trickle
            && tokio::time::timeout(self.gather_timeout, gather_complete.recv()).await.is_err()
        {
            warn!("ICE gathering did not complete within {:?}, answering with partial candidates", self.gather_timeout);
        }

        if let Some(local_desc) = self.peer_connection.local_description().await {
            return Ok(local_desc.sdp);
        }

        Ok(answer.sdp)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), RelayError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.peer_connection.add_ice_candidate(candidate_init).await
            .map_err(|e| RelayError::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn stats(&self) -> Result<TransportStats, RelayError> {
        let report = self.peer_connection.get_stats().await;
        let mut candidate_pairs: Vec<CandidatePairStats> = report.reports.values()
            .filter_map(|entry| match entry {
                StatsReportType::CandidatePair(pair) => Some(CandidatePairStats {
                    state: match pair.state {
                        CandidatePairState::Succeeded => PairState::Succeeded,
                        CandidatePairState::InProgress => PairState::InProgress,
                        CandidatePairState::Failed => PairState::Failed,
                        _ => PairState::Waiting,
                    },
                    nominated: pair.nominated,
                    current_rtt_secs: Some(pair.current_round_trip_time).filter(|rtt| *rtt > 0.0),
                    legacy_rtt_secs: (pair.responses_received > 0)
                        .then(|| pair.total_round_trip_time / pair.responses_received as f64),
                }),
                _ => None,
            })
            .collect();
        // Report order is a hash map's; put the nominated pair first
        candidate_pairs.sort_by_key(|pair| !pair.nominated);
        Ok(TransportStats { candidate_pairs })
    }

    async fn close(&self) -> Result<(), RelayError> {
        clear_callbacks(&self.peer_connection);
        self.peer_connection.close().await
            .map_err(|e| RelayError::Connectivity(format!("Failed to close connection: {}", e)))
    }
}
