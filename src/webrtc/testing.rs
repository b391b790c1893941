//! In-memory doubles for the signaling transport, native peer layer and sink

use super::media_track::{FrameSize, InboundTrack, MediaKind, RtpSource, TrackKey};
use super::peer_connection::{PeerConnector, PeerEvent, PeerEventSender, PeerHandle};
use super::signaling::{Answer, IceCandidate, Offer};
use super::stats::TransportStats;
use super::RelayError;
use crate::render::RenderSink;
use crate::transport::SignalingTransport;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Default)]
struct TransportState {
    script: VecDeque<Option<String>>,
    standing: Option<String>,
    fetch_times: Vec<Instant>,
    answers: Vec<String>,
    sent_candidates: Vec<IceCandidate>,
    fail_next_fetch: Option<String>,
    fail_answers: bool,
    resets: usize,
}

/// Scripted relay: scripted polls are served first, then the standing slot
pub(crate) struct FakeTransport {
    state: Mutex<TransportState>,
    remote_tx: mpsc::UnboundedSender<IceCandidate>,
    remote_rx: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(TransportState::default()),
            remote_tx,
            remote_rx: Mutex::new(Some(remote_rx)),
        })
    }

    pub(crate) fn script<'a>(&self, polls: impl IntoIterator<Item = Option<&'a str>>) {
        self.state.lock().script.extend(polls.into_iter().map(|p| p.map(str::to_string)));
    }

    pub(crate) fn set_standing(&self, sdp: Option<&str>) {
        self.state.lock().standing = sdp.map(str::to_string);
    }

    pub(crate) fn fail_next_fetch(&self, reason: &str) {
        self.state.lock().fail_next_fetch = Some(reason.to_string());
    }

    pub(crate) fn fail_answers(&self, fail: bool) {
        self.state.lock().fail_answers = fail;
    }

    pub(crate) fn push_remote_candidate(&self, candidate: IceCandidate) {
        let _ = self.remote_tx.send(candidate);
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.state.lock().fetch_times.len()
    }

    pub(crate) fn fetch_times(&self) -> Vec<Instant> {
        self.state.lock().fetch_times.clone()
    }

    pub(crate) fn reset_count(&self) -> usize {
        self.state.lock().resets
    }

    pub(crate) fn answers(&self) -> Vec<String> {
        self.state.lock().answers.clone()
    }

    pub(crate) fn sent_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().sent_candidates.clone()
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn fetch_offer(&self) -> Result<Option<Offer>, RelayError> {
        let mut state = self.state.lock();
        state.fetch_times.push(Instant::now());
        if let Some(reason) = state.fail_next_fetch.take() {
            return Err(RelayError::Signaling(reason));
        }
        let sdp = match state.script.pop_front() {
            Some(scripted) => scripted,
            None => state.standing.clone(),
        };
        Ok(sdp.map(Offer::new))
    }

    async fn post_answer(&self, answer: &Answer) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        if state.fail_answers {
            return Err(RelayError::Signaling("answer rejected: 500".to_string()));
        }
        state.answers.push(answer.sdp.clone());
        Ok(())
    }

    async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), RelayError> {
        self.state.lock().sent_candidates.push(candidate.clone());
        Ok(())
    }

    async fn reset(&self) {
        self.state.lock().resets += 1;
    }

    fn take_remote_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
        self.remote_rx.lock().take()
    }

    fn supports_trickle(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Native connection lifecycle operations, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Create(u64),
    Close(u64),
}

#[derive(Default)]
struct PeerState {
    ops: Vec<Op>,
    senders: Vec<PeerEventSender>,
    offer_attempts: Vec<String>,
    remote_candidates: Vec<(u64, String)>,
    stats: TransportStats,
    fail_offers: bool,
    fail_stats: bool,
}

/// Connector handing out `FakeHandle`s that share one log
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<PeerState>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_offers(&self, fail: bool) {
        self.state.lock().fail_offers = fail;
    }

    /// Raise a native event on the most recent connection
    pub(crate) fn emit(&self, event: PeerEvent) {
        let sender = self.state.lock().senders.last().cloned();
        if let Some(sender) = sender {
            sender.emit(event);
        }
    }

    /// Raise a native event on the connection of `generation`
    pub(crate) fn emit_from(&self, generation: u64, event: PeerEvent) {
        let sender = self.state.lock().senders.iter()
            .find(|sender| sender.generation() == generation)
            .cloned();
        if let Some(sender) = sender {
            sender.emit(event);
        }
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    pub(crate) fn created(&self) -> usize {
        self.ops().iter().filter(|op| matches!(op, Op::Create(_))).count()
    }

    pub(crate) fn live(&self) -> usize {
        let ops = self.ops();
        let closed = ops.iter().filter(|op| matches!(op, Op::Close(_))).count();
        ops.len() - 2 * closed
    }

    pub(crate) fn offer_attempts(&self) -> Vec<String> {
        self.state.lock().offer_attempts.clone()
    }

    pub(crate) fn remote_candidates(&self) -> Vec<(u64, String)> {
        self.state.lock().remote_candidates.clone()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self, events: PeerEventSender) -> Result<Arc<dyn PeerHandle>, RelayError> {
        let generation = events.generation();
        let mut state = self.state.lock();
        state.ops.push(Op::Create(generation));
        state.senders.push(events);
        Ok(Arc::new(FakeHandle {
            generation,
            offer: Mutex::new(None),
            shared: self.state.clone(),
        }))
    }
}

/// Peer handle recording into its connector's log
pub(crate) struct FakeHandle {
    generation: u64,
    offer: Mutex<Option<String>>,
    shared: Arc<Mutex<PeerState>>,
}

impl FakeHandle {
    /// Standalone handle reporting fixed stats
    pub(crate) fn with_stats(stats: TransportStats) -> Arc<Self> {
        let shared = Arc::new(Mutex::new(PeerState {
            stats,
            ..Default::default()
        }));
        Arc::new(Self {
            generation: 0,
            offer: Mutex::new(None),
            shared,
        })
    }

    pub(crate) fn fail_stats(&self, fail: bool) {
        self.shared.lock().fail_stats = fail;
    }
}

#[async_trait]
impl PeerHandle for FakeHandle {
    async fn apply_offer(&self, sdp: &str) -> Result<(), RelayError> {
        let mut shared = self.shared.lock();
        shared.offer_attempts.push(sdp.to_string());
        if shared.fail_offers {
            return Err(RelayError::Sdp("rejected by native layer".to_string()));
        }
        *self.offer.lock() = Some(sdp.to_string());
        Ok(())
    }

    async fn create_answer(&self) -> Result<String, RelayError> {
        match self.offer.lock().as_ref() {
            Some(offer) => Ok(format!("answer:{}", offer)),
            None => Err(RelayError::Negotiation("no remote description".to_string())),
        }
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), RelayError> {
        self.shared.lock().remote_candidates.push((self.generation, candidate.candidate));
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, RelayError> {
        let shared = self.shared.lock();
        if shared.fail_stats {
            return Err(RelayError::Stats("stats unavailable".to_string()));
        }
        Ok(shared.stats.clone())
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.shared.lock().ops.push(Op::Close(self.generation));
        Ok(())
    }
}

/// RTP source that never yields a packet
struct SilentSource;

#[async_trait]
impl RtpSource for SilentSource {
    async fn read_packet(&self) -> Result<Bytes, RelayError> {
        std::future::pending().await
    }
}

pub(crate) fn video_track(ssrc: u32) -> InboundTrack {
    track(ssrc, MediaKind::Video, "video/VP8")
}

pub(crate) fn audio_track(ssrc: u32) -> InboundTrack {
    track(ssrc, MediaKind::Audio, "audio/opus")
}

fn track(ssrc: u32, kind: MediaKind, mime_type: &str) -> InboundTrack {
    InboundTrack::new(
        TrackKey {
            stream_id: "relay".to_string(),
            track_id: format!("track-{}", ssrc),
            ssrc,
        },
        kind,
        mime_type,
        Arc::new(SilentSource),
    )
}

#[derive(Default)]
struct SinkState {
    attached: Option<TrackKey>,
    attaches: usize,
    detaches: usize,
    size: FrameSize,
}

/// Sink recording attach/detach calls
#[derive(Default)]
pub(crate) struct FakeSink {
    state: Mutex<SinkState>,
}

impl FakeSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_size(size: FrameSize) -> Arc<Self> {
        let sink = Self::default();
        sink.state.lock().size = size;
        Arc::new(sink)
    }

    pub(crate) fn attaches(&self) -> usize {
        self.state.lock().attaches
    }

    pub(crate) fn detaches(&self) -> usize {
        self.state.lock().detaches
    }
}

impl RenderSink for FakeSink {
    fn attach(&self, track: InboundTrack) {
        let mut state = self.state.lock();
        state.attached = Some(track.key);
        state.attaches += 1;
    }

    fn detach(&self) {
        let mut state = self.state.lock();
        state.attached = None;
        state.detaches += 1;
    }

    fn frame_size(&self) -> FrameSize {
        self.state.lock().size
    }

    fn attached(&self) -> Option<TrackKey> {
        self.state.lock().attached.clone()
    }
}
