//! WebRTC Session Management
//!
//! `ConnectionManager` owns the single receiving session and runs as one
//! tokio task. It acquires a fresh offer, answers it, hands the inbound video
//! track to the render sink and rebuilds the session from scratch whenever
//! the transport drops or negotiation fails. Native callbacks reach it as
//! generation-tagged `PeerEvent`s, so events from a closed session are
//! discarded.

use super::peer_connection::{Connectivity, PeerConnector, PeerEvent, PeerEventSender, PeerHandle};
use super::media_track::{InboundTrack, MediaKind};
use super::signaling::{Answer, IceCandidate, Offer};
use super::stats::{StatsMonitor, StatsObserver};
use super::RelayError;
use crate::config::Config;
use crate::render::RenderSink;
use crate::transport::SignalingClient;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet
    Idle,
    /// Waiting for an offer or answering it
    Negotiating,
    /// Video track attached
    Connected,
    /// Transport lost connectivity
    Disconnected,
    /// Transport or negotiation failed
    Failed,
    /// Waiting to start over
    Reconnecting,
    /// Stopped (terminal)
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Manager timing
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Delay before restarting after connectivity loss
    pub reconnect_delay: Duration,
    /// Delay before restarting after a negotiation error
    pub negotiation_retry_delay: Duration,
    /// Stats sampling period, `None` disables sampling
    pub stats_interval: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(1000),
            negotiation_retry_delay: Duration::from_millis(2000),
            stats_interval: Some(Duration::from_millis(1000)),
        }
    }
}

impl From<&Config> for ManagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(config.reconnect.connectivity_retry_ms),
            negotiation_retry_delay: Duration::from_millis(config.reconnect.negotiation_retry_ms),
            stats_interval: config.stats.interval(),
        }
    }
}

/// The live negotiation/connection instance
struct PeerSession {
    id: String,
    generation: u64,
    handle: Arc<dyn PeerHandle>,
    offer_sdp: String,
    /// Remote description applied; candidates can go straight in
    remote_applied: bool,
    created_at: std::time::Instant,
}

impl PeerSession {
    fn new(generation: u64, handle: Arc<dyn PeerHandle>, offer_sdp: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            generation,
            handle,
            offer_sdp,
            remote_applied: false,
            created_at: std::time::Instant::now(),
        }
    }
}

/// Control handle for a spawned manager
pub struct ManagerHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ManagerHandle {
    /// Request shutdown; idempotent. Dropping the handle has the same effect.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the manager reached `Closed`
    pub async fn closed(&self) {
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }
}

/// Single-session reconnecting receiver
pub struct ConnectionManager {
    config: ManagerConfig,
    signaling: SignalingClient,
    connector: Arc<dyn PeerConnector>,
    sink: Arc<dyn RenderSink>,
    stats: Option<StatsMonitor>,
    state_tx: watch::Sender<ConnectionState>,
    session: Option<PeerSession>,
    generation: u64,
    last_consumed_sdp: Option<String>,
    pending_candidates: Vec<IceCandidate>,
    reconnect_at: Option<Instant>,
    events_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, PeerEvent)>,
    remote_candidates: Option<mpsc::UnboundedReceiver<IceCandidate>>,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        signaling: SignalingClient,
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn RenderSink>,
        observer: Option<Arc<dyn StatsObserver>>,
    ) -> Self {
        let stats = match (config.stats_interval, observer) {
            (Some(interval), Some(observer)) => Some(StatsMonitor::new(interval, observer)),
            _ => None,
        };
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            config,
            signaling,
            connector,
            sink,
            stats,
            state_tx,
            session: None,
            generation: 0,
            last_consumed_sdp: None,
            pending_candidates: Vec::new(),
            reconnect_at: None,
            events_tx,
            events_rx,
            remote_candidates: None,
        }
    }

    /// Start the manager task
    pub fn spawn(self) -> ManagerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state_rx = self.state_tx.subscribe();
        tokio::spawn(self.run(stop_rx));
        ManagerHandle { stop_tx, state_rx }
    }

    async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        info!("Connection manager started");
        self.remote_candidates = self.signaling.take_remote_candidates();
        self.start(&mut stop_rx).await;

        loop {
            if is_stopped(&stop_rx) {
                break;
            }
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                biased;
                _ = wait_stopped(&mut stop_rx) => break,
                _ = time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    if !is_stopped(&stop_rx) {
                        self.start(&mut stop_rx).await;
                    }
                }
                Some((generation, event)) = self.events_rx.recv() => {
                    self.handle_event(generation, event).await;
                }
                candidate = next_candidate(&mut self.remote_candidates) => match candidate {
                    Some(candidate) => self.handle_remote_candidate(candidate).await,
                    None => self.remote_candidates = None,
                },
            }
        }

        self.shutdown().await;
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("Connection state: {} -> {}", previous, state);
        }
    }

    /// Replace the session with one built from a fresh offer
    async fn start(&mut self, stop_rx: &mut watch::Receiver<bool>) {
        self.teardown().await;
        self.set_state(ConnectionState::Negotiating);

        let acquired = tokio::select! {
            biased;
            _ = wait_stopped(stop_rx) => return,
            offer = self.signaling.acquire_fresh_offer(self.last_consumed_sdp.as_deref()) => offer,
        };
        let offer = match acquired {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Offer acquisition failed: {}", e);
                self.schedule_reconnect(ConnectionState::Failed, self.config.negotiation_retry_delay);
                return;
            }
        };
        // Consumed even if negotiation fails, so a re-sent copy counts as stale
        self.last_consumed_sdp = Some(offer.sdp.clone());

        let negotiated = tokio::select! {
            biased;
            _ = wait_stopped(stop_rx) => return,
            result = self.negotiate(offer) => result,
        };
        if let Err(e) = negotiated {
            warn!("Negotiation failed: {}", e);
            self.schedule_reconnect(ConnectionState::Failed, self.config.negotiation_retry_delay);
        }
    }

    async fn negotiate(&mut self, offer: Offer) -> Result<(), RelayError> {
        self.generation += 1;
        let events = PeerEventSender::new(self.generation, self.events_tx.clone());
        let handle = self.connector.connect(events).await?;
        let session = PeerSession::new(self.generation, handle.clone(), offer.sdp.clone());
        info!(
            "Created session {} (generation {}, offer {} bytes)",
            session.id,
            session.generation,
            session.offer_sdp.len()
        );
        self.session = Some(session);

        handle.apply_offer(&offer.sdp).await?;
        if let Some(session) = self.session.as_mut() {
            session.remote_applied = true;
        }

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = handle.add_remote_candidate(candidate).await {
                warn!("Failed to apply queued candidate: {}", e);
            }
        }

        let answer = handle.create_answer().await?;
        self.signaling.submit_answer(&Answer::new(answer)).await?;
        debug!("Answer submitted for generation {}", self.generation);
        Ok(())
    }

    async fn handle_event(&mut self, generation: u64, event: PeerEvent) {
        if self.session.as_ref().map(|s| s.generation) != Some(generation) {
            debug!("Dropping event from closed session (generation {})", generation);
            return;
        }

        match event {
            PeerEvent::Track(track) => self.on_track(track),
            PeerEvent::Connectivity(connectivity) => self.on_connectivity(connectivity),
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.signaling.publish_candidate(&candidate).await {
                    warn!("Failed to publish local candidate: {}", e);
                }
            }
        }
    }

    fn on_track(&mut self, track: InboundTrack) {
        if track.kind != MediaKind::Video {
            debug!("Ignoring {} track {}", track.mime_type, track.key.track_id);
            return;
        }
        if self.reconnect_at.is_some() {
            debug!("Ignoring track {} while a restart is pending", track.key.track_id);
            return;
        }
        if self.sink.attached().as_ref() == Some(&track.key) {
            debug!("Track {} already attached", track.key.track_id);
            return;
        }

        self.sink.attach(track);
        self.set_state(ConnectionState::Connected);
        self.start_stats();
    }

    fn on_connectivity(&mut self, connectivity: Connectivity) {
        debug!("ICE connectivity: {:?}", connectivity);
        match connectivity {
            Connectivity::Disconnected | Connectivity::Failed => {
                if self.reconnect_at.is_some() {
                    debug!("Reconnect already scheduled");
                    return;
                }
                let state = if connectivity == Connectivity::Failed {
                    ConnectionState::Failed
                } else {
                    ConnectionState::Disconnected
                };
                self.schedule_reconnect(state, self.config.reconnect_delay);
            }
            Connectivity::Connected | Connectivity::Completed => {
                if self.reconnect_at.is_none()
                    && self.sink.attached().is_some()
                    && self.state() != ConnectionState::Connected
                {
                    self.set_state(ConnectionState::Connected);
                    self.start_stats();
                }
            }
            _ => {}
        }
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        let target = match &self.session {
            Some(session) if session.remote_applied && self.reconnect_at.is_none() => session.handle.clone(),
            _ => {
                debug!("Queueing remote candidate until the next remote description");
                self.pending_candidates.push(candidate);
                return;
            }
        };
        if let Err(e) = target.add_remote_candidate(candidate).await {
            warn!("Failed to add remote candidate: {}", e);
        }
    }

    fn start_stats(&mut self) {
        if let (Some(monitor), Some(session)) = (self.stats.as_mut(), self.session.as_ref()) {
            monitor.start(session.handle.clone(), self.sink.clone());
        }
    }

    fn stop_stats(&mut self) {
        if let Some(monitor) = self.stats.as_mut() {
            monitor.stop();
        }
    }

    fn schedule_reconnect(&mut self, cause: ConnectionState, delay: Duration) {
        self.stop_stats();
        self.set_state(cause);
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect_at = Some(Instant::now() + delay);
        info!("Restarting in {:?}", delay);
    }

    /// Close the current session and everything tied to it
    async fn teardown(&mut self) {
        self.stop_stats();
        self.sink.detach();
        if let Some(session) = self.session.take() {
            debug!(
                "Closing session {} (generation {}, up {:?})",
                session.id,
                session.generation,
                session.created_at.elapsed()
            );
            if let Err(e) = session.handle.close().await {
                warn!("Failed to close session {}: {}", session.id, e);
            }
        }
    }

    async fn shutdown(&mut self) {
        self.reconnect_at = None;
        self.teardown().await;
        self.pending_candidates.clear();
        self.set_state(ConnectionState::Closed);
        info!("Connection manager stopped");
    }
}

fn is_stopped(stop_rx: &watch::Receiver<bool>) -> bool {
    *stop_rx.borrow() || stop_rx.has_changed().is_err()
}

/// Resolves once stop is requested or the handle is dropped
async fn wait_stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

async fn next_candidate(rx: &mut Option<mpsc::UnboundedReceiver<IceCandidate>>) -> Option<IceCandidate> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::stats::StatsSample;
    use crate::webrtc::testing::{audio_track, video_track, FakeConnector, FakeSink, FakeTransport, Op};
    use parking_lot::Mutex;

    const POLL: Duration = Duration::from_millis(1000);

    struct Harness {
        transport: Arc<FakeTransport>,
        connector: Arc<FakeConnector>,
        sink: Arc<FakeSink>,
        samples: Arc<Mutex<Vec<StatsSample>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                transport: FakeTransport::new(),
                connector: FakeConnector::new(),
                sink: FakeSink::new(),
                samples: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn spawn(&self) -> ManagerHandle {
            let samples = self.samples.clone();
            let observer: Arc<dyn StatsObserver> = Arc::new(move |sample: StatsSample| samples.lock().push(sample));
            ConnectionManager::new(
                ManagerConfig::default(),
                SignalingClient::new(self.transport.clone(), POLL),
                self.connector.clone(),
                self.sink.clone(),
                Some(observer),
            )
            .spawn()
        }

        fn sample_count(&self) -> usize {
            self.samples.lock().len()
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    async fn sleep_ms(ms: u64) {
        time::sleep(Duration::from_millis(ms)).await;
    }

    fn connect_video(h: &Harness, ssrc: u32) {
        h.connector.emit(PeerEvent::Track(video_track(ssrc)));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_config_from_file_settings() {
        let mut config = Config::default();
        config.reconnect.connectivity_retry_ms = 250;
        config.stats.enabled = false;
        let manager = ManagerConfig::from(&config);
        assert_eq!(manager.reconnect_delay, Duration::from_millis(250));
        assert_eq!(manager.negotiation_retry_delay, Duration::from_millis(2000));
        assert_eq!(manager.stats_interval, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_after_empty_polls() {
        let h = Harness::new();
        h.transport.script([None, None, None, Some("X")]);
        let started = Instant::now();
        let handle = h.spawn();

        sleep_ms(2999).await;
        assert!(h.transport.answers().is_empty());
        sleep_ms(2).await;
        assert_eq!(h.transport.answers(), vec!["answer:X".to_string()]);
        assert_eq!(h.transport.fetch_times().last().copied(), Some(started + Duration::from_millis(3000)));
        assert_eq!(handle.state(), ConnectionState::Negotiating);

        connect_video(&h, 1);
        eventually(|| handle.state() == ConnectionState::Connected).await;
        assert_eq!(h.sink.attaches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_offer_never_answered() {
        let h = Harness::new();
        h.transport.set_standing(Some("A"));
        let handle = h.spawn();

        eventually(|| h.transport.answers().len() == 1).await;
        connect_video(&h, 1);
        eventually(|| handle.state() == ConnectionState::Connected).await;

        h.connector.emit(PeerEvent::Connectivity(Connectivity::Failed));
        sleep_ms(10_000).await;

        assert_eq!(h.transport.answers(), vec!["answer:A".to_string()]);
        assert_eq!(h.connector.offer_attempts(), vec!["A".to_string()]);
        assert!(h.transport.fetch_count() > 5);
        assert_eq!(h.transport.reset_count(), 1);
        assert_eq!(handle.state(), ConnectionState::Negotiating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_offer_negotiated_after_failure() {
        let h = Harness::new();
        h.transport.script([Some("A")]);
        let handle = h.spawn();

        eventually(|| h.transport.answers().len() == 1).await;
        connect_video(&h, 1);
        eventually(|| handle.state() == ConnectionState::Connected).await;

        h.transport.set_standing(Some("B"));
        h.connector.emit(PeerEvent::Connectivity(Connectivity::Disconnected));
        sleep_ms(1500).await;

        assert_eq!(h.transport.answers(), vec!["answer:A".to_string(), "answer:B".to_string()]);
        assert_eq!(h.connector.offer_attempts(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(h.connector.ops(), vec![Op::Create(1), Op::Close(1), Op::Create(2)]);
        assert_eq!(h.sink.detaches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_waits_configured_delay() {
        let h = Harness::new();
        h.transport.set_standing(Some("A"));
        let handle = h.spawn();

        eventually(|| h.transport.answers().len() == 1).await;
        connect_video(&h, 1);
        eventually(|| handle.state() == ConnectionState::Connected).await;
        let fetches = h.transport.fetch_count();

        let failed_at = Instant::now();
        h.connector.emit(PeerEvent::Connectivity(Connectivity::Disconnected));
        h.connector.emit(PeerEvent::Connectivity(Connectivity::Failed));
        eventually(|| handle.state() == ConnectionState::Reconnecting).await;

        sleep_ms(999).await;
        assert_eq!(h.transport.fetch_count(), fetches);
        assert_eq!(h.connector.live(), 1);

        sleep_ms(2).await;
        assert_eq!(h.transport.fetch_count(), fetches + 1);
        assert_eq!(h.transport.fetch_times().last().copied(), Some(failed_at + Duration::from_millis(1000)));
        assert_eq!(h.connector.live(), 0);
        assert_eq!(handle.state(), ConnectionState::Negotiating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_live_session_across_reconnects() {
        let h = Harness::new();
        h.transport.script([Some("A")]);
        let _handle = h.spawn();
        eventually(|| h.transport.answers().len() == 1).await;

        for (round, sdp) in ["B", "C", "D"].into_iter().enumerate() {
            h.transport.set_standing(Some(sdp));
            h.connector.emit(PeerEvent::Connectivity(Connectivity::Failed));
            sleep_ms(1500).await;
            assert_eq!(h.transport.answers().len(), round + 2);
        }

        let mut live = 0i32;
        for op in h.connector.ops() {
            match op {
                Op::Create(_) => {
                    assert_eq!(live, 0, "created while another session was live");
                    live += 1;
                }
                Op::Close(_) => live -= 1,
            }
        }
        assert_eq!(h.connector.created(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_negotiation_marks_offer_consumed() {
        let h = Harness::new();
        h.connector.fail_offers(true);
        h.transport.set_standing(Some("X"));
        let started = Instant::now();
        let handle = h.spawn();

        eventually(|| handle.state() == ConnectionState::Reconnecting).await;
        sleep_ms(1999).await;
        assert_eq!(h.transport.fetch_count(), 1);

        sleep_ms(501).await;
        assert_eq!(h.transport.fetch_count(), 2);
        assert_eq!(h.transport.fetch_times()[1], started + Duration::from_millis(2000));
        assert_eq!(h.connector.offer_attempts(), vec!["X".to_string()]);
        assert!(h.transport.answers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_answer_retries_after_negotiation_delay() {
        let h = Harness::new();
        h.transport.fail_answers(true);
        h.transport.script([Some("A")]);
        let handle = h.spawn();

        eventually(|| handle.state() == ConnectionState::Reconnecting).await;
        h.transport.fail_answers(false);
        h.transport.set_standing(Some("B"));

        sleep_ms(2001).await;
        assert_eq!(h.transport.answers(), vec!["answer:B".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_retries_after_negotiation_delay() {
        let h = Harness::new();
        h.transport.fail_next_fetch("connection refused");
        h.transport.set_standing(Some("A"));
        let handle = h.spawn();

        eventually(|| handle.state() == ConnectionState::Reconnecting).await;
        sleep_ms(1999).await;
        assert!(h.transport.answers().is_empty());
        sleep_ms(2).await;
        assert_eq!(h.transport.answers(), vec!["answer:A".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_only_while_connected() {
        let h = Harness::new();
        h.transport.set_standing(Some("A"));
        let handle = h.spawn();

        eventually(|| h.transport.answers().len() == 1).await;
        sleep_ms(3000).await;
        assert_eq!(h.sample_count(), 0);

        connect_video(&h, 1);
        eventually(|| handle.state() == ConnectionState::Connected).await;
        sleep_ms(2500).await;
        assert_eq!(h.sample_count(), 2);

        h.connector.emit(PeerEvent::Connectivity(Connectivity::Disconnected));
        eventually(|| handle.state() == ConnectionState::Reconnecting).await;
        sleep_ms(1500).await;
        assert_eq!(h.sample_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_final() {
        let h = Harness::new();
        h.transport.set_standing(Some("A"));
        let handle = h.spawn();

        eventually(|| h.transport.answers().len() == 1).await;
        h.connector.emit(PeerEvent::Connectivity(Connectivity::Failed));
        eventually(|| handle.state() == ConnectionState::Reconnecting).await;

        handle.stop();
        handle.stop();
        handle.closed().await;
        let fetches = h.transport.fetch_count();

        sleep_ms(10_000).await;
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(h.transport.fetch_count(), fetches);
        assert_eq!(h.connector.ops(), vec![Op::Create(1), Op::Close(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_polling() {
        let h = Harness::new();
        let handle = h.spawn();

        sleep_ms(2500).await;
        assert_eq!(h.transport.fetch_count(), 3);

        handle.stop();
        handle.closed().await;
        sleep_ms(5000).await;
        assert_eq!(h.transport.fetch_count(), 3);
        assert_eq!(h.connector.created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_manager() {
        let h = Harness::new();
        let handle = h.spawn();
        let mut state = handle.subscribe();
        drop(handle);

        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
        let fetches = h.transport.fetch_count();
        sleep_ms(5000).await;
        assert_eq!(h.transport.fetch_count(), fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_closed_session_dropped() {
        let h = Harness::new();
        h.transport.script([Some("A")]);
        let handle = h.spawn();
        eventually(|| h.transport.answers().len() == 1).await;

        h.transport.set_standing(Some("B"));
        h.connector.emit(PeerEvent::Connectivity(Connectivity::Failed));
        sleep_ms(1500).await;
        assert_eq!(h.transport.answers().len(), 2);

        h.connector.emit_from(1, PeerEvent::Track(video_track(1)));
        h.connector.emit_from(1, PeerEvent::Connectivity(Connectivity::Failed));
        sleep_ms(100).await;
        assert_eq!(h.sink.attaches(), 0);
        assert_eq!(handle.state(), ConnectionState::Negotiating);

        h.connector.emit_from(2, PeerEvent::Track(video_track(2)));
        eventually(|| handle.state() == ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_audio_tracks_ignored() {
        let h = Harness::new();
        h.transport.script([Some("A")]);
        let handle = h.spawn();
        eventually(|| h.transport.answers().len() == 1).await;

        h.connector.emit(PeerEvent::Track(audio_track(9)));
        sleep_ms(10).await;
        assert_eq!(h.sink.attaches(), 0);
        assert_eq!(handle.state(), ConnectionState::Negotiating);

        connect_video(&h, 1);
        connect_video(&h, 1);
        eventually(|| handle.state() == ConnectionState::Connected).await;
        sleep_ms(10).await;
        assert_eq!(h.sink.attaches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_recovery_reasserts_connected() {
        let h = Harness::new();
        h.transport.script([Some("A")]);
        let handle = h.spawn();
        eventually(|| h.transport.answers().len() == 1).await;

        h.connector.emit(PeerEvent::Connectivity(Connectivity::Connected));
        sleep_ms(10).await;
        assert_eq!(handle.state(), ConnectionState::Negotiating);

        connect_video(&h, 1);
        h.connector.emit(PeerEvent::Connectivity(Connectivity::Completed));
        eventually(|| handle.state() == ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_candidates_follow_remote_description() {
        let h = Harness::new();
        h.transport.script([Some("A")]);
        let handle = h.spawn();
        eventually(|| h.transport.answers().len() == 1).await;

        let candidate = |c: &str| IceCandidate {
            candidate: c.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        h.transport.push_remote_candidate(candidate("cand-a"));
        eventually(|| h.connector.remote_candidates().len() == 1).await;

        h.connector.emit(PeerEvent::Connectivity(Connectivity::Failed));
        eventually(|| handle.state() == ConnectionState::Reconnecting).await;
        h.transport.push_remote_candidate(candidate("cand-b"));
        h.transport.set_standing(Some("B"));
        sleep_ms(1500).await;

        assert_eq!(
            h.connector.remote_candidates(),
            vec![(1, "cand-a".to_string()), (2, "cand-b".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_candidates_published() {
        let h = Harness::new();
        h.transport.script([Some("A")]);
        let _handle = h.spawn();
        eventually(|| h.transport.answers().len() == 1).await;

        h.connector.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 192.0.2.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        eventually(|| h.transport.sent_candidates().len() == 1).await;
    }
}
