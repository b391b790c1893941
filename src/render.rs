//! Render sink for inbound video
//!
//! The receiver is headless: `ProbeSink` reads the attached track and keeps
//! running RTP/VP8 observations instead of decoding pictures.

use crate::webrtc::media_track::{FrameProbe, FrameSize, InboundTrack, TrackKey};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Destination for the single inbound video track
pub trait RenderSink: Send + Sync {
    /// Start presenting `track`, replacing whatever was attached
    fn attach(&self, track: InboundTrack);

    /// Stop presenting; safe to call when nothing is attached
    fn detach(&self);

    /// Geometry of the current video, 0x0 when unknown
    fn frame_size(&self) -> FrameSize;

    /// Key of the attached track
    fn attached(&self) -> Option<TrackKey>;
}

struct Attachment {
    key: TrackKey,
    probe: Arc<Mutex<FrameProbe>>,
    reader: JoinHandle<()>,
}

/// Headless sink that inspects RTP of the attached track
#[derive(Default)]
pub struct ProbeSink {
    current: Mutex<Option<Attachment>>,
}

impl ProbeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the attached track's observations
    pub fn probe(&self) -> FrameProbe {
        self.current.lock().as_ref()
            .map(|attachment| attachment.probe.lock().clone())
            .unwrap_or_default()
    }
}

impl RenderSink for ProbeSink {
    fn attach(&self, track: InboundTrack) {
        self.detach();

        let probe = Arc::new(Mutex::new(FrameProbe::new(&track.mime_type)));
        let reader_probe = probe.clone();
        let key = track.key.clone();
        info!("Attached track {} ({}, ssrc {})", key.track_id, track.mime_type, key.ssrc);

        let reader = tokio::spawn(async move {
            loop {
                match track.read_packet().await {
                    Ok(packet) => reader_probe.lock().observe(&packet),
                    Err(e) => {
                        debug!("Track {} ended: {}", track.key.track_id, e);
                        break;
                    }
                }
            }
        });

        *self.current.lock() = Some(Attachment { key, probe, reader });
    }

    fn detach(&self) {
        if let Some(attachment) = self.current.lock().take() {
            attachment.reader.abort();
            debug!("Detached track {}", attachment.key.track_id);
        }
    }

    fn frame_size(&self) -> FrameSize {
        self.current.lock().as_ref()
            .map(|attachment| attachment.probe.lock().size)
            .unwrap_or_default()
    }

    fn attached(&self) -> Option<TrackKey> {
        self.current.lock().as_ref().map(|attachment| attachment.key.clone())
    }
}

impl Drop for ProbeSink {
    fn drop(&mut self) {
        self.detach();
    }
}
