//! Inbound media track and RTP inspection
//!
//! The receiver never decodes video. It only looks at RTP headers and, for
//! VP8, at keyframe headers to learn the frame geometry of the stream.

use super::RelayError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// RTP packet parser utilities
pub mod rtp_util {
    /// RTP version carried in the first two bits
    pub fn get_version(packet: &[u8]) -> Option<u8> {
        packet.first().map(|b| b >> 6)
    }

    /// Extract sequence number from RTP packet
    pub fn get_sequence(packet: &[u8]) -> Option<u16> {
        if packet.len() < 4 {
            return None;
        }
        Some(u16::from_be_bytes([packet[2], packet[3]]))
    }

    /// Check if marker bit is set
    pub fn is_marker_set(packet: &[u8]) -> bool {
        if packet.len() < 2 {
            return false;
        }
        (packet[1] & 0x80) != 0
    }

    /// Get RTP header length (including CSRCs and extensions)
    pub fn header_length(packet: &[u8]) -> Option<usize> {
        if packet.len() < 12 {
            return None;
        }

        let cc = (packet[0] & 0x0F) as usize;
        let mut len = 12 + cc * 4;

        // Check extension bit
        if (packet[0] & 0x10) != 0 {
            if packet.len() < len + 4 {
                return None;
            }
            let ext_len = u16::from_be_bytes([packet[len + 2], packet[len + 3]]) as usize;
            len += 4 + ext_len * 4;
        }

        Some(len)
    }

    /// Get payload data, excluding trailing padding
    pub fn get_payload(packet: &[u8]) -> Option<&[u8]> {
        let header_len = header_length(packet)?;
        let mut end = packet.len();
        if (packet[0] & 0x20) != 0 {
            let pad = *packet.last()? as usize;
            end = end.checked_sub(pad)?;
        }
        if end > header_len {
            Some(&packet[header_len..end])
        } else {
            None
        }
    }
}

/// VP8 payload inspection (RFC 7741 descriptor + RFC 6386 frame header)
pub mod vp8 {
    const KEYFRAME_START_CODE: [u8; 3] = [0x9d, 0x01, 0x2a];

    /// Offset of the VP8 payload header if this packet starts a frame
    fn frame_start(payload: &[u8]) -> Option<usize> {
        let first = *payload.first()?;
        let extended = first & 0x80 != 0;
        let start_of_partition = first & 0x10 != 0;
        let partition_id = first & 0x07;
        if !start_of_partition || partition_id != 0 {
            return None;
        }

        let mut offset = 1;
        if extended {
            let ext = *payload.get(offset)?;
            offset += 1;
            if ext & 0x80 != 0 {
                // PictureID, 15-bit when M is set
                let pid = *payload.get(offset)?;
                offset += if pid & 0x80 != 0 { 2 } else { 1 };
            }
            if ext & 0x40 != 0 {
                offset += 1; // TL0PICIDX
            }
            if ext & 0x30 != 0 {
                offset += 1; // TID/Y/KEYIDX
            }
        }
        (offset < payload.len()).then_some(offset)
    }

    /// Whether the payload begins a keyframe
    pub fn is_keyframe(payload: &[u8]) -> bool {
        match frame_start(payload) {
            Some(offset) => payload[offset] & 0x01 == 0,
            None => false,
        }
    }

    /// Frame width/height announced by a keyframe
    pub fn keyframe_size(payload: &[u8]) -> Option<(u32, u32)> {
        let offset = frame_start(payload)?;
        let header = payload.get(offset..offset + 10)?;
        if header[0] & 0x01 != 0 || header[3..6] != KEYFRAME_START_CODE {
            return None;
        }
        let width = u16::from_le_bytes([header[6], header[7]]) & 0x3FFF;
        let height = u16::from_le_bytes([header[8], header[9]]) & 0x3FFF;
        if width == 0 || height == 0 {
            return None;
        }
        Some((width as u32, height as u32))
    }
}

/// Decoded frame geometry as seen by the sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

/// Running observations over one inbound RTP stream
#[derive(Debug, Default, Clone)]
pub struct FrameProbe {
    pub packets: u64,
    pub bytes: u64,
    pub frames: u64,
    pub keyframes: u64,
    pub malformed: u64,
    pub last_sequence: Option<u16>,
    pub size: FrameSize,
    vp8: bool,
}

impl FrameProbe {
    pub fn new(mime_type: &str) -> Self {
        Self {
            vp8: mime_type.eq_ignore_ascii_case("video/vp8"),
            ..Default::default()
        }
    }

    /// Feed one raw RTP packet
    pub fn observe(&mut self, packet: &[u8]) {
        if rtp_util::get_version(packet) != Some(2) {
            self.malformed += 1;
            return;
        }
        let payload = match rtp_util::get_payload(packet) {
            Some(payload) => payload,
            None => {
                self.malformed += 1;
                return;
            }
        };

        self.packets += 1;
        self.bytes += packet.len() as u64;
        self.last_sequence = rtp_util::get_sequence(packet);
        if rtp_util::is_marker_set(packet) {
            self.frames += 1;
        }

        if self.vp8 && vp8::is_keyframe(payload) {
            self.keyframes += 1;
            if let Some((width, height)) = vp8::keyframe_size(payload) {
                self.size = FrameSize { width, height };
            }
        }
    }
}

/// Media kind of an inbound track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Identity of a track; equal keys mean the same stream is already attached
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub stream_id: String,
    pub track_id: String,
    pub ssrc: u32,
}

/// Source of raw RTP packets for an inbound track
#[async_trait]
pub trait RtpSource: Send + Sync {
    /// Next marshalled RTP packet; an error ends the stream
    async fn read_packet(&self) -> Result<Bytes, RelayError>;
}

/// Handle to an inbound media track handed to the render sink
#[derive(Clone)]
pub struct InboundTrack {
    pub key: TrackKey,
    pub kind: MediaKind,
    pub mime_type: String,
    source: Arc<dyn RtpSource>,
}

impl InboundTrack {
    pub fn new(key: TrackKey, kind: MediaKind, mime_type: impl Into<String>, source: Arc<dyn RtpSource>) -> Self {
        Self {
            key,
            kind,
            mime_type: mime_type.into(),
            source,
        }
    }

    pub async fn read_packet(&self) -> Result<Bytes, RelayError> {
        self.source.read_packet().await
    }
}

impl fmt::Debug for InboundTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundTrack")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("mime_type", &self.mime_type)
            .finish()
    }
}
