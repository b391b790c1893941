//! relay-viewer - headless WebRTC relay receiver
//!
//! Polls a signaling relay for the publisher's offer, answers it with a single
//! receive-only peer connection and rebuilds that connection whenever it
//! drops or negotiation fails.

pub mod config;
pub mod render;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use config::{Config, SignalingMode};
pub use render::{ProbeSink, RenderSink};
pub use transport::{SignalingClient, SignalingTransport};
pub use webrtc::{ConnectionManager, ConnectionState, ManagerHandle, RelayError, StatsSample};
