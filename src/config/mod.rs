//! Configuration management for relay-viewer

use crate::webrtc::RelayError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How offers reach the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignalingMode {
    /// Poll `GET /offer`, answer with `POST /answer`
    #[default]
    Http,
    /// Offers and candidates pushed over a socket
    Websocket,
}

impl SignalingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingMode::Http => "http",
            SignalingMode::Websocket => "websocket",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Some(SignalingMode::Http),
            "websocket" | "ws" => Some(SignalingMode::Websocket),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Signaling configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Reconnect delays
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Stats sampling
    #[serde(default)]
    pub stats: StatsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default)]
    pub mode: SignalingMode,

    /// Relay base URL
    #[serde(default = "default_signaling_url")]
    pub url: String,

    /// Socket path appended to `url` in websocket mode
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Delay between offer polls in ms
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-request timeout in ms
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            mode: SignalingMode::Http,
            url: default_signaling_url(),
            ws_path: default_ws_path(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl SignalingConfig {
    /// Socket URL derived from the base URL and path
    pub fn websocket_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/{}", base, self.ws_path.trim_start_matches('/'))
    }
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// URLs with `stun:` prepended where the scheme is missing
    pub fn normalized_urls(&self) -> Vec<String> {
        self.urls.iter().map(|url| {
            if ICE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                url.clone()
            } else {
                format!("stun:{}", url)
            }
        }).collect()
    }
}

const ICE_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// ICE servers handed to every new connection
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Trickle candidates over the signaling socket (websocket mode only)
    #[serde(default)]
    pub ice_trickle: bool,

    /// Maximum wait for ICE gathering before answering, in ms
    #[serde(default = "default_gather_timeout_ms")]
    pub gather_timeout_ms: u64,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_trickle: false,
            gather_timeout_ms: default_gather_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay after the transport disconnects or fails, in ms
    #[serde(default = "default_connectivity_retry_ms")]
    pub connectivity_retry_ms: u64,

    /// Delay after a negotiation error, in ms
    #[serde(default = "default_negotiation_retry_ms")]
    pub negotiation_retry_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            connectivity_retry_ms: default_connectivity_retry_ms(),
            negotiation_retry_ms: default_negotiation_retry_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_enabled")]
    pub enabled: bool,

    /// Sampling period in ms
    #[serde(default = "default_stats_interval_ms")]
    pub interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: default_stats_enabled(),
            interval_ms: default_stats_interval_ms(),
        }
    }
}

impl StatsConfig {
    /// Sampling period, `None` when disabled
    pub fn interval(&self) -> Option<Duration> {
        self.enabled.then(|| Duration::from_millis(self.interval_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let url = self.signaling.url.trim();
        if url.is_empty() {
            return Err(invalid("Signaling URL must not be empty"));
        }

        let http_url = url.starts_with("http://") || url.starts_with("https://");
        let ws_url = url.starts_with("ws://") || url.starts_with("wss://");
        match self.signaling.mode {
            SignalingMode::Http if !http_url => {
                return Err(invalid("Signaling URL must start with http:// or https:// in http mode"));
            }
            SignalingMode::Websocket if !http_url && !ws_url => {
                return Err(invalid("Signaling URL must start with ws://, wss://, http:// or https:// in websocket mode"));
            }
            _ => {}
        }

        if self.signaling.poll_interval_ms == 0 {
            return Err(invalid("Signaling poll interval must be non-zero"));
        }
        if self.signaling.request_timeout_ms == 0 {
            return Err(invalid("Signaling request timeout must be non-zero"));
        }

        if self.webrtc.ice_servers.is_empty() {
            return Err(invalid("At least one ICE server is required"));
        }
        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err(invalid("ICE server entry has no URLs"));
            }
            for url in &server.urls {
                if url.contains("://") {
                    return Err(invalid(format!("ICE server URL {} must use stun:, stuns:, turn: or turns:", url)));
                }
            }
            let turn = server.normalized_urls().iter().any(|url| url.starts_with("turn"));
            if turn && (server.username.is_none() || server.credential.is_none()) {
                return Err(invalid("TURN servers require username and credential"));
            }
        }

        if self.reconnect.connectivity_retry_ms == 0 || self.reconnect.negotiation_retry_ms == 0 {
            return Err(invalid("Reconnect delays must be non-zero"));
        }

        if self.stats.enabled && self.stats.interval_ms == 0 {
            return Err(invalid("Stats interval must be non-zero"));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> Box<dyn std::error::Error> {
    Box::new(RelayError::Config(msg.into()))
}


fn default_signaling_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_ws_path() -> String {
    "/ws/receiver".to_string()
}

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_request_timeout_ms() -> u64 { 5000 }
fn default_gather_timeout_ms() -> u64 { 5000 }
fn default_connectivity_retry_ms() -> u64 { 1000 }
fn default_negotiation_retry_ms() -> u64 { 2000 }
fn default_stats_interval_ms() -> u64 { 1000 }

fn default_stats_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun("stun:stun.l.google.com:19302")]
}
