use clap::Parser;
use std::path::PathBuf;

use relay_viewer::config::{self, IceServerConfig, SignalingMode};
use relay_viewer::webrtc::RelayError;

#[derive(Parser, Debug)]
#[command(name = "relay-viewer")]
#[command(author = "Selkies Team")]
#[command(version)]
#[command(about = "Headless WebRTC relay receiver", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "relay-viewer.toml")]
    pub config: PathBuf,

    /// Relay base URL
    #[arg(long)]
    pub signaling_url: Option<String>,

    /// Signaling mode (http or websocket)
    #[arg(long)]
    pub mode: Option<String>,

    /// STUN/TURN server URL, repeatable; replaces configured servers
    #[arg(long = "stun")]
    pub stun: Vec<String>,

    /// Stats sampling period in ms
    #[arg(long)]
    pub stats_interval_ms: Option<u64>,

    /// Disable stats sampling
    #[arg(long, action)]
    pub no_stats: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Startup log line naming where the configuration came from
    pub fn config_source(&self) -> String {
        if self.config.exists() {
            format!("Loaded configuration from {:?}", self.config)
        } else {
            format!("No configuration file at {:?}, using defaults", self.config)
        }
    }

    /// Apply command line overrides on top of the loaded file
    pub fn apply_overrides(&self, config: &mut config::Config) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(ref url) = self.signaling_url {
            config.signaling.url = url.clone();
        }
        if let Some(ref mode) = self.mode {
            config.signaling.mode = SignalingMode::parse(mode)
                .ok_or_else(|| RelayError::Config(format!("Unknown signaling mode: {}", mode)))?;
        }
        if !self.stun.is_empty() {
            config.webrtc.ice_servers = self.stun.iter().cloned().map(IceServerConfig::stun).collect();
        }
        if let Some(interval) = self.stats_interval_ms {
            config.stats.interval_ms = interval;
        }
        if self.no_stats {
            config.stats.enabled = false;
        }
        Ok(())
    }
}
