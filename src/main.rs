//! relay-viewer - Main entry point
//!
//! Receives the relayed video stream, keeps the session alive across
//! publisher restarts and logs connection health until interrupted.

mod args;

use args::Args;
use clap::Parser;
use log::{error, info};
use relay_viewer::render::ProbeSink;
use relay_viewer::transport::SignalingClient;
use relay_viewer::webrtc::{ConnectionManager, ManagerConfig, StatsObserver, StatsSample, WebRtcConnector};
use std::env;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let mut config = args.load_config()?;

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose { "debug".to_string() } else { config.logging.level.clone() };
    env_logger::Builder::new()
        .parse_filters(&env::var("RELAY_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("relay-viewer v{}", env!("CARGO_PKG_VERSION"));
    info!("{}", args.config_source());

    args.apply_overrides(&mut config)?;
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    info!(
        "Signaling: {} at {}",
        config.signaling.mode.as_str(),
        config.signaling.url
    );

    let signaling = SignalingClient::from_config(&config.signaling)?;
    // Candidates can only be trickled when the transport carries them
    let trickle = config.webrtc.ice_trickle && signaling.supports_trickle();
    let connector = Arc::new(WebRtcConnector::new(config.webrtc.clone(), trickle));
    let sink = Arc::new(ProbeSink::new());
    let observer: Arc<dyn StatsObserver> = Arc::new(log_sample);

    let handle = ConnectionManager::new(
        ManagerConfig::from(&config),
        signaling,
        connector,
        sink.clone(),
        Some(observer),
    )
    .spawn();

    // Wait for shutdown signal
    let _ = signal::ctrl_c().await;
    info!("Shutdown signal received");

    let probe = sink.probe();
    info!(
        "Received {} packets, {} frames, {} keyframes ({} malformed)",
        probe.packets, probe.frames, probe.keyframes, probe.malformed
    );

    handle.stop();
    handle.closed().await;
    info!("relay-viewer stopped");
    Ok(())
}

fn log_sample(sample: StatsSample) {
    let rtt = match sample.rtt_millis {
        Some(rtt) => format!("{:.1}", rtt),
        None => "n/a".to_string(),
    };
    info!("rtt={} ms resolution={}x{}", rtt, sample.video_width, sample.video_height);
}
