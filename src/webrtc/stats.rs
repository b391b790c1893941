//! Periodic connection health sampling
//!
//! While a session is connected the monitor polls the native transport for
//! candidate pair statistics and the sink for frame geometry, then hands a
//! `StatsSample` to the configured observer.

use super::peer_connection::PeerHandle;
use crate::render::RenderSink;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// One health measurement
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSample {
    /// Round-trip time of the active candidate pair, if known
    pub rtt_millis: Option<f64>,
    pub video_width: u32,
    pub video_height: u32,
    pub sampled_at: SystemTime,
}

/// Receives stats samples
pub trait StatsObserver: Send + Sync {
    fn on_sample(&self, sample: StatsSample);
}

impl<F> StatsObserver for F
where
    F: Fn(StatsSample) + Send + Sync,
{
    fn on_sample(&self, sample: StatsSample) {
        self(sample)
    }
}

/// ICE candidate pair check state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Waiting,
    InProgress,
    Failed,
    Succeeded,
}

/// Candidate pair entry of a stats report
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePairStats {
    pub state: PairState,
    pub nominated: bool,
    /// Most recent RTT in seconds
    pub current_rtt_secs: Option<f64>,
    /// Average RTT in seconds (total / responses)
    pub legacy_rtt_secs: Option<f64>,
}

/// Transport statistics relevant to the receiver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub candidate_pairs: Vec<CandidatePairStats>,
}

impl TransportStats {
    /// RTT of the first succeeded pair, preferring the current value
    pub fn active_rtt_millis(&self) -> Option<f64> {
        let pair = self.candidate_pairs.iter()
            .find(|pair| pair.state == PairState::Succeeded)?;
        pair.current_rtt_secs
            .or(pair.legacy_rtt_secs)
            .map(|secs| secs * 1000.0)
    }
}

/// Timer-driven stats sampler for the live session
pub struct StatsMonitor {
    interval: Duration,
    observer: Arc<dyn StatsObserver>,
    task: Option<JoinHandle<()>>,
    /// Cleared under lock on stop; a sample is only published while held and set
    gate: Arc<Mutex<bool>>,
}

impl StatsMonitor {
    pub fn new(interval: Duration, observer: Arc<dyn StatsObserver>) -> Self {
        Self {
            interval,
            observer,
            task: None,
            gate: Arc::new(Mutex::new(false)),
        }
    }

    /// Start sampling `session`; any previous run is stopped first
    pub fn start(&mut self, session: Arc<dyn PeerHandle>, sink: Arc<dyn RenderSink>) {
        self.stop();

        let gate = Arc::new(Mutex::new(true));
        self.gate = gate.clone();
        let observer = self.observer.clone();
        let period = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let rtt_millis = match session.stats().await {
                    Ok(stats) => stats.active_rtt_millis(),
                    Err(e) => {
                        warn!("Stats query failed: {}", e);
                        continue;
                    }
                };
                let size = sink.frame_size();
                let sample = StatsSample {
                    rtt_millis,
                    video_width: size.width,
                    video_height: size.height,
                    sampled_at: SystemTime::now(),
                };

                {
                    let running = gate.lock();
                    if !*running {
                        break;
                    }
                    observer.on_sample(sample);
                }
            }
        }));
        debug!("Stats monitor started ({:?} interval)", period);
    }

    /// Stop sampling; safe to call when not running
    pub fn stop(&mut self) {
        *self.gate.lock() = false;
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Stats monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for StatsMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
