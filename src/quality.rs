//! Adaptive quality control.
//!
//! Samples session telemetry on a fixed cadence while the session is
//! connected and moves the capture profile through discrete tiers, one step
//! at a time. A single in-flight adjustment guard drops samples that arrive
//! mid-adjustment so the tier never flaps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::media::LocalMedia;
use crate::session::SessionPhase;

/// One telemetry reading. Ephemeral; produced while connected.
#[derive(Debug, Clone)]
pub struct QualitySample {
    pub bitrate_kbps: u32,
    pub frame_rate: u32,
    pub packet_loss: f32,
    pub timestamp: SystemTime,
}

/// Where telemetry comes from. The embedder wires this to its media stack;
/// tests script it.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Current reading, or `None` when no data is available yet.
    async fn sample(&self) -> Option<QualitySample>;
}

/// Discrete preset bundling resolution, frame rate and bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPreset {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityTier {
    Low,
    Medium,
    High,
    Ultra,
}

const DOWNGRADE_BITRATE_KBPS: u32 = 500;
const DOWNGRADE_FPS: u32 = 10;
const UPGRADE_BITRATE_KBPS: u32 = 2000;
const UPGRADE_FPS: u32 = 25;

impl QualityTier {
    pub fn preset(self) -> TierPreset {
        match self {
            QualityTier::Low => TierPreset {
                width: 640,
                height: 360,
                frame_rate: 15,
                bitrate_kbps: 400,
            },
            QualityTier::Medium => TierPreset {
                width: 960,
                height: 540,
                frame_rate: 24,
                bitrate_kbps: 1000,
            },
            QualityTier::High => TierPreset {
                width: 1280,
                height: 720,
                frame_rate: 30,
                bitrate_kbps: 2500,
            },
            QualityTier::Ultra => TierPreset {
                width: 1920,
                height: 1080,
                frame_rate: 30,
                bitrate_kbps: 4500,
            },
        }
    }

    pub fn step_down(self) -> Option<QualityTier> {
        match self {
            QualityTier::Low => None,
            QualityTier::Medium => Some(QualityTier::Low),
            QualityTier::High => Some(QualityTier::Medium),
            QualityTier::Ultra => Some(QualityTier::High),
        }
    }

    pub fn step_up(self) -> Option<QualityTier> {
        match self {
            QualityTier::Low => Some(QualityTier::Medium),
            QualityTier::Medium => Some(QualityTier::High),
            QualityTier::High => Some(QualityTier::Ultra),
            QualityTier::Ultra => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
            QualityTier::Ultra => "ultra",
        }
    }
}

/// One-step tier decision for a sample. Pure so the thresholds stay testable.
pub fn evaluate_transition(current: QualityTier, sample: &QualitySample) -> Option<QualityTier> {
    if sample.bitrate_kbps < DOWNGRADE_BITRATE_KBPS || sample.frame_rate < DOWNGRADE_FPS {
        return current.step_down();
    }
    if sample.bitrate_kbps > UPGRADE_BITRATE_KBPS && sample.frame_rate > UPGRADE_FPS {
        return current.step_up();
    }
    None
}

pub struct QualityController {
    tier_rx: watch::Receiver<QualityTier>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl QualityController {
    /// Start sampling. The controller only acts while the session phase is
    /// `Connected`; it goes quiet in every other phase.
    pub fn spawn(
        media: LocalMedia,
        source: Arc<dyn TelemetrySource>,
        phase_rx: watch::Receiver<SessionPhase>,
        sample_interval: Duration,
        initial_tier: QualityTier,
        changes: mpsc::UnboundedSender<QualityTier>,
    ) -> Self {
        let (tier_tx, tier_rx) = watch::channel(initial_tier);
        let task = tokio::spawn(run_sampler(
            media,
            source,
            phase_rx,
            sample_interval,
            tier_tx,
            changes,
        ));
        Self {
            tier_rx,
            task: Some(task),
        }
    }

    pub fn tier(&self) -> QualityTier {
        *self.tier_rx.borrow()
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for QualityController {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_sampler(
    media: LocalMedia,
    source: Arc<dyn TelemetrySource>,
    phase_rx: watch::Receiver<SessionPhase>,
    sample_interval: Duration,
    tier_tx: watch::Sender<QualityTier>,
    changes: mpsc::UnboundedSender<QualityTier>,
) {
    let adjusting = Arc::new(AtomicBool::new(false));
    let mut ticker = tokio::time::interval(sample_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let phase = *phase_rx.borrow();
        if matches!(phase, SessionPhase::Closed | SessionPhase::Failed) {
            return;
        }
        if phase != SessionPhase::Connected {
            continue;
        }

        let Some(sample) = source.sample().await else {
            continue;
        };

        // Mutual exclusion: a sample landing while an adjustment is running
        // is dropped, not queued.
        if adjusting.load(Ordering::SeqCst) {
            tracing::trace!(target: "matchwire::quality", "adjustment in flight, dropping sample");
            continue;
        }

        let current = *tier_tx.borrow();
        let Some(next) = evaluate_transition(current, &sample) else {
            continue;
        };

        adjusting.store(true, Ordering::SeqCst);
        let media = media.clone();
        let adjusting_flag = adjusting.clone();
        let tier_tx = tier_tx.clone();
        let changes = changes.clone();
        tokio::spawn(async move {
            match media.apply_preset(&next.preset()).await {
                Ok(()) => {
                    tracing::info!(
                        target: "matchwire::quality",
                        from = current.as_str(),
                        to = next.as_str(),
                        bitrate_kbps = sample.bitrate_kbps,
                        frame_rate = sample.frame_rate,
                        "tier adjusted"
                    );
                    let _ = tier_tx.send(next);
                    let _ = changes.send(next);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "matchwire::quality",
                        error = %err,
                        "tier adjustment failed, keeping current preset"
                    );
                }
            }
            adjusting_flag.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bitrate_kbps: u32, frame_rate: u32) -> QualitySample {
        QualitySample {
            bitrate_kbps,
            frame_rate,
            packet_loss: 0.0,
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn starved_session_steps_down_one_tier() {
        let next = evaluate_transition(QualityTier::High, &sample(300, 8));
        assert_eq!(next, Some(QualityTier::Medium));
    }

    #[test]
    fn lowest_tier_never_steps_down() {
        assert_eq!(evaluate_transition(QualityTier::Low, &sample(100, 2)), None);
    }

    #[test]
    fn healthy_session_steps_up_one_tier() {
        let next = evaluate_transition(QualityTier::Medium, &sample(2500, 30));
        assert_eq!(next, Some(QualityTier::High));
    }

    #[test]
    fn upgrade_needs_both_thresholds() {
        // Plenty of bitrate but a sluggish frame rate stays put.
        assert_eq!(
            evaluate_transition(QualityTier::Medium, &sample(2500, 20)),
            None
        );
    }

    #[test]
    fn highest_tier_never_steps_up() {
        assert_eq!(
            evaluate_transition(QualityTier::Ultra, &sample(9000, 60)),
            None
        );
    }

    #[test]
    fn middling_sample_holds_tier() {
        assert_eq!(
            evaluate_transition(QualityTier::Medium, &sample(1200, 20)),
            None
        );
    }
}
