//! Local capture contract.
//!
//! The raw device API lives outside this crate; it plugs in through
//! [`MediaSource`] and [`CaptureStream`]. The negotiator is the single owner
//! and single release point of the acquired stream. Preview consumers may
//! hold a [`LocalMedia`] clone and read or toggle it, but only the crate can
//! stop it, and only once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;
use crate::quality::TierPreset;

/// Device-layer handle for one acquired capture stream.
#[async_trait]
pub trait CaptureStream: Send + Sync {
    fn has_video(&self) -> bool;

    fn set_video_enabled(&self, enabled: bool);

    fn set_audio_enabled(&self, enabled: bool);

    /// Reconfigure resolution/frame-rate/bitrate for a quality tier.
    async fn apply_preset(&self, preset: &TierPreset) -> Result<(), MediaError>;

    /// Outbound RTP tracks for the direct session. Empty for capture layers
    /// that bind tracks elsewhere (and for test streams).
    fn rtc_tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        Vec::new()
    }

    /// Release the device. Called exactly once, via [`LocalMedia::release`].
    fn stop(&self);
}

/// Acquires capture streams; implemented by the embedding media layer.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, video: bool) -> Result<Arc<dyn CaptureStream>, MediaError>;
}

/// Shared handle to the acquired local stream.
#[derive(Clone)]
pub struct LocalMedia {
    stream: Arc<dyn CaptureStream>,
    released: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    audio_enabled: Arc<AtomicBool>,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("released", &self.released.load(Ordering::SeqCst))
            .field("video_enabled", &self.video_enabled.load(Ordering::SeqCst))
            .field("audio_enabled", &self.audio_enabled.load(Ordering::SeqCst))
            .finish()
    }
}

impl LocalMedia {
    fn new(stream: Arc<dyn CaptureStream>) -> Self {
        let video = stream.has_video();
        Self {
            stream,
            released: Arc::new(AtomicBool::new(false)),
            video_enabled: Arc::new(AtomicBool::new(video)),
            audio_enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Acquire local media, falling back to audio-only when video capture
    /// fails for a non-fatal reason.
    pub async fn acquire(
        source: &dyn MediaSource,
        video_requested: bool,
    ) -> Result<LocalMedia, MediaError> {
        if video_requested {
            match source.acquire(true).await {
                Ok(stream) => return Ok(Self::new(stream)),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        target: "matchwire::media",
                        error = %err,
                        "video capture failed, falling back to audio-only"
                    );
                }
            }
        }
        let stream = source.acquire(false).await?;
        Ok(Self::new(stream))
    }

    pub fn has_video(&self) -> bool {
        self.stream.has_video()
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    /// Flip the outbound video track. Returns the new state.
    pub fn toggle_video(&self) -> bool {
        let enabled = !self.video_enabled.load(Ordering::SeqCst);
        self.video_enabled.store(enabled, Ordering::SeqCst);
        self.stream.set_video_enabled(enabled);
        enabled
    }

    /// Flip the outbound audio track. Returns the new state.
    pub fn toggle_audio(&self) -> bool {
        let enabled = !self.audio_enabled.load(Ordering::SeqCst);
        self.audio_enabled.store(enabled, Ordering::SeqCst);
        self.stream.set_audio_enabled(enabled);
        enabled
    }

    pub async fn apply_preset(&self, preset: &TierPreset) -> Result<(), MediaError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(MediaError::Other("stream already released".into()));
        }
        self.stream.apply_preset(preset).await
    }

    pub fn rtc_tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        self.stream.rtc_tracks()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Stop the underlying device. Only the owning negotiator calls this;
    /// the guard makes a second call a no-op so every exit path can funnel
    /// through it safely.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target: "matchwire::media", "releasing local capture");
        self.stream.stop();
    }
}
