//! Matchmaking and 1:1 session client.
//!
//! Pairs an identity with a partner through a matchmaking service, then
//! negotiates a direct audio/video session over a relayed signaling channel
//! and keeps it alive through transport drops, partner churn and capture
//! hiccups.
//!
//! [`client::MatchClient`] is the entry point; everything below it
//! (signaling transport, queue client, session negotiator, quality
//! controller, recovery supervisor) runs as background tasks behind trait
//! seams the embedder can replace.

pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod quality;
pub mod queue;
pub mod recovery;
pub mod session;
pub mod signaling;
pub mod transport;

pub use client::{ClientEvent, MatchClient, MatchClientBuilder};
pub use config::Config;
pub use error::{
    ClientError, ErrorKind, MediaError, NegotiationError, QueueError, TransportError,
};
pub use media::{CaptureStream, LocalMedia, MediaSource};
pub use protocol::Identity;
pub use quality::{QualitySample, QualityTier, TelemetrySource, TierPreset};
pub use session::{MatchSession, SessionPhase};
