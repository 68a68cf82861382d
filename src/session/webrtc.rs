//! webrtc-rs backed [`PeerLink`].
//!
//! Owns one `RTCPeerConnection` per negotiation attempt and translates its
//! callbacks into [`PeerEvent`]s on the negotiator's event channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use super::peer::{PeerEvent, PeerLink, PeerLinkFactory};
use crate::error::NegotiationError;
use crate::media::LocalMedia;
use crate::protocol::{Candidate, DescriptorKind, SessionDescriptor};

fn link_err(context: &'static str) -> impl FnOnce(webrtc::Error) -> NegotiationError {
    move |err| NegotiationError::LinkSetup(format!("{context}: {err}"))
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    // Retained so the outbound tracks are not cleaned up mid-session.
    _senders: Vec<Arc<RTCRtpSender>>,
}

impl RtcPeerLink {
    async fn new(
        ice_servers: Vec<RTCIceServer>,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(link_err("register codecs"))?;
        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(link_err("register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(link_err("create peer connection"))?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => {
                        let _ = events.send(PeerEvent::LocalCandidate(Candidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }));
                    }
                    Err(err) => {
                        tracing::debug!(
                            target: "matchwire::session",
                            error = %err,
                            "skipping unencodable local candidate"
                        );
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = events.send(PeerEvent::Connected);
                    }
                    RTCPeerConnectionState::Disconnected => {
                        let _ = events.send(PeerEvent::Disconnected);
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = events.send(PeerEvent::Failed("peer connection failed".into()));
                    }
                    _ => {}
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let kind = track.kind();
            Box::pin(async move {
                tracing::debug!(
                    target: "matchwire::session",
                    kind = ?kind,
                    "remote track arrived"
                );
                let _ = events.send(PeerEvent::RemoteMedia);
            })
        }));

        let mut senders = Vec::new();
        for track in media.rtc_tracks() {
            let sender = pc
                .add_track(track)
                .await
                .map_err(link_err("add local track"))?;
            senders.push(sender);
        }

        Ok(Self {
            pc,
            _senders: senders,
        })
    }

    async fn local_sdp(&self, kind: DescriptorKind) -> Result<SessionDescriptor, NegotiationError> {
        let desc = self.pc.local_description().await.ok_or_else(|| {
            NegotiationError::Descriptor {
                kind: "local",
                reason: "missing local description".into(),
            }
        })?;
        Ok(SessionDescriptor {
            kind,
            payload: desc.sdp,
        })
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<SessionDescriptor, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| NegotiationError::Descriptor {
                kind: "offer",
                reason: err.to_string(),
            })?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|err| NegotiationError::Descriptor {
                kind: "offer",
                reason: err.to_string(),
            })?;
        self.local_sdp(DescriptorKind::Offer).await
    }

    async fn accept_offer(
        &self,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, NegotiationError> {
        let remote = RTCSessionDescription::offer(offer.payload).map_err(|err| {
            NegotiationError::Descriptor {
                kind: "offer",
                reason: err.to_string(),
            }
        })?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|err| NegotiationError::Descriptor {
                kind: "offer",
                reason: err.to_string(),
            })?;

        let answer =
            self.pc
                .create_answer(None)
                .await
                .map_err(|err| NegotiationError::Descriptor {
                    kind: "answer",
                    reason: err.to_string(),
                })?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|err| NegotiationError::Descriptor {
                kind: "answer",
                reason: err.to_string(),
            })?;
        self.local_sdp(DescriptorKind::Answer).await
    }

    async fn accept_answer(&self, answer: SessionDescriptor) -> Result<(), NegotiationError> {
        let remote = RTCSessionDescription::answer(answer.payload).map_err(|err| {
            NegotiationError::Descriptor {
                kind: "answer",
                reason: err.to_string(),
            }
        })?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|err| NegotiationError::Descriptor {
                kind: "answer",
                reason: err.to_string(),
            })
    }

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| NegotiationError::Candidate(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target: "matchwire::session",
                error = %err,
                "peer connection close failed"
            );
        }
    }
}

/// Factory producing [`RtcPeerLink`]s with a shared ICE server list.
pub struct RtcLinkFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcLinkFactory {
    pub fn new(stun_urls: Vec<String>) -> Self {
        let ice_servers = if stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_urls,
                ..Default::default()
            }]
        };
        Self { ice_servers }
    }
}

impl Default for RtcLinkFactory {
    fn default() -> Self {
        Self::new(vec!["stun:stun.l.google.com:19302".to_string()])
    }
}

#[async_trait]
impl PeerLinkFactory for RtcLinkFactory {
    async fn create(
        &self,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerLink>, NegotiationError> {
        let link = RtcPeerLink::new(self.ice_servers.clone(), media, events).await?;
        Ok(Box::new(link))
    }
}
