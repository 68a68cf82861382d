//! Signaling frames exchanged with the relay.
//!
//! Closed tagged unions: anything that does not parse into these shapes is
//! rejected at the transport boundary and never reaches session logic.

use serde::{Deserialize, Serialize};

/// An identity as the relay sees it. Issued externally; opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }
}

/// Offer/answer payload for one side of a negotiation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub kind: DescriptorKind,
    /// SDP body, opaque to the relay.
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

/// Connectivity hint for the direct path between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Payload of a relayed `session_signal` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionSignal {
    Offer { descriptor: SessionDescriptor },
    Answer { descriptor: SessionDescriptor },
    Candidate { candidate: Candidate },
}

/// Frames sent from this client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Identity-room join; idempotent, re-sent on every reconnect.
    Join {
        identity: Identity,
        credential: String,
    },
    JoinQueue {
        activity: String,
        video_requested: bool,
    },
    LeaveQueue {
        activity: String,
    },
    SessionSignal {
        session_id: String,
        from: String,
        #[serde(flatten)]
        signal: SessionSignal,
    },
    VideoStateChange {
        session_id: String,
        enabled: bool,
    },
    Ping,
}

/// Frames received from the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    JoinAck {
        identity_id: String,
    },
    JoinError {
        reason: String,
    },
    ConnectionMatched {
        session_id: String,
        participants: Vec<Identity>,
        activity: String,
    },
    PartnerDisconnected {
        session_id: String,
        reason: String,
    },
    RejoinedQueue {
        activity: String,
        message: String,
    },
    SessionSignal {
        session_id: String,
        from: String,
        #[serde(flatten)]
        signal: SessionSignal,
    },
    VideoStateChange {
        from: String,
        enabled: bool,
    },
    Pong,
    Error {
        message: String,
    },
}
