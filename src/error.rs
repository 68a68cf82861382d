use thiserror::Error;

/// Failure to establish or keep the relay channel.
///
/// Auth rejections are terminal; everything else is considered transient and
/// is retried with a fixed backoff until the caller tears the client down.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay rejected credential: {0}")]
    AuthRejected(String),
    #[error("websocket error: {0}")]
    Socket(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    /// Auth rejections must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::AuthRejected(_))
    }
}

/// Matchmaking service rejected or failed a queue operation.
///
/// Surfaced to the caller as-is; the crate never retries queue operations on
/// its own.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("matchmaking request failed: {0}")]
    Request(String),
    #[error("matchmaking server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("invalid matchmaking response: {0}")]
    InvalidResponse(String),
    #[error("not connected to relay")]
    NotConnected,
}

/// Descriptor or candidate handling failed for one negotiation attempt.
///
/// Individually non-fatal; the recovery supervisor retries the attempt up to
/// the configured bound.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("failed to apply {kind} descriptor: {reason}")]
    Descriptor { kind: &'static str, reason: String },
    #[error("failed to apply candidate: {0}")]
    Candidate(String),
    #[error("peer link setup failed: {0}")]
    LinkSetup(String),
    #[error("session already closed")]
    Closed,
}

/// Local capture acquisition failure.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Fatal: the user must grant access before anything can work.
    #[error("media permission denied: grant camera/microphone access and retry")]
    PermissionDenied,
    /// Retryable: another application holds the device.
    #[error("capture device busy: close other applications using it")]
    DeviceBusy,
    #[error("no capture device available")]
    NoDevice,
    #[error("capture failure: {0}")]
    Other(String),
}

impl MediaError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, MediaError::PermissionDenied | MediaError::NoDevice)
    }
}

/// Any failure surfaced by the top-level client API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("no active session")]
    NoSession,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Transport(TransportError::AuthRejected(_)) => ErrorKind::Auth,
            ClientError::Transport(_) => ErrorKind::Transport,
            ClientError::Queue(_) => ErrorKind::Queue,
            ClientError::Negotiation(_) | ClientError::NoSession => ErrorKind::Negotiation,
            ClientError::Media(_) => ErrorKind::Media,
        }
    }
}

/// Error kinds reported upward through [`crate::client::ClientEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Transport,
    Negotiation,
    Media,
    Queue,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Transport => "transport",
            ErrorKind::Negotiation => "negotiation",
            ErrorKind::Media => "media",
            ErrorKind::Queue => "queue",
        };
        f.write_str(name)
    }
}
