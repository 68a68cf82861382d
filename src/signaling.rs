//! Relay channel lifecycle.
//!
//! One [`SignalingClient`] per identity owns one live channel at a time. All
//! (re)connect attempts run on a single pump task, so concurrent callers
//! coalesce onto the in-flight attempt by construction: they wait on the same
//! status watch instead of dialing twice.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::config::Config;
use crate::error::TransportError;
use crate::protocol::{ClientFrame, Identity, ServerFrame};
use crate::transport::{RawTransport, TransportConnector};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 256;

/// Observable state of the relay channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    /// Dropped unexpectedly; a reconnect is scheduled.
    Offline,
    /// Credential rejected. Terminal, never retried.
    AuthFailed,
    /// Caller-initiated disconnect. Terminal.
    Closed,
}

/// Lifecycle and frame events emitted to subscribers.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Connected,
    Disconnected { reason: String },
    AuthFailed { reason: String },
    Frame(ServerFrame),
}

pub struct SignalingClient {
    identity: Identity,
    tx_out: mpsc::UnboundedSender<ClientFrame>,
    events: broadcast::Sender<SignalingEvent>,
    status_rx: watch::Receiver<LinkStatus>,
    shutdown_tx: watch::Sender<bool>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl SignalingClient {
    /// Dial the relay and join the identity room.
    ///
    /// Returns once the first attempt resolves: joined, credential rejected,
    /// or a transport failure. Drops after a successful join auto-reconnect;
    /// a failed first dial does not leave a client behind.
    pub async fn connect(
        config: &Config,
        identity: Identity,
        credential: String,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Self, TransportError> {
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(LinkStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(run_pump(PumpArgs {
            connector,
            identity: identity.clone(),
            credential,
            reconnect_delay: config.reconnect_delay,
            keepalive_interval: config.keepalive_interval,
            rx_out,
            events: events.clone(),
            status_tx,
            shutdown_rx,
        }));

        let mut client = Self {
            identity,
            tx_out,
            events,
            status_rx,
            shutdown_tx,
            pump: Some(pump),
        };

        match client.wait_for_outcome().await {
            LinkStatus::Connected => Ok(client),
            LinkStatus::AuthFailed => {
                client.close();
                Err(TransportError::AuthRejected("relay rejected join".into()))
            }
            _ => {
                client.close();
                Err(TransportError::Socket("initial connect failed".into()))
            }
        }
    }

    async fn wait_for_outcome(&mut self) -> LinkStatus {
        loop {
            let status = *self.status_rx.borrow();
            if status != LinkStatus::Connecting {
                return status;
            }
            if self.status_rx.changed().await.is_err() {
                return LinkStatus::Closed;
            }
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queue a frame for delivery. Frames queued while offline flush after
    /// the next successful reconnect.
    pub fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.tx_out
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Connected
    }

    /// Caller-initiated disconnect. Never auto-reconnects.
    pub fn close(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.pump.take() {
            task.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

struct PumpArgs {
    connector: Arc<dyn TransportConnector>,
    identity: Identity,
    credential: String,
    reconnect_delay: Duration,
    keepalive_interval: Duration,
    rx_out: mpsc::UnboundedReceiver<ClientFrame>,
    events: broadcast::Sender<SignalingEvent>,
    status_tx: watch::Sender<LinkStatus>,
    shutdown_rx: watch::Receiver<bool>,
}

async fn run_pump(mut args: PumpArgs) {
    // The constructor surfaces a failure of the very first attempt directly;
    // once a join has ever succeeded, drops reconnect instead.
    let mut ever_joined = false;
    loop {
        if *args.shutdown_rx.borrow() {
            let _ = args.status_tx.send(LinkStatus::Closed);
            return;
        }

        let _ = args.status_tx.send(LinkStatus::Connecting);
        let transport = match args.connector.connect().await {
            Ok(transport) => transport,
            Err(err) if err.is_fatal() => {
                tracing::warn!(target: "matchwire::signaling", error = %err, "auth rejected");
                let _ = args.events.send(SignalingEvent::AuthFailed {
                    reason: err.to_string(),
                });
                let _ = args.status_tx.send(LinkStatus::AuthFailed);
                return;
            }
            Err(err) => {
                tracing::debug!(target: "matchwire::signaling", error = %err, "connect failed");
                let _ = args.events.send(SignalingEvent::Disconnected {
                    reason: err.to_string(),
                });
                let _ = args.status_tx.send(LinkStatus::Offline);
                if !ever_joined {
                    return;
                }
                tokio::time::sleep(args.reconnect_delay).await;
                continue;
            }
        };

        match run_connected(&mut args, transport, &mut ever_joined).await {
            SessionEnd::Shutdown => {
                let _ = args.status_tx.send(LinkStatus::Closed);
                return;
            }
            SessionEnd::AuthFailed(reason) => {
                let _ = args.events.send(SignalingEvent::AuthFailed { reason });
                let _ = args.status_tx.send(LinkStatus::AuthFailed);
                return;
            }
            SessionEnd::Dropped(reason) => {
                tracing::info!(target: "matchwire::signaling", reason = %reason, "channel dropped");
                let _ = args.events.send(SignalingEvent::Disconnected { reason });
                let _ = args.status_tx.send(LinkStatus::Offline);
                if !ever_joined {
                    return;
                }
                // One scheduled reconnect per drop, fixed delay.
                tokio::time::sleep(args.reconnect_delay).await;
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    AuthFailed(String),
    Dropped(String),
}

async fn run_connected(
    args: &mut PumpArgs,
    mut transport: Box<dyn RawTransport>,
    ever_joined: &mut bool,
) -> SessionEnd {
    // Identity-room join; idempotent, re-sent on every reconnect.
    let join = ClientFrame::Join {
        identity: args.identity.clone(),
        credential: args.credential.clone(),
    };
    if send_frame(transport.as_ref(), &join).await.is_err() {
        return SessionEnd::Dropped("send failed during join".into());
    }

    // Wait for the relay's verdict before reporting connected.
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let frame = tokio::select! {
            frame = transport.recv() => frame,
            _ = tokio::time::sleep_until(deadline) => {
                return SessionEnd::Dropped("join handshake timed out".into());
            }
            _ = args.shutdown_rx.changed() => return SessionEnd::Shutdown,
        };
        let Some(bytes) = frame else {
            return SessionEnd::Dropped("channel closed during join".into());
        };
        match parse_frame(&bytes) {
            Some(ServerFrame::JoinAck { .. }) => break,
            Some(ServerFrame::JoinError { reason }) => return SessionEnd::AuthFailed(reason),
            Some(other) => {
                let _ = args.events.send(SignalingEvent::Frame(other));
            }
            None => {}
        }
    }

    *ever_joined = true;
    let _ = args.status_tx.send(LinkStatus::Connected);
    let _ = args.events.send(SignalingEvent::Connected);
    tracing::info!(
        target: "matchwire::signaling",
        identity = %args.identity.id,
        "joined relay"
    );

    let mut keepalive = tokio::time::interval(args.keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // first tick completes immediately
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = args.shutdown_rx.changed() => {
                if *args.shutdown_rx.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
            Some(frame) = args.rx_out.recv() => {
                if send_frame(transport.as_ref(), &frame).await.is_err() {
                    return SessionEnd::Dropped("send failed".into());
                }
            }
            incoming = transport.recv() => {
                let Some(bytes) = incoming else {
                    return SessionEnd::Dropped("channel closed".into());
                };
                match parse_frame(&bytes) {
                    Some(ServerFrame::Pong) => last_pong = Instant::now(),
                    Some(ServerFrame::JoinError { reason }) => {
                        return SessionEnd::AuthFailed(reason);
                    }
                    Some(frame) => {
                        let _ = args.events.send(SignalingEvent::Frame(frame));
                    }
                    None => {
                        tracing::debug!(
                            target: "matchwire::signaling",
                            len = bytes.len(),
                            "dropping malformed frame"
                        );
                    }
                }
            }
            _ = keepalive.tick() => {
                if last_pong.elapsed() > args.keepalive_interval * 3 {
                    return SessionEnd::Dropped("keep-alive timed out".into());
                }
                if send_frame(transport.as_ref(), &ClientFrame::Ping).await.is_err() {
                    return SessionEnd::Dropped("keep-alive send failed".into());
                }
            }
        }
    }
}

async fn send_frame(
    transport: &dyn RawTransport,
    frame: &ClientFrame,
) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(frame)
        .map_err(|err| TransportError::Socket(format!("encode: {err}")))?;
    transport.send(&bytes).await
}

fn parse_frame(bytes: &[u8]) -> Option<ServerFrame> {
    serde_json::from_slice(bytes).ok()
}
