//! Top-level client facade.
//!
//! A [`MatchClient`] owns one relay channel, one queue membership and at most
//! one active session. Consumers drive it with method calls and observe it
//! through a single [`ClientEvent`] stream; everything concurrent stays
//! behind the facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::error::{ClientError, ErrorKind};
use crate::media::MediaSource;
use crate::protocol::{Identity, ServerFrame};
use crate::quality::{QualityController, QualityTier, TelemetrySource};
use crate::queue::{EnqueueOutcome, HttpMatchmakingBackend, MatchmakingBackend, QueueClient};
use crate::recovery::RecoverySupervisor;
use crate::session::peer::PeerLinkFactory;
use crate::session::webrtc::RtcLinkFactory;
use crate::session::{
    MatchSession, Negotiator, NegotiatorHandle, SessionEvent, SessionPhase,
};
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::transport::websocket::WebSocketConnector;
use crate::transport::TransportConnector;

/// Everything the embedder observes, in one ordered stream.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Queued { activity: String },
    RejoinedQueue { activity: String, message: String },
    Matched { session: MatchSession },
    /// The relay channel dropped; a reconnect is already scheduled.
    Disconnected { reason: String },
    Phase(SessionPhase),
    LocalMediaReady { video: bool },
    LocalVideoState { enabled: bool },
    RemoteVideoState { enabled: bool },
    QualityChanged(QualityTier),
    Error { kind: ErrorKind, message: String },
}

/// Telemetry source that never reports. Used when the embedder does not wire
/// one in; the quality tier then simply never moves.
struct NoTelemetry;

#[async_trait::async_trait]
impl TelemetrySource for NoTelemetry {
    async fn sample(&self) -> Option<crate::quality::QualitySample> {
        None
    }
}

pub struct MatchClientBuilder {
    config: Config,
    identity: Identity,
    credential: String,
    media_source: Arc<dyn MediaSource>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    link_factory: Option<Arc<dyn PeerLinkFactory>>,
    connector: Option<Arc<dyn TransportConnector>>,
    backend: Option<Arc<dyn MatchmakingBackend>>,
}

impl MatchClientBuilder {
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn link_factory(mut self, factory: Arc<dyn PeerLinkFactory>) -> Self {
        self.link_factory = Some(factory);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn MatchmakingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Dial the relay and start the client. Resolves once the identity room
    /// join is acknowledged or rejected.
    pub async fn connect(
        self,
    ) -> Result<(MatchClient, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let connector: Arc<dyn TransportConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector::new(self.config.relay_url())?),
        };
        let backend: Arc<dyn MatchmakingBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpMatchmakingBackend::new(self.config.api_url())?),
        };
        let link_factory = self
            .link_factory
            .unwrap_or_else(|| Arc::new(RtcLinkFactory::default()));
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(NoTelemetry));

        let signaling = Arc::new(
            SignalingClient::connect(
                &self.config,
                self.identity.clone(),
                self.credential,
                connector,
            )
            .await?,
        );

        // A crashed previous run can leave a server-side session behind;
        // sweep it before queueing so the identity is not seen as busy.
        if let Err(err) = backend.cleanup_current(&self.identity.id).await {
            tracing::warn!(
                target: "matchwire::client",
                error = %err,
                "startup session sweep failed"
            );
        }

        let queue = QueueClient::new(signaling.clone(), backend.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config: self.config,
            signaling,
            queue,
            backend,
            media_source: self.media_source,
            link_factory,
            telemetry,
            events_tx,
            active: Mutex::new(None),
            video_requested: AtomicBool::new(true),
        });
        let match_task = tokio::spawn(run_match_listener(inner.clone()));

        Ok((
            MatchClient {
                inner,
                match_task: Some(match_task),
            },
            events_rx,
        ))
    }
}

pub struct MatchClient {
    inner: Arc<Inner>,
    match_task: Option<tokio::task::JoinHandle<()>>,
}

impl MatchClient {
    pub fn builder(
        config: Config,
        identity: Identity,
        credential: impl Into<String>,
        media_source: Arc<dyn MediaSource>,
    ) -> MatchClientBuilder {
        MatchClientBuilder {
            config,
            identity,
            credential: credential.into(),
            media_source,
            telemetry: None,
            link_factory: None,
            connector: None,
            backend: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        self.inner.signaling.identity()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.signaling.is_connected()
    }

    /// Request pairing for an activity. The match itself arrives later as
    /// [`ClientEvent::Matched`].
    pub async fn enqueue(
        &self,
        activity: &str,
        video_requested: bool,
    ) -> Result<EnqueueOutcome, ClientError> {
        self.inner
            .video_requested
            .store(video_requested, Ordering::SeqCst);
        let outcome = self.inner.queue.enqueue(activity, video_requested).await?;
        if outcome.ticket.is_some() {
            self.inner.emit(ClientEvent::Queued {
                activity: activity.to_string(),
            });
        }
        Ok(outcome)
    }

    pub async fn leave_queue(&self) -> Result<(), ClientError> {
        self.inner.queue.leave().await?;
        Ok(())
    }

    /// End the active session: tear the negotiation down and tell the server
    /// so the partner is notified promptly.
    pub async fn disconnect_session(&self) -> Result<(), ClientError> {
        let Some(active) = self.inner.active.lock().take() else {
            return Err(ClientError::NoSession);
        };
        active.handle.teardown();
        if let Err(err) = self
            .inner
            .backend
            .disconnect(&active.session.session_id)
            .await
        {
            tracing::warn!(
                target: "matchwire::client",
                session_id = %active.session.session_id,
                error = %err,
                "server-side disconnect failed"
            );
        }
        Ok(())
    }

    pub fn toggle_video(&self) -> Result<(), ClientError> {
        let guard = self.inner.active.lock();
        let active = guard.as_ref().ok_or(ClientError::NoSession)?;
        active.handle.toggle_video();
        Ok(())
    }

    pub fn toggle_audio(&self) -> Result<(), ClientError> {
        let guard = self.inner.active.lock();
        let active = guard.as_ref().ok_or(ClientError::NoSession)?;
        active.handle.toggle_audio();
        Ok(())
    }

    /// Tell the session machinery the consuming UI went to (or returned
    /// from) the background; heartbeat cadence adapts.
    pub fn set_backgrounded(&self, hidden: bool) {
        if let Some(active) = self.inner.active.lock().as_ref() {
            active.supervisor.set_backgrounded(hidden);
        }
    }

    pub fn current_session(&self) -> Option<MatchSession> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|a| a.session.clone())
    }

    pub fn session_phase(&self) -> Option<SessionPhase> {
        self.inner.active.lock().as_ref().map(|a| a.handle.phase())
    }

    pub fn quality_tier(&self) -> Option<QualityTier> {
        self.inner.active.lock().as_ref().map(|a| *a.tier.lock())
    }
}

impl Drop for MatchClient {
    fn drop(&mut self) {
        if let Some(task) = self.match_task.take() {
            task.abort();
        }
        if let Some(active) = self.inner.active.lock().take() {
            active.handle.teardown();
        }
    }
}

struct ActiveSession {
    session: MatchSession,
    handle: NegotiatorHandle,
    supervisor: RecoverySupervisor,
    tier: Arc<Mutex<QualityTier>>,
    // Ends on its own when the negotiator closes its event channel.
    _bridge_task: tokio::task::JoinHandle<()>,
}

struct Inner {
    config: Config,
    signaling: Arc<SignalingClient>,
    queue: QueueClient,
    backend: Arc<dyn MatchmakingBackend>,
    media_source: Arc<dyn MediaSource>,
    link_factory: Arc<dyn PeerLinkFactory>,
    telemetry: Arc<dyn TelemetrySource>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    active: Mutex<Option<ActiveSession>>,
    video_requested: AtomicBool,
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    fn start_session(self: &Arc<Self>, session: MatchSession) {
        let (session_events_tx, session_events_rx) = mpsc::unbounded_channel();
        let handle = Negotiator::spawn(
            session.clone(),
            &self.config,
            self.video_requested.load(Ordering::SeqCst),
            self.signaling.clone(),
            self.media_source.clone(),
            self.link_factory.clone(),
            session_events_tx,
        );
        let supervisor = RecoverySupervisor::spawn(
            &self.config,
            handle.clone(),
            self.signaling.clone(),
            self.backend.clone(),
        );
        let tier = Arc::new(Mutex::new(QualityTier::High));
        let bridge_task = tokio::spawn(run_session_bridge(
            self.clone(),
            handle.clone(),
            session_events_rx,
            tier.clone(),
        ));

        *self.active.lock() = Some(ActiveSession {
            session: session.clone(),
            handle,
            supervisor,
            tier,
            _bridge_task: bridge_task,
        });
        tracing::info!(
            target: "matchwire::client",
            session_id = %session.session_id,
            partner = %session.remote.id,
            activity = %session.activity,
            "matched"
        );
        self.emit(ClientEvent::Matched { session });
    }

    fn clear_active(&self) {
        *self.active.lock() = None;
    }
}

/// Watches the relay stream for lifecycle frames the active session does not
/// own: match notifications, queue re-entry, auth failure.
async fn run_match_listener(inner: Arc<Inner>) {
    let mut events = inner.signaling.subscribe();
    loop {
        match events.recv().await {
            Ok(SignalingEvent::Frame(ServerFrame::ConnectionMatched {
                session_id,
                participants,
                activity,
            })) => {
                inner.queue.clear_ticket();
                if inner.active.lock().is_some() {
                    tracing::warn!(
                        target: "matchwire::client",
                        session_id = %session_id,
                        "match notification while a session is active, ignoring"
                    );
                    continue;
                }
                let local = inner.signaling.identity().clone();
                match MatchSession::from_match(session_id, activity, local, &participants) {
                    Some(session) => inner.start_session(session),
                    None => {
                        tracing::warn!(
                            target: "matchwire::client",
                            "match notification without a distinct partner, ignoring"
                        );
                    }
                }
            }
            Ok(SignalingEvent::Frame(ServerFrame::RejoinedQueue { activity, message })) => {
                inner.emit(ClientEvent::RejoinedQueue { activity, message });
            }
            Ok(SignalingEvent::Disconnected { reason }) => {
                inner.emit(ClientEvent::Disconnected { reason });
            }
            Ok(SignalingEvent::AuthFailed { reason }) => {
                inner.emit(ClientEvent::Error {
                    kind: ErrorKind::Auth,
                    message: reason,
                });
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    target: "matchwire::client",
                    skipped,
                    "client event stream lagged"
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Forwards one session's events into the client stream and runs its quality
/// controller once capture is up.
async fn run_session_bridge(
    inner: Arc<Inner>,
    handle: NegotiatorHandle,
    mut session_events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    tier: Arc<Mutex<QualityTier>>,
) {
    let (quality_tx, mut quality_rx) = mpsc::unbounded_channel();
    let mut quality: Option<QualityController> = None;

    loop {
        tokio::select! {
            event = session_events_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::PhaseChanged(phase) => {
                        inner.emit(ClientEvent::Phase(phase));
                        if phase.is_terminal() {
                            inner.clear_active();
                            break;
                        }
                    }
                    SessionEvent::LocalMediaReady { video } => {
                        inner.emit(ClientEvent::LocalMediaReady { video });
                        if quality.is_none() {
                            let media = handle.media_watch().borrow().clone();
                            if let Some(media) = media {
                                quality = Some(QualityController::spawn(
                                    media,
                                    inner.telemetry.clone(),
                                    handle.phase_watch(),
                                    inner.config.sample_interval,
                                    *tier.lock(),
                                    quality_tx.clone(),
                                ));
                            }
                        }
                    }
                    SessionEvent::LocalVideoState { enabled } => {
                        inner.emit(ClientEvent::LocalVideoState { enabled });
                    }
                    SessionEvent::RemoteVideoState { enabled } => {
                        inner.emit(ClientEvent::RemoteVideoState { enabled });
                    }
                    SessionEvent::Terminal { kind, message } => {
                        inner.emit(ClientEvent::Error { kind, message });
                    }
                }
            }
            Some(next) = quality_rx.recv() => {
                *tier.lock() = next;
                inner.emit(ClientEvent::QualityChanged(next));
            }
        }
    }
}
