//! Per-match session negotiation.
//!
//! One [`Negotiator`] actor per [`MatchSession`] owns the descriptor and
//! candidate exchange, local capture, the glare guards and the candidate
//! buffer. Everything funnels through its single event loop, so frames for a
//! session are processed strictly in arrival order and there is no shared
//! mutable negotiation state outside the actor.

pub mod peer;
pub mod webrtc;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};

use crate::config::Config;
use crate::error::ErrorKind;
use crate::media::{LocalMedia, MediaSource};
use crate::protocol::{Candidate, ClientFrame, Identity, ServerFrame, SessionSignal};
use crate::signaling::{SignalingClient, SignalingEvent};
use peer::{PeerEvent, PeerLink, PeerLinkFactory};

/// The paired negotiation/media context between two identities.
#[derive(Debug, Clone)]
pub struct MatchSession {
    pub session_id: String,
    pub local: Identity,
    pub remote: Identity,
    pub activity: String,
}

impl MatchSession {
    /// Build a session from a match notification, resolving the partner to
    /// the participant that is not us. Returns `None` when the notification
    /// does not contain exactly one other participant.
    pub fn from_match(
        session_id: String,
        activity: String,
        local: Identity,
        participants: &[Identity],
    ) -> Option<MatchSession> {
        let remote = participants.iter().find(|p| p.id != local.id)?.clone();
        Some(MatchSession {
            session_id,
            local,
            remote,
            activity,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    New,
    Capturing,
    OfferPending,
    AwaitingAnswer,
    Answering,
    Connecting,
    Connected,
    Recovering,
    Failed,
    Closed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Failed | SessionPhase::Closed)
    }
}

/// Events the negotiator reports upward.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    LocalMediaReady { video: bool },
    LocalVideoState { enabled: bool },
    RemoteVideoState { enabled: bool },
    /// Terminal failure. Fired at most once per session.
    Terminal { kind: ErrorKind, message: String },
}

enum Command {
    Recover,
    Fail { message: String },
    Teardown,
    ToggleVideo,
    ToggleAudio,
    JitterExpired { attempt: u32 },
}

/// Cloneable control surface over a running negotiator.
#[derive(Clone)]
pub struct NegotiatorHandle {
    session: MatchSession,
    commands: mpsc::UnboundedSender<Command>,
    phase_rx: watch::Receiver<SessionPhase>,
    media_rx: watch::Receiver<Option<LocalMedia>>,
    attempts: Arc<AtomicU32>,
}

impl NegotiatorHandle {
    pub fn session(&self) -> &MatchSession {
        &self.session
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase_rx.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
        self.phase_rx.clone()
    }

    pub fn media_watch(&self) -> watch::Receiver<Option<LocalMedia>> {
        self.media_rx.clone()
    }

    /// Recovery attempts consumed so far; reset when a connection lands.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn recover(&self) {
        let _ = self.commands.send(Command::Recover);
    }

    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.commands.send(Command::Fail {
            message: message.into(),
        });
    }

    pub fn teardown(&self) {
        let _ = self.commands.send(Command::Teardown);
    }

    pub fn toggle_video(&self) {
        let _ = self.commands.send(Command::ToggleVideo);
    }

    pub fn toggle_audio(&self) {
        let _ = self.commands.send(Command::ToggleAudio);
    }
}

pub struct Negotiator;

impl Negotiator {
    pub fn spawn(
        session: MatchSession,
        config: &Config,
        video_requested: bool,
        signaling: Arc<SignalingClient>,
        media_source: Arc<dyn MediaSource>,
        link_factory: Arc<dyn PeerLinkFactory>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> NegotiatorHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::New);
        let (media_tx, media_rx) = watch::channel(None);
        let attempts = Arc::new(AtomicU32::new(0));

        let signaling_rx = signaling.subscribe();
        let actor = Actor {
            session: session.clone(),
            max_retries: config.max_retries,
            jitter: config.offer_jitter,
            video_requested,
            signaling,
            media_source,
            link_factory,
            events,
            phase_tx,
            media_tx,
            attempts: attempts.clone(),
            commands_tx: commands_tx.clone(),
            media: None,
            link: None,
            peer_tx: None,
            jitter_task: None,
            attempt_seq: 0,
            has_created_offer: false,
            has_received_offer: false,
            remote_applied: false,
            link_connected: false,
            remote_media: false,
            pending_candidates: Vec::new(),
            terminal_sent: false,
        };
        tokio::spawn(actor.run(commands_rx, signaling_rx));

        NegotiatorHandle {
            session,
            commands: commands_tx,
            phase_rx,
            media_rx,
            attempts,
        }
    }
}

struct Actor {
    session: MatchSession,
    max_retries: u32,
    jitter: (Duration, Duration),
    video_requested: bool,
    signaling: Arc<SignalingClient>,
    media_source: Arc<dyn MediaSource>,
    link_factory: Arc<dyn PeerLinkFactory>,
    events: mpsc::UnboundedSender<SessionEvent>,
    phase_tx: watch::Sender<SessionPhase>,
    media_tx: watch::Sender<Option<LocalMedia>>,
    attempts: Arc<AtomicU32>,
    commands_tx: mpsc::UnboundedSender<Command>,

    media: Option<LocalMedia>,
    link: Option<Box<dyn PeerLink>>,
    /// Kept so the per-attempt event channel stays open while selected on.
    peer_tx: Option<mpsc::UnboundedSender<PeerEvent>>,
    jitter_task: Option<tokio::task::JoinHandle<()>>,
    attempt_seq: u32,
    has_created_offer: bool,
    has_received_offer: bool,
    remote_applied: bool,
    link_connected: bool,
    remote_media: bool,
    pending_candidates: Vec<Candidate>,
    terminal_sent: bool,
}

impl Actor {
    async fn run(
        mut self,
        mut commands_rx: mpsc::UnboundedReceiver<Command>,
        mut signaling_rx: broadcast::Receiver<SignalingEvent>,
    ) {
        let (idle_tx, mut peer_rx) = mpsc::unbounded_channel::<PeerEvent>();
        // Placeholder sender keeps the idle channel open until the first
        // attempt installs a real one.
        self.peer_tx = Some(idle_tx);

        if !self.capture_media().await {
            return;
        }
        if let Some(rx) = self.start_attempt().await {
            peer_rx = rx;
        }

        loop {
            tokio::select! {
                command = commands_rx.recv() => {
                    let Some(command) = command else { break };
                    if let Some(rx) = self.handle_command(command).await {
                        peer_rx = rx;
                    }
                }
                event = signaling_rx.recv() => {
                    match event {
                        Ok(SignalingEvent::Frame(frame)) => self.handle_frame(frame).await,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                target: "matchwire::session",
                                session_id = %self.session.session_id,
                                skipped,
                                "signaling stream lagged"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.shutdown().await;
                        }
                    }
                }
                Some(event) = peer_rx.recv() => {
                    self.handle_peer_event(event).await;
                }
            }

            // Failed sessions stay alive only to answer teardown; Closed ends
            // the actor.
            if self.phase() == SessionPhase::Closed {
                break;
            }
        }
    }

    fn phase(&self) -> SessionPhase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase() == phase {
            return;
        }
        tracing::debug!(
            target: "matchwire::session",
            session_id = %self.session.session_id,
            from = ?self.phase(),
            to = ?phase,
            "phase change"
        );
        let _ = self.phase_tx.send(phase);
        let _ = self.events.send(SessionEvent::PhaseChanged(phase));
    }

    /// Acquire capture. Returns false when the session is over because of a
    /// fatal media error.
    async fn capture_media(&mut self) -> bool {
        self.set_phase(SessionPhase::Capturing);
        match LocalMedia::acquire(self.media_source.as_ref(), self.video_requested).await {
            Ok(media) => {
                // Publish the handle before announcing it: consumers react to
                // the ready event by reading the watch.
                let _ = self.media_tx.send(Some(media.clone()));
                let _ = self.events.send(SessionEvent::LocalMediaReady {
                    video: media.has_video(),
                });
                self.media = Some(media);
                true
            }
            Err(err) if err.is_fatal() => {
                self.fail_terminal(ErrorKind::Media, err.to_string()).await;
                false
            }
            Err(err) => {
                // Device busy: recoverable, the supervisor will retry and we
                // re-acquire on the next attempt.
                tracing::warn!(
                    target: "matchwire::session",
                    session_id = %self.session.session_id,
                    error = %err,
                    "capture unavailable, entering recovery"
                );
                self.set_phase(SessionPhase::Recovering);
                true
            }
        }
    }

    /// Begin one negotiation attempt: fresh guards, fresh link, glare jitter.
    async fn start_attempt(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.cancel_jitter();
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.attempt_seq = self.attempt_seq.wrapping_add(1);
        self.has_created_offer = false;
        self.has_received_offer = false;
        self.remote_applied = false;
        self.link_connected = false;
        self.remote_media = false;
        self.pending_candidates.clear();

        if self.media.is_none() && !self.capture_media().await {
            return None;
        }
        let Some(media) = self.media.clone() else {
            return None;
        };

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        match self.link_factory.create(&media, peer_tx.clone()).await {
            Ok(link) => {
                self.link = Some(link);
                self.peer_tx = Some(peer_tx);
            }
            Err(err) => {
                tracing::warn!(
                    target: "matchwire::session",
                    session_id = %self.session.session_id,
                    error = %err,
                    "peer link setup failed"
                );
                self.set_phase(SessionPhase::Recovering);
                return None;
            }
        }

        self.set_phase(SessionPhase::OfferPending);
        self.schedule_jitter();
        Some(peer_rx)
    }

    /// Randomized delay before offering, so both sides rarely offer at once.
    fn schedule_jitter(&mut self) {
        let (min, max) = self.jitter;
        let delay = if max > min {
            let spread = (max - min).as_millis() as u64;
            min + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
        } else {
            min
        };
        let commands = self.commands_tx.clone();
        let attempt = self.attempt_seq;
        self.jitter_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::JitterExpired { attempt });
        }));
    }

    fn cancel_jitter(&mut self) {
        if let Some(task) = self.jitter_task.take() {
            task.abort();
        }
    }

    async fn handle_command(
        &mut self,
        command: Command,
    ) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        match command {
            Command::Teardown => {
                self.shutdown().await;
                None
            }
            Command::Fail { message } => {
                self.fail_terminal(ErrorKind::Negotiation, message).await;
                None
            }
            Command::Recover => {
                if self.phase().is_terminal() {
                    return None;
                }
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > self.max_retries {
                    self.fail_terminal(
                        ErrorKind::Negotiation,
                        format!(
                            "connection could not be re-established after {} attempts",
                            self.max_retries
                        ),
                    )
                    .await;
                    return None;
                }
                tracing::info!(
                    target: "matchwire::session",
                    session_id = %self.session.session_id,
                    attempt,
                    "starting recovery attempt"
                );
                self.set_phase(SessionPhase::Recovering);
                self.start_attempt().await
            }
            Command::ToggleVideo => {
                if let Some(media) = &self.media {
                    let enabled = media.toggle_video();
                    let _ = self.signaling.send(ClientFrame::VideoStateChange {
                        session_id: self.session.session_id.clone(),
                        enabled,
                    });
                    let _ = self.events.send(SessionEvent::LocalVideoState { enabled });
                }
                None
            }
            Command::ToggleAudio => {
                if let Some(media) = &self.media {
                    media.toggle_audio();
                }
                None
            }
            Command::JitterExpired { attempt } => {
                if attempt == self.attempt_seq
                    && !self.has_created_offer
                    && !self.has_received_offer
                {
                    self.create_offer().await;
                }
                None
            }
        }
    }

    async fn create_offer(&mut self) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        // At most one local offer per attempt.
        self.has_created_offer = true;
        match link.create_offer().await {
            Ok(descriptor) => {
                self.send_signal(SessionSignal::Offer { descriptor });
                self.set_phase(SessionPhase::AwaitingAnswer);
            }
            Err(err) => {
                tracing::warn!(
                    target: "matchwire::session",
                    session_id = %self.session.session_id,
                    error = %err,
                    "offer creation failed"
                );
                self.set_phase(SessionPhase::Recovering);
            }
        }
    }

    fn send_signal(&self, signal: SessionSignal) {
        let frame = ClientFrame::SessionSignal {
            session_id: self.session.session_id.clone(),
            from: self.session.local.id.clone(),
            signal,
        };
        if let Err(err) = self.signaling.send(frame) {
            tracing::debug!(
                target: "matchwire::session",
                session_id = %self.session.session_id,
                error = %err,
                "failed to queue signal frame"
            );
        }
    }

    async fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::SessionSignal {
                session_id,
                from,
                signal,
            } if session_id == self.session.session_id => {
                if from != self.session.remote.id {
                    tracing::debug!(
                        target: "matchwire::session",
                        session_id = %session_id,
                        from = %from,
                        "dropping signal from unexpected sender"
                    );
                    return;
                }
                self.handle_signal(signal).await;
            }
            ServerFrame::PartnerDisconnected { session_id, reason }
                if session_id == self.session.session_id =>
            {
                tracing::info!(
                    target: "matchwire::session",
                    session_id = %session_id,
                    reason = %reason,
                    "partner disconnected, waiting for recovery"
                );
                // The session is preserved: capture stays alive and the
                // supervisor drives re-negotiation or times the wait out.
                self.link_connected = false;
                self.remote_media = false;
                if !self.phase().is_terminal() {
                    self.set_phase(SessionPhase::Recovering);
                }
            }
            ServerFrame::VideoStateChange { from, enabled }
                if from == self.session.remote.id =>
            {
                let _ = self.events.send(SessionEvent::RemoteVideoState { enabled });
            }
            _ => {}
        }
    }

    async fn handle_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Offer { descriptor } => {
                if self.remote_applied {
                    // Glare: a remote descriptor is already in for this
                    // attempt; first applied wins, the rest are dropped.
                    tracing::debug!(
                        target: "matchwire::session",
                        session_id = %self.session.session_id,
                        "dropping superseded remote offer"
                    );
                    return;
                }
                self.has_received_offer = true;
                self.cancel_jitter();
                if self.link.is_none() {
                    return;
                }
                self.set_phase(SessionPhase::Answering);
                let Some(link) = self.link.as_ref() else {
                    return;
                };
                match link.accept_offer(descriptor).await {
                    Ok(answer) => {
                        self.remote_applied = true;
                        self.send_signal(SessionSignal::Answer { descriptor: answer });
                        self.flush_candidates().await;
                        self.set_phase(SessionPhase::Connecting);
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "matchwire::session",
                            session_id = %self.session.session_id,
                            error = %err,
                            "remote offer rejected"
                        );
                        self.set_phase(SessionPhase::Recovering);
                    }
                }
            }
            SessionSignal::Answer { descriptor } => {
                if self.remote_applied {
                    tracing::debug!(
                        target: "matchwire::session",
                        session_id = %self.session.session_id,
                        "dropping duplicate remote answer"
                    );
                    return;
                }
                if !self.has_created_offer {
                    tracing::debug!(
                        target: "matchwire::session",
                        session_id = %self.session.session_id,
                        "dropping answer without local offer"
                    );
                    return;
                }
                let Some(link) = self.link.as_ref() else {
                    return;
                };
                match link.accept_answer(descriptor).await {
                    Ok(()) => {
                        self.remote_applied = true;
                        self.flush_candidates().await;
                        self.set_phase(SessionPhase::Connecting);
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "matchwire::session",
                            session_id = %self.session.session_id,
                            error = %err,
                            "remote answer rejected"
                        );
                        self.set_phase(SessionPhase::Recovering);
                    }
                }
            }
            SessionSignal::Candidate { candidate } => {
                if self.remote_applied {
                    self.apply_candidate(candidate).await;
                } else {
                    // Early candidates wait until a remote descriptor is in;
                    // arrival order is preserved for the flush.
                    self.pending_candidates.push(candidate);
                }
            }
        }
    }

    async fn apply_candidate(&mut self, candidate: Candidate) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        if let Err(err) = link.add_candidate(candidate).await {
            // Invalid or late candidates are dropped, never fatal.
            tracing::debug!(
                target: "matchwire::session",
                session_id = %self.session.session_id,
                error = %err,
                "dropping unusable candidate"
            );
        }
    }

    async fn flush_candidates(&mut self) {
        let buffered = std::mem::take(&mut self.pending_candidates);
        if buffered.is_empty() {
            return;
        }
        tracing::debug!(
            target: "matchwire::session",
            session_id = %self.session.session_id,
            count = buffered.len(),
            "flushing buffered candidates"
        );
        for candidate in buffered {
            self.apply_candidate(candidate).await;
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send_signal(SessionSignal::Candidate { candidate });
            }
            PeerEvent::Connected => {
                self.link_connected = true;
                self.maybe_connected();
            }
            PeerEvent::RemoteMedia => {
                self.remote_media = true;
                self.maybe_connected();
            }
            PeerEvent::Disconnected => {
                self.link_connected = false;
                if !self.phase().is_terminal() {
                    self.set_phase(SessionPhase::Recovering);
                }
            }
            PeerEvent::Failed(reason) => {
                tracing::warn!(
                    target: "matchwire::session",
                    session_id = %self.session.session_id,
                    reason = %reason,
                    "peer link failed"
                );
                self.link_connected = false;
                if !self.phase().is_terminal() {
                    self.set_phase(SessionPhase::Recovering);
                }
            }
        }
    }

    /// Connected requires both signals: channel up and remote media seen.
    fn maybe_connected(&mut self) {
        if !self.link_connected || !self.remote_media {
            return;
        }
        if self.phase().is_terminal() || self.phase() == SessionPhase::Connected {
            return;
        }
        self.attempts.store(0, Ordering::SeqCst);
        self.set_phase(SessionPhase::Connected);
    }

    async fn fail_terminal(&mut self, kind: ErrorKind, message: String) {
        if !self.terminal_sent {
            self.terminal_sent = true;
            let _ = self.events.send(SessionEvent::Terminal {
                kind,
                message: message.clone(),
            });
        }
        tracing::warn!(
            target: "matchwire::session",
            session_id = %self.session.session_id,
            kind = %kind,
            message = %message,
            "session failed"
        );
        self.cleanup().await;
        self.set_phase(SessionPhase::Failed);
    }

    async fn shutdown(&mut self) {
        self.cleanup().await;
        self.set_phase(SessionPhase::Closed);
    }

    /// Single cleanup funnel: every exit path cancels timers, closes the
    /// link and releases capture exactly once.
    async fn cleanup(&mut self) {
        self.cancel_jitter();
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.peer_tx = None;
        if let Some(media) = self.media.take() {
            media.release();
        }
        let _ = self.media_tx.send(None);
    }
}
