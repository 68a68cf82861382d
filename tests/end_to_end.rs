//! End-to-end flows against an in-process relay.
//!
//! The relay here implements just enough of the server contract for two real
//! clients to find each other: identity rooms over websocket, a REST queue,
//! signal forwarding and partner-drop notices. Peer links stay mocked; the
//! wire path (websocket transport, REST backend, frame codec) is the real
//! one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use matchwire::error::MediaError;
use matchwire::media::{CaptureStream, MediaSource};
use matchwire::protocol::{ClientFrame, Identity, ServerFrame};
use matchwire::quality::{QualitySample, QualityTier, TelemetrySource, TierPreset};
use matchwire::session::peer::mock::MockLinkFactory;
use matchwire::{ClientEvent, Config, MatchClient, SessionPhase};

struct QueueEntry {
    identity_id: String,
    activity: String,
}

#[derive(Default)]
struct RelayState {
    rooms: Mutex<HashMap<String, mpsc::UnboundedSender<ServerFrame>>>,
    queue: Mutex<Vec<QueueEntry>>,
    sessions: Mutex<HashMap<String, (String, String)>>,
    counter: AtomicUsize,
}

impl RelayState {
    fn notify(&self, id: &str, frame: ServerFrame) {
        if let Some(tx) = self.rooms.lock().get(id) {
            let _ = tx.send(frame);
        }
    }

    fn enqueue(&self, id: &str, activity: &str) {
        let mut q = self.queue.lock();
        if q.iter()
            .any(|e| e.identity_id == id && e.activity == activity)
        {
            drop(q);
            self.notify(
                id,
                ServerFrame::RejoinedQueue {
                    activity: activity.to_string(),
                    message: "back in line".to_string(),
                },
            );
            return;
        }
        if let Some(i) = q
            .iter()
            .position(|e| e.activity == activity && e.identity_id != id)
        {
            let other = q.remove(i);
            drop(q);
            self.create_session(id, &other.identity_id, activity);
        } else {
            q.push(QueueEntry {
                identity_id: id.to_string(),
                activity: activity.to_string(),
            });
        }
    }

    fn create_session(&self, a: &str, b: &str, activity: &str) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let session_id = format!("sess-{n}");
        self.sessions
            .lock()
            .insert(session_id.clone(), (a.to_string(), b.to_string()));
        let frame = ServerFrame::ConnectionMatched {
            session_id,
            participants: vec![Identity::new(a), Identity::new(b)],
            activity: activity.to_string(),
        };
        self.notify(a, frame.clone());
        self.notify(b, frame);
    }

    fn forward_to_partner(&self, session_id: &str, from: &str, frame: ServerFrame) {
        let partner = {
            let sessions = self.sessions.lock();
            sessions.get(session_id).map(|(a, b)| {
                if a == from {
                    b.clone()
                } else {
                    a.clone()
                }
            })
        };
        if let Some(partner) = partner {
            self.notify(&partner, frame);
        }
    }

    fn end_session(&self, session_id: &str, reason: &str) {
        if let Some((a, b)) = self.sessions.lock().remove(session_id) {
            for id in [a, b] {
                self.notify(
                    &id,
                    ServerFrame::PartnerDisconnected {
                        session_id: session_id.to_string(),
                        reason: reason.to_string(),
                    },
                );
            }
        }
    }

    fn client_gone(&self, id: &str) {
        self.rooms.lock().remove(id);
        self.queue.lock().retain(|e| e.identity_id != id);
        let affected: Vec<(String, String)> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, (a, b))| a == id || b == id)
            .map(|(sid, (a, b))| {
                let partner = if a == id { b.clone() } else { a.clone() };
                (sid.clone(), partner)
            })
            .collect();
        for (session_id, partner) in affected {
            self.notify(
                &partner,
                ServerFrame::PartnerDisconnected {
                    session_id,
                    reason: "peer left".to_string(),
                },
            );
        }
    }

    fn handle_frame(
        &self,
        frame: ClientFrame,
        tx: &mpsc::UnboundedSender<ServerFrame>,
        who: &mut Option<String>,
    ) {
        match frame {
            ClientFrame::Join { identity, .. } => {
                *who = Some(identity.id.clone());
                self.rooms.lock().insert(identity.id.clone(), tx.clone());
                let _ = tx.send(ServerFrame::JoinAck {
                    identity_id: identity.id,
                });
            }
            ClientFrame::Ping => {
                let _ = tx.send(ServerFrame::Pong);
            }
            ClientFrame::JoinQueue { activity, .. } => {
                if let Some(id) = who {
                    self.enqueue(&id.clone(), &activity);
                }
            }
            ClientFrame::LeaveQueue { activity } => {
                if let Some(id) = who {
                    self.queue
                        .lock()
                        .retain(|e| !(e.identity_id == *id && e.activity == activity));
                }
            }
            ClientFrame::SessionSignal {
                session_id,
                from,
                signal,
            } => {
                let forwarded = ServerFrame::SessionSignal {
                    session_id: session_id.clone(),
                    from: from.clone(),
                    signal,
                };
                self.forward_to_partner(&session_id, &from, forwarded);
            }
            ClientFrame::VideoStateChange {
                session_id,
                enabled,
            } => {
                if let Some(id) = who {
                    let forwarded = ServerFrame::VideoStateChange {
                        from: id.clone(),
                        enabled,
                    };
                    self.forward_to_partner(&session_id, id, forwarded);
                }
            }
        }
    }
}

async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| client_session(state, socket))
}

async fn client_session(state: Arc<RelayState>, mut socket: WebSocket) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let mut who: Option<String> = None;
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                let bytes = match msg {
                    Message::Binary(bytes) => bytes,
                    Message::Text(text) => text.into_bytes(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(frame) = serde_json::from_slice::<ClientFrame>(&bytes) else {
                    continue;
                };
                state.handle_frame(frame, &tx, &mut who);
            }
            outgoing = rx.recv() => {
                let Some(frame) = outgoing else { break };
                let text = serde_json::to_string(&frame).unwrap();
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
    if let Some(id) = who {
        state.client_gone(&id);
    }
}

#[derive(Deserialize)]
struct JoinBody {
    identity_id: String,
    activity: String,
}

#[derive(Deserialize)]
struct SessionBody {
    session_id: String,
}

async fn rest_join(
    State(state): State<Arc<RelayState>>,
    Json(body): Json<JoinBody>,
) -> Json<serde_json::Value> {
    let n = state.counter.fetch_add(1, Ordering::SeqCst);
    state.enqueue(&body.identity_id, &body.activity);
    Json(json!({ "matched": false, "ticket_id": format!("ticket-{n}") }))
}

async fn rest_disconnect(
    State(state): State<Arc<RelayState>>,
    Json(body): Json<SessionBody>,
) -> StatusCode {
    state.end_session(&body.session_id, "peer disconnected");
    StatusCode::OK
}

async fn rest_ok() -> StatusCode {
    StatusCode::OK
}

async fn rest_no_session() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_relay() -> (SocketAddr, Arc<RelayState>) {
    init_tracing();
    let state = Arc::new(RelayState::default());
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/queue/join", post(rest_join))
        .route("/queue/leave", post(rest_ok))
        .route("/sessions/disconnect", post(rest_disconnect))
        .route("/sessions/heartbeat", post(rest_ok))
        .route("/sessions/cleanup", post(rest_ok))
        .route("/sessions/current", get(rest_no_session))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

struct TestStream;

#[async_trait]
impl CaptureStream for TestStream {
    fn has_video(&self) -> bool {
        true
    }
    fn set_video_enabled(&self, _enabled: bool) {}
    fn set_audio_enabled(&self, _enabled: bool) {}
    async fn apply_preset(&self, _preset: &TierPreset) -> Result<(), MediaError> {
        Ok(())
    }
    fn stop(&self) {}
}

struct TestSource;

#[async_trait]
impl MediaSource for TestSource {
    async fn acquire(&self, _video: bool) -> Result<Arc<dyn CaptureStream>, MediaError> {
        Ok(Arc::new(TestStream))
    }
}

/// Telemetry permanently reporting a starved link.
struct StarvedTelemetry;

#[async_trait]
impl TelemetrySource for StarvedTelemetry {
    async fn sample(&self) -> Option<QualitySample> {
        Some(QualitySample {
            bitrate_kbps: 120,
            frame_rate: 4,
            packet_loss: 0.3,
            timestamp: std::time::SystemTime::now(),
        })
    }
}

fn relay_config(addr: SocketAddr) -> Config {
    let mut config = Config::new(format!("ws://{addr}/ws"), format!("http://{addr}/")).unwrap();
    config.offer_jitter = (Duration::from_millis(5), Duration::from_millis(40));
    config.watchdog_interval = Duration::from_millis(10);
    config.retry_delay = Duration::from_millis(20);
    config.keepalive_interval = Duration::from_millis(500);
    config.sample_interval = Duration::from_millis(30);
    config
}

async fn connect(
    name: &str,
    config: Config,
) -> (MatchClient, mpsc::UnboundedReceiver<ClientEvent>) {
    MatchClient::builder(config, Identity::new(name), "token", Arc::new(TestSource))
        .link_factory(Arc::new(MockLinkFactory::new()))
        .connect()
        .await
        .unwrap()
}

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn two_queued_identities_match_and_connect() {
    let (addr, _state) = start_relay().await;
    let (alice, mut alice_rx) = connect("alice", relay_config(addr)).await;
    let (bob, mut bob_rx) = connect("bob", relay_config(addr)).await;

    alice.enqueue("valorant", true).await.unwrap();
    bob.enqueue("valorant", true).await.unwrap();

    let matched =
        wait_for(&mut alice_rx, |e| matches!(e, ClientEvent::Matched { .. })).await;
    if let ClientEvent::Matched { session } = matched {
        assert_eq!(session.local.id, "alice");
        assert_eq!(session.remote.id, "bob");
    }
    let matched = wait_for(&mut bob_rx, |e| matches!(e, ClientEvent::Matched { .. })).await;
    if let ClientEvent::Matched { session } = matched {
        assert_eq!(session.remote.id, "alice");
    }

    wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Connected))
    })
    .await;
    wait_for(&mut bob_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Connected))
    })
    .await;
    assert_eq!(alice.session_phase(), Some(SessionPhase::Connected));
    assert_eq!(bob.session_phase(), Some(SessionPhase::Connected));
}

#[tokio::test]
async fn video_toggle_reaches_partner() {
    let (addr, _state) = start_relay().await;
    let (alice, mut alice_rx) = connect("carol", relay_config(addr)).await;
    let (bob, mut bob_rx) = connect("dave", relay_config(addr)).await;

    alice.enqueue("chess", true).await.unwrap();
    bob.enqueue("chess", true).await.unwrap();
    wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Connected))
    })
    .await;
    wait_for(&mut bob_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Connected))
    })
    .await;

    alice.toggle_video().unwrap();
    let event = wait_for(&mut bob_rx, |e| {
        matches!(e, ClientEvent::RemoteVideoState { .. })
    })
    .await;
    assert!(matches!(
        event,
        ClientEvent::RemoteVideoState { enabled: false }
    ));

    // The local side hears about its own toggle too.
    let event = wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::LocalVideoState { .. })
    })
    .await;
    assert!(matches!(
        event,
        ClientEvent::LocalVideoState { enabled: false }
    ));
}

#[tokio::test]
async fn vanished_partner_fails_session_after_bounded_recovery() {
    let (addr, _state) = start_relay().await;
    let mut config = relay_config(addr);
    config.negotiation_timeout = Duration::from_millis(50);
    config.partner_wait = Duration::from_millis(300);
    config = config.with_max_retries(2);

    let (alice, mut alice_rx) = connect("erin", config).await;
    let (bob, mut bob_rx) = connect("frank", relay_config(addr)).await;

    alice.enqueue("go", true).await.unwrap();
    bob.enqueue("go", true).await.unwrap();
    wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Connected))
    })
    .await;
    wait_for(&mut bob_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Connected))
    })
    .await;

    // Partner disappears without a disconnect call.
    drop(bob);
    drop(bob_rx);

    wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Recovering))
    })
    .await;
    wait_for(&mut alice_rx, |e| matches!(e, ClientEvent::Error { .. })).await;
    wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Failed))
    })
    .await;
    assert!(alice.current_session().is_none());
}

#[tokio::test]
async fn explicit_disconnect_notifies_partner() {
    let (addr, _state) = start_relay().await;
    let (alice, mut alice_rx) = connect("gus", relay_config(addr)).await;
    let (bob, mut bob_rx) = connect("hana", relay_config(addr)).await;

    alice.enqueue("tetris", false).await.unwrap();
    bob.enqueue("tetris", false).await.unwrap();
    wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Connected))
    })
    .await;
    wait_for(&mut bob_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Connected))
    })
    .await;

    alice.disconnect_session().await.unwrap();
    wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Closed))
    })
    .await;

    // Bob hears the drop through the relay and goes into recovery.
    wait_for(&mut bob_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Recovering))
    })
    .await;
}

#[tokio::test]
async fn starved_link_steps_quality_down_one_tier_at_a_time() {
    let (addr, _state) = start_relay().await;
    let (alice, mut alice_rx) = {
        let config = relay_config(addr);
        MatchClient::builder(config, Identity::new("ivy"), "token", Arc::new(TestSource))
            .link_factory(Arc::new(MockLinkFactory::new()))
            .telemetry(Arc::new(StarvedTelemetry))
            .connect()
            .await
            .unwrap()
    };
    let (bob, mut bob_rx) = connect("jan", relay_config(addr)).await;

    alice.enqueue("pictionary", true).await.unwrap();
    bob.enqueue("pictionary", true).await.unwrap();
    wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Connected))
    })
    .await;
    wait_for(&mut bob_rx, |e| {
        matches!(e, ClientEvent::Phase(SessionPhase::Connected))
    })
    .await;

    // High -> Medium -> Low, never skipping a tier, never below the floor.
    let first = wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::QualityChanged(_))
    })
    .await;
    assert!(matches!(
        first,
        ClientEvent::QualityChanged(QualityTier::Medium)
    ));
    let second = wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::QualityChanged(_))
    })
    .await;
    assert!(matches!(
        second,
        ClientEvent::QualityChanged(QualityTier::Low)
    ));
    assert_eq!(alice.quality_tier(), Some(QualityTier::Low));

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = alice_rx.try_recv() {
        assert!(
            !matches!(event, ClientEvent::QualityChanged(_)),
            "tier must not move below the floor"
        );
    }
}
