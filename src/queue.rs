//! Matchmaking queue client.
//!
//! Enqueue/leave go over REST; the match notification arrives on the relay
//! channel. The client re-asserts queue membership after a reconnect instead
//! of enqueueing again, so one identity never holds two tickets for the same
//! activity.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::QueueError;
use crate::protocol::ClientFrame;
use crate::signaling::{SignalingClient, SignalingEvent};

/// A pending matchmaking request awaiting pairing.
#[derive(Debug, Clone)]
pub struct QueueTicket {
    pub id: String,
    pub identity_id: String,
    pub activity: String,
    pub video_requested: bool,
    pub created_at: SystemTime,
}

/// Immediate reply to an enqueue call. A later `connection_matched` frame may
/// supersede a queued state at any time.
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub matched: bool,
    pub ticket: Option<QueueTicket>,
}

/// Server-side view of an existing session, from `current_session`.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentSession {
    pub session_id: String,
    pub activity: String,
}

/// Request/response operations consumed from the matchmaking service.
///
/// Transport-independent so tests inject a scripted backend; production uses
/// [`HttpMatchmakingBackend`].
#[async_trait]
pub trait MatchmakingBackend: Send + Sync {
    async fn enqueue(
        &self,
        identity_id: &str,
        activity: &str,
        video_requested: bool,
    ) -> Result<EnqueueReply, QueueError>;

    async fn leave_queue(&self, ticket_id: &str) -> Result<(), QueueError>;

    async fn disconnect(&self, session_id: &str) -> Result<(), QueueError>;

    /// Liveness ping keeping the server-side session from being reaped.
    async fn heartbeat(&self, session_id: &str) -> Result<(), QueueError>;

    async fn current_session(&self, identity_id: &str)
        -> Result<Option<CurrentSession>, QueueError>;

    async fn cleanup_current(&self, identity_id: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueReply {
    pub matched: bool,
    #[serde(default)]
    pub ticket_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnqueueRequest<'a> {
    identity_id: &'a str,
    activity: &'a str,
    video_requested: bool,
}

#[derive(Debug, Serialize)]
struct TicketRequest<'a> {
    ticket_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct IdentityRequest<'a> {
    identity_id: &'a str,
}

/// reqwest-backed matchmaking backend.
pub struct HttpMatchmakingBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpMatchmakingBackend {
    pub fn new(base_url: &Url) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|err| QueueError::Request(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, QueueError> {
        self.base_url
            .join(path)
            .map_err(|err| QueueError::Request(format!("bad endpoint {path}: {err}")))
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<(), QueueError> {
        let url = self.endpoint(path)?;
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| QueueError::Request(err.to_string()))?;
        check_status(&response)?;
        Ok(())
    }
}

fn check_status(response: &reqwest::Response) -> Result<(), QueueError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(QueueError::Server {
        status: status.as_u16(),
        message: status
            .canonical_reason()
            .unwrap_or("request rejected")
            .to_string(),
    })
}

#[async_trait]
impl MatchmakingBackend for HttpMatchmakingBackend {
    async fn enqueue(
        &self,
        identity_id: &str,
        activity: &str,
        video_requested: bool,
    ) -> Result<EnqueueReply, QueueError> {
        let url = self.endpoint("queue/join")?;
        let response = self
            .client
            .post(url)
            .json(&EnqueueRequest {
                identity_id,
                activity,
                video_requested,
            })
            .send()
            .await
            .map_err(|err| QueueError::Request(err.to_string()))?;
        check_status(&response)?;
        response
            .json::<EnqueueReply>()
            .await
            .map_err(|err| QueueError::InvalidResponse(err.to_string()))
    }

    async fn leave_queue(&self, ticket_id: &str) -> Result<(), QueueError> {
        self.post_json("queue/leave", &TicketRequest { ticket_id })
            .await
    }

    async fn disconnect(&self, session_id: &str) -> Result<(), QueueError> {
        self.post_json("sessions/disconnect", &SessionRequest { session_id })
            .await
    }

    async fn heartbeat(&self, session_id: &str) -> Result<(), QueueError> {
        self.post_json("sessions/heartbeat", &SessionRequest { session_id })
            .await
    }

    async fn current_session(
        &self,
        identity_id: &str,
    ) -> Result<Option<CurrentSession>, QueueError> {
        let mut url = self.endpoint("sessions/current")?;
        url.query_pairs_mut().append_pair("identity_id", identity_id);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| QueueError::Request(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(&response)?;
        response
            .json::<Option<CurrentSession>>()
            .await
            .map_err(|err| QueueError::InvalidResponse(err.to_string()))
    }

    async fn cleanup_current(&self, identity_id: &str) -> Result<(), QueueError> {
        self.post_json("sessions/cleanup", &IdentityRequest { identity_id })
            .await
    }
}

pub struct QueueClient {
    signaling: Arc<SignalingClient>,
    backend: Arc<dyn MatchmakingBackend>,
    ticket: Arc<Mutex<Option<QueueTicket>>>,
    rejoin_task: Option<tokio::task::JoinHandle<()>>,
}

impl QueueClient {
    pub fn new(signaling: Arc<SignalingClient>, backend: Arc<dyn MatchmakingBackend>) -> Self {
        let ticket = Arc::new(Mutex::new(None::<QueueTicket>));

        // Re-assert membership after every reconnect while a ticket is
        // outstanding. The relay answers with `rejoined_queue`; no new ticket
        // is minted on this path.
        let mut events = signaling.subscribe();
        let ticket_for_task = ticket.clone();
        let signaling_for_task = signaling.clone();
        let rejoin_task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SignalingEvent::Connected) => {
                        let pending = ticket_for_task.lock().clone();
                        if let Some(ticket) = pending {
                            tracing::info!(
                                target: "matchwire::queue",
                                activity = %ticket.activity,
                                "re-asserting queue membership after reconnect"
                            );
                            let _ = signaling_for_task.send(ClientFrame::JoinQueue {
                                activity: ticket.activity.clone(),
                                video_requested: ticket.video_requested,
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: "matchwire::queue",
                            skipped,
                            "event stream lagged"
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            signaling,
            backend,
            ticket,
            rejoin_task: Some(rejoin_task),
        }
    }

    /// Request pairing for an activity.
    ///
    /// Calling again for the same activity while queued is a no-op returning
    /// the existing ticket; a different activity leaves the old queue first
    /// (tickets are never shared across activities).
    pub async fn enqueue(
        &self,
        activity: &str,
        video_requested: bool,
    ) -> Result<EnqueueOutcome, QueueError> {
        if !self.signaling.is_connected() {
            return Err(QueueError::NotConnected);
        }

        let existing = self.ticket.lock().clone();
        if let Some(ticket) = existing {
            if ticket.activity == activity {
                return Ok(EnqueueOutcome {
                    matched: false,
                    ticket: Some(ticket),
                });
            }
            self.leave().await?;
        }

        let identity_id = self.signaling.identity().id.clone();
        let reply = self
            .backend
            .enqueue(&identity_id, activity, video_requested)
            .await?;

        if reply.matched {
            tracing::info!(target: "matchwire::queue", activity, "instant match");
            return Ok(EnqueueOutcome {
                matched: true,
                ticket: None,
            });
        }

        let ticket = QueueTicket {
            id: reply
                .ticket_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            identity_id,
            activity: activity.to_string(),
            video_requested,
            created_at: SystemTime::now(),
        };
        *self.ticket.lock() = Some(ticket.clone());
        tracing::debug!(
            target: "matchwire::queue",
            ticket = %ticket.id,
            activity,
            "queued"
        );
        Ok(EnqueueOutcome {
            matched: false,
            ticket: Some(ticket),
        })
    }

    /// Cancel the outstanding ticket. Idempotent; no ticket is a no-op.
    pub async fn leave(&self) -> Result<(), QueueError> {
        let Some(ticket) = self.ticket.lock().take() else {
            return Ok(());
        };
        self.signaling
            .send(ClientFrame::LeaveQueue {
                activity: ticket.activity.clone(),
            })
            .ok();
        self.backend.leave_queue(&ticket.id).await
    }

    /// Called when a match notification consumes the ticket.
    pub fn clear_ticket(&self) {
        *self.ticket.lock() = None;
    }

    pub fn ticket(&self) -> Option<QueueTicket> {
        self.ticket.lock().clone()
    }

    pub fn backend(&self) -> &Arc<dyn MatchmakingBackend> {
        &self.backend
    }
}

impl Drop for QueueClient {
    fn drop(&mut self) {
        if let Some(task) = self.rejoin_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::Identity;
    use crate::transport::mock::{MockConnector, MockTransport};
    use crate::transport::RawTransport;
    use crate::protocol::ServerFrame;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct ScriptedBackend {
        enqueues: AtomicUsize,
        leaves: AtomicUsize,
        matched: bool,
    }

    impl ScriptedBackend {
        fn queued() -> Self {
            Self {
                enqueues: AtomicUsize::new(0),
                leaves: AtomicUsize::new(0),
                matched: false,
            }
        }
    }

    #[async_trait]
    impl MatchmakingBackend for ScriptedBackend {
        async fn enqueue(
            &self,
            _identity_id: &str,
            _activity: &str,
            _video_requested: bool,
        ) -> Result<EnqueueReply, QueueError> {
            let n = self.enqueues.fetch_add(1, Ordering::SeqCst);
            Ok(EnqueueReply {
                matched: self.matched,
                ticket_id: Some(format!("ticket-{n}")),
            })
        }

        async fn leave_queue(&self, _ticket_id: &str) -> Result<(), QueueError> {
            self.leaves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self, _session_id: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn heartbeat(&self, _session_id: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn current_session(
            &self,
            _identity_id: &str,
        ) -> Result<Option<CurrentSession>, QueueError> {
            Ok(None)
        }

        async fn cleanup_current(&self, _identity_id: &str) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::new("127.0.0.1:9000", "127.0.0.1:9001").unwrap();
        config.reconnect_delay = std::time::Duration::from_millis(50);
        config
    }

    /// Relay stub that acks joins and forwards client frames for inspection.
    fn spawn_relay_stub(mut far: MockTransport) -> mpsc::UnboundedReceiver<ClientFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(bytes) = far.recv().await {
                let Ok(frame) = serde_json::from_slice::<ClientFrame>(&bytes) else {
                    continue;
                };
                if let ClientFrame::Join { identity, .. } = &frame {
                    let ack = ServerFrame::JoinAck {
                        identity_id: identity.id.clone(),
                    };
                    let _ = far.send(&serde_json::to_vec(&ack).unwrap()).await;
                }
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn connected_client(connector: Arc<MockConnector>) -> Arc<SignalingClient> {
        Arc::new(
            SignalingClient::connect(
                &test_config(),
                Identity::new("alice"),
                "token".into(),
                connector,
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn enqueue_stores_single_ticket() {
        let connector = Arc::new(MockConnector::new());
        let (near, far) = MockTransport::pair();
        let _relay = spawn_relay_stub(far);
        connector.push_transport(near);
        let signaling = connected_client(connector).await;

        let backend = Arc::new(ScriptedBackend::queued());
        let queue = QueueClient::new(signaling, backend.clone());

        let outcome = queue.enqueue("valorant", true).await.unwrap();
        assert!(!outcome.matched);
        let first = outcome.ticket.unwrap();

        // Same activity again: still the same ticket, no extra REST call.
        let outcome = queue.enqueue("valorant", true).await.unwrap();
        assert_eq!(outcome.ticket.unwrap().id, first.id);
        assert_eq!(backend.enqueues.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let connector = Arc::new(MockConnector::new());
        let (near, far) = MockTransport::pair();
        let _relay = spawn_relay_stub(far);
        connector.push_transport(near);
        let signaling = connected_client(connector).await;

        let backend = Arc::new(ScriptedBackend::queued());
        let queue = QueueClient::new(signaling, backend.clone());

        queue.enqueue("valorant", false).await.unwrap();
        queue.leave().await.unwrap();
        queue.leave().await.unwrap();
        queue.leave().await.unwrap();
        assert_eq!(backend.leaves.load(Ordering::SeqCst), 1);
        assert!(queue.ticket().is_none());
    }

    #[tokio::test]
    async fn reconnect_reasserts_membership_without_new_ticket() {
        let connector = Arc::new(MockConnector::new());
        let (near, far) = MockTransport::pair();
        let kill = near.kill_switch();
        let mut relay_one = spawn_relay_stub(far);
        connector.push_transport(near);
        let (near2, far2) = MockTransport::pair();
        let mut relay_two = spawn_relay_stub(far2);
        connector.push_transport(near2);

        let signaling = connected_client(connector).await;
        let backend = Arc::new(ScriptedBackend::queued());
        let queue = QueueClient::new(signaling, backend.clone());

        let ticket = queue.enqueue("valorant", true).await.unwrap().ticket.unwrap();
        assert!(matches!(relay_one.recv().await, Some(ClientFrame::Join { .. })));

        kill.kill();

        // Second connection joins the identity room, then re-asserts the queue.
        assert!(matches!(relay_two.recv().await, Some(ClientFrame::Join { .. })));
        let rejoined = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match relay_two.recv().await {
                    Some(ClientFrame::JoinQueue {
                        activity,
                        video_requested,
                    }) => break (activity, video_requested),
                    Some(_) => continue,
                    None => panic!("relay stream ended"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(rejoined.0, "valorant");
        assert!(rejoined.1);

        // Still exactly one ticket, same id, one REST enqueue total.
        assert_eq!(queue.ticket().unwrap().id, ticket.id);
        assert_eq!(backend.enqueues.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn switching_activity_leaves_old_queue_first() {
        let connector = Arc::new(MockConnector::new());
        let (near, far) = MockTransport::pair();
        let _relay = spawn_relay_stub(far);
        connector.push_transport(near);
        let signaling = connected_client(connector).await;

        let backend = Arc::new(ScriptedBackend::queued());
        let queue = QueueClient::new(signaling, backend.clone());

        queue.enqueue("valorant", true).await.unwrap();
        let outcome = queue.enqueue("chess", false).await.unwrap();
        assert_eq!(outcome.ticket.unwrap().activity, "chess");
        assert_eq!(backend.leaves.load(Ordering::SeqCst), 1);
        assert_eq!(backend.enqueues.load(Ordering::SeqCst), 2);
    }
}
