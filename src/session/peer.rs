//! Seam between the negotiator and the direct media path.
//!
//! One [`PeerLink`] per negotiation attempt; recovery discards the old link
//! and asks the factory for a fresh one. Link events flow back into the
//! negotiator's single event loop, never into ad hoc callbacks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::media::LocalMedia;
use crate::protocol::{Candidate, SessionDescriptor};

/// Events a link pushes into the negotiator.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Locally gathered connectivity hint to relay to the partner.
    LocalCandidate(Candidate),
    /// The underlying channel reports connected.
    Connected,
    /// A remote media stream arrived. Connection is only declared when both
    /// this and `Connected` have been seen.
    RemoteMedia,
    Disconnected,
    Failed(String),
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create and apply the local offer. Called at most once per attempt.
    async fn create_offer(&self) -> Result<SessionDescriptor, NegotiationError>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(
        &self,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, NegotiationError>;

    /// Apply the remote answer to a previously created offer.
    async fn accept_answer(&self, answer: SessionDescriptor) -> Result<(), NegotiationError>;

    /// Apply a relayed candidate. Only valid once a remote descriptor is in.
    async fn add_candidate(&self, candidate: Candidate) -> Result<(), NegotiationError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(
        &self,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerLink>, NegotiationError>;
}

pub mod mock {
    //! Scripted peer links for tests and harnesses.

    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::protocol::DescriptorKind;

    #[derive(Default)]
    pub struct MockLinkState {
        pub offers_created: AtomicUsize,
        pub answers_created: AtomicUsize,
        pub remote_applied: AtomicUsize,
        pub candidates: Mutex<Vec<Candidate>>,
        pub closed: AtomicUsize,
    }

    pub struct MockLink {
        state: Arc<MockLinkState>,
        events: mpsc::UnboundedSender<PeerEvent>,
        auto_connect: bool,
    }

    impl MockLink {
        fn signal_connected(&self) {
            if self.auto_connect {
                let _ = self.events.send(PeerEvent::Connected);
                let _ = self.events.send(PeerEvent::RemoteMedia);
            }
        }
    }

    #[async_trait]
    impl PeerLink for MockLink {
        async fn create_offer(&self) -> Result<SessionDescriptor, NegotiationError> {
            let n = self.state.offers_created.fetch_add(1, Ordering::SeqCst);
            Ok(SessionDescriptor {
                kind: DescriptorKind::Offer,
                payload: format!("mock-offer-{n}"),
            })
        }

        async fn accept_offer(
            &self,
            _offer: SessionDescriptor,
        ) -> Result<SessionDescriptor, NegotiationError> {
            self.state.remote_applied.fetch_add(1, Ordering::SeqCst);
            let n = self.state.answers_created.fetch_add(1, Ordering::SeqCst);
            self.signal_connected();
            Ok(SessionDescriptor {
                kind: DescriptorKind::Answer,
                payload: format!("mock-answer-{n}"),
            })
        }

        async fn accept_answer(
            &self,
            _answer: SessionDescriptor,
        ) -> Result<(), NegotiationError> {
            self.state.remote_applied.fetch_add(1, Ordering::SeqCst);
            self.signal_connected();
            Ok(())
        }

        async fn add_candidate(&self, candidate: Candidate) -> Result<(), NegotiationError> {
            self.state.candidates.lock().push(candidate);
            Ok(())
        }

        async fn close(&self) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Factory producing [`MockLink`]s.
    ///
    /// `fail_first(n)` makes the first `n` create calls fail, for recovery
    /// tests. With `auto_connect` (the default) a link reports connected as
    /// soon as a remote descriptor is applied.
    pub struct MockLinkFactory {
        auto_connect: bool,
        fail_remaining: AtomicU32,
        links: Mutex<Vec<Arc<MockLinkState>>>,
    }

    impl Default for MockLinkFactory {
        fn default() -> Self {
            Self {
                auto_connect: true,
                fail_remaining: AtomicU32::new(0),
                links: Mutex::new(Vec::new()),
            }
        }
    }

    impl MockLinkFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn manual() -> Self {
            Self {
                auto_connect: false,
                ..Self::default()
            }
        }

        pub fn fail_first(self, n: u32) -> Self {
            self.fail_remaining.store(n, Ordering::SeqCst);
            self
        }

        pub fn created(&self) -> usize {
            self.links.lock().len()
        }

        pub fn link_state(&self, index: usize) -> Option<Arc<MockLinkState>> {
            self.links.lock().get(index).cloned()
        }
    }

    #[async_trait]
    impl PeerLinkFactory for MockLinkFactory {
        async fn create(
            &self,
            _media: &LocalMedia,
            events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Box<dyn PeerLink>, NegotiationError> {
            if self.fail_remaining.load(Ordering::SeqCst) > 0 {
                self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(NegotiationError::LinkSetup("scripted failure".into()));
            }
            let state = Arc::new(MockLinkState::default());
            self.links.lock().push(state.clone());
            Ok(Box::new(MockLink {
                state,
                events,
                auto_connect: self.auto_connect,
            }))
        }
    }
}
